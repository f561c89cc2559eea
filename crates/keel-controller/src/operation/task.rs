use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::chunk_pool::{ChunkPoolInput, ChunkPoolOutput, UnorderedChunkPool};
use crate::digest::DigestStore;
use crate::id::{InputCookie, NodeId, OutputCookie, TaskGroupId, TaskId};
use crate::operation::job::{JobType, UserJobSpec};
use crate::resources::{ExtendedJobResources, JobResources};

/// The per-operation-type hook values of a task. This is the closed
/// counterpart of open subclassing: every operation flavor supplies one of
/// these instead of overriding virtual methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProfile {
    pub job_type: JobType,
    pub user_job: Option<UserJobSpec>,
    /// Whether job output feeds a downstream task instead of a final
    /// output table.
    pub intermediate_output: bool,
    /// Whether the task benefits from running close to its input replicas.
    pub input_locality: bool,
    /// Overrides the operation-wide locality timeout when set.
    pub locality_timeout: Option<Duration>,
    pub cpu: f64,
    pub job_proxy_memory: i64,
    pub network: i64,
}

impl TaskProfile {
    pub fn user_job_memory(&self) -> i64 {
        self.user_job
            .as_ref()
            .map(|user_job| user_job.memory_limit)
            .unwrap_or(0)
    }
}

/// The scheduling unit: owns a chunk pool and produces a homogeneous
/// family of jobs from it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub group: TaskGroupId,
    pub profile: TaskProfile,
    /// The task consuming this task's intermediate output, if any.
    pub downstream: Option<TaskId>,
    pool: UnorderedChunkPool,
    footprint_memory: i64,
    cached_pending_job_count: i64,
    cached_total_job_count: i64,
    cached_total_needed_resources: JobResources,
    /// The heavy part of the minimum resource computation; invalidated
    /// whenever a resource check refutes it.
    cached_min_needed_resources: Option<ExtendedJobResources>,
    delayed_since: Option<DateTime<Utc>>,
    last_demand_sanity_check: Option<DateTime<Utc>>,
    completed_fired: bool,
    banned_nodes: HashSet<NodeId>,
    /// Maps the output cookie of a lost job to the input cookie its
    /// recovered output must resume.
    lost_job_cookie_map: HashMap<OutputCookie, InputCookie>,
}

impl Task {
    pub fn new(
        id: TaskId,
        name: String,
        group: TaskGroupId,
        profile: TaskProfile,
        downstream: Option<TaskId>,
        footprint_memory: i64,
    ) -> Self {
        Self {
            id,
            name,
            group,
            profile,
            downstream,
            pool: UnorderedChunkPool::new(),
            footprint_memory,
            cached_pending_job_count: 0,
            cached_total_job_count: 0,
            cached_total_needed_resources: JobResources::zero(),
            cached_min_needed_resources: None,
            delayed_since: None,
            last_demand_sanity_check: None,
            completed_fired: false,
            banned_nodes: HashSet::new(),
            lost_job_cookie_map: HashMap::new(),
        }
    }

    pub fn pool_input(&mut self) -> &mut dyn ChunkPoolInput {
        &mut self.pool
    }

    pub fn pool_output(&self) -> &dyn ChunkPoolOutput {
        &self.pool
    }

    pub fn pool_output_mut(&mut self) -> &mut dyn ChunkPoolOutput {
        &mut self.pool
    }

    pub fn pending_job_count(&self) -> i64 {
        self.pool.pending_job_count()
    }

    pub fn total_job_count(&self) -> i64 {
        self.pool.total_job_count()
    }

    pub fn pending_job_count_delta(&mut self) -> i64 {
        let new_value = self.pending_job_count();
        let delta = new_value - self.cached_pending_job_count;
        self.cached_pending_job_count = new_value;
        delta
    }

    pub fn total_job_count_delta(&mut self) -> i64 {
        let new_value = self.total_job_count();
        let delta = new_value - self.cached_total_job_count;
        self.cached_total_job_count = new_value;
        delta
    }

    pub fn total_needed_resources_delta(&mut self, digests: &DigestStore) -> JobResources {
        let old_value = self.cached_total_needed_resources;
        let new_value = self.total_needed_resources(digests);
        self.cached_total_needed_resources = new_value;
        new_value - old_value
    }

    pub fn total_needed_resources(&mut self, digests: &DigestStore) -> JobResources {
        let count = self.pending_job_count();
        // Don't compute the minimum when there are no pending jobs.
        if count == 0 {
            JobResources::zero()
        } else {
            self.min_needed_resources(digests).scaled(count)
        }
    }

    /// The calibrated lower bound checked against node limits. The heavy
    /// part is cached; the digest factors are applied fresh on every call.
    pub fn min_needed_resources(&mut self, digests: &DigestStore) -> JobResources {
        let heavy = match self.cached_min_needed_resources {
            Some(heavy) => heavy,
            None => {
                debug_assert!(self.pending_job_count() > 0);
                let heavy = self.min_needed_resources_heavy();
                self.cached_min_needed_resources = Some(heavy);
                heavy
            }
        };
        let result = self.apply_memory_reserve(digests, heavy);
        if result.user_slots > 0 && result.memory == 0 {
            warn!(
                "task {} has min needed resources with non-zero user slots and zero memory",
                self.name
            );
        }
        result
    }

    fn min_needed_resources_heavy(&self) -> ExtendedJobResources {
        ExtendedJobResources {
            cpu: self.profile.cpu,
            user_slots: 1,
            footprint_memory: self.footprint_memory,
            job_proxy_memory: self.profile.job_proxy_memory,
            user_job_memory: self.profile.user_job_memory(),
            network: self.profile.network,
        }
    }

    /// The raw resource ask for one job of this task.
    pub fn needed_resources(&self) -> ExtendedJobResources {
        self.min_needed_resources_heavy()
    }

    pub fn reset_cached_min_needed_resources(&mut self) {
        self.cached_min_needed_resources = None;
    }

    pub fn apply_memory_reserve(
        &self,
        digests: &DigestStore,
        ask: ExtendedJobResources,
    ) -> JobResources {
        let job_proxy_factor = digests.job_proxy_factor(self.profile.job_type);
        let user_job_factor = if self.profile.user_job.is_some() {
            digests.user_job_factor(self.profile.job_type)
        } else {
            debug_assert_eq!(ask.user_job_memory, 0);
            0.0
        };
        ask.apply_memory_reserve(job_proxy_factor, user_job_factor)
    }

    pub fn memory_reserve_factors(&self, digests: &DigestStore) -> (f64, Option<f64>) {
        let job_proxy = digests.job_proxy_factor(self.profile.job_type);
        let user_job = self
            .profile
            .user_job
            .as_ref()
            .map(|_| digests.user_job_factor(self.profile.job_type));
        (job_proxy, user_job)
    }

    pub fn has_input_locality(&self) -> bool {
        self.profile.input_locality
    }

    /// Nodes currently holding replicas of this task's extractable input.
    pub fn locality_nodes(&self) -> Vec<NodeId> {
        self.pool.locality_nodes()
    }

    pub fn locality(&self, node_id: NodeId) -> i64 {
        if self.has_input_locality() {
            self.pool.locality(node_id)
        } else {
            0
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_job_count() > 0
    }

    pub fn is_completed(&self) -> bool {
        self.pool.is_completed()
    }

    /// Fires the completion edge exactly once.
    pub fn check_completed(&mut self) -> bool {
        if !self.completed_fired && self.is_completed() {
            self.completed_fired = true;
            true
        } else {
            false
        }
    }

    pub fn delayed_since(&self) -> Option<DateTime<Utc>> {
        self.delayed_since
    }

    pub fn set_delayed_since(&mut self, value: DateTime<Utc>) {
        self.delayed_since = Some(value);
    }

    pub fn effective_locality_timeout(&self, default: Duration) -> Duration {
        self.profile.locality_timeout.unwrap_or(default)
    }

    pub fn ban_node(&mut self, node_id: NodeId) {
        self.banned_nodes.insert(node_id);
    }

    pub fn can_schedule_job(&self, node_id: NodeId) -> bool {
        !self.banned_nodes.contains(&node_id)
    }

    /// Rate limits fleet-wide demand sanity checks.
    pub fn should_check_demand_sanity(&mut self, now: DateTime<Utc>, period: Duration) -> bool {
        let due = match self.last_demand_sanity_check {
            None => true,
            Some(last) => {
                now.signed_duration_since(last).to_std().unwrap_or_default() >= period
            }
        };
        if due {
            self.last_demand_sanity_check = Some(now);
        }
        due
    }

    pub fn on_job_lost(&mut self, output_cookie: OutputCookie, input_cookie: InputCookie) {
        let previous = self.lost_job_cookie_map.insert(output_cookie, input_cookie);
        debug_assert!(previous.is_none());
    }

    pub fn is_restarted_cookie(&self, output_cookie: OutputCookie) -> bool {
        self.lost_job_cookie_map.contains_key(&output_cookie)
    }

    pub fn take_lost_cookie(&mut self, output_cookie: OutputCookie) -> Option<InputCookie> {
        self.lost_job_cookie_map.remove(&output_cookie)
    }
}
