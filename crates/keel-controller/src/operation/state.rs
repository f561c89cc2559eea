use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::chunk_list::ChunkListAllocator;
use crate::chunk_pool::ChunkStripe;
use crate::digest::DigestStore;
use crate::id::{
    CellTag, ChunkId, IdGenerator, InputCookie, JobId, NodeId, OperationId, TaskGroupId, TaskId,
};
use crate::operation::counter::ProgressCounter;
use crate::operation::group::TaskGroup;
use crate::operation::joblet::{CompletedJob, Joblet};
use crate::operation::spec::OperationSpec;
use crate::operation::task::Task;
use crate::resources::JobResources;

/// The operation lifecycle. Terminal states absorb further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Initializing,
    Preparing,
    Running,
    Completed,
    Failed { aborted: bool },
}

impl ControllerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ControllerState::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ControllerState::Completed | ControllerState::Failed { .. })
    }

    pub fn is_prepared(&self) -> bool {
        !matches!(
            self,
            ControllerState::Initializing | ControllerState::Preparing
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Initializing => "initializing",
            ControllerState::Preparing => "preparing",
            ControllerState::Running => "running",
            ControllerState::Completed => "completed",
            ControllerState::Failed { aborted: false } => "failed",
            ControllerState::Failed { aborted: true } => "aborted",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputChunkState {
    #[default]
    Active,
    Skipped,
    Waiting,
}

/// One stripe registered with a task's pool input. Stored in an arena so
/// that chunk descriptors can reference stripes by index instead of by
/// shared pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredStripe {
    pub task: TaskId,
    pub cookie: InputCookie,
    pub stripe: ChunkStripe,
    /// The number of currently unavailable chunks in this stripe. The
    /// pool cookie is suspended while this is positive.
    pub waiting_chunk_count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputChunkDescriptor {
    /// Indexes into the registered stripe arena.
    pub stripe_indexes: Vec<usize>,
    pub state: InputChunkState,
}

mod needed_resources_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Arc<RwLock<JobResources>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let resources = value.read().map(|guard| *guard).unwrap_or_default();
        resources.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Arc<RwLock<JobResources>>, D::Error> {
        let resources = JobResources::deserialize(deserializer)?;
        Ok(Arc::new(RwLock::new(resources)))
    }
}

/// All mutable state of one operation. Mutation is confined to the
/// operation's execution context; the needed-resources total is the one
/// field read concurrently (by the fleet-wide aggregator) and sits behind
/// its own narrow lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationState {
    pub operation_id: OperationId,
    pub spec: OperationSpec,
    pub lifecycle: ControllerState,
    pub start_time: DateTime<Utc>,
    pub tasks: HashMap<TaskId, Task>,
    pub task_order: Vec<TaskId>,
    pub groups: HashMap<TaskGroupId, TaskGroup>,
    pub group_order: Vec<TaskGroupId>,
    pub joblets: HashMap<JobId, Joblet>,
    pub job_counter: ProgressCounter,
    pub cached_pending_job_count: i64,
    #[serde(with = "needed_resources_serde")]
    cached_needed_resources: Arc<RwLock<JobResources>>,
    pub registered_stripes: Vec<RegisteredStripe>,
    pub input_chunk_map: HashMap<ChunkId, InputChunkDescriptor>,
    pub unavailable_input_chunk_count: i64,
    pub completed_jobs: HashMap<JobId, CompletedJob>,
    pub chunk_origin_map: HashMap<ChunkId, JobId>,
    pub digests: DigestStore,
    pub job_id_generator: IdGenerator<JobId>,
    pub next_job_index: u64,
    pub intermediate_cell_tag: CellTag,
    pub cell_tag_to_output_count: HashMap<CellTag, usize>,
    pub completed_row_count: i64,
    pub last_task_update: Option<DateTime<Utc>>,
    /// Fatal conditions detected on the hot path; drained by the
    /// controller after every entry point.
    #[serde(skip)]
    pub pending_failures: Vec<String>,
}

impl OperationState {
    pub fn new(operation_id: OperationId, spec: OperationSpec, digests: DigestStore) -> Self {
        let intermediate_cell_tag = spec
            .output_cell_tags
            .iter()
            .copied()
            .max()
            .unwrap_or(0)
            + 1;
        let mut cell_tag_to_output_count = HashMap::new();
        for cell_tag in &spec.output_cell_tags {
            *cell_tag_to_output_count.entry(*cell_tag).or_insert(0) += 1;
        }
        Self {
            operation_id,
            spec,
            lifecycle: ControllerState::Initializing,
            start_time: Utc::now(),
            tasks: HashMap::new(),
            task_order: Vec::new(),
            groups: HashMap::new(),
            group_order: Vec::new(),
            joblets: HashMap::new(),
            job_counter: ProgressCounter::new(),
            cached_pending_job_count: 0,
            cached_needed_resources: Arc::new(RwLock::new(JobResources::zero())),
            registered_stripes: Vec::new(),
            input_chunk_map: HashMap::new(),
            unavailable_input_chunk_count: 0,
            completed_jobs: HashMap::new(),
            chunk_origin_map: HashMap::new(),
            digests,
            job_id_generator: IdGenerator::new(),
            next_job_index: 0,
            intermediate_cell_tag,
            cell_tag_to_output_count,
            completed_row_count: 0,
            last_task_update: None,
            pending_failures: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// The operation-wide pending job count. Reported as zero while the
    /// operation is not accepting heartbeats.
    pub fn pending_job_count(&self) -> i64 {
        if !self.lifecycle.is_prepared() || !self.lifecycle.is_running() {
            return 0;
        }
        self.cached_pending_job_count
    }

    pub fn needed_resources(&self) -> JobResources {
        self.cached_needed_resources
            .read()
            .map(|guard| *guard)
            .unwrap_or_default()
    }

    /// A handle for the cross-thread aggregator; reads through it see
    /// point-in-time snapshots.
    pub fn needed_resources_handle(&self) -> Arc<RwLock<JobResources>> {
        Arc::clone(&self.cached_needed_resources)
    }

    pub fn increase_needed_resources(&self, delta: JobResources) {
        if let Ok(mut guard) = self.cached_needed_resources.write() {
            *guard += delta;
        }
    }

    pub fn next_job_index(&mut self) -> u64 {
        let index = self.next_job_index;
        self.next_job_index += 1;
        index
    }

    pub fn register_task(&mut self, task: Task) {
        self.task_order.push(task.id);
        self.tasks.insert(task.id, task);
    }

    pub fn register_group(&mut self, group: TaskGroup) {
        self.group_order.push(group.id);
        self.groups.insert(group.id, group);
    }

    pub fn register_joblet(&mut self, joblet: Joblet) {
        let previous = self.joblets.insert(joblet.job_id, joblet);
        debug_assert!(previous.is_none());
    }

    pub fn remove_joblet(&mut self, job_id: JobId) -> Option<Joblet> {
        self.joblets.remove(&job_id)
    }

    /// Registers a unit of input with a task's pool and indexes its chunks
    /// for availability tracking. Chunks with no known replicas start out
    /// waiting.
    pub fn register_input_stripe(&mut self, task_id: TaskId, stripe: ChunkStripe) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            warn!("task {task_id} not found");
            return;
        };
        let cookie = task.pool_input().add(stripe.clone());
        let index = self.registered_stripes.len();
        let mut visited = HashSet::new();
        for slice in &stripe.slices {
            let descriptor = self.input_chunk_map.entry(slice.chunk_id).or_default();
            if slice.replicas.is_empty() {
                descriptor.state = InputChunkState::Waiting;
            }
            if visited.insert(slice.chunk_id) {
                descriptor.stripe_indexes.push(index);
            }
        }
        self.registered_stripes.push(RegisteredStripe {
            task: task_id,
            cookie,
            stripe,
            waiting_chunk_count: 0,
        });
    }

    /// Suspends every stripe touching a chunk that is currently waiting.
    /// Called once after materialization; later transitions go through the
    /// chunk availability callbacks.
    pub fn suspend_unavailable_input_stripes(&mut self) {
        debug_assert_eq!(self.unavailable_input_chunk_count, 0);
        let waiting: Vec<Vec<usize>> = self
            .input_chunk_map
            .values()
            .filter(|descriptor| descriptor.state == InputChunkState::Waiting)
            .map(|descriptor| descriptor.stripe_indexes.clone())
            .collect();
        for stripe_indexes in waiting {
            self.unavailable_input_chunk_count += 1;
            for index in stripe_indexes {
                let (task_id, cookie, waiting_chunk_count) =
                    match self.registered_stripes.get(index) {
                        Some(registered) => {
                            (registered.task, registered.cookie, registered.waiting_chunk_count)
                        }
                        None => continue,
                    };
                if waiting_chunk_count == 0 {
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.pool_input().suspend(cookie);
                    }
                }
                if let Some(registered) = self.registered_stripes.get_mut(index) {
                    registered.waiting_chunk_count += 1;
                }
            }
        }
    }

    pub fn add_all_task_pending_hints(&mut self) {
        for task_id in self.task_order.clone() {
            self.add_task_pending_hint(task_id);
        }
    }

    pub fn add_task_pending_hint(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get(&task_id) else {
            warn!("task {task_id} not found");
            return;
        };
        let group_id = task.group;
        if task.pending_job_count() > 0 {
            let inserted = self
                .groups
                .get_mut(&group_id)
                .map(|group| group.non_local_tasks.insert(task_id))
                .unwrap_or(false);
            if inserted {
                debug!("task pending hint added (task: {})", task_id);
                self.move_task_to_candidates(task_id);
            }
        }
        self.update_task(task_id);
    }

    pub fn move_task_to_candidates(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let min_memory = task.min_needed_resources(&self.digests).memory;
        let group_id = task.group;
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.insert_candidate(min_memory, task_id);
            debug!(
                "task moved to candidates (task: {}, min memory: {}MiB)",
                task_id,
                min_memory / (1024 * 1024)
            );
        }
    }

    fn do_add_task_locality_hint(&mut self, task_id: TaskId, node_id: NodeId) {
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let group_id = task.group;
        if let Some(group) = self.groups.get_mut(&group_id) {
            if group.add_locality_entry(node_id, task_id) {
                trace!("task locality hint added (task: {task_id}, node: {node_id})");
            }
        }
    }

    pub fn add_task_locality_hint(&mut self, task_id: TaskId, node_id: NodeId) {
        self.do_add_task_locality_hint(task_id, node_id);
        self.update_task(task_id);
    }

    pub fn add_task_locality_hint_for_stripe(&mut self, task_id: TaskId, stripe: &ChunkStripe) {
        for slice in &stripe.slices {
            if slice.data_size <= 0 {
                continue;
            }
            for replica in &slice.replicas {
                self.do_add_task_locality_hint(task_id, *replica);
            }
        }
        self.update_task(task_id);
    }

    /// Rebuilds the per-group locality indexes from pool state, e.g. after
    /// a snapshot load.
    pub fn rebuild_locality_hints(&mut self) {
        for task_id in self.task_order.clone() {
            let nodes = match self.tasks.get(&task_id) {
                Some(task) if task.has_input_locality() => task.locality_nodes(),
                _ => continue,
            };
            for node_id in nodes {
                self.do_add_task_locality_hint(task_id, node_id);
            }
        }
    }

    /// Returns delayed tasks of every group to the candidate set. Used
    /// when the fleet composition changes enough to make earlier locality
    /// waits pointless.
    pub fn reset_task_locality_delays(&mut self) {
        debug!("task locality delays are reset");
        for group_id in self.group_order.clone() {
            let delayed: Vec<TaskId> = match self.groups.get_mut(&group_id) {
                Some(group) => {
                    let delayed = group.delayed_tasks.values().copied().collect();
                    group.delayed_tasks.clear();
                    delayed
                }
                None => continue,
            };
            for task_id in delayed {
                let pending = self
                    .tasks
                    .get(&task_id)
                    .map(|task| task.pending_job_count())
                    .unwrap_or(0);
                if pending > 0 {
                    self.move_task_to_candidates(task_id);
                }
            }
        }
    }

    /// Refreshes the operation-wide caches from one task's pool state and
    /// fires completion edges.
    pub fn update_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            warn!("task {task_id} not found");
            return;
        };
        let old_pending = self.cached_pending_job_count;
        let pending_delta = task.pending_job_count_delta();
        let total_delta = task.total_job_count_delta();
        let resources_delta = task.total_needed_resources_delta(&self.digests);
        let newly_completed = task.check_completed();
        let downstream = task.downstream;
        let name = task.name.clone();

        self.cached_pending_job_count += pending_delta;
        self.job_counter.increment_total(total_delta);
        self.increase_needed_resources(resources_delta);
        if pending_delta != 0 || total_delta != 0 {
            debug!(
                "task updated (task: {name}, pending: {} -> {}, needed resources: {})",
                old_pending,
                self.cached_pending_job_count,
                self.needed_resources()
            );
        }

        if newly_completed {
            debug!("task completed (task: {name})");
            if let Some(downstream) = downstream {
                self.finish_task_input(downstream);
            }
        }
    }

    pub fn update_all_tasks(&mut self) {
        for task_id in self.task_order.clone() {
            self.update_task(task_id);
        }
    }

    /// Periodic full refresh; digest updates shift cached resource totals
    /// without touching the pools, so the caches go stale between events.
    pub fn update_all_tasks_if_needed(&mut self, now: DateTime<Utc>, period: Duration) {
        let due = match self.last_task_update {
            None => true,
            Some(last) => now.signed_duration_since(last).to_std().unwrap_or_default() >= period,
        };
        if due {
            self.update_all_tasks();
            self.last_task_update = Some(now);
        }
    }

    /// Closes a task's pool input once its upstream producer completed.
    pub fn finish_task_input(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        debug!("task input finished (task: {})", task.name);
        task.pool_input().finish();
        self.add_task_pending_hint(task_id);
    }

    pub fn is_operation_completed(&self) -> bool {
        self.tasks.values().all(|task| task.is_completed())
    }

    /// Chunk list headroom precondition for scheduling one job.
    pub fn has_enough_chunk_lists(
        &self,
        intermediate: bool,
        allocator: &dyn ChunkListAllocator,
    ) -> bool {
        if intermediate {
            allocator.has_enough(self.intermediate_cell_tag, 1)
        } else {
            self.cell_tag_to_output_count
                .iter()
                .all(|(cell_tag, count)| allocator.has_enough(*cell_tag, *count))
        }
    }
}
