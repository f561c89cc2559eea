use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, trace};

use crate::chunk_list::ChunkListAllocator;
use crate::cluster::{ExecNodeTracker, SchedulingContext};
use crate::digest::DigestStore;
use crate::id::{CellTag, ChunkListId, TaskId};
use crate::operation::group::CandidateKey;
use crate::operation::job::{JobSpec, JobStartRequest};
use crate::operation::joblet::Joblet;
use crate::operation::options::OperationOptions;
use crate::operation::state::OperationState;
use crate::operation::task::Task;
use crate::resources::JobResources;

/// Sizes flagged as approximate by the input slicer are inflated before
/// being checked against per-job caps.
const APPROXIMATE_SIZES_BOOST_FACTOR: f64 = 1.3;

/// Why a heartbeat produced no job. Purely informational to the caller;
/// these never propagate as faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScheduleFailReason {
    OperationNotRunning,
    NoPendingJobs,
    NotEnoughResources,
    NoLocalJobs,
    TaskDelayed,
    NoCandidateTasks,
    EmptyInput,
    TaskRefusal,
    NotEnoughChunkLists,
}

impl fmt::Display for ScheduleFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleFailReason::OperationNotRunning => "operation_not_running",
            ScheduleFailReason::NoPendingJobs => "no_pending_jobs",
            ScheduleFailReason::NotEnoughResources => "not_enough_resources",
            ScheduleFailReason::NoLocalJobs => "no_local_jobs",
            ScheduleFailReason::TaskDelayed => "task_delayed",
            ScheduleFailReason::NoCandidateTasks => "no_candidate_tasks",
            ScheduleFailReason::EmptyInput => "empty_input",
            ScheduleFailReason::TaskRefusal => "task_refusal",
            ScheduleFailReason::NotEnoughChunkLists => "not_enough_chunk_lists",
        };
        write!(f, "{name}")
    }
}

/// The outcome of one heartbeat: at most one job start request, plus every
/// fail reason seen along the way and the elapsed wall time for telemetry.
#[derive(Debug, Default)]
pub struct ScheduleJobResult {
    pub start_request: Option<JobStartRequest>,
    pub failures: BTreeMap<ScheduleFailReason, u32>,
    pub duration: Duration,
}

impl ScheduleJobResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fail(&mut self, reason: ScheduleFailReason) {
        *self.failures.entry(reason).or_insert(0) += 1;
    }

    pub fn fail_count(&self, reason: ScheduleFailReason) -> u32 {
        self.failures.get(&reason).copied().unwrap_or(0)
    }
}

/// Collaborator handles the engine needs besides the operation state
/// itself. Everything here is read or mutated synchronously; the engine
/// never suspends.
pub struct SchedulerEnv<'a> {
    pub options: &'a OperationOptions,
    pub chunk_lists: &'a mut dyn ChunkListAllocator,
    pub nodes: &'a ExecNodeTracker,
}

fn check_job_limits(
    task: &mut Task,
    digests: &DigestStore,
    job_limits: &JobResources,
    node_resource_limits: &JobResources,
    env: &SchedulerEnv<'_>,
    now: DateTime<Utc>,
    failures: &mut Vec<String>,
) -> bool {
    let needed = task.min_needed_resources(digests);
    if job_limits.dominates(&needed) {
        return true;
    }
    check_resource_demand_sanity(task, node_resource_limits, needed, env, now, failures);
    false
}

/// The task is asking for more than this heartbeat offers. That is normal
/// while the node is busy; it is fatal when no node in the fleet could
/// ever satisfy the demand. The fleet-wide check is rate limited per task.
fn check_resource_demand_sanity(
    task: &mut Task,
    node_resource_limits: &JobResources,
    needed: JobResources,
    env: &SchedulerEnv<'_>,
    now: DateTime<Utc>,
    failures: &mut Vec<String>,
) {
    if node_resource_limits.dominates(&needed) {
        return;
    }
    if !task.should_check_demand_sanity(now, env.options.resource_demand_sanity_check_period) {
        return;
    }
    let descriptors = env.nodes.descriptors();
    if descriptors.len() < env.options.safe_online_node_count {
        return;
    }
    if descriptors
        .iter()
        .any(|descriptor| descriptor.resource_limits.dominates(&needed))
    {
        return;
    }
    failures.push(format!(
        "no online node can satisfy the resource demand (task: {}, needed resources: {needed})",
        task.name
    ));
}

impl OperationState {
    /// Handles one heartbeat. Strictly synchronous; returns at most one
    /// job start request per call.
    pub fn schedule_job(
        &mut self,
        env: &mut SchedulerEnv<'_>,
        ctx: &SchedulingContext,
        job_limits: JobResources,
    ) -> ScheduleJobResult {
        let timer = Instant::now();
        let mut result = ScheduleJobResult::new();
        self.do_schedule_job(env, ctx, job_limits, &mut result);
        if result.start_request.is_some() {
            self.job_counter.start(1);
        }
        result.duration = timer.elapsed();
        result
    }

    fn do_schedule_job(
        &mut self,
        env: &mut SchedulerEnv<'_>,
        ctx: &SchedulingContext,
        job_limits: JobResources,
        result: &mut ScheduleJobResult,
    ) {
        if !self.is_running() {
            trace!("operation is not running, scheduling request ignored");
            result.record_fail(ScheduleFailReason::OperationNotRunning);
        } else if self.pending_job_count() == 0 {
            trace!("no pending jobs left, scheduling request ignored");
            result.record_fail(ScheduleFailReason::NoPendingJobs);
        } else {
            self.schedule_local_job(env, ctx, job_limits, result);
            if result.start_request.is_none() {
                self.schedule_non_local_job(env, ctx, job_limits, result);
            }
        }
    }

    /// The local pass: per group, walk the node's locality bucket and pick
    /// the task with the strictly highest live locality.
    fn schedule_local_job(
        &mut self,
        env: &mut SchedulerEnv<'_>,
        ctx: &SchedulingContext,
        job_limits: JobResources,
        result: &mut ScheduleJobResult,
    ) {
        let node_id = ctx.node.id;
        let node_resource_limits = ctx.resource_limits;

        for group_id in self.group_order.clone() {
            let local_tasks: Vec<TaskId> = match self.groups.get(&group_id) {
                Some(group) => {
                    if !job_limits.dominates(&group.min_needed_resources) {
                        result.record_fail(ScheduleFailReason::NotEnoughResources);
                        continue;
                    }
                    match group.node_id_to_tasks.get(&node_id) {
                        Some(tasks) => tasks.iter().copied().collect(),
                        None => continue,
                    }
                }
                None => continue,
            };

            let mut best_locality = 0i64;
            let mut best_task: Option<TaskId> = None;
            let mut evicted: Vec<TaskId> = Vec::new();
            let mut drained: Vec<TaskId> = Vec::new();

            for task_id in local_tasks {
                let Some(task) = self.tasks.get_mut(&task_id) else {
                    continue;
                };

                // Locality hints are evicted lazily once they go stale.
                let locality = task.locality(node_id);
                if locality <= 0 {
                    evicted.push(task_id);
                    continue;
                }

                if locality <= best_locality {
                    continue;
                }

                if task.pending_job_count() == 0 {
                    drained.push(task_id);
                    continue;
                }

                if !check_job_limits(
                    task,
                    &self.digests,
                    &job_limits,
                    &node_resource_limits,
                    env,
                    ctx.now,
                    &mut self.pending_failures,
                ) {
                    continue;
                }

                best_locality = locality;
                best_task = Some(task_id);
            }

            if let Some(group) = self.groups.get_mut(&group_id) {
                for task_id in &evicted {
                    group.remove_locality_entry(node_id, *task_id);
                    trace!("task locality hint removed (task: {task_id}, node: {node_id})");
                }
            }
            for task_id in drained {
                self.update_task(task_id);
            }

            if !self.is_running() {
                result.record_fail(ScheduleFailReason::OperationNotRunning);
                return;
            }

            if let Some(task_id) = best_task {
                if let Some(task) = self.tasks.get(&task_id) {
                    debug!(
                        "attempting to schedule a local job (task: {}, node: {}, locality: {best_locality}, \
                         job limits: {job_limits}, pending data size: {}, pending job count: {})",
                        task.name,
                        ctx.node.address,
                        task.pool_output().pending_data_size(),
                        task.pending_job_count()
                    );
                }
                let intermediate = self.tasks[&task_id].profile.intermediate_output;
                if !self.has_enough_chunk_lists(intermediate, env.chunk_lists) {
                    debug!("job chunk list demand is not met");
                    result.record_fail(ScheduleFailReason::NotEnoughChunkLists);
                    return;
                }
                self.try_schedule_task_job(env, ctx, job_limits, task_id, result);
                if result.start_request.is_some() {
                    self.update_task(task_id);
                    return;
                }
            } else {
                // One of the possible reasons, hopefully the most probable.
                result.record_fail(ScheduleFailReason::NoLocalJobs);
            }
        }
    }

    /// The fair-share pass: per group, wake expired delayed tasks, then
    /// scan candidates in ascending minimum-memory order. The ordering
    /// makes the memory comparison a valid early exit.
    fn schedule_non_local_job(
        &mut self,
        env: &mut SchedulerEnv<'_>,
        ctx: &SchedulingContext,
        job_limits: JobResources,
        result: &mut ScheduleJobResult,
    ) {
        let now = ctx.now;
        let node_resource_limits = ctx.resource_limits;

        for group_id in self.group_order.clone() {
            match self.groups.get(&group_id) {
                Some(group) => {
                    if !job_limits.dominates(&group.min_needed_resources) {
                        result.record_fail(ScheduleFailReason::NotEnoughResources);
                        continue;
                    }
                }
                None => continue,
            }

            // Move tasks from delayed to candidates.
            let mut expired: Vec<TaskId> = Vec::new();
            if let Some(group) = self.groups.get_mut(&group_id) {
                while let Some((&(deadline, task_id), _)) = group.delayed_tasks.iter().next() {
                    if deadline > now {
                        break;
                    }
                    group.delayed_tasks.remove(&(deadline, task_id));
                    expired.push(task_id);
                }
            }
            for task_id in expired {
                let pending = self
                    .tasks
                    .get(&task_id)
                    .map(|task| task.pending_job_count())
                    .unwrap_or(0);
                if pending == 0 {
                    debug!("task pending hint removed (task: {task_id})");
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        group.non_local_tasks.remove(&task_id);
                    }
                    self.update_task(task_id);
                } else {
                    debug!("task delay deadline reached (task: {task_id})");
                    self.move_task_to_candidates(task_id);
                }
            }

            // Consider candidates in the order of increasing memory demand.
            let mut processed_task_count = 0;
            let mut cursor: Bound<CandidateKey> = Bound::Unbounded;
            loop {
                let next = match self.groups.get(&group_id) {
                    Some(group) => group
                        .candidate_tasks
                        .range((cursor, Bound::Unbounded))
                        .next()
                        .map(|(&key, &task_id)| (key, task_id)),
                    None => None,
                };
                let Some((key, task_id)) = next else {
                    break;
                };
                let (key_memory, _) = key;
                processed_task_count += 1;

                // Make sure the task is ready to launch jobs; remove the
                // pending hint if not.
                let pending = self
                    .tasks
                    .get(&task_id)
                    .map(|task| task.pending_job_count())
                    .unwrap_or(0);
                if pending == 0 {
                    debug!("task pending hint removed (task: {task_id})");
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        group.candidate_tasks.remove(&key);
                        group.non_local_tasks.remove(&task_id);
                    }
                    self.update_task(task_id);
                    cursor = Bound::Excluded(key);
                    continue;
                }

                // Check min memory demand for early exit.
                let min_needed = match self.tasks.get_mut(&task_id) {
                    Some(task) => task.min_needed_resources(&self.digests),
                    None => {
                        cursor = Bound::Excluded(key);
                        continue;
                    }
                };
                if min_needed.memory > job_limits.memory {
                    break;
                }

                let passes = match self.tasks.get_mut(&task_id) {
                    Some(task) => check_job_limits(
                        task,
                        &self.digests,
                        &job_limits,
                        &node_resource_limits,
                        env,
                        now,
                        &mut self.pending_failures,
                    ),
                    None => false,
                };
                if !passes {
                    result.record_fail(ScheduleFailReason::NotEnoughResources);
                    cursor = Bound::Excluded(key);
                    continue;
                }

                // A task that could run non-locally still waits out its
                // locality timeout first.
                let deadline = match self.tasks.get_mut(&task_id) {
                    Some(task) => {
                        if task.delayed_since().is_none() {
                            task.set_delayed_since(now);
                        }
                        let timeout =
                            task.effective_locality_timeout(env.options.locality_timeout);
                        task.delayed_since().unwrap_or(now)
                            + chrono::Duration::from_std(timeout).unwrap_or_default()
                    }
                    None => {
                        cursor = Bound::Excluded(key);
                        continue;
                    }
                };
                if deadline > now {
                    debug!("task delayed (task: {task_id}, deadline: {deadline})");
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        group.candidate_tasks.remove(&key);
                        group.insert_delayed(deadline, task_id);
                    }
                    result.record_fail(ScheduleFailReason::TaskDelayed);
                    cursor = Bound::Excluded(key);
                    continue;
                }

                if !self.is_running() {
                    result.record_fail(ScheduleFailReason::OperationNotRunning);
                    return;
                }

                if let Some(task) = self.tasks.get(&task_id) {
                    debug!(
                        "attempting to schedule a non-local job (task: {}, node: {}, \
                         job limits: {job_limits}, pending data size: {}, pending job count: {})",
                        task.name,
                        ctx.node.address,
                        task.pool_output().pending_data_size(),
                        task.pending_job_count()
                    );
                }
                let intermediate = self.tasks[&task_id].profile.intermediate_output;
                if !self.has_enough_chunk_lists(intermediate, env.chunk_lists) {
                    debug!("job chunk list demand is not met");
                    result.record_fail(ScheduleFailReason::NotEnoughChunkLists);
                    return;
                }

                self.try_schedule_task_job(env, ctx, job_limits, task_id, result);
                if result.start_request.is_some() {
                    self.update_task(task_id);
                    debug!("processed {processed_task_count} tasks");
                    return;
                }

                // The attempt was refused; the cached minimum may have
                // changed, so re-bucket the candidate in place.
                let new_memory = match self.tasks.get_mut(&task_id) {
                    Some(task) if task.pending_job_count() > 0 => {
                        task.min_needed_resources(&self.digests).memory
                    }
                    _ => key_memory,
                };
                if new_memory != key_memory {
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        group.candidate_tasks.remove(&key);
                        group.insert_candidate(new_memory, task_id);
                    }
                }
                cursor = Bound::Excluded(key);
            }
            if processed_task_count == 0 {
                result.record_fail(ScheduleFailReason::NoCandidateTasks);
            }
            debug!("processed {processed_task_count} tasks");
        }
    }

    /// One attempt to turn a matched task into a joblet. Ordinary misses
    /// are recorded on the result; only true invariant violations become
    /// failures.
    fn try_schedule_task_job(
        &mut self,
        env: &mut SchedulerEnv<'_>,
        ctx: &SchedulingContext,
        job_limits: JobResources,
        task_id: TaskId,
        result: &mut ScheduleJobResult,
    ) {
        let node_id = ctx.node.id;
        {
            let Some(task) = self.tasks.get(&task_id) else {
                return;
            };
            if !task.can_schedule_job(node_id) {
                result.record_fail(ScheduleFailReason::TaskRefusal);
                return;
            }
        }
        let job_index = self.next_job_index();

        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let locality_node = if task.has_input_locality() {
            Some(node_id)
        } else {
            None
        };
        let Some(output_cookie) = task.pool_output_mut().extract(locality_node) else {
            debug!("job input is empty (task: {})", task.name);
            result.record_fail(ScheduleFailReason::EmptyInput);
            return;
        };
        let stripe_list = task.pool_output().stripe_list(output_cookie).clone();

        let estimated = task.needed_resources();
        let reserved = task.apply_memory_reserve(&self.digests, estimated);

        // Check the usage against the limits. This is the last chance to
        // give up.
        if !job_limits.dominates(&reserved) {
            debug!(
                "job actual resource demand is not met (limits: {job_limits}, demand: {reserved})"
            );
            check_resource_demand_sanity(
                task,
                &ctx.resource_limits,
                reserved,
                env,
                ctx.now,
                &mut self.pending_failures,
            );
            task.pool_output_mut().aborted(output_cookie);
            // The cached minimum was too optimistic.
            task.reset_cached_min_needed_resources();
            result.record_fail(ScheduleFailReason::NotEnoughResources);
            return;
        }

        let (job_proxy_factor, user_job_factor) = task.memory_reserve_factors(&self.digests);
        let restarted = task.is_restarted_cookie(output_cookie);
        let intermediate = task.profile.intermediate_output;
        let job_type = task.profile.job_type;
        let task_name = task.name.clone();
        let user_job = task.profile.user_job.clone();

        // Stage the output chunk lists.
        let cells: Vec<CellTag> = if intermediate {
            vec![self.intermediate_cell_tag]
        } else {
            self.spec.output_cell_tags.clone()
        };
        let mut chunk_list_ids: Vec<Option<ChunkListId>> = Vec::with_capacity(cells.len());
        for cell_tag in cells {
            match env.chunk_lists.extract(cell_tag) {
                Ok(id) => chunk_list_ids.push(Some(id)),
                Err(_) => {
                    debug!("job chunk list demand is not met");
                    env.chunk_lists
                        .release(chunk_list_ids.into_iter().flatten().collect());
                    task.pool_output_mut().aborted(output_cookie);
                    result.record_fail(ScheduleFailReason::NotEnoughChunkLists);
                    return;
                }
            }
        }

        let job_id = match self.job_id_generator.next() {
            Ok(job_id) => job_id,
            Err(error) => {
                env.chunk_lists
                    .release(chunk_list_ids.into_iter().flatten().collect());
                task.pool_output_mut().aborted(output_cookie);
                self.pending_failures.push(error.to_string());
                return;
            }
        };

        let mut checked_data_size = stripe_list.total_data_size;
        if stripe_list.is_approximate {
            checked_data_size =
                (checked_data_size as f64 * APPROXIMATE_SIZES_BOOST_FACTOR) as i64;
        }
        if checked_data_size > env.options.max_data_size_per_job {
            self.pending_failures.push(format!(
                "maximum allowed data size per job violated: {checked_data_size} > {}",
                env.options.max_data_size_per_job
            ));
        }

        let spec = JobSpec {
            job_type,
            input: stripe_list.clone(),
            outputs: chunk_list_ids.iter().flatten().copied().collect(),
            user_job,
            memory_reserve: reserved.memory,
            job_proxy_memory_reserve_factor: job_proxy_factor,
            user_job_memory_reserve_factor: user_job_factor,
        };

        debug!(
            "job scheduled (job: {job_id}, operation: {}, type: {job_type}, task: {task_name}, \
             node: {}, job index: {job_index}, chunk count: {} ({} local), approximate: {}, \
             data size: {} ({} local), row count: {}, restarted: {restarted}, \
             job proxy memory reserve factor: {job_proxy_factor}, \
             user job memory reserve factor: {user_job_factor:?}, resource limits: {reserved})",
            self.operation_id,
            ctx.node.address,
            stripe_list.total_chunk_count,
            stripe_list.local_chunk_count,
            stripe_list.is_approximate,
            stripe_list.total_data_size,
            stripe_list.local_data_size,
            stripe_list.total_row_count,
        );

        let joblet = Joblet {
            job_id,
            task_id,
            job_type,
            job_index,
            node: ctx.node.clone(),
            output_cookie,
            input_stripe_list: stripe_list,
            estimated_resources: estimated,
            resource_limits: reserved,
            job_proxy_memory_reserve_factor: job_proxy_factor,
            user_job_memory_reserve_factor: user_job_factor,
            chunk_list_ids,
            restarted,
            start_time: None,
            finish_time: None,
        };
        result.start_request = Some(JobStartRequest {
            job_id,
            job_type,
            resources: reserved,
            restarted,
            spec,
        });
        self.register_joblet(joblet);
    }
}
