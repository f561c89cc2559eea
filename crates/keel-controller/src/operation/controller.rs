use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_common::config::{AppConfig, UnavailableChunkPolicy};
use log::{debug, error, info, trace, warn};

use crate::chunk_list::ChunkListAllocator;
use crate::chunk_pool::ChunkStripe;
use crate::cluster::{ExecNodeTracker, SchedulingContext};
use crate::digest::DigestStore;
use crate::error::{ControllerError, ControllerResult};
use crate::id::{ChunkId, ChunkListId, JobId, NodeId, OperationId, TaskGroupId, TaskId, TransactionId};
use crate::master::MasterClient;
use crate::operation::counter::ProgressCounter;
use crate::operation::group::TaskGroup;
use crate::operation::job::{
    AbortReason, AbortedJobSummary, CompletedJobSummary, FailedJobSummary, JobStatistics, JobType,
};
use crate::operation::joblet::{CompletedJob, Joblet};
use crate::operation::options::OperationOptions;
use crate::operation::schedule::{ScheduleJobResult, SchedulerEnv};
use crate::operation::spec::OperationSpec;
use crate::operation::state::{ControllerState, InputChunkState, OperationState};
use crate::operation::task::Task;
use crate::resources::JobResources;
use crate::snapshot;

#[derive(Debug, Clone, Copy)]
pub struct OperationTransactions {
    pub input: TransactionId,
    pub output: TransactionId,
}

#[derive(Debug, Clone)]
pub struct OperationProgress {
    pub state: ControllerState,
    pub counter: ProgressCounter,
    pub pending_job_count: i64,
    pub needed_resources: JobResources,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviveOutcome {
    FromSnapshot,
    CleanStart,
}

#[derive(Debug, Clone, Copy)]
enum ReinstallReason {
    Failed,
    Aborted,
}

/// Owns all state of one operation and drives it through its lifecycle.
/// Every method must be called from the operation's single execution
/// context; the actor wrapper enforces this in production use.
pub struct OperationController {
    options: OperationOptions,
    state: OperationState,
    chunk_lists: Box<dyn ChunkListAllocator>,
    master: Arc<dyn MasterClient>,
    nodes: Arc<ExecNodeTracker>,
    transactions: Option<OperationTransactions>,
    failure: Option<String>,
}

impl OperationController {
    pub fn new(
        operation_id: OperationId,
        spec: OperationSpec,
        config: &AppConfig,
        chunk_lists: Box<dyn ChunkListAllocator>,
        master: Arc<dyn MasterClient>,
        nodes: Arc<ExecNodeTracker>,
    ) -> Self {
        let options = OperationOptions::new(config, &spec);
        let digests = DigestStore::new(
            options.job_proxy_memory_reserve_quantile,
            options.user_job_memory_reserve_quantile,
            options.job_proxy_memory_digest_precision,
            options.user_job_memory_digest_precision,
        );
        let state = OperationState::new(operation_id, spec, digests);
        Self {
            options,
            state,
            chunk_lists,
            master,
            nodes,
            transactions: None,
            failure: None,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.state.operation_id
    }

    pub fn lifecycle(&self) -> ControllerState {
        self.state.lifecycle
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    pub fn progress(&self) -> OperationProgress {
        OperationProgress {
            state: self.state.lifecycle,
            counter: self.state.job_counter,
            pending_job_count: self.state.pending_job_count(),
            needed_resources: self.state.needed_resources(),
            failure: self.failure.clone(),
        }
    }

    /// Validates the spec and registers the memory digests. The operation
    /// stays in `Initializing` until `prepare`.
    pub fn initialize(&mut self) -> ControllerResult<()> {
        info!(
            "initializing operation (operation: {}, title: {})",
            self.state.operation_id, self.state.spec.title
        );
        self.state.spec.validate()?;
        for definition in &self.state.spec.tasks {
            self.state
                .digests
                .register_job_proxy_digest(definition.profile.job_type);
            if let Some(user_job) = &definition.profile.user_job {
                self.state.digests.register_user_job_digest(
                    definition.profile.job_type,
                    user_job.memory_reserve_factor,
                );
            }
        }
        info!("operation initialized");
        Ok(())
    }

    /// Starts the operation transactions. The only master work done by the
    /// clean-start prepare path.
    pub async fn start_transactions(
        master: Arc<dyn MasterClient>,
        title: String,
    ) -> ControllerResult<OperationTransactions> {
        let (input, output) = futures::try_join!(
            master.start_transaction(format!("{title} input")),
            master.start_transaction(format!("{title} output")),
        )?;
        Ok(OperationTransactions { input, output })
    }

    pub async fn prepare(&mut self) -> ControllerResult<()> {
        let transactions =
            Self::start_transactions(Arc::clone(&self.master), self.state.spec.title.clone())
                .await?;
        self.finish_prepare(transactions);
        Ok(())
    }

    /// Applies the prepared transactions; the synchronous tail of
    /// `prepare`, also used by the actor after its spawned master calls.
    pub fn finish_prepare(&mut self, transactions: OperationTransactions) {
        self.transactions = Some(transactions);
        if self.state.lifecycle == ControllerState::Initializing {
            self.state.lifecycle = ControllerState::Preparing;
        }
        info!("operation prepared (operation: {})", self.state.operation_id);
    }

    /// Builds the task graph from the spec and opens the gate for
    /// scheduling. Skipped when the operation was already revived.
    pub fn materialize(&mut self) -> ControllerResult<()> {
        if self.state.lifecycle.is_running() {
            // Successfully revived, nothing to materialize.
            return Ok(());
        }

        let definitions = self.state.spec.tasks.clone();
        let task_ids: Vec<TaskId> = (0..definitions.len())
            .map(|index| TaskId::from(index as u64 + 1))
            .collect();

        // One group per job type; the group floor is the component-wise
        // minimum over its members' asks.
        let mut group_ids: HashMap<JobType, TaskGroupId> = HashMap::new();
        let mut next_group = 1u64;
        let mut tasks: Vec<Task> = Vec::with_capacity(definitions.len());
        for (index, definition) in definitions.iter().enumerate() {
            let group_id = *group_ids
                .entry(definition.profile.job_type)
                .or_insert_with(|| {
                    let id = TaskGroupId::from(next_group);
                    next_group += 1;
                    id
                });
            let downstream = definition.downstream.map(|i| task_ids[i]);
            tasks.push(Task::new(
                task_ids[index],
                definition.name.clone(),
                group_id,
                definition.profile.clone(),
                downstream,
                self.options.footprint_memory,
            ));
        }

        let mut floors: HashMap<TaskGroupId, JobResources> = HashMap::new();
        for task in &tasks {
            let ask = task.apply_memory_reserve(&self.state.digests, task.needed_resources());
            floors
                .entry(task.group)
                .and_modify(|floor| *floor = floor.component_min(&ask))
                .or_insert(ask);
        }
        let mut registered_groups: Vec<TaskGroupId> = floors.keys().copied().collect();
        registered_groups.sort();
        for group_id in registered_groups {
            let floor = floors[&group_id];
            self.state.register_group(TaskGroup::new(group_id, floor));
        }

        let downstream_targets: HashSet<TaskId> =
            tasks.iter().filter_map(|task| task.downstream).collect();
        for task in tasks {
            self.state.register_task(task);
        }

        for (index, definition) in definitions.iter().enumerate() {
            let task_id = task_ids[index];
            for stripe in &definition.stripes {
                self.state.register_input_stripe(task_id, stripe.clone());
                let has_locality = self
                    .state
                    .tasks
                    .get(&task_id)
                    .map(|task| task.has_input_locality())
                    .unwrap_or(false);
                if has_locality {
                    self.state.add_task_locality_hint_for_stripe(task_id, stripe);
                }
            }
        }

        // Tasks fed only from the spec have their whole input upfront;
        // tasks fed by an upstream producer stay open until it completes.
        for task_id in task_ids {
            if !downstream_targets.contains(&task_id) {
                if let Some(task) = self.state.tasks.get_mut(&task_id) {
                    task.pool_input().finish();
                }
            }
        }

        if self.state.input_chunk_map.is_empty() {
            info!("no jobs needed");
            self.complete_operation();
            return Ok(());
        }

        self.state.suspend_unavailable_input_stripes();
        self.state.add_all_task_pending_hints();

        if self.options.enable_snapshot_cycle_after_materialization {
            let blob = snapshot::save(&self.state)?;
            self.load_state_from_snapshot(&blob)?;
            self.state.add_all_task_pending_hints();
            self.state.rebuild_locality_hints();
        }

        self.state.lifecycle = ControllerState::Running;
        info!("materialization finished (operation: {})", self.state.operation_id);
        Ok(())
    }

    /// Restores the operation after a controller restart: from the latest
    /// snapshot when one exists, as a clean start otherwise. Joblets from
    /// the previous epoch are always aborted, never resumed.
    pub async fn revive(&mut self) -> ControllerResult<ReviveOutcome> {
        let blob = match self
            .master
            .download_snapshot(self.state.operation_id)
            .await
        {
            Ok(blob) => blob,
            Err(error) => {
                info!("failed to download snapshot, will use clean start: {error}");
                None
            }
        };
        let transactions =
            Self::start_transactions(Arc::clone(&self.master), self.state.spec.title.clone())
                .await?;
        match blob {
            None => {
                info!("using clean start instead of revive");
                if let Err(error) = self.master.remove_snapshot(self.state.operation_id).await {
                    warn!("failed to remove snapshot: {error}");
                }
                self.finish_prepare(transactions);
                Ok(ReviveOutcome::CleanStart)
            }
            Some(blob) => {
                self.transactions = Some(transactions);
                self.finish_revive(&blob)?;
                Ok(ReviveOutcome::FromSnapshot)
            }
        }
    }

    /// The synchronous tail of `revive`, applied once a snapshot blob is
    /// in hand.
    pub fn finish_revive(&mut self, blob: &[u8]) -> ControllerResult<()> {
        self.load_state_from_snapshot(blob)?;
        self.abort_all_joblets();
        self.state.add_all_task_pending_hints();
        self.state.rebuild_locality_hints();
        self.state.lifecycle = ControllerState::Running;
        info!("operation revived (operation: {})", self.state.operation_id);
        Ok(())
    }

    fn load_state_from_snapshot(&mut self, blob: &[u8]) -> ControllerResult<()> {
        info!("started loading snapshot");
        self.state = snapshot::load(blob)?;
        info!("finished loading snapshot");
        Ok(())
    }

    pub fn save_snapshot(&self) -> ControllerResult<Vec<u8>> {
        snapshot::save(&self.state)
    }

    fn abort_all_joblets(&mut self) {
        let joblets: Vec<Joblet> = self.state.joblets.drain().map(|(_, joblet)| joblet).collect();
        for joblet in joblets {
            self.state.job_counter.aborted(1);
            self.reinstall_job(&joblet, ReinstallReason::Aborted);
        }
    }

    /// Handles one heartbeat; see the scheduling engine for the matching
    /// algorithm. Fatal conditions surfaced by the engine are applied
    /// before returning.
    pub fn schedule_job(
        &mut self,
        ctx: &SchedulingContext,
        job_limits: JobResources,
    ) -> ScheduleJobResult {
        let mut env = SchedulerEnv {
            options: &self.options,
            chunk_lists: self.chunk_lists.as_mut(),
            nodes: self.nodes.as_ref(),
        };
        let result = self.state.schedule_job(&mut env, ctx, job_limits);
        self.drain_pending_failures();
        result
    }

    pub fn on_job_started(&mut self, job_id: JobId, start_time: DateTime<Utc>) {
        let Some(joblet) = self.state.joblets.get_mut(&job_id) else {
            warn!("unknown job {job_id} started");
            return;
        };
        joblet.start_time = Some(start_time);
        debug!(
            "job started (job: {job_id}, node: {}, type: {})",
            joblet.node.address, joblet.job_type
        );
    }

    fn update_memory_digests(&mut self, joblet: &Joblet, statistics: &JobStatistics) {
        let job_type = joblet.job_type;
        let mut task_update_needed = false;

        if let Some(user_job_max_memory) = statistics.user_job_max_memory {
            if joblet.estimated_resources.user_job_memory > 0 {
                let factor =
                    user_job_max_memory as f64 / joblet.estimated_resources.user_job_memory as f64;
                trace!(
                    "adding sample to the user job memory digest (type: {job_type}, sample: {factor}, job: {})",
                    joblet.job_id
                );
                self.state.digests.sample_user_job(job_type, factor);
                task_update_needed = true;
            }
        }

        if let Some(job_proxy_max_memory) = statistics.job_proxy_max_memory {
            let estimated = joblet.estimated_resources.job_proxy_memory
                + joblet.estimated_resources.footprint_memory;
            if estimated > 0 {
                let factor = job_proxy_max_memory as f64 / estimated as f64;
                trace!(
                    "adding sample to the job proxy memory digest (type: {job_type}, sample: {factor}, job: {})",
                    joblet.job_id
                );
                self.state.digests.sample_job_proxy(job_type, factor);
                task_update_needed = true;
            }
        }

        if task_update_needed {
            self.state
                .update_all_tasks_if_needed(Utc::now(), self.options.task_update_period);
        }
    }

    pub fn on_job_completed(&mut self, summary: CompletedJobSummary) {
        let Some(mut joblet) = self.state.remove_joblet(summary.job_id) else {
            warn!("unknown job {} completed", summary.job_id);
            return;
        };
        self.state.job_counter.completed(1);
        joblet.finish_time = Some(Utc::now());
        debug!(
            "job completed (job: {}, task: {}, abandoned: {})",
            summary.job_id, joblet.task_id, summary.abandoned
        );

        self.update_memory_digests(&joblet, &summary.statistics);

        let task_id = joblet.task_id;
        let intermediate = self
            .state
            .tasks
            .get(&task_id)
            .map(|task| task.profile.intermediate_output)
            .unwrap_or(false);

        if summary.abandoned {
            let ids: Vec<ChunkListId> = joblet.chunk_list_ids.iter().flatten().copied().collect();
            self.chunk_lists.release(ids);
            for slot in joblet.chunk_list_ids.iter_mut() {
                *slot = None;
            }
        } else {
            // Reuse chunk lists of outputs that produced no chunks.
            for (index, slot) in joblet.chunk_list_ids.iter_mut().enumerate() {
                let chunk_count = summary
                    .statistics
                    .output_chunk_counts
                    .get(index)
                    .copied()
                    .unwrap_or(0);
                if chunk_count == 0 {
                    if let Some(id) = slot.take() {
                        self.chunk_lists.reinstall(id);
                    }
                }
            }
            if joblet.job_type.is_row_count_preserving() {
                if let (Some(input), Some(output)) = (
                    summary.statistics.input_row_count,
                    summary.statistics.output_row_count,
                ) {
                    if input != output {
                        self.state.pending_failures.push(format!(
                            "input/output row count mismatch in completed job: {input} != {output} (task: {task_id})"
                        ));
                    }
                }
            }
        }

        if let Some(task) = self.state.tasks.get_mut(&task_id) {
            task.pool_output_mut().completed(joblet.output_cookie);
        }

        if !summary.abandoned {
            let downstream = self.state.tasks.get(&task_id).and_then(|task| task.downstream);
            if let (Some(downstream), Some(stripe)) = (downstream, summary.output_stripe.clone()) {
                self.register_intermediate(&joblet, stripe, downstream);
            }
            if !intermediate {
                if let Some(rows) = summary.statistics.output_row_count {
                    self.state.completed_row_count += rows;
                }
            }
        }

        self.state.update_task(task_id);
        self.drain_pending_failures();
        if self.state.lifecycle.is_finished() {
            return;
        }
        if self.state.is_operation_completed() {
            self.complete_operation();
            return;
        }
        if let Some(limit) = self.state.spec.row_count_limit {
            if self.state.completed_row_count >= limit {
                info!(
                    "row count limit reached (operation: {}, rows: {})",
                    self.state.operation_id, self.state.completed_row_count
                );
                self.complete_operation();
            }
        }
    }

    /// Feeds a completed job's intermediate output into the downstream
    /// pool. Output recovering a lost job resumes the original input
    /// cookie instead of allocating a new one.
    fn register_intermediate(&mut self, joblet: &Joblet, stripe: ChunkStripe, destination: TaskId) {
        let lost_cookie = self
            .state
            .tasks
            .get_mut(&joblet.task_id)
            .and_then(|task| task.take_lost_cookie(joblet.output_cookie));
        let input_cookie = match lost_cookie {
            Some(cookie) => {
                if let Some(task) = self.state.tasks.get_mut(&destination) {
                    task.pool_input().resume(cookie, stripe.clone());
                }
                cookie
            }
            None => match self.state.tasks.get_mut(&destination) {
                Some(task) => task.pool_input().add(stripe.clone()),
                None => {
                    warn!("destination task {destination} not found");
                    return;
                }
            },
        };

        // Store recovery info.
        let completed_job = CompletedJob {
            job_id: joblet.job_id,
            source_task: joblet.task_id,
            output_cookie: joblet.output_cookie,
            data_size: joblet.input_stripe_list.total_data_size,
            destination_task: destination,
            input_cookie,
            node: joblet.node.clone(),
            lost: false,
        };
        for slice in &stripe.slices {
            if self
                .state
                .chunk_origin_map
                .insert(slice.chunk_id, joblet.job_id)
                .is_some()
            {
                warn!("chunk {} registered by more than one job", slice.chunk_id);
            }
        }
        self.state.completed_jobs.insert(joblet.job_id, completed_job);

        let has_locality = self
            .state
            .tasks
            .get(&destination)
            .map(|task| task.has_input_locality())
            .unwrap_or(false);
        if has_locality {
            self.state
                .add_task_locality_hint_for_stripe(destination, &stripe);
        }
        self.state.add_task_pending_hint(destination);
    }

    pub fn on_job_failed(&mut self, summary: FailedJobSummary) {
        let Some(mut joblet) = self.state.remove_joblet(summary.job_id) else {
            warn!("unknown job {} failed", summary.job_id);
            return;
        };
        self.state.job_counter.failed(1);
        joblet.finish_time = Some(Utc::now());
        debug!(
            "job failed (job: {}, task: {}, error: {})",
            summary.job_id, joblet.task_id, summary.error
        );

        self.reinstall_job(&joblet, ReinstallReason::Failed);
        self.drain_pending_failures();

        if summary.fatal {
            let error = format!("job failed with fatal error: {}", summary.error);
            self.fail_operation(&error);
            return;
        }
        if self.state.job_counter.failed >= self.options.max_failed_job_count as i64 {
            let error = format!(
                "failed jobs limit exceeded (max failed job count: {})",
                self.options.max_failed_job_count
            );
            self.fail_operation(&error);
        }
    }

    pub fn on_job_aborted(&mut self, summary: AbortedJobSummary) {
        let Some(mut joblet) = self.state.remove_joblet(summary.job_id) else {
            warn!("unknown job {} aborted", summary.job_id);
            return;
        };
        self.state.job_counter.aborted(1);
        joblet.finish_time = Some(Utc::now());
        debug!(
            "job aborted (job: {}, task: {}, reason: {})",
            summary.job_id, joblet.task_id, summary.reason
        );

        if summary.reason == AbortReason::ResourceOverdraft {
            if let Some(statistics) = &summary.statistics {
                self.update_memory_digests(&joblet, statistics);
            }
        }

        self.reinstall_job(&joblet, ReinstallReason::Aborted);
        self.drain_pending_failures();

        if summary.reason == AbortReason::FailedChunks {
            for chunk_id in &summary.failed_chunk_ids {
                self.on_chunk_failed(*chunk_id);
            }
        }
    }

    /// Returns a job's work unit to its pool and restores the hints the
    /// unit contributes.
    fn reinstall_job(&mut self, joblet: &Joblet, reason: ReinstallReason) {
        let ids: Vec<ChunkListId> = joblet.chunk_list_ids.iter().flatten().copied().collect();
        self.chunk_lists.release(ids);

        let task_id = joblet.task_id;
        let Some(task) = self.state.tasks.get_mut(&task_id) else {
            warn!("task {task_id} not found");
            return;
        };
        let stripes = if task.has_input_locality() {
            joblet.input_stripe_list.stripes.clone()
        } else {
            Vec::new()
        };
        match reason {
            ReinstallReason::Failed => task.pool_output_mut().failed(joblet.output_cookie),
            ReinstallReason::Aborted => task.pool_output_mut().aborted(joblet.output_cookie),
        }
        for stripe in &stripes {
            self.state.add_task_locality_hint_for_stripe(task_id, stripe);
        }
        self.state.add_task_pending_hint(task_id);
    }

    pub fn on_chunk_failed(&mut self, chunk_id: ChunkId) {
        if self.state.input_chunk_map.contains_key(&chunk_id) {
            warn!("input chunk {chunk_id} has failed");
            self.on_input_chunk_unavailable(chunk_id);
        } else {
            warn!("intermediate chunk {chunk_id} has failed");
            self.on_intermediate_chunk_unavailable(chunk_id);
        }
    }

    /// Availability callback from the external chunk poller.
    pub fn on_input_chunk_located(&mut self, chunk_id: ChunkId, replicas: Vec<NodeId>) {
        if replicas.is_empty() {
            self.on_input_chunk_unavailable(chunk_id);
        } else {
            self.on_input_chunk_available(chunk_id, replicas);
        }
        self.drain_pending_failures();
    }

    fn on_input_chunk_available(&mut self, chunk_id: ChunkId, replicas: Vec<NodeId>) {
        let stripe_indexes = match self.state.input_chunk_map.get_mut(&chunk_id) {
            Some(descriptor) if descriptor.state == InputChunkState::Waiting => {
                descriptor.state = InputChunkState::Active;
                descriptor.stripe_indexes.clone()
            }
            _ => return,
        };
        trace!("input chunk is available (chunk: {chunk_id})");
        self.state.unavailable_input_chunk_count -= 1;
        debug_assert!(self.state.unavailable_input_chunk_count >= 0);

        for index in stripe_indexes {
            let (task_id, cookie, resume_now, stripe) = {
                let Some(registered) = self.state.registered_stripes.get_mut(index) else {
                    continue;
                };
                for slice in registered.stripe.slices.iter_mut() {
                    if slice.chunk_id == chunk_id {
                        slice.replicas = replicas.clone();
                    }
                }
                registered.waiting_chunk_count -= 1;
                (
                    registered.task,
                    registered.cookie,
                    registered.waiting_chunk_count == 0,
                    registered.stripe.clone(),
                )
            };
            if !resume_now {
                continue;
            }
            let has_locality = match self.state.tasks.get_mut(&task_id) {
                Some(task) => {
                    task.pool_input().resume(cookie, stripe.clone());
                    task.has_input_locality()
                }
                None => continue,
            };
            if has_locality {
                self.state.add_task_locality_hint_for_stripe(task_id, &stripe);
            }
            self.state.add_task_pending_hint(task_id);
        }
    }

    fn on_input_chunk_unavailable(&mut self, chunk_id: ChunkId) {
        let stripe_indexes = match self.state.input_chunk_map.get(&chunk_id) {
            Some(descriptor) if descriptor.state == InputChunkState::Active => {
                descriptor.stripe_indexes.clone()
            }
            _ => return,
        };
        trace!("input chunk is unavailable (chunk: {chunk_id})");
        self.state.unavailable_input_chunk_count += 1;

        match self.options.unavailable_chunk_policy {
            UnavailableChunkPolicy::Fail => {
                self.state
                    .pending_failures
                    .push(format!("input chunk {chunk_id} is unavailable"));
                self.drain_pending_failures();
            }
            UnavailableChunkPolicy::Skip => {
                if let Some(descriptor) = self.state.input_chunk_map.get_mut(&chunk_id) {
                    descriptor.state = InputChunkState::Skipped;
                }
                for index in stripe_indexes {
                    let (task_id, cookie, patched) = {
                        let Some(registered) = self.state.registered_stripes.get_mut(index)
                        else {
                            continue;
                        };
                        registered
                            .stripe
                            .slices
                            .retain(|slice| slice.chunk_id != chunk_id);
                        (registered.task, registered.cookie, registered.stripe.clone())
                    };
                    if let Some(task) = self.state.tasks.get_mut(&task_id) {
                        // Reinstall the patched stripe.
                        task.pool_input().suspend(cookie);
                        task.pool_input().resume(cookie, patched);
                    }
                    self.state.add_task_pending_hint(task_id);
                }
            }
            UnavailableChunkPolicy::Wait => {
                if let Some(descriptor) = self.state.input_chunk_map.get_mut(&chunk_id) {
                    descriptor.state = InputChunkState::Waiting;
                }
                for index in stripe_indexes {
                    let (task_id, cookie, suspend_now) = {
                        let Some(registered) = self.state.registered_stripes.get_mut(index)
                        else {
                            continue;
                        };
                        let suspend_now = registered.waiting_chunk_count == 0;
                        registered.waiting_chunk_count += 1;
                        (registered.task, registered.cookie, suspend_now)
                    };
                    if suspend_now {
                        if let Some(task) = self.state.tasks.get_mut(&task_id) {
                            task.pool_input().suspend(cookie);
                        }
                    }
                }
            }
        }
    }

    /// Lost-job recovery: suspend the downstream input, return the source
    /// work unit to its pool, and remember the cookie pair so the re-run
    /// output resumes the original input.
    pub fn on_intermediate_chunk_unavailable(&mut self, chunk_id: ChunkId) {
        let Some(job_id) = self.state.chunk_origin_map.get(&chunk_id).copied() else {
            warn!("intermediate chunk {chunk_id} has no registered origin");
            return;
        };
        let completed_job = match self.state.completed_jobs.get_mut(&job_id) {
            Some(completed_job) if !completed_job.lost => {
                completed_job.lost = true;
                completed_job.clone()
            }
            _ => return,
        };
        debug!(
            "job is lost (node: {}, job: {job_id}, source task: {}, output cookie: {}, input cookie: {})",
            completed_job.node.address,
            completed_job.source_task,
            completed_job.output_cookie,
            completed_job.input_cookie
        );
        self.state.job_counter.lost(1);
        if let Some(task) = self.state.tasks.get_mut(&completed_job.destination_task) {
            task.pool_input().suspend(completed_job.input_cookie);
        }
        if let Some(task) = self.state.tasks.get_mut(&completed_job.source_task) {
            task.pool_output_mut().lost(completed_job.output_cookie);
            task.on_job_lost(completed_job.output_cookie, completed_job.input_cookie);
        }
        self.state.add_task_pending_hint(completed_job.source_task);
    }

    /// Returns delayed tasks to the candidate sets, e.g. after the fleet
    /// composition changed enough to make earlier locality waits pointless.
    pub fn reset_task_locality_delays(&mut self) {
        self.state.reset_task_locality_delays();
    }

    /// Periodic wall-clock cap; checked by the actor, not via per-call
    /// deadlines.
    pub fn check_time_limit(&mut self, now: DateTime<Utc>) {
        let Some(limit) = self.options.time_limit else {
            return;
        };
        let elapsed = now
            .signed_duration_since(self.state.start_time)
            .to_std()
            .unwrap_or_default();
        if elapsed > limit {
            let error = format!(
                "operation is running for too long, aborted (time limit: {limit:?})"
            );
            self.fail_operation(&error);
        }
    }

    pub fn complete_operation(&mut self) {
        // Completion may race a failure raised while finishing jobs.
        if self.state.lifecycle.is_finished() {
            return;
        }
        info!("operation completed (operation: {})", self.state.operation_id);
        self.state.lifecycle = ControllerState::Completed;
    }

    pub fn fail_operation(&mut self, error: &str) {
        // A second failure signal after the terminal state is a no-op.
        if self.state.lifecycle.is_finished() {
            return;
        }
        error!(
            "operation failed (operation: {}, error: {error})",
            self.state.operation_id
        );
        self.state.lifecycle = ControllerState::Failed { aborted: false };
        self.failure = Some(error.to_string());
    }

    fn drain_pending_failures(&mut self) {
        let failures = std::mem::take(&mut self.state.pending_failures);
        for failure in failures {
            self.fail_operation(&failure);
        }
    }

    pub fn transactions(&self) -> Option<OperationTransactions> {
        self.transactions
    }

    pub fn take_transactions(&mut self) -> Option<OperationTransactions> {
        self.transactions.take()
    }

    /// The synchronous part of abort; transaction aborts happen off the
    /// execution context.
    pub fn finish_abort(&mut self) {
        if !self.state.lifecycle.is_finished() {
            self.state.lifecycle = ControllerState::Failed { aborted: true };
            self.failure = Some("operation aborted".to_string());
        }
        info!("operation aborted (operation: {})", self.state.operation_id);
    }

    pub async fn abort(&mut self) {
        if let Some(transactions) = self.transactions.take() {
            let _ = self.master.abort_transaction(transactions.input).await;
            let _ = self.master.abort_transaction(transactions.output).await;
        }
        self.finish_abort();
    }

    pub async fn commit(&mut self) -> ControllerResult<()> {
        if self.state.lifecycle != ControllerState::Completed {
            return Err(ControllerError::InvalidOperationState {
                expected: "completed".to_string(),
                actual: self.state.lifecycle.to_string(),
            });
        }
        if let Some(transactions) = self.transactions.take() {
            self.master.commit_transaction(transactions.input).await?;
            self.master.commit_transaction(transactions.output).await?;
        }
        info!("results committed (operation: {})", self.state.operation_id);
        Ok(())
    }

    pub fn master(&self) -> Arc<dyn MasterClient> {
        Arc::clone(&self.master)
    }

    pub fn time_limit_check_period(&self) -> std::time::Duration {
        self.options.time_limit_check_period
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Utc;
    use keel_common::config::UnavailableChunkPolicy;

    use super::*;
    use crate::chunk_list::ChunkListPool;
    use crate::chunk_pool::{ChunkSlice, ChunkStripe};
    use crate::cluster::NodeDescriptor;
    use crate::id::NodeId;
    use crate::master::{InMemoryMaster, TransactionState};
    use crate::operation::job::JobType;
    use crate::operation::schedule::ScheduleFailReason;
    use crate::operation::task::TaskProfile;
    use crate::testing::*;

    fn statistics(output_chunk_counts: Vec<i64>) -> JobStatistics {
        JobStatistics {
            output_chunk_counts,
            ..Default::default()
        }
    }

    fn completed(job_id: JobId, statistics: JobStatistics) -> CompletedJobSummary {
        CompletedJobSummary {
            job_id,
            abandoned: false,
            statistics,
            output_stripe: None,
        }
    }

    fn big_limits() -> JobResources {
        JobResources::new(8.0, 10_000, 8, 0)
    }

    #[tokio::test]
    async fn test_materialize_with_no_input_completes_immediately() {
        let mut profile = profile(JobType::Map);
        profile.input_locality = false;
        let spec = spec(vec![definition("map", profile, vec![])]);
        let fixture = running_controller(spec, test_config()).await;
        assert_eq!(fixture.controller.lifecycle(), ControllerState::Completed);
    }

    #[tokio::test]
    async fn test_job_completion_drives_operation_to_completed() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let mut fixture = running_controller(spec, test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let request = result.start_request.unwrap();
        fixture.controller.on_job_started(request.job_id, Utc::now());
        fixture
            .controller
            .on_job_completed(completed(request.job_id, statistics(vec![1])));

        assert_eq!(fixture.controller.lifecycle(), ControllerState::Completed);
        let counter = fixture.controller.state().job_counter;
        assert_eq!(counter.completed, 1);
        assert_eq!(counter.running, 0);
    }

    #[tokio::test]
    async fn test_failed_job_is_reinstalled_with_same_content() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let mut fixture = running_controller(spec, test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let first = result.start_request.unwrap();
        fixture.controller.on_job_failed(FailedJobSummary {
            job_id: first.job_id,
            error: "user process exited with code 1".to_string(),
            fatal: false,
        });

        assert_eq!(fixture.controller.lifecycle(), ControllerState::Running);
        assert_eq!(fixture.controller.state().pending_job_count(), 1);

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let second = result.start_request.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(
            first.spec.input.stripes[0], second.spec.input.stripes[0],
            "the reinstalled unit must resurface the same stripe content"
        );
    }

    #[tokio::test]
    async fn test_fatal_failure_fails_operation() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let mut fixture = running_controller(spec, test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let request = result.start_request.unwrap();
        fixture.controller.on_job_failed(FailedJobSummary {
            job_id: request.job_id,
            error: "segmentation fault".to_string(),
            fatal: true,
        });

        assert_eq!(
            fixture.controller.lifecycle(),
            ControllerState::Failed { aborted: false }
        );
        assert!(fixture.controller.failure().unwrap().contains("fatal"));

        // A second failure signal is a no-op.
        fixture.controller.fail_operation("later failure");
        assert!(fixture.controller.failure().unwrap().contains("fatal"));
    }

    #[tokio::test]
    async fn test_failed_job_limit_fails_operation() {
        let mut spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        spec.max_failed_job_count = Some(1);
        let mut fixture = running_controller(spec, test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let request = result.start_request.unwrap();
        fixture.controller.on_job_failed(FailedJobSummary {
            job_id: request.job_id,
            error: "flaky".to_string(),
            fatal: false,
        });

        assert_eq!(
            fixture.controller.lifecycle(),
            ControllerState::Failed { aborted: false }
        );
    }

    #[tokio::test]
    async fn test_abort_rolls_back_transactions() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let mut fixture = running_controller(spec, test_config()).await;
        let transactions = fixture.controller.transactions().unwrap();

        fixture.controller.abort().await;
        assert_eq!(
            fixture.controller.lifecycle(),
            ControllerState::Failed { aborted: true }
        );
        assert_eq!(
            fixture.master.transaction_state(transactions.input),
            Some(TransactionState::Aborted)
        );
        assert_eq!(
            fixture.master.transaction_state(transactions.output),
            Some(TransactionState::Aborted)
        );
    }

    #[tokio::test]
    async fn test_commit_after_completion() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let mut fixture = running_controller(spec, test_config()).await;
        let transactions = fixture.controller.transactions().unwrap();

        assert!(fixture.controller.commit().await.is_err());

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let request = result.start_request.unwrap();
        fixture
            .controller
            .on_job_completed(completed(request.job_id, statistics(vec![1])));
        fixture.controller.commit().await.unwrap();
        assert_eq!(
            fixture.master.transaction_state(transactions.input),
            Some(TransactionState::Committed)
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_discards_joblets() {
        let spec_value = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1]), stripe(2, 100, &[1])],
        )]);
        let mut fixture = running_controller(spec_value.clone(), test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        assert!(result.start_request.is_some());
        assert_eq!(fixture.controller.state().joblets.len(), 1);
        let total_before = fixture.controller.state().job_counter.total;

        let blob = fixture.controller.save_snapshot().unwrap();
        fixture
            .master
            .upload_snapshot(fixture.controller.operation_id(), blob)
            .await
            .unwrap();

        // A fresh controller revives from the stored snapshot.
        let chunk_lists = Box::new(ChunkListPool::with_uniform_capacity(&[0, 1], 64));
        let mut revived = OperationController::new(
            OperationId::from(1),
            spec_value,
            &test_config(),
            chunk_lists,
            fixture.master.clone(),
            fixture.nodes.clone(),
        );
        revived.initialize().unwrap();
        let outcome = revived.revive().await.unwrap();
        assert_eq!(outcome, ReviveOutcome::FromSnapshot);

        assert_eq!(revived.lifecycle(), ControllerState::Running);
        assert!(revived.state().joblets.is_empty(), "joblets are never resumed");
        assert_eq!(revived.state().job_counter.total, total_before);
        assert_eq!(revived.state().job_counter.aborted, 1);
        assert_eq!(revived.state().pending_job_count(), 2);

        // The revived operation schedules again and can run to the end.
        let result = revived.schedule_job(&context(1, Utc::now()), big_limits());
        assert!(result.start_request.is_some());
    }

    #[tokio::test]
    async fn test_revive_without_snapshot_is_a_clean_start() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let master = Arc::new(InMemoryMaster::new());
        let chunk_lists = Box::new(ChunkListPool::with_uniform_capacity(&[0, 1], 64));
        let mut controller = OperationController::new(
            OperationId::from(1),
            spec,
            &test_config(),
            chunk_lists,
            master,
            node_tracker(&[(1, big_node_limits())]),
        );
        controller.initialize().unwrap();
        let outcome = controller.revive().await.unwrap();
        assert_eq!(outcome, ReviveOutcome::CleanStart);
        assert_eq!(controller.lifecycle(), ControllerState::Preparing);
        controller.materialize().unwrap();
        assert_eq!(controller.lifecycle(), ControllerState::Running);
    }

    fn partition_merge_spec() -> OperationSpec {
        let partition = TaskProfile {
            job_type: JobType::Partition,
            user_job: None,
            intermediate_output: true,
            input_locality: true,
            locality_timeout: None,
            cpu: 1.0,
            job_proxy_memory: 90,
            network: 0,
        };
        let merge = TaskProfile {
            job_type: JobType::UnorderedMerge,
            user_job: None,
            intermediate_output: false,
            input_locality: false,
            locality_timeout: None,
            cpu: 1.0,
            job_proxy_memory: 90,
            network: 0,
        };
        let mut partition = definition("partition", partition, vec![stripe(1, 100, &[1])]);
        partition.downstream = Some(1);
        let merge = definition("merge", merge, vec![]);
        spec(vec![partition, merge])
    }

    #[tokio::test]
    async fn test_lost_job_recovery_resumes_the_original_cookie() {
        let mut fixture = running_controller(partition_merge_spec(), test_config()).await;

        // Run the partition job and feed its output downstream.
        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let first = result.start_request.unwrap();
        assert_eq!(first.job_type, JobType::Partition);
        fixture.controller.on_job_completed(CompletedJobSummary {
            job_id: first.job_id,
            abandoned: false,
            statistics: statistics(vec![1]),
            output_stripe: Some(stripe(100, 80, &[2])),
        });

        let original_cookie = fixture
            .controller
            .state()
            .completed_jobs
            .values()
            .next()
            .unwrap()
            .input_cookie;

        // The downstream copy of the output goes missing.
        fixture
            .controller
            .on_intermediate_chunk_unavailable(ChunkId::from(100));
        let merge_id = fixture.controller.state().task_order[1];
        assert_eq!(
            fixture.controller.state().tasks[&merge_id].pending_job_count(),
            0,
            "the lost input must be suspended downstream"
        );

        // The source work unit is re-run, flagged as restarted.
        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let second = result.start_request.unwrap();
        assert_eq!(second.job_type, JobType::Partition);
        assert!(second.restarted);

        fixture.controller.on_job_completed(CompletedJobSummary {
            job_id: second.job_id,
            abandoned: false,
            statistics: statistics(vec![1]),
            output_stripe: Some(stripe(101, 80, &[2])),
        });

        // The recovered output resumed the original input cookie.
        assert_eq!(
            fixture.controller.state().completed_jobs[&second.job_id].input_cookie,
            original_cookie
        );
        assert_eq!(
            fixture.controller.state().tasks[&merge_id].pending_job_count(),
            1
        );

        // The merge job finishes the operation.
        let result = fixture
            .controller
            .schedule_job(&context(2, Utc::now()), big_limits());
        let merge_job = result.start_request.unwrap();
        assert_eq!(merge_job.job_type, JobType::UnorderedMerge);
        fixture.controller.on_job_completed(CompletedJobSummary {
            job_id: merge_job.job_id,
            abandoned: false,
            statistics: JobStatistics {
                output_chunk_counts: vec![1],
                input_row_count: Some(8),
                output_row_count: Some(8),
                ..Default::default()
            },
            output_stripe: None,
        });
        assert_eq!(fixture.controller.lifecycle(), ControllerState::Completed);
    }

    #[tokio::test]
    async fn test_row_count_mismatch_fails_preserving_job() {
        let mut profile = profile(JobType::UnorderedMerge);
        profile.input_locality = false;
        let spec = spec(vec![definition("merge", profile, vec![stripe(1, 100, &[9])])]);
        let mut fixture = running_controller(spec, test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let request = result.start_request.unwrap();
        fixture.controller.on_job_completed(CompletedJobSummary {
            job_id: request.job_id,
            abandoned: false,
            statistics: JobStatistics {
                output_chunk_counts: vec![1],
                input_row_count: Some(10),
                output_row_count: Some(5),
                ..Default::default()
            },
            output_stripe: None,
        });
        assert_eq!(
            fixture.controller.lifecycle(),
            ControllerState::Failed { aborted: false }
        );
        assert!(fixture
            .controller
            .failure()
            .unwrap()
            .contains("row count mismatch"));
    }

    #[tokio::test]
    async fn test_row_count_limit_completes_early() {
        let mut profile = profile(JobType::Map);
        profile.input_locality = false;
        let mut spec = spec(vec![definition(
            "map",
            profile,
            vec![stripe(1, 100, &[9]), stripe(2, 100, &[9])],
        )]);
        spec.row_count_limit = Some(10);
        let mut fixture = running_controller(spec, test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let request = result.start_request.unwrap();
        fixture.controller.on_job_completed(CompletedJobSummary {
            job_id: request.job_id,
            abandoned: false,
            statistics: JobStatistics {
                output_chunk_counts: vec![1],
                output_row_count: Some(10),
                ..Default::default()
            },
            output_stripe: None,
        });
        assert_eq!(fixture.controller.lifecycle(), ControllerState::Completed);
    }

    #[tokio::test]
    async fn test_wait_policy_suspends_and_resumes_input() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[])],
        )]);
        let mut fixture = running_controller(spec, test_config()).await;

        // The only chunk has no replicas, so nothing is schedulable.
        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        assert!(result.start_request.is_none());
        assert!(result.fail_count(ScheduleFailReason::NoPendingJobs) > 0);
        assert_eq!(fixture.controller.state().unavailable_input_chunk_count, 1);

        fixture
            .controller
            .on_input_chunk_located(ChunkId::from(1), vec![NodeId::from(1)]);
        assert_eq!(fixture.controller.state().unavailable_input_chunk_count, 0);

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        assert!(result.start_request.is_some());
    }

    #[tokio::test]
    async fn test_skip_policy_drops_the_bad_chunk() {
        let mut config = test_config();
        config.operation.unavailable_chunk_policy = UnavailableChunkPolicy::Skip;
        let two_chunk_stripe = ChunkStripe::new(vec![
            ChunkSlice {
                chunk_id: ChunkId::from(1),
                data_size: 100,
                row_count: 10,
                replicas: vec![NodeId::from(1)],
            },
            ChunkSlice {
                chunk_id: ChunkId::from(2),
                data_size: 100,
                row_count: 10,
                replicas: vec![NodeId::from(1)],
            },
        ]);
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![two_chunk_stripe],
        )]);
        let mut fixture = running_controller(spec, config).await;

        fixture.controller.on_input_chunk_located(ChunkId::from(1), vec![]);
        assert_eq!(fixture.controller.lifecycle(), ControllerState::Running);

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let request = result.start_request.unwrap();
        let slices = &request.spec.input.stripes[0].slices;
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].chunk_id, ChunkId::from(2));
    }

    #[tokio::test]
    async fn test_fail_policy_fails_the_operation() {
        let mut config = test_config();
        config.operation.unavailable_chunk_policy = UnavailableChunkPolicy::Fail;
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let mut fixture = running_controller(spec, config).await;

        fixture.controller.on_input_chunk_located(ChunkId::from(1), vec![]);
        assert_eq!(
            fixture.controller.lifecycle(),
            ControllerState::Failed { aborted: false }
        );
    }

    #[tokio::test]
    async fn test_resource_overdraft_inflates_later_reserves() {
        let mut profile = profile(JobType::Map);
        profile.input_locality = false;
        profile.user_job = Some(user_job(100, 0.5));
        let spec = spec(vec![definition("map", profile, vec![stripe(1, 100, &[9])])]);
        let mut fixture = running_controller(spec, test_config()).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let first = result.start_request.unwrap();

        fixture.controller.on_job_aborted(AbortedJobSummary {
            job_id: first.job_id,
            reason: AbortReason::ResourceOverdraft,
            statistics: Some(JobStatistics {
                user_job_max_memory: Some(100),
                ..Default::default()
            }),
            failed_chunk_ids: vec![],
        });

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let second = result.start_request.unwrap();
        assert!(
            second.resources.memory > first.resources.memory,
            "observed overshoot must push the reservation up ({} vs {})",
            second.resources.memory,
            first.resources.memory
        );
    }

    #[tokio::test]
    async fn test_empty_output_reinstalls_the_chunk_list() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1]), stripe(2, 100, &[1])],
        )]);
        let mut fixture =
            running_controller_with_chunk_lists(spec, test_config(), 1).await;

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        let first = result.start_request.unwrap();
        // The job produced no output chunks; its chunk list is reusable.
        fixture
            .controller
            .on_job_completed(completed(first.job_id, statistics(vec![0])));

        let result = fixture
            .controller
            .schedule_job(&context(1, Utc::now()), big_limits());
        assert!(
            result.start_request.is_some(),
            "the reinstalled chunk list must cover the second job"
        );
    }

    #[tokio::test]
    async fn test_demand_sanity_failure_fails_operation() {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        let master = Arc::new(InMemoryMaster::new());
        let small = JobResources::new(1.0, 50, 1, 0);
        let nodes = node_tracker(&[(1, small)]);
        let chunk_lists = Box::new(ChunkListPool::with_uniform_capacity(&[0, 1], 8));
        let mut controller = OperationController::new(
            OperationId::from(7),
            spec,
            &test_config(),
            chunk_lists,
            master,
            nodes,
        );
        controller.initialize().unwrap();
        controller.prepare().await.unwrap();
        controller.materialize().unwrap();

        // No node in the fleet can ever satisfy the 100-byte demand.
        let ctx = SchedulingContext::new(
            NodeDescriptor {
                id: NodeId::from(1),
                address: "node-1:9012".to_string(),
            },
            small,
            Utc::now(),
        );
        let result = controller.schedule_job(&ctx, small);
        assert!(result.start_request.is_none());
        assert_eq!(
            controller.lifecycle(),
            ControllerState::Failed { aborted: false }
        );
        assert!(controller
            .failure()
            .unwrap()
            .contains("no online node can satisfy the resource demand"));
    }

    #[tokio::test]
    async fn test_time_limit_fails_operation() {
        let mut spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        spec.time_limit = Some(StdDuration::from_secs(1));
        let mut fixture = running_controller(spec, test_config()).await;

        fixture.controller.check_time_limit(Utc::now());
        assert_eq!(fixture.controller.lifecycle(), ControllerState::Running);

        fixture
            .controller
            .check_time_limit(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(
            fixture.controller.lifecycle(),
            ControllerState::Failed { aborted: false }
        );
    }
}
