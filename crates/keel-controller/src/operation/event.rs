use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::cluster::SchedulingContext;
use crate::error::ControllerResult;
use crate::id::{ChunkId, JobId, NodeId};
use crate::operation::controller::{OperationProgress, OperationTransactions, ReviveOutcome};
use crate::operation::job::{AbortedJobSummary, CompletedJobSummary, FailedJobSummary};
use crate::operation::schedule::ScheduleJobResult;
use crate::resources::JobResources;

/// Messages handled by the controller actor. Lifecycle requests carry a
/// reply channel; job status events are fire-and-forget, mirroring the
/// caller-side event sinks.
pub enum ControllerEvent {
    Initialize {
        reply: oneshot::Sender<ControllerResult<()>>,
    },
    Prepare {
        reply: oneshot::Sender<ControllerResult<()>>,
    },
    /// Internal: posted by the spawned master calls of `Prepare`.
    TransactionsStarted {
        result: ControllerResult<OperationTransactions>,
        reply: oneshot::Sender<ControllerResult<()>>,
    },
    Materialize {
        reply: oneshot::Sender<ControllerResult<()>>,
    },
    Revive {
        reply: oneshot::Sender<ControllerResult<ReviveOutcome>>,
    },
    /// Internal: posted by the spawned master calls of `Revive`.
    SnapshotDownloaded {
        transactions: OperationTransactions,
        blob: Option<Vec<u8>>,
        reply: oneshot::Sender<ControllerResult<ReviveOutcome>>,
    },
    ScheduleJob {
        context: SchedulingContext,
        job_limits: JobResources,
        reply: oneshot::Sender<Box<ScheduleJobResult>>,
    },
    JobStarted {
        job_id: JobId,
        start_time: DateTime<Utc>,
    },
    JobCompleted {
        summary: CompletedJobSummary,
    },
    JobFailed {
        summary: FailedJobSummary,
    },
    JobAborted {
        summary: AbortedJobSummary,
    },
    InputChunkLocated {
        chunk_id: ChunkId,
        replicas: Vec<NodeId>,
    },
    IntermediateChunkUnavailable {
        chunk_id: ChunkId,
    },
    SaveSnapshot {
        reply: oneshot::Sender<ControllerResult<Vec<u8>>>,
    },
    GetProgress {
        reply: oneshot::Sender<OperationProgress>,
    },
    CheckTimeLimit,
    Commit {
        reply: oneshot::Sender<ControllerResult<()>>,
    },
    Abort {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}
