use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chunk_pool::{ChunkStripe, ChunkStripeList};
use crate::id::{ChunkId, ChunkListId, JobId};
use crate::resources::JobResources;

/// The closed set of job flavors an operation can produce. Each task maps
/// to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobType {
    Map,
    OrderedMap,
    SortedMerge,
    UnorderedMerge,
    Partition,
    SortedReduce,
}

impl JobType {
    /// Whether a completed job of this type must emit exactly as many rows
    /// as it consumed.
    pub fn is_row_count_preserving(&self) -> bool {
        matches!(
            self,
            JobType::SortedMerge | JobType::UnorderedMerge | JobType::Partition
        )
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobType::Map => "map",
            JobType::OrderedMap => "ordered_map",
            JobType::SortedMerge => "sorted_merge",
            JobType::UnorderedMerge => "unordered_merge",
            JobType::Partition => "partition",
            JobType::SortedReduce => "sorted_reduce",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJobSpec {
    pub command: String,
    /// The operator-declared memory limit for the user process, in bytes.
    pub memory_limit: i64,
    /// The fraction of the limit initially reserved; the digest calibrates
    /// the effective factor upward from here.
    pub memory_reserve_factor: f64,
}

/// The materialized description of one job sent to the execution layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: JobType,
    pub input: ChunkStripeList,
    pub outputs: Vec<ChunkListId>,
    pub user_job: Option<UserJobSpec>,
    pub memory_reserve: i64,
    pub job_proxy_memory_reserve_factor: f64,
    pub user_job_memory_reserve_factor: Option<f64>,
}

/// The successful outcome of a scheduling call.
#[derive(Debug, Clone)]
pub struct JobStartRequest {
    pub job_id: JobId,
    pub job_type: JobType,
    pub resources: JobResources,
    /// Set when this job re-runs work whose downstream output was lost.
    pub restarted: bool,
    pub spec: JobSpec,
}

/// Post-hoc measurements reported by the execution layer with a terminal
/// job status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    pub user_job_max_memory: Option<i64>,
    pub job_proxy_max_memory: Option<i64>,
    pub input_row_count: Option<i64>,
    pub output_row_count: Option<i64>,
    /// Chunk counts per output in `JobSpec::outputs` order; an output with
    /// zero chunks lets its chunk list be reused.
    pub output_chunk_counts: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct CompletedJobSummary {
    pub job_id: JobId,
    /// An abandoned job completed without producing usable output.
    pub abandoned: bool,
    pub statistics: JobStatistics,
    /// The intermediate output stripe, for tasks feeding a downstream task.
    pub output_stripe: Option<ChunkStripe>,
}

#[derive(Debug, Clone)]
pub struct FailedJobSummary {
    pub job_id: JobId,
    pub error: String,
    /// Fatal failures take the whole operation down.
    pub fatal: bool,
}

#[derive(Debug, Clone)]
pub struct AbortedJobSummary {
    pub job_id: JobId,
    pub reason: AbortReason,
    pub statistics: Option<JobStatistics>,
    /// Chunks reported bad when the abort reason is `FailedChunks`.
    pub failed_chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    Scheduler,
    Revival,
    ResourceOverdraft,
    FailedChunks,
    UserRequest,
    Other,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbortReason::Scheduler => "scheduler",
            AbortReason::Revival => "revival",
            AbortReason::ResourceOverdraft => "resource_overdraft",
            AbortReason::FailedChunks => "failed_chunks",
            AbortReason::UserRequest => "user_request",
            AbortReason::Other => "other",
        };
        write!(f, "{name}")
    }
}
