use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk_pool::ChunkStripeList;
use crate::cluster::NodeDescriptor;
use crate::id::{ChunkListId, InputCookie, JobId, OutputCookie, TaskId};
use crate::operation::job::JobType;
use crate::resources::{ExtendedJobResources, JobResources};

/// The controller-side record of one in-flight scheduled job. Joblets from
/// a previous controller epoch are never resumed; a snapshot load aborts
/// them all, which only needs the fields required by the reinstall path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Joblet {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub job_type: JobType,
    pub job_index: u64,
    pub node: NodeDescriptor,
    pub output_cookie: OutputCookie,
    pub input_stripe_list: ChunkStripeList,
    pub estimated_resources: ExtendedJobResources,
    pub resource_limits: JobResources,
    pub job_proxy_memory_reserve_factor: f64,
    pub user_job_memory_reserve_factor: Option<f64>,
    /// One entry per job output; entries are cleared when a chunk list is
    /// released or reinstalled.
    pub chunk_list_ids: Vec<Option<ChunkListId>>,
    pub restarted: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

/// Recovery bookkeeping for a successfully finished job whose output went
/// into a downstream pool. If that output is later reported lost, the
/// source cookie is re-run and the recovered output resumes the original
/// downstream input cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedJob {
    pub job_id: JobId,
    pub source_task: TaskId,
    pub output_cookie: OutputCookie,
    pub data_size: i64,
    pub destination_task: TaskId,
    pub input_cookie: InputCookie,
    pub node: NodeDescriptor,
    pub lost: bool,
}
