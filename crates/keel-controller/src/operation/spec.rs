use std::time::Duration;

use keel_common::config::UnavailableChunkPolicy;
use serde::{Deserialize, Serialize};

use crate::chunk_pool::ChunkStripe;
use crate::error::{ControllerError, ControllerResult};
use crate::id::CellTag;
use crate::operation::task::TaskProfile;

/// The user-submitted description of one operation: the tasks to run, the
/// input data per task, and the per-operation policy overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub title: String,
    pub tasks: Vec<TaskDefinition>,
    /// The storage cells the final output tables live on, one per output.
    pub output_cell_tags: Vec<CellTag>,
    pub max_failed_job_count: Option<usize>,
    pub time_limit: Option<Duration>,
    pub max_data_size_per_job: Option<i64>,
    pub unavailable_chunk_policy: Option<UnavailableChunkPolicy>,
    /// Completes the operation early once this many output rows exist.
    pub row_count_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub profile: TaskProfile,
    pub stripes: Vec<ChunkStripe>,
    /// Index into `tasks` of the task consuming this task's output.
    pub downstream: Option<usize>,
}

impl OperationSpec {
    pub fn validate(&self) -> ControllerResult<()> {
        if self.tasks.is_empty() {
            return Err(ControllerError::InternalError(
                "operation spec has no tasks".to_string(),
            ));
        }
        if self.output_cell_tags.is_empty() {
            return Err(ControllerError::InternalError(
                "operation spec has no output cells".to_string(),
            ));
        }
        for (index, task) in self.tasks.iter().enumerate() {
            match task.downstream {
                Some(downstream) if downstream >= self.tasks.len() || downstream == index => {
                    return Err(ControllerError::InternalError(format!(
                        "task {} has an invalid downstream index {downstream}",
                        task.name
                    )));
                }
                Some(_) if !task.profile.intermediate_output => {
                    return Err(ControllerError::InternalError(format!(
                        "task {} has a downstream task but no intermediate output",
                        task.name
                    )));
                }
                None if task.profile.intermediate_output => {
                    return Err(ControllerError::InternalError(format!(
                        "task {} has intermediate output but no downstream task",
                        task.name
                    )));
                }
                _ => {}
            }
            if let Some(user_job) = &task.profile.user_job {
                if user_job.memory_limit < 0 {
                    return Err(ControllerError::InternalError(format!(
                        "task {} has a negative user job memory limit",
                        task.name
                    )));
                }
            }
        }
        Ok(())
    }
}
