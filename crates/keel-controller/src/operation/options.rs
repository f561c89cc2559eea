use std::time::Duration;

use keel_common::config::{AppConfig, UnavailableChunkPolicy};

use crate::operation::spec::OperationSpec;

/// Controller knobs resolved from the application config with
/// per-operation spec overrides applied.
#[derive(Debug, Clone)]
pub struct OperationOptions {
    pub safe_online_node_count: usize,
    pub resource_demand_sanity_check_period: Duration,
    pub task_update_period: Duration,
    pub time_limit_check_period: Duration,
    pub job_proxy_memory_reserve_quantile: f64,
    pub user_job_memory_reserve_quantile: f64,
    pub job_proxy_memory_digest_precision: f64,
    pub user_job_memory_digest_precision: f64,
    pub footprint_memory: i64,
    pub chunk_list_watermark: usize,
    pub max_failed_job_count: usize,
    pub locality_timeout: Duration,
    pub max_data_size_per_job: i64,
    pub unavailable_chunk_policy: UnavailableChunkPolicy,
    pub time_limit: Option<Duration>,
    pub enable_snapshot_cycle_after_materialization: bool,
}

impl OperationOptions {
    pub fn new(config: &AppConfig, spec: &OperationSpec) -> Self {
        Self {
            safe_online_node_count: config.controller.safe_online_node_count,
            resource_demand_sanity_check_period: Duration::from_secs(
                config.controller.resource_demand_sanity_check_period_secs,
            ),
            task_update_period: Duration::from_secs(config.controller.task_update_period_secs),
            time_limit_check_period: Duration::from_secs(
                config.controller.operation_time_limit_check_period_secs,
            ),
            job_proxy_memory_reserve_quantile: config.controller.job_proxy_memory_reserve_quantile,
            user_job_memory_reserve_quantile: config.controller.user_job_memory_reserve_quantile,
            job_proxy_memory_digest_precision: config.controller.job_proxy_memory_digest_precision,
            user_job_memory_digest_precision: config.controller.user_job_memory_digest_precision,
            footprint_memory: config.controller.footprint_memory,
            chunk_list_watermark: config.controller.chunk_list_watermark,
            max_failed_job_count: spec
                .max_failed_job_count
                .unwrap_or(config.operation.max_failed_job_count),
            locality_timeout: Duration::from_secs(config.operation.locality_timeout_secs),
            max_data_size_per_job: spec
                .max_data_size_per_job
                .unwrap_or(config.operation.max_data_size_per_job),
            unavailable_chunk_policy: spec
                .unavailable_chunk_policy
                .unwrap_or(config.operation.unavailable_chunk_policy),
            time_limit: spec.time_limit.or_else(|| {
                if config.operation.time_limit_secs == 0 {
                    None
                } else {
                    Some(Duration::from_secs(config.operation.time_limit_secs))
                }
            }),
            enable_snapshot_cycle_after_materialization: config
                .snapshot
                .enable_cycle_after_materialization,
        }
    }
}
