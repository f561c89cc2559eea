use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub operation: OperationConfig,
    pub snapshot: SnapshotConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .admerge(Env::prefixed("KEEL__").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// The fleet size below which resource demand sanity checks are skipped.
    pub safe_online_node_count: usize,
    pub resource_demand_sanity_check_period_secs: u64,
    pub task_update_period_secs: u64,
    pub operation_time_limit_check_period_secs: u64,
    pub job_proxy_memory_reserve_quantile: f64,
    pub user_job_memory_reserve_quantile: f64,
    pub job_proxy_memory_digest_precision: f64,
    pub user_job_memory_digest_precision: f64,
    /// The fixed per-job memory footprint, in bytes.
    pub footprint_memory: i64,
    pub chunk_list_watermark: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    pub max_failed_job_count: usize,
    pub locality_timeout_secs: u64,
    pub max_data_size_per_job: i64,
    pub unavailable_chunk_policy: UnavailableChunkPolicy,
    /// Zero means no operation time limit.
    pub time_limit_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnavailableChunkPolicy {
    Fail,
    Skip,
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// When set, the operation state is saved and reloaded right after
    /// materialization to surface persistence bugs early.
    pub enable_cycle_after_materialization: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_loads() {
        let config = AppConfig::load().unwrap();
        assert!(config.controller.job_proxy_memory_reserve_quantile > 0.0);
        assert!(config.controller.job_proxy_memory_reserve_quantile <= 1.0);
        assert_eq!(
            config.operation.unavailable_chunk_policy,
            UnavailableChunkPolicy::Wait
        );
        assert!(config.controller.footprint_memory > 0);
    }
}
