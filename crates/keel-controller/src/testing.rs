use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_common::config::AppConfig;

use crate::chunk_list::ChunkListPool;
use crate::chunk_pool::{ChunkSlice, ChunkStripe};
use crate::cluster::{ExecNodeDescriptor, ExecNodeTracker, NodeDescriptor, SchedulingContext};
use crate::id::{ChunkId, NodeId, OperationId};
use crate::master::InMemoryMaster;
use crate::operation::controller::OperationController;
use crate::operation::job::{JobType, UserJobSpec};
use crate::operation::spec::{OperationSpec, TaskDefinition};
use crate::operation::task::TaskProfile;
use crate::resources::JobResources;

/// Test config with small, readable memory numbers.
pub(crate) fn test_config() -> AppConfig {
    let mut config = AppConfig::load().unwrap();
    config.controller.footprint_memory = 10;
    config.controller.safe_online_node_count = 1;
    config.operation.locality_timeout_secs = 0;
    config
}

pub(crate) fn stripe(chunk: u64, data_size: i64, replicas: &[u64]) -> ChunkStripe {
    ChunkStripe::new(vec![ChunkSlice {
        chunk_id: ChunkId::from(chunk),
        data_size,
        row_count: data_size / 10,
        replicas: replicas.iter().copied().map(NodeId::from).collect(),
    }])
}

pub(crate) fn profile(job_type: JobType) -> TaskProfile {
    TaskProfile {
        job_type,
        user_job: None,
        intermediate_output: false,
        input_locality: true,
        locality_timeout: None,
        cpu: 1.0,
        job_proxy_memory: 90,
        network: 0,
    }
}

pub(crate) fn user_job(memory_limit: i64, reserve_factor: f64) -> UserJobSpec {
    UserJobSpec {
        command: "cat".to_string(),
        memory_limit,
        memory_reserve_factor: reserve_factor,
    }
}

pub(crate) fn definition(
    name: &str,
    profile: TaskProfile,
    stripes: Vec<ChunkStripe>,
) -> TaskDefinition {
    TaskDefinition {
        name: name.to_string(),
        profile,
        stripes,
        downstream: None,
    }
}

pub(crate) fn spec(tasks: Vec<TaskDefinition>) -> OperationSpec {
    OperationSpec {
        title: "test operation".to_string(),
        tasks,
        output_cell_tags: vec![0],
        max_failed_job_count: None,
        time_limit: None,
        max_data_size_per_job: None,
        unavailable_chunk_policy: None,
        row_count_limit: None,
    }
}

pub(crate) fn node_tracker(nodes: &[(u64, JobResources)]) -> Arc<ExecNodeTracker> {
    let tracker = ExecNodeTracker::new();
    for (id, resource_limits) in nodes {
        tracker.register(ExecNodeDescriptor {
            descriptor: NodeDescriptor {
                id: NodeId::from(*id),
                address: format!("node-{id}:9012"),
            },
            resource_limits: *resource_limits,
        });
    }
    Arc::new(tracker)
}

pub(crate) fn big_node_limits() -> JobResources {
    JobResources::new(64.0, 1 << 40, 64, 1 << 30)
}

pub(crate) fn context(node: u64, now: DateTime<Utc>) -> SchedulingContext {
    SchedulingContext::new(
        NodeDescriptor {
            id: NodeId::from(node),
            address: format!("node-{node}:9012"),
        },
        big_node_limits(),
        now,
    )
}

pub(crate) struct Fixture {
    pub controller: OperationController,
    pub master: Arc<InMemoryMaster>,
    pub nodes: Arc<ExecNodeTracker>,
}

/// A controller driven through prepare and materialize, ready to take
/// heartbeats.
pub(crate) async fn running_controller(spec: OperationSpec, config: AppConfig) -> Fixture {
    running_controller_with_chunk_lists(spec, config, 64).await
}

pub(crate) async fn running_controller_with_chunk_lists(
    spec: OperationSpec,
    config: AppConfig,
    chunk_list_capacity: usize,
) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let master = Arc::new(InMemoryMaster::new());
    let nodes = node_tracker(&[(1, big_node_limits()), (2, big_node_limits())]);
    let chunk_lists = Box::new(ChunkListPool::with_uniform_capacity(
        &[0, 1],
        chunk_list_capacity,
    ));
    let mut controller = OperationController::new(
        OperationId::from(1),
        spec,
        &config,
        chunk_lists,
        master.clone(),
        nodes.clone(),
    );
    controller.initialize().unwrap();
    controller.prepare().await.unwrap();
    controller.materialize().unwrap();
    Fixture {
        controller,
        master,
        nodes,
    }
}
