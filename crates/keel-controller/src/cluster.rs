use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::NodeId;
use crate::resources::JobResources;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct ExecNodeDescriptor {
    pub descriptor: NodeDescriptor,
    pub resource_limits: JobResources,
}

/// The fleet view shared across operations. Reads take a point-in-time
/// snapshot; the lock is never held across scheduling work.
#[derive(Debug, Default)]
pub struct ExecNodeTracker {
    nodes: RwLock<HashMap<NodeId, ExecNodeDescriptor>>,
}

impl ExecNodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: ExecNodeDescriptor) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.descriptor.id, node);
        }
    }

    pub fn unregister(&self, node_id: NodeId) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.remove(&node_id);
        }
    }

    pub fn descriptors(&self) -> Vec<ExecNodeDescriptor> {
        match self.nodes.read() {
            Ok(nodes) => nodes.values().cloned().collect(),
            Err(_) => vec![],
        }
    }

    pub fn online_node_count(&self) -> usize {
        self.nodes.read().map(|nodes| nodes.len()).unwrap_or(0)
    }
}

/// The per-heartbeat view the scheduling engine works against: which node
/// is asking, its total resource limits, and the heartbeat time. The
/// engine never reads the wall clock itself.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub node: NodeDescriptor,
    /// The node's total resource limits, not its currently free share.
    pub resource_limits: JobResources,
    pub now: DateTime<Utc>,
}

impl SchedulingContext {
    pub fn new(node: NodeDescriptor, resource_limits: JobResources, now: DateTime<Utc>) -> Self {
        Self {
            node,
            resource_limits,
            now,
        }
    }
}
