use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{NodeId, TaskGroupId, TaskId};
use crate::resources::JobResources;

/// Candidate ordering key: cached minimum memory first, task id as the
/// tie-breaker. Order among equal-memory tasks is unspecified behavior
/// callers must not rely on.
pub type CandidateKey = (i64, TaskId);

/// Delayed ordering key: absolute wake deadline first.
pub type DelayedKey = (DateTime<Utc>, TaskId);

/// A set of tasks sharing a minimum resource floor. The floor lets a whole
/// group be skipped with one domination check per heartbeat.
///
/// The scheduling collections are rebuilt from task state after a snapshot
/// load, so only the floor is persisted.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub min_needed_resources: JobResources,
    /// Tasks eligible for fair-share (non-local) matching.
    #[serde(skip)]
    pub non_local_tasks: HashSet<TaskId>,
    /// Non-local tasks ordered by ascending cached minimum memory.
    #[serde(skip)]
    pub candidate_tasks: BTreeMap<CandidateKey, TaskId>,
    /// Tasks waiting out their locality timeout, ordered by wake deadline.
    #[serde(skip)]
    pub delayed_tasks: BTreeMap<DelayedKey, TaskId>,
    /// Node id to tasks with positive locality on that node.
    #[serde(skip)]
    pub node_id_to_tasks: HashMap<NodeId, HashSet<TaskId>>,
}

impl TaskGroup {
    pub fn new(id: TaskGroupId, min_needed_resources: JobResources) -> Self {
        Self {
            id,
            min_needed_resources,
            non_local_tasks: HashSet::new(),
            candidate_tasks: BTreeMap::new(),
            delayed_tasks: BTreeMap::new(),
            node_id_to_tasks: HashMap::new(),
        }
    }

    pub fn insert_candidate(&mut self, min_memory: i64, task_id: TaskId) {
        self.candidate_tasks.insert((min_memory, task_id), task_id);
    }

    pub fn remove_candidate(&mut self, min_memory: i64, task_id: TaskId) {
        self.candidate_tasks.remove(&(min_memory, task_id));
    }

    pub fn insert_delayed(&mut self, deadline: DateTime<Utc>, task_id: TaskId) {
        self.delayed_tasks.insert((deadline, task_id), task_id);
    }

    pub fn add_locality_entry(&mut self, node_id: NodeId, task_id: TaskId) -> bool {
        self.node_id_to_tasks
            .entry(node_id)
            .or_default()
            .insert(task_id)
    }

    pub fn remove_locality_entry(&mut self, node_id: NodeId, task_id: TaskId) {
        if let Some(tasks) = self.node_id_to_tasks.get_mut(&node_id) {
            tasks.remove(&task_id);
        }
    }
}
