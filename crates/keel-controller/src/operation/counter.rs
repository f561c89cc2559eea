use serde::{Deserialize, Serialize};

/// Cumulative job accounting for one operation. `total` follows the chunk
/// pool estimates and may still grow while the operation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounter {
    pub total: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub aborted: i64,
    pub lost: i64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_total(&mut self, delta: i64) {
        self.total += delta;
    }

    pub fn start(&mut self, count: i64) {
        self.running += count;
    }

    pub fn completed(&mut self, count: i64) {
        self.running -= count;
        self.completed += count;
    }

    pub fn failed(&mut self, count: i64) {
        self.running -= count;
        self.failed += count;
    }

    pub fn aborted(&mut self, count: i64) {
        self.running -= count;
        self.aborted += count;
    }

    pub fn lost(&mut self, count: i64) {
        self.lost += count;
    }
}
