use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::chunk_pool::{ChunkPoolInput, ChunkPoolOutput, ChunkStripe, ChunkStripeList};
use crate::id::{InputCookie, NodeId, OutputCookie};

/// An order-agnostic chunk pool: every registered stripe is one unit of
/// work. Extraction prefers units with data local to the requesting node;
/// failed, aborted, and lost units return to the pending set. Input and
/// output cookies address the same unit.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UnorderedChunkPool {
    units: BTreeMap<u64, Unit>,
    next_cookie: u64,
    finished: bool,
    /// Pending (extractable) data size per node holding a replica.
    locality: HashMap<NodeId, i64>,
    total_data_size: i64,
    pending_data_size: i64,
    completed_data_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum UnitState {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Serialize, Deserialize)]
struct Unit {
    stripe: ChunkStripe,
    state: UnitState,
    suspended: bool,
    stripe_list: Option<ChunkStripeList>,
    failure_count: u32,
}

impl Unit {
    fn is_extractable(&self) -> bool {
        self.state == UnitState::Pending && !self.suspended
    }
}

impl UnorderedChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// How many times the unit behind a cookie has been returned as failed.
    pub fn failure_count(&self, cookie: OutputCookie) -> u32 {
        self.units
            .get(&u64::from(cookie))
            .map(|unit| unit.failure_count)
            .unwrap_or(0)
    }

    /// The nodes currently holding replicas of extractable data. Used to
    /// rebuild locality indexes after a snapshot load.
    pub fn locality_nodes(&self) -> Vec<NodeId> {
        self.locality
            .iter()
            .filter(|(_, size)| **size > 0)
            .map(|(node_id, _)| *node_id)
            .collect()
    }

    fn add_locality(&mut self, stripe: &ChunkStripe, sign: i64) {
        for slice in &stripe.slices {
            for replica in &slice.replicas {
                *self.locality.entry(*replica).or_insert(0) += sign * slice.data_size;
            }
        }
    }

    fn make_pending(&mut self, cookie: u64) {
        let unit = match self.units.get_mut(&cookie) {
            Some(unit) => unit,
            None => return,
        };
        unit.state = UnitState::Pending;
        if !unit.suspended {
            let stripe = unit.stripe.clone();
            self.pending_data_size += stripe.data_size();
            self.add_locality(&stripe, 1);
        }
    }
}

impl ChunkPoolInput for UnorderedChunkPool {
    fn add(&mut self, stripe: ChunkStripe) -> InputCookie {
        debug_assert!(!self.finished);
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        self.total_data_size += stripe.data_size();
        self.pending_data_size += stripe.data_size();
        self.add_locality(&stripe, 1);
        self.units.insert(
            cookie,
            Unit {
                stripe,
                state: UnitState::Pending,
                suspended: false,
                stripe_list: None,
                failure_count: 0,
            },
        );
        InputCookie::from(cookie)
    }

    fn suspend(&mut self, cookie: InputCookie) {
        let cookie = u64::from(cookie);
        let unit = match self.units.get_mut(&cookie) {
            Some(unit) => unit,
            None => return,
        };
        if unit.suspended {
            return;
        }
        unit.suspended = true;
        if unit.state == UnitState::Pending {
            let stripe = unit.stripe.clone();
            self.pending_data_size -= stripe.data_size();
            self.add_locality(&stripe, -1);
        }
    }

    fn resume(&mut self, cookie: InputCookie, stripe: ChunkStripe) {
        let cookie = u64::from(cookie);
        let unit = match self.units.get_mut(&cookie) {
            Some(unit) => unit,
            None => return,
        };
        if !unit.suspended {
            return;
        }
        let old_size = unit.stripe.data_size();
        unit.suspended = false;
        unit.stripe = stripe.clone();
        self.total_data_size += stripe.data_size() - old_size;
        if self.units[&cookie].state == UnitState::Pending {
            self.pending_data_size += stripe.data_size();
            self.add_locality(&stripe, 1);
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl ChunkPoolOutput for UnorderedChunkPool {
    fn extract(&mut self, preferred_node: Option<NodeId>) -> Option<OutputCookie> {
        let mut best: Option<(u64, i64)> = None;
        for (&cookie, unit) in &self.units {
            if !unit.is_extractable() {
                continue;
            }
            let locality = preferred_node
                .map(|node_id| unit.stripe.locality(node_id))
                .unwrap_or(0);
            match best {
                Some((_, best_locality)) if locality <= best_locality => {}
                _ => best = Some((cookie, locality)),
            }
        }
        let (cookie, _) = best?;
        let unit = self.units.get_mut(&cookie)?;
        unit.state = UnitState::Running;
        unit.stripe_list = Some(ChunkStripeList::from_stripes(
            vec![unit.stripe.clone()],
            preferred_node,
        ));
        let stripe = unit.stripe.clone();
        self.pending_data_size -= stripe.data_size();
        self.add_locality(&stripe, -1);
        Some(OutputCookie::from(cookie))
    }

    fn stripe_list(&self, cookie: OutputCookie) -> &ChunkStripeList {
        self.units[&u64::from(cookie)]
            .stripe_list
            .as_ref()
            .expect("stripe list is only read for extracted cookies")
    }

    fn completed(&mut self, cookie: OutputCookie) {
        let cookie = u64::from(cookie);
        if let Some(unit) = self.units.get_mut(&cookie) {
            debug_assert_eq!(unit.state, UnitState::Running);
            unit.state = UnitState::Completed;
            self.completed_data_size += unit.stripe.data_size();
        }
    }

    fn failed(&mut self, cookie: OutputCookie) {
        let cookie = u64::from(cookie);
        if let Some(unit) = self.units.get_mut(&cookie) {
            unit.failure_count += 1;
        }
        self.make_pending(cookie);
    }

    fn aborted(&mut self, cookie: OutputCookie) {
        self.make_pending(u64::from(cookie));
    }

    fn lost(&mut self, cookie: OutputCookie) {
        let cookie = u64::from(cookie);
        if let Some(unit) = self.units.get_mut(&cookie) {
            debug_assert_eq!(unit.state, UnitState::Completed);
            self.completed_data_size -= unit.stripe.data_size();
        }
        self.make_pending(cookie);
    }

    fn pending_job_count(&self) -> i64 {
        self.units
            .values()
            .filter(|unit| unit.is_extractable())
            .count() as i64
    }

    fn total_job_count(&self) -> i64 {
        self.units.len() as i64
    }

    fn locality(&self, node_id: NodeId) -> i64 {
        self.locality.get(&node_id).copied().unwrap_or(0).max(0)
    }

    fn is_completed(&self) -> bool {
        self.finished
            && self
                .units
                .values()
                .all(|unit| unit.state == UnitState::Completed)
    }

    fn total_data_size(&self) -> i64 {
        self.total_data_size
    }

    fn pending_data_size(&self) -> i64 {
        self.pending_data_size
    }

    fn completed_data_size(&self) -> i64 {
        self.completed_data_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_pool::ChunkSlice;
    use crate::id::ChunkId;

    fn stripe(chunk: u64, data_size: i64, replicas: Vec<u64>) -> ChunkStripe {
        ChunkStripe::new(vec![ChunkSlice {
            chunk_id: ChunkId::from(chunk),
            data_size,
            row_count: data_size / 10,
            replicas: replicas.into_iter().map(NodeId::from).collect(),
        }])
    }

    #[test]
    fn test_extract_prefers_local_data() {
        let mut pool = UnorderedChunkPool::new();
        pool.add(stripe(1, 100, vec![1]));
        pool.add(stripe(2, 100, vec![2]));
        pool.finish();

        let cookie = pool.extract(Some(NodeId::from(2))).unwrap();
        let list = pool.stripe_list(cookie);
        assert_eq!(list.local_data_size, 100);
        assert_eq!(list.stripes[0].slices[0].chunk_id, ChunkId::from(2));
    }

    #[test]
    fn test_failed_unit_returns_to_pending() {
        let mut pool = UnorderedChunkPool::new();
        pool.add(stripe(1, 100, vec![1]));
        pool.finish();

        let cookie = pool.extract(None).unwrap();
        assert_eq!(pool.pending_job_count(), 0);
        pool.failed(cookie);
        assert_eq!(pool.pending_job_count(), 1);
        assert_eq!(pool.failure_count(cookie), 1);
        assert_eq!(pool.locality(NodeId::from(1)), 100);
        assert!(!pool.is_completed());

        let cookie = pool.extract(None).unwrap();
        pool.completed(cookie);
        assert!(pool.is_completed());
    }

    #[test]
    fn test_suspend_hides_unit_until_resume() {
        let mut pool = UnorderedChunkPool::new();
        let cookie = pool.add(stripe(1, 100, vec![1]));
        pool.suspend(cookie);
        assert_eq!(pool.pending_job_count(), 0);
        assert_eq!(pool.locality(NodeId::from(1)), 0);
        assert!(pool.extract(None).is_none());

        pool.resume(cookie, stripe(1, 100, vec![1]));
        assert_eq!(pool.pending_job_count(), 1);
        assert_eq!(pool.locality(NodeId::from(1)), 100);
    }

    #[test]
    fn test_resume_with_patched_stripe_adjusts_totals() {
        let mut pool = UnorderedChunkPool::new();
        let cookie = pool.add(stripe(1, 100, vec![1]));
        pool.suspend(cookie);
        pool.resume(cookie, stripe(1, 60, vec![1]));
        assert_eq!(pool.total_data_size(), 60);
        assert_eq!(pool.pending_data_size(), 60);
    }

    #[test]
    fn test_lost_unit_is_rescheduled_with_same_content() {
        let mut pool = UnorderedChunkPool::new();
        pool.add(stripe(1, 100, vec![1]));
        pool.finish();

        let cookie = pool.extract(None).unwrap();
        pool.completed(cookie);
        assert_eq!(pool.completed_data_size(), 100);

        pool.lost(cookie);
        assert_eq!(pool.completed_data_size(), 0);
        let cookie = pool.extract(None).unwrap();
        assert_eq!(
            pool.stripe_list(cookie).stripes[0].slices[0].chunk_id,
            ChunkId::from(1)
        );
    }
}
