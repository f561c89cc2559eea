use std::collections::HashMap;

use crate::error::{ControllerError, ControllerResult};
use crate::id::{CellTag, ChunkListId};

/// The storage-side allocator of chunk lists used to stage job output.
/// Scheduling requires allocation headroom up front; a heartbeat is
/// refused when the allocator cannot provide it.
pub trait ChunkListAllocator: Send {
    fn has_enough(&self, cell_tag: CellTag, count: usize) -> bool;
    fn extract(&mut self, cell_tag: CellTag) -> ControllerResult<ChunkListId>;
    fn release(&mut self, ids: Vec<ChunkListId>);
    /// Returns an extracted but unused chunk list for reuse.
    fn reinstall(&mut self, id: ChunkListId);
}

/// An in-memory allocator with a fixed per-cell budget. The budget models
/// the watermark-driven prefetching of the real storage collaborator.
#[derive(Debug)]
pub struct ChunkListPool {
    capacity: HashMap<CellTag, usize>,
    reusable: HashMap<CellTag, Vec<ChunkListId>>,
    allocated: HashMap<ChunkListId, CellTag>,
    next_id: u64,
}

impl ChunkListPool {
    pub fn new(capacity: HashMap<CellTag, usize>) -> Self {
        Self {
            capacity,
            reusable: HashMap::new(),
            allocated: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn with_uniform_capacity(cell_tags: &[CellTag], capacity: usize) -> Self {
        Self::new(
            cell_tags
                .iter()
                .map(|cell_tag| (*cell_tag, capacity))
                .collect(),
        )
    }

    fn remaining(&self, cell_tag: CellTag) -> usize {
        self.capacity.get(&cell_tag).copied().unwrap_or(0)
            + self.reusable.get(&cell_tag).map(Vec::len).unwrap_or(0)
    }
}

impl ChunkListAllocator for ChunkListPool {
    fn has_enough(&self, cell_tag: CellTag, count: usize) -> bool {
        self.remaining(cell_tag) >= count
    }

    fn extract(&mut self, cell_tag: CellTag) -> ControllerResult<ChunkListId> {
        if let Some(id) = self.reusable.get_mut(&cell_tag).and_then(Vec::pop) {
            self.allocated.insert(id, cell_tag);
            return Ok(id);
        }
        let budget = self.capacity.get_mut(&cell_tag).ok_or_else(|| {
            ControllerError::InternalError(format!("unknown cell tag {cell_tag}"))
        })?;
        if *budget == 0 {
            return Err(ControllerError::InternalError(format!(
                "chunk list budget exhausted for cell {cell_tag}"
            )));
        }
        *budget -= 1;
        let id = ChunkListId::from(self.next_id);
        self.next_id += 1;
        self.allocated.insert(id, cell_tag);
        Ok(id)
    }

    fn release(&mut self, ids: Vec<ChunkListId>) {
        for id in ids {
            self.allocated.remove(&id);
        }
    }

    fn reinstall(&mut self, id: ChunkListId) {
        if let Some(cell_tag) = self.allocated.remove(&id) {
            self.reusable.entry(cell_tag).or_default().push(id);
        }
    }
}
