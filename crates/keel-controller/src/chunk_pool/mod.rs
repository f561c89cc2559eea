mod unordered;

use serde::{Deserialize, Serialize};
pub use unordered::UnorderedChunkPool;

use crate::id::{ChunkId, InputCookie, NodeId, OutputCookie};

/// One contiguous slice of an input chunk, together with the nodes holding
/// a replica of it. Data sizes and row counts are metadata only; the
/// scheduler never inspects the data itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSlice {
    pub chunk_id: ChunkId,
    pub data_size: i64,
    pub row_count: i64,
    pub replicas: Vec<NodeId>,
}

/// A group of chunk slices registered with a pool as one unit of input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStripe {
    pub slices: Vec<ChunkSlice>,
}

impl ChunkStripe {
    pub fn new(slices: Vec<ChunkSlice>) -> Self {
        Self { slices }
    }

    pub fn data_size(&self) -> i64 {
        self.slices.iter().map(|slice| slice.data_size).sum()
    }

    pub fn row_count(&self) -> i64 {
        self.slices.iter().map(|slice| slice.row_count).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.slices.len()
    }

    /// The amount of stripe data local to the given node.
    pub fn locality(&self, node_id: NodeId) -> i64 {
        self.slices
            .iter()
            .filter(|slice| slice.replicas.contains(&node_id))
            .map(|slice| slice.data_size)
            .sum()
    }
}

/// The input of one extracted job: the stripes plus aggregated totals,
/// with the local share measured against the node the job was extracted
/// for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkStripeList {
    pub stripes: Vec<ChunkStripe>,
    pub total_data_size: i64,
    pub local_data_size: i64,
    pub total_row_count: i64,
    pub total_chunk_count: i64,
    pub local_chunk_count: i64,
    pub is_approximate: bool,
}

impl ChunkStripeList {
    pub fn from_stripes(stripes: Vec<ChunkStripe>, local_node: Option<NodeId>) -> Self {
        let mut list = ChunkStripeList {
            stripes,
            ..Default::default()
        };
        for stripe in &list.stripes {
            list.total_data_size += stripe.data_size();
            list.total_row_count += stripe.row_count();
            list.total_chunk_count += stripe.chunk_count() as i64;
            if let Some(node_id) = local_node {
                list.local_data_size += stripe.locality(node_id);
                list.local_chunk_count += stripe
                    .slices
                    .iter()
                    .filter(|slice| slice.replicas.contains(&node_id))
                    .count() as i64;
            }
        }
        list
    }
}

/// The feeding side of a chunk pool.
pub trait ChunkPoolInput {
    fn add(&mut self, stripe: ChunkStripe) -> InputCookie;
    fn suspend(&mut self, cookie: InputCookie);
    fn resume(&mut self, cookie: InputCookie, stripe: ChunkStripe);
    fn finish(&mut self);
}

/// The extracting side of a chunk pool.
pub trait ChunkPoolOutput {
    /// Extracts the next unit of work, preferring data local to the given
    /// node. Returns `None` when nothing is pending.
    fn extract(&mut self, preferred_node: Option<NodeId>) -> Option<OutputCookie>;
    fn stripe_list(&self, cookie: OutputCookie) -> &ChunkStripeList;
    fn completed(&mut self, cookie: OutputCookie);
    fn failed(&mut self, cookie: OutputCookie);
    fn aborted(&mut self, cookie: OutputCookie);
    fn lost(&mut self, cookie: OutputCookie);
    fn pending_job_count(&self) -> i64;
    fn total_job_count(&self) -> i64;
    fn locality(&self, node_id: NodeId) -> i64;
    fn is_completed(&self) -> bool;
    fn total_data_size(&self) -> i64;
    fn pending_data_size(&self) -> i64;
    fn completed_data_size(&self) -> i64;
}
