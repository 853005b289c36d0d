use crate::{
    format_size, ChildMetaRecord, Hash, NodeCodec, NodeMetadata, OpLog, StateError, StateResult,
    VersionTracker, CHILD_META_RECORD_SIZE,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// How the bottom-up build order is scheduled. Both strategies emit the
/// same canonical order (rounds, hash-sorted within a round) and therefore
/// byte-identical chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStrategy {
    /// Re-scan the pending set until a full pass makes no progress.
    RepeatedPass,
    /// Child->parent links with pending-child counts; ready nodes pop from
    /// a min-heap keyed by (round, hash).
    ReadyQueue,
}

/// Per-partition chunk buffers plus assembly accounting.
#[derive(Debug, Clone)]
pub struct AssemblyOutput {
    pub chunks: Vec<Vec<u8>>,
    /// Total bytes spent on embedded child-metadata blocks.
    pub meta_bytes: usize,
}

impl AssemblyOutput {
    pub fn log_chunk_sizes(&self, oplog: &OpLog) {
        for (i, chunk) in self.chunks.iter().enumerate() {
            oplog.append(&format!("Chunk {} {}", i, format_size(chunk.len() as u64)));
        }
    }

    pub fn storage_report(&self, parity_blocks: &HashMap<Hash, Vec<u8>>) -> StorageReport {
        let chunk_bytes: usize = self.chunks.iter().map(|c| c.len()).sum();
        StorageReport {
            state_bytes: chunk_bytes - self.meta_bytes,
            meta_bytes: self.meta_bytes,
            parity_bytes: parity_blocks.values().map(|p| p.len()).sum(),
        }
    }
}

/// Storage split between raw state, embedded child metadata and parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageReport {
    pub state_bytes: usize,
    pub meta_bytes: usize,
    pub parity_bytes: usize,
}

impl StorageReport {
    pub fn log(&self, oplog: &OpLog) {
        oplog.append(&format!(
            "State Size: {}, ExtraInfo Size: {}, Encoded Size: {}",
            format_size(self.state_bytes as u64),
            format_size(self.meta_bytes as u64),
            format_size(self.parity_bytes as u64)
        ));
    }
}

/// Serializes each partition's assigned nodes into one chunk buffer in
/// dependency order: a node is written only after every child it
/// references has finalized metadata, whichever partition or earlier
/// batch that child lives in.
pub struct ChunkAssembler<C: NodeCodec> {
    codec: C,
}

impl<C: NodeCodec> ChunkAssembler<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    pub fn run(
        &self,
        tracker: &mut VersionTracker<C>,
        assignment: &HashMap<Hash, u8>,
        partition_count: u8,
        strategy: AssemblyStrategy,
    ) -> StateResult<AssemblyOutput> {
        let mut pending: BTreeMap<Hash, Vec<Hash>> = BTreeMap::new();
        for (hash, part) in assignment {
            if *part >= partition_count {
                return Err(StateError::InvalidParam(format!(
                    "partition id {} out of range for {} partitions",
                    part, partition_count
                )));
            }
            if tracker.is_finalized(hash) {
                continue;
            }
            let record = tracker.record(hash).ok_or_else(|| {
                StateError::NotFound(format!("assigned node {} not in dataset", hash))
            })?;
            let children = self.codec.children(&record.raw)?;
            pending.insert(*hash, children);
        }

        let mut chunks = vec![Vec::new(); partition_count as usize];
        let mut meta_bytes = 0usize;

        match strategy {
            AssemblyStrategy::RepeatedPass => {
                self.run_repeated_pass(tracker, assignment, &mut pending, &mut chunks, &mut meta_bytes)?
            }
            AssemblyStrategy::ReadyQueue => {
                self.run_ready_queue(tracker, assignment, &pending, &mut chunks, &mut meta_bytes)?
            }
        }

        Ok(AssemblyOutput { chunks, meta_bytes })
    }

    fn run_repeated_pass(
        &self,
        tracker: &mut VersionTracker<C>,
        assignment: &HashMap<Hash, u8>,
        pending: &mut BTreeMap<Hash, Vec<Hash>>,
        chunks: &mut [Vec<u8>],
        meta_bytes: &mut usize,
    ) -> StateResult<()> {
        while !pending.is_empty() {
            // One full pass: everything whose children are all finalized.
            // BTreeMap iteration makes the within-round order the canonical
            // hash order.
            let ready: Vec<Hash> = pending
                .iter()
                .filter(|(_, children)| children.iter().all(|c| tracker.is_finalized(c)))
                .map(|(hash, _)| *hash)
                .collect();
            if ready.is_empty() {
                return Err(StateError::Structural(format!(
                    "assembly made no progress with {} nodes pending",
                    pending.len()
                )));
            }
            for hash in ready {
                let children = pending.remove(&hash).unwrap();
                self.build_node(tracker, assignment, hash, &children, chunks, meta_bytes)?;
            }
        }
        Ok(())
    }

    fn run_ready_queue(
        &self,
        tracker: &mut VersionTracker<C>,
        assignment: &HashMap<Hash, u8>,
        pending: &BTreeMap<Hash, Vec<Hash>>,
        chunks: &mut [Vec<u8>],
        meta_bytes: &mut usize,
    ) -> StateResult<()> {
        let mut pending_count: HashMap<Hash, usize> = HashMap::new();
        let mut parents: HashMap<Hash, Vec<Hash>> = HashMap::new();
        let mut rounds: HashMap<Hash, u64> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u64, Hash)>> = BinaryHeap::new();

        for (hash, children) in pending {
            // A child can occupy two branch slots; it blocks its parent once.
            let waiting: HashSet<Hash> = children
                .iter()
                .filter(|c| !tracker.is_finalized(c))
                .copied()
                .collect();
            for child in &waiting {
                parents.entry(*child).or_default().push(*hash);
            }
            if waiting.is_empty() {
                heap.push(Reverse((0, *hash)));
            }
            pending_count.insert(*hash, waiting.len());
        }

        let mut built = 0usize;
        while let Some(Reverse((round, hash))) = heap.pop() {
            let children = &pending[&hash];
            self.build_node(tracker, assignment, hash, children, chunks, meta_bytes)?;
            built += 1;

            if let Some(parent_list) = parents.get(&hash) {
                for parent in parent_list {
                    let count = pending_count.get_mut(parent).unwrap();
                    *count -= 1;
                    let parent_round = rounds.entry(*parent).or_insert(0);
                    *parent_round = (*parent_round).max(round + 1);
                    if *count == 0 {
                        heap.push(Reverse((*parent_round, *parent)));
                    }
                }
            }
        }

        if built != pending.len() {
            return Err(StateError::Structural(format!(
                "assembly made no progress with {} nodes pending",
                pending.len() - built
            )));
        }
        Ok(())
    }

    fn build_node(
        &self,
        tracker: &mut VersionTracker<C>,
        assignment: &HashMap<Hash, u8>,
        hash: Hash,
        children: &[Hash],
        chunks: &mut [Vec<u8>],
        meta_bytes: &mut usize,
    ) -> StateResult<()> {
        let part = *assignment.get(&hash).ok_or_else(|| {
            StateError::InvalidParam(format!("node {} has no partition assignment", hash))
        })?;
        let raw = tracker
            .record(&hash)
            .ok_or_else(|| StateError::NotFound(format!("node {} not in dataset", hash)))?
            .raw
            .clone();
        if raw.len() > 0x00FF_FFFF {
            return Err(StateError::InvalidData(format!(
                "node value exceeds 24-bit length: {}",
                raw.len()
            )));
        }

        // Collect child records before touching the buffer so a structural
        // failure leaves the chunk untouched.
        let mut child_records = Vec::with_capacity(children.len());
        for child in children {
            let child_record = tracker.record(child).ok_or_else(|| {
                StateError::Structural(format!(
                    "node {} references {} which is not in the dataset",
                    hash, child
                ))
            })?;
            let delta = tracker.delta_or_zero(child).min(u16::MAX as u32) as u16;
            child_records.push(ChildMetaRecord::from_metadata(&child_record.metadata, delta));
        }

        let block_len = child_records.len() * CHILD_META_RECORD_SIZE;
        if block_len > u8::MAX as usize {
            return Err(StateError::InvalidData(format!(
                "child metadata block exceeds 8-bit length: {}",
                block_len
            )));
        }

        let buffer = &mut chunks[part as usize];
        let offset = buffer.len() as u32;
        buffer.extend_from_slice(&raw);
        for record in &child_records {
            buffer.extend_from_slice(&record.encode());
        }
        *meta_bytes += block_len;

        let metadata = NodeMetadata::new(offset, raw.len() as u32, block_len as u8, part);
        tracker.finalize_metadata(&hash, metadata)
    }
}
