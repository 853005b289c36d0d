use crate::{Hash, NodeCodec, StateError, StateResult};
use rand::Rng;
use std::collections::{HashMap, VecDeque};

/// Assigns every node of a snapshot batch to one of N storage partitions,
/// balancing partitions by byte size rather than node count.
///
/// The traversal is breadth-first from the root until half of the
/// per-partition byte budget is allocated (spreading the shared, shallow
/// nodes across partitions), then depth-first over the remaining frontier.
/// The current partition is filled past its target before the partition
/// index advances; a node is never assigned twice.
pub struct Partitioner<C: NodeCodec> {
    codec: C,
    adjacency: HashMap<Hash, Vec<Hash>>,
    node_size: HashMap<Hash, usize>,
    total_bytes: usize,
    target_bytes: usize,
    partition_count: u8,
    current: usize,
    part_bytes: Vec<usize>,
    allocated_bytes: usize,
    assignment: HashMap<Hash, u8>,
}

impl<C: NodeCodec> Partitioner<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            adjacency: HashMap::new(),
            node_size: HashMap::new(),
            total_bytes: 0,
            target_bytes: 0,
            partition_count: 0,
            current: 0,
            part_bytes: Vec::new(),
            allocated_bytes: 0,
            assignment: HashMap::new(),
        }
    }

    /// Decode every node of the batch into the parent->children adjacency
    /// and record its byte size. Nodes that fail to decode are skipped with
    /// a warning, matching the per-node error absorption of batch ingest.
    pub fn ingest_batch(&mut self, batch: &HashMap<Hash, Vec<u8>>) {
        for (hash, raw) in batch {
            self.node_size.insert(*hash, raw.len());
            self.total_bytes += raw.len();
            match self.codec.children(raw) {
                Ok(children) => {
                    self.adjacency.insert(*hash, children);
                }
                Err(e) => {
                    warn!("Partitioner: skip undecodable node {}: {}", hash, e);
                }
            }
        }
    }

    /// Fix the partition count and the per-partition byte budget.
    pub fn init(&mut self, partition_count: u8) -> StateResult<()> {
        if partition_count == 0 {
            return Err(StateError::InvalidParam(
                "partition count must be positive".to_string(),
            ));
        }
        self.partition_count = partition_count;
        self.target_bytes = self.total_bytes / partition_count as usize;
        self.part_bytes = vec![0; partition_count as usize];
        debug!(
            "Partitioner: {} nodes, {} bytes, target {} bytes per partition",
            self.adjacency.len(),
            self.total_bytes,
            self.target_bytes
        );
        Ok(())
    }

    fn assign(&mut self, hash: Hash) {
        let size = self.node_size.get(&hash).copied().unwrap_or(0);
        self.assignment.insert(hash, self.current as u8);
        self.part_bytes[self.current] += size;
        self.allocated_bytes += size;
        // Fill past the target, then advance; the last partition absorbs
        // whatever remains.
        if self.part_bytes[self.current] >= self.target_bytes
            && self.current + 1 < self.partition_count as usize
        {
            self.current += 1;
        }
    }

    fn is_known(&self, hash: &Hash) -> bool {
        self.adjacency.contains_key(hash)
    }

    /// Size-balanced hybrid traversal from `root`.
    pub fn partition(&mut self, root: Hash) -> StateResult<()> {
        if self.partition_count == 0 {
            return Err(StateError::InvalidState(
                "init() must run before partition()".to_string(),
            ));
        }

        let mut frontier = VecDeque::new();
        frontier.push_back(root);

        // BFS phase: stop once half of one partition budget is allocated.
        while !frontier.is_empty() && self.allocated_bytes < self.target_bytes / 2 {
            let hash = frontier.pop_front().unwrap();
            if !self.is_known(&hash) || self.assignment.contains_key(&hash) {
                continue;
            }
            self.assign(hash);
            for child in &self.adjacency[&hash] {
                if self.is_known(child) {
                    frontier.push_back(*child);
                }
            }
        }

        debug!(
            "Partitioner: BFS phase done at {} bytes, switching to DFS",
            self.allocated_bytes
        );

        // DFS phase over the remaining frontier, explicit stack.
        while let Some(start) = frontier.pop_front() {
            let mut stack = vec![start];
            while let Some(hash) = stack.pop() {
                if !self.is_known(&hash) || self.assignment.contains_key(&hash) {
                    continue;
                }
                self.assign(hash);
                // Reverse push so the first child is explored first.
                for child in self.adjacency[&hash].iter().rev() {
                    stack.push(*child);
                }
            }
        }
        Ok(())
    }

    /// Uniform-random assignment over the same reachable set. Baseline for
    /// comparison only; recovery never consumes this mode.
    pub fn partition_baseline(&mut self, root: Hash, rng: &mut impl Rng) -> StateResult<()> {
        if self.partition_count == 0 {
            return Err(StateError::InvalidState(
                "init() must run before partition_baseline()".to_string(),
            ));
        }
        let mut frontier = VecDeque::new();
        frontier.push_back(root);
        while let Some(hash) = frontier.pop_front() {
            if !self.is_known(&hash) || self.assignment.contains_key(&hash) {
                continue;
            }
            let part = rng.gen_range(0..self.partition_count);
            let size = self.node_size.get(&hash).copied().unwrap_or(0);
            self.assignment.insert(hash, part);
            self.part_bytes[part as usize] += size;
            self.allocated_bytes += size;
            for child in &self.adjacency[&hash] {
                if self.is_known(child) {
                    frontier.push_back(*child);
                }
            }
        }
        Ok(())
    }

    pub fn assignment(&self) -> &HashMap<Hash, u8> {
        &self.assignment
    }

    pub fn into_assignment(self) -> HashMap<Hash, u8> {
        self.assignment
    }

    pub fn node_sizes(&self) -> &HashMap<Hash, usize> {
        &self.node_size
    }

    pub fn partition_count(&self) -> u8 {
        self.partition_count
    }

    pub fn partition_bytes(&self) -> &[usize] {
        &self.part_bytes
    }
}
