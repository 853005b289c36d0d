use crate::{key_to_nibbles, Hash, NodeCodec, NodeMetadata, NodeShape, StateError, StateResult};
use std::collections::HashMap;

/// One trie node as held by the canonical dataset.
#[derive(Debug, Clone, Default)]
pub struct TrieNodeRecord {
    pub raw: Vec<u8>,
    pub metadata: NodeMetadata,
}

/// Counters collected by a single trie-descent lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    /// Nodes resolved through the dataset.
    pub reads: u64,
    /// How many times the descent crossed a partition ownership boundary.
    pub partition_switches: u64,
}

/// Owns the canonical node dataset and the per-node version deltas.
///
/// A delta counts how many generations a child lags behind the parents
/// that reference it; it is incremented whenever an already-tracked child
/// is referenced by a newly processed parent. Delta changes are staged per
/// batch and merged at batch end, so partial-batch state is never
/// observable from outside.
pub struct VersionTracker<C: NodeCodec> {
    codec: C,
    deltas: HashMap<Hash, u32>,
    dataset: HashMap<Hash, TrieNodeRecord>,
    finalized: HashMap<Hash, bool>,
    current_version: u64,
}

impl<C: NodeCodec> VersionTracker<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            deltas: HashMap::new(),
            dataset: HashMap::new(),
            finalized: HashMap::new(),
            current_version: 0,
        }
    }

    pub fn set_version(&mut self, version: u64) {
        self.current_version = version;
    }

    pub fn version(&self) -> u64 {
        self.current_version
    }

    /// Ingest one snapshot batch.
    ///
    /// Stages: every incoming hash enters at delta 0; every reference from
    /// an incoming parent to an already-tracked child stages one increment
    /// for that child. The staged state merges in one step at the end.
    pub fn process_batch(&mut self, batch: &HashMap<Hash, Vec<u8>>) -> StateResult<()> {
        let mut staged_increments: HashMap<Hash, u32> = HashMap::new();
        let mut staged_new: Vec<Hash> = Vec::new();

        for (hash, raw) in batch {
            staged_new.push(*hash);
            let children = match self.codec.children(raw) {
                Ok(children) => children,
                Err(e) => {
                    warn!("VersionTracker: skip undecodable node {}: {}", hash, e);
                    continue;
                }
            };
            for child in children {
                // Only children tracked before this batch age.
                if self.deltas.contains_key(&child) {
                    *staged_increments.entry(child).or_insert(0) += 1;
                }
            }
        }

        // Merge point: nothing above touched the canonical maps.
        for (child, count) in staged_increments {
            if let Some(delta) = self.deltas.get_mut(&child) {
                *delta += count;
            }
        }
        for hash in staged_new {
            self.deltas.entry(hash).or_insert(0);
            let raw = batch[&hash].clone();
            self.dataset.insert(
                hash,
                TrieNodeRecord {
                    raw,
                    metadata: NodeMetadata::default(),
                },
            );
            self.finalized.insert(hash, false);
        }
        Ok(())
    }

    pub fn delta(&self, hash: &Hash) -> Option<u32> {
        self.deltas.get(hash).copied()
    }

    pub fn delta_or_zero(&self, hash: &Hash) -> u32 {
        self.delta(hash).unwrap_or(0)
    }

    pub fn record(&self, hash: &Hash) -> Option<&TrieNodeRecord> {
        self.dataset.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.dataset.contains_key(hash)
    }

    pub fn is_finalized(&self, hash: &Hash) -> bool {
        self.finalized.get(hash).copied().unwrap_or(false)
    }

    /// Populate a node's metadata. Allowed exactly once per node; recovery
    /// never calls this.
    pub fn finalize_metadata(&mut self, hash: &Hash, metadata: NodeMetadata) -> StateResult<()> {
        if self.is_finalized(hash) {
            return Err(StateError::InvalidState(format!(
                "metadata already finalized for {}",
                hash
            )));
        }
        let record = self.dataset.get_mut(hash).ok_or_else(|| {
            StateError::NotFound(format!("node {} not in dataset", hash))
        })?;
        record.metadata = metadata;
        self.finalized.insert(*hash, true);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &Hash> {
        self.dataset.keys()
    }

    /// Snapshot of every finalized node's metadata, in the shape the
    /// storage commit expects.
    pub fn metadata_index(&self) -> HashMap<Hash, NodeMetadata> {
        self.dataset
            .iter()
            .filter(|(hash, _)| self.is_finalized(hash))
            .map(|(hash, record)| (*hash, record.metadata))
            .collect()
    }

    /// Nibble-path lookup of `key` under `root`, descending through the
    /// dataset instead of a live trie. Used to validate reconstructed
    /// content.
    ///
    /// Returns `None` when the entry does not exist or a referenced node is
    /// missing from the dataset; a found-but-empty value is `Some(vec![])`.
    pub fn lookup(&self, root: &Hash, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        Ok(self.lookup_with_stats(root, key)?.0)
    }

    pub fn lookup_with_stats(
        &self,
        root: &Hash,
        key: &[u8],
    ) -> StateResult<(Option<Vec<u8>>, LookupStats)> {
        let nibbles = key_to_nibbles(key);
        let mut pos = 0usize;
        let mut current = *root;
        let mut stats = LookupStats::default();
        let mut current_partition: Option<u8> = None;

        loop {
            let record = match self.dataset.get(&current) {
                Some(record) => record,
                None => return Ok((None, stats)),
            };
            stats.reads += 1;
            let owner = record.metadata.owner_partition;
            if current_partition.is_some() && current_partition != Some(owner) {
                stats.partition_switches += 1;
            }
            current_partition = Some(owner);

            match self.codec.shape(&record.raw)? {
                NodeShape::Leaf => {
                    let path = self.codec.path_nibbles(&record.raw)?;
                    return if nibbles[pos..] == path[..] {
                        Ok((self.codec.value(&record.raw)?, stats))
                    } else {
                        Ok((None, stats))
                    };
                }
                NodeShape::Extension => {
                    let path = self.codec.path_nibbles(&record.raw)?;
                    if nibbles[pos..].starts_with(&path) {
                        pos += path.len();
                        current = self.codec.extension_child(&record.raw)?;
                    } else {
                        return Ok((None, stats));
                    }
                }
                NodeShape::Branch => {
                    if pos == nibbles.len() {
                        return Ok((self.codec.value(&record.raw)?, stats));
                    }
                    match self.codec.branch_child(&record.raw, nibbles[pos])? {
                        Some(child) => {
                            pos += 1;
                            current = child;
                        }
                        None => return Ok((None, stats)),
                    }
                }
            }
        }
    }
}
