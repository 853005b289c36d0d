use crate::{Codec, NodeStore, RemotePeerSim, DEFAULT_FETCH_DEADLINE};
use mpt_lib::{
    format_size, ChunkMerkleIndex, Hash, NodeCodec, OpLog, StateError, StateResult, VersionTracker,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Narrow a fetched chunk to the window `[offset, offset + len)`:
/// `offset` zero bytes, then whatever the chunk holds in the window, then
/// zero padding for any shortfall. The output is always exactly
/// `offset + len` bytes, even when `offset` exceeds the chunk length.
pub fn slice_block(input: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; offset + len];
    if offset < input.len() {
        let end = input.len().min(offset + len);
        out[offset..end].copy_from_slice(&input[offset..end]);
    }
    out
}

fn extract_range(decoded: &[u8], offset: usize, len: usize) -> Vec<u8> {
    slice_block(decoded, offset, len)[offset..].to_vec()
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryOptions {
    /// Narrow every fetched block to the target's byte window before
    /// decoding instead of decoding whole chunks.
    pub slice_mode: bool,
    /// Keep escalating after a successful decode so every ancestor group
    /// gets exercised. Sequential path only.
    pub repeat_decode: bool,
    /// Upper bound on a single remote fetch.
    pub fetch_deadline: Duration,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            slice_mode: false,
            repeat_decode: false,
            fetch_deadline: DEFAULT_FETCH_DEADLINE,
        }
    }
}

/// Everything one recovery call needs, threaded explicitly: the dataset
/// handle, the per-snapshot chunk indexes, the stores, the codec and the
/// log sink. The dataset and indexes are read-only here.
pub struct RecoveryContext<'a, C: NodeCodec> {
    pub tracker: &'a VersionTracker<C>,
    pub indexes: &'a HashMap<u64, ChunkMerkleIndex>,
    pub store: &'a dyn NodeStore,
    pub peers: &'a RemotePeerSim,
    pub codec: &'a dyn Codec,
    pub oplog: Option<&'a OpLog>,
    pub options: RecoveryOptions,
}

impl<'a, C: NodeCodec> RecoveryContext<'a, C> {
    /// Fetch one chunk: local storage first, then the simulated remote
    /// peers. Silent peers answer with absence; so does a missed deadline.
    async fn read_chunk(&self, target: &Hash, caller_id: Option<u32>) -> Option<Vec<u8>> {
        if self.peers.is_silent(caller_id) {
            return None;
        }
        match self.store.lookup(target) {
            Ok(Some(bytes)) => return Some(bytes),
            Ok(None) => {}
            Err(e) => {
                warn!("recovery: local lookup failed for {}: {}", target, e);
            }
        }
        match tokio::time::timeout(self.options.fetch_deadline, self.peers.fetch(target, None))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("recovery: fetch deadline exceeded for {}", target);
                None
            }
        }
    }

    fn maybe_slice(&self, bytes: Vec<u8>, offset: usize, len: usize) -> Vec<u8> {
        if self.options.slice_mode && !bytes.is_empty() {
            slice_block(&bytes, offset, len)
        } else {
            bytes
        }
    }

    fn target_window(&self, target: &Hash) -> StateResult<(usize, usize, usize)> {
        let record = self
            .tracker
            .record(target)
            .ok_or_else(|| StateError::NotFound(format!("no metadata for node {}", target)))?;
        let meta = record.metadata;
        Ok((
            meta.offset as usize,
            meta.total_len() as usize,
            meta.owner_partition as usize,
        ))
    }

    fn index_for(&self, snapshot_version: u64) -> StateResult<&ChunkMerkleIndex> {
        self.indexes.get(&snapshot_version).ok_or_else(|| {
            StateError::NotFound(format!("no chunk index for snapshot {}", snapshot_version))
        })
    }

    fn log_decode(&self, blocks: &[Vec<u8>], parity_count: usize, started: Instant) {
        if let Some(oplog) = self.oplog {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let block_size = blocks.last().map(|b| b.len()).unwrap_or(0);
            oplog.append(&format!(
                "Decoding {} DC and {} PC, each {}, costing {:.3}ms",
                blocks.len() - parity_count,
                parity_count,
                format_size(block_size as u64),
                elapsed_ms
            ));
        }
    }

    /// Reconstruct the target node's chunk window by walking its coding
    /// groups outward, fetching members sequentially.
    pub async fn recover_target(&self, target: &Hash, snapshot_version: u64) -> StateResult<Vec<u8>> {
        let started = Instant::now();
        let (offset, len, partition) = self.target_window(target)?;
        let index = self.index_for(snapshot_version)?;
        let chunk_root = index.chunk_root(partition).ok_or_else(|| {
            StateError::NotFound(format!("no chunk for partition {}", partition))
        })?;

        let mut pool: HashMap<Hash, Vec<u8>> = HashMap::new();
        let mut recovered = None;

        for (ancestor, leaves) in index.find_ancestors_and_leaves(&chunk_root) {
            let parity: Vec<Hash> = index.parity_of(&ancestor).unwrap_or(&[]).to_vec();
            if parity.is_empty() {
                debug!("recovery: ancestor {} carries no coding group", ancestor);
                continue;
            }

            let mut raw_blocks = Vec::with_capacity(leaves.len() + parity.len());
            let mut fetched = 0usize;
            for member in leaves.iter().chain(parity.iter()) {
                // The missing chunk itself is never fetched; its slot stays
                // vacant.
                if *member == chunk_root {
                    raw_blocks.push(Vec::new());
                    continue;
                }
                let bytes = if let Some(cached) = pool.get(member) {
                    fetched += 1;
                    cached.clone()
                } else if let Some(bytes) = self.read_chunk(member, None).await {
                    pool.insert(*member, bytes.clone());
                    fetched += 1;
                    bytes
                } else {
                    Vec::new()
                };
                raw_blocks.push(self.maybe_slice(bytes, offset, len));
            }

            if fetched >= raw_blocks.len() - parity.len() {
                let target_slot = leaves.iter().position(|l| *l == chunk_root);
                let decoded = self.codec.decode(&raw_blocks, parity.len(), target_slot)?;
                let result = extract_range(&decoded, offset, len);
                self.log_decode(&raw_blocks, parity.len(), started);
                if self.options.repeat_decode {
                    recovered = Some(result);
                    continue;
                }
                return Ok(result);
            }
            debug!(
                "recovery: group {} below threshold ({} of {}), escalating",
                ancestor,
                fetched,
                raw_blocks.len() - parity.len()
            );
            if let Some(oplog) = self.oplog {
                oplog.append(&format!(
                    "Group below decode threshold, escalating past {}",
                    ancestor
                ));
            }
        }

        recovered.ok_or_else(|| {
            StateError::Unrecoverable(format!(
                "no ancestor group of {} met its decode threshold",
                target
            ))
        })
    }

    /// Parallel-fetch variant: every group member is requested
    /// concurrently; each simulated fetch carries its own caller id so the
    /// silent-peer policy applies per peer. Escalation is unchanged and
    /// stays sequential across groups.
    pub async fn recover_target_parallel(
        &self,
        target: &Hash,
        snapshot_version: u64,
    ) -> StateResult<Vec<u8>> {
        let started = Instant::now();
        let (offset, len, partition) = self.target_window(target)?;
        let index = self.index_for(snapshot_version)?;
        let chunk_root = index.chunk_root(partition).ok_or_else(|| {
            StateError::NotFound(format!("no chunk for partition {}", partition))
        })?;

        let pool: Mutex<HashMap<Hash, Vec<u8>>> = Mutex::new(HashMap::new());

        for (ancestor, leaves) in index.find_ancestors_and_leaves(&chunk_root) {
            let parity: Vec<Hash> = index.parity_of(&ancestor).unwrap_or(&[]).to_vec();
            if parity.is_empty() {
                continue;
            }

            let members: Vec<Hash> = leaves.iter().chain(parity.iter()).copied().collect();
            let success = AtomicUsize::new(0);
            let caller_base = index.locate_partition(&leaves[0]).unwrap_or(0) as u32;

            let fetches = members.iter().enumerate().map(|(i, member)| {
                let pool = &pool;
                let success = &success;
                let vacant = i < leaves.len() && *member == chunk_root;
                async move {
                    if vacant {
                        return Vec::new();
                    }
                    if let Some(cached) = pool.lock().await.get(member).cloned() {
                        success.fetch_add(1, Ordering::Relaxed);
                        return self.maybe_slice(cached, offset, len);
                    }
                    match self.read_chunk(member, Some(caller_base + i as u32)).await {
                        Some(bytes) => {
                            success.fetch_add(1, Ordering::Relaxed);
                            pool.lock().await.insert(*member, bytes.clone());
                            self.maybe_slice(bytes, offset, len)
                        }
                        None => Vec::new(),
                    }
                }
            });
            // join_all keeps member order, so the result array is already
            // index-addressed.
            let raw_blocks: Vec<Vec<u8>> = futures::future::join_all(fetches).await;

            let fetched = success.load(Ordering::Relaxed);
            if fetched >= raw_blocks.len() - parity.len() {
                let target_slot = leaves.iter().position(|l| *l == chunk_root);
                let decoded = self.codec.decode(&raw_blocks, parity.len(), target_slot)?;
                let result = extract_range(&decoded, offset, len);
                self.log_decode(&raw_blocks, parity.len(), started);
                return Ok(result);
            }
            debug!(
                "recovery: group {} below threshold ({} of {}), escalating",
                ancestor,
                fetched,
                raw_blocks.len() - parity.len()
            );
        }

        Err(StateError::Unrecoverable(format!(
            "no ancestor group of {} met its decode threshold",
            target
        )))
    }
}
