use mpt_lib::Hash;
use std::collections::HashMap;
use std::time::Duration;

/// Default simulated network latency per remote fetch.
pub const DEFAULT_FETCH_LATENCY: Duration = Duration::from_millis(20);

/// Default per-fetch deadline. Every fetch resolves within bounded time.
pub const DEFAULT_FETCH_DEADLINE: Duration = Duration::from_secs(2);

/// Deterministically silences a fraction of the simulated peers to model
/// offline or Byzantine nodes: a caller id is silent when
/// `id % ratio_base < round(ratio * ratio_base)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilentPeerPolicy {
    pub ratio: f64,
    pub ratio_base: u32,
}

impl SilentPeerPolicy {
    pub fn new(ratio: f64, ratio_base: u32) -> Self {
        Self { ratio, ratio_base }
    }

    pub fn disabled() -> Self {
        Self {
            ratio: 0.0,
            ratio_base: 32,
        }
    }

    pub fn threshold(&self) -> u32 {
        (self.ratio * self.ratio_base as f64).round() as u32
    }

    /// A fetch without a caller id is never silenced.
    pub fn is_silent(&self, caller_id: Option<u32>) -> bool {
        match caller_id {
            Some(id) => id % self.ratio_base < self.threshold(),
            None => false,
        }
    }
}

impl Default for SilentPeerPolicy {
    fn default() -> Self {
        Self {
            ratio: 0.3,
            ratio_base: 32,
        }
    }
}

/// In-process stand-in for the remote peer set: holds the chunks the
/// other partitions would serve, applies the silent-peer policy and a
/// fixed per-fetch latency.
pub struct RemotePeerSim {
    chunks: HashMap<Hash, Vec<u8>>,
    pub policy: SilentPeerPolicy,
    pub latency: Duration,
}

impl RemotePeerSim {
    pub fn new(policy: SilentPeerPolicy) -> Self {
        Self {
            chunks: HashMap::new(),
            policy,
            latency: DEFAULT_FETCH_LATENCY,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert_chunk(&mut self, root: Hash, data: Vec<u8>) {
        self.chunks.insert(root, data);
    }

    pub fn remove_chunk(&mut self, root: &Hash) {
        self.chunks.remove(root);
    }

    pub fn is_silent(&self, caller_id: Option<u32>) -> bool {
        self.policy.is_silent(caller_id)
    }

    /// Fetch a chunk as the given caller. Silent peers answer with absence
    /// after the same latency as a real answer.
    pub async fn fetch(&self, target: &Hash, caller_id: Option<u32>) -> Option<Vec<u8>> {
        tokio::time::sleep(self.latency).await;
        if self.is_silent(caller_id) {
            debug!("RemotePeerSim: caller {:?} silenced for {}", caller_id, target);
            return None;
        }
        self.chunks.get(target).cloned()
    }
}
