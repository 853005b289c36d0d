use crate::{
    MemoryNodeStore, NodeStore, RecoveryContext, RecoveryOptions, RemotePeerSim, SilentPeerPolicy,
    XorParityCodec,
};
use mpt_lib::{
    AssemblyStrategy, BinaryNodeCodec, ChunkAssembler, ChunkMerkleIndex, Hash, NodeCodec,
    Partitioner, VersionTracker, BRANCH_SLOTS,
};
use std::collections::HashMap;
use std::time::Duration;

const PARTITIONS: u8 = 4;

fn init_log() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
    );
}

struct World {
    tracker: VersionTracker<BinaryNodeCodec>,
    indexes: HashMap<u64, ChunkMerkleIndex>,
    chunks: Vec<Vec<u8>>,
    assignment: HashMap<Hash, u8>,
    root: Hash,
    leaves: Vec<Hash>,
    parity_blocks: HashMap<Hash, Vec<u8>>,
}

/// Build one snapshot end to end: a branch root over twelve fat leaves,
/// partitioned over four partitions, assembled, indexed, and with an XOR
/// parity block attached to the root coding group.
fn build_world() -> World {
    init_log();
    let mut batch = HashMap::new();
    let mut leaves = Vec::new();
    let mut slots: [Option<Hash>; BRANCH_SLOTS] = Default::default();
    for i in 0u8..12 {
        let raw = BinaryNodeCodec::encode_leaf(&[0x5], &vec![i + 1; 100]);
        let hash = Hash::of(&raw);
        batch.insert(hash, raw);
        slots[i as usize] = Some(hash);
        leaves.push(hash);
    }
    let root_raw = BinaryNodeCodec::encode_branch(&slots, None);
    let root = Hash::of(&root_raw);
    batch.insert(root, root_raw);

    let mut tracker = VersionTracker::new(BinaryNodeCodec);
    tracker.set_version(1);
    tracker.process_batch(&batch).unwrap();

    let mut partitioner = Partitioner::new(BinaryNodeCodec);
    partitioner.ingest_batch(&batch);
    partitioner.init(PARTITIONS).unwrap();
    partitioner.partition(root).unwrap();
    let assignment = partitioner.into_assignment();

    let assembler = ChunkAssembler::new(BinaryNodeCodec);
    let output = assembler
        .run(&mut tracker, &assignment, PARTITIONS, AssemblyStrategy::ReadyQueue)
        .unwrap();

    let mut index = ChunkMerkleIndex::build(&output.chunks).unwrap();

    // Fabricate the root coding group: one XOR parity over all chunks.
    let parity = XorParityCodec::new().encode(&output.chunks);
    let parity_hash = Hash::of(&parity);
    let root_hash = index.root_hash();
    index.set_parity(&root_hash, vec![parity_hash]).unwrap();
    let mut parity_blocks = HashMap::new();
    parity_blocks.insert(parity_hash, parity);

    let mut indexes = HashMap::new();
    indexes.insert(tracker.version(), index);

    World {
        tracker,
        indexes,
        chunks: output.chunks,
        assignment,
        root,
        leaves,
        parity_blocks,
    }
}

/// A peer set holding every chunk except the lost partition's, plus the
/// parity blocks.
fn peers_without(world: &World, lost_partition: usize) -> RemotePeerSim {
    let index = &world.indexes[&1];
    let mut peers =
        RemotePeerSim::new(SilentPeerPolicy::disabled()).with_latency(Duration::ZERO);
    for (partition, chunk) in world.chunks.iter().enumerate() {
        if partition != lost_partition {
            peers.insert_chunk(index.chunk_root(partition).unwrap(), chunk.clone());
        }
    }
    for (hash, block) in &world.parity_blocks {
        peers.insert_chunk(*hash, block.clone());
    }
    peers
}

/// Pick a leaf owned by a partition other than the root's, so recovery has
/// to cross partitions.
fn pick_target(world: &World) -> (Hash, usize) {
    let root_partition = world
        .tracker
        .record(&world.root)
        .unwrap()
        .metadata
        .owner_partition;
    let target = *world
        .leaves
        .iter()
        .find(|leaf| {
            world.tracker.record(leaf).unwrap().metadata.owner_partition != root_partition
        })
        .unwrap();
    let partition = world.tracker.record(&target).unwrap().metadata.owner_partition;
    (target, partition as usize)
}

fn expected_window(world: &World, target: &Hash) -> Vec<u8> {
    let meta = world.tracker.record(target).unwrap().metadata;
    let chunk = &world.chunks[meta.owner_partition as usize];
    chunk[meta.offset as usize..(meta.offset + meta.total_len()) as usize].to_vec()
}

#[tokio::test]
async fn test_sequential_recovery_reconstructs_target_window() {
    let world = build_world();
    let (target, partition) = pick_target(&world);
    let peers = peers_without(&world, partition);
    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let recovered = ctx.recover_target(&target, 1).await.unwrap();
    assert_eq!(recovered, expected_window(&world, &target));

    // The window starts with the node's raw encoding; the value survives.
    let meta = world.tracker.record(&target).unwrap().metadata;
    let raw = &recovered[..meta.data_len() as usize];
    assert_eq!(raw, &world.tracker.record(&target).unwrap().raw[..]);
    let value = BinaryNodeCodec.value(raw).unwrap().unwrap();
    assert_eq!(value.len(), 100);
}

#[tokio::test]
async fn test_parallel_recovery_matches_sequential() {
    let world = build_world();
    let (target, partition) = pick_target(&world);
    let peers = peers_without(&world, partition);
    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let sequential = ctx.recover_target(&target, 1).await.unwrap();
    let parallel = ctx.recover_target_parallel(&target, 1).await.unwrap();
    assert_eq!(sequential, parallel);
}

#[tokio::test]
async fn test_slice_mode_recovers_the_same_window() {
    let world = build_world();
    let (target, partition) = pick_target(&world);
    let peers = peers_without(&world, partition);
    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions {
            slice_mode: true,
            ..Default::default()
        },
    };

    let recovered = ctx.recover_target(&target, 1).await.unwrap();
    assert_eq!(recovered, expected_window(&world, &target));
}

#[tokio::test]
async fn test_local_store_serves_before_remote() {
    let world = build_world();
    let (target, _) = pick_target(&world);

    // Peers know nothing; the snapshot is committed locally instead. The
    // target's own chunk is never fetched, so its local presence is moot.
    let peers = RemotePeerSim::new(SilentPeerPolicy::disabled()).with_latency(Duration::ZERO);
    let store = MemoryNodeStore::new();
    store
        .commit(
            &world.chunks,
            &world.assignment,
            &world.tracker.metadata_index(),
        )
        .unwrap();
    for (hash, block) in &world.parity_blocks {
        store.insert_chunk(*hash, block.clone());
    }
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let recovered = ctx.recover_target(&target, 1).await.unwrap();
    assert_eq!(recovered, expected_window(&world, &target));
}

#[tokio::test]
async fn test_escalation_past_starved_subtree_group() {
    let mut world = build_world();
    let (target, partition) = pick_target(&world);
    let index = world.indexes.get_mut(&1).unwrap();

    // Attach a parity block to the target's immediate parent group but
    // never serve it, so the tight group stays below threshold and
    // recovery must escalate to the root group.
    let chunk_root = index.chunk_root(partition).unwrap();
    let groups = index.find_ancestors_and_leaves(&chunk_root);
    let (tight_ancestor, _) = groups[0].clone();
    index
        .set_parity(&tight_ancestor, vec![Hash::of(b"unserved parity")])
        .unwrap();

    let peers = peers_without(&world, partition);
    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let recovered = ctx.recover_target(&target, 1).await.unwrap();
    assert_eq!(recovered, expected_window(&world, &target));
}

#[tokio::test]
async fn test_two_lost_chunks_are_unrecoverable() {
    let world = build_world();
    let (target, partition) = pick_target(&world);
    let index = &world.indexes[&1];

    // Remove a second data chunk from the peer set: the root group can no
    // longer reach its threshold with a single parity block.
    let mut peers = peers_without(&world, partition);
    let other = (0..PARTITIONS as usize).find(|p| *p != partition).unwrap();
    peers.remove_chunk(&index.chunk_root(other).unwrap());

    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let err = ctx.recover_target(&target, 1).await.unwrap_err();
    assert!(err.is_unrecoverable(), "{:?}", err);
}

#[tokio::test]
async fn test_all_groups_without_parity_are_unrecoverable() {
    let mut world = build_world();
    let (target, partition) = pick_target(&world);
    let index = world.indexes.get_mut(&1).unwrap();
    let root_hash = index.root_hash();
    index.set_parity(&root_hash, Vec::new()).unwrap();

    let peers = peers_without(&world, partition);
    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let err = ctx.recover_target(&target, 1).await.unwrap_err();
    assert!(err.is_unrecoverable(), "{:?}", err);
}

#[tokio::test]
async fn test_silent_peers_starve_parallel_recovery() {
    let world = build_world();
    let (target, partition) = pick_target(&world);

    // Caller ids fan out from the group's first partition, so with ratio
    // 0.3 over 32 every caller of the five-member root group is silenced.
    let mut peers = peers_without(&world, partition);
    peers.policy = SilentPeerPolicy::new(0.3, 32);
    peers.latency = Duration::ZERO;

    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let err = ctx.recover_target_parallel(&target, 1).await.unwrap_err();
    assert!(err.is_unrecoverable(), "{:?}", err);

    // The sequential path carries no caller id and is never silenced.
    let recovered = ctx.recover_target(&target, 1).await.unwrap();
    assert_eq!(recovered, expected_window(&world, &target));
}

#[tokio::test]
async fn test_repeat_decode_exercises_every_group() {
    let mut world = build_world();
    let (target, partition) = pick_target(&world);
    let index = world.indexes.get_mut(&1).unwrap();

    // Give the tight group a real, served parity block so both it and the
    // root group decode.
    let chunk_root = index.chunk_root(partition).unwrap();
    let groups = index.find_ancestors_and_leaves(&chunk_root);
    let (tight_ancestor, tight_leaves) = groups[0].clone();
    let tight_data: Vec<Vec<u8>> = tight_leaves
        .iter()
        .map(|root| index.chunk_data(root).unwrap().to_vec())
        .collect();
    let tight_parity = XorParityCodec::new().encode(&tight_data);
    let tight_parity_hash = Hash::of(&tight_parity);
    index
        .set_parity(&tight_ancestor, vec![tight_parity_hash])
        .unwrap();
    world.parity_blocks.insert(tight_parity_hash, tight_parity);

    let peers = peers_without(&world, partition);
    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions {
            repeat_decode: true,
            ..Default::default()
        },
    };

    let recovered = ctx.recover_target(&target, 1).await.unwrap();
    assert_eq!(recovered, expected_window(&world, &target));
}

#[tokio::test]
async fn test_unknown_target_is_not_found() {
    let world = build_world();
    let (_, partition) = pick_target(&world);
    let peers = peers_without(&world, partition);
    let store = MemoryNodeStore::new();
    let codec = XorParityCodec::new();

    let ctx = RecoveryContext {
        tracker: &world.tracker,
        indexes: &world.indexes,
        store: &store,
        peers: &peers,
        codec: &codec,
        oplog: None,
        options: RecoveryOptions::default(),
    };

    let ghost = Hash::of(b"never part of any batch");
    let err = ctx.recover_target(&ghost, 1).await.unwrap_err();
    assert!(err.is_not_found(), "{:?}", err);

    // Unknown snapshot version is NotFound too.
    let (target, _) = pick_target(&world);
    let err = ctx.recover_target(&target, 9).await.unwrap_err();
    assert!(err.is_not_found(), "{:?}", err);
}
