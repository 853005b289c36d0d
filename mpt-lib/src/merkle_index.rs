use crate::{Hash, StateError, StateResult, CHUNK_SUB_BLOCK_SIZE};
use std::collections::{BTreeMap, HashMap};

/// First-level Merkle tree over one chunk's fixed-size sub-blocks. Only
/// the root and the leaf hashes are retained; the root identifies the
/// chunk everywhere else in the system.
#[derive(Debug, Clone)]
pub struct ChunkMerkleTree {
    pub root: Hash,
    pub leaves: Vec<Hash>,
}

impl ChunkMerkleTree {
    pub fn build(chunk: &[u8], block_size: usize) -> Self {
        let leaves: Vec<Hash> = if chunk.is_empty() {
            // An empty chunk still needs an identity.
            vec![Hash::of(&[])]
        } else {
            chunk.chunks(block_size).map(Hash::of).collect()
        };

        let mut level = leaves.clone();
        while level.len() > 1 {
            let mut next = Vec::with_capacity((level.len() + 1) / 2);
            for pair in level.chunks(2) {
                let left = &pair[0];
                // An odd level duplicates its last node.
                let right = pair.get(1).unwrap_or(left);
                next.push(Hash::combine(left, right));
            }
            level = next;
        }
        Self {
            root: level[0],
            leaves,
        }
    }
}

/// One node of the second-level index, arena-addressed.
#[derive(Debug, Clone)]
pub struct IndexNode {
    pub hash: Hash,
    /// Midpoint of the children's indices; ordering aid only.
    pub index: u64,
    /// Parity hashes of the erasure-coding group whose data members are
    /// exactly this subtree's leaves. Supplied externally; empty means no
    /// coding group at this node.
    pub parity: Vec<Hash>,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl IndexNode {
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Two-level Merkle index over one snapshot's chunks.
///
/// Leaves are the chunk roots in partition order; an internal hash is
/// `sha256(left || right)`. The arena vector owns every node; the explicit
/// child->parent map is the only back-reference and is plain data.
pub struct ChunkMerkleIndex {
    nodes: Vec<IndexNode>,
    root: usize,
    parent: HashMap<usize, usize>,
    chunk_trees: Vec<ChunkMerkleTree>,
    chunk_data: HashMap<Hash, Vec<u8>>,
    ancestors_leaves: BTreeMap<Hash, Vec<Hash>>,
}

impl ChunkMerkleIndex {
    pub fn build(chunks: &[Vec<u8>]) -> StateResult<Self> {
        if chunks.is_empty() {
            return Err(StateError::InvalidParam(
                "cannot index an empty chunk set".to_string(),
            ));
        }

        let mut chunk_trees = Vec::with_capacity(chunks.len());
        let mut chunk_data = HashMap::with_capacity(chunks.len());
        let mut nodes = Vec::new();
        let mut level: Vec<usize> = Vec::with_capacity(chunks.len());

        for (partition, chunk) in chunks.iter().enumerate() {
            let tree = ChunkMerkleTree::build(chunk, CHUNK_SUB_BLOCK_SIZE);
            chunk_data.insert(tree.root, chunk.clone());
            nodes.push(IndexNode {
                hash: tree.root,
                index: partition as u64,
                parity: Vec::new(),
                left: None,
                right: None,
            });
            level.push(partition);
            chunk_trees.push(tree);
        }

        let mut parent = HashMap::new();
        while level.len() > 1 {
            let mut next = Vec::with_capacity((level.len() + 1) / 2);
            for pair in level.chunks(2) {
                let left = pair[0];
                let right = *pair.get(1).unwrap_or(&left);
                let combined = Hash::combine(&nodes[left].hash, &nodes[right].hash);
                let index = (nodes[left].index + nodes[right].index) / 2;
                let id = nodes.len();
                nodes.push(IndexNode {
                    hash: combined,
                    index,
                    parity: Vec::new(),
                    left: Some(left),
                    right: Some(right),
                });
                parent.insert(left, id);
                parent.insert(right, id);
                next.push(id);
            }
            level = next;
        }
        let root = level[0];

        let mut index = Self {
            nodes,
            root,
            parent,
            chunk_trees,
            chunk_data,
            ancestors_leaves: BTreeMap::new(),
        };
        index.record_ancestor_leaves();
        Ok(index)
    }

    /// Precompute the leaf set of every internal node.
    fn record_ancestor_leaves(&mut self) {
        let mut table = BTreeMap::new();
        for id in 0..self.nodes.len() {
            if !self.nodes[id].is_leaf() {
                table.insert(self.nodes[id].hash, self.subtree_leaves(id));
            }
        }
        self.ancestors_leaves = table;
    }

    /// Leaf hashes under `id` in index order; the duplicated last leaf of
    /// an odd level appears once.
    fn subtree_leaves(&self, id: usize) -> Vec<Hash> {
        let mut leaves = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &self.nodes[current];
            if node.is_leaf() {
                if !leaves.contains(&node.hash) {
                    leaves.push(node.hash);
                }
            } else {
                // Right first so the left subtree pops first.
                if let Some(right) = node.right {
                    stack.push(right);
                }
                if let Some(left) = node.left {
                    if node.right != Some(left) {
                        stack.push(left);
                    }
                }
            }
        }
        leaves
    }

    pub fn root_hash(&self) -> Hash {
        self.nodes[self.root].hash
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_trees.len()
    }

    /// Root identifying the chunk of `partition`.
    pub fn chunk_root(&self, partition: usize) -> Option<Hash> {
        self.chunk_trees.get(partition).map(|t| t.root)
    }

    /// Partition index of a chunk root.
    pub fn locate_partition(&self, root: &Hash) -> Option<usize> {
        self.chunk_trees.iter().position(|t| t.root == *root)
    }

    pub fn chunk_data(&self, root: &Hash) -> Option<&[u8]> {
        self.chunk_data.get(root).map(|c| c.as_slice())
    }

    /// Attach the externally produced parity set of the coding group whose
    /// data members are `ancestor`'s subtree leaves.
    pub fn set_parity(&mut self, ancestor: &Hash, parity: Vec<Hash>) -> StateResult<()> {
        let id = self
            .find_node(ancestor)
            .ok_or_else(|| StateError::NotFound(format!("index node {} not found", ancestor)))?;
        self.nodes[id].parity = parity;
        Ok(())
    }

    pub fn parity_of(&self, hash: &Hash) -> Option<&[Hash]> {
        self.find_node(hash).map(|id| self.nodes[id].parity.as_slice())
    }

    /// Depth-first exact-match search, explicit stack.
    pub fn search(&self, target: &Hash) -> Option<&IndexNode> {
        self.find_node(target).map(|id| &self.nodes[id])
    }

    fn find_node(&self, target: &Hash) -> Option<usize> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.hash == *target {
                return Some(id);
            }
            if let Some(right) = node.right {
                stack.push(right);
            }
            if let Some(left) = node.left {
                if node.right != Some(left) {
                    stack.push(left);
                }
            }
        }
        None
    }

    /// Every ancestor of `target` paired with its subtree leaf set, ordered
    /// from the immediate parent outward to the root. Escalation walks this
    /// list to reach progressively larger, more redundant coding groups.
    /// Unknown targets yield an empty list.
    pub fn find_ancestors_and_leaves(&self, target: &Hash) -> Vec<(Hash, Vec<Hash>)> {
        let mut result = Vec::new();
        let Some(mut id) = self.find_node(target) else {
            debug!("ChunkMerkleIndex: target {} not found", target);
            return result;
        };
        while let Some(parent_id) = self.parent.get(&id) {
            let node = &self.nodes[*parent_id];
            result.push((node.hash, self.subtree_leaves(*parent_id)));
            id = *parent_id;
        }
        result
    }

    pub fn ancestors_leaves(&self) -> &BTreeMap<Hash, Vec<Hash>> {
        &self.ancestors_leaves
    }
}
