use mpt_lib::{ChunkMerkleTree, Hash, NodeMetadata, StateError, StateResult, CHUNK_SUB_BLOCK_SIZE};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CONFIG_FILE_NAME: &str = "node_store.json";
const DEFAULT_DB_FILE: &str = "node_store.db";

/// Key-value seam over the storage engine. Chunks are keyed by their
/// first-level Merkle root; node rows record where each node lives.
pub trait NodeStore: Send + Sync {
    fn lookup(&self, hash: &Hash) -> StateResult<Option<Vec<u8>>>;

    /// Persist one snapshot's chunks together with the partition
    /// assignment and the finalized node metadata.
    fn commit(
        &self,
        chunks: &[Vec<u8>],
        assignment: &HashMap<Hash, u8>,
        node_index: &HashMap<Hash, NodeMetadata>,
    ) -> StateResult<()>;

    fn exists(&self, hash: &Hash) -> StateResult<bool>;
}

/// In-memory store for tests and the peer simulation.
#[derive(Default)]
pub struct MemoryNodeStore {
    chunks: Mutex<HashMap<Hash, Vec<u8>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chunk(&self, root: Hash, data: Vec<u8>) {
        self.chunks.lock().unwrap().insert(root, data);
    }

    pub fn remove_chunk(&self, root: &Hash) {
        self.chunks.lock().unwrap().remove(root);
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

impl NodeStore for MemoryNodeStore {
    fn lookup(&self, hash: &Hash) -> StateResult<Option<Vec<u8>>> {
        Ok(self.chunks.lock().unwrap().get(hash).cloned())
    }

    fn commit(
        &self,
        chunks: &[Vec<u8>],
        _assignment: &HashMap<Hash, u8>,
        _node_index: &HashMap<Hash, NodeMetadata>,
    ) -> StateResult<()> {
        let mut table = self.chunks.lock().unwrap();
        for chunk in chunks {
            let tree = ChunkMerkleTree::build(chunk, CHUNK_SUB_BLOCK_SIZE);
            table.insert(tree.root, chunk.clone());
        }
        Ok(())
    }

    fn exists(&self, hash: &Hash) -> StateResult<bool> {
        Ok(self.chunks.lock().unwrap().contains_key(hash))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStoreConfig {
    pub read_only: bool,
    pub db_path: Option<PathBuf>,
}

impl Default for NodeStoreConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            db_path: None,
        }
    }
}

impl NodeStoreConfig {
    /// Load the store config from `root_path`, writing the default one on
    /// first use.
    pub fn load_or_init(root_path: &Path) -> StateResult<Self> {
        let config_path = root_path.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let config = NodeStoreConfig::default();
            let json = serde_json::to_string(&config)
                .map_err(|e| StateError::Internal(e.to_string()))?;
            std::fs::write(&config_path, json)
                .map_err(|e| StateError::IoError(format!("write config failed: {}", e)))?;
            return Ok(config);
        }
        let json = std::fs::read_to_string(&config_path).map_err(|e| {
            warn!("NodeStoreConfig: read config failed! {}", e);
            StateError::NotFound("node store config not found".to_string())
        })?;
        serde_json::from_str(&json).map_err(|e| {
            warn!("NodeStoreConfig: parse config failed! {}", e);
            StateError::InvalidData("node store config invalid".to_string())
        })
    }
}

/// Sqlite-backed store: one `chunks` table keyed by chunk root, one
/// `nodes` table mapping node hashes to their partition placement.
pub struct SqliteNodeStore {
    conn: Mutex<Connection>,
    read_only: bool,
}

impl SqliteNodeStore {
    pub fn open(db_path: &Path) -> StateResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| StateError::DbError(format!("open {} failed: {}", db_path.display(), e)))?;
        let store = Self {
            conn: Mutex::new(conn),
            read_only: false,
        };
        store.init_tables()?;
        Ok(store)
    }

    /// Open under `root_path` according to its JSON config.
    pub fn open_with_config(root_path: &Path) -> StateResult<Self> {
        let config = NodeStoreConfig::load_or_init(root_path)?;
        let db_path = config
            .db_path
            .clone()
            .unwrap_or_else(|| root_path.join(DEFAULT_DB_FILE));
        let mut store = Self::open(&db_path)?;
        store.read_only = config.read_only;
        Ok(store)
    }

    fn init_tables(&self) -> StateResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                root TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| StateError::DbError(e.to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                hash TEXT PRIMARY KEY,
                partition INTEGER NOT NULL,
                offset INTEGER NOT NULL,
                packed_len INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| StateError::DbError(e.to_string()))?;
        Ok(())
    }
}

impl NodeStore for SqliteNodeStore {
    fn lookup(&self, hash: &Hash) -> StateResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT data FROM chunks WHERE root = ?1")
            .map_err(|e| StateError::DbError(e.to_string()))?;
        let mut rows = stmt
            .query(params![hash.to_hex()])
            .map_err(|e| StateError::DbError(e.to_string()))?;
        match rows.next().map_err(|e| StateError::DbError(e.to_string()))? {
            Some(row) => {
                let data: Vec<u8> = row.get(0).map_err(|e| StateError::DbError(e.to_string()))?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    fn commit(
        &self,
        chunks: &[Vec<u8>],
        assignment: &HashMap<Hash, u8>,
        node_index: &HashMap<Hash, NodeMetadata>,
    ) -> StateResult<()> {
        if self.read_only {
            return Err(StateError::InvalidState(
                "store is read-only".to_string(),
            ));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| StateError::DbError(e.to_string()))?;
        for chunk in chunks {
            let tree = ChunkMerkleTree::build(chunk, CHUNK_SUB_BLOCK_SIZE);
            tx.execute(
                "INSERT OR REPLACE INTO chunks (root, data) VALUES (?1, ?2)",
                params![tree.root.to_hex(), chunk],
            )
            .map_err(|e| StateError::DbError(e.to_string()))?;
        }
        for (hash, partition) in assignment {
            let meta = node_index.get(hash).copied().unwrap_or_default();
            tx.execute(
                "INSERT OR REPLACE INTO nodes (hash, partition, offset, packed_len)
                 VALUES (?1, ?2, ?3, ?4)",
                params![hash.to_hex(), partition, meta.offset, meta.packed_len()],
            )
            .map_err(|e| StateError::DbError(e.to_string()))?;
        }
        tx.commit().map_err(|e| StateError::DbError(e.to_string()))?;
        Ok(())
    }

    fn exists(&self, hash: &Hash) -> StateResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE root = ?1",
                params![hash.to_hex()],
                |row| row.get(0),
            )
            .map_err(|e| StateError::DbError(e.to_string()))?;
        Ok(count > 0)
    }
}
