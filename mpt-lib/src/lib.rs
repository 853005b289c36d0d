mod assembler;
mod hash;
mod merkle_index;
mod metadata;
mod node;
mod partition;
mod tools;
mod version;

pub use assembler::*;
pub use hash::*;
pub use merkle_index::*;
pub use metadata::*;
pub use node::*;
pub use partition::*;
pub use tools::*;
pub use version::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("structural error: {0}")]
    Structural(String),
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, StateError::Unrecoverable(_))
    }
}

pub type StateResult<T> = std::result::Result<T, StateError>;

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::IoError(err.to_string())
    }
}

/// Sub-block width used when a chunk is split into first-level Merkle leaves.
pub const CHUNK_SUB_BLOCK_SIZE: usize = 100;
