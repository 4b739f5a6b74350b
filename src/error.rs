use super::*;

use thiserror::Error;

/// Status codes of the request/response protocol that sits on top of the engine.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResStatus {
    Ok = 0,
    Error = -1,
    Unknown = -2,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("inode {0} is not a directory")]
    NotADirectory(InodeId),

    #[error("inode {0} is not a file")]
    NotAFile(InodeId),

    /// what ran out: blocks, inodes, direct block slots, directory slots
    #[error("no space left: {0}")]
    NoSpace(&'static str),

    #[error("directory not empty: {0}")]
    NonEmptyDirectory(String),

    /// another defrag is in progress
    #[error("busy")]
    Busy,

    /// nothing to compact
    #[error("unavailable")]
    Unavailable,

    #[error("block {block} out of range (disk has {num_blocks} blocks)")]
    OutOfRange { block: usize, num_blocks: usize },

    #[error("bad disk image: {0}")]
    BadImage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl FsError {
    /// Response status the protocol layer sends back for this error.
    pub fn status(&self) -> ResStatus {
        match self {
            FsError::Busy => ResStatus::Unknown,
            _ => ResStatus::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// `ResStatus` of a finished operation.
pub fn status_of<T>(res: &Result<T>) -> ResStatus {
    match res {
        Ok(_) => ResStatus::Ok,
        Err(e) => e.status(),
    }
}
