use crate::semaphore::SemaphoreError;
use nix::errno::Errno;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Shared memory segment {key} already exists")]
    SegmentExists { key: u32 },

    #[error("Shared memory segment {key} not found")]
    SegmentNotFound { key: u32 },

    #[error("Shared memory error on segment {key}: {source}")]
    Segment { key: u32, source: Errno },

    #[error("Segment {key} is {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        key: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Access of {len} bytes at offset {offset} exceeds region of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Unknown field {0}")]
    UnknownField(String),

    #[error("Field {field} is {expected} bytes, got {actual}")]
    FieldSize {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Segment not initialized yet")]
    NotReady,

    #[error("Magic marker mismatch, segment is foreign")]
    BadMagic,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Payload capacity must be positive")]
    ZeroCapacity,

    #[error("Chunk of {len} bytes exceeds payload capacity of {capacity} bytes")]
    ChunkTooLarge { len: usize, capacity: usize },

    #[error("Semaphore error: {0}")]
    Semaphore(#[from] SemaphoreError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RingError {
    /// Errors a reader may see while the writer is still setting the ring up.
    pub fn is_retriable(&self) -> bool {
        match self {
            RingError::SegmentNotFound { .. } | RingError::NotReady => true,
            RingError::SizeMismatch { actual, .. } => *actual == 0,
            RingError::Semaphore(SemaphoreError::NotFound { .. }) => true,
            _ => false,
        }
    }
}
