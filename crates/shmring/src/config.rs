use crate::header::RING_HEADER_SIZE;
use crate::paths;

/// Identity and geometry of one ring, shared by its writer and readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    pub key: u32,
    /// Payload bytes, excluding the header.
    pub capacity: usize,
    /// Permission bits for the segment and every semaphore the writer creates.
    pub permissions: u32,
}

impl RingConfig {
    pub fn new(key: u32, capacity: usize) -> Self {
        Self {
            key,
            capacity,
            permissions: paths::DEFAULT_PERMISSIONS,
        }
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn total_size(&self) -> usize {
        RING_HEADER_SIZE + self.capacity
    }
}
