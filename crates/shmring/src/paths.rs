//! Centralized IPC naming
//!
//! Every OS object belonging to a ring is derived from its integer key, so
//! the writer, the readers and the cleanup helpers agree on names without
//! exchanging anything but the key.

use crate::header::HEADER_LAYOUT;

/// Prefix of the POSIX shared-memory object backing a ring.
pub const SEGMENT_PREFIX: &str = "/shmring";

/// Permission bits used by the writer for the segment.
pub const DEFAULT_PERMISSIONS: u32 = 0o664;

/// Default read size used by stream consumers.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub fn segment_name(key: u32) -> String {
    format!("{SEGMENT_PREFIX}.{key}")
}

/// Prefix for the per-field header locks: the key as text.
pub fn header_prefix(key: u32) -> String {
    key.to_string()
}

pub fn field_lock_name(prefix: &str, field: &str) -> String {
    format!("{prefix}_{field}")
}

/// Data-ready: posted once per registered waiter after each publish.
pub fn data_ready_name(key: u32) -> String {
    format!("ring.{key}.write")
}

/// Batch-complete: posted by readers when the last one acknowledges a wraparound.
pub fn batch_complete_name(key: u32) -> String {
    format!("ring.{key}.readers")
}

/// Registration gate serializing waiter registration against wake-up rounds.
pub fn wait_gate_name(key: u32) -> String {
    format!("ring.{key}.write.sync")
}

/// Wraparound parity bit, read with `sem_getvalue` and never blocked on.
pub fn batch_generation_name(key: u32) -> String {
    format!("ring.{key}.batch")
}

/// Every semaphore name owned by the ring with this key.
pub fn semaphore_names(key: u32) -> Vec<String> {
    let prefix = header_prefix(key);
    HEADER_LAYOUT
        .iter()
        .map(|field| field_lock_name(&prefix, field.name))
        .chain([
            data_ready_name(key),
            batch_complete_name(key),
            wait_gate_name(key),
            batch_generation_name(key),
        ])
        .collect()
}
