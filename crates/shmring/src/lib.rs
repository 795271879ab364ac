//! Single-producer, multi-consumer byte ring over POSIX shared memory.
//!
//! A [`RingWriter`] owns a shared-memory segment made of a 45-byte header
//! followed by the payload. [`RingReader`]s in other processes attach to the
//! same key and consume the bytes as a stream. Coordination goes through
//! named semaphores only: one lock per header field plus a handful of
//! coordination semaphores (see [`paths`]).
//!
//! When a chunk no longer fits, the writer wraps around to the payload start
//! and waits until every attached reader has drained and acknowledged the
//! previous batch.

pub mod config;
pub mod errors;
pub mod field;
pub mod header;
pub mod metrics;
pub mod paths;
pub mod reader;
pub mod region;
pub mod retry;
pub mod semaphore;
pub mod signals;
pub mod writer;

pub use config::RingConfig;
pub use errors::RingError;
pub use header::{RING_HEADER_SIZE, RING_MAGIC, RingHeader};
pub use reader::RingReader;
pub use region::SharedRegion;
pub use retry::RetryConfig;
pub use semaphore::{NamedSemaphore, SemaphoreError, SemaphoreOptions};
pub use writer::RingWriter;

/// Remove the segment and every semaphore name derived from `key`.
///
/// Objects that are already gone count as removed. Meant for operators and
/// tests recovering from a writer that died without `deinit`; running it
/// under a live ring breaks that ring.
pub fn cleanup(key: u32) -> Result<usize, RingError> {
    let mut removed = usize::from(SharedRegion::maybe_destroy(key)?);
    for name in paths::semaphore_names(key) {
        if NamedSemaphore::maybe_unlink(&name)? {
            removed += 1;
        }
    }
    tracing::debug!(key, removed, "Ring cleanup finished");
    Ok(removed)
}

/// Keys for unit tests: unique within the test binary, tagged with the pid.
#[cfg(test)]
pub(crate) fn test_key() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    0x4000_0000 | ((std::process::id() & 0xFFFF) << 12) | (NEXT.fetch_add(1, Ordering::Relaxed) & 0xFFF)
}
