//! Ring header layout and its locked operations.
//!
//! The header occupies the first `RING_HEADER_SIZE` bytes of the segment:
//!
//! | bytes    | field           |
//! |----------|-----------------|
//! | `0..5`   | `magic`         |
//! | `5..13`  | `writerOffset`  |
//! | `13..21` | `size`          |
//! | `21..29` | `readerCount`   |
//! | `29..37` | `readerWaiting` |
//! | `37..45` | `readerReady`   |
//!
//! Integers are little-endian u64. Every access goes through the field's
//! lock, reads included. Operations touching several fields take all of
//! their locks in one `acquire_multiple` call.

use crate::errors::RingError;
use crate::field::{FieldGuards, FieldManager, FieldSpec};
use crate::paths;
use crate::region::SharedRegion;
use crate::semaphore::{NamedSemaphore, SemaphoreOptions};
use std::sync::Arc;

pub const RING_MAGIC: &[u8; 5] = b"RING1";

pub const MAGIC: &str = "magic";
pub const WRITER_OFFSET: &str = "writerOffset";
pub const SIZE: &str = "size";
pub const READER_COUNT: &str = "readerCount";
pub const READER_WAITING: &str = "readerWaiting";
pub const READER_READY: &str = "readerReady";

pub static HEADER_LAYOUT: [FieldSpec; 6] = [
    FieldSpec::new(MAGIC, 0, 5),
    FieldSpec::new(WRITER_OFFSET, 5, 8),
    FieldSpec::new(SIZE, 13, 8),
    FieldSpec::new(READER_COUNT, 21, 8),
    FieldSpec::new(READER_WAITING, 29, 8),
    FieldSpec::new(READER_READY, 37, 8),
];

pub const RING_HEADER_SIZE: usize = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicStatus {
    Valid,
    /// All zeros: the writer has not finished initializing.
    Blank,
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ReaderCount,
    ReaderWaiting,
    ReaderReady,
}

impl Counter {
    pub fn field(self) -> &'static str {
        match self {
            Counter::ReaderCount => READER_COUNT,
            Counter::ReaderWaiting => READER_WAITING,
            Counter::ReaderReady => READER_READY,
        }
    }
}

/// The writer's published position, read consistently with the batch counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub writer_offset: usize,
    pub size: usize,
    /// Parity of completed wraparounds, 0 or 1.
    pub generation: u64,
}

impl Cursor {
    /// The writer reset to the payload start and still waits for
    /// acknowledgements of the previous batch.
    pub fn pending_wrap(&self) -> bool {
        self.writer_offset == RING_HEADER_SIZE && self.size > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSnapshot {
    pub magic: [u8; 5],
    pub writer_offset: u64,
    pub size: u64,
    pub reader_count: u64,
    pub reader_waiting: u64,
    pub reader_ready: u64,
}

const ALL_FIELDS: [&str; 6] = [
    MAGIC,
    WRITER_OFFSET,
    SIZE,
    READER_COUNT,
    READER_WAITING,
    READER_READY,
];

pub struct RingHeader {
    key: u32,
    fields: FieldManager,
}

impl RingHeader {
    /// Exclusive-create the field locks. Used by the writer only.
    pub fn create(region: Arc<SharedRegion>, permissions: u32) -> Result<Self, RingError> {
        let options = SemaphoreOptions {
            permissions,
            ..SemaphoreOptions::exclusive(1)
        };
        Self::open(region, options)
    }

    pub fn attach(region: Arc<SharedRegion>) -> Result<Self, RingError> {
        Self::open(region, SemaphoreOptions::attach_only())
    }

    fn open(region: Arc<SharedRegion>, options: SemaphoreOptions) -> Result<Self, RingError> {
        let key = region.key();
        let fields = FieldManager::new(region, &HEADER_LAYOUT, &paths::header_prefix(key), options)?;
        Ok(Self { key, fields })
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn fields(&self) -> &FieldManager {
        &self.fields
    }

    /// Zero the counters and point the writer at the payload start, then
    /// write the magic. Readers treat the magic as the "ready" flag, so it
    /// goes last.
    pub fn initialize(&self) -> Result<(), RingError> {
        let _span = common::span_debug!("ring_header_initialize");
        let guards = self.fields.acquire_multiple(&ALL_FIELDS)?;
        guards.set_value(SIZE, 0)?;
        guards.set_value(READER_COUNT, 0)?;
        guards.set_value(READER_WAITING, 0)?;
        guards.set_value(READER_READY, 0)?;
        guards.set_value(WRITER_OFFSET, RING_HEADER_SIZE as u64)?;
        guards.get(MAGIC)?.set_sequence(RING_MAGIC)?;
        guards.release()?;

        tracing::debug!(key = self.key, "Ring header initialized");
        Ok(())
    }

    pub fn check_magic(&self) -> Result<MagicStatus, RingError> {
        let magic = self.fields.get_sequence(MAGIC)?;
        Ok(if magic == RING_MAGIC {
            MagicStatus::Valid
        } else if magic.iter().all(|&b| b == 0) {
            MagicStatus::Blank
        } else {
            MagicStatus::Foreign
        })
    }

    /// `check_magic` mapped onto errors: blank is retriable, foreign is fatal.
    pub fn verify_magic(&self) -> Result<(), RingError> {
        match self.check_magic()? {
            MagicStatus::Valid => Ok(()),
            MagicStatus::Blank => Err(RingError::NotReady),
            MagicStatus::Foreign => Err(RingError::BadMagic),
        }
    }

    pub fn writer_offset(&self) -> Result<usize, RingError> {
        Ok(self.fields.get_value(WRITER_OFFSET)? as usize)
    }

    pub fn set_writer_offset(&self, offset: usize) -> Result<(), RingError> {
        self.fields.set_value(WRITER_OFFSET, offset as u64)
    }

    /// Move `writerOffset` and grow the batch `size` in one critical section.
    pub fn publish(&self, offset: usize, added: usize) -> Result<(), RingError> {
        let guards = self.fields.acquire_multiple(&[WRITER_OFFSET, SIZE])?;
        let size = guards.value(SIZE)?;
        guards.set_value(WRITER_OFFSET, offset as u64)?;
        guards.set_value(SIZE, size + added as u64)?;
        guards.release()
    }

    pub fn cursor(&self, generation: &NamedSemaphore) -> Result<Cursor, RingError> {
        let guards = self.fields.acquire_multiple(&[WRITER_OFFSET, SIZE])?;
        let cursor = read_cursor(&guards, generation)?;
        guards.release()?;
        Ok(cursor)
    }

    pub fn snapshot(&self) -> Result<HeaderSnapshot, RingError> {
        let guards = self.fields.acquire_multiple(&ALL_FIELDS)?;
        let mut magic = [0u8; 5];
        magic.copy_from_slice(&guards.get(MAGIC)?.get_sequence()?);
        let snapshot = HeaderSnapshot {
            magic,
            writer_offset: guards.value(WRITER_OFFSET)?,
            size: guards.value(SIZE)?,
            reader_count: guards.value(READER_COUNT)?,
            reader_waiting: guards.value(READER_WAITING)?,
            reader_ready: guards.value(READER_READY)?,
        };
        guards.release()?;
        Ok(snapshot)
    }

    pub fn counter(&self, counter: Counter) -> Result<u64, RingError> {
        self.fields.get_value(counter.field())
    }

    /// Atomic read-modify-write; returns the new value.
    pub fn increment(&self, counter: Counter) -> Result<u64, RingError> {
        self.adjust(counter, true)
    }

    /// Atomic read-modify-write; returns the new value. Going below zero is a
    /// protocol error and leaves the counter untouched.
    pub fn decrement(&self, counter: Counter) -> Result<u64, RingError> {
        self.adjust(counter, false)
    }

    fn adjust(&self, counter: Counter, up: bool) -> Result<u64, RingError> {
        let guard = self.fields.acquire(counter.field())?;
        let current = guard.get_value()?;
        let next = if up {
            current + 1
        } else {
            current.checked_sub(1).ok_or_else(|| {
                RingError::Protocol(format!("{} would drop below zero", counter.field()))
            })?
        };
        guard.set_value(next)?;
        guard.release()?;
        Ok(next)
    }

    /// Re-check the cursor with `readerWaiting` locked and register as a
    /// waiter if `should_wait` still says so. Callers hold the wait gate.
    pub fn register_waiter<F>(
        &self,
        generation: &NamedSemaphore,
        should_wait: F,
    ) -> Result<bool, RingError>
    where
        F: FnOnce(Cursor) -> Result<bool, RingError>,
    {
        let guards = self
            .fields
            .acquire_multiple(&[WRITER_OFFSET, SIZE, READER_WAITING])?;
        let cursor = read_cursor(&guards, generation)?;
        let wait = should_wait(cursor)?;
        if wait {
            let waiting = guards.value(READER_WAITING)?;
            guards.set_value(READER_WAITING, waiting + 1)?;
        }
        guards.release()?;
        Ok(wait)
    }

    /// Deregister a woken waiter. Returns true for the last one of the round,
    /// which then owns re-opening the wait gate.
    pub fn leave_wait(&self) -> Result<bool, RingError> {
        Ok(self.decrement(Counter::ReaderWaiting)? == 0)
    }

    /// Count a new reader. During a pending wraparound the reader is counted
    /// as having acknowledged it already, and the batch generation it was
    /// admitted at is returned.
    pub fn admit_reader(&self, generation: &NamedSemaphore) -> Result<Option<u64>, RingError> {
        let guards = self
            .fields
            .acquire_multiple(&[WRITER_OFFSET, SIZE, READER_COUNT, READER_READY])?;
        let cursor = read_cursor(&guards, generation)?;
        let count = guards.value(READER_COUNT)?;
        guards.set_value(READER_COUNT, count + 1)?;

        let acked = if cursor.pending_wrap() {
            let ready = guards.value(READER_READY)?;
            guards.set_value(READER_READY, ready + 1)?;
            Some(cursor.generation)
        } else {
            None
        };
        guards.release()?;
        Ok(acked)
    }

    /// Uncount a leaving reader, withdrawing its acknowledgement of the
    /// pending wraparound if it gave one. Returns whether a wraparound is
    /// pending, in which case the caller must post batch-complete.
    pub fn release_reader(
        &self,
        generation: &NamedSemaphore,
        acked: Option<u64>,
    ) -> Result<bool, RingError> {
        let guards = self
            .fields
            .acquire_multiple(&[WRITER_OFFSET, SIZE, READER_COUNT, READER_READY])?;
        let cursor = read_cursor(&guards, generation)?;
        let count = guards.value(READER_COUNT)?;
        if count == 0 {
            return Err(RingError::Protocol(
                "reader leaving with readerCount at zero".to_string(),
            ));
        }
        guards.set_value(READER_COUNT, count - 1)?;

        let pending = cursor.pending_wrap();
        if pending && acked == Some(cursor.generation) {
            let ready = guards.value(READER_READY)?;
            guards.set_value(READER_READY, ready.saturating_sub(1))?;
        }
        guards.release()?;
        Ok(pending)
    }

    /// Record one reader's acknowledgement of the pending wraparound.
    /// Returns true when every counted reader has acknowledged.
    pub fn acknowledge_batch(&self) -> Result<bool, RingError> {
        let guards = self.fields.acquire_multiple(&[READER_COUNT, READER_READY])?;
        let count = guards.value(READER_COUNT)?;
        let ready = guards.value(READER_READY)? + 1;
        if ready > count {
            return Err(RingError::Protocol(format!(
                "readerReady {ready} exceeds readerCount {count}"
            )));
        }
        guards.set_value(READER_READY, ready)?;
        guards.release()?;
        Ok(ready == count)
    }

    /// Writer side of the barrier: if every reader acknowledged, zero `size`
    /// and `readerReady` together and flip the batch generation.
    pub fn try_release_batch(&self, generation: &NamedSemaphore) -> Result<bool, RingError> {
        let guards = self
            .fields
            .acquire_multiple(&[SIZE, READER_COUNT, READER_READY])?;
        let count = guards.value(READER_COUNT)?;
        let ready = guards.value(READER_READY)?;
        if ready < count {
            tracing::debug!(key = self.key, ready, count, "Wraparound still waiting on readers");
            guards.release()?;
            return Ok(false);
        }

        // Flipped first, under the size lock, so cursor reads see size and
        // generation change together and a failed flip leaves the batch pending
        flip_generation(generation)?;
        guards.set_value(SIZE, 0)?;
        guards.set_value(READER_READY, 0)?;
        guards.release()?;
        Ok(true)
    }

    pub fn unlink(&self) -> Result<(), RingError> {
        self.fields.unlink()
    }

    pub fn close(self) -> Result<(), RingError> {
        self.fields.close()
    }
}

/// Toggle the generation parity between 0 and 1.
///
/// Every counted reader acknowledges each wraparound before the next one is
/// released, so no reader is ever more than one generation behind and one
/// bit tells the pending wraparound apart from the acknowledged one.
fn flip_generation(generation: &NamedSemaphore) -> Result<(), RingError> {
    if generation.value()? == 0 {
        generation.post()?;
    } else if !generation.try_wait()? {
        return Err(RingError::Protocol(format!(
            "batch generation {} changed during a wraparound",
            generation.name()
        )));
    }
    Ok(())
}

fn read_cursor(guards: &FieldGuards<'_>, generation: &NamedSemaphore) -> Result<Cursor, RingError> {
    Ok(Cursor {
        writer_offset: guards.value(WRITER_OFFSET)? as usize,
        size: guards.value(SIZE)? as usize,
        generation: generation.value()?,
    })
}
