use crate::config::RingConfig;
use crate::errors::RingError;
use crate::header::{Cursor, RING_HEADER_SIZE, RingHeader};
use crate::metrics::RingMetrics;
use crate::region::SharedRegion;
use crate::retry::RetryConfig;
use crate::signals::Signals;
use futures::Stream;
use std::sync::Arc;

/// What the reader does next, given its position and the writer's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Writer is ahead within the batch.
    Read(usize),
    /// Writer wrapped; read the old batch tail that ends at `batch_end`.
    Drain { len: usize, batch_end: usize },
    /// Old batch fully read; acknowledge the wraparound.
    Acknowledge,
    Wait,
}

/// Decide the next step. Pure so it can run both on the fast path and
/// inside the locked re-check before registering as a waiter.
fn plan(
    read_offset: usize,
    acked: Option<u64>,
    cursor: Cursor,
    capacity: usize,
    max: usize,
) -> Result<Step, RingError> {
    let total = RING_HEADER_SIZE + capacity;
    let w = cursor.writer_offset;
    let r = read_offset;

    if w < RING_HEADER_SIZE || w > total {
        return Err(RingError::Protocol(format!(
            "writerOffset {w} outside [{RING_HEADER_SIZE}, {total}]"
        )));
    }
    if cursor.size > capacity {
        return Err(RingError::Protocol(format!(
            "batch size {} exceeds capacity {capacity}",
            cursor.size
        )));
    }

    let pending = cursor.pending_wrap();
    let acked_this_batch = acked == Some(cursor.generation);

    if pending && acked_this_batch {
        return Ok(Step::Wait);
    }
    if w > r {
        return Ok(Step::Read((w - r).min(max)));
    }
    if w < r || (pending && r == RING_HEADER_SIZE) {
        if !pending {
            return Err(RingError::Protocol(format!(
                "writerOffset {w} behind reader at {r} without a wraparound"
            )));
        }
        let batch_end = RING_HEADER_SIZE + cursor.size;
        return match r.cmp(&batch_end) {
            std::cmp::Ordering::Less => Ok(Step::Drain {
                len: (batch_end - r).min(max),
                batch_end,
            }),
            std::cmp::Ordering::Equal => Ok(Step::Acknowledge),
            std::cmp::Ordering::Greater => Err(RingError::Protocol(format!(
                "reader at {r} past the end of the wrapped batch at {batch_end}"
            ))),
        };
    }
    Ok(Step::Wait)
}

/// One consumer of a ring.
///
/// Reads are a byte stream: chunk boundaries follow the writer's publishes
/// and the caller's `max`, not the writer's `write` calls. Every reader sees
/// every byte of every batch written after it attached, starting with the
/// batch in progress.
pub struct RingReader {
    config: RingConfig,
    region: Arc<SharedRegion>,
    header: Arc<RingHeader>,
    signals: Signals,
    read_offset: usize,
    /// Generation parity of the last wraparound this reader acknowledged.
    acked_generation: Option<u64>,
    wraparounds: u64,
    registered: bool,
    metrics: RingMetrics,
}

impl RingReader {
    /// Attach to a live ring and register in `readerCount`.
    ///
    /// Fails with a retriable error while the writer is still setting up,
    /// and with `BadMagic` if the segment belongs to something else.
    pub fn attach(config: RingConfig) -> Result<Self, RingError> {
        if config.capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }

        let region = Arc::new(SharedRegion::attach(config.key, config.total_size())?);
        let header = RingHeader::attach(Arc::clone(&region))?;
        header.verify_magic()?;
        let signals = Signals::attach(config.key)?;
        let acked_generation = header.admit_reader(&signals.generation)?;

        tracing::info!(
            key = config.key,
            capacity = config.capacity,
            during_wrap = acked_generation.is_some(),
            "Ring reader attached"
        );

        Ok(Self {
            metrics: RingMetrics::reader(config.key),
            config,
            region,
            header: Arc::new(header),
            signals,
            read_offset: RING_HEADER_SIZE,
            acked_generation,
            wraparounds: 0,
            registered: true,
        })
    }

    /// `attach`, retried with backoff while the ring is not ready yet.
    pub async fn attach_with_retry(
        config: RingConfig,
        retry: &RetryConfig,
    ) -> Result<Self, RingError> {
        let mut attempt = 0;
        loop {
            match Self::attach(config.clone()) {
                Ok(reader) => return Ok(reader),
                Err(e) if e.is_retriable() && attempt + 1 < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::debug!(
                        key = config.key,
                        attempt,
                        ?delay,
                        error = %e,
                        "Ring not ready, retrying attach"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn key(&self) -> u32 {
        self.config.key
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    pub fn header(&self) -> &RingHeader {
        &self.header
    }

    /// Wraparounds this reader acknowledged. Each one moved its offset back
    /// to the payload start.
    pub fn wraparounds(&self) -> u64 {
        self.wraparounds
    }

    /// Return the next run of at most `max` bytes, waiting for the writer if
    /// there is nothing to read. Never returns an empty chunk unless `max`
    /// is zero.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, RingError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        loop {
            let cursor = self.header.cursor(&self.signals.generation)?;
            match plan(
                self.read_offset,
                self.acked_generation,
                cursor,
                self.config.capacity,
                max,
            )? {
                Step::Read(len) => return self.take(len),
                Step::Drain { len, batch_end } => {
                    let data = self.take(len)?;
                    if self.read_offset == batch_end {
                        self.acknowledge(cursor.generation)?;
                    }
                    return Ok(data);
                }
                Step::Acknowledge => self.acknowledge(cursor.generation)?,
                Step::Wait => self.wait_for_data().await?,
            }
        }
    }

    /// The ring as a stream of chunks of at most `chunk_size` bytes. The
    /// stream ends after the first error; dropping it leaves the reader
    /// registered and a new stream resumes where this one stopped.
    pub fn stream(
        &mut self,
        chunk_size: usize,
    ) -> impl Stream<Item = Result<Vec<u8>, RingError>> + '_ {
        let chunk_size = chunk_size.max(1);
        futures::stream::try_unfold(self, move |reader| async move {
            let chunk = reader.read(chunk_size).await?;
            Ok(Some((chunk, reader)))
        })
    }

    fn take(&mut self, len: usize) -> Result<Vec<u8>, RingError> {
        let data = self.region.read(len, self.read_offset)?;
        self.read_offset += len;
        self.metrics.record_chunk(len);
        Ok(data)
    }

    fn acknowledge(&mut self, generation: u64) -> Result<(), RingError> {
        let last = self.header.acknowledge_batch()?;
        self.acked_generation = Some(generation);
        self.read_offset = RING_HEADER_SIZE;
        self.wraparounds += 1;
        self.metrics.record_acknowledge();
        if last {
            self.signals.batch_complete.post()?;
        }
        tracing::debug!(key = self.config.key, generation, last, "Wraparound acknowledged");
        Ok(())
    }

    /// Register as a waiter and sleep until the next wake-up round.
    ///
    /// Runs start to finish on the blocking pool, so a dropped `read` future
    /// cannot leave `readerWaiting` or the gate inconsistent.
    async fn wait_for_data(&self) -> Result<(), RingError> {
        let header = Arc::clone(&self.header);
        let signals = self.signals.clone();
        let read_offset = self.read_offset;
        let acked = self.acked_generation;
        let capacity = self.config.capacity;

        let waited = tokio::task::spawn_blocking(move || {
            signals.gate.wait()?;
            let registered = header.register_waiter(&signals.generation, |cursor| {
                Ok(plan(read_offset, acked, cursor, capacity, 1)? == Step::Wait)
            });
            let reopened = signals.gate.post();
            if !registered? {
                reopened?;
                return Ok(false);
            }
            reopened?;

            let woken = signals.data_ready.wait();
            let last = header.leave_wait();
            if let Ok(true) = last {
                signals.gate.post()?;
            }
            woken?;
            last?;
            Ok::<bool, RingError>(true)
        })
        .await??;

        if waited {
            tracing::debug!(key = self.config.key, "Woken by writer");
        }
        Ok(())
    }

    fn leave(&mut self) -> Result<(), RingError> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        let pending = self
            .header
            .release_reader(&self.signals.generation, self.acked_generation)?;
        if pending {
            self.signals.batch_complete.post()?;
        }
        Ok(())
    }

    /// Deregister from `readerCount` and close this process's handles.
    /// Never removes the segment or any semaphore name.
    pub fn deinit(mut self) -> Result<(), RingError> {
        self.leave()?;
        tracing::info!(key = self.config.key, "Ring reader detached");
        Ok(())
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        if let Err(e) = self.leave() {
            tracing::warn!(key = self.config.key, error = %e, "Failed to deregister ring reader");
        }
    }
}
