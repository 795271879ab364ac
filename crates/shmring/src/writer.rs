use crate::config::RingConfig;
use crate::errors::RingError;
use crate::header::{Counter, RING_HEADER_SIZE, RingHeader};
use crate::metrics::RingMetrics;
use crate::region::{RegionOptions, SharedRegion};
use crate::signals::Signals;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// The single producer of a ring.
///
/// Owns every OS object of the ring: it exclusive-creates them in `create`
/// and removes them in `deinit`.
pub struct RingWriter {
    config: RingConfig,
    region: Arc<SharedRegion>,
    header: Arc<RingHeader>,
    signals: Signals,
    write_offset: usize,
    wraparounds: u64,
    metrics: RingMetrics,
}

impl RingWriter {
    /// Create the segment, header locks and coordination semaphores, then
    /// initialize the header. Fails if any of them already exists; whatever
    /// this call created is removed again on failure.
    pub fn create(config: RingConfig) -> Result<Self, RingError> {
        if config.capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }

        let region = Arc::new(SharedRegion::create(
            config.key,
            config.total_size(),
            RegionOptions {
                exist_ok: false,
                permissions: config.permissions,
            },
        )?);

        let (header, signals) = match Self::setup(&config, &region) {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(destroy_err) = region.destroy() {
                    tracing::warn!(key = config.key, error = %destroy_err, "Failed to remove segment after setup error");
                }
                return Err(e);
            }
        };

        tracing::info!(
            key = config.key,
            capacity = config.capacity,
            "Ring writer created"
        );

        Ok(Self {
            metrics: RingMetrics::writer(config.key),
            config,
            region,
            header: Arc::new(header),
            signals,
            write_offset: RING_HEADER_SIZE,
            wraparounds: 0,
        })
    }

    fn setup(
        config: &RingConfig,
        region: &Arc<SharedRegion>,
    ) -> Result<(RingHeader, Signals), RingError> {
        let header = RingHeader::create(Arc::clone(region), config.permissions)?;

        let signals = match Signals::create(config.key, config.permissions) {
            Ok(signals) => signals,
            Err(e) => {
                let _ = header.unlink();
                return Err(e);
            }
        };

        // Last step: the magic tells readers everything above exists
        if let Err(e) = header.initialize() {
            let _ = header.unlink();
            let _ = signals.unlink();
            return Err(e);
        }

        Ok((header, signals))
    }

    pub fn key(&self) -> u32 {
        self.config.key
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Absolute offset of the next write.
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn header(&self) -> &RingHeader {
        &self.header
    }

    /// Wraparounds completed since `create`.
    pub fn wraparounds(&self) -> u64 {
        self.wraparounds
    }

    /// Append `chunk` to the ring and wake waiting readers.
    ///
    /// When the chunk does not fit behind the current batch the writer wraps
    /// around first, which suspends until every attached reader has drained
    /// and acknowledged the batch.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), RingError> {
        if chunk.is_empty() {
            return Ok(());
        }

        let capacity = self.config.capacity;
        if chunk.len() > capacity {
            return Err(RingError::ChunkTooLarge {
                len: chunk.len(),
                capacity,
            });
        }

        let available = capacity - (self.write_offset - RING_HEADER_SIZE);
        if chunk.len() > available {
            self.wrap().await?;
        }

        self.region.write(chunk, self.write_offset)?;
        self.write_offset += chunk.len();
        self.header.publish(self.write_offset, chunk.len())?;
        self.metrics.record_chunk(chunk.len());

        tracing::debug!(
            key = self.config.key,
            len = chunk.len(),
            writer_offset = self.write_offset,
            "Chunk published"
        );

        self.signal_readers().await?;
        Ok(())
    }

    async fn wrap(&mut self) -> Result<(), RingError> {
        let span = tracing::debug_span!(
            "ring_wrap",
            key = self.config.key,
            batch_size = self.write_offset - RING_HEADER_SIZE
        );

        async {
            let started = Instant::now();
            // Resetting below every reader's offset is what ends the batch
            self.write_offset = RING_HEADER_SIZE;
            self.header.set_writer_offset(RING_HEADER_SIZE)?;
            self.signal_readers().await?;

            let mut rounds = 0u64;
            while !self.header.try_release_batch(&self.signals.generation)? {
                self.signals.batch_complete.wait_async().await?;
                rounds += 1;
            }

            self.wraparounds += 1;
            self.metrics.record_wrap(started.elapsed());
            tracing::debug!(
                rounds,
                wraparounds = self.wraparounds,
                "Batch released by all readers"
            );
            Ok::<(), RingError>(())
        }
        .instrument(span)
        .await
    }

    /// Run one wake-up round: post data-ready once per registered waiter.
    ///
    /// The round holds the wait gate, so no reader registers while tokens are
    /// handed out. With waiters the gate stays closed and the last woken
    /// reader re-opens it.
    async fn signal_readers(&self) -> Result<u64, RingError> {
        if self.signals.gate.try_wait()? {
            return wake_waiters(&self.header, &self.signals);
        }

        let header = Arc::clone(&self.header);
        let signals = self.signals.clone();
        tokio::task::spawn_blocking(move || {
            signals.gate.wait()?;
            wake_waiters(&header, &signals)
        })
        .await?
    }

    /// Remove the ring: header locks, coordination semaphores and the segment.
    /// Readers must have stopped.
    pub fn deinit(self) -> Result<(), RingError> {
        let Self {
            config,
            region,
            header,
            signals,
            ..
        } = self;

        header.unlink()?;
        match Arc::try_unwrap(header) {
            Ok(header) => header.close()?,
            Err(_) => tracing::debug!(key = config.key, "Header still referenced, closing on drop"),
        }

        signals.unlink()?;
        signals.close()?;

        region.destroy()?;
        tracing::info!(key = config.key, "Ring writer torn down");
        Ok(())
    }
}

/// Caller holds the gate.
fn wake_waiters(header: &RingHeader, signals: &Signals) -> Result<u64, RingError> {
    let waiting = match header.counter(Counter::ReaderWaiting) {
        Ok(waiting) => waiting,
        Err(e) => {
            let _ = signals.gate.post();
            return Err(e);
        }
    };

    if waiting == 0 {
        signals.gate.post()?;
    } else {
        for _ in 0..waiting {
            signals.data_ready.post()?;
        }
        tracing::debug!(waiting, "Woke waiting readers");
    }
    Ok(waiting)
}
