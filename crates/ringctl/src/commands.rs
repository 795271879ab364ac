use crate::cli::{DecrementArgs, ReadArgs, WriteArgs};
use anyhow::{Context, anyhow, bail};
use shmring::header::{Counter, RingHeader};
use shmring::{RetryConfig, RingReader, RingWriter, SharedRegion};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Create the ring, copy stdin into it, then remove it.
pub async fn write(args: WriteArgs, shutdown: &AtomicBool) -> anyhow::Result<()> {
    let config = args.ring.config();
    let key = config.key;
    let mut writer =
        RingWriter::create(config).with_context(|| format!("Failed to create ring {key}"))?;

    // The ring is removed even when pumping failed
    let pumped = pump_stdin(&mut writer, &args, shutdown).await;
    writer
        .deinit()
        .with_context(|| format!("Failed to remove ring {key}"))?;

    let total = pumped?;
    info!(key, bytes = total, "Writer finished");
    Ok(())
}

async fn pump_stdin(
    writer: &mut RingWriter,
    args: &WriteArgs,
    shutdown: &AtomicBool,
) -> anyhow::Result<u64> {
    if args.readers > 0 {
        info!(readers = args.readers, "Waiting for readers to attach");
        while writer.header().counter(Counter::ReaderCount)? < args.readers {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(0);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    let mut buf = vec![0u8; args.chunk_size.clamp(1, writer.capacity())];
    let mut stdin = tokio::io::stdin();
    let mut total = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        let n = stdin.read(&mut buf).await.context("Failed to read stdin")?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await?;
        total += n as u64;
    }

    if args.linger {
        debug!("Input done, waiting for readers to detach");
        while writer.header().counter(Counter::ReaderCount)? > 0 {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    Ok(total)
}

/// Attach to the ring and copy it to stdout until the limit, a signal, or
/// an error.
pub async fn read(args: ReadArgs, shutdown: &AtomicBool) -> anyhow::Result<()> {
    let config = args.ring.config();
    let key = config.key;
    let retry = RetryConfig::patient(Duration::from_millis(args.wait_ms));

    let mut reader = RingReader::attach_with_retry(config, &retry)
        .await
        .with_context(|| format!("Failed to attach to ring {key}"))?;

    let pumped = pump_stdout(&mut reader, &args, shutdown).await;
    reader.deinit()?;

    let total = pumped?;
    info!(key, bytes = total, "Reader finished");
    Ok(())
}

async fn pump_stdout(
    reader: &mut RingReader,
    args: &ReadArgs,
    shutdown: &AtomicBool,
) -> anyhow::Result<u64> {
    let chunk_size = args.chunk_size.max(1);
    let mut stdout = tokio::io::stdout();
    let mut total = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        let max = match args.limit {
            Some(limit) if total >= limit => break,
            Some(limit) => usize::try_from(limit - total).map_or(chunk_size, |left| left.min(chunk_size)),
            None => chunk_size,
        };

        let chunk = reader.read(max).await?;
        stdout
            .write_all(&chunk)
            .await
            .context("Failed to write stdout")?;
        total += chunk.len() as u64;
    }

    stdout.flush().await.context("Failed to flush stdout")?;
    Ok(total)
}

pub fn cleanup(key: u32) -> anyhow::Result<()> {
    let removed =
        shmring::cleanup(key).with_context(|| format!("Failed to clean up ring {key}"))?;
    info!(key, removed, "Ring objects removed");
    println!("{removed}");
    Ok(())
}

/// Read a header field, pause, write it back minus one.
///
/// With the field lock the read-modify-write is atomic across processes.
/// `--raw` skips the lock, so concurrent runs lose updates.
pub fn decrement(args: DecrementArgs) -> anyhow::Result<()> {
    let _span = common::span!("ringctl_decrement");

    let config = args.ring.config();
    let region = Arc::new(
        SharedRegion::attach(config.key, config.total_size())
            .with_context(|| format!("Failed to attach to ring {}", config.key))?,
    );
    let header = RingHeader::attach(Arc::clone(&region))?;
    let delay = Duration::from_millis(args.delay_ms);

    let next = if args.raw {
        let spec = header
            .fields()
            .layout()
            .iter()
            .find(|spec| spec.name == args.field)
            .ok_or_else(|| anyhow!("Unknown header field {}", args.field))?;
        if spec.size != 8 {
            bail!("Field {} is not a counter", spec.name);
        }

        let bytes: [u8; 8] = region
            .read(8, spec.offset)?
            .try_into()
            .map_err(|_| anyhow!("Short read of field {}", spec.name))?;
        let current = u64::from_le_bytes(bytes);
        std::thread::sleep(delay);
        let next = decremented(&args.field, current)?;
        region.write(&next.to_le_bytes(), spec.offset)?;
        next
    } else {
        let guard = header.fields().acquire(&args.field)?;
        let current = guard.get_value()?;
        std::thread::sleep(delay);
        let next = decremented(&args.field, current)?;
        guard.set_value(next)?;
        guard.release()?;
        next
    };

    debug!(field = %args.field, raw = args.raw, value = next, "Field decremented");
    header.close()?;
    println!("{next}");
    Ok(())
}

fn decremented(field: &str, current: u64) -> anyhow::Result<u64> {
    current
        .checked_sub(1)
        .ok_or_else(|| anyhow!("Field {field} is already zero"))
}
