use futures::StreamExt;
use shmring::{
    RING_HEADER_SIZE, RetryConfig, RingConfig, RingError, RingReader, RingWriter, SharedRegion,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

static NEXT: AtomicU32 = AtomicU32::new(0);

/// Fresh key for one test, with any leftovers of a previous run removed.
fn fresh_config(capacity: usize) -> RingConfig {
    let key = 0x2000_0000
        | ((std::process::id() & 0xFFFF) << 8)
        | (NEXT.fetch_add(1, Ordering::Relaxed) & 0xFF);
    shmring::cleanup(key).unwrap();
    RingConfig::new(key, capacity)
}

async fn read_exactly(reader: &mut RingReader, total: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        let chunk = reader.read(total - out.len()).await.unwrap();
        assert!(!chunk.is_empty(), "read must not return empty chunks");
        out.extend_from_slice(&chunk);
    }
    out
}

/// Capacity 20, ten writes of a 10-byte word, reader attached after the
/// first write: the reader sees the word ten times across four wraparounds
/// and moves back to the payload start exactly once for each.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_word_repeated_across_wraps() {
    let config = fresh_config(20);
    let word = b"1234567890";

    let mut writer = RingWriter::create(config.clone()).unwrap();
    writer.write(word).await.unwrap();

    let mut reader = RingReader::attach(config).unwrap();

    let writer_task = tokio::spawn(async move {
        for _ in 1..10 {
            writer.write(word).await.unwrap();
        }
        writer
    });

    let mut received = Vec::new();
    let mut resets = 0;
    let mut last_offset = reader.read_offset();
    while received.len() < 100 {
        let chunk = reader.read(100 - received.len()).await.unwrap();
        assert!(!chunk.is_empty());
        received.extend_from_slice(&chunk);
        // Without a reset every non-empty read moves the offset forward
        if reader.read_offset() <= last_offset {
            resets += 1;
        }
        last_offset = reader.read_offset();
    }
    let writer = writer_task.await.unwrap();

    assert_eq!(received, word.repeat(10), "Reader must see every byte in order");
    assert_eq!(writer.wraparounds(), 4, "Five batches of two words");
    assert_eq!(reader.wraparounds(), 4, "One acknowledgement per wraparound");
    assert_eq!(resets, 4, "Offset returns to the payload start once per wraparound");
    let snapshot = reader.header().snapshot().unwrap();
    assert_eq!(snapshot.size, 20, "Last batch holds the final two words");
    assert_eq!(snapshot.reader_ready, 0);
    assert_eq!(reader.read_offset(), RING_HEADER_SIZE + 20);

    reader.deinit().unwrap();
    writer.deinit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_roundtrip_with_uneven_chunks() {
    let config = fresh_config(256);
    let mut writer = RingWriter::create(config.clone()).unwrap();
    let mut reader = RingReader::attach(config).unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let expected = payload.clone();

    let writer_task = tokio::spawn(async move {
        let mut offset = 0;
        let mut step = 1;
        while offset < payload.len() {
            let end = (offset + step).min(payload.len());
            writer.write(&payload[offset..end]).await.unwrap();
            offset = end;
            step = step % 200 + 7;
        }
        writer
    });

    let mut received = Vec::with_capacity(expected.len());
    {
        let mut chunks = Box::pin(reader.stream(97));
        while received.len() < expected.len() {
            let chunk = chunks.next().await.unwrap().unwrap();
            assert!(chunk.len() <= 97);
            received.extend_from_slice(&chunk);
        }
    }
    let writer = writer_task.await.unwrap();

    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "Stream must deliver bytes without gaps or reordering");

    reader.deinit().unwrap();
    writer.deinit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_readers_receive_every_batch() {
    let config = fresh_config(32);
    let mut writer = RingWriter::create(config.clone()).unwrap();

    let mut readers = Vec::new();
    for _ in 0..3 {
        readers.push(RingReader::attach(config.clone()).unwrap());
    }

    let data: Vec<u8> = (0..400u32).map(|i| i as u8).collect();
    let total = data.len();

    let handles: Vec<_> = readers
        .into_iter()
        .map(|mut reader| {
            tokio::spawn(async move {
                let bytes = read_exactly(&mut reader, total).await;
                (bytes, reader)
            })
        })
        .collect();

    for chunk in data.chunks(12) {
        writer.write(chunk).await.unwrap();
    }

    for handle in handles {
        let (bytes, reader) = handle.await.unwrap();
        assert_eq!(bytes, data);
        reader.deinit().unwrap();
    }
    writer.deinit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrap_waits_for_every_reader() {
    let config = fresh_config(20);
    let mut writer = RingWriter::create(config.clone()).unwrap();
    let mut fast = RingReader::attach(config.clone()).unwrap();
    let mut slow = RingReader::attach(config).unwrap();

    writer.write(b"aaaaaaaaaa").await.unwrap();
    writer.write(b"bbbbbbbbbb").await.unwrap();
    assert_eq!(fast.read(64).await.unwrap().len(), 20);

    let writer_task = tokio::spawn(async move {
        writer.write(b"cccccccccc").await.unwrap();
        writer
    });
    let fast_task = tokio::spawn(async move {
        let chunk = fast.read(64).await.unwrap();
        (chunk, fast)
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !writer_task.is_finished(),
        "Writer must wait while the slow reader has not acknowledged"
    );
    let snapshot = slow.header().snapshot().unwrap();
    assert_eq!(snapshot.reader_count, 2);
    assert_eq!(snapshot.reader_ready, 1, "Only the fast reader acknowledged");
    assert_eq!(snapshot.writer_offset, RING_HEADER_SIZE as u64);

    let tail = slow.read(64).await.unwrap();
    assert_eq!(tail, b"aaaaaaaaaabbbbbbbbbb", "Slow reader drains the old batch");

    let writer = writer_task.await.unwrap();
    let (chunk, fast) = fast_task.await.unwrap();
    assert_eq!(chunk, b"cccccccccc");
    assert_eq!(slow.read(64).await.unwrap(), b"cccccccccc");

    let snapshot = slow.header().snapshot().unwrap();
    assert_eq!(snapshot.reader_ready, 0, "readerReady resets with the batch");
    assert_eq!(snapshot.size, 10);

    fast.deinit().unwrap();
    slow.deinit().unwrap();
    writer.deinit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reader_leaving_during_wrap_releases_writer() {
    let config = fresh_config(20);
    let mut writer = RingWriter::create(config.clone()).unwrap();
    let mut active = RingReader::attach(config.clone()).unwrap();
    let idle = RingReader::attach(config).unwrap();

    writer.write(&[1u8; 20]).await.unwrap();
    assert_eq!(active.read(64).await.unwrap().len(), 20);

    let writer_task = tokio::spawn(async move {
        writer.write(&[2u8; 5]).await.unwrap();
        writer
    });
    let active_task = tokio::spawn(async move {
        let chunk = active.read(64).await.unwrap();
        (chunk, active)
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!writer_task.is_finished());

    idle.deinit().unwrap();

    let writer = tokio::time::timeout(Duration::from_secs(5), writer_task)
        .await
        .expect("writer should proceed once the idle reader left")
        .unwrap();
    let (chunk, active) = active_task.await.unwrap();
    assert_eq!(chunk, vec![2u8; 5]);

    active.deinit().unwrap();
    writer.deinit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reader_attached_during_wrap_starts_with_next_batch() {
    let config = fresh_config(20);
    let mut writer = RingWriter::create(config.clone()).unwrap();
    let mut early = RingReader::attach(config.clone()).unwrap();

    writer.write(b"old-batch-0123456789").await.unwrap();
    let writer_task = tokio::spawn(async move {
        writer.write(b"new").await.unwrap();
        writer
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut late = RingReader::attach(config).unwrap();
    let snapshot = late.header().snapshot().unwrap();
    assert_eq!(snapshot.reader_count, 2);
    assert_eq!(
        snapshot.reader_ready, 1,
        "Late reader counts as having acknowledged the pending wrap"
    );

    assert_eq!(early.read(64).await.unwrap(), b"old-batch-0123456789");
    let writer = writer_task.await.unwrap();

    assert_eq!(late.read(64).await.unwrap(), b"new");
    assert_eq!(early.read(64).await.unwrap(), b"new");

    early.deinit().unwrap();
    late.deinit().unwrap();
    writer.deinit().unwrap();
}

#[tokio::test]
async fn test_foreign_magic_is_rejected() {
    let config = fresh_config(16);
    let writer = RingWriter::create(config.clone()).unwrap();

    let intruder = SharedRegion::attach(config.key, config.total_size()).unwrap();
    intruder.write(b"XXXXX", 0).unwrap();

    assert!(matches!(
        RingReader::attach(config.clone()),
        Err(RingError::BadMagic)
    ));
    assert!(
        matches!(
            RingReader::attach_with_retry(config, &RetryConfig::default()).await,
            Err(RingError::BadMagic)
        ),
        "A foreign magic is not retried"
    );

    intruder.detach();
    writer.deinit().unwrap();
}

#[tokio::test]
async fn test_attach_fails_without_writer() {
    let config = fresh_config(16);
    let err = RingReader::attach(config.clone()).err().unwrap();
    assert!(err.is_retriable(), "Missing ring should be retriable, got {err}");

    let retry = RetryConfig {
        max_attempts: 3,
        ..RetryConfig::default()
    };
    assert!(RingReader::attach_with_retry(config, &retry).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_with_retry_waits_for_writer() {
    let config = fresh_config(32);

    let reader_config = config.clone();
    let reader_task = tokio::spawn(async move {
        RingReader::attach_with_retry(reader_config, &RetryConfig::patient(Duration::from_secs(5)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut writer = RingWriter::create(config).unwrap();

    let mut reader = reader_task.await.unwrap().unwrap();
    writer.write(b"ready").await.unwrap();
    assert_eq!(reader.read(64).await.unwrap(), b"ready");

    reader.deinit().unwrap();
    writer.deinit().unwrap();
}

#[tokio::test]
async fn test_dropped_reader_deregisters() {
    let config = fresh_config(16);
    let writer = RingWriter::create(config.clone()).unwrap();

    {
        let _reader = RingReader::attach(config).unwrap();
        assert_eq!(writer.header().snapshot().unwrap().reader_count, 1);
    }
    assert_eq!(writer.header().snapshot().unwrap().reader_count, 0);

    writer.deinit().unwrap();
}
