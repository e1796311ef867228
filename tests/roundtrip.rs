use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;

use spillchan::test_support::eventually;
use spillchan::{
    ChannelConfig, ChannelHandle, Consumption, Mode, Payload, ReaderState, Runtime, RuntimeConfig,
    SinkState, SpillChannel,
};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Record {
    deliveries: Vec<Vec<u8>>,
    data: Vec<u8>,
    eofs: usize,
    errors: Vec<i32>,
}

/// Channel whose consumer swallows everything synchronously.
fn consuming_channel(
    runtime: &Runtime,
    config: ChannelConfig,
) -> (ChannelHandle, Arc<Mutex<Record>>) {
    let record = Arc::new(Mutex::new(Record::default()));
    let handle = SpillChannel::build(runtime.handle(), config).expect("channel");
    let sink = record.clone();
    handle.set_data_callback(move |_chan, payload| match payload {
        Payload::Data(data) => {
            let mut rec = sink.lock();
            rec.deliveries.push(data.to_vec());
            if data.is_empty() {
                rec.eofs += 1;
            } else {
                rec.data.extend_from_slice(&data);
            }
            Consumption::Consumed(data.len())
        }
        Payload::Error(code) => {
            sink.lock().errors.push(code);
            Consumption::Consumed(0)
        }
    });
    (handle, record)
}

/// Channel whose consumer records deliveries but always defers, so the test
/// drives consumption explicitly through `consumed`.
fn deferring_channel(
    runtime: &Runtime,
    config: ChannelConfig,
) -> (ChannelHandle, Arc<Mutex<Record>>) {
    let record = Arc::new(Mutex::new(Record::default()));
    let handle = SpillChannel::build(runtime.handle(), config).expect("channel");
    let sink = record.clone();
    handle.set_data_callback(move |_chan, payload| match payload {
        Payload::Data(data) => {
            let mut rec = sink.lock();
            rec.deliveries.push(data.to_vec());
            if data.is_empty() {
                rec.eofs += 1;
            } else {
                rec.data.extend_from_slice(&data);
            }
            Consumption::Deferred
        }
        Payload::Error(code) => {
            sink.lock().errors.push(code);
            Consumption::Consumed(0)
        }
    });
    (handle, record)
}

/// Acknowledge the latest deferred delivery in full.
fn ack_last(handle: &ChannelHandle, record: &Arc<Mutex<Record>>) {
    let len = record
        .lock()
        .deliveries
        .last()
        .expect("no delivery to acknowledge")
        .len();
    handle.consumed(len, false);
}

/// Wait until a new delivery arrives beyond `seen`.
fn await_delivery(record: &Arc<Mutex<Record>>, seen: usize) {
    assert!(
        eventually(WAIT, || record.lock().deliveries.len() > seen),
        "no delivery beyond {seen}"
    );
}

fn spill_dir_is_empty(dir: &TempDir) -> bool {
    std::fs::read_dir(dir.path())
        .map(|entries| entries.count() == 0)
        .unwrap_or(false)
}

#[test]
fn keeps_up_consumer_never_spills() {
    let dir = TempDir::new().expect("tempdir");
    let runtime = Runtime::with_defaults().expect("runtime");
    let (handle, record) = consuming_channel(
        &runtime,
        ChannelConfig {
            buffer_dir: dir.path().to_path_buf(),
            threshold: 100,
            ..ChannelConfig::default()
        },
    );

    handle.feed(Bytes::from_static(b"hello"));
    handle.feed(Bytes::new());

    let rec = record.lock();
    assert_eq!(rec.data, b"hello");
    assert_eq!(rec.eofs, 1);
    assert!(rec.errors.is_empty());
    drop(rec);
    assert_eq!(handle.mode(), Mode::InMemory);
    assert_eq!(handle.metrics().snapshot().spill_episodes, 0);
    assert!(spill_dir_is_empty(&dir));
}

#[test]
fn threshold_crossing_round_trips_and_truncates() {
    let dir = TempDir::new().expect("tempdir");
    let runtime = Runtime::with_defaults().expect("runtime");
    let (handle, record) = consuming_channel(
        &runtime,
        ChannelConfig {
            buffer_dir: dir.path().to_path_buf(),
            threshold: 4,
            ..ChannelConfig::default()
        },
    );

    handle.feed(Bytes::from_static(b"abcd"));
    handle.feed(Bytes::from_static(b"ef"));
    assert_eq!(handle.mode(), Mode::InMemory, "spill drained back to memory");
    handle.feed(Bytes::new());

    let rec = record.lock();
    assert_eq!(rec.data, b"abcdef");
    assert_eq!(rec.eofs, 1);
    assert!(rec.errors.is_empty());
    drop(rec);
    assert!(handle.ended());
    assert_eq!(handle.metrics().snapshot().spill_episodes, 1);
    // The spill file is unlinked as soon as it exists; the directory must
    // end up empty even though an episode happened.
    assert!(
        eventually(WAIT, || spill_dir_is_empty(&dir)),
        "spill file left behind"
    );
}

#[test]
fn stalled_consumer_round_trips_through_disk() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let runtime = Runtime::with_defaults().expect("runtime");
    let (handle, record) = deferring_channel(
        &runtime,
        ChannelConfig {
            buffer_dir: dir.path().to_path_buf(),
            threshold: 4,
            ..ChannelConfig::default()
        },
    );

    handle.feed(Bytes::from_static(b"aaaa"));
    assert_eq!(handle.sink_state(), SinkState::Waiting);
    handle.feed(Bytes::from_static(b"bbbb"));
    handle.feed(Bytes::from_static(b"cccc"));
    handle.feed(Bytes::from_static(b"dddd"));

    // The writer moves everything, including the head buffer the reader
    // already delivered ahead of it.
    assert!(
        eventually(WAIT, || handle.metrics().snapshot().bytes_spilled >= 16),
        "writer never caught up"
    );

    // Finish "aaaa": the reader streams the rest back from disk.
    let seen = record.lock().deliveries.len();
    handle.consumed(4, false);
    await_delivery(&record, seen);
    assert_eq!(
        record.lock().deliveries.last().expect("chunk"),
        b"bbbbccccdddd"
    );

    // Finish the chunk: the spill is drained and the channel returns to a
    // state indistinguishable from never having spilled.
    handle.consumed(12, false);
    assert_eq!(handle.mode(), Mode::InMemory);
    assert_eq!(handle.writer_state(), None);
    assert_eq!(handle.bytes_buffered(), 0);
    assert_eq!(handle.reader_state(), ReaderState::Inactive);

    // End of stream after the fact.
    let seen = record.lock().deliveries.len();
    handle.feed(Bytes::new());
    await_delivery(&record, seen);
    handle.consumed(0, false);

    let rec = record.lock();
    assert_eq!(rec.data, b"aaaabbbbccccdddd");
    assert_eq!(rec.eofs, 1);
    assert!(rec.errors.is_empty());
    drop(rec);

    let snapshot = handle.metrics().snapshot();
    assert_eq!(snapshot.spill_episodes, 1);
    assert_eq!(snapshot.bytes_spilled, 16);
    assert_eq!(snapshot.bytes_read_back, 12);
    assert!(
        eventually(WAIT, || spill_dir_is_empty(&dir)),
        "spill file left behind"
    );
}

#[test]
fn delayed_switch_writes_earlier_buffers_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let runtime = Runtime::with_defaults().expect("runtime");
    let (handle, record) = deferring_channel(
        &runtime,
        ChannelConfig {
            buffer_dir: dir.path().to_path_buf(),
            threshold: 2,
            delay_in_file_mode_switching: 50,
            ..ChannelConfig::default()
        },
    );

    handle.feed(Bytes::from_static(b"11"));
    assert_eq!(handle.mode(), Mode::InFile);
    assert_eq!(handle.writer_state(), Some(spillchan::WriterState::CreatingFile));

    // Fed while the mode switch is still sleeping.
    handle.feed(Bytes::from_static(b"22"));
    handle.feed(Bytes::from_static(b"33"));

    assert!(
        eventually(WAIT, || handle.metrics().snapshot().bytes_spilled >= 6),
        "delayed writer never moved the backlog"
    );

    let seen = record.lock().deliveries.len();
    handle.consumed(2, false);
    await_delivery(&record, seen);
    ack_last(&handle, &record);
    assert!(eventually(WAIT, || handle.mode() == Mode::InMemory));

    let seen = record.lock().deliveries.len();
    handle.feed(Bytes::new());
    await_delivery(&record, seen);
    handle.consumed(0, false);

    let rec = record.lock();
    assert_eq!(rec.data, b"112233");
    assert_eq!(rec.eofs, 1);
}

#[test]
fn many_buffers_drip_fed_preserve_byte_stream() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    // Small read chunks force several disk read rounds.
    let runtime = Runtime::new(RuntimeConfig {
        pool_chunk_bytes: 256,
        ..RuntimeConfig::default()
    })
    .expect("runtime");
    let (handle, record) = deferring_channel(
        &runtime,
        ChannelConfig {
            buffer_dir: dir.path().to_path_buf(),
            threshold: 1024,
            ..ChannelConfig::default()
        },
    );

    let mut expected = Vec::new();
    for index in 0..32u8 {
        let chunk = vec![index; 512];
        expected.extend_from_slice(&chunk);
        handle.feed(Bytes::from(chunk));
    }
    handle.feed(Bytes::new());

    // Drive consumption to completion, acknowledging whatever arrives.
    let mut acked = 0usize;
    while record.lock().eofs == 0 {
        assert!(
            eventually(WAIT, || handle.sink_state() == SinkState::Waiting),
            "conduit never received the next delivery"
        );
        let len = {
            let rec = record.lock();
            acked += 1;
            assert!(acked <= 1000, "drip loop ran away");
            rec.deliveries.last().expect("delivery").len()
        };
        handle.consumed(len, false);
    }
    handle.consumed(0, false);

    let rec = record.lock();
    assert_eq!(rec.data.len(), expected.len());
    assert_eq!(rec.data, expected);
    assert_eq!(rec.eofs, 1);
    assert!(rec.errors.is_empty());
    drop(rec);

    let snapshot = handle.metrics().snapshot();
    assert!(snapshot.spill_episodes >= 1);
    assert!(snapshot.bytes_spilled > 0);
    assert!(
        eventually(WAIT, || spill_dir_is_empty(&dir)),
        "spill file left behind"
    );
}
