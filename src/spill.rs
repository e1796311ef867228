//! The file-spilling buffered channel.
//!
//! A [`SpillChannel`] accepts an unbounded sequence of buffers from a single
//! producer and delivers them, in order, to a consumer behind a capacity-1
//! conduit. Below a configured threshold everything is buffered in memory;
//! past it, a background writer moves queued buffers into an anonymous
//! (immediately unlinked) spill file and the reader streams them back out,
//! recovering memory without reordering bytes.
//!
//! Three cooperating state machines run on the coordinator event loop:
//!
//! - the **reader** drains the queue (in-memory mode) or the spill file
//!   (in-file mode) into the conduit, short-circuiting to still-queued
//!   buffers when the disk holds nothing unread;
//! - the **writer** creates the spill file and moves queued buffers into it,
//!   freeing their memory as each move completes;
//! - the **coordinator** picks the mode, latches the first error, and defers
//!   error delivery until the conduit is idle.
//!
//! Completions from the I/O workers are marshalled onto the loop thread,
//! carry a cancellation flag so teardown can disown them, and hold a share
//! of the spill file descriptor so it outlives every issued request.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::BufferQueue;
use crate::channel::{Consumption, FeedOutcome, Payload, SinkState};
use crate::config::ChannelConfig;
use crate::error::{errno_of, ChannelResult};
use crate::io::{IoJob, IoPoolHandle, IoRequest, SpillFile};
use crate::metrics::SpillMetrics;
use crate::runtime::RuntimeHandle;

/// Top-level channel mode. The ordering is meaningful: anything at or above
/// [`Mode::ErrorWaiting`] counts as errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    /// Everything is buffered in memory. The default.
    InMemory,
    /// Buffered data past the threshold is moved to the spill file.
    InFile,
    /// An error is latched but the conduit is busy; delivery is deferred
    /// until it reports idle.
    ErrorWaiting,
    /// The latched error was delivered (or was undeliverable).
    Error,
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Mode::InMemory => write!(f, "in-memory"),
            Mode::InFile => write!(f, "in-file"),
            Mode::ErrorWaiting => write!(f, "error-waiting"),
            Mode::Error => write!(f, "error"),
        }
    }
}

/// State of the reader state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Not running; the next `feed` kicks it.
    Inactive,
    /// Feeding a buffer to the conduit.
    Feeding,
    /// Feeding the end-of-stream marker to the conduit.
    FeedingEof,
    /// Waiting for the conduit's consumed notification.
    WaitingForChannelIdle,
    /// An asynchronous read from the spill file is in flight.
    ReadingFromFile,
    /// End of stream or error; only `deinitialize` revives the reader.
    Terminated,
}

impl Display for ReaderState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReaderState::Inactive => write!(f, "inactive"),
            ReaderState::Feeding => write!(f, "feeding"),
            ReaderState::FeedingEof => write!(f, "feeding-eof"),
            ReaderState::WaitingForChannelIdle => write!(f, "waiting-for-channel-idle"),
            ReaderState::ReadingFromFile => write!(f, "reading-from-file"),
            ReaderState::Terminated => write!(f, "terminated"),
        }
    }
}

/// State of the writer state machine. Only meaningful in in-file mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Nothing to move.
    Inactive,
    /// Creating the spill file.
    CreatingFile,
    /// Moving the queue head into the spill file.
    Moving,
    /// The end-of-stream marker reached the queue head; nothing further
    /// will be moved.
    Terminated,
}

impl Display for WriterState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WriterState::Inactive => write!(f, "inactive"),
            WriterState::CreatingFile => write!(f, "creating-file"),
            WriterState::Moving => write!(f, "moving"),
            WriterState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Consumer callback: receives the payload and reports consumption.
///
/// The callback gets `&mut SpillChannel` so it can feed, query, or tear the
/// channel down reentrantly. Do not call [`ChannelHandle`] methods from
/// inside a callback; use the `&mut` parameter.
pub type DataCallback = Box<dyn FnMut(&mut SpillChannel, Payload) -> Consumption + Send + 'static>;

/// Plain notification callback (`buffers_flushed`, `data_flushed`).
pub type Callback = Box<dyn FnMut(&mut SpillChannel) + Send + 'static>;

/// State that only exists in in-file mode.
///
/// The positions relate as follows: bytes `[0, read_offset)` of the spill
/// file were already delivered; `written` counts bytes on disk not yet read,
/// and goes *negative* when the reader has short-circuited buffers the
/// writer is still moving.
struct InFileMode {
    /// Shared descriptor cell. Every in-flight read and move holds a clone,
    /// so the file outlives all issued requests and closes with the last one.
    file: Arc<SpillFile>,
    writer_state: WriterState,
    /// Bytes of the spill file already delivered by the reader.
    read_offset: u64,
    /// Bytes on disk not yet read, minus bytes the reader already delivered
    /// out of buffers still queued for the writer.
    written: i64,
    read_request: Option<Arc<IoRequest>>,
    writer_request: Option<Arc<IoRequest>>,
}

impl InFileMode {
    fn new() -> Self {
        Self {
            file: SpillFile::closed(),
            writer_state: WriterState::Inactive,
            read_offset: 0,
            written: 0,
            read_request: None,
            writer_request: None,
        }
    }
}

struct SinkCell {
    state: SinkState,
    /// Buffer awaiting a deferred `consumed` report.
    pending: Option<Bytes>,
}

/// The channel core. All methods must run on one thread at a time; the
/// [`ChannelHandle`] wrapper takes care of that.
pub struct SpillChannel {
    self_weak: Weak<Mutex<SpillChannel>>,
    runtime: RuntimeHandle,
    config: ChannelConfig,
    metrics: Arc<SpillMetrics>,
    /// Bumped by `reinitialize` and `deinitialize`. Paths that invoked user
    /// code compare their captured value afterwards and bail out if the
    /// channel was reset underneath them.
    generation: u64,
    mode: Mode,
    reader_state: ReaderState,
    /// Errno of the first failure; 0 while healthy.
    errcode: i32,
    queue: BufferQueue,
    in_file: Option<InFileMode>,
    sink: SinkCell,
    data_callback: Option<DataCallback>,
    buffers_flushed: Option<Callback>,
    data_flushed: Option<Callback>,
}

/// Cloneable handle to a [`SpillChannel`].
///
/// Producers feed through it and I/O completions reach the channel through a
/// weak reference to the same cell, so a completion that outlives the
/// channel simply discards itself.
#[derive(Clone)]
pub struct ChannelHandle {
    cell: Arc<Mutex<SpillChannel>>,
}

impl SpillChannel {
    /// Validate the configuration and build a channel on the given runtime.
    pub fn build(runtime: RuntimeHandle, config: ChannelConfig) -> ChannelResult<ChannelHandle> {
        config.validate()?;
        let cell = Arc::new_cyclic(|weak: &Weak<Mutex<SpillChannel>>| {
            Mutex::new(SpillChannel {
                self_weak: weak.clone(),
                runtime,
                config,
                metrics: Arc::new(SpillMetrics::default()),
                generation: 0,
                mode: Mode::InMemory,
                reader_state: ReaderState::Inactive,
                errcode: 0,
                queue: BufferQueue::new(),
                in_file: None,
                sink: SinkCell {
                    state: SinkState::Idle,
                    pending: None,
                },
                data_callback: None,
                buffers_flushed: None,
                data_flushed: None,
            })
        });
        Ok(ChannelHandle { cell })
    }

    /***** Public surface *****/

    /// Append a buffer. An empty buffer marks the end of the stream.
    /// Ignored once the channel has ended.
    pub fn feed(&mut self, buffer: Bytes) {
        debug!(len = buffer.len(), "feeding buffer");
        self.verify_invariants();
        if self.ended() {
            debug!("feed ignored: channel already ended");
            return;
        }
        self.queue.push_back(buffer);
        if self.mode == Mode::InMemory && self.passed_threshold() {
            self.switch_to_in_file();
        } else if self.mode == Mode::InFile
            && self.writer_state() == Some(WriterState::Inactive)
            && self.config.auto_start_mover
        {
            self.move_next_buffer_to_file();
        }
        if self.reader_state == ReaderState::Inactive {
            if self.sink_accepting() {
                self.read_next();
            } else {
                self.wait_for_idle_sink();
            }
        }
    }

    /// Copy a slice into a fresh buffer and feed it.
    pub fn feed_slice(&mut self, data: &[u8]) {
        self.feed(Bytes::copy_from_slice(data));
    }

    /// Feed borrowed static data without copying.
    pub fn feed_static(&mut self, data: &'static [u8]) {
        self.feed(Bytes::from_static(data));
    }

    /// Latch `errcode` as the channel error and deliver it to the consumer
    /// (immediately, or once the conduit reports idle).
    pub fn feed_error(&mut self, errcode: i32) {
        self.set_error(errcode);
    }

    /// Report consumption of a deferred delivery. `size` counts bytes
    /// processed; `end` tells the channel the consumer wants nothing
    /// further. A short `size` redelivers the remainder immediately.
    pub fn consumed(&mut self, size: usize, end: bool) {
        match self.sink.state {
            SinkState::Waiting => {}
            state => {
                warn!(%state, "consumed() outside a deferred delivery, ignoring");
                return;
            }
        }
        let buffer = self
            .sink
            .pending
            .take()
            .expect("waiting sink without a pending buffer");
        let is_eof = buffer.is_empty();
        if end {
            self.sink.state = SinkState::Ended;
            self.sink_consumed_notification();
            return;
        }
        if size >= buffer.len() {
            self.sink.state = if is_eof {
                SinkState::Ended
            } else {
                SinkState::Idle
            };
            self.sink_consumed_notification();
        } else {
            self.sink.state = SinkState::Idle;
            let rest = buffer.slice(size..);
            self.sink_feed(rest);
        }
    }

    /// Reopen the conduit for reuse after a previous end of stream. After an
    /// error, `deinitialize` must come first.
    pub fn reinitialize(&mut self) {
        debug_assert_eq!(
            self.errcode, 0,
            "reinitialize after an error requires deinitialize"
        );
        self.sink.state = SinkState::Idle;
        self.sink.pending = None;
        self.generation = self.generation.wrapping_add(1);
        self.verify_invariants();
    }

    /// Cancel everything and reset to a fresh in-memory channel. Pending I/O
    /// keeps running in the background with its cancellation flag set; the
    /// spill file closes when the last completion releases its share.
    pub fn deinitialize(&mut self) {
        debug!("deinitializing channel");
        self.cancel_reader();
        if self.mode == Mode::InFile {
            self.cancel_writer();
        }
        self.queue.clear();
        self.mode = Mode::InMemory;
        self.reader_state = ReaderState::Inactive;
        self.errcode = 0;
        self.in_file = None;
        self.sink.state = SinkState::Idle;
        self.sink.pending = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// True once the last queued buffer is the end-of-stream marker, an
    /// error is latched, or the conduit has ended.
    pub fn ended(&self) -> bool {
        (self.queue.has_buffers() && self.queue.peek_back().is_empty())
            || self.mode >= Mode::ErrorWaiting
            || self.sink_ended()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn reader_state(&self) -> ReaderState {
        self.reader_state
    }

    /// Writer state, present only in in-file mode.
    pub fn writer_state(&self) -> Option<WriterState> {
        self.in_file.as_ref().map(|state| state.writer_state)
    }

    pub fn bytes_buffered(&self) -> u32 {
        self.queue.bytes_buffered()
    }

    /// The latched errno, 0 while healthy.
    pub fn error_code(&self) -> i32 {
        self.errcode
    }

    pub fn sink_state(&self) -> SinkState {
        self.sink.state
    }

    pub fn passed_threshold(&self) -> bool {
        self.queue.bytes_buffered() >= self.config.threshold
    }

    pub fn metrics(&self) -> Arc<SpillMetrics> {
        self.metrics.clone()
    }

    pub fn set_data_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SpillChannel, Payload) -> Consumption + Send + 'static,
    {
        self.data_callback = Some(Box::new(callback));
    }

    /// Called whenever the in-memory queue empties: the last buffer was
    /// either delivered (in-memory mode) or moved to disk (in-file mode).
    pub fn set_buffers_flushed_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SpillChannel) + Send + 'static,
    {
        self.buffers_flushed = Some(Box::new(callback));
    }

    /// Called when the consumer has drained everything buffered so far.
    pub fn set_data_flushed_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SpillChannel) + Send + 'static,
    {
        self.data_flushed = Some(Box::new(callback));
    }

    /***** Downstream conduit *****/

    fn sink_accepting(&self) -> bool {
        self.sink.state == SinkState::Idle
    }

    fn sink_ended(&self) -> bool {
        self.sink.state == SinkState::Ended
    }

    /// Feed one buffer through the conduit, looping over synchronous partial
    /// consumption. On return the sink is idle, waiting, or ended — unless
    /// the callback tore the channel down, which the caller detects via its
    /// generation capture.
    fn sink_feed(&mut self, buffer: Bytes) {
        debug_assert_eq!(self.sink.state, SinkState::Idle, "conduit fed while busy");
        let mut buf = buffer;
        loop {
            let generation = self.generation;
            let is_eof = buf.is_empty();
            self.sink.state = SinkState::Calling;
            let verdict = self.invoke_data_callback(Payload::Data(buf.clone()));
            if self.generation != generation {
                return;
            }
            match verdict {
                Consumption::Consumed(n) if n >= buf.len() => {
                    self.sink.state = if is_eof {
                        SinkState::Ended
                    } else {
                        SinkState::Idle
                    };
                    self.sink_consumed_notification();
                    return;
                }
                Consumption::Consumed(0) => {
                    // Zero-byte progress on real data; park until the
                    // consumer reports through consumed().
                    self.sink.pending = Some(buf);
                    self.sink.state = SinkState::Waiting;
                    return;
                }
                Consumption::Consumed(n) => {
                    buf = buf.slice(n..);
                }
                Consumption::ConsumedAndEnd(_) => {
                    self.sink.state = SinkState::Ended;
                    self.sink_consumed_notification();
                    return;
                }
                Consumption::Deferred => {
                    self.sink.pending = Some(buf);
                    self.sink.state = SinkState::Waiting;
                    return;
                }
            }
        }
    }

    fn sink_feed_error(&mut self, errcode: i32) {
        debug_assert_eq!(self.sink.state, SinkState::Idle, "conduit fed while busy");
        let generation = self.generation;
        self.sink.state = SinkState::Calling;
        let _ = self.invoke_data_callback(Payload::Error(errcode));
        if self.generation != generation {
            return;
        }
        self.sink.state = SinkState::Ended;
    }

    fn invoke_data_callback(&mut self, payload: Payload) -> Consumption {
        let mut callback = self
            .data_callback
            .take()
            .expect("data callback not installed");
        let verdict = callback(self, payload);
        if self.data_callback.is_none() {
            self.data_callback = Some(callback);
        }
        verdict
    }

    /// The conduit finished processing a fed buffer (or ended). Mirrors the
    /// consumed notification of the underlying channel contract.
    fn sink_consumed_notification(&mut self) {
        if self.reader_state == ReaderState::WaitingForChannelIdle {
            if self.sink_accepting() {
                debug!("reader: conduit became idle");
                self.verify_invariants();
                self.read_next();
            } else {
                debug_assert!(self.sink_ended());
                debug!("reader: conduit ended while the reader was parked");
                self.terminate_reader();
            }
        } else if self.mode == Mode::ErrorWaiting {
            self.feed_error_when_idle();
        }
    }

    fn feed_error_when_idle(&mut self) {
        debug_assert_ne!(self.errcode, 0);
        self.mode = Mode::Error;
        if self.sink_accepting() {
            debug!("conduit became idle, feeding deferred error");
            let errcode = self.errcode;
            self.sink_feed_error(errcode);
        } else {
            debug!("conduit ended while an error was pending");
        }
    }

    fn feed_outcome(&self) -> FeedOutcome {
        match self.sink.state {
            SinkState::Idle => FeedOutcome::AcceptingMore,
            SinkState::Calling | SinkState::Waiting => FeedOutcome::MayAcceptLater,
            SinkState::Ended => FeedOutcome::Ended,
        }
    }

    /***** Reader *****/

    fn read_next(&mut self) {
        loop {
            debug_assert!(self.sink_accepting(), "reader tick requires an idle conduit");
            let generation = self.generation;
            match self.mode {
                Mode::InMemory => {
                    if !self.queue.has_buffers() {
                        debug!("reader: queue empty, going inactive");
                        self.reader_state = ReaderState::Inactive;
                        self.verify_invariants();
                        self.call_data_flushed();
                        return;
                    }
                    if self.queue.peek_front().is_empty() {
                        debug!("reader: end of stream reached, feeding eof");
                        self.reader_state = ReaderState::FeedingEof;
                        self.verify_invariants();
                        let eof = self.queue.peek_front().clone();
                        self.sink_feed(eof);
                        if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                            return;
                        }
                        debug_assert_eq!(self.reader_state, ReaderState::FeedingEof);
                        self.verify_invariants();
                        self.terminate_reader();
                        return;
                    }
                    let buffer = self.queue.peek_front().clone();
                    debug!(len = buffer.len(), "reader: popping buffer");
                    self.pop_buffer();
                    if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                        return;
                    }
                    self.reader_state = ReaderState::Feeding;
                    debug!(len = buffer.len(), "reader: feeding buffer");
                    self.sink_feed(buffer);
                    if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                        return;
                    }
                    debug_assert_eq!(self.reader_state, ReaderState::Feeding);
                    self.verify_invariants();
                    match self.feed_outcome() {
                        FeedOutcome::AcceptingMore => continue,
                        FeedOutcome::MayAcceptLater => {
                            self.wait_for_idle_sink();
                            return;
                        }
                        FeedOutcome::Ended => {
                            debug!("reader: consumer accepts no further data");
                            self.terminate_reader();
                            return;
                        }
                    }
                }
                Mode::InFile => {
                    let written = self
                        .in_file
                        .as_ref()
                        .expect("in-file state missing in in-file mode")
                        .written;
                    if written > 0 {
                        // Unread data on disk; stream it back.
                        self.read_next_chunk_from_file();
                        return;
                    }
                    // Nothing unread on disk; serve from the queue ahead of
                    // the writer. This is what drives `written` negative.
                    match self.find_buffer_for_read() {
                        None => {
                            self.reader_state = ReaderState::Inactive;
                            if self.config.auto_truncate_file {
                                debug!("reader: caught up, truncating spill file");
                                self.switch_to_in_memory();
                            } else {
                                debug!("reader: caught up, keeping spill file");
                            }
                            self.verify_invariants();
                            self.call_data_flushed();
                            return;
                        }
                        Some(buffer) if buffer.is_empty() => {
                            debug!("reader: end of stream reached, feeding eof");
                            self.reader_state = ReaderState::FeedingEof;
                            self.verify_invariants();
                            self.sink_feed(buffer);
                            if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                                return;
                            }
                            debug_assert_eq!(self.reader_state, ReaderState::FeedingEof);
                            self.verify_invariants();
                            self.terminate_reader();
                            return;
                        }
                        Some(buffer) => {
                            debug!(len = buffer.len(), "reader: short-circuiting queued buffer");
                            {
                                let in_file = self
                                    .in_file
                                    .as_mut()
                                    .expect("in-file state missing in in-file mode");
                                in_file.read_offset += buffer.len() as u64;
                                in_file.written -= buffer.len() as i64;
                            }
                            self.reader_state = ReaderState::Feeding;
                            self.sink_feed(buffer);
                            if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                                return;
                            }
                            debug_assert_eq!(self.reader_state, ReaderState::Feeding);
                            self.verify_invariants();
                            match self.feed_outcome() {
                                FeedOutcome::AcceptingMore => continue,
                                FeedOutcome::MayAcceptLater => {
                                    self.wait_for_idle_sink();
                                    return;
                                }
                                FeedOutcome::Ended => {
                                    debug!("reader: consumer accepts no further data");
                                    self.terminate_reader();
                                    return;
                                }
                            }
                        }
                    }
                }
                Mode::ErrorWaiting | Mode::Error => {
                    unreachable!("reader must not run after an error")
                }
            }
        }
    }

    fn wait_for_idle_sink(&mut self) {
        debug!("reader: waiting for conduit to drain");
        self.reader_state = ReaderState::WaitingForChannelIdle;
        self.verify_invariants();
    }

    fn terminate_reader(&mut self) {
        self.reader_state = ReaderState::Terminated;
        self.verify_invariants();
        self.call_data_flushed();
    }

    /// Locate the queue entry at logical offset `-written` from the head.
    fn find_buffer_for_read(&self) -> Option<Bytes> {
        debug_assert_eq!(self.mode, Mode::InFile);
        if !self.queue.has_buffers() {
            return None;
        }
        let target = -self
            .in_file
            .as_ref()
            .expect("in-file state missing in in-file mode")
            .written;
        let mut offset: i64 = 0;
        for buffer in self.queue.iter() {
            if offset == target || buffer.is_empty() {
                return Some(buffer.clone());
            }
            offset += buffer.len() as i64;
        }
        None
    }

    fn read_next_chunk_from_file(&mut self) {
        let (file, offset, size) = {
            let in_file = self
                .in_file
                .as_ref()
                .expect("in-file state missing in in-file mode");
            debug_assert!(in_file.written > 0);
            let size = (in_file.written as u64).min(self.runtime.pool.chunk_bytes() as u64);
            (in_file.file.clone(), in_file.read_offset, size as usize)
        };
        debug!(size, offset, "reader: scheduling chunk read from spill file");
        let mut buf = self.runtime.pool.lease();
        buf.resize(size, 0);
        let request = IoRequest::new();
        self.reader_state = ReaderState::ReadingFromFile;
        self.in_file
            .as_mut()
            .expect("in-file state missing in in-file mode")
            .read_request = Some(request.clone());
        let done = {
            let weak = self.self_weak.clone();
            let event_loop = self.runtime.event_loop.clone();
            let pool = self.runtime.pool.clone();
            let request = request.clone();
            let file = file.clone();
            Box::new(move |buf: BytesMut, result: io::Result<usize>| {
                event_loop.dispatch(Box::new(move || {
                    let _keep_open = file;
                    if request.is_cancelled() {
                        pool.recycle(buf);
                        return;
                    }
                    let Some(cell) = weak.upgrade() else {
                        pool.recycle(buf);
                        return;
                    };
                    let mut chan = cell.lock();
                    // Re-check under the lock: cancellation always happens
                    // with the channel locked, so this settles the race
                    // against a teardown that won the lock first.
                    if request.is_cancelled() {
                        drop(chan);
                        pool.recycle(buf);
                        return;
                    }
                    chan.on_chunk_read(buf, result);
                }));
            })
        };
        self.runtime.io.submit(
            request,
            IoJob::ReadAt {
                file,
                buf,
                offset,
                done,
            },
        );
        self.verify_invariants();
    }

    fn on_chunk_read(&mut self, buf: BytesMut, result: io::Result<usize>) {
        debug!("reader: chunk read complete");
        debug_assert_eq!(self.reader_state, ReaderState::ReadingFromFile);
        self.verify_invariants();
        self.in_file
            .as_mut()
            .expect("read completion outside in-file mode")
            .read_request = None;
        match result {
            Ok(n) => {
                let generation = self.generation;
                let mut buf = buf;
                buf.truncate(n);
                let buffer = buf.freeze();
                {
                    let in_file = self
                        .in_file
                        .as_mut()
                        .expect("read completion outside in-file mode");
                    debug_assert!(n as i64 <= in_file.written);
                    in_file.read_offset += buffer.len() as u64;
                    in_file.written -= buffer.len() as i64;
                }
                self.metrics.add_bytes_read_back(n as u64);
                if buffer.is_empty() {
                    // The file ran out under a positive `written`; the
                    // empty buffer is the end-of-stream signal, delivered
                    // like every other eof path.
                    debug!("reader: spill file exhausted early, feeding eof");
                    self.reader_state = ReaderState::FeedingEof;
                    self.verify_invariants();
                    self.sink_feed(buffer);
                    if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                        return;
                    }
                    debug_assert_eq!(self.reader_state, ReaderState::FeedingEof);
                    self.verify_invariants();
                    self.terminate_reader();
                    return;
                }
                debug!(len = buffer.len(), "reader: feeding chunk");
                self.reader_state = ReaderState::Feeding;
                self.sink_feed(buffer);
                if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                    return;
                }
                debug_assert_eq!(self.reader_state, ReaderState::Feeding);
                self.verify_invariants();
                match self.feed_outcome() {
                    FeedOutcome::AcceptingMore => {
                        self.reader_state = ReaderState::Inactive;
                        self.read_next();
                    }
                    FeedOutcome::MayAcceptLater => self.wait_for_idle_sink(),
                    FeedOutcome::Ended => {
                        debug!("reader: consumer accepts no further data");
                        self.terminate_reader();
                    }
                }
            }
            Err(err) => self.set_error(errno_of(&err)),
        }
    }

    /***** Mode switching *****/

    fn switch_to_in_file(&mut self) {
        debug_assert_eq!(self.mode, Mode::InMemory);
        debug_assert!(self.in_file.is_none());
        debug!(
            bytes_buffered = self.queue.bytes_buffered(),
            "switching to in-file mode"
        );
        self.metrics.incr_spill_episodes();
        self.mode = Mode::InFile;
        self.in_file = Some(InFileMode::new());
        self.create_spill_file();
    }

    /// "Truncate" the spill file by dropping it and returning to in-memory
    /// mode. Recreation on the next spill sidesteps any I/O still in flight
    /// against the old descriptor.
    fn switch_to_in_memory(&mut self) {
        debug_assert_eq!(self.mode, Mode::InFile);
        debug_assert!(
            self.in_file
                .as_ref()
                .expect("in-file state missing in in-file mode")
                .written
                <= 0
        );
        debug!("spill drained, switching back to in-memory mode");
        self.cancel_writer();
        self.queue.clear();
        self.mode = Mode::InMemory;
        self.in_file = None;
    }

    /***** Writer: file creation *****/

    fn create_spill_file(&mut self) {
        {
            let in_file = self
                .in_file
                .as_ref()
                .expect("in-file state missing in in-file mode");
            debug_assert_eq!(in_file.writer_state, WriterState::Inactive);
            debug_assert!(!in_file.file.is_open());
        }
        let path = self
            .config
            .buffer_dir
            .join(format!("buffer.{:08x}", rand::random::<u32>()));
        let request = IoRequest::new();
        {
            let in_file = self
                .in_file
                .as_mut()
                .expect("in-file state missing in in-file mode");
            in_file.writer_state = WriterState::CreatingFile;
            in_file.writer_request = Some(request.clone());
        }
        let delay = self.config.delay_in_file_mode_switching;
        if delay == 0 {
            debug!(path = %path.display(), "writer: creating spill file");
            self.submit_open(request, path);
        } else {
            debug!(delay_ms = delay, "writer: delaying in-file mode switch");
            let done = {
                let weak = self.self_weak.clone();
                let event_loop = self.runtime.event_loop.clone();
                let request = request.clone();
                Box::new(move || {
                    event_loop.dispatch(Box::new(move || {
                        if request.is_cancelled() {
                            return;
                        }
                        let Some(cell) = weak.upgrade() else {
                            return;
                        };
                        let mut chan = cell.lock();
                        if request.is_cancelled() {
                            return;
                        }
                        chan.on_delay_elapsed(path);
                    }));
                })
            };
            self.runtime.io.submit(request, IoJob::Delay { ms: delay, done });
        }
    }

    fn on_delay_elapsed(&mut self, path: PathBuf) {
        debug!(path = %path.display(), "writer: delay elapsed, creating spill file");
        debug_assert_eq!(self.mode, Mode::InFile);
        let request = self
            .in_file
            .as_ref()
            .expect("in-file state missing in in-file mode")
            .writer_request
            .clone()
            .expect("creating file without a writer request");
        self.submit_open(request, path);
    }

    fn submit_open(&mut self, request: Arc<IoRequest>, path: PathBuf) {
        let done = {
            let weak = self.self_weak.clone();
            let event_loop = self.runtime.event_loop.clone();
            let io = self.runtime.io.clone();
            let request = request.clone();
            let path = path.clone();
            Box::new(move |result: io::Result<std::fs::File>| {
                event_loop.dispatch(Box::new(move || {
                    // The channel moved on; if the file materialised
                    // anyway, delete it in the background.
                    if request.is_cancelled() {
                        if let Ok(file) = result {
                            debug!(path = %path.display(), "writer: cancelled spill file, deleting");
                            submit_unlink(&io, path);
                            drop(file);
                        }
                        return;
                    }
                    let Some(cell) = weak.upgrade() else {
                        if let Ok(file) = result {
                            submit_unlink(&io, path);
                            drop(file);
                        }
                        return;
                    };
                    let mut chan = cell.lock();
                    if request.is_cancelled() {
                        drop(chan);
                        if let Ok(file) = result {
                            debug!(path = %path.display(), "writer: cancelled spill file, deleting");
                            submit_unlink(&io, path);
                            drop(file);
                        }
                        return;
                    }
                    chan.on_spill_file_created(path, result);
                }));
            })
        };
        self.runtime.io.submit(request, IoJob::Open { path, done });
    }

    fn on_spill_file_created(&mut self, path: PathBuf, result: io::Result<std::fs::File>) {
        debug_assert_eq!(self.mode, Mode::InFile);
        debug_assert_eq!(self.writer_state(), Some(WriterState::CreatingFile));
        self.verify_invariants();
        self.in_file
            .as_mut()
            .expect("create completion outside in-file mode")
            .writer_request = None;
        match result {
            Ok(file) => {
                debug!(path = %path.display(), "writer: spill file created, unlinking directory entry");
                submit_unlink(&self.runtime.io, path);
                self.in_file
                    .as_ref()
                    .expect("create completion outside in-file mode")
                    .file
                    .install(file);
                self.move_next_buffer_to_file();
            }
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                debug!(path = %path.display(), "writer: spill file name collision, retrying");
                self.metrics.incr_create_retries();
                self.in_file
                    .as_mut()
                    .expect("create completion outside in-file mode")
                    .writer_state = WriterState::Inactive;
                self.create_spill_file();
                self.verify_invariants();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "writer: spill file creation failed");
                self.set_error(errno_of(&err));
            }
        }
    }

    /***** Writer: mover *****/

    fn move_next_buffer_to_file(&mut self) {
        debug_assert_eq!(self.mode, Mode::InFile);
        debug_assert!(
            self.in_file
                .as_ref()
                .expect("mover outside in-file mode")
                .file
                .is_open()
        );
        self.verify_invariants();
        if !self.queue.has_buffers() {
            debug!("writer: queue drained, going inactive");
            self.in_file
                .as_mut()
                .expect("mover outside in-file mode")
                .writer_state = WriterState::Inactive;
            return;
        }
        if self.queue.peek_front().is_empty() {
            debug!("writer: end of stream at queue head, terminating");
            self.in_file
                .as_mut()
                .expect("mover outside in-file mode")
                .writer_state = WriterState::Terminated;
            return;
        }
        let buffer = self.queue.peek_front().clone();
        debug!(len = buffer.len(), "writer: moving buffer to spill file");
        let request = IoRequest::new();
        let base_offset = {
            let in_file = self.in_file.as_mut().expect("mover outside in-file mode");
            in_file.writer_state = WriterState::Moving;
            in_file.writer_request = Some(request.clone());
            // read_offset + written never goes negative: the sum is the
            // total byte count already moved to disk.
            (in_file.read_offset as i64 + in_file.written) as u64
        };
        self.submit_move(request, buffer, 0, base_offset);
        self.verify_invariants();
    }

    fn submit_move(&mut self, request: Arc<IoRequest>, buffer: Bytes, moved: usize, base_offset: u64) {
        let file = self
            .in_file
            .as_ref()
            .expect("move submit outside in-file mode")
            .file
            .clone();
        let chunk = buffer.slice(moved..);
        let done = {
            let weak = self.self_weak.clone();
            let event_loop = self.runtime.event_loop.clone();
            let request = request.clone();
            let file = file.clone();
            Box::new(move |result: io::Result<usize>| {
                event_loop.dispatch(Box::new(move || {
                    let _keep_open = file;
                    if request.is_cancelled() {
                        return;
                    }
                    let Some(cell) = weak.upgrade() else {
                        return;
                    };
                    let mut chan = cell.lock();
                    if request.is_cancelled() {
                        return;
                    }
                    chan.on_buffer_moved(buffer, moved, base_offset, result);
                }));
            })
        };
        self.runtime.io.submit(
            request,
            IoJob::WriteAt {
                file,
                buf: chunk,
                offset: base_offset + moved as u64,
                done,
            },
        );
    }

    fn on_buffer_moved(
        &mut self,
        buffer: Bytes,
        moved: usize,
        base_offset: u64,
        result: io::Result<usize>,
    ) {
        debug_assert_eq!(self.mode, Mode::InFile);
        debug_assert_eq!(self.writer_state(), Some(WriterState::Moving));
        debug_assert!(!self.queue.peek_front().is_empty());
        self.verify_invariants();
        match result {
            Ok(n) => {
                let moved = moved + n;
                debug_assert!(moved <= buffer.len());
                if moved == buffer.len() {
                    let generation = self.generation;
                    debug!(len = buffer.len(), "writer: move complete");
                    debug_assert_eq!(self.queue.peek_front().len(), buffer.len());
                    self.in_file
                        .as_mut()
                        .expect("move completion outside in-file mode")
                        .written += buffer.len() as i64;
                    self.metrics.add_bytes_spilled(buffer.len() as u64);
                    self.pop_buffer();
                    if self.generation != generation || self.mode >= Mode::ErrorWaiting {
                        return;
                    }
                    self.in_file
                        .as_mut()
                        .expect("move completion outside in-file mode")
                        .writer_request = None;
                    self.move_next_buffer_to_file();
                } else {
                    debug!(moved, total = buffer.len(), "writer: short write, resuming");
                    self.metrics.incr_short_write_resumes();
                    let request = self
                        .in_file
                        .as_ref()
                        .expect("move completion outside in-file mode")
                        .writer_request
                        .clone()
                        .expect("moving without a writer request");
                    self.submit_move(request, buffer, moved, base_offset);
                    self.verify_invariants();
                }
            }
            Err(err) => {
                warn!(error = %err, "writer: spill write failed");
                let errcode = errno_of(&err);
                {
                    let in_file = self
                        .in_file
                        .as_mut()
                        .expect("move completion outside in-file mode");
                    in_file.writer_request = None;
                    in_file.writer_state = WriterState::Terminated;
                }
                self.set_error(errcode);
            }
        }
    }

    /***** Error coordinator *****/

    /// Latch the first error, cancel both state machines, and deliver the
    /// error as soon as the conduit allows. Later errors are dropped.
    fn set_error(&mut self, errcode: i32) {
        if self.mode >= Mode::ErrorWaiting {
            return;
        }
        warn!(errcode, "latching channel error");
        self.metrics.incr_errors_latched();
        self.cancel_reader();
        if self.mode == Mode::InFile {
            self.cancel_writer();
        }
        self.reader_state = ReaderState::Terminated;
        self.errcode = errcode;
        self.in_file = None;
        if self.sink_accepting() {
            debug!("feeding error");
            self.mode = Mode::Error;
            self.sink_feed_error(errcode);
        } else {
            debug!("conduit busy, deferring error delivery");
            self.mode = Mode::ErrorWaiting;
        }
    }

    /// Must be paired with `set_error` so the reader stops once it returns
    /// from the conduit.
    fn cancel_reader(&mut self) {
        match self.reader_state {
            ReaderState::Feeding
            | ReaderState::FeedingEof
            | ReaderState::WaitingForChannelIdle => {}
            ReaderState::ReadingFromFile => {
                let in_file = self
                    .in_file
                    .as_mut()
                    .expect("reading from file without in-file state");
                if let Some(request) = in_file.read_request.take() {
                    request.cancel();
                }
            }
            ReaderState::Inactive | ReaderState::Terminated => {}
        }
    }

    fn cancel_writer(&mut self) {
        debug_assert_eq!(self.mode, Mode::InFile);
        let in_file = self
            .in_file
            .as_mut()
            .expect("in-file state missing in in-file mode");
        match in_file.writer_state {
            WriterState::Inactive => {}
            WriterState::CreatingFile | WriterState::Moving => {
                if let Some(request) = in_file.writer_request.take() {
                    request.cancel();
                }
            }
            WriterState::Terminated => return,
        }
        in_file.writer_state = WriterState::Inactive;
    }

    /***** Queue plumbing *****/

    fn pop_buffer(&mut self) {
        let emptied = self.queue.pop_front();
        if emptied {
            self.call_buffers_flushed();
        }
    }

    fn call_buffers_flushed(&mut self) {
        if let Some(mut callback) = self.buffers_flushed.take() {
            debug!("calling buffers_flushed callback");
            callback(self);
            if self.buffers_flushed.is_none() {
                self.buffers_flushed = Some(callback);
            }
        }
    }

    fn call_data_flushed(&mut self) {
        if let Some(mut callback) = self.data_flushed.take() {
            debug!("calling data_flushed callback");
            callback(self);
            if self.data_flushed.is_none() {
                self.data_flushed = Some(callback);
            }
        }
    }

    fn verify_invariants(&self) {
        #[cfg(debug_assertions)]
        {
            if self.mode >= Mode::ErrorWaiting {
                assert_eq!(self.reader_state, ReaderState::Terminated);
                assert!(self.in_file.is_none());
            }
            match self.reader_state {
                ReaderState::WaitingForChannelIdle => {
                    assert!(self.mode < Mode::ErrorWaiting);
                }
                ReaderState::ReadingFromFile => {
                    assert_eq!(self.mode, Mode::InFile);
                    let in_file = self.in_file.as_ref().expect("in-file state missing");
                    assert!(in_file.read_request.is_some());
                    assert!(in_file.written > 0);
                }
                _ => {}
            }
            assert_eq!(self.errcode == 0, self.mode < Mode::ErrorWaiting);
            assert_eq!(self.in_file.is_some(), self.mode == Mode::InFile);
            if let Some(in_file) = &self.in_file {
                if in_file.written < 0 {
                    assert!(self.queue.has_buffers());
                }
                if in_file.writer_state == WriterState::Moving {
                    assert!(self.queue.has_buffers());
                }
            }
        }
    }
}

fn submit_unlink(io: &IoPoolHandle, path: PathBuf) {
    let request = IoRequest::new();
    let log_path = path.clone();
    let done = Box::new(move |result: io::Result<()>| match result {
        Ok(()) => debug!(path = %log_path.display(), "spill file unlinked"),
        Err(err) => {
            warn!(path = %log_path.display(), error = %err, "failed to unlink spill file")
        }
    });
    io.submit(request, IoJob::Unlink { path, done });
}

impl ChannelHandle {
    pub fn feed(&self, buffer: Bytes) {
        self.cell.lock().feed(buffer);
    }

    pub fn feed_slice(&self, data: &[u8]) {
        self.cell.lock().feed_slice(data);
    }

    pub fn feed_static(&self, data: &'static [u8]) {
        self.cell.lock().feed_static(data);
    }

    pub fn feed_error(&self, errcode: i32) {
        self.cell.lock().feed_error(errcode);
    }

    pub fn consumed(&self, size: usize, end: bool) {
        self.cell.lock().consumed(size, end);
    }

    pub fn reinitialize(&self) {
        self.cell.lock().reinitialize();
    }

    pub fn deinitialize(&self) {
        self.cell.lock().deinitialize();
    }

    pub fn ended(&self) -> bool {
        self.cell.lock().ended()
    }

    pub fn mode(&self) -> Mode {
        self.cell.lock().mode()
    }

    pub fn reader_state(&self) -> ReaderState {
        self.cell.lock().reader_state()
    }

    pub fn writer_state(&self) -> Option<WriterState> {
        self.cell.lock().writer_state()
    }

    pub fn bytes_buffered(&self) -> u32 {
        self.cell.lock().bytes_buffered()
    }

    pub fn error_code(&self) -> i32 {
        self.cell.lock().error_code()
    }

    pub fn sink_state(&self) -> SinkState {
        self.cell.lock().sink_state()
    }

    pub fn metrics(&self) -> Arc<SpillMetrics> {
        self.cell.lock().metrics()
    }

    pub fn set_data_callback<F>(&self, callback: F)
    where
        F: FnMut(&mut SpillChannel, Payload) -> Consumption + Send + 'static,
    {
        self.cell.lock().set_data_callback(callback);
    }

    pub fn set_buffers_flushed_callback<F>(&self, callback: F)
    where
        F: FnMut(&mut SpillChannel) + Send + 'static,
    {
        self.cell.lock().set_buffers_flushed_callback(callback);
    }

    pub fn set_data_flushed_callback<F>(&self, callback: F)
    where
        F: FnMut(&mut SpillChannel) + Send + 'static,
    {
        self.cell.lock().set_data_flushed_callback(callback);
    }

    /// Run a closure against the locked channel. Handy for grouped setup
    /// and for assertions over several fields at once.
    pub fn with<R>(&self, f: impl FnOnce(&mut SpillChannel) -> R) -> R {
        f(&mut self.cell.lock())
    }
}
