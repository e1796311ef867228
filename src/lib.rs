//! Unbounded buffering in front of a capacity-1 conduit.
//!
//! A consumer behind a [`SpillChannel`] can only process one buffer at a
//! time, but producers rarely pace themselves that politely. This crate
//! buffers everything a producer feeds: below a configured threshold the
//! backlog lives in memory, and past it a background writer moves queued
//! buffers into an anonymous temporary file and streams them back out,
//! recovering memory while preserving byte order and end-of-stream
//! semantics.
//!
//! ## Architecture
//!
//! - **Coordinator event loop**: a dedicated thread on which every channel
//!   state transition and consumer callback runs.
//! - **I/O worker pool**: executes file creation, positioned reads and
//!   writes, unlinks, and delays; completions are marshalled back onto the
//!   loop and carry cancellation flags so teardown can disown them.
//! - **Three state machines** per channel: the reader draining memory or
//!   disk into the conduit, the writer moving queued buffers to the spill
//!   file, and the mode/error coordinator that latches the first failure and
//!   defers its delivery until the consumer is idle.
//!
//! Spill files are opened create-exclusive and unlinked immediately, so an
//! aborted process leaves nothing behind.
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use spillchan::{
//!     ChannelConfig, Consumption, Payload, Runtime, SpillChannel,
//! };
//!
//! fn main() -> spillchan::ChannelResult<()> {
//!     let runtime = Runtime::with_defaults()?;
//!     let channel = SpillChannel::build(runtime.handle(), ChannelConfig::default())?;
//!     channel.set_data_callback(|_chan, payload| match payload {
//!         Payload::Data(data) if data.is_empty() => {
//!             println!("end of stream");
//!             Consumption::Consumed(0)
//!         }
//!         Payload::Data(data) => {
//!             println!("got {} bytes", data.len());
//!             Consumption::Consumed(data.len())
//!         }
//!         Payload::Error(errno) => {
//!             eprintln!("stream failed: errno {errno}");
//!             Consumption::Consumed(0)
//!         }
//!     });
//!
//!     channel.feed(Bytes::from_static(b"hello"));
//!     channel.feed(Bytes::new()); // end of stream
//!     Ok(())
//! }
//! ```
//!
//! ## Scheduling model
//!
//! Channels are not thread-safe in the aggregate sense: the handle serialises
//! access internally, and consumer callbacks receive `&mut SpillChannel` for
//! reentrant calls (feeding more data, querying state, tearing down). Do not
//! call handle methods from inside a callback.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod io;
pub mod metrics;
pub mod pool;
pub mod runtime;
pub mod spill;
pub mod test_support;

pub use buffer::{BufferQueue, MAX_BUFFERS, MAX_MEMORY_BUFFERING};
pub use channel::{Consumption, FeedOutcome, Payload, SinkState};
pub use config::{ChannelConfig, RuntimeConfig};
pub use error::{errno_of, ChannelError, ChannelResult};
pub use metrics::{SpillMetrics, SpillMetricsSnapshot};
pub use pool::BufferPool;
pub use runtime::{Runtime, RuntimeHandle};
pub use spill::{ChannelHandle, Mode, ReaderState, SpillChannel, WriterState};
