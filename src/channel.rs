//! Vocabulary of the downstream capacity-1 conduit.
//!
//! The conduit delivers one buffer at a time to the consumer callback and
//! reports back how the consumer fared. An empty data buffer is the
//! end-of-stream marker.

use std::fmt::{self, Display, Formatter};

use bytes::Bytes;

/// What the conduit delivers to the consumer callback.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A buffer of stream data. Empty means end of stream.
    Data(Bytes),
    /// The latched channel error, as an errno.
    Error(i32),
}

impl Payload {
    /// True for the end-of-stream marker.
    pub fn is_end(&self) -> bool {
        matches!(self, Payload::Data(data) if data.is_empty())
    }
}

/// The consumer's verdict on a delivered buffer.
///
/// `Consumed(n)` with `n` short of the buffer length means the remainder is
/// redelivered immediately; `Deferred` parks the conduit until the consumer
/// calls `consumed` from outside the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// `n` bytes were processed; the consumer is ready for more.
    Consumed(usize),
    /// `n` bytes were processed and the consumer wants nothing further.
    ConsumedAndEnd(usize),
    /// The consumer will report consumption later via `consumed`.
    Deferred,
}

/// Tri-valued acceptance probe after feeding the conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The conduit is idle again; feed the next buffer.
    AcceptingMore,
    /// The conduit is busy; wait for the consumed notification.
    MayAcceptLater,
    /// The conduit accepts nothing further.
    Ended,
}

/// State of the downstream conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Nothing in flight; a buffer may be fed.
    Idle,
    /// The consumer callback is running.
    Calling,
    /// A fed buffer is pending a deferred `consumed` report.
    Waiting,
    /// End of stream or error was delivered; the conduit is finished.
    Ended,
}

impl Display for SinkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SinkState::Idle => write!(f, "idle"),
            SinkState::Calling => write!(f, "calling"),
            SinkState::Waiting => write!(f, "waiting"),
            SinkState::Ended => write!(f, "ended"),
        }
    }
}
