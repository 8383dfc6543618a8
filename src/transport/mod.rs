//! Transport adapters
//!
//! The engines are written once against [`TransportAdapter`]. Two backends
//! implement it:
//!
//! - [`ChannelTransport`]: a classic socket channel. Zero-wait calls never
//!   wait, blocking calls park on socket readiness with a timeout, and
//!   asynchronous operations are handed to an event loop owned by the
//!   transport.
//! - [`PipelineTransport`]: a tokio event pipeline where every operation is
//!   asynchronous. Zero-wait probes are emulated by parking the caller on a
//!   bounded wait.
//!
//! Both report the same three outcomes for every operation: a definite
//! result, [`Submitted::Pending`] with a later callback, or a failure.

pub mod channel;
pub mod pipeline;

pub use channel::ChannelTransport;
pub use pipeline::PipelineTransport;

use crate::buffer::Buffer;
use crate::error::{Direction, TransportError};
use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filled {
    /// `n > 0` bytes were written into the buffer's spare region.
    Bytes(usize),
    /// The peer closed its sending half.
    Eof,
    /// Nothing was available for a zero-wait read.
    Empty,
}

/// How long a synchronous read may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWait {
    /// Best effort, return [`Filled::Empty`] rather than wait.
    Immediate,
    /// Block until data, EOF or the timeout. `None` waits forever.
    Within(Option<Duration>),
}

/// A buffer handed back by a read, with what happened to it.
#[derive(Debug)]
pub struct ReadCompletion {
    pub buf: Buffer,
    pub result: Result<Filled, TransportError>,
}

/// Buffers handed back by a write, with the byte count or failure.
#[derive(Debug)]
pub struct WriteCompletion {
    pub bufs: Vec<Buffer>,
    pub result: Result<usize, TransportError>,
}

/// Result of submitting an operation that may complete later.
#[derive(Debug)]
pub enum Submitted<T> {
    /// Completed on the submitting thread. The callback is dropped unused.
    Done(T),
    /// The callback will run exactly once, on a transport thread.
    Pending,
}

impl<T> Submitted<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Submitted::Pending)
    }
}

pub type ReadCallback = Box<dyn FnOnce(ReadCompletion) + Send + 'static>;
pub type WriteCallback = Box<dyn FnOnce(WriteCompletion) + Send + 'static>;
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Side channel invoked once for every operation that times out.
pub type TimeoutHandler = Arc<dyn Fn(Direction, Duration) + Send + Sync + 'static>;

/// Which backend an adapter is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Channel,
    Pipeline,
}

/// Uniform contract over the transport backends.
///
/// At most one read and one write are outstanding at a time; the engines
/// enforce that. Write buffers must be in the drain phase.
pub trait TransportAdapter: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Read into `buf`'s spare region on the calling thread.
    fn read(&self, buf: Buffer, wait: ReadWait) -> ReadCompletion;

    /// Start a read whose result is delivered to `done`.
    ///
    /// With `force_queue` the read always goes [`Submitted::Pending`], even
    /// when data is already available.
    fn read_async(
        &self,
        buf: Buffer,
        timeout: Option<Duration>,
        force_queue: bool,
        done: ReadCallback,
    ) -> Submitted<ReadCompletion>;

    /// Cancel the outstanding asynchronous read, if any.
    ///
    /// `Done` means nothing is left to wait for. `Pending` means the read's
    /// callback is still to come, carrying [`TransportError::Cancelled`] or
    /// data that raced the cancellation.
    fn cancel_read(&self) -> Submitted<()>;

    /// Write every buffer completely, blocking the calling thread.
    fn write(&self, bufs: Vec<Buffer>, timeout: Option<Duration>) -> WriteCompletion;

    /// Write every buffer, completing later if the transport cannot take the
    /// bytes right away.
    fn write_async(
        &self,
        bufs: Vec<Buffer>,
        timeout: Option<Duration>,
        done: WriteCallback,
    ) -> Submitted<WriteCompletion>;

    /// Run `task` on a transport-owned thread.
    fn execute(&self, task: Task);

    /// Tear down the underlying connection.
    fn shutdown(&self);
}

pub(crate) fn fire_timeout(handler: &Option<TimeoutHandler>, op: Direction, after: Duration) -> TransportError {
    tracing::warn!(op = %op, after = ?after, "transport operation timed out");
    if let Some(handler) = handler {
        handler(op, after);
    }
    TransportError::Timeout { op, after }
}

/// Unread chunks of every non-empty buffer, for one vectored write.
pub(crate) fn io_slices(bufs: &[Buffer]) -> Vec<IoSlice<'_>> {
    bufs.iter()
        .filter(|b| b.has_remaining())
        .map(|b| IoSlice::new(b.chunk()))
        .collect()
}

/// Mark `n` written bytes as drained, front to back.
pub(crate) fn consume(bufs: &mut [Buffer], n: usize) {
    let mut left = n;
    for buf in bufs.iter_mut() {
        if left == 0 {
            break;
        }
        let step = left.min(buf.remaining());
        buf.advance(step);
        left -= step;
    }
}

pub(crate) fn unwritten(bufs: &[Buffer]) -> usize {
    bufs.iter().map(Buffer::remaining).sum()
}
