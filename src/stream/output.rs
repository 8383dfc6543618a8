//! Write half of an upgraded connection.
//!
//! Writes are copied into a ring of pooled chunks. When the buffered total
//! reaches the threshold (`amount_to_buffer`) the ring is flushed
//! automatically.
//!
//! Without a listener flushes block on the transport. With a
//! [`WriteListener`] a flush is one vectored asynchronous write:
//!
//! ```text
//!   Idle ──threshold──▶ FlushPending ──completed inline──▶ Idle
//!                            │
//!                            └─went async─▶ not ready ──callback──▶ Idle
//!                                                          (+ drain parked write)
//!   any ──I/O failure──▶ Error
//!   any ──close, nothing in flight──▶ Closed
//!   any ──close, flush in flight──▶ Closing ──callback──▶ Closed
//! ```
//!
//! While a flush is in flight the remainder of the current write is parked
//! as the single pending write and replayed when the flush completes.

use crate::buffer::{Buffer, BufferPool};
use crate::error::{Direction, StateViolation, StreamError, TransportError};
use crate::stream::connection::{CloseLatch, ConnectionId};
use crate::stream::listener::{WriteCoordinator, WriteListener};
use crate::transport::{Submitted, TransportAdapter, WriteCompletion};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Observable state of the write side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Buffering,
    /// A flush is outstanding; the application sees "not ready".
    FlushPending,
    Closing,
    Closed,
    Error,
}

/// Output engine sizing and timeouts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutputLimits {
    pub threshold: usize,
    pub chunk_size: usize,
    pub write_timeout: Option<Duration>,
    pub run_inline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flushed {
    Done,
    Pending,
}

/// Arena of equally sized chunks; the active chunk is the first with room.
struct Ring {
    chunks: Vec<Buffer>,
    buffered: usize,
    in_flight: bool,
    released: bool,
}

impl Ring {
    /// Copy as much of `src` as fits below the threshold.
    fn fill(&mut self, src: &[u8], limits: &OutputLimits, pool: &BufferPool) -> usize {
        let mut taken = 0;
        while taken < src.len() && self.buffered < limits.threshold {
            let room = limits.threshold - self.buffered;
            let end = taken + room.min(src.len() - taken);
            let Some(chunk) = self.active_chunk(limits.chunk_size, pool) else {
                break;
            };
            let n = chunk.put(&src[taken..end]);
            taken += n;
            self.buffered += n;
        }
        taken
    }

    fn active_chunk(&mut self, chunk_size: usize, pool: &BufferPool) -> Option<&mut Buffer> {
        if !self.chunks.iter().any(Buffer::has_remaining) {
            self.chunks.push(pool.acquire(chunk_size));
        }
        self.chunks.iter_mut().find(|c| c.has_remaining())
    }

    /// Non-empty chunks, flipped for draining, in write order.
    fn take_filled(&mut self) -> Vec<Buffer> {
        let (mut out, keep): (Vec<Buffer>, Vec<Buffer>) =
            std::mem::take(&mut self.chunks).into_iter().partition(|c| c.filled() > 0);
        self.chunks = keep;
        for chunk in out.iter_mut() {
            chunk.flip();
        }
        out
    }

    fn restore(&mut self, bufs: Vec<Buffer>, pool: &BufferPool) {
        self.buffered = 0;
        self.in_flight = false;
        if self.released {
            pool.release_all(bufs);
            return;
        }
        for mut buf in bufs {
            buf.clear();
            self.chunks.push(buf);
        }
    }
}

/// Readiness and the parked write, guarded apart from close bookkeeping.
struct Flow {
    /// No flush in flight; gates engine-initiated writes.
    write_ready: bool,
    /// What `is_ready()` reports to the application.
    ready_for_app: bool,
    pending: Option<Bytes>,
    draining: bool,
    /// The application saw "not ready" and is owed `on_write_possible`.
    owed: bool,
}

struct Life {
    closing: bool,
    closed: bool,
    latched: Option<TransportError>,
    listener: Option<Arc<WriteCoordinator>>,
}

pub(crate) struct OutputShared {
    id: ConnectionId,
    transport: Arc<dyn TransportAdapter>,
    pool: BufferPool,
    limits: OutputLimits,
    ring: Mutex<Ring>,
    flow: Mutex<Flow>,
    life: Mutex<Life>,
    latch: Arc<CloseLatch>,
}

/// Output engine handle. Clones share the same write side.
#[derive(Clone)]
pub struct OutputEngine {
    shared: Arc<OutputShared>,
}

impl OutputEngine {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Arc<dyn TransportAdapter>,
        pool: BufferPool,
        limits: OutputLimits,
        latch: Arc<CloseLatch>,
    ) -> Self {
        Self {
            shared: Arc::new(OutputShared {
                id,
                transport,
                pool,
                limits,
                ring: Mutex::new(Ring {
                    chunks: Vec::new(),
                    buffered: 0,
                    in_flight: false,
                    released: false,
                }),
                flow: Mutex::new(Flow {
                    write_ready: true,
                    ready_for_app: true,
                    pending: None,
                    draining: false,
                    owed: false,
                }),
                life: Mutex::new(Life {
                    closing: false,
                    closed: false,
                    latched: None,
                    listener: None,
                }),
                latch,
            }),
        }
    }

    pub fn state(&self) -> WriteState {
        {
            let life = self.shared.life.lock();
            if life.closed {
                return WriteState::Closed;
            }
            if life.closing {
                return WriteState::Closing;
            }
            if life.latched.is_some() {
                return WriteState::Error;
            }
        }
        let ring = self.shared.ring.lock();
        if ring.in_flight {
            WriteState::FlushPending
        } else if ring.buffered > 0 {
            WriteState::Buffering
        } else {
            WriteState::Idle
        }
    }

    /// Bytes sitting in the ring, including any handed to an in-flight flush.
    pub fn buffered(&self) -> usize {
        self.shared.ring.lock().buffered
    }

    pub fn threshold(&self) -> usize {
        self.shared.limits.threshold
    }

    pub fn chunk_size(&self) -> usize {
        self.shared.limits.chunk_size
    }

    /// Buffer `data`, flushing each time the threshold is reached.
    ///
    /// In readiness mode this never blocks; the caller must have seen
    /// [`is_ready`](Self::is_ready) return true.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        let shared = &self.shared;
        let nonblocking = shared.check_writable()?;
        if nonblocking {
            let flow = shared.flow.lock();
            if flow.pending.is_some() {
                return Err(StateViolation::WriteOutstanding.into());
            }
            if !flow.ready_for_app {
                return Err(StateViolation::NotReady.into());
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        shared.write_to_buffers(data, nonblocking)
    }

    /// Push buffered bytes to the transport.
    ///
    /// Blocking without a listener; otherwise starts an asynchronous flush.
    pub fn flush(&self) -> Result<(), StreamError> {
        let shared = &self.shared;
        if shared.check_writable()? {
            if !shared.flow.lock().ready_for_app {
                return Err(StateViolation::NotReady.into());
            }
            shared.flush_async().map(|_| ())
        } else {
            shared.flush_blocking()
        }
    }

    /// Whether a write can proceed without blocking.
    pub fn is_ready(&self) -> bool {
        {
            let life = self.shared.life.lock();
            if life.closed || life.closing || life.latched.is_some() {
                return false;
            }
            if life.listener.is_none() {
                return true;
            }
        }
        self.is_write_ready_work(true)
    }

    /// Readiness as seen by the application.
    ///
    /// An external caller that is told "not ready" is owed an
    /// `on_write_possible` once the outstanding flush completes, and any
    /// write it attempts meanwhile is rejected.
    pub fn is_write_ready_work(&self, external: bool) -> bool {
        let mut flow = self.shared.flow.lock();
        if flow.ready_for_app {
            return true;
        }
        if external {
            flow.owed = true;
        }
        false
    }

    /// Switch to readiness mode.
    ///
    /// One `on_write_possible` follows registration, inline when
    /// `run_inline` is set and on a transport thread otherwise.
    pub fn set_write_listener(&self, listener: Arc<dyn WriteListener>) -> Result<(), StreamError> {
        let shared = &self.shared;
        let coordinator = Arc::new(WriteCoordinator::new(listener));
        {
            let mut life = shared.life.lock();
            if life.listener.is_some() {
                return Err(StateViolation::ListenerAlreadySet.into());
            }
            if let Some(err) = &life.latched {
                return Err(err.clone().into());
            }
            if life.closed || life.closing {
                return Err(StateViolation::Closed.into());
            }
            life.listener = Some(Arc::clone(&coordinator));
        }

        tracing::debug!(conn = %shared.id, inline = shared.limits.run_inline, "write listener registered");
        if shared.limits.run_inline {
            coordinator.write_possible();
        } else {
            shared
                .transport
                .execute(Box::new(move || coordinator.write_possible()));
        }
        Ok(())
    }

    /// Flush what is buffered and release the ring.
    ///
    /// In readiness mode a flush that goes asynchronous defers the close to
    /// its completion callback.
    pub fn close(&self) -> Result<(), StreamError> {
        let shared = &self.shared;
        let nonblocking = {
            let mut life = shared.life.lock();
            if life.closed || life.closing {
                return Ok(());
            }
            if life.latched.is_some() {
                drop(life);
                shared.finish_close();
                return Ok(());
            }
            let nonblocking = life.listener.is_some();
            if nonblocking {
                life.closing = true;
            }
            nonblocking
        };

        if nonblocking {
            {
                let flow = shared.flow.lock();
                if !flow.write_ready || flow.draining {
                    tracing::debug!(conn = %shared.id, "output close deferred until flush completes");
                    return Ok(());
                }
            }
            shared.continue_close();
            Ok(())
        } else {
            let flushed = shared.flush_blocking();
            shared.finish_close();
            flushed
        }
    }
}

impl OutputShared {
    /// Latched error first, then closed; returns whether readiness mode is on.
    fn check_writable(&self) -> Result<bool, StreamError> {
        let life = self.life.lock();
        if let Some(err) = &life.latched {
            return Err(err.clone().into());
        }
        if life.closed || life.closing {
            return Err(StateViolation::Closed.into());
        }
        Ok(life.listener.is_some())
    }

    fn write_to_buffers(self: &Arc<Self>, data: &[u8], nonblocking: bool) -> Result<(), StreamError> {
        let mut offset = 0;
        while offset < data.len() {
            let (taken, full, in_flight) = {
                let mut ring = self.ring.lock();
                if ring.in_flight {
                    (0, false, true)
                } else {
                    let n = ring.fill(&data[offset..], &self.limits, &self.pool);
                    (n, ring.buffered >= self.limits.threshold, false)
                }
            };
            offset += taken;

            if in_flight {
                if self.park(&data[offset..])? {
                    return Ok(());
                }
                continue;
            }

            if full {
                if !nonblocking {
                    self.flush_blocking()?;
                } else if self.flush_async()? == Flushed::Pending
                    && offset < data.len()
                    && self.park(&data[offset..])?
                {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Hold `rest` until the in-flight flush completes.
    ///
    /// Returns false if that flush already finished, in which case the
    /// caller keeps copying.
    fn park(&self, rest: &[u8]) -> Result<bool, StreamError> {
        let mut flow = self.flow.lock();
        if flow.write_ready {
            return Ok(false);
        }
        if flow.pending.is_some() {
            return Err(StateViolation::WriteOutstanding.into());
        }
        tracing::trace!(conn = %self.id, bytes = rest.len(), "write parked behind outstanding flush");
        flow.pending = Some(Bytes::copy_from_slice(rest));
        Ok(true)
    }

    fn flush_blocking(&self) -> Result<(), StreamError> {
        let out = self.ring.lock().take_filled();
        if out.is_empty() {
            return Ok(());
        }

        let WriteCompletion { bufs, result } = self.transport.write(out, self.limits.write_timeout);
        self.ring.lock().restore(bufs, &self.pool);
        match result {
            Ok(n) => {
                tracing::debug!(conn = %self.id, bytes = n, "blocking flush complete");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn flush_async(self: &Arc<Self>) -> Result<Flushed, StreamError> {
        if let Some(err) = self.life.lock().latched.clone() {
            return Err(err.into());
        }
        let out = {
            let mut ring = self.ring.lock();
            if ring.in_flight {
                return Ok(Flushed::Pending);
            }
            let out = ring.take_filled();
            if out.is_empty() {
                return Ok(Flushed::Done);
            }
            ring.in_flight = true;
            out
        };
        {
            let mut flow = self.flow.lock();
            flow.write_ready = false;
            flow.ready_for_app = false;
        }

        let this = Arc::clone(self);
        let submitted = self.transport.write_async(
            out,
            self.limits.write_timeout,
            Box::new(move |completion| this.on_flush_complete(completion)),
        );

        match submitted {
            Submitted::Pending => {
                tracing::debug!(conn = %self.id, "flush went asynchronous");
                Ok(Flushed::Pending)
            }
            Submitted::Done(WriteCompletion { bufs, result }) => {
                self.ring.lock().restore(bufs, &self.pool);
                {
                    let mut flow = self.flow.lock();
                    flow.write_ready = true;
                    if !flow.draining {
                        flow.ready_for_app = true;
                    }
                }
                match result {
                    Ok(n) => {
                        tracing::debug!(conn = %self.id, bytes = n, "flush completed inline");
                        Ok(Flushed::Done)
                    }
                    Err(err) => Err(self.fail(err)),
                }
            }
        }
    }

    fn on_flush_complete(self: &Arc<Self>, completion: WriteCompletion) {
        let WriteCompletion { bufs, result } = completion;
        self.ring.lock().restore(bufs, &self.pool);

        // latch before the direction looks writable again
        let n = match result {
            Ok(n) => n,
            Err(err) => {
                self.fail(err);
                {
                    let mut flow = self.flow.lock();
                    flow.write_ready = true;
                    flow.pending = None;
                    flow.draining = false;
                }
                if self.life.lock().closing {
                    self.finish_close();
                }
                return;
            }
        };
        tracing::debug!(conn = %self.id, bytes = n, "async flush complete");

        let pending = {
            let mut flow = self.flow.lock();
            flow.write_ready = true;
            let pending = flow.pending.take();
            flow.draining = pending.is_some();
            pending
        };

        if let Some(bytes) = pending {
            if let Err(err) = self.write_to_buffers(&bytes, true) {
                tracing::debug!(conn = %self.id, error = %err, "replaying parked write failed");
            }
        }
        self.after_flush();
    }

    /// Re-enable the application once no flush is in flight.
    fn after_flush(self: &Arc<Self>) {
        let owed = {
            let mut flow = self.flow.lock();
            flow.draining = false;
            if !flow.write_ready {
                return;
            }
            flow.ready_for_app = true;
            std::mem::take(&mut flow.owed)
        };

        let (closing, failed, listener) = {
            let life = self.life.lock();
            (life.closing, life.latched.is_some(), life.listener.clone())
        };
        if closing {
            self.continue_close();
            return;
        }
        if owed && !failed {
            if let Some(listener) = listener {
                listener.write_possible();
            }
        }
    }

    fn continue_close(self: &Arc<Self>) {
        match self.flush_async() {
            Ok(Flushed::Pending) => {}
            Ok(Flushed::Done) | Err(_) => self.finish_close(),
        }
    }

    /// Latch `err` and tell the listener once.
    fn fail(&self, err: TransportError) -> StreamError {
        let reported = StreamError::from(err.clone());
        let listener = {
            let mut life = self.life.lock();
            if life.latched.is_none() {
                life.latched = Some(err);
            }
            life.listener.clone()
        };
        tracing::warn!(conn = %self.id, error = %reported, "write failed");
        if let Some(listener) = listener {
            listener.error(&reported);
        }
        reported
    }

    fn finish_close(&self) {
        let listener = {
            let mut life = self.life.lock();
            if life.closed {
                return;
            }
            life.closed = true;
            life.closing = false;
            life.listener.take()
        };

        let chunks = {
            let mut ring = self.ring.lock();
            ring.released = true;
            ring.buffered = 0;
            std::mem::take(&mut ring.chunks)
        };
        self.pool.release_all(chunks);

        {
            let mut flow = self.flow.lock();
            flow.pending = None;
            flow.ready_for_app = false;
        }

        drop(listener);
        tracing::debug!(conn = %self.id, "output closed");
        self.latch.arrive(Direction::Write);
    }
}

impl io::Write for OutputEngine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OutputEngine::write(self, buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutputEngine::flush(self).map_err(io::Error::from)
    }
}

impl io::Write for &OutputEngine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OutputEngine::write(*self, buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutputEngine::flush(*self).map_err(io::Error::from)
    }
}
