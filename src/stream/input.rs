//! Read half of an upgraded connection.
//!
//! Without a listener the engine is purely blocking: `read` acquires a
//! buffer sized to the request, waits on the transport, copies out and
//! releases the buffer.
//!
//! Once a [`ReadListener`] is registered the engine switches to readiness
//! mode. Readiness is established by one-byte probes, so the engine never
//! holds more data than it can tell the caller about:
//!
//! ```text
//!   Idle ──probe──▶ ProbePending ──byte──▶ Idle (byte stashed)
//!   Idle ──read───▶ DataPending  ──done──▶ Idle
//!   any  ──I/O failure──▶ Error            (terminal except close)
//!   any  ──close──▶ Closed
//! ```
//!
//! A later `read` hands out the stashed byte first and grafts whatever a
//! zero-wait read yields behind it.

use crate::buffer::{Buffer, BufferPool};
use crate::error::{Direction, StateViolation, StreamError, TransportError};
use crate::stream::connection::{CloseLatch, ConnectionId};
use crate::stream::listener::{ReadCoordinator, ReadListener};
use crate::transport::{Filled, ReadCompletion, ReadWait, Submitted, TransportAdapter};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Observable state of the read side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Idle,
    /// A one-byte readiness probe is outstanding.
    ProbePending,
    /// A full read is outstanding.
    DataPending,
    Error,
    Closed,
}

struct InputState {
    read: ReadState,
    stash: Option<Buffer>,
    latched: Option<TransportError>,
    eof: bool,
    /// Close is waiting for a cancelled probe to come back.
    closing: bool,
    listener: Option<Arc<ReadCoordinator>>,
}

impl InputState {
    /// Latched failures win over every other condition.
    fn check_open(&self) -> Result<(), StreamError> {
        if let Some(err) = &self.latched {
            return Err(err.clone().into());
        }
        if self.read == ReadState::Closed || self.closing {
            return Err(StateViolation::Closed.into());
        }
        if self.read == ReadState::DataPending {
            return Err(StateViolation::ReadOutstanding.into());
        }
        Ok(())
    }

    fn latch(&mut self, err: &TransportError) {
        if self.latched.is_none() {
            self.latched = Some(err.clone());
        }
        if self.read != ReadState::Closed {
            self.read = ReadState::Error;
        }
    }
}

enum ReadPlan {
    Blocking,
    /// `n` stashed bytes were copied; top up with a zero-wait read.
    Graft(usize),
}

pub(crate) struct InputShared {
    id: ConnectionId,
    transport: Arc<dyn TransportAdapter>,
    pool: BufferPool,
    read_timeout: Option<Duration>,
    max_read_chunk: usize,
    state: Mutex<InputState>,
    latch: Arc<CloseLatch>,
}

/// Input engine handle. Clones share the same read side.
#[derive(Clone)]
pub struct InputEngine {
    shared: Arc<InputShared>,
}

impl InputEngine {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Arc<dyn TransportAdapter>,
        pool: BufferPool,
        read_timeout: Option<Duration>,
        max_read_chunk: usize,
        latch: Arc<CloseLatch>,
    ) -> Self {
        Self {
            shared: Arc::new(InputShared {
                id,
                transport,
                pool,
                read_timeout,
                max_read_chunk: max_read_chunk.max(1),
                state: Mutex::new(InputState {
                    read: ReadState::Idle,
                    stash: None,
                    latched: None,
                    eof: false,
                    closing: false,
                    listener: None,
                }),
                latch,
            }),
        }
    }

    pub fn state(&self) -> ReadState {
        self.shared.state.lock().read
    }

    /// True once end-of-stream was observed.
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().eof
    }

    /// Read a single byte; `None` at end of stream.
    pub fn read_byte(&self) -> Result<Option<u8>, StreamError> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Read into `dst`, returning the byte count; 0 means end of stream.
    ///
    /// Blocks when no listener is registered. In readiness mode it never
    /// blocks and fails with [`StateViolation::NotReady`] unless
    /// [`is_ready`](Self::is_ready) returned true.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, StreamError> {
        let shared = &self.shared;
        let plan = {
            let mut st = shared.state.lock();
            st.check_open()?;

            if dst.is_empty() {
                return Ok(0);
            }

            if st.listener.is_some() {
                match st.stash.take() {
                    Some(mut stash) => {
                        let n = stash.take_into(dst);
                        if stash.has_remaining() {
                            st.stash = Some(stash);
                            return Ok(n);
                        }
                        shared.pool.release(stash);
                        if n == dst.len() {
                            return Ok(n);
                        }
                        st.read = ReadState::DataPending;
                        ReadPlan::Graft(n)
                    }
                    None if st.eof => return Ok(0),
                    None => return Err(StateViolation::NotReady.into()),
                }
            } else {
                if st.eof {
                    return Ok(0);
                }
                st.read = ReadState::DataPending;
                ReadPlan::Blocking
            }
        };

        match plan {
            ReadPlan::Blocking => shared.read_blocking(dst),
            ReadPlan::Graft(copied) => Ok(shared.graft(dst, copied)),
        }
    }

    /// Whether a `read` can proceed without blocking.
    ///
    /// Always true without a listener. Otherwise a stashed byte or EOF means
    /// ready; failing that a zero-wait one-byte probe is issued. When the
    /// probe finds nothing, an asynchronous probe is armed so
    /// `on_data_available` follows once data arrives.
    pub fn is_ready(&self) -> bool {
        let shared = &self.shared;
        let coordinator = {
            let mut st = shared.state.lock();
            let Some(listener) = st.listener.clone() else {
                return true;
            };
            if st.latched.is_some() || st.read == ReadState::Closed || st.closing {
                return false;
            }
            if st.stash.as_ref().is_some_and(Buffer::has_remaining) || st.eof {
                return true;
            }
            if st.read != ReadState::Idle {
                return false;
            }
            st.read = ReadState::ProbePending;
            listener
        };

        let probe = shared.pool.acquire(1);
        let ReadCompletion { mut buf, result } = shared.transport.read(probe, ReadWait::Immediate);

        let mut st = shared.state.lock();
        if st.read == ReadState::Closed || st.closing {
            drop(st);
            shared.pool.release(buf);
            return false;
        }

        match result {
            Ok(Filled::Bytes(_)) => {
                buf.flip();
                st.stash = Some(buf);
                st.read = ReadState::Idle;
                tracing::trace!(conn = %shared.id, "probe stashed a byte");
                true
            }
            Ok(Filled::Eof) => {
                st.eof = true;
                st.read = ReadState::Idle;
                drop(st);
                shared.pool.release(buf);
                coordinator.all_data_read();
                true
            }
            Ok(Filled::Empty) => {
                drop(st);
                shared.pool.release(buf);
                shared.submit_probe(false);
                false
            }
            Err(TransportError::Cancelled) => {
                st.read = ReadState::Idle;
                drop(st);
                shared.pool.release(buf);
                false
            }
            Err(err) => {
                st.latch(&err);
                drop(st);
                shared.pool.release(buf);
                shared.report(&coordinator, err);
                false
            }
        }
    }

    /// Switch to readiness mode and start the forced asynchronous probe.
    ///
    /// The first `on_data_available` always arrives on a transport thread,
    /// even if data was already waiting.
    pub fn set_read_listener(&self, listener: Arc<dyn ReadListener>) -> Result<(), StreamError> {
        let shared = &self.shared;
        let coordinator = Arc::new(ReadCoordinator::new(listener));
        {
            let mut st = shared.state.lock();
            if st.listener.is_some() {
                return Err(StateViolation::ListenerAlreadySet.into());
            }
            st.check_open()?;
            st.listener = Some(coordinator);
            st.read = ReadState::ProbePending;
        }

        tracing::debug!(conn = %shared.id, "read listener registered");
        shared.submit_probe(true);
        Ok(())
    }

    /// Close the read side.
    ///
    /// An outstanding probe is cancelled first; if the transport needs time
    /// to confirm, close completes when the cancelled read comes back.
    pub fn close(&self) -> Result<(), StreamError> {
        let shared = &self.shared;
        let cancel = {
            let mut st = shared.state.lock();
            if st.read == ReadState::Closed || st.closing {
                return Ok(());
            }
            if st.read == ReadState::ProbePending {
                st.closing = true;
                true
            } else {
                false
            }
        };

        if cancel {
            match shared.transport.cancel_read() {
                Submitted::Done(()) => shared.finish_close(),
                Submitted::Pending => {
                    tracing::debug!(conn = %shared.id, "input close deferred until probe is cancelled");
                }
            }
        } else {
            shared.finish_close();
        }
        Ok(())
    }
}

impl InputShared {
    fn read_blocking(&self, dst: &mut [u8]) -> Result<usize, StreamError> {
        let size = dst.len().min(self.max_read_chunk);
        let mut buf = self.pool.acquire(size);

        let result = loop {
            let completion = self.transport.read(buf, ReadWait::Within(self.read_timeout));
            buf = completion.buf;
            match completion.result {
                Ok(Filled::Empty) => continue,
                other => break other,
            }
        };

        let copied = match &result {
            Ok(Filled::Bytes(_)) => {
                buf.flip();
                buf.take_into(dst)
            }
            _ => 0,
        };
        self.pool.release(buf);

        let mut st = self.state.lock();
        if st.read == ReadState::DataPending {
            st.read = ReadState::Idle;
        }
        match result {
            Ok(Filled::Eof) => {
                st.eof = true;
                Ok(0)
            }
            Ok(_) => {
                tracing::trace!(conn = %self.id, bytes = copied, "blocking read complete");
                Ok(copied)
            }
            Err(err) => {
                if !err.is_cancelled() {
                    st.latch(&err);
                    tracing::warn!(conn = %self.id, error = %err, "read failed");
                }
                Err(err.into())
            }
        }
    }

    /// Top up a read that already holds `copied` stashed bytes.
    ///
    /// The stashed bytes are never lost: a failing top-up is latched and
    /// reported, and the caller still gets what was copied.
    fn graft(&self, dst: &mut [u8], copied: usize) -> usize {
        let want = (dst.len() - copied).min(self.max_read_chunk);
        let ReadCompletion { mut buf, result } =
            self.transport.read(self.pool.acquire(want), ReadWait::Immediate);

        let extra = match &result {
            Ok(Filled::Bytes(_)) => {
                buf.flip();
                buf.take_into(&mut dst[copied..])
            }
            _ => 0,
        };
        self.pool.release(buf);

        let mut st = self.state.lock();
        if st.read == ReadState::DataPending {
            st.read = ReadState::Idle;
        }
        let coordinator = st.listener.clone();
        match result {
            Ok(Filled::Eof) => {
                st.eof = true;
                drop(st);
                if let Some(c) = coordinator {
                    c.all_data_read();
                }
            }
            Err(err) if !err.is_cancelled() => {
                st.latch(&err);
                drop(st);
                if let Some(c) = coordinator {
                    self.report(&c, err);
                }
            }
            _ => {}
        }
        copied + extra
    }

    /// Submit an asynchronous one-byte probe; state is already `ProbePending`.
    fn submit_probe(self: &Arc<Self>, force_queue: bool) {
        {
            let st = self.state.lock();
            if st.read != ReadState::ProbePending || st.closing {
                return;
            }
        }

        let this = Arc::clone(self);
        let submitted = self.transport.read_async(
            self.pool.acquire(1),
            self.read_timeout,
            force_queue,
            Box::new(move |completion| this.on_probe_complete(completion)),
        );

        if let Submitted::Done(completion) = submitted {
            // listener callbacks never run on the submitting thread
            let this = Arc::clone(self);
            self.transport
                .execute(Box::new(move || this.on_probe_complete(completion)));
        }
    }

    fn on_probe_complete(self: &Arc<Self>, completion: ReadCompletion) {
        let ReadCompletion { mut buf, result } = completion;

        let mut st = self.state.lock();
        if st.read == ReadState::Closed {
            drop(st);
            self.pool.release(buf);
            return;
        }
        if st.closing {
            drop(st);
            self.pool.release(buf);
            self.finish_close();
            return;
        }
        let Some(coordinator) = st.listener.clone() else {
            drop(st);
            self.pool.release(buf);
            return;
        };

        match result {
            Ok(Filled::Bytes(_)) => {
                buf.flip();
                st.stash = Some(buf);
                st.read = ReadState::Idle;
                drop(st);
                tracing::trace!(conn = %self.id, "async probe delivered a byte");
                coordinator.data_available();
            }
            Ok(Filled::Eof) => {
                st.eof = true;
                st.read = ReadState::Idle;
                drop(st);
                self.pool.release(buf);
                coordinator.all_data_read();
            }
            Ok(Filled::Empty) => {
                drop(st);
                self.pool.release(buf);
                self.submit_probe(false);
            }
            Err(TransportError::Cancelled) => {
                st.read = ReadState::Idle;
                drop(st);
                self.pool.release(buf);
            }
            Err(err) => {
                st.latch(&err);
                drop(st);
                self.pool.release(buf);
                self.report(&coordinator, err);
            }
        }
    }

    fn report(&self, coordinator: &ReadCoordinator, err: TransportError) {
        let err = StreamError::from(err);
        tracing::warn!(conn = %self.id, error = %err, "read failed");
        coordinator.error(&err);
    }

    fn finish_close(&self) {
        let (stash, coordinator, clean) = {
            let mut st = self.state.lock();
            if st.read == ReadState::Closed {
                return;
            }
            st.read = ReadState::Closed;
            st.closing = false;
            (st.stash.take(), st.listener.take(), st.latched.is_none())
        };

        if let Some(buf) = stash {
            self.pool.release(buf);
        }
        if let Some(c) = coordinator {
            if clean && !c.has_failed() {
                c.all_data_read();
            }
        }
        tracing::debug!(conn = %self.id, "input closed");
        self.latch.arrive(Direction::Read);
    }
}

impl io::Read for InputEngine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        InputEngine::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Read for &InputEngine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        InputEngine::read(*self, buf).map_err(io::Error::from)
    }
}
