//! Shared fixtures: an in-memory transport steered by the test, and
//! listeners that record what they were told.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use sluice::buffer::{Buffer, BufferPool};
use sluice::config::StreamSettings;
use sluice::error::{Direction, StreamError, TransportError};
use sluice::stream::{CallContext, Connection, ReadListener, Upgrader, WriteListener};
use sluice::transport::{
    Filled, ReadCallback, ReadCompletion, ReadWait, Submitted, Task, TransportAdapter,
    TransportKind, WriteCallback, WriteCompletion,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// `cancel_read` completes on the calling thread.
    Sync,
    /// The cancelled read comes back on a transport thread.
    Async,
    /// The cancelled read is held until `release_cancel`.
    Held,
}

#[derive(Default)]
struct Script {
    inbound: VecDeque<u8>,
    eof: bool,
    read_failure: Option<TransportError>,
    pending_read: Option<(Buffer, ReadCallback)>,
    read_timeout: Option<Duration>,
    held_cancel: Option<(Buffer, ReadCallback)>,
    async_reads: usize,
    hold_writes: bool,
    held: VecDeque<(Vec<Buffer>, Option<Duration>, WriteCallback)>,
    write_failure: Option<TransportError>,
    flushes: Vec<Vec<u8>>,
    shutdowns: usize,
}

/// In-memory [`TransportAdapter`] whose reads, writes and cancellations
/// are driven by the test.
pub struct ScriptedTransport {
    script: Mutex<Script>,
    arrived: Condvar,
    cancel_mode: CancelMode,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Self::with_cancel_mode(CancelMode::Async)
    }

    pub fn with_cancel_mode(cancel_mode: CancelMode) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script::default()),
            arrived: Condvar::new(),
            cancel_mode,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Queue inbound bytes, completing an outstanding async read.
    pub fn feed(&self, bytes: &[u8]) {
        self.script.lock().inbound.extend(bytes);
        self.arrived.notify_all();
        self.service_read();
    }

    pub fn feed_eof(&self) {
        self.script.lock().eof = true;
        self.arrived.notify_all();
        self.service_read();
    }

    /// Fail the next read, or the outstanding async one.
    pub fn fail_read(&self, err: TransportError) {
        self.script.lock().read_failure = Some(err);
        self.arrived.notify_all();
        self.service_read();
    }

    pub fn fail_writes(&self, err: TransportError) {
        self.script.lock().write_failure = Some(err);
    }

    /// Async writes stay pending until `release_write`.
    pub fn hold_writes(&self, hold: bool) {
        self.script.lock().hold_writes = hold;
    }

    pub fn held_writes(&self) -> usize {
        self.script.lock().held.len()
    }

    pub fn has_pending_read(&self) -> bool {
        self.script.lock().pending_read.is_some()
    }

    pub fn async_reads(&self) -> usize {
        self.script.lock().async_reads
    }

    /// Complete the oldest held write and wait for its callback.
    pub fn release_write(&self) -> bool {
        let Some((mut bufs, _timeout, done)) = self.script.lock().held.pop_front() else {
            return false;
        };
        let result = self.perform_write(&mut bufs);
        self.spawn(move || done(WriteCompletion { bufs, result }));
        self.settle();
        true
    }

    /// Time out the outstanding async read with the timeout it was given.
    pub fn expire_read(&self) -> bool {
        let (pending, after) = {
            let mut script = self.script.lock();
            (script.pending_read.take(), script.read_timeout.unwrap_or_default())
        };
        let Some((buf, done)) = pending else {
            return false;
        };
        self.spawn(move || {
            done(ReadCompletion {
                buf,
                result: Err(TransportError::Timeout {
                    op: Direction::Read,
                    after,
                }),
            })
        });
        self.settle();
        true
    }

    /// Time out the oldest held write with the timeout it was given.
    pub fn expire_write(&self) -> bool {
        let Some((bufs, timeout, done)) = self.script.lock().held.pop_front() else {
            return false;
        };
        let after = timeout.unwrap_or_default();
        self.spawn(move || {
            done(WriteCompletion {
                bufs,
                result: Err(TransportError::Timeout {
                    op: Direction::Write,
                    after,
                }),
            })
        });
        self.settle();
        true
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.script.lock().read_timeout
    }

    /// Hand back the cancelled read held under [`CancelMode::Held`].
    pub fn release_cancel(&self) -> bool {
        let Some((buf, done)) = self.script.lock().held_cancel.take() else {
            return false;
        };
        self.spawn(move || {
            done(ReadCompletion {
                buf,
                result: Err(TransportError::Cancelled),
            })
        });
        self.settle();
        true
    }

    /// Payload of every flush, in order.
    pub fn flushes(&self) -> Vec<Vec<u8>> {
        self.script.lock().flushes.clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.script.lock().flushes.concat()
    }

    pub fn shutdowns(&self) -> usize {
        self.script.lock().shutdowns
    }

    /// Join every transport thread started so far, including ones they start.
    pub fn settle(&self) {
        loop {
            let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
            if workers.is_empty() {
                return;
            }
            for worker in workers {
                worker.join().expect("transport thread panicked");
            }
        }
    }

    fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let handle = thread::spawn(f);
        self.workers.lock().push(handle);
    }

    fn fill(script: &mut Script, buf: &mut Buffer) -> Option<Result<Filled, TransportError>> {
        if let Some(err) = script.read_failure.take() {
            return Some(Err(err));
        }
        if !script.inbound.is_empty() {
            let spare = buf.spare_mut();
            let n = spare.len().min(script.inbound.len());
            for (slot, byte) in spare.iter_mut().zip(script.inbound.drain(..n)) {
                *slot = byte;
            }
            buf.commit(n);
            return Some(Ok(Filled::Bytes(n)));
        }
        if script.eof {
            return Some(Ok(Filled::Eof));
        }
        None
    }

    fn service_read(&self) {
        let delivery = {
            let mut script = self.script.lock();
            let Some((mut buf, done)) = script.pending_read.take() else {
                return;
            };
            match Self::fill(&mut script, &mut buf) {
                Some(result) => (buf, done, result),
                None => {
                    script.pending_read = Some((buf, done));
                    return;
                }
            }
        };
        let (buf, done, result) = delivery;
        self.spawn(move || done(ReadCompletion { buf, result }));
    }

    fn perform_write(&self, bufs: &mut [Buffer]) -> Result<usize, TransportError> {
        let mut script = self.script.lock();
        if let Some(err) = script.write_failure.clone() {
            return Err(err);
        }
        let mut payload = Vec::new();
        for buf in bufs.iter_mut() {
            let n = buf.remaining();
            payload.extend_from_slice(buf.chunk());
            buf.advance(n);
        }
        let n = payload.len();
        script.flushes.push(payload);
        Ok(n)
    }
}

impl TransportAdapter for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn read(&self, mut buf: Buffer, wait: ReadWait) -> ReadCompletion {
        let mut script = self.script.lock();
        loop {
            if let Some(result) = Self::fill(&mut script, &mut buf) {
                return ReadCompletion { buf, result };
            }
            match wait {
                ReadWait::Immediate => {
                    return ReadCompletion {
                        buf,
                        result: Ok(Filled::Empty),
                    };
                }
                ReadWait::Within(Some(limit)) => {
                    if self.arrived.wait_for(&mut script, limit).timed_out() {
                        let result = Self::fill(&mut script, &mut buf).unwrap_or(Err(
                            TransportError::Timeout {
                                op: Direction::Read,
                                after: limit,
                            },
                        ));
                        return ReadCompletion { buf, result };
                    }
                }
                ReadWait::Within(None) => self.arrived.wait(&mut script),
            }
        }
    }

    fn read_async(
        &self,
        mut buf: Buffer,
        timeout: Option<Duration>,
        force_queue: bool,
        done: ReadCallback,
    ) -> Submitted<ReadCompletion> {
        {
            let mut script = self.script.lock();
            script.async_reads += 1;
            script.read_timeout = timeout;
            if !force_queue {
                if let Some(result) = Self::fill(&mut script, &mut buf) {
                    return Submitted::Done(ReadCompletion { buf, result });
                }
            }
            script.pending_read = Some((buf, done));
        }
        self.service_read();
        Submitted::Pending
    }

    fn cancel_read(&self) -> Submitted<()> {
        let mut script = self.script.lock();
        let Some((buf, done)) = script.pending_read.take() else {
            return Submitted::Done(());
        };
        match self.cancel_mode {
            CancelMode::Sync => {
                drop(script);
                done(ReadCompletion {
                    buf,
                    result: Err(TransportError::Cancelled),
                });
                Submitted::Done(())
            }
            CancelMode::Async => {
                drop(script);
                self.spawn(move || {
                    done(ReadCompletion {
                        buf,
                        result: Err(TransportError::Cancelled),
                    })
                });
                Submitted::Pending
            }
            CancelMode::Held => {
                script.held_cancel = Some((buf, done));
                Submitted::Pending
            }
        }
    }

    fn write(&self, mut bufs: Vec<Buffer>, _timeout: Option<Duration>) -> WriteCompletion {
        let result = self.perform_write(&mut bufs);
        WriteCompletion { bufs, result }
    }

    fn write_async(
        &self,
        mut bufs: Vec<Buffer>,
        timeout: Option<Duration>,
        done: WriteCallback,
    ) -> Submitted<WriteCompletion> {
        {
            let mut script = self.script.lock();
            if script.hold_writes {
                script.held.push_back((bufs, timeout, done));
                return Submitted::Pending;
            }
        }
        let result = self.perform_write(&mut bufs);
        Submitted::Done(WriteCompletion { bufs, result })
    }

    fn execute(&self, task: Task) {
        self.spawn(task);
    }

    fn shutdown(&self) {
        self.script.lock().shutdowns += 1;
    }
}

/// Settings with a small threshold so tests can reach it.
pub fn settings(threshold: usize, chunk_size: usize) -> StreamSettings {
    StreamSettings {
        amount_to_buffer: threshold,
        chunk_size: Some(chunk_size),
        ..StreamSettings::default()
    }
}

pub fn connect(transport: &Arc<ScriptedTransport>, settings: StreamSettings) -> (Connection, BufferPool) {
    let pool = BufferPool::new();
    let upgrader = Upgrader::new(settings, pool.clone());
    let conn = upgrader.acquire(transport.clone());
    (conn, pool)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DataAvailable,
    AllDataRead,
    WritePossible,
    Error(String),
}

/// Records every callback with the thread and context it ran under.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
    pub threads: Mutex<Vec<ThreadId>>,
    pub contexts: Mutex<Vec<Option<CallContext>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
        self.threads.lock().push(thread::current().id());
        self.contexts.lock().push(CallContext::current());
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn errors(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Error(_)))
            .count()
    }
}

impl ReadListener for Recorder {
    fn on_data_available(&self) {
        self.record(Event::DataAvailable);
    }

    fn on_all_data_read(&self) {
        self.record(Event::AllDataRead);
    }

    fn on_error(&self, err: &StreamError) {
        self.record(Event::Error(err.to_string()));
    }
}

impl WriteListener for Recorder {
    fn on_write_possible(&self) {
        self.record(Event::WritePossible);
    }

    fn on_error(&self, err: &StreamError) {
        self.record(Event::Error(err.to_string()));
    }
}
