//! Event pipeline backend
//!
//! Every operation runs as a task on a tokio runtime. There is no
//! transport-level "return immediately" read, so zero-wait probes and
//! blocking calls park the caller on a bounded wait for the task's result.
//! Completion callbacks are moved onto the runtime's blocking pool so
//! engine code never runs on (or stalls) an async worker.
//!
//! The blocking entry points must not be called from an async worker thread.

use crate::buffer::Buffer;
use crate::error::{Direction, TransportError};
use crate::transport::{
    consume, fire_timeout, io_slices, unwritten, Filled, ReadCallback, ReadCompletion, ReadWait,
    Submitted, Task, TimeoutHandler, TransportAdapter, TransportKind, WriteCallback,
    WriteCompletion,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

type Deliver<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// A read owned by a pipeline task.
///
/// If the task is dropped before finishing (runtime shutdown), the buffer is
/// still handed back, with [`TransportError::Closed`].
struct InFlightRead {
    buf: Option<Buffer>,
    deliver: Option<Deliver<ReadCompletion>>,
}

impl InFlightRead {
    fn finish(mut self, result: Result<Filled, TransportError>) {
        if let (Some(buf), Some(deliver)) = (self.buf.take(), self.deliver.take()) {
            deliver(ReadCompletion { buf, result });
        }
    }
}

impl Drop for InFlightRead {
    fn drop(&mut self) {
        if let (Some(buf), Some(deliver)) = (self.buf.take(), self.deliver.take()) {
            deliver(ReadCompletion {
                buf,
                result: Err(TransportError::Closed),
            });
        }
    }
}

struct InFlightWrite {
    bufs: Vec<Buffer>,
    deliver: Option<Deliver<WriteCompletion>>,
}

impl InFlightWrite {
    fn finish(mut self, result: Result<usize, TransportError>) {
        if let Some(deliver) = self.deliver.take() {
            deliver(WriteCompletion {
                bufs: std::mem::take(&mut self.bufs),
                result,
            });
        }
    }
}

impl Drop for InFlightWrite {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.take() {
            deliver(WriteCompletion {
                bufs: std::mem::take(&mut self.bufs),
                result: Err(TransportError::Closed),
            });
        }
    }
}

/// Backend B: tokio-driven, asynchronous-only transport.
pub struct PipelineTransport {
    handle: Handle,
    reader: Arc<AsyncMutex<OwnedReadHalf>>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    read_cancel: Mutex<Option<oneshot::Sender<()>>>,
    probe_wait: Duration,
    on_timeout: Option<TimeoutHandler>,
    closed: AtomicBool,
}

impl PipelineTransport {
    /// Create a pipeline over `stream`, driven by the runtime behind `handle`
    ///
    /// `probe_wait` bounds how long a zero-wait read may park the caller.
    pub fn new(stream: TcpStream, handle: Handle, probe_wait: Duration) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            handle,
            reader: Arc::new(AsyncMutex::new(reader)),
            writer: Arc::new(AsyncMutex::new(writer)),
            read_cancel: Mutex::new(None),
            probe_wait,
            on_timeout: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Report every timeout to `handler` as well
    pub fn with_timeout_handler(mut self, handler: TimeoutHandler) -> Self {
        self.on_timeout = Some(handler);
        self
    }

    fn spawn_read(
        &self,
        buf: Buffer,
        timeout: Option<Duration>,
        cancel: Option<oneshot::Receiver<()>>,
        deliver: Deliver<ReadCompletion>,
    ) {
        let op = InFlightRead {
            buf: Some(buf),
            deliver: Some(deliver),
        };
        let reader = Arc::clone(&self.reader);
        let on_timeout = self.on_timeout.clone();
        self.handle.spawn(read_task(reader, op, timeout, cancel, on_timeout));
    }

    fn spawn_write(&self, bufs: Vec<Buffer>, timeout: Option<Duration>, deliver: Deliver<WriteCompletion>) {
        let op = InFlightWrite {
            bufs,
            deliver: Some(deliver),
        };
        let writer = Arc::clone(&self.writer);
        let on_timeout = self.on_timeout.clone();
        self.handle.spawn(write_task(writer, op, timeout, on_timeout));
    }

    /// Deliver on the blocking pool rather than an async worker.
    fn off_worker<T: Send + 'static>(&self, done: Box<dyn FnOnce(T) + Send>) -> Deliver<T> {
        let handle = self.handle.clone();
        Box::new(move |value| {
            handle.spawn_blocking(move || done(value));
        })
    }
}

impl TransportAdapter for PipelineTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipeline
    }

    fn read(&self, buf: Buffer, wait: ReadWait) -> ReadCompletion {
        if self.closed.load(Ordering::Acquire) {
            return ReadCompletion {
                buf,
                result: Err(TransportError::Closed),
            };
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let deliver: Deliver<ReadCompletion> = Box::new(move |c| {
            let _ = tx.send(c);
        });

        match wait {
            ReadWait::Within(timeout) => {
                self.spawn_read(buf, timeout, None, deliver);
                rx.recv().unwrap_or_else(|_| lost_read())
            }
            ReadWait::Immediate => {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                self.spawn_read(buf, None, Some(cancel_rx), deliver);

                match rx.recv_timeout(self.probe_wait) {
                    Ok(completion) => completion,
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = cancel_tx.send(());
                        let mut completion = rx.recv().unwrap_or_else(|_| lost_read());
                        if matches!(completion.result, Err(TransportError::Cancelled)) {
                            completion.result = Ok(Filled::Empty);
                        }
                        completion
                    }
                    Err(RecvTimeoutError::Disconnected) => lost_read(),
                }
            }
        }
    }

    fn read_async(
        &self,
        buf: Buffer,
        timeout: Option<Duration>,
        _force_queue: bool,
        done: ReadCallback,
    ) -> Submitted<ReadCompletion> {
        if self.closed.load(Ordering::Acquire) {
            return Submitted::Done(ReadCompletion {
                buf,
                result: Err(TransportError::Closed),
            });
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.read_cancel.lock() = Some(cancel_tx);
        let deliver = self.off_worker(done);
        self.spawn_read(buf, timeout, Some(cancel_rx), deliver);
        Submitted::Pending
    }

    fn cancel_read(&self) -> Submitted<()> {
        match self.read_cancel.lock().take() {
            Some(tx) => match tx.send(()) {
                Ok(()) => Submitted::Pending,
                Err(()) => Submitted::Done(()),
            },
            None => Submitted::Done(()),
        }
    }

    fn write(&self, bufs: Vec<Buffer>, timeout: Option<Duration>) -> WriteCompletion {
        if self.closed.load(Ordering::Acquire) {
            return WriteCompletion {
                bufs,
                result: Err(TransportError::Closed),
            };
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.spawn_write(
            bufs,
            timeout,
            Box::new(move |c| {
                let _ = tx.send(c);
            }),
        );
        rx.recv().unwrap_or_else(|_| WriteCompletion {
            bufs: Vec::new(),
            result: Err(TransportError::Closed),
        })
    }

    fn write_async(
        &self,
        bufs: Vec<Buffer>,
        timeout: Option<Duration>,
        done: WriteCallback,
    ) -> Submitted<WriteCompletion> {
        if self.closed.load(Ordering::Acquire) {
            return Submitted::Done(WriteCompletion {
                bufs,
                result: Err(TransportError::Closed),
            });
        }

        let deliver = self.off_worker(done);
        self.spawn_write(bufs, timeout, deliver);
        Submitted::Pending
    }

    fn execute(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cancel_read();
        let writer = Arc::clone(&self.writer);
        self.handle.spawn(async move {
            if let Err(e) = writer.lock().await.shutdown().await {
                tracing::debug!(error = %e, "pipeline shutdown failed");
            }
        });
        tracing::debug!("pipeline transport shut down");
    }
}

async fn read_task(
    reader: Arc<AsyncMutex<OwnedReadHalf>>,
    mut op: InFlightRead,
    timeout: Option<Duration>,
    cancel: Option<oneshot::Receiver<()>>,
    on_timeout: Option<TimeoutHandler>,
) {
    let result = match op.buf.as_mut() {
        Some(buf) => {
            let mut half = reader.lock().await;
            let read = half.read(buf.spare_mut());

            let bounded = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| limit),
                    None => Ok(read.await),
                }
            };
            let cancelled = async {
                match cancel {
                    Some(rx) => {
                        if rx.await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                outcome = bounded => match outcome {
                    Ok(Ok(0)) => Ok(Filled::Eof),
                    Ok(Ok(n)) => Ok(Filled::Bytes(n)),
                    Ok(Err(e)) => Err(TransportError::io(Direction::Read, e)),
                    Err(limit) => Err(fire_timeout(&on_timeout, Direction::Read, limit)),
                },
                _ = cancelled => Err(TransportError::Cancelled),
            }
        }
        None => Err(TransportError::Closed),
    };

    if let (Ok(Filled::Bytes(n)), Some(buf)) = (&result, op.buf.as_mut()) {
        buf.commit(*n);
    }
    op.finish(result);
}

async fn write_task(
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    mut op: InFlightWrite,
    timeout: Option<Duration>,
    on_timeout: Option<TimeoutHandler>,
) {
    let result = {
        let bufs = &mut op.bufs;
        let work = async {
            let mut half = writer.lock().await;
            let mut total = 0;
            while unwritten(bufs) > 0 {
                let n = {
                    let slices = io_slices(bufs);
                    half.write_vectored(&slices).await?
                };
                if n == 0 {
                    return Err(std::io::ErrorKind::WriteZero.into());
                }
                consume(bufs, n);
                total += n;
            }
            half.flush().await?;
            Ok::<usize, std::io::Error>(total)
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(done) => done.map_err(|e| TransportError::io(Direction::Write, e)),
                Err(_) => Err(fire_timeout(&on_timeout, Direction::Write, limit)),
            },
            None => work.await.map_err(|e| TransportError::io(Direction::Write, e)),
        }
    };
    op.finish(result);
}

fn lost_read() -> ReadCompletion {
    ReadCompletion {
        buf: Buffer::detached(),
        result: Err(TransportError::Closed),
    }
}
