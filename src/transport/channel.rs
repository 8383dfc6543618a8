//! Socket channel backend
//!
//! Wraps a `std::net::TcpStream` kept in non-blocking mode. Zero-wait reads
//! and writes are single attempts on the caller's thread. Blocking calls wait
//! for readiness on a per-direction `mio::Poll`. Asynchronous operations are
//! handed to one event-loop thread per transport, woken through a
//! `mio::Waker` for new work, cancellation and shutdown.

use crate::buffer::Buffer;
use crate::error::{Direction, TransportError};
use crate::transport::{
    consume, fire_timeout, io_slices, unwritten, Filled, ReadCallback, ReadCompletion, ReadWait,
    Submitted, Task, TimeoutHandler, TransportAdapter, TransportKind, WriteCallback,
    WriteCompletion,
};
use mio::net::TcpStream as MioStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

const SOCKET: Token = Token(0);
const WAKE: Token = Token(1);

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn after(limit: Option<Duration>) -> Option<Self> {
        limit.map(|limit| Self {
            at: Instant::now() + limit,
            limit,
        })
    }

    fn left(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

struct ReadJob {
    buf: Buffer,
    deadline: Option<Deadline>,
    done: ReadCallback,
}

struct WriteJob {
    bufs: Vec<Buffer>,
    deadline: Option<Deadline>,
    written: usize,
    done: WriteCallback,
}

enum Command {
    Read(ReadJob),
    Write(WriteJob),
    CancelRead,
    Stop,
}

/// Readiness wait used by blocking calls in one direction.
struct Readiness {
    poll: Poll,
    events: Events,
    _source: MioStream,
}

impl Readiness {
    fn new(socket: &TcpStream, interest: Interest) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut source = MioStream::from_std(socket.try_clone()?);
        poll.registry().register(&mut source, SOCKET, interest)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(4),
            _source: source,
        })
    }

    /// Park until the socket may have changed state or `timeout` passes.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            other => other,
        }
    }
}

/// Backend A: socket channel with blocking calls and its own event loop.
pub struct ChannelTransport {
    socket: TcpStream,
    peer: Option<SocketAddr>,
    commands: Sender<Command>,
    waker: Waker,
    read_ready: Mutex<Readiness>,
    write_ready: Mutex<Readiness>,
    read_in_flight: Arc<AtomicBool>,
    on_timeout: Option<TimeoutHandler>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new(socket: TcpStream) -> io::Result<Self> {
        Self::build(socket, None)
    }

    /// Create a channel that reports every timeout to `handler` as well
    pub fn with_timeout_handler(socket: TcpStream, handler: TimeoutHandler) -> io::Result<Self> {
        Self::build(socket, Some(handler))
    }

    fn build(socket: TcpStream, on_timeout: Option<TimeoutHandler>) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let peer = socket.peer_addr().ok();

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE)?;
        let mut source = MioStream::from_std(socket.try_clone()?);
        poll.registry()
            .register(&mut source, SOCKET, Interest::READABLE | Interest::WRITABLE)?;

        let (commands, inbox) = mpsc::channel();
        let read_in_flight = Arc::new(AtomicBool::new(false));
        let event_loop = EventLoop {
            poll,
            source,
            inbox,
            read: None,
            writes: VecDeque::new(),
            read_in_flight: Arc::clone(&read_in_flight),
            on_timeout: on_timeout.clone(),
        };
        thread::Builder::new()
            .name("sluice-channel-io".into())
            .spawn(move || event_loop.run())?;

        let read_ready = Mutex::new(Readiness::new(&socket, Interest::READABLE)?);
        let write_ready = Mutex::new(Readiness::new(&socket, Interest::WRITABLE)?);

        tracing::debug!(peer = ?peer, "channel transport started");

        Ok(Self {
            socket,
            peer,
            commands,
            waker,
            read_ready,
            write_ready,
            read_in_flight,
            on_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn send(&self, command: Command) -> Result<(), mpsc::SendError<Command>> {
        self.commands.send(command)?;
        if let Err(e) = self.waker.wake() {
            tracing::error!(peer = ?self.peer, error = %e, "failed to wake channel event loop");
        }
        Ok(())
    }

    fn read_now(&self, buf: &mut Buffer, wait: ReadWait) -> Result<Filled, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let limit = match wait {
            ReadWait::Immediate => return Ok(try_fill(&self.socket, buf)?.unwrap_or(Filled::Empty)),
            ReadWait::Within(limit) => limit,
        };

        let deadline = Deadline::after(limit);
        let mut ready = self.read_ready.lock();
        loop {
            if let Some(filled) = try_fill(&self.socket, buf)? {
                return Ok(filled);
            }
            let left = match deadline {
                Some(d) if d.left().is_zero() => {
                    return Err(fire_timeout(&self.on_timeout, Direction::Read, d.limit));
                }
                Some(d) => Some(d.left()),
                None => None,
            };
            ready
                .wait(left)
                .map_err(|e| TransportError::io(Direction::Read, e))?;
        }
    }

    fn write_now(&self, bufs: &mut [Buffer], timeout: Option<Duration>) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let deadline = Deadline::after(timeout);
        let mut ready = self.write_ready.lock();
        let mut total = 0;
        loop {
            total += drain_into(&self.socket, bufs).map_err(|e| TransportError::io(Direction::Write, e))?;
            if unwritten(bufs) == 0 {
                return Ok(total);
            }
            let left = match deadline {
                Some(d) if d.left().is_zero() => {
                    return Err(fire_timeout(&self.on_timeout, Direction::Write, d.limit));
                }
                Some(d) => Some(d.left()),
                None => None,
            };
            ready
                .wait(left)
                .map_err(|e| TransportError::io(Direction::Write, e))?;
        }
    }
}

impl TransportAdapter for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn read(&self, mut buf: Buffer, wait: ReadWait) -> ReadCompletion {
        let result = self.read_now(&mut buf, wait);
        ReadCompletion { buf, result }
    }

    fn read_async(
        &self,
        mut buf: Buffer,
        timeout: Option<Duration>,
        force_queue: bool,
        done: ReadCallback,
    ) -> Submitted<ReadCompletion> {
        if !force_queue || self.closed.load(Ordering::Acquire) {
            match self.read_now(&mut buf, ReadWait::Immediate) {
                Ok(Filled::Empty) => {}
                result => return Submitted::Done(ReadCompletion { buf, result }),
            }
        }

        self.read_in_flight.store(true, Ordering::Release);
        let job = ReadJob {
            buf,
            deadline: Deadline::after(timeout),
            done,
        };
        match self.send(Command::Read(job)) {
            Ok(()) => Submitted::Pending,
            Err(mpsc::SendError(command)) => {
                self.read_in_flight.store(false, Ordering::Release);
                let buf = match command {
                    Command::Read(job) => job.buf,
                    _ => Buffer::detached(),
                };
                Submitted::Done(ReadCompletion {
                    buf,
                    result: Err(TransportError::Closed),
                })
            }
        }
    }

    fn cancel_read(&self) -> Submitted<()> {
        if !self.read_in_flight.load(Ordering::Acquire) {
            return Submitted::Done(());
        }
        match self.send(Command::CancelRead) {
            Ok(()) => Submitted::Pending,
            Err(_) => Submitted::Done(()),
        }
    }

    fn write(&self, mut bufs: Vec<Buffer>, timeout: Option<Duration>) -> WriteCompletion {
        let result = self.write_now(&mut bufs, timeout);
        WriteCompletion { bufs, result }
    }

    fn write_async(
        &self,
        mut bufs: Vec<Buffer>,
        timeout: Option<Duration>,
        done: WriteCallback,
    ) -> Submitted<WriteCompletion> {
        if self.closed.load(Ordering::Acquire) {
            return Submitted::Done(WriteCompletion {
                bufs,
                result: Err(TransportError::Closed),
            });
        }

        let written = match drain_into(&self.socket, &mut bufs) {
            Ok(n) => n,
            Err(e) => {
                return Submitted::Done(WriteCompletion {
                    bufs,
                    result: Err(TransportError::io(Direction::Write, e)),
                });
            }
        };

        if unwritten(&bufs) == 0 {
            return Submitted::Done(WriteCompletion {
                bufs,
                result: Ok(written),
            });
        }

        tracing::trace!(written, left = unwritten(&bufs), "write stalled, handing off to event loop");
        let job = WriteJob {
            bufs,
            deadline: Deadline::after(timeout),
            written,
            done,
        };
        match self.send(Command::Write(job)) {
            Ok(()) => Submitted::Pending,
            Err(mpsc::SendError(command)) => {
                let bufs = match command {
                    Command::Write(job) => job.bufs,
                    _ => Vec::new(),
                };
                Submitted::Done(WriteCompletion {
                    bufs,
                    result: Err(TransportError::Closed),
                })
            }
        }
    }

    fn execute(&self, task: Task) {
        if let Err(e) = thread::Builder::new()
            .name("sluice-channel-dispatch".into())
            .spawn(task)
        {
            tracing::error!(error = %e, "failed to dispatch task");
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(peer = ?self.peer, error = %e, "socket shutdown failed");
            }
        }
        let _ = self.send(Command::Stop);
        tracing::debug!(peer = ?self.peer, "channel transport shut down");
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        let _ = self.send(Command::Stop);
    }
}

/// Owns the asynchronous side of one channel.
struct EventLoop {
    poll: Poll,
    source: MioStream,
    inbox: Receiver<Command>,
    read: Option<ReadJob>,
    writes: VecDeque<WriteJob>,
    read_in_flight: Arc<AtomicBool>,
    on_timeout: Option<TimeoutHandler>,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);
        loop {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "channel poll failed");
                break;
            }

            // Readiness is edge-triggered, so every pending job is retried on any wakeup.
            if !self.take_commands() {
                break;
            }
            self.try_read();
            self.try_writes();
            self.expire();
        }
        self.abandon();
    }

    /// Apply queued commands. `false` once the loop should stop.
    fn take_commands(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(Command::Read(job)) => self.read = Some(job),
                Ok(Command::Write(job)) => self.writes.push_back(job),
                Ok(Command::CancelRead) => {
                    if let Some(job) = self.read.take() {
                        self.finish_read(job, Err(TransportError::Cancelled));
                    }
                }
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let read = self.read.as_ref().and_then(|job| job.deadline);
        let write = self.writes.front().and_then(|job| job.deadline);
        [read, write]
            .into_iter()
            .flatten()
            .map(|d| d.left())
            .min()
    }

    fn try_read(&mut self) {
        let Some(job) = self.read.as_mut() else {
            return;
        };
        let result = match try_fill(&self.source, &mut job.buf) {
            Ok(None) => return,
            Ok(Some(filled)) => Ok(filled),
            Err(e) => Err(e),
        };
        if let Some(job) = self.read.take() {
            self.finish_read(job, result);
        }
    }

    fn try_writes(&mut self) {
        while let Some(job) = self.writes.front_mut() {
            let result = match drain_into(&self.source, &mut job.bufs) {
                Ok(n) => {
                    job.written += n;
                    if unwritten(&job.bufs) > 0 {
                        return;
                    }
                    Ok(job.written)
                }
                Err(e) => Err(TransportError::io(Direction::Write, e)),
            };
            if let Some(job) = self.writes.pop_front() {
                (job.done)(WriteCompletion { bufs: job.bufs, result });
            }
        }
    }

    fn expire(&mut self) {
        if let Some(d) = self.read.as_ref().and_then(|job| job.deadline) {
            if d.left().is_zero() {
                if let Some(job) = self.read.take() {
                    let err = fire_timeout(&self.on_timeout, Direction::Read, d.limit);
                    self.finish_read(job, Err(err));
                }
            }
        }
        while let Some(d) = self.writes.front().and_then(|job| job.deadline) {
            if !d.left().is_zero() {
                break;
            }
            if let Some(job) = self.writes.pop_front() {
                let err = fire_timeout(&self.on_timeout, Direction::Write, d.limit);
                (job.done)(WriteCompletion {
                    bufs: job.bufs,
                    result: Err(err),
                });
            }
        }
    }

    fn finish_read(&mut self, job: ReadJob, result: Result<Filled, TransportError>) {
        self.read_in_flight.store(false, Ordering::Release);
        (job.done)(ReadCompletion { buf: job.buf, result });
    }

    /// Hand every outstanding buffer back once the loop is done.
    fn abandon(mut self) {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                Command::Read(job) => self.read = Some(job),
                Command::Write(job) => self.writes.push_back(job),
                Command::CancelRead | Command::Stop => {}
            }
        }
        if let Some(job) = self.read.take() {
            self.finish_read(job, Err(TransportError::Closed));
        }
        for job in self.writes.drain(..) {
            (job.done)(WriteCompletion {
                bufs: job.bufs,
                result: Err(TransportError::Closed),
            });
        }
        tracing::trace!("channel event loop stopped");
    }
}

/// One read attempt. `None` when the socket has nothing yet.
fn try_fill(mut src: impl Read, buf: &mut Buffer) -> Result<Option<Filled>, TransportError> {
    loop {
        match src.read(buf.spare_mut()) {
            Ok(0) => return Ok(Some(Filled::Eof)),
            Ok(n) => {
                buf.commit(n);
                return Ok(Some(Filled::Bytes(n)));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(TransportError::io(Direction::Read, e)),
        }
    }
}

/// Vectored writes until the socket pushes back or every buffer is drained.
fn drain_into(mut dst: impl Write, bufs: &mut [Buffer]) -> io::Result<usize> {
    let mut total = 0;
    while unwritten(bufs) > 0 {
        let n = {
            let slices = io_slices(bufs);
            match dst.write_vectored(&slices) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        };
        consume(bufs, n);
        total += n;
    }
    Ok(total)
}
