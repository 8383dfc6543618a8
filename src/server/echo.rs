//! Echo over the non-blocking API.
//!
//! Bytes read are parked in a backlog until the output engine accepts them.
//! When the output reports "not ready" the session stops reading and waits
//! for `on_write_possible`.

use crate::error::{StateViolation, StreamError};
use crate::stream::{Connection, ReadListener, WriteListener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const READ_CHUNK: usize = 4096;

pub struct EchoSession {
    conn: Connection,
    backlog: Mutex<Vec<u8>>,
    pumping: Mutex<()>,
    again: AtomicBool,
    armed: AtomicBool,
    peer_done: AtomicBool,
    finished: AtomicBool,
}

impl EchoSession {
    /// Register the session as both listeners of `conn`.
    ///
    /// Calls back into the engines, so run it off the async workers.
    pub fn start(conn: Connection) -> Result<Arc<Self>, StreamError> {
        let session = Arc::new(Self {
            conn,
            backlog: Mutex::new(Vec::new()),
            pumping: Mutex::new(()),
            again: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            peer_done: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let conn = &session.conn;
        conn.output().set_write_listener(session.clone())?;
        conn.input().set_read_listener(session.clone())?;
        session.armed.store(true, Ordering::Release);
        tracing::debug!(conn = %conn.id(), "echo session started");

        session.pump();
        Ok(session)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run the echo loop on this thread unless another thread already is.
    fn pump(&self) {
        self.again.store(true, Ordering::Release);
        loop {
            let Some(_running) = self.pumping.try_lock() else {
                return;
            };
            while self.again.swap(false, Ordering::AcqRel) {
                self.step();
            }
            drop(_running);
            if !self.again.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn step(&self) {
        if !self.armed.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire) {
            return;
        }
        let input = self.conn.input();
        let output = self.conn.output();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            {
                let mut backlog = self.backlog.lock();
                if !backlog.is_empty() {
                    if !output.is_ready() {
                        return;
                    }
                    if let Err(e) = output.write(&backlog) {
                        drop(backlog);
                        self.abort(&e);
                        return;
                    }
                    backlog.clear();
                }
            }

            if output.buffered() > 0 {
                if !output.is_ready() {
                    return;
                }
                if let Err(e) = output.flush() {
                    self.abort(&e);
                    return;
                }
            }

            if self.peer_done.load(Ordering::Acquire) {
                if output.is_ready() {
                    self.finish();
                }
                return;
            }

            if !input.is_ready() {
                return;
            }
            match input.read(&mut chunk) {
                Ok(0) => self.peer_done.store(true, Ordering::Release),
                Ok(n) => self.backlog.lock().extend_from_slice(&chunk[..n]),
                Err(e) if e.is_state(StateViolation::NotReady) => return,
                Err(e) => {
                    self.abort(&e);
                    return;
                }
            }
        }
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.conn.close() {
            tracing::debug!(conn = %self.conn.id(), error = %e, "close after echo failed");
        }
        tracing::debug!(conn = %self.conn.id(), "echo session finished");
    }

    fn abort(&self, err: &StreamError) {
        tracing::warn!(conn = %self.conn.id(), error = %err, "echo session aborted");
        self.finish();
    }
}

impl ReadListener for EchoSession {
    fn on_data_available(&self) {
        self.pump();
    }

    fn on_all_data_read(&self) {
        self.peer_done.store(true, Ordering::Release);
        self.pump();
    }

    fn on_error(&self, err: &StreamError) {
        self.abort(err);
    }
}

impl WriteListener for EchoSession {
    fn on_write_possible(&self) {
        self.pump();
    }

    fn on_error(&self, err: &StreamError) {
        self.abort(err);
    }
}
