use crate::buffer::BufferPool;
use crate::config::StreamSettings;
use crate::error::{Direction, StreamError};
use crate::stream::input::InputEngine;
use crate::stream::output::{OutputEngine, OutputLimits};
use crate::transport::{TransportAdapter, TransportKind};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Id minted by the [`Upgrader`] that produced the connection; used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

const READ_OPEN: u8 = 0b01;
const WRITE_OPEN: u8 = 0b10;

/// Shuts the transport down once both directions have closed.
pub(crate) struct CloseLatch {
    id: ConnectionId,
    open: AtomicU8,
    transport: Arc<dyn TransportAdapter>,
}

impl CloseLatch {
    pub(crate) fn new(id: ConnectionId, transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            id,
            open: AtomicU8::new(READ_OPEN | WRITE_OPEN),
            transport,
        }
    }

    /// Mark `dir` closed. The last direction to arrive shuts the transport.
    pub(crate) fn arrive(&self, dir: Direction) {
        let bit = match dir {
            Direction::Read => READ_OPEN,
            Direction::Write => WRITE_OPEN,
        };
        let before = self.open.fetch_and(!bit, Ordering::AcqRel);
        if before & bit != 0 && before & !bit == 0 {
            self.transport.shutdown();
            tracing::info!(conn = %self.id, "connection closed");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.open.load(Ordering::Acquire) == 0
    }
}

/// One upgraded duplex stream.
pub struct Connection {
    id: ConnectionId,
    input: InputEngine,
    output: OutputEngine,
    transport: Arc<dyn TransportAdapter>,
    latch: Arc<CloseLatch>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn input(&self) -> &InputEngine {
        &self.input
    }

    pub fn output(&self) -> &OutputEngine {
        &self.output
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Both directions closed and the transport shut down.
    pub fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }

    /// Close the input side, then flush and close the output side.
    ///
    /// Both sides are closed even if the first fails.
    pub fn close(&self) -> Result<(), StreamError> {
        let input = self.input.close();
        let output = self.output.close();
        input.and(output)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &self.transport.kind())
            .field("read", &self.input.state())
            .field("write", &self.output.state())
            .finish()
    }
}

/// Turns transports into upgraded connections sharing one buffer pool.
///
/// Clones share the pool and the id sequence.
#[derive(Clone)]
pub struct Upgrader {
    settings: StreamSettings,
    pool: BufferPool,
    next_id: Arc<AtomicU64>,
}

impl Upgrader {
    pub fn new(settings: StreamSettings, pool: BufferPool) -> Self {
        Self {
            settings,
            pool,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Wrap `transport` in a fresh input/output engine pair.
    pub fn acquire(&self, transport: Arc<dyn TransportAdapter>) -> Connection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let latch = Arc::new(CloseLatch::new(id, Arc::clone(&transport)));

        let input = InputEngine::new(
            id,
            Arc::clone(&transport),
            self.pool.clone(),
            self.settings.read_timeout(),
            self.settings.max_read_chunk,
            Arc::clone(&latch),
        );
        let output = OutputEngine::new(
            id,
            Arc::clone(&transport),
            self.pool.clone(),
            OutputLimits {
                threshold: self.settings.threshold(),
                chunk_size: self.settings.chunk_size(),
                write_timeout: self.settings.write_timeout(),
                run_inline: self.settings.run_inline,
            },
            Arc::clone(&latch),
        );

        tracing::debug!(
            conn = %id,
            transport = ?transport.kind(),
            threshold = self.settings.threshold(),
            "connection upgraded"
        );

        Connection {
            id,
            input,
            output,
            transport,
            latch,
        }
    }
}
