//! Upgraded-connection engines.
//!
//! A [`Connection`] pairs an [`InputEngine`] and an [`OutputEngine`] over one
//! [`TransportAdapter`](crate::transport::TransportAdapter). Each engine runs
//! in blocking mode until a listener is registered, then switches to
//! readiness mode for good.

pub mod connection;
pub mod input;
pub mod listener;
pub mod output;

pub use connection::{Connection, ConnectionId, Upgrader};
pub use input::{InputEngine, ReadState};
pub use listener::{CallContext, ContextGuard, ContextSnapshot, ReadListener, WriteListener};
pub use output::{OutputEngine, WriteState};
