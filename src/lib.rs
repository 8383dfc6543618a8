//! Sluice - upgraded connection stream engine
//!
//! Blocking and non-blocking byte streams over connections that left
//! request/response framing, on either a socket channel or a tokio pipeline.

pub mod buffer;
pub mod config;
pub mod error;
pub mod server;
pub mod stream;
pub mod transport;

pub use error::{StateViolation, StreamError, TransportError};
