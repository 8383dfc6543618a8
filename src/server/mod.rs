//! Demo server: accepts TCP connections, switches them to a raw stream with
//! a `101 Switching Protocols` reply and echoes the upgraded bytes through
//! the non-blocking listener API.

pub mod echo;
pub mod handshake;
pub mod listener;
