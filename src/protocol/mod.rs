//! Wire protocol between master, monitors and admin clients
//!
//! Everything that crosses a channel is a [`Frame`]: a named topic plus a
//! JSON payload. The `monitor` and `client` topics carry [`Envelope`]s; the
//! `register`, `reconnect` and `reconnect_ok` topics carry handshake payloads.

mod envelope;
mod frame;
mod handshake;

pub use envelope::*;
pub use frame::*;
pub use handshake::*;
