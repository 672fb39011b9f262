//! Fleet Console - admin control plane for fleets of server processes
//!
//! One **master** accepts long-lived channels from **monitors** (one per
//! server process) and from **admin clients**. Pluggable [`service::Module`]s
//! expose handlers on each side; the master routes requests and notifies
//! between them, tracks who is connected and redelivers unanswered requests
//! when a monitor reconnects.
//!
//! - [`protocol`]: envelopes, frames and handshake payloads
//! - [`channel`]: transport-neutral channels over memory or WebSocket
//! - [`master`] / [`monitor`]: the two agents
//! - [`service`]: module table, access control and the [`service::ConsoleService`] facade
//! - [`client`]: admin client sessions
//! - [`modules`]: built-in modules

pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod master;
pub mod modules;
pub mod monitor;
pub mod protocol;
pub mod service;
pub mod version;

pub use error::{Error, Result};
