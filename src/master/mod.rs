//! Master side of the console
//!
//! - [`MasterAgent`]: accepts monitors and admin clients, routes requests
//!   and notifications, replays unanswered requests after a reconnect
//! - [`ConnectionRegistry`]: primaries, type buckets, slaves and clients
//! - [`PendingTable`]: request ids, completions and the redelivery log

mod agent;
mod connection;
mod pending;
mod registry;

pub use agent::{MasterAgent, MasterOptions, MasterPhase, PeerSummary, DEFAULT_REDELIVERY_LIMIT};
pub use connection::ConnectionState;
pub use pending::{OutboundRequest, PendingTable};
pub use registry::{ConnectionRecord, ConnectionRegistry, PeerKind, Placement};

pub(crate) use connection::answer;
