//! Monitor side of the console

mod agent;

pub use agent::{MonitorAgent, MonitorOptions, MonitorPhase};
