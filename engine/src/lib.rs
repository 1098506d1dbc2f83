//! TSS coordination engine.
//!
//! Makes a point-to-point, asynchronous network behave like the reliable
//! broadcast channel a threshold MPC protocol expects: quorum formation,
//! broadcast confirmation with equivocation detection, blame attribution and
//! the round-driven ceremony state machine around a pluggable MPC engine.

pub mod blame;
pub mod ceremony;
pub mod config;
pub mod conversion;
pub mod error;
pub mod logging;
pub mod messages;
pub mod mpc;
pub mod notifier;
pub mod party_coordinator;
pub mod request;
pub mod router;
pub mod server;
pub mod status;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::TssConfig;
pub use error::{TssError, TssResult};
pub use server::TssServer;

#[cfg(test)]
mod tests;
