//! G.I.D relay: agent directory, offline mailbox and frame router.

pub mod config;
pub mod directory;
pub mod mailbox;
pub mod metrics;
pub mod router;
pub mod server;

#[cfg(test)]
mod mailbox_props;

pub use config::{ConfigError, ServerConfig};
pub use router::{Dispatch, RouteReport, Router, RouterError, RouterSettings};
pub use server::RelayServer;
