//! Native collaborators for the corehost runtime.
//!
//! Each module backs one service trait of `corehost-runtime` with the
//! tokio / reqwest / rusqlite stack. [`config`] reads the TOML host
//! configuration and [`native_services`] wires everything together.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

pub mod config;
pub mod fs;
pub mod network;
pub mod persistence;
pub mod timers;

use std::sync::Arc;

use anyhow::{Context, Result};
use corehost_runtime::HostServices;

pub use config::{ConfigError, HostConfig, NetworkConfig, PersistenceConfig, config_path};
pub use fs::TokioFs;
pub use network::ReqwestNetwork;
pub use persistence::SqlitePersistence;
pub use timers::TokioTimers;

/// Build the production service bundle described by `config`.
pub fn native_services(config: &HostConfig) -> Result<HostServices> {
    let network = ReqwestNetwork::new(&config.network).context("failed to build HTTP client")?;
    let db_path = config.persistence.resolved_db_path();
    let persistence = SqlitePersistence::open(&db_path)
        .with_context(|| format!("failed to open event store at {}", db_path.display()))?;
    Ok(HostServices::new(
        Arc::new(TokioFs),
        Arc::new(network),
        Arc::new(TokioTimers::default()),
        Arc::new(persistence),
    ))
}
