//! # minicfg
//!
//! Cluster-wide configuration changes over a two-phase commit protocol:
//! - Every node keeps a durable, hash-verified log of config changes
//! - A client prepares a change on every node, then commits or rolls back
//! - Stale clients are fenced off by a per-node mutative message count
//! - Diagnose and repair tools resolve changes left half-done
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            minicfg client               │
//! │  discover → prepare → commit/rollback   │
//! └───────────┬─────────────────────────────┘
//!             │ HTTP (JSON)
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌──▼───────────┐
//! │ Node 1     │   │ Node 2     │   │ Node 3       │
//! │ change log │   │ change log │   │ change log   │
//! │ + configs  │   │ + configs  │   │ + configs    │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! minicfg-node serve \
//!   --name node-1 \
//!   --bind 0.0.0.0:9410 \
//!   --data ./node-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! export ENDPOINTS=http://10.0.0.1:9410,http://10.0.0.2:9410
//!
//! # Activate the cluster
//! minicfg --endpoints $ENDPOINTS activate --cluster prod --nodes node-1,node-2
//!
//! # Change settings
//! minicfg --endpoints $ENDPOINTS set offheap.main=512MB
//! minicfg --endpoints $ENDPOINTS unset offheap.main
//!
//! # Ops commands
//! minicfg --endpoints $ENDPOINTS diagnose
//! minicfg --endpoints $ENDPOINTS repair --force rollback
//! minicfg --endpoints $ENDPOINTS sync --source http://10.0.0.1:9410 --target http://10.0.0.2:9410
//! ```

pub mod client;
pub mod cluster;
pub mod common;
pub mod node;
pub mod ops;

// Re-export commonly used types
pub use client::{Consistency, NomadClient};
pub use common::{Change, Config, Error, Result};
pub use node::{NodeService, NomadServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
