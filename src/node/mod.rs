//! Node side of the protocol
//!
//! A node owns one durable change log and one config snapshot store, both
//! driven by a single [`NomadServer`] behind a [`SynchronizedServer`] lock.

pub mod applicator;
pub mod config_store;
pub mod http;
pub mod log;
pub mod server;
pub mod service;
pub mod state;
pub mod sync;

pub use applicator::{ChangeApplicator, PotentialApplicationResult};
pub use config_store::{ConfigSnapshot, ConfigStorage, FileConfigStorage, MemoryConfigStorage};
pub use http::{create_router, NodeHttpState};
pub use log::{ChangeLog, FileChangeLog, LogBatch, LogOp, MemoryChangeLog};
pub use server::NomadServer;
pub use service::{open_server, NodeService};
pub use state::{ChangeRecord, ServerState, StateChange};
pub use sync::SynchronizedServer;

#[cfg(feature = "sled-backend")]
pub use log::SledChangeLog;
