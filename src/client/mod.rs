//! Client-side orchestrator
//!
//! Drives one logical change across a fixed set of nodes: discovery, a
//! second discovery to catch concurrent clients, prepare, then commit or
//! rollback. Also hosts the recovery and takeover processes.

pub mod analyzer;
pub mod checker;
pub mod decider;
pub mod endpoint;
pub mod process;
pub mod results;
pub mod sender;

pub use analyzer::{ConsistencyAnalyzer, GlobalState};
pub use checker::{check_cluster, ClusterCheck};
pub use decider::{decide_recovery, Consistency, RecoveryDecision, Tally};
pub use endpoint::{HttpEndpoint, LocalEndpoint, NomadEndpoint};
pub use process::NomadClient;
pub use results::{FailureRecorder, LoggingResultReceiver, MuxResultReceiver, ResultReceiver};
pub use sender::{Broadcast, Discovery, MessageSender};
