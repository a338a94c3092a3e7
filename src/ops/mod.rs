//! Operator commands for cluster configuration management

pub mod change;
pub mod diagnose;
pub mod repair;

pub use change::{apply_change, ChangeReport};
pub use diagnose::{diagnose_cluster, ChangeSummary, DiagnosticReport, NodeReport};
pub use repair::{repair_cluster, sync_node, takeover_cluster, RepairReport, SyncReport};
