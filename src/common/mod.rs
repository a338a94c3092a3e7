//! Common utilities and types shared across minicfg

pub mod change;
pub mod config;
pub mod error;
pub mod hash;
pub mod messages;
pub mod utils;

pub use change::{Change, ChangeState, SettingOperation};
pub use config::{ClientConfig, Config, LogBackend, NodeConfig, WalSyncPolicy};
pub use error::{Error, Result};
pub use hash::{blake3_hash, config_hash, crc32, Blake3Hasher};
pub use messages::{
    AcceptRejectResponse, ChangeDetails, CommitMessage, DiscoverResponse, Mutation, NodeMode,
    PrepareMessage, RejectionReason, RollbackMessage, TakeoverMessage,
};
pub use utils::{local_host, local_user, parse_duration, timestamp_now};
