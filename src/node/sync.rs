//! Serialized access to one node's state machine
//!
//! Every entry point, discover included, takes the same lock. Tokio's mutex
//! is fair, so callers are served in arrival order.

use tokio::sync::Mutex;

use crate::common::{
    AcceptRejectResponse, ChangeDetails, CommitMessage, DiscoverResponse, PrepareMessage, Result,
    RollbackMessage, TakeoverMessage,
};
use crate::node::config_store::ConfigSnapshot;
use crate::node::server::NomadServer;

pub struct SynchronizedServer<T: ConfigSnapshot> {
    inner: Mutex<NomadServer<T>>,
}

impl<T: ConfigSnapshot> SynchronizedServer<T> {
    pub fn new(server: NomadServer<T>) -> Self {
        Self {
            inner: Mutex::new(server),
        }
    }

    pub async fn discover(&self) -> Result<DiscoverResponse<T>> {
        self.inner.lock().await.discover()
    }

    pub async fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.inner.lock().await.prepare(message)
    }

    pub async fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse> {
        self.inner.lock().await.commit(message)
    }

    pub async fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.inner.lock().await.rollback(message)
    }

    pub async fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.inner.lock().await.takeover(message)
    }

    pub async fn has_incomplete_change(&self) -> Result<bool> {
        self.inner.lock().await.has_incomplete_change()
    }

    pub async fn change_history(&self) -> Result<Vec<ChangeDetails<T>>> {
        self.inner.lock().await.change_history()
    }

    pub async fn force_sync(&self, history: Vec<ChangeDetails<T>>) -> Result<()> {
        self.inner.lock().await.force_sync(history)
    }

    pub async fn reset(&self) -> Result<()> {
        self.inner.lock().await.reset()
    }
}
