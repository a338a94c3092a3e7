//! Change applicator contract
//!
//! `try_apply` validates a change against the last committed config and
//! computes the prospective config. It has no side effects and its result may
//! be thrown away. `apply` runs the real side effect, only after the change
//! was durably recorded as prepared.

use crate::common::{Change, Result};
use crate::node::config_store::ConfigSnapshot;

/// Outcome of `try_apply`
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialApplicationResult<T> {
    allowed: bool,
    new_config: Option<T>,
    rejection_reason: Option<String>,
}

impl<T> PotentialApplicationResult<T> {
    pub fn allow(new_config: T) -> Self {
        Self {
            allowed: true,
            new_config: Some(new_config),
            rejection_reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            new_config: None,
            rejection_reason: Some(reason.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn rejection_reason(&self) -> &str {
        self.rejection_reason.as_deref().unwrap_or("")
    }

    pub fn into_new_config(self) -> Option<T> {
        self.new_config
    }
}

pub trait ChangeApplicator<T: ConfigSnapshot>: Send + Sync {
    fn try_apply(&self, existing: Option<&T>, change: &Change) -> PotentialApplicationResult<T>;

    fn apply(&self, change: &Change) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_potential_result() {
        let allowed = PotentialApplicationResult::allow(3u32);
        assert!(allowed.is_allowed());
        assert_eq!(allowed.rejection_reason(), "");
        assert_eq!(allowed.into_new_config(), Some(3));

        let rejected = PotentialApplicationResult::<u32>::reject("no room");
        assert!(!rejected.is_allowed());
        assert_eq!(rejected.rejection_reason(), "no room");
        assert_eq!(rejected.into_new_config(), None);
    }
}
