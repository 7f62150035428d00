//! Resolution of the principal a unit's worker acts as.

use std::sync::RwLock;

use thiserror::Error;

use maint_core::{PrincipalId, UnitId};

use crate::config::DaemonConfig;

/// Looks up the owning principal of a unit.
pub trait OwnerResolver: Send + Sync {
    fn owner_of(&self, unit: UnitId) -> Result<PrincipalId, OwnerError>;
}

/// Errors raised while resolving an owner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OwnerError {
    #[error("no owner configured for unit {0} (set [owners] or default_owner)")]
    Unknown(UnitId),

    #[error("owner table unavailable")]
    Unavailable,
}

/// Owners taken from the daemon configuration; swapped on reload.
#[derive(Debug)]
pub struct ConfigOwners {
    config: RwLock<DaemonConfig>,
}

impl ConfigOwners {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replaces the owner table with the one in `config`.
    pub fn replace(&self, config: DaemonConfig) -> Result<(), OwnerError> {
        let mut current = self.config.write().map_err(|_| OwnerError::Unavailable)?;
        *current = config;
        Ok(())
    }
}

impl OwnerResolver for ConfigOwners {
    fn owner_of(&self, unit: UnitId) -> Result<PrincipalId, OwnerError> {
        self.config
            .read()
            .map_err(|_| OwnerError::Unavailable)?
            .owner_of(unit)
            .ok_or(OwnerError::Unknown(unit))
    }
}

/// Resolves every unit to the same principal.
#[derive(Debug, Clone, Copy)]
pub struct FixedOwner(pub PrincipalId);

impl OwnerResolver for FixedOwner {
    fn owner_of(&self, _unit: UnitId) -> Result<PrincipalId, OwnerError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_owners_lookup_and_replace() {
        let owners = ConfigOwners::new(DaemonConfig::default());
        assert_eq!(
            owners.owner_of(UnitId::new(1)),
            Err(OwnerError::Unknown(UnitId::new(1)))
        );

        let mut config = DaemonConfig::default();
        config.owners.insert("1".to_string(), 42);
        owners.replace(config).unwrap();
        assert_eq!(owners.owner_of(UnitId::new(1)), Ok(PrincipalId::new(42)));
    }

    #[test]
    fn test_unknown_owner_message_is_actionable() {
        let msg = OwnerError::Unknown(UnitId::new(5)).to_string();
        assert!(msg.contains("default_owner"));
    }
}
