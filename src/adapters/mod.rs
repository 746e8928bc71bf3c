//! Concrete implementations of the domain ports.

pub mod directory;
pub mod sis_csv;
pub mod storage;
pub mod workspace;

use crate::config::toml_config::{StoreConfig, SyncConfig};
use crate::core::engine::StoreTarget;
use crate::domain::ports::IdentityStore;
use crate::utils::error::{Result, SyncError};
use std::sync::Arc;

pub use directory::LdapDirectory;
pub use sis_csv::CsvRosterSource;
pub use storage::LocalStorage;
pub use workspace::WorkspaceDirectory;

/// Builds the store a `[[stores]]` entry describes. Connections open lazily.
pub fn build_store(config: &StoreConfig, fetch_groups: bool) -> Result<Arc<dyn IdentityStore>> {
    Ok(match config {
        StoreConfig::Ldap(c) => Arc::new(LdapDirectory::new(c.clone())),
        StoreConfig::Workspace(c) => Arc::new(WorkspaceDirectory::new(c.clone(), fetch_groups)?),
    })
}

/// Store targets for every configured store, or only those named in `only`.
pub fn build_targets(config: &SyncConfig, only: &[String]) -> Result<Vec<StoreTarget>> {
    for name in only {
        if config.store(name).is_none() {
            return Err(SyncError::InvalidConfigValueError {
                field: "store".to_string(),
                value: name.clone(),
                reason: "no store with this name is configured".to_string(),
            });
        }
    }

    let fetch_groups = config.plan_policy().manage_groups;
    config
        .stores
        .iter()
        .filter(|s| only.is_empty() || only.iter().any(|name| name == s.name()))
        .map(|store| {
            Ok(StoreTarget {
                store: build_store(store, fetch_groups)?,
                layout: store.layout().clone(),
                base: store.base().to_string(),
                style: store.container_style(),
                scope: config.scope_for(store),
            })
        })
        .collect()
}
