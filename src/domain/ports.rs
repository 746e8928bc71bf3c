use crate::domain::model::{Account, AccountStatus, AttributeChange, Roster};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Authoritative upstream records.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn load(&self) -> Result<Roster>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Create,
    Update,
    Move,
    Suspend,
    Delete,
    Groups,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Create => "account creation",
            Capability::Update => "attribute updates",
            Capability::Move => "account moves",
            Capability::Suspend => "suspension",
            Capability::Delete => "account deletion",
            Capability::Groups => "group membership",
        };
        f.write_str(name)
    }
}

/// A downstream identity store the engine reconciles.
///
/// Every mutating call must be safe to repeat: re-applying a change that has
/// already landed is a success, not an error.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// All accounts under the store's managed base, with group memberships filled in.
    async fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Keys of the groups under the managed base (DNs or group emails).
    async fn list_groups(&self) -> Result<Vec<String>>;

    /// Creates a group by its key; an existing group is not an error.
    async fn create_group(&self, group: &str) -> Result<()>;

    /// Returns the store key of the new account.
    async fn create_account(&self, account: &Account) -> Result<String>;

    async fn update_account(&self, key: &str, changes: &[AttributeChange]) -> Result<()>;

    /// Returns the new key when moving changes it.
    async fn move_account(&self, key: &str, container: &str) -> Result<String>;

    async fn set_status(&self, key: &str, status: AccountStatus) -> Result<()>;

    async fn delete_account(&self, key: &str) -> Result<()>;

    async fn add_member(&self, key: &str, group: &str) -> Result<()>;

    async fn remove_member(&self, key: &str, group: &str) -> Result<()>;
}
