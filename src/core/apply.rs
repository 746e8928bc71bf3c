use crate::domain::model::{AccountStatus, Change, ChangeFailure, ChangeKind, ChangeSet};
use crate::domain::ports::{Capability, IdentityStore};
use crate::utils::error::{Result, SyncError};
use crate::utils::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};

/// Changes are applied phase by phase; later phases see keys assigned by
/// earlier ones (new accounts, moved DNs) and the groups created first.
const PHASES: &[&[ChangeKind]] = &[
    &[ChangeKind::Create, ChangeKind::CreateGroup],
    &[ChangeKind::Update],
    &[ChangeKind::Move],
    &[ChangeKind::Suspend, ChangeKind::Restore],
    &[ChangeKind::AddMember, ChangeKind::RemoveMember],
    &[ChangeKind::Delete],
];

fn required_capability(kind: ChangeKind) -> Capability {
    match kind {
        ChangeKind::Create => Capability::Create,
        ChangeKind::Update => Capability::Update,
        ChangeKind::Move => Capability::Move,
        ChangeKind::Suspend | ChangeKind::Restore => Capability::Suspend,
        ChangeKind::Delete => Capability::Delete,
        ChangeKind::AddMember | ChangeKind::RemoveMember | ChangeKind::CreateGroup => {
            Capability::Groups
        }
    }
}

fn change_key(change: &Change) -> &str {
    match change {
        Change::Create { account } => &account.key,
        Change::CreateGroup { group } => group,
        Change::Update { key, .. }
        | Change::Move { key, .. }
        | Change::Suspend { key, .. }
        | Change::Restore { key, .. }
        | Change::Delete { key, .. }
        | Change::AddMember { key, .. }
        | Change::RemoveMember { key, .. } => key,
    }
}

/// Performs one change. Returns the account's new key when it has one.
async fn execute(store: &dyn IdentityStore, change: &Change, key: &str) -> Result<Option<String>> {
    match change {
        Change::Create { account } => store.create_account(account).await.map(Some),
        Change::Update { changes, .. } => store.update_account(key, changes).await.map(|_| None),
        Change::Move { to, .. } => store.move_account(key, to).await.map(Some),
        Change::Suspend { .. } => store
            .set_status(key, AccountStatus::Suspended)
            .await
            .map(|_| None),
        Change::Restore { .. } => store
            .set_status(key, AccountStatus::Active)
            .await
            .map(|_| None),
        Change::Delete { .. } => store.delete_account(key).await.map(|_| None),
        Change::AddMember { group, .. } => store.add_member(key, group).await.map(|_| None),
        Change::RemoveMember { group, .. } => store.remove_member(key, group).await.map(|_| None),
        Change::CreateGroup { group } => store.create_group(group).await.map(|_| None),
    }
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub applied: Vec<Change>,
    pub skipped: Vec<Change>,
    pub failures: Vec<ChangeFailure>,
}

pub struct Executor {
    store: Arc<dyn IdentityStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Executor {
    pub fn new(store: Arc<dyn IdentityStore>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            store,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn apply(&self, set: &ChangeSet) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut keys: HashMap<String, String> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let store_name = self.store.name().to_string();

        for phase in PHASES {
            let mut tasks = JoinSet::new();
            let mut pending: HashMap<Id, Change> = HashMap::new();

            for change in set.changes.iter().filter(|c| phase.contains(&c.kind())) {
                let capability = required_capability(change.kind());
                if !self.store.supports(capability) {
                    let reason = SyncError::UnsupportedError {
                        store: store_name.clone(),
                        capability: capability.to_string(),
                    };
                    tracing::warn!("{}: skipping '{}': {}", store_name, change, reason);
                    outcome.skipped.push(change.clone());
                    continue;
                }

                let key = keys
                    .get(change.external_id())
                    .cloned()
                    .unwrap_or_else(|| change_key(change).to_string());
                if key.is_empty() && change.kind() != ChangeKind::Create {
                    outcome.failures.push(ChangeFailure {
                        change: change.clone(),
                        error: "account was not created".to_string(),
                    });
                    continue;
                }

                let store = Arc::clone(&self.store);
                let permits = Arc::clone(&semaphore);
                let retry = self.retry;
                let task_change = change.clone();
                let handle = tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let label = task_change.to_string();
                    retry
                        .run(&label, || execute(store.as_ref(), &task_change, &key))
                        .await
                });
                pending.insert(handle.id(), change.clone());
            }

            while let Some(joined) = tasks.join_next_with_id().await {
                let (id, result) = match joined {
                    Ok((id, result)) => (id, result),
                    Err(join_error) => (
                        join_error.id(),
                        Err(SyncError::store(
                            &store_name,
                            format!("change task aborted: {}", join_error),
                        )),
                    ),
                };
                let Some(change) = pending.remove(&id) else {
                    continue;
                };
                match result {
                    Ok(new_key) => {
                        tracing::info!("{}: {}", store_name, change);
                        if let Some(new_key) = new_key {
                            keys.insert(change.external_id().to_string(), new_key);
                        }
                        outcome.applied.push(change);
                    }
                    Err(e) => {
                        tracing::error!("{}: {} failed: {}", store_name, change, e);
                        outcome.failures.push(ChangeFailure {
                            change,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        outcome
    }
}
