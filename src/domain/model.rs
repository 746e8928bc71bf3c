use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonKind {
    Student,
    Staff,
}

impl fmt::Display for PersonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersonKind::Student => write!(f, "student"),
            PersonKind::Staff => write!(f, "staff"),
        }
    }
}

/// One authoritative record from the SIS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub external_id: String,
    pub kind: PersonKind,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub grade: Option<String>,
    pub school_id: Option<String>,
    pub title: Option<String>,
    pub department: Option<String>,
    pub enrolled: bool,
    pub district_relationship: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
}

/// Everything the SIS exports said, plus records that had to be dropped.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub people: Vec<Person>,
    pub conflicts: Vec<Conflict>,
}

/// An account as a downstream store sees it, or as the SIS says it should be.
///
/// Desired accounts carry an empty `key` until the store assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub key: String,
    pub external_id: Option<String>,
    pub kind: Option<PersonKind>,
    pub username: String,
    pub email: Option<String>,
    pub given_name: String,
    pub family_name: String,
    pub display_name: String,
    pub container: String,
    pub status: AccountStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Account {
    /// Value of a comparable attribute by its portable name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        match name {
            "givenName" => Some(self.given_name.as_str()),
            "familyName" => Some(self.family_name.as_str()),
            "displayName" => Some(self.display_name.as_str()),
            "username" => Some(self.username.as_str()),
            "email" => self.email.as_deref(),
            other => self.attributes.get(other).map(String::as_str),
        }
        .filter(|v| !v.is_empty())
    }

    pub fn set_attribute(&mut self, name: &str, value: Option<String>) {
        match name {
            "givenName" => self.given_name = value.unwrap_or_default(),
            "familyName" => self.family_name = value.unwrap_or_default(),
            "displayName" => self.display_name = value.unwrap_or_default(),
            "username" => self.username = value.unwrap_or_default(),
            "email" => self.email = value,
            other => match value {
                Some(v) => {
                    self.attributes.insert(other.to_string(), v);
                }
                None => {
                    self.attributes.remove(other);
                }
            },
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn label(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl AttributeChange {
    pub fn op(&self) -> AttributeOp {
        match (&self.from, &self.to) {
            (None, _) => AttributeOp::Add,
            (Some(_), Some(_)) => AttributeOp::Replace,
            (Some(_), None) => AttributeOp::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeOp {
    Add,
    Replace,
    Delete,
}

/// One corrective operation against a single store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Create {
        account: Account,
    },
    Update {
        key: String,
        external_id: String,
        changes: Vec<AttributeChange>,
    },
    Move {
        key: String,
        external_id: String,
        from: String,
        to: String,
    },
    Suspend {
        key: String,
        external_id: String,
        reason: String,
    },
    Restore {
        key: String,
        external_id: String,
    },
    Delete {
        key: String,
        external_id: String,
    },
    AddMember {
        key: String,
        external_id: String,
        group: String,
    },
    RemoveMember {
        key: String,
        external_id: String,
        group: String,
    },
    CreateGroup {
        group: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Move,
    Suspend,
    Restore,
    Delete,
    AddMember,
    RemoveMember,
    CreateGroup,
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Create { .. } => ChangeKind::Create,
            Change::Update { .. } => ChangeKind::Update,
            Change::Move { .. } => ChangeKind::Move,
            Change::Suspend { .. } => ChangeKind::Suspend,
            Change::Restore { .. } => ChangeKind::Restore,
            Change::Delete { .. } => ChangeKind::Delete,
            Change::AddMember { .. } => ChangeKind::AddMember,
            Change::RemoveMember { .. } => ChangeKind::RemoveMember,
            Change::CreateGroup { .. } => ChangeKind::CreateGroup,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            Change::Create { account } => account.external_id.as_deref().unwrap_or_default(),
            Change::CreateGroup { .. } => "",
            Change::Update { external_id, .. }
            | Change::Move { external_id, .. }
            | Change::Suspend { external_id, .. }
            | Change::Restore { external_id, .. }
            | Change::Delete { external_id, .. }
            | Change::AddMember { external_id, .. }
            | Change::RemoveMember { external_id, .. } => external_id,
        }
    }

    pub fn is_deprovision(&self) -> bool {
        matches!(self, Change::Suspend { .. } | Change::Delete { .. })
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Create { account } => write!(f, "create {} ({})", account.label(), account.username),
            Change::Update { external_id, changes, .. } => {
                let names: Vec<&str> = changes.iter().map(|c| c.attribute.as_str()).collect();
                write!(f, "update {} [{}]", external_id, names.join(", "))
            }
            Change::Move { external_id, to, .. } => write!(f, "move {} to {}", external_id, to),
            Change::Suspend { external_id, reason, .. } => {
                write!(f, "suspend {} ({})", external_id, reason)
            }
            Change::Restore { external_id, .. } => write!(f, "restore {}", external_id),
            Change::Delete { external_id, .. } => write!(f, "delete {}", external_id),
            Change::AddMember { external_id, group, .. } => {
                write!(f, "add {} to {}", external_id, group)
            }
            Change::RemoveMember { external_id, group, .. } => {
                write!(f, "remove {} from {}", external_id, group)
            }
            Change::CreateGroup { group } => write!(f, "create group {}", group),
        }
    }
}

/// A record that cannot be reconciled automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub external_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub store: String,
    pub changes: Vec<Change>,
    pub conflicts: Vec<Conflict>,
    pub unmanaged: Vec<String>,
    pub aborted: Option<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind() == kind).count()
    }

    pub fn counts(&self) -> BTreeMap<ChangeKind, usize> {
        let mut counts = BTreeMap::new();
        for change in &self.changes {
            *counts.entry(change.kind()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeFailure {
    pub change: Change,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    InSync,
    Applied,
    Planned,
    PartialFailure,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreReport {
    pub store: String,
    pub outcome: StoreOutcome,
    pub planned: BTreeMap<ChangeKind, usize>,
    pub applied: BTreeMap<ChangeKind, usize>,
    pub skipped: Vec<Change>,
    pub failures: Vec<ChangeFailure>,
    pub conflicts: Vec<Conflict>,
    pub unmanaged: usize,
    pub error: Option<String>,
}

impl StoreReport {
    pub fn failed(store: &str, error: String) -> Self {
        Self {
            store: store.to_string(),
            outcome: StoreOutcome::Failed,
            planned: BTreeMap::new(),
            applied: BTreeMap::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            conflicts: Vec::new(),
            unmanaged: 0,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub roster_size: usize,
    pub stores: Vec<StoreReport>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        self.stores.iter().any(|s| {
            matches!(
                s.outcome,
                StoreOutcome::Failed | StoreOutcome::PartialFailure | StoreOutcome::Aborted
            )
        })
    }
}
