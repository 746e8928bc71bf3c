//! Drift detection: compares what the SIS says each store should hold with
//! what the store actually holds, and produces the changes that close the gap.

use crate::core::dn;
use crate::core::scope::ScopeRules;
use crate::domain::model::{
    Account, AccountStatus, AttributeChange, Change, ChangeSet, Conflict,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Always compared; `managed_attributes` adds to these.
const CORE_ATTRIBUTES: &[&str] = &["givenName", "familyName", "displayName"];

/// What happens to a store account whose SIS record disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissing {
    Suspend,
    Delete,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct PlanPolicy {
    pub managed_attributes: Vec<String>,
    pub manage_groups: bool,
    pub manage_container: bool,
    pub on_missing: OnMissing,
    pub max_deprovision_ratio: f64,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            managed_attributes: ["department", "title", "company", "description", "districtRelationship"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            manage_groups: true,
            manage_container: true,
            on_missing: OnMissing::Suspend,
            max_deprovision_ratio: 0.1,
        }
    }
}

pub struct Planner<'a> {
    scope: &'a ScopeRules,
    policy: &'a PlanPolicy,
    /// Normalized keys of the groups the store holds, when known.
    existing_groups: Option<HashSet<String>>,
}

fn same_container(a: &str, b: &str) -> bool {
    dn::normalize(a) == dn::normalize(b)
}

impl<'a> Planner<'a> {
    pub fn new(scope: &'a ScopeRules, policy: &'a PlanPolicy) -> Self {
        Self {
            scope,
            policy,
            existing_groups: None,
        }
    }

    /// Plans `CreateGroup` for managed groups missing from `groups`.
    pub fn with_groups(mut self, groups: &[String]) -> Self {
        self.existing_groups = Some(groups.iter().map(|g| dn::normalize(g)).collect());
        self
    }

    fn compared_attributes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = CORE_ATTRIBUTES.to_vec();
        for name in &self.policy.managed_attributes {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }

    fn attribute_changes(&self, actual: &Account, desired: &Account) -> Vec<AttributeChange> {
        self.compared_attributes()
            .into_iter()
            .filter_map(|name| {
                let from = actual.attribute(name);
                let to = desired.attribute(name);
                (from != to).then(|| AttributeChange {
                    attribute: name.to_string(),
                    from: from.map(str::to_string),
                    to: to.map(str::to_string),
                })
            })
            .collect()
    }

    /// Membership changes limited to `managed` groups (normalized keys).
    fn membership_changes(
        &self,
        key: &str,
        external_id: &str,
        actual: &BTreeSet<String>,
        desired: &BTreeSet<String>,
        managed: &HashSet<String>,
    ) -> Vec<Change> {
        if !self.policy.manage_groups {
            return Vec::new();
        }

        let actual_managed: BTreeMap<String, &String> = actual
            .iter()
            .map(|g| (dn::normalize(g), g))
            .filter(|(lower, _)| managed.contains(lower))
            .collect();
        let desired_managed: BTreeMap<String, &String> = desired
            .iter()
            .map(|g| (dn::normalize(g), g))
            .filter(|(lower, _)| managed.contains(lower))
            .collect();

        let mut changes = Vec::new();
        for (lower, group) in &desired_managed {
            if !actual_managed.contains_key(lower) {
                changes.push(Change::AddMember {
                    key: key.to_string(),
                    external_id: external_id.to_string(),
                    group: (*group).clone(),
                });
            }
        }
        for (lower, group) in &actual_managed {
            if !desired_managed.contains_key(lower) {
                changes.push(Change::RemoveMember {
                    key: key.to_string(),
                    external_id: external_id.to_string(),
                    group: (*group).clone(),
                });
            }
        }
        changes
    }

    /// Builds the change set for one store.
    ///
    /// `roster_ids` holds every external id in the SIS, including records that
    /// could not be mapped, so a naming problem never deprovisions anyone.
    pub fn plan(
        &self,
        store: &str,
        desired: &[Account],
        roster_ids: &HashSet<String>,
        actual: Vec<Account>,
    ) -> ChangeSet {
        let mut set = ChangeSet {
            store: store.to_string(),
            ..ChangeSet::default()
        };

        // Identity keys of every store account, in scope or not.
        let mut taken: HashMap<String, Option<String>> = HashMap::new();
        for account in &actual {
            taken.insert(account.username.to_lowercase(), account.external_id.clone());
            if let Some(email) = &account.email {
                taken.insert(email.to_lowercase(), account.external_id.clone());
            }
        }

        let (in_scope, excluded) = self.scope.partition(actual);
        if !excluded.is_empty() {
            tracing::debug!("{}: {} accounts excluded by scope rules", store, excluded.len());
        }
        let excluded_ids: HashSet<&str> = excluded
            .iter()
            .filter_map(|a| a.external_id.as_deref())
            .filter(|id| !id.is_empty())
            .collect();

        let mut by_id: BTreeMap<String, Vec<Account>> = BTreeMap::new();
        for account in in_scope {
            match account.external_id.clone().filter(|id| !id.is_empty()) {
                Some(id) => by_id.entry(id).or_default().push(account),
                None => set.unmanaged.push(account.username.clone()),
            }
        }

        let mut duplicates = HashSet::new();
        for (id, accounts) in &by_id {
            if accounts.len() > 1 {
                let names: Vec<&str> = accounts.iter().map(|a| a.username.as_str()).collect();
                set.conflicts.push(Conflict {
                    external_id: Some(id.clone()),
                    reason: format!("external id shared by accounts {}", names.join(", ")),
                });
                duplicates.insert(id.clone());
            }
        }

        let managed_groups: HashSet<String> = desired
            .iter()
            .flat_map(|a| a.groups.iter())
            .filter(|g| !self.scope.group_excluded(g))
            .map(|g| dn::normalize(g))
            .collect();

        let mut ordered: Vec<&Account> = desired.iter().collect();
        ordered.sort_by(|a, b| a.external_id.cmp(&b.external_id));

        let mut claimed: HashSet<String> = HashSet::new();
        for want in ordered {
            let Some(id) = want.external_id.as_deref() else {
                continue;
            };
            if duplicates.contains(id) {
                continue;
            }

            let want_groups: BTreeSet<String> = if want.is_active() {
                want.groups.clone()
            } else {
                BTreeSet::new()
            };

            match by_id.get(id).and_then(|accounts| accounts.first()) {
                None => {
                    if !want.is_active() {
                        continue;
                    }
                    if excluded_ids.contains(id) {
                        set.conflicts.push(Conflict {
                            external_id: Some(id.to_string()),
                            reason: "the account carrying this id is excluded by scope rules".to_string(),
                        });
                        continue;
                    }
                    if let Some(reason) = self.collision(want, id, &taken, &claimed) {
                        set.conflicts.push(Conflict {
                            external_id: Some(id.to_string()),
                            reason,
                        });
                        continue;
                    }
                    claimed.insert(want.username.to_lowercase());

                    let mut account = want.clone();
                    account.groups = BTreeSet::new();
                    set.changes.push(Change::Create { account });
                    set.changes.extend(self.membership_changes(
                        "",
                        id,
                        &BTreeSet::new(),
                        &want_groups,
                        &managed_groups,
                    ));
                }
                Some(have) => {
                    claimed.insert(have.username.to_lowercase());

                    let changes = self.attribute_changes(have, want);
                    if !changes.is_empty() {
                        set.changes.push(Change::Update {
                            key: have.key.clone(),
                            external_id: id.to_string(),
                            changes,
                        });
                    }

                    if self.policy.manage_container && !same_container(&have.container, &want.container) {
                        set.changes.push(Change::Move {
                            key: have.key.clone(),
                            external_id: id.to_string(),
                            from: have.container.clone(),
                            to: want.container.clone(),
                        });
                    }

                    match (have.status, want.status) {
                        (AccountStatus::Suspended, AccountStatus::Active) => {
                            set.changes.push(Change::Restore {
                                key: have.key.clone(),
                                external_id: id.to_string(),
                            })
                        }
                        (AccountStatus::Active, AccountStatus::Suspended) => {
                            set.changes.push(Change::Suspend {
                                key: have.key.clone(),
                                external_id: id.to_string(),
                                reason: "not enrolled".to_string(),
                            })
                        }
                        _ => {}
                    }

                    set.changes.extend(self.membership_changes(
                        &have.key,
                        id,
                        &have.groups,
                        &want_groups,
                        &managed_groups,
                    ));
                }
            }
        }

        let managed_total = by_id.len() - duplicates.len();
        let deprovision_start = set.changes.len();
        for (id, accounts) in &by_id {
            if duplicates.contains(id) || roster_ids.contains(id) {
                continue;
            }
            let have = &accounts[0];
            match self.policy.on_missing {
                OnMissing::Ignore => {}
                OnMissing::Suspend => {
                    if have.is_active() {
                        set.changes.push(Change::Suspend {
                            key: have.key.clone(),
                            external_id: id.clone(),
                            reason: "not in SIS roster".to_string(),
                        });
                    }
                    set.changes.extend(self.membership_changes(
                        &have.key,
                        id,
                        &have.groups,
                        &BTreeSet::new(),
                        &managed_groups,
                    ));
                }
                OnMissing::Delete => {
                    set.changes.push(Change::Delete {
                        key: have.key.clone(),
                        external_id: id.clone(),
                    });
                }
            }
        }

        let deprovisions = set.changes[deprovision_start..]
            .iter()
            .filter(|c| c.is_deprovision())
            .count();

        let group_creates = self.missing_groups(&set.changes);
        set.changes.extend(group_creates);

        if managed_total > 0 {
            let ratio = deprovisions as f64 / managed_total as f64;
            if ratio > self.policy.max_deprovision_ratio {
                let reason = format!(
                    "{} of {} managed accounts would be deprovisioned ({:.0}% > {:.0}% limit)",
                    deprovisions,
                    managed_total,
                    ratio * 100.0,
                    self.policy.max_deprovision_ratio * 100.0
                );
                tracing::warn!("{}: {}", store, reason);
                set.aborted = Some(reason);
            }
        }

        set
    }

    /// One `CreateGroup` per group that members are added to but the store lacks.
    fn missing_groups(&self, changes: &[Change]) -> Vec<Change> {
        let Some(existing) = &self.existing_groups else {
            return Vec::new();
        };
        let mut missing: BTreeMap<String, String> = BTreeMap::new();
        for change in changes {
            if let Change::AddMember { group, .. } = change {
                let key = dn::normalize(group);
                if !existing.contains(&key) {
                    missing.entry(key).or_insert_with(|| group.clone());
                }
            }
        }
        missing
            .into_values()
            .map(|group| Change::CreateGroup { group })
            .collect()
    }

    fn collision(
        &self,
        want: &Account,
        id: &str,
        taken: &HashMap<String, Option<String>>,
        claimed: &HashSet<String>,
    ) -> Option<String> {
        let username = want.username.to_lowercase();
        if claimed.contains(&username) {
            return Some(format!(
                "username {} is also generated for another SIS record",
                want.username
            ));
        }
        let keys = std::iter::once(username).chain(want.email.iter().map(|e| e.to_lowercase()));
        for key in keys {
            if let Some(owner) = taken.get(&key) {
                if owner.as_deref() != Some(id) {
                    return Some(format!(
                        "{} already belongs to {}",
                        key,
                        owner.as_deref().unwrap_or("an unmanaged account")
                    ));
                }
            }
        }
        None
    }
}
