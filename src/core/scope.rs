use crate::config::toml_config::ScopeConfig;
use crate::core::dn;
use crate::domain::model::Account;

/// Which accounts and groups the engine is allowed to touch in a store.
///
/// Containers match hierarchically: an LDAP DN matches when it ends with the
/// excluded DN, an org unit path when it starts with the excluded path.
/// Targets pull an item back into scope from an excluded container; explicit
/// account and group exclusions still win.
#[derive(Debug, Clone, Default)]
pub struct ScopeRules {
    excluded_containers: Vec<String>,
    excluded_accounts: Vec<String>,
    excluded_groups: Vec<String>,
    target_containers: Vec<String>,
    target_accounts: Vec<String>,
    target_groups: Vec<String>,
}

fn normalize(value: &str) -> String {
    dn::normalize(value).trim_end_matches('/').to_string()
}

fn within(container: &str, parent: &str) -> bool {
    if parent.is_empty() {
        return false;
    }
    if container == parent {
        return true;
    }
    if parent.starts_with('/') {
        container.starts_with(&format!("{}/", parent))
    } else {
        container.ends_with(&format!(",{}", parent))
    }
}

/// Names a group can be listed under: its full key, its common name, or the
/// local part of its email.
fn group_names(group: &str) -> Vec<String> {
    let mut names = vec![normalize(group)];
    if let Some(cn) = dn::first_rdn_value(group) {
        names.push(cn.to_lowercase());
    } else if let Some((local, _)) = group.split_once('@') {
        names.push(local.trim().to_lowercase());
    }
    names
}

impl ScopeRules {
    pub fn from_config(config: &ScopeConfig) -> Self {
        let norm = |values: &[String]| -> Vec<String> { values.iter().map(|v| normalize(v)).collect() };
        let names = |values: &[String]| -> Vec<String> {
            values.iter().map(|v| v.trim().to_lowercase()).collect()
        };
        Self {
            excluded_containers: norm(&config.excluded_containers),
            excluded_accounts: names(&config.excluded_accounts),
            excluded_groups: norm(&config.excluded_groups),
            target_containers: norm(&config.target_containers),
            target_accounts: names(&config.target_accounts),
            target_groups: norm(&config.target_groups),
        }
    }

    /// A container is excluded when it lies under an excluded container and is
    /// not itself listed as a target.
    pub fn container_excluded(&self, container: &str) -> bool {
        let container = normalize(container);
        if self.target_containers.iter().any(|t| *t == container) {
            return false;
        }
        self.excluded_containers
            .iter()
            .any(|excluded| within(&container, excluded))
    }

    fn account_names(account: &Account) -> Vec<String> {
        [
            Some(account.username.as_str()),
            account.attributes.get("cn").map(String::as_str),
            account.email.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_lowercase())
        .collect()
    }

    pub fn account_excluded(&self, account: &Account) -> bool {
        let names = Self::account_names(account);
        if names.iter().any(|name| self.excluded_accounts.contains(name)) {
            return true;
        }
        if names.iter().any(|name| self.target_accounts.contains(name)) {
            return false;
        }
        self.container_excluded(&account.container)
    }

    pub fn group_excluded(&self, group: &str) -> bool {
        let names = group_names(group);
        if names.iter().any(|name| self.excluded_groups.contains(name)) {
            return true;
        }
        if names.iter().any(|name| self.target_groups.contains(name)) {
            return false;
        }
        // Group DNs inherit container exclusion from their parent OU.
        match dn::split_dn(group) {
            (_, parent) if !parent.is_empty() && !group.contains('@') => {
                self.container_excluded(parent)
            }
            _ => false,
        }
    }

    /// Splits accounts into those in scope and those excluded.
    pub fn partition(&self, accounts: Vec<Account>) -> (Vec<Account>, Vec<Account>) {
        accounts.into_iter().partition(|a| !self.account_excluded(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::AccountStatus;
    use std::collections::{BTreeMap, BTreeSet};

    fn account(username: &str, container: &str) -> Account {
        Account {
            key: format!("CN={},{}", username, container),
            external_id: None,
            kind: None,
            username: username.to_string(),
            email: None,
            given_name: String::new(),
            family_name: String::new(),
            display_name: String::new(),
            container: container.to_string(),
            status: AccountStatus::Active,
            attributes: BTreeMap::new(),
            groups: BTreeSet::new(),
        }
    }

    fn rules() -> ScopeRules {
        ScopeRules::from_config(&ScopeConfig {
            excluded_containers: vec![
                "OU=Admins,OU=District,DC=example,DC=org".to_string(),
                "OU=Service, OU=District, DC=example, DC=org".to_string(),
                "/Service Accounts".to_string(),
            ],
            excluded_accounts: vec!["Administrator".to_string(), "svc-backup".to_string()],
            excluded_groups: vec!["Domain Admins".to_string()],
            target_containers: vec!["OU=Sync,OU=Service,OU=District,DC=example,DC=org".to_string()],
            target_accounts: vec!["svc-sis".to_string()],
            target_groups: vec!["CN=Helpdesk Students,OU=Admins,OU=District,DC=example,DC=org".to_string()],
        })
    }

    #[test]
    fn test_excluded_container_and_children() {
        let rules = rules();
        assert!(rules.container_excluded("OU=Admins,OU=District,DC=example,DC=org"));
        assert!(rules.container_excluded("ou=tier0,ou=admins,ou=district,dc=example,dc=org"));
        assert!(!rules.container_excluded("OU=Students,OU=District,DC=example,DC=org"));
        assert!(!rules.container_excluded("OU=NotAdmins,OU=District,DC=example,DC=org"));
    }

    #[test]
    fn test_target_overrides_exclusion() {
        let rules = rules();
        assert!(rules.container_excluded("OU=Other,OU=Service,OU=District,DC=example,DC=org"));
        assert!(!rules.container_excluded("OU=Sync,OU=Service,OU=District,DC=example,DC=org"));
    }

    #[test]
    fn test_org_unit_paths() {
        let rules = rules();
        assert!(rules.container_excluded("/Service Accounts"));
        assert!(rules.container_excluded("/service accounts/backup"));
        assert!(!rules.container_excluded("/Service Accounts Archive"));
    }

    #[test]
    fn test_excluded_accounts_by_name() {
        let rules = rules();
        let (kept, excluded) = rules.partition(vec![
            account("administrator", "CN=Users,DC=example,DC=org"),
            account("jdoe", "OU=Students,OU=District,DC=example,DC=org"),
            account("root", "OU=Admins,OU=District,DC=example,DC=org"),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].username, "jdoe");
        assert_eq!(excluded.len(), 2);
    }

    #[test]
    fn test_excluded_groups() {
        let rules = rules();
        assert!(rules.group_excluded("domain admins"));
        // listed by common name, matched against the full DN
        assert!(rules.group_excluded("CN=Domain Admins,CN=Users,DC=example,DC=org"));
        assert!(!rules.group_excluded("domain-admins@example.org"));
        assert!(rules.group_excluded("CN=Helpdesk,OU=Admins,OU=District,DC=example,DC=org"));
        assert!(!rules.group_excluded("CN=Students,OU=Groups,OU=District,DC=example,DC=org"));
        assert!(!rules.group_excluded("students@example.org"));
    }

    #[test]
    fn test_excluded_by_common_name() {
        let rules = ScopeRules::from_config(&ScopeConfig {
            excluded_accounts: vec!["Front Office Kiosk".to_string()],
            ..ScopeConfig::default()
        });
        let mut kiosk = account("kiosk01", "OU=Devices,DC=example,DC=org");
        kiosk
            .attributes
            .insert("cn".to_string(), "Front Office Kiosk".to_string());

        assert!(rules.account_excluded(&kiosk));
    }

    #[test]
    fn test_targets_override_container_exclusion() {
        let rules = rules();
        let sis = account("svc-sis", "OU=Service,OU=District,DC=example,DC=org");
        let backup = account("svc-backup", "OU=Sync,OU=Service,OU=District,DC=example,DC=org");

        assert!(!rules.account_excluded(&sis));
        // explicit exclusion beats a targeted container
        assert!(rules.account_excluded(&backup));
        assert!(!rules.group_excluded("CN=Helpdesk Students,OU=Admins,OU=District,DC=example,DC=org"));
        assert!(rules.group_excluded("CN=Helpdesk,OU=Admins,OU=District,DC=example,DC=org"));
    }

    #[test]
    fn test_escaped_containers_match() {
        let rules = ScopeRules::from_config(&ScopeConfig {
            excluded_containers: vec!["OU=Smith\\, Jones Academy,DC=example,DC=org".to_string()],
            ..ScopeConfig::default()
        });
        assert!(rules.container_excluded("OU=Staff,OU=Smith\\2C Jones Academy,DC=example,DC=org"));
    }
}
