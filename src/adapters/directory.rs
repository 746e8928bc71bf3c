//! LDAP / Active Directory identity store.

use crate::config::toml_config::LdapStoreConfig;
use crate::core::dn::{escape_rdn_value, first_rdn_value, split_dn};
use crate::domain::model::{Account, AccountStatus, AttributeChange, AttributeOp, PersonKind};
use crate::domain::ports::{Capability, IdentityStore};
use crate::utils::error::{Result, SyncError};
use async_trait::async_trait;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod, Scope, SearchEntry};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

const USER_FILTER: &str = "(&(objectClass=user)(!(objectClass=computer)))";
const GROUP_FILTER: &str = "(objectClass=group)";
const DEFAULT_PAGE_SIZE: i32 = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const ACCOUNT_DISABLE: u32 = 0x2;
const NORMAL_ACCOUNT: u32 = 512;
const GLOBAL_SECURITY_GROUP: &str = "-2147483646";

// Result codes that mean the directory already holds the requested state.
const RC_NO_SUCH_ATTRIBUTE: u32 = 16;
const RC_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_UNWILLING_TO_PERFORM: u32 = 53;
const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

/// Portable attribute name to directory attribute name.
const ATTRIBUTE_NAMES: &[(&str, &str)] = &[
    ("username", "sAMAccountName"),
    ("email", "mail"),
    ("givenName", "givenName"),
    ("familyName", "sn"),
    ("displayName", "displayName"),
    ("description", "description"),
    ("department", "department"),
    ("title", "title"),
    ("company", "company"),
    ("districtRelationship", "employeeType"),
];

const LIST_ATTRIBUTES: &[&str] = &[
    "employeeID",
    "cn",
    "sAMAccountName",
    "mail",
    "givenName",
    "sn",
    "displayName",
    "memberOf",
    "userAccountControl",
    "description",
    "department",
    "title",
    "company",
    "employeeType",
];

const CAPABILITIES: &[Capability] = &[
    Capability::Create,
    Capability::Update,
    Capability::Move,
    Capability::Suspend,
    Capability::Delete,
    Capability::Groups,
];

pub fn ldap_attribute(portable: &str) -> &str {
    ATTRIBUTE_NAMES
        .iter()
        .find(|(name, _)| *name == portable)
        .map(|(_, ldap)| *ldap)
        .unwrap_or(portable)
}

fn first<'a>(attrs: &'a HashMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Builds an account from a search entry's DN and attributes.
pub fn account_from_entry(dn: &str, attrs: &HashMap<String, Vec<String>>) -> Account {
    let get = |name: &str| first(attrs, name).map(str::to_string);
    let uac = first(attrs, "userAccountControl")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(NORMAL_ACCOUNT);

    let mut attributes = BTreeMap::new();
    for (portable, ldap) in ATTRIBUTE_NAMES.iter().skip(5) {
        if let Some(value) = get(*ldap) {
            attributes.insert(portable.to_string(), value);
        }
    }
    if let Some(cn) = get("cn").or_else(|| first_rdn_value(dn)) {
        attributes.insert("cn".to_string(), cn);
    }

    let kind = match attributes.get("description").map(String::as_str) {
        Some("Student") => Some(PersonKind::Student),
        Some("Staff") => Some(PersonKind::Staff),
        _ => None,
    };

    let groups: BTreeSet<String> = attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("memberOf"))
        .map(|(_, values)| values.iter().cloned().collect())
        .unwrap_or_default();

    Account {
        key: dn.to_string(),
        external_id: get("employeeID"),
        kind,
        username: get("sAMAccountName").unwrap_or_default(),
        email: get("mail"),
        given_name: get("givenName").unwrap_or_default(),
        family_name: get("sn").unwrap_or_default(),
        display_name: get("displayName").unwrap_or_default(),
        container: split_dn(dn).1.to_string(),
        status: if uac & ACCOUNT_DISABLE != 0 {
            AccountStatus::Suspended
        } else {
            AccountStatus::Active
        },
        attributes,
        groups,
    }
}

fn set(value: impl Into<String>) -> HashSet<String> {
    HashSet::from([value.into()])
}

/// Common names to try for a new user, most natural first.
///
/// The second form only comes into play when another person already holds the
/// first one in the same container.
pub fn candidate_common_names(account: &Account) -> Vec<String> {
    let cn = if account.display_name.is_empty() {
        account.username.clone()
    } else {
        account.display_name.clone()
    };
    let mut names = vec![cn.clone()];
    if let Some(id) = &account.external_id {
        names.push(format!("{} ({})", cn, id));
    }
    names
}

/// Attributes for a new, disabled user entry.
fn new_user_attributes(account: &Account, cn: &str) -> Vec<(String, HashSet<String>)> {
    let mut attrs: Vec<(String, HashSet<String>)> = vec![
        (
            "objectClass".to_string(),
            ["top", "person", "organizationalPerson", "user"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        ),
        ("cn".to_string(), set(cn)),
        (
            "userAccountControl".to_string(),
            set((NORMAL_ACCOUNT | ACCOUNT_DISABLE).to_string()),
        ),
    ];
    if let Some(id) = &account.external_id {
        attrs.push(("employeeID".to_string(), set(id.as_str())));
    }
    if let Some(email) = &account.email {
        attrs.push(("userPrincipalName".to_string(), set(email.as_str())));
    }
    for (portable, ldap) in ATTRIBUTE_NAMES {
        if let Some(value) = account.attribute(portable) {
            attrs.push((ldap.to_string(), set(value)));
        }
    }
    attrs
}

/// Pre-Windows 2000 name for a group: the common name without the characters
/// AD rejects there.
fn group_account_name(cn: &str) -> String {
    cn.chars()
        .filter(|c| !matches!(*c, '"' | '/' | '\\' | '[' | ']' | ':' | ';' | '|' | '=' | ',' | '+' | '*' | '?' | '<' | '>'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Attributes for a new global security group.
fn new_group_attributes(cn: &str) -> Vec<(String, HashSet<String>)> {
    vec![
        (
            "objectClass".to_string(),
            ["top", "group"].iter().map(|c| c.to_string()).collect(),
        ),
        ("cn".to_string(), set(cn)),
        ("sAMAccountName".to_string(), set(group_account_name(cn))),
        ("groupType".to_string(), set(GLOBAL_SECURITY_GROUP)),
    ]
}

/// `Ok` when the operation succeeded or the directory already matched.
fn converged(result: LdapResult, tolerated: &[u32]) -> Result<()> {
    if tolerated.contains(&result.rc) {
        tracing::debug!("LDAP rc {} treated as already applied: {}", result.rc, result.text);
        return Ok(());
    }
    result.success()?;
    Ok(())
}

pub struct LdapDirectory {
    config: LdapStoreConfig,
    timeout: Duration,
    conn: Mutex<Option<Ldap>>,
}

impl LdapDirectory {
    pub fn new(config: LdapStoreConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS));
        Self {
            config,
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// Opens and binds a fresh connection, replacing any cached one.
    async fn connect(&self) -> Result<Ldap> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.url).await?;
        let name = self.config.name.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!("{}: LDAP connection closed: {}", name, e);
            }
        });
        ldap.simple_bind(&self.config.bind_dn, &self.config.password)
            .await?
            .success()?;
        tracing::debug!("{}: bound to {} as {}", self.config.name, self.config.url, self.config.bind_dn);

        *self.conn.lock().await = Some(ldap.clone());
        Ok(ldap)
    }

    async fn connection(&self) -> Result<Ldap> {
        let cached = self.conn.lock().await.clone();
        match cached {
            Some(ldap) => Ok(ldap),
            None => self.connect().await,
        }
    }

    /// Drops the cached connection when `result` shows it is gone, so the
    /// next operation binds again instead of failing on a dead handle.
    async fn forget_if_lost<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_lost() {
                tracing::warn!("{}: LDAP connection lost, rebinding on next use: {}", self.config.name, e);
                *self.conn.lock().await = None;
            }
        }
        result
    }

    async fn modify(&self, dn: &str, mods: Vec<Mod<String>>, tolerated: &[u32]) -> Result<()> {
        let result: Result<()> = async {
            let mut ldap = self.connection().await?;
            let result = ldap.with_timeout(self.timeout).modify(dn, mods).await?;
            converged(result, tolerated)
        }
        .await;
        self.forget_if_lost(result).await
    }

    /// Adds an entry; `Ok(false)` when the DN is already taken.
    async fn add_entry(&self, dn: &str, attrs: Vec<(String, HashSet<String>)>) -> Result<bool> {
        let result: Result<bool> = async {
            let mut ldap = self.connection().await?;
            let result = ldap.with_timeout(self.timeout).add(dn, attrs).await?;
            if result.rc == RC_ENTRY_ALREADY_EXISTS {
                return Ok(false);
            }
            result.success()?;
            Ok(true)
        }
        .await;
        self.forget_if_lost(result).await
    }

    /// First value of `attribute` on the entry at `dn`.
    async fn read_attribute(&self, dn: &str, attribute: &str) -> Result<Option<String>> {
        let result: Result<Option<String>> = async {
            let mut ldap = self.connection().await?;
            let (entries, _) = ldap
                .with_timeout(self.timeout)
                .search(dn, Scope::Base, "(objectClass=*)", vec![attribute])
                .await?
                .success()?;
            Ok(entries
                .into_iter()
                .next()
                .map(SearchEntry::construct)
                .and_then(|e| first(&e.attrs, attribute).map(str::to_string)))
        }
        .await;
        self.forget_if_lost(result).await
    }

    async fn user_account_control(&self, dn: &str) -> Result<u32> {
        Ok(self
            .read_attribute(dn, "userAccountControl")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(NORMAL_ACCOUNT))
    }

    /// Paged subtree search under the base DN on a fresh connection.
    async fn search_all(&self, filter: &str, attrs: Vec<&str>) -> Result<Vec<SearchEntry>> {
        let result: Result<Vec<SearchEntry>> = async {
            let mut ldap = self.connect().await?;
            let page_size = self.config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
            let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
                Box::new(EntriesOnly::new()),
                Box::new(PagedResults::new(page_size)),
            ];

            let mut search = ldap
                .streaming_search_with(adapters, &self.config.base_dn, Scope::Subtree, filter, attrs)
                .await?;

            let mut entries = Vec::new();
            while let Some(entry) = search.next().await? {
                entries.push(SearchEntry::construct(entry));
            }
            search.finish().await.success()?;
            Ok(entries)
        }
        .await;
        self.forget_if_lost(result).await
    }
}

#[async_trait]
impl IdentityStore for LdapDirectory {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts: Vec<Account> = self
            .search_all(USER_FILTER, LIST_ATTRIBUTES.to_vec())
            .await?
            .iter()
            .map(|entry| account_from_entry(&entry.dn, &entry.attrs))
            .collect();
        tracing::debug!("{}: {} user entries under {}", self.config.name, accounts.len(), self.config.base_dn);
        Ok(accounts)
    }

    async fn list_groups(&self) -> Result<Vec<String>> {
        let groups: Vec<String> = self
            .search_all(GROUP_FILTER, vec!["cn"])
            .await?
            .into_iter()
            .map(|entry| entry.dn)
            .collect();
        tracing::debug!("{}: {} groups under {}", self.config.name, groups.len(), self.config.base_dn);
        Ok(groups)
    }

    async fn create_account(&self, account: &Account) -> Result<String> {
        let mut created = None;
        for cn in candidate_common_names(account) {
            let dn = format!("CN={},{}", escape_rdn_value(&cn), account.container);
            if self.add_entry(&dn, new_user_attributes(account, &cn)).await? {
                created = Some(dn);
                break;
            }
            // Taken: ours from an earlier attempt, or someone else's.
            let owner = self.read_attribute(&dn, "employeeID").await?;
            if owner.is_some() && owner == account.external_id {
                tracing::debug!("{}: {} already exists for {}", self.config.name, dn, account.label());
                created = Some(dn);
                break;
            }
            tracing::warn!("{}: {} belongs to another account, not adopting it", self.config.name, dn);
        }
        let dn = created.ok_or_else(|| {
            SyncError::store(
                &self.config.name,
                format!("no free common name for {} under {}", account.label(), account.container),
            )
        })?;

        if account.is_active() {
            self.modify(
                &dn,
                vec![Mod::Replace(
                    "userAccountControl".to_string(),
                    set(NORMAL_ACCOUNT.to_string()),
                )],
                &[],
            )
            .await?;
        }
        Ok(dn)
    }

    async fn create_group(&self, group: &str) -> Result<()> {
        let cn = first_rdn_value(group).ok_or_else(|| {
            SyncError::store(&self.config.name, format!("'{}' is not a group DN", group))
        })?;
        if !self.add_entry(group, new_group_attributes(&cn)).await? {
            tracing::debug!("{}: group {} already exists", self.config.name, group);
        }
        Ok(())
    }

    async fn update_account(&self, key: &str, changes: &[AttributeChange]) -> Result<()> {
        let mods: Vec<Mod<String>> = changes
            .iter()
            .map(|change| {
                let name = ldap_attribute(&change.attribute).to_string();
                let value = change.to.clone().unwrap_or_default();
                match change.op() {
                    AttributeOp::Add => Mod::Add(name, set(value)),
                    AttributeOp::Replace => Mod::Replace(name, set(value)),
                    AttributeOp::Delete => Mod::Delete(name, HashSet::new()),
                }
            })
            .collect();
        if mods.is_empty() {
            return Ok(());
        }
        self.modify(key, mods, &[RC_NO_SUCH_ATTRIBUTE]).await
    }

    async fn move_account(&self, key: &str, container: &str) -> Result<String> {
        let (rdn, _) = split_dn(key);
        let result: Result<()> = async {
            let mut ldap = self.connection().await?;
            ldap.with_timeout(self.timeout)
                .modifydn(key, rdn, true, Some(container))
                .await?
                .success()?;
            Ok(())
        }
        .await;
        self.forget_if_lost(result).await?;
        Ok(format!("{},{}", rdn, container))
    }

    async fn set_status(&self, key: &str, status: AccountStatus) -> Result<()> {
        let current = self.user_account_control(key).await?;
        let wanted = match status {
            AccountStatus::Active => current & !ACCOUNT_DISABLE,
            AccountStatus::Suspended => current | ACCOUNT_DISABLE,
        };
        if wanted == current {
            return Ok(());
        }
        self.modify(
            key,
            vec![Mod::Replace("userAccountControl".to_string(), set(wanted.to_string()))],
            &[],
        )
        .await
    }

    async fn delete_account(&self, key: &str) -> Result<()> {
        let result: Result<()> = async {
            let mut ldap = self.connection().await?;
            let result = ldap.with_timeout(self.timeout).delete(key).await?;
            converged(result, &[RC_NO_SUCH_OBJECT])
        }
        .await;
        self.forget_if_lost(result).await
    }

    async fn add_member(&self, key: &str, group: &str) -> Result<()> {
        self.modify(
            group,
            vec![Mod::Add("member".to_string(), set(key))],
            &[RC_ENTRY_ALREADY_EXISTS, RC_ATTRIBUTE_OR_VALUE_EXISTS],
        )
        .await
    }

    async fn remove_member(&self, key: &str, group: &str) -> Result<()> {
        self.modify(
            group,
            vec![Mod::Delete("member".to_string(), set(key))],
            &[RC_NO_SUCH_ATTRIBUTE, RC_UNWILLING_TO_PERFORM],
        )
        .await
    }
}
