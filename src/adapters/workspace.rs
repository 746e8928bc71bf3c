//! Google Workspace identity store over the Admin SDK Directory API.

use crate::config::toml_config::{WorkspaceStoreConfig, DEFAULT_WORKSPACE_URL};
use crate::domain::model::{Account, AccountStatus, AttributeChange, PersonKind};
use crate::domain::ports::{Capability, IdentityStore};
use crate::utils::error::{Result, SyncError};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const PAGE_SIZE: &str = "500";
const GROUP_PAGE_SIZE: &str = "200";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const PASSWORD_LENGTH: usize = 24;
const EXTERNAL_ID_TYPE: &str = "organization";
const RELATIONSHIP_ID_TYPE: &str = "districtRelationship";

const CAPABILITIES: &[Capability] = &[
    Capability::Create,
    Capability::Update,
    Capability::Move,
    Capability::Suspend,
    Capability::Delete,
    Capability::Groups,
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPage {
    #[serde(default)]
    users: Vec<User>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    id: String,
    primary_email: String,
    #[serde(default)]
    name: UserName,
    #[serde(default)]
    suspended: bool,
    #[serde(default)]
    org_unit_path: String,
    #[serde(default)]
    external_ids: Vec<ExternalId>,
    #[serde(default)]
    organizations: Vec<Organization>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserName {
    #[serde(default)]
    given_name: String,
    #[serde(default)]
    family_name: String,
    #[serde(default)]
    full_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalId {
    #[serde(default)]
    value: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    custom_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Organization {
    #[serde(default)]
    primary: bool,
    name: Option<String>,
    department: Option<String>,
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupPage {
    #[serde(default)]
    groups: Vec<Group>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Group {
    email: String,
}

impl User {
    fn into_account(self) -> Account {
        let mut attributes = BTreeMap::new();
        let org = self
            .organizations
            .iter()
            .find(|o| o.primary)
            .or_else(|| self.organizations.first());
        if let Some(org) = org {
            let fields = [
                ("company", &org.name),
                ("department", &org.department),
                ("title", &org.title),
                ("description", &org.description),
            ];
            for (name, value) in fields {
                if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                    attributes.insert(name.to_string(), value.clone());
                }
            }
        }

        let mut external_id = None;
        for id in &self.external_ids {
            if id.value.is_empty() {
                continue;
            }
            match (id.kind.as_str(), id.custom_type.as_deref()) {
                (EXTERNAL_ID_TYPE, _) if external_id.is_none() => external_id = Some(id.value.clone()),
                ("custom", Some(RELATIONSHIP_ID_TYPE)) => {
                    attributes.insert(RELATIONSHIP_ID_TYPE.to_string(), id.value.clone());
                }
                _ => {}
            }
        }

        let kind = match attributes.get("description").map(String::as_str) {
            Some("Student") => Some(PersonKind::Student),
            Some("Staff") => Some(PersonKind::Staff),
            _ => None,
        };

        let email = self.primary_email.to_lowercase();
        let username = email.split('@').next().unwrap_or_default().to_string();

        Account {
            key: self.id,
            external_id,
            kind,
            username,
            email: Some(email),
            given_name: self.name.given_name,
            family_name: self.name.family_name,
            display_name: self.name.full_name,
            container: self.org_unit_path,
            status: if self.suspended {
                AccountStatus::Suspended
            } else {
                AccountStatus::Active
            },
            attributes,
            groups: BTreeSet::new(),
        }
    }
}

/// Profile fields shared by user insert and patch bodies.
fn profile_body(account: &Account) -> Value {
    let mut external_ids = Vec::new();
    if let Some(id) = &account.external_id {
        external_ids.push(json!({ "type": EXTERNAL_ID_TYPE, "value": id }));
    }
    if let Some(relationship) = account.attribute(RELATIONSHIP_ID_TYPE) {
        external_ids.push(json!({
            "type": "custom",
            "customType": RELATIONSHIP_ID_TYPE,
            "value": relationship,
        }));
    }

    let mut organization = serde_json::Map::new();
    organization.insert("primary".to_string(), Value::Bool(true));
    for (attribute, field) in [
        ("company", "name"),
        ("department", "department"),
        ("title", "title"),
        ("description", "description"),
    ] {
        if let Some(value) = account.attribute(attribute) {
            organization.insert(field.to_string(), Value::String(value.to_string()));
        }
    }
    let organizations = if organization.len() > 1 {
        vec![Value::Object(organization)]
    } else {
        Vec::new()
    };

    let mut body = json!({
        "name": {
            "givenName": account.given_name,
            "familyName": account.family_name,
        },
        "externalIds": external_ids,
        "organizations": organizations,
    });
    if let Some(email) = &account.email {
        body["primaryEmail"] = Value::String(email.clone());
    }
    body
}

fn initial_password() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Passes successful responses through; `tolerated` statuses count as success.
async fn check(response: Response, tolerated: &[StatusCode]) -> Result<Option<Response>> {
    let status = response.status();
    if status.is_success() {
        return Ok(Some(response));
    }
    if tolerated.contains(&status) {
        tracing::debug!("Workspace returned {}, treated as already applied", status);
        return Ok(None);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SyncError::ApiError {
        status: status.as_u16(),
        message,
    })
}

pub struct WorkspaceDirectory {
    config: WorkspaceStoreConfig,
    base_url: String,
    client: Client,
    fetch_groups: bool,
}

impl WorkspaceDirectory {
    pub fn new(config: WorkspaceStoreConfig, fetch_groups: bool) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKSPACE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            config,
            base_url,
            client,
            fetch_groups,
        })
    }

    fn customer(&self) -> &str {
        self.config.customer.as_deref().unwrap_or("my_customer")
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("{}: {} {}", self.config.name, method, url);
        self.client
            .request(method, url)
            .bearer_auth(&self.config.access_token)
    }

    async fn get_user(&self, key: &str) -> Result<User> {
        let response = self
            .request(reqwest::Method::GET, &format!("/users/{}", key))
            .query(&[("projection", "full")])
            .send()
            .await?;
        match check(response, &[]).await? {
            Some(response) => Ok(response.json().await?),
            None => Err(SyncError::store(&self.config.name, format!("user {} not found", key))),
        }
    }

    async fn patch_user(&self, key: &str, body: Value) -> Result<()> {
        let response = self
            .request(reqwest::Method::PATCH, &format!("/users/{}", key))
            .json(&body)
            .send()
            .await?;
        check(response, &[]).await?;
        Ok(())
    }

    async fn groups_of(&self, email: &str) -> Result<BTreeSet<String>> {
        let mut groups = BTreeSet::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .request(reqwest::Method::GET, "/groups")
                .query(&[("userKey", email)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let response = check(request.send().await?, &[]).await?;
            let Some(response) = response else { break };
            let page: GroupPage = response.json().await?;
            groups.extend(page.groups.into_iter().map(|g| g.email.to_lowercase()));

            match page.next_page_token {
                Some(next) if !next.is_empty() && Some(&next) != page_token.as_ref() => {
                    page_token = Some(next)
                }
                _ => break,
            }
        }
        Ok(groups)
    }
}

#[async_trait]
impl IdentityStore for WorkspaceDirectory {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let customer = self.customer();
        let mut accounts = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.request(reqwest::Method::GET, "/users").query(&[
                ("customer", customer),
                ("projection", "full"),
                ("maxResults", PAGE_SIZE),
            ]);
            if let Some(query) = &self.config.query {
                request = request.query(&[("query", query)]);
            }
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = check(request.send().await?, &[]).await?;
            let Some(response) = response else { break };
            let page: UserPage = response.json().await?;
            accounts.extend(page.users.into_iter().map(User::into_account));

            match page.next_page_token {
                Some(next) if !next.is_empty() => {
                    if Some(&next) == page_token.as_ref() {
                        return Err(SyncError::store(
                            &self.config.name,
                            "user listing returned the same page token twice",
                        ));
                    }
                    page_token = Some(next);
                }
                _ => break,
            }
        }

        if self.fetch_groups {
            for account in &mut accounts {
                if let Some(email) = account.email.clone() {
                    account.groups = self.groups_of(&email).await?;
                }
            }
        }

        tracing::debug!("{}: {} users listed", self.config.name, accounts.len());
        Ok(accounts)
    }

    async fn create_account(&self, account: &Account) -> Result<String> {
        let mut body = profile_body(account);
        body["orgUnitPath"] = Value::String(if account.container.is_empty() {
            "/".to_string()
        } else {
            account.container.clone()
        });
        body["suspended"] = Value::Bool(!account.is_active());
        body["password"] = Value::String(initial_password());
        body["changePasswordAtNextLogin"] = Value::Bool(true);

        let response = self
            .request(reqwest::Method::POST, "/users")
            .json(&body)
            .send()
            .await?;
        match check(response, &[StatusCode::CONFLICT]).await? {
            Some(response) => {
                let created: User = response.json().await?;
                Ok(created.id)
            }
            None => {
                // Only ours if it carries the same external id.
                let email = account.email.clone().ok_or_else(|| {
                    SyncError::store(&self.config.name, "existing user has no email to address it by")
                })?;
                let existing = self.get_user(&email).await?.into_account();
                if existing.external_id.is_some() && existing.external_id == account.external_id {
                    tracing::debug!("{}: {} already exists for {}", self.config.name, email, account.label());
                    return Ok(existing.key);
                }
                Err(SyncError::store(
                    &self.config.name,
                    format!(
                        "{} already belongs to another user ({}), not adopting it for {}",
                        email,
                        existing.external_id.as_deref().unwrap_or("no external id"),
                        account.label()
                    ),
                ))
            }
        }
    }

    async fn list_groups(&self) -> Result<Vec<String>> {
        let mut groups = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .request(reqwest::Method::GET, "/groups")
                .query(&[("customer", self.customer()), ("maxResults", GROUP_PAGE_SIZE)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let response = check(request.send().await?, &[]).await?;
            let Some(response) = response else { break };
            let page: GroupPage = response.json().await?;
            groups.extend(page.groups.into_iter().map(|g| g.email.to_lowercase()));

            match page.next_page_token {
                Some(next) if !next.is_empty() => {
                    if Some(&next) == page_token.as_ref() {
                        return Err(SyncError::store(
                            &self.config.name,
                            "group listing returned the same page token twice",
                        ));
                    }
                    page_token = Some(next);
                }
                _ => break,
            }
        }
        tracing::debug!("{}: {} groups listed", self.config.name, groups.len());
        Ok(groups)
    }

    async fn create_group(&self, group: &str) -> Result<()> {
        let name = group.split('@').next().unwrap_or(group);
        let response = self
            .request(reqwest::Method::POST, "/groups")
            .json(&json!({ "email": group, "name": name }))
            .send()
            .await?;
        if check(response, &[StatusCode::CONFLICT]).await?.is_none() {
            tracing::debug!("{}: group {} already exists", self.config.name, group);
        }
        Ok(())
    }

    async fn update_account(&self, key: &str, changes: &[AttributeChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut account = self.get_user(key).await?.into_account();
        for change in changes {
            account.set_attribute(&change.attribute, change.to.clone());
        }
        self.patch_user(key, profile_body(&account)).await
    }

    async fn move_account(&self, key: &str, container: &str) -> Result<String> {
        self.patch_user(key, json!({ "orgUnitPath": container })).await?;
        Ok(key.to_string())
    }

    async fn set_status(&self, key: &str, status: AccountStatus) -> Result<()> {
        self.patch_user(
            key,
            json!({ "suspended": status == AccountStatus::Suspended }),
        )
        .await
    }

    async fn delete_account(&self, key: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/users/{}", key))
            .send()
            .await?;
        check(response, &[StatusCode::NOT_FOUND]).await?;
        Ok(())
    }

    async fn add_member(&self, key: &str, group: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/groups/{}/members", group))
            .json(&json!({ "id": key, "role": "MEMBER" }))
            .send()
            .await?;
        check(response, &[StatusCode::CONFLICT]).await?;
        Ok(())
    }

    async fn remove_member(&self, key: &str, group: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/groups/{}/members/{}", group, key),
            )
            .send()
            .await?;
        check(response, &[StatusCode::NOT_FOUND]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_into_account() {
        let user: User = serde_json::from_value(json!({
            "id": "1234",
            "primaryEmail": "JDoe1001@Students.Example.org",
            "name": { "givenName": "Jane", "familyName": "Doe", "fullName": "Jane Doe" },
            "suspended": true,
            "orgUnitPath": "/Students/3rd Grade",
            "externalIds": [
                { "type": "organization", "value": "1001" },
                { "type": "custom", "customType": "districtRelationship", "value": "1" }
            ],
            "organizations": [
                { "primary": true, "name": "Lincoln", "department": "3rd Grade", "description": "Student" }
            ]
        }))
        .unwrap();

        let account = user.into_account();

        assert_eq!(account.key, "1234");
        assert_eq!(account.username, "jdoe1001");
        assert_eq!(account.email.as_deref(), Some("jdoe1001@students.example.org"));
        assert_eq!(account.external_id.as_deref(), Some("1001"));
        assert_eq!(account.kind, Some(PersonKind::Student));
        assert_eq!(account.status, AccountStatus::Suspended);
        assert_eq!(account.container, "/Students/3rd Grade");
        assert_eq!(account.attribute("company"), Some("Lincoln"));
        assert_eq!(account.attribute("districtRelationship"), Some("1"));
        assert_eq!(account.attribute("title"), None);
    }

    #[test]
    fn test_profile_body_carries_external_ids_and_organization() {
        let mut attributes = BTreeMap::new();
        attributes.insert("department".to_string(), "Science".to_string());
        attributes.insert("title".to_string(), "Teacher".to_string());
        let account = Account {
            key: String::new(),
            external_id: Some("E-7".to_string()),
            kind: Some(PersonKind::Staff),
            username: "mgarcia".to_string(),
            email: Some("mgarcia@example.org".to_string()),
            given_name: "Maria".to_string(),
            family_name: "Garcia".to_string(),
            display_name: "Maria Garcia".to_string(),
            container: "/Staff".to_string(),
            status: AccountStatus::Active,
            attributes,
            groups: BTreeSet::new(),
        };

        let body = profile_body(&account);

        assert_eq!(body["primaryEmail"], "mgarcia@example.org");
        assert_eq!(body["name"]["familyName"], "Garcia");
        assert_eq!(body["externalIds"][0]["type"], "organization");
        assert_eq!(body["externalIds"][0]["value"], "E-7");
        assert_eq!(body["organizations"][0]["title"], "Teacher");
        assert_eq!(body["organizations"][0]["department"], "Science");
    }

    #[test]
    fn test_initial_password() {
        let first = initial_password();
        assert_eq!(first.len(), PASSWORD_LENGTH);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, initial_password());
    }
}
