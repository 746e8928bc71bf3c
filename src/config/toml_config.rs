use crate::core::diff::{OnMissing, PlanPolicy};
use crate::core::mapping::{ContainerStyle, PLACEHOLDERS};
use crate::core::scope::ScopeRules;
use crate::utils::error::{Result, SyncError};
use crate::utils::retry::RetryPolicy;
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync: SyncSection,
    pub sis: SisConfig,
    pub mapping: MappingConfig,
    #[serde(default)]
    pub schools: BTreeMap<String, String>,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    pub name: String,
    pub domain: String,
    pub report_path: Option<String>,
    pub dry_run: Option<bool>,
    pub concurrency: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub on_missing: Option<OnMissing>,
    pub max_deprovision_ratio: Option<f64>,
    pub manage_groups: Option<bool>,
    pub manage_container: Option<bool>,
    pub managed_attributes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SisConfig {
    pub base_path: String,
    pub students: Option<String>,
    pub staff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub students: Option<AccountTemplate>,
    pub staff: Option<AccountTemplate>,
}

/// Naming templates for one kind of person. Placeholders are listed in
/// [`PLACEHOLDERS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountTemplate {
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub excluded_containers: Vec<String>,
    #[serde(default)]
    pub excluded_accounts: Vec<String>,
    #[serde(default)]
    pub excluded_groups: Vec<String>,
    #[serde(default)]
    pub target_containers: Vec<String>,
    #[serde(default)]
    pub target_accounts: Vec<String>,
    #[serde(default)]
    pub target_groups: Vec<String>,
}

/// Where accounts of each kind live in one store, and which groups they join.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub student_container: String,
    pub staff_container: String,
    #[serde(default)]
    pub student_groups: Vec<String>,
    #[serde(default)]
    pub staff_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Ldap(LdapStoreConfig),
    Workspace(WorkspaceStoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapStoreConfig {
    pub name: String,
    pub url: String,
    pub bind_dn: String,
    pub password: String,
    pub base_dn: String,
    pub page_size: Option<i32>,
    pub timeout_seconds: Option<u64>,
    pub layout: LayoutConfig,
    pub scope: Option<ScopeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceStoreConfig {
    pub name: String,
    pub base_url: Option<String>,
    pub access_token: String,
    pub customer: Option<String>,
    pub query: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub layout: LayoutConfig,
    pub scope: Option<ScopeConfig>,
}

pub const DEFAULT_WORKSPACE_URL: &str = "https://admin.googleapis.com/admin/directory/v1";

impl StoreConfig {
    pub fn name(&self) -> &str {
        match self {
            StoreConfig::Ldap(c) => &c.name,
            StoreConfig::Workspace(c) => &c.name,
        }
    }

    pub fn layout(&self) -> &LayoutConfig {
        match self {
            StoreConfig::Ldap(c) => &c.layout,
            StoreConfig::Workspace(c) => &c.layout,
        }
    }

    fn scope_override(&self) -> Option<&ScopeConfig> {
        match self {
            StoreConfig::Ldap(c) => c.scope.as_ref(),
            StoreConfig::Workspace(c) => c.scope.as_ref(),
        }
    }

    /// How this store's container and group templates are rendered.
    pub fn container_style(&self) -> ContainerStyle {
        match self {
            StoreConfig::Ldap(_) => ContainerStyle::Dn,
            StoreConfig::Workspace(_) => ContainerStyle::Path,
        }
    }

    /// Value of the `{base}` placeholder for this store's layout.
    pub fn base(&self) -> &str {
        match self {
            StoreConfig::Ldap(c) => &c.base_dn,
            StoreConfig::Workspace(_) => "",
        }
    }
}

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"))
}

impl SyncConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(SyncError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| SyncError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Replaces `${VAR}` with the environment value; unset variables stay literal.
    fn substitute_env_vars(content: &str) -> String {
        env_var_regex()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .into_owned()
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_string("sync.name", &self.sync.name)?;
        validation::validate_non_empty_string("sync.domain", &self.sync.domain)?;
        validation::validate_path("sis.base_path", &self.sis.base_path)?;
        validation::validate_path("sync.report_path", self.report_path())?;
        validation::validate_positive_number("sync.concurrency", self.concurrency(), 1)?;
        validation::validate_range(
            "sync.max_deprovision_ratio",
            self.max_deprovision_ratio(),
            0.0,
            1.0,
        )?;

        if self.sis.students.is_none() && self.sis.staff.is_none() {
            return Err(SyncError::MissingConfigError {
                field: "sis.students or sis.staff".to_string(),
            });
        }
        if self.sis.students.is_some() {
            let template = validation::validate_required_field(
                "mapping.students",
                &self.mapping.students,
            )?;
            validate_account_template("mapping.students", template)?;
        }
        if self.sis.staff.is_some() {
            let template =
                validation::validate_required_field("mapping.staff", &self.mapping.staff)?;
            validate_account_template("mapping.staff", template)?;
        }

        if self.stores.is_empty() {
            return Err(SyncError::MissingConfigError {
                field: "stores".to_string(),
            });
        }

        let mut names = HashSet::new();
        for store in &self.stores {
            if !names.insert(store.name()) {
                return Err(SyncError::InvalidConfigValueError {
                    field: "stores.name".to_string(),
                    value: store.name().to_string(),
                    reason: "Store names must be unique".to_string(),
                });
            }
            validate_store(store)?;
        }

        Ok(())
    }

    pub fn report_path(&self) -> &str {
        self.sync.report_path.as_deref().unwrap_or("./reports")
    }

    pub fn dry_run(&self) -> bool {
        self.sync.dry_run.unwrap_or(false)
    }

    pub fn concurrency(&self) -> usize {
        self.sync.concurrency.unwrap_or(4)
    }

    pub fn max_deprovision_ratio(&self) -> f64 {
        self.sync.max_deprovision_ratio.unwrap_or(0.1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.sync.retry_attempts.unwrap_or(3),
            self.sync.retry_delay_ms.unwrap_or(500),
        )
    }

    pub fn plan_policy(&self) -> PlanPolicy {
        let defaults = PlanPolicy::default();
        PlanPolicy {
            managed_attributes: self
                .sync
                .managed_attributes
                .clone()
                .unwrap_or(defaults.managed_attributes),
            manage_groups: self.sync.manage_groups.unwrap_or(defaults.manage_groups),
            manage_container: self
                .sync
                .manage_container
                .unwrap_or(defaults.manage_container),
            on_missing: self.sync.on_missing.unwrap_or(defaults.on_missing),
            max_deprovision_ratio: self.max_deprovision_ratio(),
        }
    }

    /// Scope rules for a store: its own `[stores.scope]` if present, else the global `[scope]`.
    pub fn scope_for(&self, store: &StoreConfig) -> ScopeRules {
        ScopeRules::from_config(store.scope_override().unwrap_or(&self.scope))
    }

    pub fn store(&self, name: &str) -> Option<&StoreConfig> {
        self.stores.iter().find(|s| s.name() == name)
    }
}

fn validate_account_template(field: &str, template: &AccountTemplate) -> Result<()> {
    validation::validate_template(&format!("{}.username", field), &template.username, PLACEHOLDERS)?;
    validation::validate_template(&format!("{}.email", field), &template.email, PLACEHOLDERS)?;
    if !template.email.contains('@') {
        return Err(SyncError::InvalidConfigValueError {
            field: format!("{}.email", field),
            value: template.email.clone(),
            reason: "Email template must contain '@'".to_string(),
        });
    }
    if let Some(display_name) = &template.display_name {
        validation::validate_template(&format!("{}.display_name", field), display_name, PLACEHOLDERS)?;
    }
    Ok(())
}

fn validate_store(store: &StoreConfig) -> Result<()> {
    let layout = store.layout();
    let prefix = format!("stores.{}", store.name());
    validation::validate_template(
        &format!("{}.layout.student_container", prefix),
        &layout.student_container,
        PLACEHOLDERS,
    )?;
    validation::validate_template(
        &format!("{}.layout.staff_container", prefix),
        &layout.staff_container,
        PLACEHOLDERS,
    )?;
    for group in layout.student_groups.iter().chain(&layout.staff_groups) {
        validation::validate_template(&format!("{}.layout.groups", prefix), group, PLACEHOLDERS)?;
    }

    match store {
        StoreConfig::Ldap(c) => {
            validation::validate_non_empty_string(&format!("{}.name", prefix), &c.name)?;
            validation::validate_url(&format!("{}.url", prefix), &c.url, &["ldap", "ldaps"])?;
            validation::validate_non_empty_string(&format!("{}.bind_dn", prefix), &c.bind_dn)?;
            validation::validate_non_empty_string(&format!("{}.base_dn", prefix), &c.base_dn)?;
            if let Some(page_size) = c.page_size {
                validation::validate_range(&format!("{}.page_size", prefix), page_size, 1, 5000)?;
            }
        }
        StoreConfig::Workspace(c) => {
            validation::validate_non_empty_string(&format!("{}.name", prefix), &c.name)?;
            validation::validate_url(
                &format!("{}.base_url", prefix),
                c.base_url.as_deref().unwrap_or(DEFAULT_WORKSPACE_URL),
                &["http", "https"],
            )?;
            validation::validate_non_empty_string(
                &format!("{}.access_token", prefix),
                &c.access_token,
            )?;
            if c.access_token.starts_with("${") {
                return Err(SyncError::MissingConfigError {
                    field: format!("{} (environment variable {})", prefix, c.access_token),
                });
            }
        }
    }
    Ok(())
}

impl Validate for SyncConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
