use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("LDAP operation failed: {0}")]
    LdapError(#[from] ldap3::LdapError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Roster error: {message}")]
    RosterError { message: String },

    #[error("Store '{store}' error: {message}")]
    StoreError {
        store: String,
        message: String,
        transient: bool,
    },

    #[error("API returned {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Store '{store}' does not support {capability}")]
    UnsupportedError { store: String, capability: String },

    #[error("Sync aborted for '{store}': {reason}")]
    SafetyAbortError { store: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Source,
    Store,
    Network,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl SyncError {
    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::StoreError {
            store: store.into(),
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(store: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::StoreError {
            store: store.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn roster(message: impl Into<String>) -> Self {
        SyncError::RosterError {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::ConfigValidationError { .. }
            | SyncError::InvalidConfigValueError { .. }
            | SyncError::MissingConfigError { .. } => ErrorCategory::Configuration,
            SyncError::CsvError(_) | SyncError::RosterError { .. } => ErrorCategory::Source,
            SyncError::LdapError(_)
            | SyncError::StoreError { .. }
            | SyncError::UnsupportedError { .. }
            | SyncError::SafetyAbortError { .. } => ErrorCategory::Store,
            SyncError::HttpError(_) | SyncError::ApiError { .. } => ErrorCategory::Network,
            SyncError::IoError(_) | SyncError::SerializationError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SyncError::UnsupportedError { .. } => ErrorSeverity::Low,
            SyncError::HttpError(_)
            | SyncError::ApiError { .. }
            | SyncError::StoreError { .. }
            | SyncError::LdapError(_) => ErrorSeverity::Medium,
            SyncError::ConfigValidationError { .. }
            | SyncError::InvalidConfigValueError { .. }
            | SyncError::MissingConfigError { .. }
            | SyncError::CsvError(_)
            | SyncError::RosterError { .. }
            | SyncError::SafetyAbortError { .. } => ErrorSeverity::High,
            SyncError::IoError(_) | SyncError::SerializationError(_) => ErrorSeverity::Critical,
        }
    }

    /// Transient failures are worth retrying: throttling, server errors,
    /// dropped connections.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::StoreError { transient, .. } => *transient,
            SyncError::ApiError { status, .. } => *status == 429 || *status >= 500,
            SyncError::HttpError(e) => e.is_timeout() || e.is_connect(),
            // rc 51 busy, 52 unavailable
            SyncError::LdapError(ldap3::LdapError::LdapResult { result }) => {
                matches!(result.rc, 51 | 52)
            }
            SyncError::LdapError(ldap3::LdapError::Timeout { .. }) => true,
            SyncError::LdapError(_) => self.is_connection_lost(),
            _ => false,
        }
    }

    /// The LDAP connection is gone; only a fresh bind can succeed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            SyncError::LdapError(
                ldap3::LdapError::Io { .. }
                    | ldap3::LdapError::EndOfStream
                    | ldap3::LdapError::OpSend { .. }
                    | ldap3::LdapError::ResultRecv { .. }
                    | ldap3::LdapError::IdScrubSend { .. }
            )
        )
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => "Check the sync configuration file and environment variables",
            ErrorCategory::Source => "Check that the SIS export files exist and have the expected columns",
            ErrorCategory::Store => match self {
                SyncError::SafetyAbortError { .. } => {
                    "Verify the SIS export is complete, or raise sync.max_deprovision_ratio"
                }
                _ => "Check store credentials, permissions and connectivity",
            },
            ErrorCategory::Network => "Check network connectivity and API credentials, then retry",
            ErrorCategory::System => "Check file permissions and available disk space",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Source => format!("Could not read the SIS roster: {}", self),
            ErrorCategory::Store => format!("Identity store problem: {}", self),
            ErrorCategory::Network => format!("Network problem: {}", self),
            ErrorCategory::System => format!("System problem: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
