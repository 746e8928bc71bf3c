use crate::utils::error::{Result, SyncError};
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn invalid(field_name: &str, value: impl ToString, reason: impl Into<String>) -> SyncError {
    SyncError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

pub fn validate_url(field_name: &str, url_str: &str, schemes: &[&str]) -> Result<()> {
    if url_str.is_empty() {
        return Err(invalid(field_name, url_str, "URL cannot be empty"));
    }

    let url = Url::parse(url_str)
        .map_err(|e| invalid(field_name, url_str, format!("Invalid URL format: {}", e)))?;

    if !schemes.contains(&url.scheme()) {
        return Err(invalid(
            field_name,
            url_str,
            format!(
                "Unsupported URL scheme: {}. Allowed: {}",
                url.scheme(),
                schemes.join(", ")
            ),
        ));
    }

    Ok(())
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(invalid(field_name, path, "Path cannot be empty"));
    }
    if path.contains('\0') {
        return Err(invalid(field_name, path, "Path contains null bytes"));
    }
    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(invalid(
            field_name,
            value,
            format!("Value must be at least {}", min_value),
        ));
    }
    Ok(())
}

pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| SyncError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(
            field_name,
            value,
            "Value cannot be empty or whitespace-only",
        ));
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(
            field_name,
            value,
            format!("Value must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"))
}

/// Checks that every `{placeholder}` in a mapping template is one the mapper knows.
pub fn validate_template(field_name: &str, template: &str, known: &[&str]) -> Result<()> {
    validate_non_empty_string(field_name, template)?;
    for caps in placeholder_regex().captures_iter(template) {
        let name = &caps[1];
        if !known.contains(&name) {
            return Err(invalid(
                field_name,
                template,
                format!(
                    "Unknown placeholder {{{}}}. Known placeholders: {}",
                    name,
                    known.join(", ")
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        let http = ["http", "https"];
        assert!(validate_url("stores.base_url", "https://example.com", &http).is_ok());
        assert!(validate_url("stores.base_url", "", &http).is_err());
        assert!(validate_url("stores.base_url", "invalid-url", &http).is_err());
        assert!(validate_url("stores.base_url", "ldaps://dc01:636", &http).is_err());
        assert!(validate_url("stores.url", "ldaps://dc01:636", &["ldap", "ldaps"]).is_ok());
    }

    #[test]
    fn test_validate_positive_number() {
        assert!(validate_positive_number("sync.concurrency", 5, 1).is_ok());
        assert!(validate_positive_number("sync.concurrency", 0, 1).is_err());
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range("sync.max_deprovision_ratio", 0.2, 0.0, 1.0).is_ok());
        assert!(validate_range("sync.max_deprovision_ratio", 1.5, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_validate_template() {
        let known = ["first", "last", "id"];
        assert!(validate_template("mapping.students.username", "{first}.{last}", &known).is_ok());
        assert!(validate_template("mapping.students.username", "{first}{nickname}", &known).is_err());
        assert!(validate_template("mapping.students.username", "  ", &known).is_err());
    }
}
