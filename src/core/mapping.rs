//! Turns SIS records into the accounts each store should hold.

use crate::config::toml_config::{AccountTemplate, LayoutConfig, SyncConfig};
use crate::core::dn::escape_rdn_value;
use crate::domain::model::{Account, AccountStatus, Conflict, Person, PersonKind};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

pub const PLACEHOLDERS: &[&str] = &[
    "first",
    "last",
    "first_initial",
    "middle_initial",
    "id",
    "grade",
    "grade_code",
    "school",
    "school_id",
    "domain",
    "username",
    "base",
];

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"))
}

/// English ordinal: 1st, 2nd, 3rd, 4th, 11th, 12th, 13th, 21st, 22nd...
pub fn ordinal(n: i64) -> String {
    let suffix = match (n % 100, n % 10) {
        (11..=13, _) => "th",
        (_, 1) => "st",
        (_, 2) => "nd",
        (_, 3) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

/// Human grade name from an SIS grade code.
pub fn grade_name(code: &str) -> String {
    let code = code.trim();
    match code.to_ascii_lowercase().as_str() {
        "-1" | "pk" | "p" => return "Preschool".to_string(),
        "0" | "k" | "kg" => return "Kindergarten".to_string(),
        _ => {}
    }
    match code.parse::<i64>() {
        Ok(n) if n > 0 => format!("{} Grade", ordinal(n)),
        _ => code.to_string(),
    }
}

/// Lowercases and keeps only characters valid in a login name.
pub fn sanitize_login(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// Fills `{placeholder}`s. `None` when any referenced value is missing or empty.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> Option<String> {
    let mut missing = false;
    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures| {
        match vars.get(&caps[1]).filter(|v| !v.is_empty()) {
            Some(value) => value.clone(),
            None => {
                missing = true;
                String::new()
            }
        }
    });
    if missing {
        None
    } else {
        Some(rendered.trim().to_string())
    }
}

fn initial(value: &str) -> String {
    value.chars().next().map(|c| c.to_string()).unwrap_or_default()
}

/// How a store's container and group templates are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerStyle {
    /// Distinguished names: substituted values are RDN-escaped, `{base}` is not.
    Dn,
    /// Org unit paths and group emails, used as rendered.
    #[default]
    Path,
}

#[derive(Debug, Clone)]
pub struct Mapper {
    students: Option<AccountTemplate>,
    staff: Option<AccountTemplate>,
    schools: BTreeMap<String, String>,
    domain: String,
}

impl Mapper {
    pub fn new(
        students: Option<AccountTemplate>,
        staff: Option<AccountTemplate>,
        schools: BTreeMap<String, String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            students,
            staff,
            schools,
            domain: domain.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.mapping.students.clone(),
            config.mapping.staff.clone(),
            config.schools.clone(),
            config.sync.domain.clone(),
        )
    }

    fn template(&self, kind: PersonKind) -> Option<&AccountTemplate> {
        match kind {
            PersonKind::Student => self.students.as_ref(),
            PersonKind::Staff => self.staff.as_ref(),
        }
    }

    fn school_name(&self, person: &Person) -> Option<String> {
        person
            .school_id
            .as_ref()
            .map(|id| self.schools.get(id).cloned().unwrap_or_else(|| id.clone()))
    }

    /// Raw values for display names, containers and groups.
    fn raw_vars(&self, person: &Person, base: &str) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("first", person.first_name.clone());
        vars.insert("last", person.last_name.clone());
        vars.insert("first_initial", initial(&person.first_name));
        vars.insert(
            "middle_initial",
            person.middle_name.as_deref().map(initial).unwrap_or_default(),
        );
        vars.insert("id", person.external_id.clone());
        if let Some(grade) = &person.grade {
            vars.insert("grade", grade_name(grade));
            vars.insert("grade_code", grade.clone());
        }
        if let Some(school) = self.school_name(person) {
            vars.insert("school", school);
        }
        if let Some(school_id) = &person.school_id {
            vars.insert("school_id", school_id.clone());
        }
        vars.insert("domain", self.domain.clone());
        vars.insert("base", base.to_string());
        vars
    }

    /// The account `person` should have in a store laid out as `layout`.
    pub fn desired(
        &self,
        person: &Person,
        layout: &LayoutConfig,
        base: &str,
        style: ContainerStyle,
    ) -> std::result::Result<Account, Conflict> {
        let conflict = |reason: String| Conflict {
            external_id: Some(person.external_id.clone()),
            reason,
        };

        let template = self
            .template(person.kind)
            .ok_or_else(|| conflict(format!("no {} naming template configured", person.kind)))?;

        let raw = self.raw_vars(person, base);
        let login_vars: HashMap<&str, String> = raw
            .iter()
            .map(|(k, v)| match *k {
                "domain" | "base" => (*k, v.to_lowercase()),
                _ => (*k, sanitize_login(v)),
            })
            .collect();

        let username = render(&template.username, &login_vars)
            .map(|u| sanitize_login(&u))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| conflict("username template references missing data".to_string()))?;

        let mut email_vars = login_vars.clone();
        email_vars.insert("username", username.clone());
        let email = render(&template.email, &email_vars)
            .map(|e| e.to_lowercase())
            .ok_or_else(|| conflict("email template references missing data".to_string()))?;

        let mut raw_with_username = raw.clone();
        raw_with_username.insert("username", username.clone());

        let display_name = match &template.display_name {
            Some(t) => render(t, &raw_with_username)
                .ok_or_else(|| conflict("display name template references missing data".to_string()))?,
            None => format!("{} {}", person.first_name, person.last_name),
        };

        let mut path_vars = raw_with_username.clone();
        if style == ContainerStyle::Dn {
            for (name, value) in path_vars.iter_mut() {
                if *name != "base" {
                    *value = escape_rdn_value(value);
                }
            }
        }

        let container_template = match person.kind {
            PersonKind::Student => &layout.student_container,
            PersonKind::Staff => &layout.staff_container,
        };
        let container = render(container_template, &path_vars)
            .ok_or_else(|| conflict(format!("container template '{}' references missing data", container_template)))?;

        let group_templates = match person.kind {
            PersonKind::Student => &layout.student_groups,
            PersonKind::Staff => &layout.staff_groups,
        };
        let groups: BTreeSet<String> = group_templates
            .iter()
            .filter_map(|t| render(t, &path_vars))
            .filter(|g| !g.is_empty())
            .map(|g| if g.contains('@') { g.to_lowercase() } else { g })
            .collect();

        let mut attributes = BTreeMap::new();
        match person.kind {
            PersonKind::Student => {
                attributes.insert("description".to_string(), "Student".to_string());
                if let Some(grade) = &person.grade {
                    attributes.insert("department".to_string(), grade_name(grade));
                }
            }
            PersonKind::Staff => {
                attributes.insert("description".to_string(), "Staff".to_string());
                if let Some(title) = &person.title {
                    attributes.insert("title".to_string(), title.clone());
                }
                if let Some(department) = &person.department {
                    attributes.insert("department".to_string(), department.clone());
                }
            }
        }
        if let Some(school) = self.school_name(person) {
            attributes.insert("company".to_string(), school);
        }
        if let Some(relationship) = &person.district_relationship {
            attributes.insert("districtRelationship".to_string(), relationship.clone());
        }

        Ok(Account {
            key: String::new(),
            external_id: Some(person.external_id.clone()),
            kind: Some(person.kind),
            username,
            email: Some(email),
            given_name: person.first_name.clone(),
            family_name: person.last_name.clone(),
            display_name,
            container,
            status: if person.enrolled {
                AccountStatus::Active
            } else {
                AccountStatus::Suspended
            },
            attributes,
            groups,
        })
    }

    /// Maps a whole roster; records that cannot be named come back as conflicts.
    pub fn desired_accounts(
        &self,
        people: &[Person],
        layout: &LayoutConfig,
        base: &str,
        style: ContainerStyle,
    ) -> (Vec<Account>, Vec<Conflict>) {
        let mut accounts = Vec::with_capacity(people.len());
        let mut conflicts = Vec::new();
        for person in people {
            match self.desired(person, layout, base, style) {
                Ok(account) => accounts.push(account),
                Err(conflict) => {
                    tracing::warn!(
                        "Cannot map {} {}: {}",
                        person.kind,
                        person.external_id,
                        conflict.reason
                    );
                    conflicts.push(conflict);
                }
            }
        }
        (accounts, conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: &str, first: &str, last: &str, grade: Option<&str>) -> Person {
        Person {
            external_id: id.to_string(),
            kind: PersonKind::Student,
            first_name: first.to_string(),
            middle_name: None,
            last_name: last.to_string(),
            grade: grade.map(str::to_string),
            school_id: Some("101".to_string()),
            title: None,
            department: None,
            enrolled: true,
            district_relationship: Some("1".to_string()),
        }
    }

    fn mapper() -> Mapper {
        let mut schools = BTreeMap::new();
        schools.insert("101".to_string(), "Lincoln Elementary".to_string());
        Mapper::new(
            Some(AccountTemplate {
                username: "{first_initial}{last}{id}".to_string(),
                email: "{username}@students.{domain}".to_string(),
                display_name: None,
            }),
            Some(AccountTemplate {
                username: "{first}.{last}".to_string(),
                email: "{username}@{domain}".to_string(),
                display_name: Some("{last}, {first}".to_string()),
            }),
            schools,
            "Example.org",
        )
    }

    fn layout() -> LayoutConfig {
        LayoutConfig {
            student_container: "OU={grade},OU=Students,{base}".to_string(),
            staff_container: "OU=Staff,{base}".to_string(),
            student_groups: vec![
                "CN={school} Students,OU=Groups,{base}".to_string(),
                "CN=Grade {grade_code},OU=Groups,{base}".to_string(),
            ],
            staff_groups: vec![],
        }
    }

    #[test]
    fn test_grade_names() {
        assert_eq!(grade_name("PK"), "Preschool");
        assert_eq!(grade_name("-1"), "Preschool");
        assert_eq!(grade_name("k"), "Kindergarten");
        assert_eq!(grade_name("0"), "Kindergarten");
        assert_eq!(grade_name("1"), "1st Grade");
        assert_eq!(grade_name("2"), "2nd Grade");
        assert_eq!(grade_name("3"), "3rd Grade");
        assert_eq!(grade_name("11"), "11th Grade");
        assert_eq!(grade_name("12"), "12th Grade");
        assert_eq!(grade_name("22"), "22nd Grade");
        assert_eq!(grade_name("Adult Ed"), "Adult Ed");
    }

    #[test]
    fn test_render_reports_missing_values() {
        let mut vars = HashMap::new();
        vars.insert("first", "Jane".to_string());
        vars.insert("last", String::new());
        assert_eq!(render("{first}", &vars).as_deref(), Some("Jane"));
        assert_eq!(render("{first}.{last}", &vars), None);
        assert_eq!(render("{grade}", &vars), None);
    }

    #[test]
    fn test_student_account() {
        let mut person = student("1001", "Zoë", "O'Brien", Some("3"));
        person.middle_name = Some("Ann".to_string());

        let account = mapper()
            .desired(&person, &layout(), "OU=District,DC=example,DC=org", ContainerStyle::Dn)
            .unwrap();

        assert_eq!(account.username, "zobrien1001");
        assert_eq!(account.email.as_deref(), Some("zobrien1001@students.example.org"));
        assert_eq!(account.display_name, "Zoë O'Brien");
        assert_eq!(account.container, "OU=3rd Grade,OU=Students,OU=District,DC=example,DC=org");
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(account.attribute("department"), Some("3rd Grade"));
        assert_eq!(account.attribute("company"), Some("Lincoln Elementary"));
        assert_eq!(account.attribute("districtRelationship"), Some("1"));
        assert!(account
            .groups
            .contains("CN=Lincoln Elementary Students,OU=Groups,OU=District,DC=example,DC=org"));
        assert!(account.groups.contains("CN=Grade 3,OU=Groups,OU=District,DC=example,DC=org"));
    }

    #[test]
    fn test_unenrolled_student_is_suspended() {
        let mut person = student("1002", "John", "Smith", Some("K"));
        person.enrolled = false;

        let account = mapper()
            .desired(&person, &layout(), "DC=example,DC=org", ContainerStyle::Dn)
            .unwrap();
        assert_eq!(account.status, AccountStatus::Suspended);
    }

    #[test]
    fn test_missing_grade_is_conflict() {
        let person = student("1003", "Ana", "Lopez", None);
        let (accounts, conflicts) =
            mapper().desired_accounts(&[person], &layout(), "DC=example,DC=org", ContainerStyle::Dn);

        assert!(accounts.is_empty());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].external_id.as_deref(), Some("1003"));
    }

    #[test]
    fn test_staff_account() {
        let person = Person {
            external_id: "E-1".to_string(),
            kind: PersonKind::Staff,
            first_name: "Maria".to_string(),
            middle_name: None,
            last_name: "Garcia".to_string(),
            grade: None,
            school_id: Some("999".to_string()),
            title: Some("Teacher".to_string()),
            department: Some("Science".to_string()),
            enrolled: true,
            district_relationship: None,
        };

        let account = mapper()
            .desired(&person, &layout(), "DC=example,DC=org", ContainerStyle::Dn)
            .unwrap();
        assert_eq!(account.username, "maria.garcia");
        assert_eq!(account.email.as_deref(), Some("maria.garcia@example.org"));
        assert_eq!(account.display_name, "Garcia, Maria");
        assert_eq!(account.container, "OU=Staff,DC=example,DC=org");
        assert_eq!(account.attribute("title"), Some("Teacher"));
        // unknown school ids fall back to the raw id
        assert_eq!(account.attribute("company"), Some("999"));
        assert!(account.groups.is_empty());
    }

    #[test]
    fn test_dn_values_are_escaped() {
        let mut schools = BTreeMap::new();
        schools.insert("101".to_string(), "Smith, Jones Academy".to_string());
        let mapper = Mapper::new(
            Some(AccountTemplate {
                username: "{first_initial}{last}{id}".to_string(),
                email: "{username}@{domain}".to_string(),
                display_name: Some("{last}, {first}".to_string()),
            }),
            None,
            schools,
            "example.org",
        );
        let layout = LayoutConfig {
            student_container: "OU={school},OU=Students,{base}".to_string(),
            staff_container: "OU=Staff,{base}".to_string(),
            student_groups: vec!["CN={school} Students,OU=Groups,{base}".to_string()],
            staff_groups: vec![],
        };
        let person = student("1001", "Jane", "Doe", Some("3"));

        let ldap = mapper
            .desired(&person, &layout, "OU=District,DC=example,DC=org", ContainerStyle::Dn)
            .unwrap();
        assert_eq!(
            ldap.container,
            "OU=Smith\\, Jones Academy,OU=Students,OU=District,DC=example,DC=org"
        );
        assert!(ldap
            .groups
            .contains("CN=Smith\\, Jones Academy Students,OU=Groups,OU=District,DC=example,DC=org"));
        // display names and attributes keep the raw value
        assert_eq!(ldap.display_name, "Doe, Jane");
        assert_eq!(ldap.attribute("company"), Some("Smith, Jones Academy"));

        let path_layout = LayoutConfig {
            student_container: "/Students/{school}".to_string(),
            ..layout
        };
        let workspace = mapper
            .desired(&person, &path_layout, "", ContainerStyle::Path)
            .unwrap();
        assert_eq!(workspace.container, "/Students/Smith, Jones Academy");
    }
}
