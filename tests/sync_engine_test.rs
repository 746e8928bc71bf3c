use anyhow::Result;
use httpmock::prelude::*;
use std::path::Path;
use tempfile::TempDir;
use veritas_sync::adapters::build_targets;
use veritas_sync::domain::model::{ChangeKind, StoreOutcome};
use veritas_sync::utils::validation::Validate;
use veritas_sync::{
    CsvRosterSource, EngineOptions, LocalStorage, Mapper, SyncConfig, SyncEngine, SyncError,
};

const STUDENTS: &str = "\
StudentID,FirstName,MiddleName,LastName,Grade,SchoolID,Enrolled,DistrictRelationship
1001,Jane,Ann,Doe,3,101,Y,1
1002,Sam,,Lee,K,101,Y,1
";

const STAFF: &str = "\
EmployeeID,FirstName,LastName,Title,Department,SchoolID,Active
E-7,Maria,Garcia,Teacher,Science,101,1
";

fn write_exports(dir: &Path) {
    std::fs::write(dir.join("students.csv"), STUDENTS).unwrap();
    std::fs::write(dir.join("staff.csv"), STAFF).unwrap();
}

fn config_toml(sis: &Path, reports: &Path, base_url: &str, dry_run: bool) -> String {
    format!(
        r#"
[sync]
name = "district"
domain = "example.org"
report_path = "{reports}"
dry_run = {dry_run}
retry_attempts = 1

[sis]
base_path = "{sis}"
students = "students.csv"
staff = "staff.csv"

[mapping.students]
username = "{{first_initial}}{{last}}{{id}}"
email = "{{username}}@students.{{domain}}"

[mapping.staff]
username = "{{first}}.{{last}}"
email = "{{username}}@{{domain}}"

[schools]
"101" = "Lincoln"

[[stores]]
type = "workspace"
name = "google"
base_url = "{base_url}"
access_token = "token-123"

[stores.layout]
student_container = "/Students/{{grade}}"
staff_container = "/Staff"
student_groups = ["students@{{domain}}"]
"#,
        reports = reports.display(),
        sis = sis.display(),
        base_url = base_url,
        dry_run = dry_run,
    )
}

fn engine(
    config: &SyncConfig,
) -> Result<SyncEngine<CsvRosterSource<LocalStorage>, LocalStorage>> {
    let roster = CsvRosterSource::new(
        LocalStorage::new(config.sis.base_path.clone()),
        config.sis.students.clone(),
        config.sis.staff.clone(),
    );
    Ok(SyncEngine::new(
        roster,
        Mapper::from_config(config),
        build_targets(config, &[])?,
        EngineOptions::from_config(config),
        LocalStorage::new(config.report_path()),
    ))
}

fn report_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_roster_is_provisioned_into_empty_tenant() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let reports = temp_dir.path().join("reports");
    write_exports(temp_dir.path());

    let server = MockServer::start();
    let list = server.mock(|when, then| {
        when.method(GET).path("/users");
        then.status(200).json_body(serde_json::json!({ "users": [] }));
    });
    let create = server.mock(|when, then| {
        when.method(POST).path("/users");
        then.status(200).json_body(serde_json::json!({ "id": "u1" }));
    });
    let groups = server.mock(|when, then| {
        when.method(GET)
            .path("/groups")
            .query_param("customer", "my_customer");
        then.status(200).json_body(serde_json::json!({ "groups": [] }));
    });
    let create_group = server.mock(|when, then| {
        when.method(POST)
            .path("/groups")
            .json_body_partial(r#"{ "email": "students@example.org" }"#);
        then.status(200).json_body(serde_json::json!({ "email": "students@example.org" }));
    });
    let join = server.mock(|when, then| {
        when.method(POST).path("/groups/students@example.org/members");
        then.status(200).json_body(serde_json::json!({ "role": "MEMBER" }));
    });

    let config = SyncConfig::from_toml_str(&config_toml(
        temp_dir.path(),
        &reports,
        &server.base_url(),
        false,
    ))?;
    config.validate()?;

    let report = engine(&config)?.run_once().await?;

    list.assert_hits(1);
    groups.assert_hits(1);
    create.assert_hits(3);
    create_group.assert_hits(1);
    join.assert_hits(2);
    assert_eq!(report.roster_size, 3);
    assert_eq!(report.stores[0].outcome, StoreOutcome::Applied);
    assert_eq!(report.stores[0].applied.get(&ChangeKind::Create), Some(&3));
    assert_eq!(report.stores[0].applied.get(&ChangeKind::CreateGroup), Some(&1));
    assert_eq!(report.stores[0].applied.get(&ChangeKind::AddMember), Some(&2));
    assert!(!report.has_failures());

    let files = report_files(&reports);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("sync-report-"));
    Ok(())
}

#[tokio::test]
async fn test_dry_run_only_reads() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let reports = temp_dir.path().join("reports");
    write_exports(temp_dir.path());

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/users");
        then.status(200).json_body(serde_json::json!({ "users": [] }));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/groups")
            .query_param("customer", "my_customer");
        then.status(200).json_body(serde_json::json!({ "groups": [] }));
    });
    let create = server.mock(|when, then| {
        when.method(POST).path("/users");
        then.status(200).json_body(serde_json::json!({ "id": "u1" }));
    });
    let create_group = server.mock(|when, then| {
        when.method(POST).path("/groups");
        then.status(200).json_body(serde_json::json!({}));
    });

    let config = SyncConfig::from_toml_str(&config_toml(
        temp_dir.path(),
        &reports,
        &server.base_url(),
        true,
    ))?;

    let report = engine(&config)?.run_once().await?;

    create.assert_hits(0);
    create_group.assert_hits(0);
    assert!(report.dry_run);
    assert_eq!(report.stores[0].outcome, StoreOutcome::Planned);
    assert_eq!(report.stores[0].planned.get(&ChangeKind::Create), Some(&3));
    assert_eq!(report.stores[0].planned.get(&ChangeKind::CreateGroup), Some(&1));
    assert_eq!(report_files(&reports).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_tenant_is_reported_not_fatal() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let reports = temp_dir.path().join("reports");
    write_exports(temp_dir.path());

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/users");
        then.status(401).body("Invalid Credentials");
    });

    let config = SyncConfig::from_toml_str(&config_toml(
        temp_dir.path(),
        &reports,
        &server.base_url(),
        false,
    ))?;

    let report = engine(&config)?.run_once().await?;

    assert_eq!(report.stores[0].outcome, StoreOutcome::Failed);
    assert!(report.stores[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("401"));
    assert!(report.has_failures());
    Ok(())
}

#[tokio::test]
async fn test_missing_export_fails_the_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let reports = temp_dir.path().join("reports");

    let config = SyncConfig::from_toml_str(&config_toml(
        temp_dir.path(),
        &reports,
        "http://127.0.0.1:9",
        false,
    ))?;

    let result = engine(&config)?.run_once().await;

    assert!(matches!(result, Err(SyncError::IoError(_))));
    assert!(report_files(&reports).is_empty());
    Ok(())
}

#[test]
fn test_unknown_store_filter_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = SyncConfig::from_toml_str(&config_toml(
        temp_dir.path(),
        temp_dir.path(),
        "http://127.0.0.1:9",
        false,
    ))
    .unwrap();

    let result = build_targets(&config, &["ad".to_string()]);

    assert!(matches!(
        result,
        Err(SyncError::InvalidConfigValueError { .. })
    ));
    tokio_test::assert_ok!(build_targets(&config, &["google".to_string()]));
}
