use crate::domain::model::{Conflict, Person, PersonKind, Roster};
use crate::domain::ports::{RosterSource, Storage};
use crate::utils::error::{Result, SyncError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

/// Student export row: `StudentID,FirstName,MiddleName,LastName,Grade,SchoolID,Enrolled,DistrictRelationship`.
#[derive(Debug, Deserialize)]
struct StudentRow {
    #[serde(rename = "StudentID")]
    student_id: String,
    #[serde(rename = "FirstName")]
    first_name: String,
    #[serde(rename = "MiddleName", default)]
    middle_name: Option<String>,
    #[serde(rename = "LastName")]
    last_name: String,
    #[serde(rename = "Grade", default)]
    grade: Option<String>,
    #[serde(rename = "SchoolID", default)]
    school_id: Option<String>,
    #[serde(rename = "Enrolled", default)]
    enrolled: Option<String>,
    #[serde(rename = "DistrictRelationship", default)]
    district_relationship: Option<String>,
}

/// Staff export row: `EmployeeID,FirstName,LastName,Title,Department,SchoolID,Active`.
#[derive(Debug, Deserialize)]
struct StaffRow {
    #[serde(rename = "EmployeeID")]
    employee_id: String,
    #[serde(rename = "FirstName")]
    first_name: String,
    #[serde(rename = "LastName")]
    last_name: String,
    #[serde(rename = "Title", default)]
    title: Option<String>,
    #[serde(rename = "Department", default)]
    department: Option<String>,
    #[serde(rename = "SchoolID", default)]
    school_id: Option<String>,
    #[serde(rename = "Active", default)]
    active: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Any non-empty flag counts as set, except the usual spellings of "no".
pub fn parse_flag(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !matches!(
            v.to_ascii_lowercase().as_str(),
            "0" | "n" | "no" | "false" | "f" | "inactive"
        ),
    }
}

pub fn parse_students(data: &[u8]) -> Result<Vec<Person>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(data);
    let mut people = Vec::new();

    for (line, row) in reader.deserialize::<StudentRow>().enumerate() {
        let row = row?;
        if row.student_id.trim().is_empty() {
            tracing::warn!("Skipping student row {} with no StudentID", line + 2);
            continue;
        }
        people.push(Person {
            external_id: row.student_id.trim().to_string(),
            kind: PersonKind::Student,
            first_name: row.first_name.trim().to_string(),
            middle_name: non_empty(row.middle_name),
            last_name: row.last_name.trim().to_string(),
            grade: non_empty(row.grade),
            school_id: non_empty(row.school_id),
            title: None,
            department: None,
            enrolled: parse_flag(row.enrolled.as_deref()),
            district_relationship: non_empty(row.district_relationship),
        });
    }

    Ok(people)
}

pub fn parse_staff(data: &[u8]) -> Result<Vec<Person>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(data);
    let mut people = Vec::new();

    for (line, row) in reader.deserialize::<StaffRow>().enumerate() {
        let row = row?;
        if row.employee_id.trim().is_empty() {
            tracing::warn!("Skipping staff row {} with no EmployeeID", line + 2);
            continue;
        }
        people.push(Person {
            external_id: row.employee_id.trim().to_string(),
            kind: PersonKind::Staff,
            first_name: row.first_name.trim().to_string(),
            middle_name: None,
            last_name: row.last_name.trim().to_string(),
            grade: None,
            school_id: non_empty(row.school_id),
            title: non_empty(row.title),
            department: non_empty(row.department),
            enrolled: parse_flag(row.active.as_deref()),
            district_relationship: None,
        });
    }

    Ok(people)
}

/// Keeps the first record per external id. Student and staff ids share one
/// namespace because both end up in `employeeID`; every dropped record comes
/// back as a conflict.
fn dedupe(people: Vec<Person>) -> Roster {
    let mut seen: HashMap<String, PersonKind> = HashMap::new();
    let mut roster = Roster::default();
    for person in people {
        match seen.get(&person.external_id) {
            None => {
                seen.insert(person.external_id.clone(), person.kind);
                roster.people.push(person);
            }
            Some(kept) => {
                let reason = if *kept == person.kind {
                    format!("duplicate {} id in SIS export, later row ignored", person.kind)
                } else {
                    format!(
                        "{} id is also used by a {} record, {} record ignored",
                        person.kind, kept, person.kind
                    )
                };
                tracing::warn!("{}: {}", person.external_id, reason);
                roster.conflicts.push(Conflict {
                    external_id: Some(person.external_id),
                    reason,
                });
            }
        }
    }
    roster
}

pub struct CsvRosterSource<S: Storage> {
    storage: S,
    students: Option<String>,
    staff: Option<String>,
}

impl<S: Storage> CsvRosterSource<S> {
    pub fn new(storage: S, students: Option<String>, staff: Option<String>) -> Self {
        Self {
            storage,
            students,
            staff,
        }
    }
}

#[async_trait]
impl<S: Storage> RosterSource for CsvRosterSource<S> {
    async fn load(&self) -> Result<Roster> {
        if self.students.is_none() && self.staff.is_none() {
            return Err(SyncError::roster("no student or staff export configured"));
        }

        let mut people = Vec::new();

        if let Some(path) = &self.students {
            tracing::debug!("Reading student export {}", path);
            let data = self.storage.read_file(path).await?;
            let students = parse_students(&data)?;
            tracing::info!("Loaded {} students from {}", students.len(), path);
            people.extend(students);
        }

        if let Some(path) = &self.staff {
            tracing::debug!("Reading staff export {}", path);
            let data = self.storage.read_file(path).await?;
            let staff = parse_staff(&data)?;
            tracing::info!("Loaded {} staff from {}", staff.len(), path);
            people.extend(staff);
        }

        Ok(dedupe(people))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::storage::LocalStorage;
    use tempfile::TempDir;

    const STUDENTS: &str = "\
StudentID,FirstName,MiddleName,LastName,Grade,SchoolID,Enrolled,DistrictRelationship
1001,Jane,Marie,Doe,3,101,Y,1
1002,John,,Smith,K,101,,
,Ghost,,Row,4,101,Y,
1003,Ana,,Lopez,12,201,no,2
";

    const STAFF: &str = "\
EmployeeID,FirstName,LastName,Title,Department,SchoolID,Active
E-1,Maria,Garcia,Teacher,Science,201,1
E-2,Tom,Baker,Aide,,101,0
";

    #[test]
    fn test_parse_students() {
        let people = parse_students(STUDENTS.as_bytes()).unwrap();

        assert_eq!(people.len(), 3);
        assert_eq!(people[0].external_id, "1001");
        assert_eq!(people[0].middle_name.as_deref(), Some("Marie"));
        assert_eq!(people[0].grade.as_deref(), Some("3"));
        assert!(people[0].enrolled);
        assert_eq!(people[0].district_relationship.as_deref(), Some("1"));

        assert_eq!(people[1].middle_name, None);
        assert!(!people[1].enrolled);
        assert!(!people[2].enrolled);
    }

    #[test]
    fn test_parse_staff() {
        let people = parse_staff(STAFF.as_bytes()).unwrap();

        assert_eq!(people.len(), 2);
        assert_eq!(people[0].kind, PersonKind::Staff);
        assert_eq!(people[0].title.as_deref(), Some("Teacher"));
        assert!(people[0].enrolled);
        assert_eq!(people[1].department, None);
        assert!(!people[1].enrolled);
    }

    #[test]
    fn test_missing_column_is_csv_error() {
        let data = "StudentID,FirstName\n1,Jane\n";
        assert!(matches!(
            parse_students(data.as_bytes()),
            Err(SyncError::CsvError(_))
        ));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(Some("Y")));
        assert!(parse_flag(Some("Enrolled")));
        assert!(!parse_flag(Some(" ")));
        assert!(!parse_flag(Some("FALSE")));
        assert!(!parse_flag(None));
    }

    #[tokio::test]
    async fn test_source_merges_exports_and_dedupes() {
        let temp_dir = TempDir::new().unwrap();
        let duplicate = format!("{}1001,Jane,,Doe,4,101,Y,\n", STUDENTS);
        std::fs::write(temp_dir.path().join("students.csv"), duplicate).unwrap();
        std::fs::write(temp_dir.path().join("staff.csv"), STAFF).unwrap();

        let source = CsvRosterSource::new(
            LocalStorage::new(temp_dir.path()),
            Some("students.csv".to_string()),
            Some("staff.csv".to_string()),
        );
        let roster = source.load().await.unwrap();

        assert_eq!(roster.people.len(), 5);
        let jane: Vec<&Person> = roster
            .people
            .iter()
            .filter(|p| p.external_id == "1001")
            .collect();
        assert_eq!(jane.len(), 1);
        assert_eq!(jane[0].grade.as_deref(), Some("3"));
        assert_eq!(roster.conflicts.len(), 1);
    }

    #[tokio::test]
    async fn test_staff_id_shared_with_student_is_a_conflict() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("students.csv"), STUDENTS).unwrap();
        let staff = format!("{}1001,Lee,Park,Coach,Athletics,101,1\n", STAFF);
        std::fs::write(temp_dir.path().join("staff.csv"), staff).unwrap();

        let source = CsvRosterSource::new(
            LocalStorage::new(temp_dir.path()),
            Some("students.csv".to_string()),
            Some("staff.csv".to_string()),
        );
        let roster = source.load().await.unwrap();

        let holders: Vec<&Person> = roster
            .people
            .iter()
            .filter(|p| p.external_id == "1001")
            .collect();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].kind, PersonKind::Student);
        assert_eq!(roster.conflicts.len(), 1);
        assert_eq!(roster.conflicts[0].external_id.as_deref(), Some("1001"));
        assert!(roster.conflicts[0].reason.contains("staff record ignored"));
    }
}
