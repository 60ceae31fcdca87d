use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Timestamp format used for `created_at`/`updated_at` and pool entries.
/// Fixed-width UTC so lexicographic order is chronological order; microsecond
/// precision keeps back-to-back admissions ordered.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Closed status set. The wire strings match what the UI sends; anything
/// outside this set is rejected at the IPC boundary, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "left")]
    Left,
    #[serde(rename = "transferred")]
    Transferred,
    #[serde(rename = "expelled")]
    Expelled,
    #[serde(rename = "graduated")]
    Graduated,
    #[serde(rename = "re-admitted")]
    ReAdmitted,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Left => "left",
            Status::Transferred => "transferred",
            Status::Expelled => "expelled",
            Status::Graduated => "graduated",
            Status::ReAdmitted => "re-admitted",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "active" => Some(Status::Active),
            "left" => Some(Status::Left),
            "transferred" => Some(Status::Transferred),
            "expelled" => Some(Status::Expelled),
            "graduated" => Some(Status::Graduated),
            "re-admitted" => Some(Status::ReAdmitted),
            _ => None,
        }
    }

    /// Enrolled students hold live identifiers and form the comparison set
    /// for uniqueness and duplicate detection. Re-admitted students are back
    /// on the roster, so they count.
    pub fn is_enrolled(self) -> bool {
        matches!(self, Status::Active | Status::ReAdmitted)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub class_name: String,
    pub stream: String,
    pub parent_name: Option<String>,
    pub status: Status,
    pub access_number: String,
    pub admission_id: String,
    pub flag_comment: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

/// Point-in-time view of the roster plus the dropped-number pool.
///
/// Handlers reload this before every identifier computation; the database is
/// the uniqueness authority and this value is advisory input to the
/// allocator, never a cache to be trusted across mutations.
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    pub students: Vec<Student>,
    pub dropped: Vec<String>,
}

impl RosterSnapshot {
    pub fn load(conn: &Connection) -> Result<RosterSnapshot> {
        let mut stmt = conn.prepare(
            "SELECT id, name, class_name, stream, parent_name, status,
                    access_number, admission_id, flag_comment, created_at, updated_at
             FROM students
             ORDER BY created_at, id",
        )?;
        let students = stmt
            .query_map([], |row| {
                let status_raw: String = row.get(5)?;
                Ok(Student {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    class_name: row.get(2)?,
                    stream: row.get(3)?,
                    parent_name: row.get(4)?,
                    // The status column is written from Status::as_str only;
                    // an unknown value means a foreign writer touched the DB.
                    status: Status::parse(&status_raw).unwrap_or(Status::Left),
                    access_number: row.get(6)?,
                    admission_id: row.get(7)?,
                    flag_comment: row.get(8)?,
                    created_at: row.get(9)?,
                    updated_at: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT access_number FROM dropped_access_numbers ORDER BY access_number",
        )?;
        let dropped = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(RosterSnapshot { students, dropped })
    }

    pub fn enrolled(&self) -> impl Iterator<Item = &Student> {
        self.students.iter().filter(|s| s.status.is_enrolled())
    }

    pub fn find(&self, id: &str) -> Option<&Student> {
        self.students.iter().find(|s| s.id == id)
    }
}
