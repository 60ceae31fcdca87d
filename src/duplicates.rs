use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::roster::{RosterSnapshot, Student};

/// Exact-match grouping key. Deliberately not fuzzy: edit-distance matching
/// produces false positives the admission workflow cannot present well, so
/// two records collide only on identical normalized name+class+parent.
pub fn normalized_key(name: &str, class_name: &str, parent_name: Option<&str>) -> String {
    format!(
        "{}|{}|{}",
        name.trim().to_lowercase(),
        class_name.trim(),
        parent_name.map(|p| p.trim().to_lowercase()).unwrap_or_default()
    )
}

fn student_key(s: &Student) -> String {
    normalized_key(&s.name, &s.class_name, s.parent_name.as_deref())
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    /// Members ordered by creation time; the first is the presumptive
    /// original, the rest presumptive duplicates.
    pub students: Vec<Student>,
}

/// Informational surfacing of existing roster duplication. Never blocks
/// anything; the admin cleanup screens render these groups.
pub fn detect_duplicates(snapshot: &RosterSnapshot) -> Vec<DuplicateGroup> {
    let mut groups: BTreeMap<String, Vec<Student>> = BTreeMap::new();
    for s in snapshot.enrolled() {
        groups.entry(student_key(s)).or_default().push(s.clone());
    }
    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(key, mut students)| {
            students.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));
            DuplicateGroup { key, students }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub class_name: String,
    pub parent_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Strict mode blocks (severity error); non-strict is the live-typing
    /// path and only warns.
    pub strict: bool,
    /// Student being edited, excluded from comparison so a record never
    /// matches itself.
    pub exclude_id: Option<String>,
    /// Also flag same-name records created within `recent_window`, even when
    /// class/parent differ. Guards against double-submission.
    pub check_recent: bool,
    pub recent_window: Duration,
    pub now: DateTime<Utc>,
}

impl ValidationOptions {
    pub fn new(strict: bool) -> ValidationOptions {
        ValidationOptions {
            strict,
            exclude_id: None,
            check_recent: false,
            recent_window: Duration::minutes(5),
            now: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub is_duplicate: bool,
    pub severity: Option<Severity>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub existing_students: Vec<Student>,
}

impl ValidationOutcome {
    fn clear() -> ValidationOutcome {
        ValidationOutcome {
            is_duplicate: false,
            severity: None,
            message: "No matching student on the roster".to_string(),
            suggestion: None,
            existing_students: Vec::new(),
        }
    }

    pub fn blocks_submission(&self) -> bool {
        self.severity == Some(Severity::Error)
    }
}

/// Pre-submission/live-typing validation of a candidate admission against
/// the enrolled roster.
pub fn validate_candidate(
    snapshot: &RosterSnapshot,
    candidate: &Candidate,
    opts: &ValidationOptions,
) -> ValidationOutcome {
    let key = normalized_key(
        &candidate.name,
        &candidate.class_name,
        candidate.parent_name.as_deref(),
    );

    let excluded = |s: &Student| opts.exclude_id.as_deref() == Some(s.id.as_str());

    let mut matches: Vec<Student> = snapshot
        .enrolled()
        .filter(|s| !excluded(s))
        .filter(|s| student_key(s) == key)
        .cloned()
        .collect();
    matches.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));

    if !matches.is_empty() {
        let severity = if opts.strict { Severity::Error } else { Severity::Warning };
        let first = &matches[0];
        return ValidationOutcome {
            is_duplicate: true,
            severity: Some(severity),
            message: format!(
                "\"{}\" already exists in {} ({}) with the same parent",
                first.name, first.class_name, first.access_number
            ),
            suggestion: Some("Did you mean to edit the existing record instead?".to_string()),
            existing_students: matches,
        };
    }

    if opts.check_recent {
        let recent = recent_same_name(snapshot, candidate, opts);
        if !recent.is_empty() {
            let first = &recent[0];
            return ValidationOutcome {
                is_duplicate: true,
                // Softer signal: warns even at submission time, never blocks.
                severity: Some(Severity::Warning),
                message: format!(
                    "A student named \"{}\" was admitted moments ago",
                    first.name
                ),
                suggestion: Some(
                    "If this is a double submission, cancel and check the roster".to_string(),
                ),
                existing_students: recent,
            };
        }
    }

    ValidationOutcome::clear()
}

fn recent_same_name(
    snapshot: &RosterSnapshot,
    candidate: &Candidate,
    opts: &ValidationOptions,
) -> Vec<Student> {
    let name = candidate.name.trim().to_lowercase();
    let excluded = |s: &Student| opts.exclude_id.as_deref() == Some(s.id.as_str());
    let mut recent: Vec<Student> = snapshot
        .enrolled()
        .filter(|s| !excluded(s))
        .filter(|s| s.name.trim().to_lowercase() == name)
        .filter(|s| match DateTime::parse_from_rfc3339(&s.created_at) {
            Ok(created) => {
                let age = opts.now.signed_duration_since(created.with_timezone(&Utc));
                age >= Duration::zero() && age <= opts.recent_window
            }
            Err(e) => {
                // Fail open: a bad timestamp must not block an admission.
                log::warn!("skipping recent-check for {}: bad created_at ({})", s.id, e);
                false
            }
        })
        .cloned()
        .collect();
    recent.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));
    recent
}
