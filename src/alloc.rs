use std::collections::{BTreeMap, BTreeSet};

use crate::roster::{RosterSnapshot, Student};

/// Fixed class-letter table. Unknown class names degrade to the sentinel so
/// allocation can never fail on a malformed name.
pub fn class_code(class_name: &str) -> char {
    match class_name.trim() {
        "Senior 1" => 'A',
        "Senior 2" => 'B',
        "Senior 3" => 'C',
        "Senior 4" => 'D',
        "Senior 5" => 'E',
        "Senior 6" => 'F',
        _ => 'X',
    }
}

/// First alphabetic character of the stream name, uppercased. Empty or
/// non-alphabetic streams map to the sentinel.
pub fn stream_code(stream: &str) -> char {
    stream
        .trim()
        .chars()
        .find(|c| c.is_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('X')
}

pub fn access_prefix(class_name: &str, stream: &str) -> String {
    let mut p = String::with_capacity(2);
    p.push(class_code(class_name));
    p.push(stream_code(stream));
    p
}

/// Numeric tail of an access number (`AB07` -> 7). Numbers written by this
/// daemon always carry a two-letter prefix, but historical data may not, so
/// anything before the first digit is tolerated.
pub fn access_suffix(access_number: &str) -> Option<u32> {
    let digits = access_number.trim_start_matches(|c: char| !c.is_ascii_digit());
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

pub fn format_access_number(prefix: &str, suffix: u32) -> String {
    format!("{}{:02}", prefix, suffix)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocPolicy {
    /// Source-of-truth behavior of the system this replaces: when a
    /// class+stream currently has no enrolled students but previously issued
    /// numbers, re-issue the historical maximum instead of restarting at 1.
    /// Off by default; the general policy is lowest-free.
    pub reuse_max_on_empty: bool,
}

fn group_suffixes(snapshot: &RosterSnapshot, class_name: &str, stream: &str) -> (BTreeSet<u32>, u32) {
    let mut used = BTreeSet::new();
    let mut historical_max = 0u32;
    for s in &snapshot.students {
        if s.class_name != class_name || s.stream != stream {
            continue;
        }
        if let Some(n) = access_suffix(&s.access_number) {
            if s.status.is_enrolled() {
                used.insert(n);
            }
            historical_max = historical_max.max(n);
        }
    }
    (used, historical_max)
}

/// Mint a new access number: the lowest suffix >= 1 not held by an enrolled
/// student in this class+stream and not reserved by the dropped pool. Pool
/// entries are reserved here because admission claims them through
/// [`allocate_access_number`] instead.
pub fn generate_access_number(
    snapshot: &RosterSnapshot,
    class_name: &str,
    stream: &str,
    policy: AllocPolicy,
) -> String {
    let prefix = access_prefix(class_name, stream);
    let (used, historical_max) = group_suffixes(snapshot, class_name, stream);

    if policy.reuse_max_on_empty && used.is_empty() && historical_max > 0 {
        return format_access_number(&prefix, historical_max);
    }

    let dropped: BTreeSet<u32> = snapshot
        .dropped
        .iter()
        .filter(|n| n.starts_with(&prefix))
        .filter_map(|n| access_suffix(n))
        .collect();

    let mut candidate = 1u32;
    while used.contains(&candidate) || dropped.contains(&candidate) {
        candidate += 1;
    }
    format_access_number(&prefix, candidate)
}

#[derive(Debug, Clone)]
pub struct AccessAllocation {
    pub access_number: String,
    /// Set when the number was claimed from the dropped pool; the caller
    /// must remove that pool entry in the same transaction.
    pub claimed_from_pool: bool,
}

/// Admission-time allocation: recycle the lowest matching pool entry before
/// minting a fresh number.
pub fn allocate_access_number(
    snapshot: &RosterSnapshot,
    class_name: &str,
    stream: &str,
    policy: AllocPolicy,
) -> AccessAllocation {
    let prefix = access_prefix(class_name, stream);
    let recycled = snapshot
        .dropped
        .iter()
        .filter(|n| n.starts_with(&prefix))
        .filter_map(|n| access_suffix(n).map(|suffix| (suffix, n.clone())))
        .min();
    match recycled {
        Some((_, number)) => AccessAllocation {
            access_number: number,
            claimed_from_pool: true,
        },
        None => AccessAllocation {
            access_number: generate_access_number(snapshot, class_name, stream, policy),
            claimed_from_pool: false,
        },
    }
}

/// Admission IDs are `A<YY><ClassCode><NN>` where NN counts prior admissions
/// in the year across the whole school. Count-based, so deletions can make
/// the next count collide with a surviving id; the database's unique index
/// is the backstop and callers retry once on rejection.
pub fn generate_admission_id(snapshot: &RosterSnapshot, class_name: &str, year: i32) -> String {
    let yy = year.rem_euclid(100);
    let year_prefix = format!("A{:02}", yy);
    let count = snapshot
        .students
        .iter()
        .filter(|s| s.admission_id.starts_with(&year_prefix))
        .count();
    format!("A{:02}{}{:02}", yy, class_code(class_name), count + 1)
}

/// True when the student holds the highest access-number suffix among
/// enrolled students of its class+stream. The highest number is retired on
/// removal rather than pooled, so the tail never fragments.
pub fn holds_highest_number(snapshot: &RosterSnapshot, student: &Student) -> bool {
    let Some(own) = access_suffix(&student.access_number) else {
        return false;
    };
    snapshot
        .enrolled()
        .filter(|s| s.class_name == student.class_name && s.stream == student.stream)
        .filter(|s| s.id != student.id)
        .filter_map(|s| access_suffix(&s.access_number))
        .all(|n| n <= own)
}

/// Pool entry to record when a student leaves the enrolled set, per the
/// recycling rule: pooled unless it held the highest number.
pub fn pool_entry_on_removal(snapshot: &RosterSnapshot, student: &Student) -> Option<String> {
    if holds_highest_number(snapshot, student) {
        None
    } else {
        Some(student.access_number.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Reallocation {
    /// Old access number to drop into the pool (None when it was the
    /// highest in its old group and gets retired instead).
    pub drop_old: Option<String>,
    pub access: AccessAllocation,
    pub admission_id: String,
}

/// Plan the identifier changes for a class or stream move. The student's old
/// row is still present in the snapshot; it never collides with the new
/// group because grouping is by exact class+stream.
pub fn plan_reallocation(
    snapshot: &RosterSnapshot,
    student: &Student,
    new_class: &str,
    new_stream: &str,
    year: i32,
    policy: AllocPolicy,
) -> Reallocation {
    Reallocation {
        drop_old: pool_entry_on_removal(snapshot, student),
        access: allocate_access_number(snapshot, new_class, new_stream, policy),
        admission_id: generate_admission_id(snapshot, new_class, year),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenumberPlan {
    /// (student id, new access number)
    pub access: Vec<(String, String)>,
    /// (student id, new admission id)
    pub admission: Vec<(String, String)>,
}

fn admission_year_tag(student: &Student) -> String {
    // `A<YY>...` carries the year; fall back to the creation timestamp for
    // rows imported from before the scheme existed.
    let id = student.admission_id.as_bytes();
    if id.len() >= 3 && id[0] == b'A' && id[1].is_ascii_digit() && id[2].is_ascii_digit() {
        return student.admission_id[1..3].to_string();
    }
    let year: String = student.created_at.chars().take(4).collect();
    year.chars().skip(2).collect()
}

/// Administrative repair pass: dense sequential numbers per class+stream and
/// per admission year, ordered by creation time. Pure planning; the handler
/// applies it in one transaction. Running it twice without roster changes
/// yields identical assignments.
pub fn plan_renumber(snapshot: &RosterSnapshot) -> RenumberPlan {
    let mut plan = RenumberPlan::default();

    let mut by_group: BTreeMap<(String, String), Vec<&Student>> = BTreeMap::new();
    for s in snapshot.enrolled() {
        by_group
            .entry((s.class_name.clone(), s.stream.clone()))
            .or_default()
            .push(s);
    }
    for ((class_name, stream), mut members) in by_group {
        members.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));
        let prefix = access_prefix(&class_name, &stream);
        for (i, s) in members.iter().enumerate() {
            plan.access
                .push((s.id.clone(), format_access_number(&prefix, i as u32 + 1)));
        }
    }

    let mut by_year: BTreeMap<String, Vec<&Student>> = BTreeMap::new();
    for s in snapshot.enrolled() {
        by_year.entry(admission_year_tag(s)).or_default().push(s);
    }
    for (yy, mut members) in by_year {
        members.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));
        for (i, s) in members.iter().enumerate() {
            plan.admission.push((
                s.id.clone(),
                format!("A{}{}{:02}", yy, class_code(&s.class_name), i + 1),
            ));
        }
    }

    plan
}
