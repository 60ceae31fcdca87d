use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::alloc::{self, AccessAllocation};
use crate::db;
use crate::duplicates::{validate_candidate, Candidate, ValidationOptions};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster::{now_rfc3339, RosterSnapshot, Status, Student};

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_admission_year(req: &Request) -> Result<i32, String> {
    match req.params.get("admissionDate").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(|d| d.year())
            .map_err(|_| "admissionDate must be YYYY-MM-DD".to_string()),
        None => Ok(Utc::now().year()),
    }
}

fn opt_string(v: Option<&serde_json::Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let status_filter = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(raw) => match Status::parse(raw) {
            Some(s) => Some(s),
            None => return err(&req.id, "bad_params", "unknown status", None),
        },
        None => None,
    };

    let snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students: Vec<&Student> = snapshot
        .students
        .iter()
        .filter(|s| status_filter.map(|f| s.status == f).unwrap_or(true))
        .collect();

    match serde_json::to_value(&students) {
        Ok(v) => ok(&req.id, json!({ "students": v })),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

fn insert_student(
    conn: &Connection,
    id: &str,
    name: &str,
    class_name: &str,
    stream: &str,
    parent_name: Option<&str>,
    status: Status,
    access: &AccessAllocation,
    admission_id: &str,
    created_at: &str,
) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    if access.claimed_from_pool {
        tx.execute(
            "DELETE FROM dropped_access_numbers WHERE access_number = ?",
            [&access.access_number],
        )?;
    }
    tx.execute(
        "INSERT INTO students(
           id, name, class_name, stream, parent_name, status,
           access_number, admission_id, flag_comment, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL)",
        (
            id,
            name,
            class_name,
            stream,
            parent_name,
            status.as_str(),
            &access.access_number,
            admission_id,
            created_at,
        ),
    )?;
    tx.commit()
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(name) = opt_string(req.params.get("name")) else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let Some(class_name) = opt_string(req.params.get("className")) else {
        return err(&req.id, "bad_params", "missing className", None);
    };
    let stream = opt_string(req.params.get("stream")).unwrap_or_default();
    let parent_name = opt_string(req.params.get("parentName"));
    let allow_duplicate = req
        .params
        .get("allowDuplicate")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let year = match parse_admission_year(req) {
        Ok(y) => y,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let mut snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if !allow_duplicate {
        let candidate = Candidate {
            name: name.clone(),
            class_name: class_name.clone(),
            parent_name: parent_name.clone(),
        };
        let mut opts = ValidationOptions::new(true);
        opts.check_recent = true;
        let outcome = validate_candidate(&snapshot, &candidate, &opts);
        if outcome.blocks_submission() {
            return err(
                &req.id,
                "duplicate_student",
                outcome.message.clone(),
                serde_json::to_value(&outcome).ok(),
            );
        }
    }

    let policy = db::alloc_policy(conn);
    let student_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();

    // The snapshot can be stale (another writer may have taken the number
    // since the load); the unique indexes are the authority. Retry once with
    // a fresh snapshot before giving up.
    for attempt in 0..2 {
        let access = alloc::allocate_access_number(&snapshot, &class_name, &stream, policy);
        let admission_id = alloc::generate_admission_id(&snapshot, &class_name, year);
        match insert_student(
            conn,
            &student_id,
            &name,
            &class_name,
            &stream,
            parent_name.as_deref(),
            Status::Active,
            &access,
            &admission_id,
            &created_at,
        ) {
            Ok(()) => {
                return ok(
                    &req.id,
                    json!({
                        "studentId": student_id,
                        "accessNumber": access.access_number,
                        "admissionId": admission_id,
                        "claimedFromPool": access.claimed_from_pool
                    }),
                )
            }
            Err(e) if is_constraint_violation(&e) && attempt == 0 => {
                log::warn!("allocation conflict on create, refreshing snapshot: {}", e);
                snapshot = match RosterSnapshot::load(conn) {
                    Ok(s) => s,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
            }
            Err(e) if is_constraint_violation(&e) => {
                return err(
                    &req.id,
                    "duplicate_entry",
                    "identifier already in use",
                    Some(json!({ "table": "students" })),
                )
            }
            Err(e) => {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "students" })),
                )
            }
        }
    }
    unreachable!("create retries exhausted without returning")
}

struct UpdatePatch {
    name: Option<String>,
    class_name: Option<String>,
    stream: Option<String>,
    parent_name: Option<Option<String>>,
}

fn parse_update_patch(patch: &serde_json::Map<String, serde_json::Value>) -> Result<UpdatePatch, String> {
    let name = match patch.get("name") {
        Some(v) => match v.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            _ => return Err("patch.name must be a non-empty string".to_string()),
        },
        None => None,
    };
    let class_name = match patch.get("className") {
        Some(v) => match v.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            _ => return Err("patch.className must be a non-empty string".to_string()),
        },
        None => None,
    };
    let stream = match patch.get("stream") {
        Some(v) => match v.as_str() {
            Some(s) => Some(s.trim().to_string()),
            None => return Err("patch.stream must be a string".to_string()),
        },
        None => None,
    };
    let parent_name = match patch.get("parentName") {
        Some(v) if v.is_null() => Some(None),
        Some(v) => match v.as_str() {
            Some(s) => {
                let t = s.trim().to_string();
                Some(if t.is_empty() { None } else { Some(t) })
            }
            None => return Err("patch.parentName must be a string or null".to_string()),
        },
        None => None,
    };
    Ok(UpdatePatch {
        name,
        class_name,
        stream,
        parent_name,
    })
}

fn apply_reallocation(
    conn: &Connection,
    student_id: &str,
    name: &str,
    class_name: &str,
    stream: &str,
    parent_name: Option<&str>,
    plan: &alloc::Reallocation,
) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    if let Some(old) = &plan.drop_old {
        tx.execute(
            "INSERT OR IGNORE INTO dropped_access_numbers(access_number, dropped_at)
             VALUES(?, ?)",
            (old, now_rfc3339()),
        )?;
    }
    if plan.access.claimed_from_pool {
        tx.execute(
            "DELETE FROM dropped_access_numbers WHERE access_number = ?",
            [&plan.access.access_number],
        )?;
    }
    tx.execute(
        "UPDATE students
         SET name = ?, class_name = ?, stream = ?, parent_name = ?,
             access_number = ?, admission_id = ?, updated_at = ?
         WHERE id = ?",
        (
            name,
            class_name,
            stream,
            parent_name,
            &plan.access.access_number,
            &plan.admission_id,
            now_rfc3339(),
            student_id,
        ),
    )?;
    tx.commit()
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(student_id) = opt_string(req.params.get("studentId")) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };
    let patch = match parse_update_patch(patch_obj) {
        Ok(p) => p,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if patch.name.is_none()
        && patch.class_name.is_none()
        && patch.stream.is_none()
        && patch.parent_name.is_none()
    {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }
    let allow_duplicate = req
        .params
        .get("allowDuplicate")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current) = snapshot.find(&student_id).cloned() else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let name = patch.name.clone().unwrap_or_else(|| current.name.clone());
    let class_name = patch
        .class_name
        .clone()
        .unwrap_or_else(|| current.class_name.clone());
    let stream = patch.stream.clone().unwrap_or_else(|| current.stream.clone());
    let parent_name = match &patch.parent_name {
        Some(p) => p.clone(),
        None => current.parent_name.clone(),
    };

    if !allow_duplicate {
        let candidate = Candidate {
            name: name.clone(),
            class_name: class_name.clone(),
            parent_name: parent_name.clone(),
        };
        let mut opts = ValidationOptions::new(true);
        opts.exclude_id = Some(student_id.clone());
        let outcome = validate_candidate(&snapshot, &candidate, &opts);
        if outcome.blocks_submission() {
            return err(
                &req.id,
                "duplicate_student",
                outcome.message.clone(),
                serde_json::to_value(&outcome).ok(),
            );
        }
    }

    let group_changed = current.status.is_enrolled()
        && (class_name != current.class_name || stream != current.stream);

    if !group_changed {
        if let Err(e) = conn.execute(
            "UPDATE students
             SET name = ?, class_name = ?, stream = ?, parent_name = ?, updated_at = ?
             WHERE id = ?",
            (
                &name,
                &class_name,
                &stream,
                parent_name.as_deref(),
                now_rfc3339(),
                &student_id,
            ),
        ) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
        return ok(
            &req.id,
            json!({
                "studentId": student_id,
                "accessNumber": current.access_number,
                "admissionId": current.admission_id,
                "reallocated": false
            }),
        );
    }

    // Class/stream move: drop the old number (unless it was the group's
    // highest), claim from the target pool or mint, and mint a fresh
    // admission id under the current year's counter.
    let policy = db::alloc_policy(conn);
    let year = Utc::now().year();
    for attempt in 0..2 {
        let plan = alloc::plan_reallocation(&snapshot, &current, &class_name, &stream, year, policy);
        match apply_reallocation(
            conn,
            &student_id,
            &name,
            &class_name,
            &stream,
            parent_name.as_deref(),
            &plan,
        ) {
            Ok(()) => {
                return ok(
                    &req.id,
                    json!({
                        "studentId": student_id,
                        "accessNumber": plan.access.access_number,
                        "admissionId": plan.admission_id,
                        "reallocated": true,
                        "droppedOldAccessNumber": plan.drop_old,
                        "claimedFromPool": plan.access.claimed_from_pool
                    }),
                )
            }
            Err(e) if is_constraint_violation(&e) && attempt == 0 => {
                log::warn!("allocation conflict on update, refreshing snapshot: {}", e);
                snapshot = match RosterSnapshot::load(conn) {
                    Ok(s) => s,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
            }
            Err(e) if is_constraint_violation(&e) => {
                return err(
                    &req.id,
                    "duplicate_entry",
                    "identifier already in use",
                    Some(json!({ "table": "students" })),
                )
            }
            Err(e) => {
                return err(
                    &req.id,
                    "db_update_failed",
                    e.to_string(),
                    Some(json!({ "table": "students" })),
                )
            }
        }
    }
    unreachable!("update retries exhausted without returning")
}

fn handle_flag(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(student_id) = opt_string(req.params.get("studentId")) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(raw) => match Status::parse(raw) {
            Some(s) if !s.is_enrolled() => s,
            Some(_) => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be a removal status (left/transferred/expelled/graduated)",
                    None,
                )
            }
            None => return err(&req.id, "bad_params", "unknown status", None),
        },
        None => return err(&req.id, "bad_params", "missing status", None),
    };
    let comment = opt_string(req.params.get("comment"));

    let snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student) = snapshot.find(&student_id) else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if !student.status.is_enrolled() {
        return err(&req.id, "bad_state", "student is not enrolled", None);
    }

    let pool_entry = alloc::pool_entry_on_removal(&snapshot, student);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE students SET status = ?, flag_comment = ?, updated_at = ? WHERE id = ?",
        (status.as_str(), comment.as_deref(), now_rfc3339(), &student_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Some(number) = &pool_entry {
        if let Err(e) = tx.execute(
            "INSERT OR IGNORE INTO dropped_access_numbers(access_number, dropped_at)
             VALUES(?, ?)",
            (number, now_rfc3339()),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "dropped_access_numbers" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "status": status.as_str(),
            "droppedAccessNumber": pool_entry
        }),
    )
}

fn handle_readmit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(student_id) = opt_string(req.params.get("studentId")) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let year = match parse_admission_year(req) {
        Ok(y) => y,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let mut snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student) = snapshot.find(&student_id).cloned() else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if student.status.is_enrolled() {
        return err(&req.id, "bad_state", "student is already enrolled", None);
    }

    let policy = db::alloc_policy(conn);
    for attempt in 0..2 {
        let access =
            alloc::allocate_access_number(&snapshot, &student.class_name, &student.stream, policy);
        let admission_id = alloc::generate_admission_id(&snapshot, &student.class_name, year);

        let apply = || -> Result<(), rusqlite::Error> {
            let tx = conn.unchecked_transaction()?;
            if access.claimed_from_pool {
                tx.execute(
                    "DELETE FROM dropped_access_numbers WHERE access_number = ?",
                    [&access.access_number],
                )?;
            }
            tx.execute(
                "UPDATE students
                 SET status = ?, access_number = ?, admission_id = ?,
                     flag_comment = NULL, updated_at = ?
                 WHERE id = ?",
                (
                    Status::ReAdmitted.as_str(),
                    &access.access_number,
                    &admission_id,
                    now_rfc3339(),
                    &student_id,
                ),
            )?;
            tx.commit()
        };

        match apply() {
            Ok(()) => {
                return ok(
                    &req.id,
                    json!({
                        "studentId": student_id,
                        "status": Status::ReAdmitted.as_str(),
                        "accessNumber": access.access_number,
                        "admissionId": admission_id,
                        "claimedFromPool": access.claimed_from_pool
                    }),
                )
            }
            Err(e) if is_constraint_violation(&e) && attempt == 0 => {
                log::warn!("allocation conflict on readmit, refreshing snapshot: {}", e);
                snapshot = match RosterSnapshot::load(conn) {
                    Ok(s) => s,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
            }
            Err(e) if is_constraint_violation(&e) => {
                return err(
                    &req.id,
                    "duplicate_entry",
                    "identifier already in use",
                    Some(json!({ "table": "students" })),
                )
            }
            Err(e) => {
                return err(
                    &req.id,
                    "db_update_failed",
                    e.to_string(),
                    Some(json!({ "table": "students" })),
                )
            }
        }
    }
    unreachable!("readmit retries exhausted without returning")
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(student_id) = opt_string(req.params.get("studentId")) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student) = snapshot.find(&student_id) else {
        return err(&req.id, "not_found", "student not found", None);
    };

    // A flagged student's number was already pooled or retired when the
    // flag landed; only an enrolled row releases its number here.
    let pool_entry = if student.status.is_enrolled() {
        alloc::pool_entry_on_removal(&snapshot, student)
    } else {
        None
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Some(number) = &pool_entry {
        if let Err(e) = tx.execute(
            "INSERT OR IGNORE INTO dropped_access_numbers(access_number, dropped_at)
             VALUES(?, ?)",
            (number, now_rfc3339()),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "dropped_access_numbers" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "ok": true, "droppedAccessNumber": pool_entry }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.flag" => Some(handle_flag(state, req)),
        "students.readmit" => Some(handle_readmit(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
