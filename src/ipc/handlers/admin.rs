use serde_json::json;

use crate::alloc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster::{now_rfc3339, RosterSnapshot};

/// Full-roster repair pass. Reassigns dense sequential access numbers per
/// class+stream and admission ids per year, ordered by creation time, and
/// clears the dropped pool (the gaps it tracked no longer exist). Only runs
/// on this explicit call; it renumbers students who did not change.
fn handle_renumber(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let plan = alloc::plan_renumber(&snapshot);

    let changed = |assignments: &[(String, String)], field: fn(&crate::roster::Student) -> &str| {
        assignments
            .iter()
            .filter(|(id, new)| snapshot.find(id).map(|s| field(s) != new).unwrap_or(false))
            .count()
    };
    let access_changed = changed(&plan.access, |s| &s.access_number);
    let admission_changed = changed(&plan.admission, |s| &s.admission_id);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Two-phase write: park every planned row on a temporary value first so
    // the partial unique indexes never see a transient collision when two
    // students swap numbers.
    let apply = |tx: &rusqlite::Transaction,
                 column: &str,
                 assignments: &[(String, String)]|
     -> Result<(), rusqlite::Error> {
        for (id, _) in assignments {
            tx.execute(
                &format!(
                    "UPDATE students SET {} = 'renumber:' || id, updated_at = ? WHERE id = ?",
                    column
                ),
                (now_rfc3339(), id),
            )?;
        }
        for (id, new) in assignments {
            tx.execute(
                &format!("UPDATE students SET {} = ? WHERE id = ?", column),
                (new, id),
            )?;
        }
        Ok(())
    };

    if let Err(e) = apply(&tx, "access_number", &plan.access) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = apply(&tx, "admission_id", &plan.admission) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    let pool_cleared = match tx.execute("DELETE FROM dropped_access_numbers", []) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "dropped_access_numbers" })),
            );
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "studentsRenumbered": plan.access.len(),
            "accessNumbersChanged": access_changed,
            "admissionIdsChanged": admission_changed,
            "poolEntriesCleared": pool_cleared
        }),
    )
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(key) = req.params.get("key").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing key", None);
    };
    match db::settings_get_json(conn, key) {
        Ok(value) => ok(
            &req.id,
            json!({ "key": key, "value": value.unwrap_or(serde_json::Value::Null) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(key) = req.params.get("key").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing key", None);
    };
    let Some(value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    match db::settings_set_json(conn, key, value) {
        Ok(()) => ok(&req.id, json!({ "key": key })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admin.renumber" => Some(handle_renumber(state, req)),
        "admin.settings.get" => Some(handle_settings_get(state, req)),
        "admin.settings.set" => Some(handle_settings_set(state, req)),
        _ => None,
    }
}
