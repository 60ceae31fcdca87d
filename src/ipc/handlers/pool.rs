use rusqlite::OptionalExtension;
use serde_json::json;

use crate::alloc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster::now_rfc3339;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT access_number, dropped_at FROM dropped_access_numbers ORDER BY access_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let access_number: String = row.get(0)?;
            let dropped_at: String = row.get(1)?;
            Ok(json!({ "accessNumber": access_number, "droppedAt": dropped_at }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(entries) => ok(&req.id, json!({ "droppedAccessNumbers": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Pool entries reusable for one class+stream, lowest suffix first. This is
/// what the admission form shows as "available numbers".
fn handle_available(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(class_name) = req.params.get("className").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing className", None);
    };
    let stream = req.params.get("stream").and_then(|v| v.as_str()).unwrap_or("");
    let prefix = alloc::access_prefix(class_name, stream);

    let mut stmt = match conn
        .prepare("SELECT access_number FROM dropped_access_numbers ORDER BY access_number")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(numbers) => {
            let mut available: Vec<(u32, String)> = numbers
                .into_iter()
                .filter(|n| n.starts_with(&prefix))
                .filter_map(|n| alloc::access_suffix(&n).map(|s| (s, n)))
                .collect();
            available.sort();
            let available: Vec<String> = available.into_iter().map(|(_, n)| n).collect();
            ok(
                &req.id,
                json!({ "prefix": prefix, "availableAccessNumbers": available }),
            )
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let number = match req.params.get("accessNumber").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing accessNumber", None),
    };

    // A pooled number must not alias a live one.
    let held: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students
             WHERE access_number = ? AND status IN ('active', 're-admitted')",
            [&number],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if held.is_some() {
        return err(
            &req.id,
            "bad_state",
            "access number is held by an enrolled student",
            None,
        );
    }

    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO dropped_access_numbers(access_number, dropped_at)
         VALUES(?, ?)",
        (&number, now_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "dropped_access_numbers" })),
        );
    }

    ok(&req.id, json!({ "accessNumber": number }))
}

fn handle_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let number = match req.params.get("accessNumber").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing accessNumber", None),
    };

    match conn.execute(
        "DELETE FROM dropped_access_numbers WHERE access_number = ?",
        [&number],
    ) {
        Ok(n) => ok(
            &req.id,
            json!({ "accessNumber": number, "removed": n > 0 }),
        ),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "dropped_access_numbers" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "pool.list" => Some(handle_list(state, req)),
        "pool.available" => Some(handle_available(state, req)),
        "pool.add" => Some(handle_add(state, req)),
        "pool.remove" => Some(handle_remove(state, req)),
        _ => None,
    }
}
