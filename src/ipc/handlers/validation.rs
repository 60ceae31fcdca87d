use serde_json::json;

use crate::duplicates::{detect_duplicates, validate_candidate, Candidate, ValidationOptions};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster::RosterSnapshot;
use crate::session::FormSession;

fn parse_candidate(req: &Request) -> Result<Candidate, String> {
    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing name".to_string())?;
    let class_name = req
        .params
        .get("className")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing className".to_string())?;
    let parent_name = req
        .params
        .get("parentName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Ok(Candidate {
        name: name.to_string(),
        class_name: class_name.to_string(),
        parent_name,
    })
}

fn handle_detect(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let groups = detect_duplicates(&snapshot);
    match serde_json::to_value(&groups) {
        Ok(v) => ok(&req.id, json!({ "groups": v })),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

/// One-shot validation, strict by default (the submit-time path).
fn handle_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let candidate = match parse_candidate(req) {
        Ok(c) => c,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let strict = req
        .params
        .get("strict")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let mut opts = ValidationOptions::new(strict);
    opts.exclude_id = req
        .params
        .get("excludeStudentId")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    opts.check_recent = req
        .params
        .get("checkRecent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let outcome = validate_candidate(&snapshot, &candidate, &opts);
    let blocks = outcome.blocks_submission();
    match serde_json::to_value(&outcome) {
        Ok(mut v) => {
            v["blocksSubmission"] = json!(blocks);
            ok(&req.id, v)
        }
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

/// Live-typing check routed through the per-form session so a superseded
/// result can never land after a newer one. The caller debounces keystrokes;
/// each call here is one settled check.
fn handle_live_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = req
        .params
        .get("sessionId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
    else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let candidate = match parse_candidate(req) {
        Ok(c) => c,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let mut opts = ValidationOptions::new(false);
    opts.exclude_id = req
        .params
        .get("excludeStudentId")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    opts.check_recent = req
        .params
        .get("checkRecent")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let snapshot = match RosterSnapshot::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let session = state.sessions.entry(session_id).or_default();
    let generation = session.begin_check();
    let outcome = validate_candidate(&snapshot, &candidate, &opts);
    session.apply(generation, &outcome);

    match serde_json::to_value(&outcome) {
        Ok(v) => ok(
            &req.id,
            json!({
                "outcome": v,
                "state": session.state(),
                "canSubmit": session.can_submit()
            }),
        ),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

fn handle_edited(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = req.params.get("sessionId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    let session = state
        .sessions
        .entry(session_id.to_string())
        .or_default();
    session.edited();
    ok(
        &req.id,
        json!({ "state": session.state(), "canSubmit": session.can_submit() }),
    )
}

fn handle_session_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session_id) = req.params.get("sessionId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing sessionId", None);
    };
    match state.sessions.get(session_id) {
        Some(session) => ok(
            &req.id,
            json!({ "state": session.state(), "canSubmit": session.can_submit() }),
        ),
        None => {
            let fresh = FormSession::new();
            ok(
                &req.id,
                json!({ "state": fresh.state(), "canSubmit": fresh.can_submit() }),
            )
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "duplicates.detect" => Some(handle_detect(state, req)),
        "validation.check" => Some(handle_check(state, req)),
        "validation.liveCheck" => Some(handle_live_check(state, req)),
        "validation.edited" => Some(handle_edited(state, req)),
        "validation.sessionState" => Some(handle_session_state(state, req)),
        _ => None,
    }
}
