mod test_support;

use serde_json::json;
use test_support::{request_ok, workspace_sidecar};

#[test]
fn live_check_drives_the_session_state_machine() {
    let (_child, mut stdin, mut reader) = workspace_sidecar("admitd-session-live");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "name": "John Okello",
            "className": "Senior 2",
            "stream": "A",
            "parentName": "Mary Okello",
            "admissionDate": "2025-02-10"
        }),
    );

    // A fresh session is idle and submittable.
    let fresh = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "validation.sessionState",
        json!({ "sessionId": "form-1" }),
    );
    assert_eq!(fresh.get("state").and_then(|v| v.as_str()), Some("idle"));
    assert_eq!(fresh.get("canSubmit").and_then(|v| v.as_bool()), Some(true));

    // Typing a colliding identity: live checks warn, submission stays open.
    let warned = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "validation.liveCheck",
        json!({
            "sessionId": "form-1",
            "name": "John Okello",
            "className": "Senior 2",
            "parentName": "Mary Okello"
        }),
    );
    assert_eq!(
        warned.get("state").and_then(|v| v.as_str()),
        Some("warned_duplicate")
    );
    assert_eq!(warned.get("canSubmit").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        warned
            .get("outcome")
            .and_then(|o| o.get("severity"))
            .and_then(|v| v.as_str()),
        Some("warning")
    );

    // Typing on clears the verdict until the next check lands.
    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "validation.edited",
        json!({ "sessionId": "form-1" }),
    );
    assert_eq!(edited.get("state").and_then(|v| v.as_str()), Some("idle"));

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "validation.liveCheck",
        json!({
            "sessionId": "form-1",
            "name": "Jane Apio",
            "className": "Senior 2",
            "parentName": "Mary Okello"
        }),
    );
    assert_eq!(cleared.get("state").and_then(|v| v.as_str()), Some("clear"));
    assert_eq!(cleared.get("canSubmit").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn sessions_are_independent_per_form() {
    let (_child, mut stdin, mut reader) = workspace_sidecar("admitd-session-iso");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "name": "John Okello",
            "className": "Senior 2",
            "stream": "A",
            "parentName": "Mary Okello",
            "admissionDate": "2025-02-10"
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "validation.liveCheck",
        json!({
            "sessionId": "form-a",
            "name": "John Okello",
            "className": "Senior 2",
            "parentName": "Mary Okello"
        }),
    );

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "validation.sessionState",
        json!({ "sessionId": "form-b" }),
    );
    assert_eq!(other.get("state").and_then(|v| v.as_str()), Some("idle"));

    let warned = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "validation.sessionState",
        json!({ "sessionId": "form-a" }),
    );
    assert_eq!(
        warned.get("state").and_then(|v| v.as_str()),
        Some("warned_duplicate")
    );
}
