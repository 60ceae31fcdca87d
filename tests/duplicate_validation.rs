mod test_support;

use serde_json::json;
use test_support::{err_code, request, request_ok, workspace_sidecar};

#[test]
fn strict_check_blocks_and_live_check_warns() {
    let (_child, mut stdin, mut reader) = workspace_sidecar("admitd-dup-severity");

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

    // Submission-time (strict) check: error severity, blocks.
    let strict = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "validation.check",
        json!({
            "name": "john okello",
            "className": "Senior 2",
            "parentName": "MARY OKELLO",
            "strict": true
        }),
    );
    assert_eq!(strict.get("isDuplicate").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(strict.get("severity").and_then(|v| v.as_str()), Some("error"));
    assert_eq!(strict.get("blocksSubmission").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        strict.get("existingStudents").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    // Live-typing (non-strict) check: warning only.
    let live = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "validation.check",
        json!({
            "name": "John Okello",
            "className": "Senior 2",
            "parentName": "Mary Okello",
            "strict": false
        }),
    );
    assert_eq!(live.get("severity").and_then(|v| v.as_str()), Some("warning"));
    assert_eq!(live.get("blocksSubmission").and_then(|v| v.as_bool()), Some(false));

    // Different parent, same name+class: not an exact-key duplicate.
    let other_parent = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "validation.check",
        json!({
            "name": "John Okello",
            "className": "Senior 2",
            "parentName": "Grace Okello",
            "strict": true
        }),
    );
    assert_eq!(other_parent.get("isDuplicate").and_then(|v| v.as_bool()), Some(false));
}

#[test]
fn create_is_blocked_on_exact_duplicate_unless_overridden() {
    let (_child, mut stdin, mut reader) = workspace_sidecar("admitd-dup-create");

    let first = request_ok(
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
    let first_id = first.get("studentId").and_then(|v| v.as_str()).unwrap().to_string();

    let blocked = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "name": "John Okello",
            "className": "Senior 2",
            "stream": "A",
            "parentName": "Mary Okello",
            "admissionDate": "2025-02-11"
        }),
    );
    assert_eq!(blocked.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(err_code(&blocked), Some("duplicate_student"));
    // The conflicting record rides along so the operator can edit instead.
    let existing = blocked
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("existingStudents"))
        .and_then(|v| v.as_array())
        .expect("existing students in details");
    assert_eq!(
        existing[0].get("id").and_then(|v| v.as_str()),
        Some(first_id.as_str())
    );

    // Operator override admits anyway.
    let forced = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "name": "John Okello",
            "className": "Senior 2",
            "stream": "A",
            "parentName": "Mary Okello",
            "admissionDate": "2025-02-11",
            "allowDuplicate": true
        }),
    );
    assert_eq!(forced.get("accessNumber").and_then(|v| v.as_str()), Some("BA02"));
}

#[test]
fn detect_lists_groups_with_original_first() {
    let (_child, mut stdin, mut reader) = workspace_sidecar("admitd-dup-detect");

    let first = request_ok(
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
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "name": "JOHN OKELLO",
            "className": "Senior 2",
            "stream": "B",
            "parentName": "mary okello",
            "admissionDate": "2025-02-11",
            "allowDuplicate": true
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "name": "Jane Apio",
            "className": "Senior 2",
            "stream": "A",
            "admissionDate": "2025-02-12"
        }),
    );

    let detected = request_ok(&mut stdin, &mut reader, "4", "duplicates.detect", json!({}));
    let groups = detected.get("groups").and_then(|v| v.as_array()).unwrap();
    assert_eq!(groups.len(), 1);
    let members = groups[0].get("students").and_then(|v| v.as_array()).unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(
        members[0].get("id").and_then(|v| v.as_str()),
        first.get("studentId").and_then(|v| v.as_str())
    );
    assert_eq!(
        members[1].get("id").and_then(|v| v.as_str()),
        second.get("studentId").and_then(|v| v.as_str())
    );
}

#[test]
fn excluding_the_edited_student_prevents_self_matches() {
    let (_child, mut stdin, mut reader) = workspace_sidecar("admitd-dup-exclude");

    let created = request_ok(
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
    let student_id = created.get("studentId").and_then(|v| v.as_str()).unwrap().to_string();

    let self_check = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "validation.check",
        json!({
            "name": "John Okello",
            "className": "Senior 2",
            "parentName": "Mary Okello",
            "strict": true,
            "excludeStudentId": student_id
        }),
    );
    assert_eq!(self_check.get("isDuplicate").and_then(|v| v.as_bool()), Some(false));

    // Saving an edit that keeps name/class/parent unchanged goes through.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({
            "studentId": created.get("studentId"),
            "patch": { "parentName": "Mary Okello" }
        }),
    );
    assert_eq!(updated.get("reallocated").and_then(|v| v.as_bool()), Some(false));
}

#[test]
fn recent_same_name_admission_warns_but_does_not_block() {
    let (_child, mut stdin, mut reader) = workspace_sidecar("admitd-dup-recent");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "name": "John Okello",
            "className": "Senior 1",
            "stream": "A",
            "parentName": "Grace Okello",
            "admissionDate": "2025-02-10"
        }),
    );

    // Same name, different class and parent, created seconds ago: a softer
    // double-submission signal, warning severity even under strict.
    let checked = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "validation.check",
        json!({
            "name": "John Okello",
            "className": "Senior 4",
            "parentName": "Mary Okello",
            "strict": true,
            "checkRecent": true
        }),
    );
    assert_eq!(checked.get("isDuplicate").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(checked.get("severity").and_then(|v| v.as_str()), Some("warning"));
    assert_eq!(checked.get("blocksSubmission").and_then(|v| v.as_bool()), Some(false));

    // And the create proceeds.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "name": "John Okello",
            "className": "Senior 4",
            "stream": "A",
            "parentName": "Mary Okello",
            "admissionDate": "2025-02-10"
        }),
    );
    assert_eq!(created.get("accessNumber").and_then(|v| v.as_str()), Some("DA01"));
}
