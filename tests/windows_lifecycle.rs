mod test_support;

use chrono::{Duration, Utc};
use serde_json::json;
use test_support::{principal, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn create_check_list_and_revoke() {
    let workspace = temp_dir("attendd-windows");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "clubs.upsert",
        json!({ "principal": principal("vc", "vc"), "id": "club1", "name": "Tech Club" }),
    );

    let t0 = Utc::now() - Duration::minutes(30);
    let t_end = t0 + Duration::hours(2);

    let (code, status) = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "windows.create",
        json!({
            "principal": principal("vc", "vc"),
            "clubId": "club1",
            "eventName": "Hackathon",
            "start": t_end.to_rfc3339(),
            "end": t0.to_rfc3339(),
        }),
    );
    assert_eq!(code, "validation_error");
    assert_eq!(status, 400);

    let (code, status) = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "windows.create",
        json!({
            "principal": principal("vc", "vc"),
            "clubId": "club404",
            "eventName": "Hackathon",
            "start": t0.to_rfc3339(),
            "end": t_end.to_rfc3339(),
        }),
    );
    assert_eq!(code, "not_found");
    assert_eq!(status, 404);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "windows.create",
        json!({
            "principal": principal("vc", "vc"),
            "clubId": "club1",
            "eventName": "Hackathon",
            "start": t0.to_rfc3339(),
            "end": t_end.to_rfc3339(),
        }),
    );
    let window = &created["window"];
    assert_eq!(window["status"], "approved");
    assert_eq!(window["active"], true);
    assert_eq!(window["expired"], false);
    let window_id = window["id"].as_str().expect("window id").to_string();

    let later = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "windows.isActive",
        json!({ "windowId": window_id, "at": (t0 + Duration::hours(3)).to_rfc3339() }),
    );
    assert_eq!(later["active"], false);
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "windows.get",
        json!({ "windowId": window_id }),
    );
    assert_eq!(fetched["window"]["status"], "approved");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "windows.list",
        json!({ "principal": principal("club1", "club"), "activeOnly": true }),
    );
    assert_eq!(listed["windows"].as_array().map(|a| a.len()), Some(1));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "windows.revoke",
        json!({ "principal": principal("vc", "vc"), "windowId": window_id }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "windows.revoke",
        json!({ "principal": principal("vc", "vc"), "windowId": window_id }),
    );
    assert_eq!(first["window"]["status"], "revoked");
    assert_eq!(second["window"]["status"], "revoked");
    assert_eq!(second["window"]["active"], false);

    let now_check = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "windows.isActive",
        json!({ "windowId": window_id }),
    );
    assert_eq!(now_check["active"], false);

    let (code, status) = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "windows.revoke",
        json!({ "principal": principal("vc", "vc"), "windowId": "missing" }),
    );
    assert_eq!(code, "not_found");
    assert_eq!(status, 404);

    let (code, status) = request_err(
        &mut stdin,
        &mut reader,
        "13",
        "windows.revoke",
        json!({ "principal": principal("club1", "club"), "windowId": window_id }),
    );
    assert_eq!(code, "forbidden");
    assert_eq!(status, 403);

    let _ = std::fs::remove_dir_all(workspace);
}
