use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultsd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));

    // Methods that need a workspace refuse politely before one is open.
    let early = request(&mut stdin, &mut reader, "1b", "results.get", json!({}));
    assert_eq!(early["ok"], false);
    assert_eq!(early["error"]["code"], "no_workspace");

    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.upsert",
        json!({ "studentNo": "STU-1", "name": "Smoke Student", "grade": "10", "section": "A" }),
    );
    let _ = request(&mut stdin, &mut reader, "4", "students.list", json!({}));
    let created = request(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.upsert",
        json!({ "teacherNo": "TCH-1", "name": "Smoke Teacher", "grade": "10", "section": "A" }),
    );
    let teacher_id = created["result"]["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "allocations.set",
        json!({ "teacherId": teacher_id, "classes": [{ "grade": "9", "section": "C" }] }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "allocations.list",
        json!({ "teacherId": teacher_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "settings.set",
        json!({ "key": "feature_toggles", "value": { "studentPortal": true } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "settings.get",
        json!({ "key": "feature_toggles" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "results.submit",
        json!({
            "actorRole": "teacher",
            "actorId": teacher_id,
            "submissionLevel": "subject-pending",
            "results": { "STU-1": { "subjects": [{ "name": "Math", "marks": 72 }] } }
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "results.get",
        json!({ "actorRole": "admin" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "results.review",
        json!({ "actorRole": "admin", "actorId": "ADM-1", "approve": ["STU-1"] }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "notifications.list",
        json!({}),
    );
    let activity = request(&mut stdin, &mut reader, "14", "activity.list", json!({}));
    assert!(
        !activity["result"]["activity"]
            .as_array()
            .expect("activity")
            .is_empty(),
        "state transitions should leave an activity trail"
    );

    let probe = json!({ "id": "15", "method": "reports.exportPdf", "params": {} });
    writeln!(stdin, "{}", probe).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let unknown: serde_json::Value =
        serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(unknown["ok"], false);
    assert_eq!(unknown["error"]["code"], "not_implemented");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
