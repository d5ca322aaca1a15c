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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Harness {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    workspace: PathBuf,
    seq: u32,
}

impl Harness {
    fn new(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "ws",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        Harness {
            child,
            stdin,
            reader,
            workspace,
            seq: 0,
        }
    }

    fn call_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        let id = format!("r{}", self.seq);
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn seed_student(&mut self, no: &str, name: &str, grade: &str, section: &str) -> String {
        let res = self.call_ok(
            "students.upsert",
            json!({ "studentNo": no, "name": name, "grade": grade, "section": section }),
        );
        res["studentId"].as_str().expect("studentId").to_string()
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(self.workspace);
    }
}

fn two_subjects(a: f64, b: f64) -> serde_json::Value {
    json!({
        "subjects": [
            { "name": "Math", "marks": a },
            { "name": "Science", "marks": b }
        ]
    })
}

#[test]
fn roster_submission_ranks_the_whole_class_with_shared_ties() {
    let mut h = Harness::new("resultsd-rank-ties");
    let s1 = h.seed_student("STU-1", "Asha Rao", "10", "A");
    let s2 = h.seed_student("STU-2", "Bilal Khan", "10", "A");
    let s3 = h.seed_student("STU-3", "Chitra Sen", "10", "A");
    let tid = h.call_ok(
        "teachers.upsert",
        json!({ "teacherNo": "TCH-1", "name": "Homeroom A", "grade": "10", "section": "A" }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();

    h.call_ok(
        "results.submit",
        json!({
            "actorRole": "teacher",
            "actorId": tid,
            "submissionLevel": "roster",
            "results": {
                "STU-1": two_subjects(90.0, 90.0),
                "STU-2": two_subjects(90.0, 90.0),
                "STU-3": two_subjects(70.0, 70.0)
            }
        }),
    );

    let got = h.call_ok("results.get", json!({ "actorRole": "admin" }));
    let pending = &got["pending"];
    // Equal (average, total) shares a rank; the next distinct pair skips.
    assert_eq!(pending[&s1]["rank"], 1);
    assert_eq!(pending[&s2]["rank"], 1);
    assert_eq!(pending[&s3]["rank"], 3);
    assert_eq!(pending[&s1]["subjects"][0]["status"], "pending_roster_final");
    assert_eq!(pending[&s1]["status"], "pending");

    h.finish();
}

#[test]
fn roster_rank_overlays_previously_submitted_rows() {
    let mut h = Harness::new("resultsd-rank-overlay");
    let s1 = h.seed_student("STU-1", "Asha Rao", "10", "A");
    let s2 = h.seed_student("STU-2", "Bilal Khan", "10", "A");
    let tid = h.call_ok(
        "teachers.upsert",
        json!({ "teacherNo": "TCH-1", "name": "Homeroom A", "grade": "10", "section": "A" }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();

    // STU-1 arrives first via an ordinary subject submission.
    h.call_ok(
        "results.submit",
        json!({
            "actorRole": "teacher",
            "actorId": tid,
            "results": { "STU-1": two_subjects(60.0, 60.0) }
        }),
    );
    // The roster for STU-2 alone must still rank the union of the class.
    h.call_ok(
        "results.submit",
        json!({
            "actorRole": "teacher",
            "actorId": tid,
            "submissionLevel": "roster",
            "results": { "STU-2": two_subjects(80.0, 80.0) }
        }),
    );

    let got = h.call_ok("results.get", json!({ "actorRole": "admin" }));
    assert_eq!(got["pending"][&s2]["rank"], 1);
    assert_eq!(got["pending"][&s1]["rank"], 2);

    h.finish();
}

#[test]
fn pass_and_promotion_agree_at_the_35_boundary() {
    let mut h = Harness::new("resultsd-rank-boundary");
    let s1 = h.seed_student("STU-1", "Asha Rao", "10", "A");
    let s2 = h.seed_student("STU-2", "Bilal Khan", "10", "A");
    let tid = h.call_ok(
        "teachers.upsert",
        json!({ "teacherNo": "TCH-1", "name": "Homeroom A", "grade": "10", "section": "A" }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();

    h.call_ok(
        "results.submit",
        json!({
            "actorRole": "teacher",
            "actorId": tid,
            "submissionLevel": "roster",
            "results": {
                "STU-1": two_subjects(35.0, 35.0),
                "STU-2": two_subjects(34.9, 34.9)
            }
        }),
    );

    let got = h.call_ok("results.get", json!({ "actorRole": "admin" }));
    let pending = &got["pending"];
    // 35.0 exactly passes and promotes.
    assert_eq!(pending[&s1]["average"], 35.0);
    assert_eq!(pending[&s1]["result"], "PASS");
    assert_eq!(pending[&s1]["promotedOrDetained"], "PROMOTED");
    assert_eq!(pending[&s2]["result"], "FAIL");
    assert_eq!(pending[&s2]["promotedOrDetained"], "DETAINED");
    // Conduct defaults from the average band when not supplied.
    assert_eq!(pending[&s2]["conduct"], "Needs Improvement");

    h.finish();
}

#[test]
fn admin_direct_publish_ranks_the_published_class() {
    let mut h = Harness::new("resultsd-rank-admin");
    let s1 = h.seed_student("STU-1", "Asha Rao", "10", "A");
    let s2 = h.seed_student("STU-2", "Bilal Khan", "10", "A");

    h.call_ok(
        "results.submit",
        json!({
            "actorRole": "admin",
            "actorId": "ADM-1",
            "results": {
                "STU-1": two_subjects(50.0, 50.0),
                "STU-2": two_subjects(90.0, 90.0)
            }
        }),
    );

    let got = h.call_ok("results.get", json!({ "actorRole": "admin" }));
    let published = &got["published"];
    assert_eq!(published[&s2]["rank"], 1);
    assert_eq!(published[&s1]["rank"], 2);
    assert_eq!(published[&s1]["status"], "published");
    assert_eq!(published[&s1]["subjects"][0]["status"], "published");
    // Nothing went through the pending table.
    assert_eq!(got["pending"].as_object().expect("map").len(), 0);

    h.finish();
}
