use crate::calc::{self, AssessmentType, RankEntry};
use crate::db::{self, ResultFilter};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::merge::{self, IncomingResult};
use crate::model::{ResultRow, RowStatus, Subject, SubjectStatus, SubmissionLevel};
use crate::permissions::{self, Allocation, TeacherIdentity};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(code: &'static str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    fn storage(e: anyhow::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn now_utc() -> String {
    Utc::now().to_rfc3339()
}

fn actor_role(req: &Request) -> Option<&str> {
    req.params.get("actorRole").and_then(|v| v.as_str())
}

fn actor_id(req: &Request) -> Option<&str> {
    req.params
        .get("actorId")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn load_assessment_types(conn: &Connection) -> Result<Vec<AssessmentType>, HandlerErr> {
    let raw = db::settings_get_json(conn, "assessment_types").map_err(HandlerErr::storage)?;
    match raw {
        None => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v)
            .map_err(|e| HandlerErr::new("db_query_failed", format!("stored assessment_types is malformed: {}", e))),
    }
}

fn result_filter(req: &Request) -> ResultFilter {
    let get = |k: &str| {
        req.params
            .get(k)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    ResultFilter {
        grade: get("grade"),
        section: get("section"),
        student_id: get("studentId"),
        limit: req.params.get("limit").and_then(|v| v.as_i64()),
    }
}

fn rows_to_map(rows: Vec<ResultRow>) -> Result<serde_json::Value, HandlerErr> {
    let mut map = serde_json::Map::new();
    for r in rows {
        let key = r.student_id.clone();
        let value = serde_json::to_value(&r)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        map.insert(key, value);
    }
    Ok(serde_json::Value::Object(map))
}

/// Recompute a subject's mark from assessment weights when both raw scores
/// and configured types are available.
fn reweigh_subjects(subjects: &mut [Subject], types: &[AssessmentType]) {
    if types.is_empty() {
        return;
    }
    for s in subjects.iter_mut() {
        if let Some(raw) = &s.assessments {
            s.marks = calc::derived_mark(types, raw);
        }
    }
}

fn rerank_pending_class(conn: &Connection, grade: &str, section: &str) -> Result<(), HandlerErr> {
    let filter = ResultFilter {
        grade: Some(grade.to_string()),
        section: Some(section.to_string()),
        ..Default::default()
    };
    let rows = db::list_pending(conn, &filter).map_err(HandlerErr::storage)?;
    apply_ranks(conn, "results_pending", &rows)
}

fn rerank_published_class(conn: &Connection, grade: &str, section: &str) -> Result<(), HandlerErr> {
    let filter = ResultFilter {
        grade: Some(grade.to_string()),
        section: Some(section.to_string()),
        ..Default::default()
    };
    let rows = db::list_published(conn, &filter).map_err(HandlerErr::storage)?;
    apply_ranks(conn, "results", &rows)
}

fn apply_ranks(conn: &Connection, table: &str, rows: &[ResultRow]) -> Result<(), HandlerErr> {
    let entries: Vec<RankEntry> = rows
        .iter()
        .map(|r| RankEntry {
            student_id: r.student_id.clone(),
            total: r.total,
            average: r.average,
        })
        .collect();
    let ranks = calc::calculate_ranks(&entries);
    let sql = format!("UPDATE {} SET rank = ? WHERE student_id = ?", table);
    for (sid, rank) in &ranks {
        conn.execute(&sql, (rank, sid))
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    Ok(())
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match actor_role(req) {
        None | Some("admin") => match get_admin(conn, req) {
            Ok(v) => ok(&req.id, v),
            Err(e) => e.response(&req.id),
        },
        Some("teacher") => match get_teacher(conn, req) {
            Ok(v) => ok(&req.id, v),
            Err(e) => e.response(&req.id),
        },
        Some("student") => match get_student(conn, req) {
            Ok(v) => ok(&req.id, v),
            Err(e) => e.response(&req.id),
        },
        Some(other) => err(
            &req.id,
            "permission_denied",
            format!("unknown actor role '{}'", other),
            None,
        ),
    }
}

fn get_admin(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let filter = result_filter(req);
    let published = db::list_published(conn, &filter).map_err(HandlerErr::storage)?;
    let pending = db::list_pending(conn, &filter).map_err(HandlerErr::storage)?;
    Ok(json!({
        "published": rows_to_map(published)?,
        "pending": rows_to_map(pending)?,
    }))
}

fn get_teacher(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(actor) = actor_id(req) else {
        return Err(HandlerErr::new("bad_params", "missing actorId"));
    };
    let Some(teacher) = db::find_teacher(conn, actor).map_err(HandlerErr::storage)? else {
        // Unknown actors get an empty view, not an error.
        return Ok(json!({ "published": {}, "pending": {} }));
    };
    let allocations = db::teacher_allocations(conn, &teacher.id).map_err(HandlerErr::storage)?;
    let visible: HashSet<(String, String)> =
        permissions::visible_classes(&teacher, &allocations)
            .into_iter()
            .collect();

    // Limit visible rows, not raw rows; a SQL LIMIT here would cut the page
    // short whenever out-of-class rows sort ahead of the teacher's own.
    let mut filter = result_filter(req);
    let limit = filter.limit.take();
    let published = db::list_published(conn, &filter).map_err(HandlerErr::storage)?;
    let pending = db::list_pending(conn, &filter).map_err(HandlerErr::storage)?;

    let keep = |rows: Vec<ResultRow>| -> Result<Vec<ResultRow>, HandlerErr> {
        let mut kept = Vec::new();
        for r in rows {
            if limit.is_some_and(|n| kept.len() as i64 >= n) {
                break;
            }
            let (grade, section) = if !r.grade.trim().is_empty() && !r.section.trim().is_empty() {
                (r.grade.clone(), r.section.clone())
            } else {
                // Older rows may lack class fields; fall back to the roster.
                match db::find_student(conn, &r.student_id).map_err(HandlerErr::storage)? {
                    Some(s) => (s.grade, s.section),
                    None => continue,
                }
            };
            if visible.contains(&permissions::class_key(&grade, &section)) {
                kept.push(r);
            }
        }
        Ok(kept)
    };

    Ok(json!({
        "published": rows_to_map(keep(published)?)?,
        "pending": rows_to_map(keep(pending)?)?,
    }))
}

fn get_student(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(actor) = actor_id(req) else {
        return Err(HandlerErr::new("bad_params", "missing actorId"));
    };
    let Some(student) = db::find_student(conn, actor).map_err(HandlerErr::storage)? else {
        return Ok(json!({}));
    };

    let published = db::get_published(conn, &student.id).map_err(HandlerErr::storage)?;
    let pending = db::get_pending(conn, &student.id).map_err(HandlerErr::storage)?;

    let visible =
        |row: &ResultRow| -> Vec<Subject> {
            row.subjects
                .iter()
                .filter(|s| s.status.visible_to_student())
                .cloned()
                .collect()
        };

    // Published subjects win on a name collision; approved pending subjects
    // fill in the rest. Never duplicate a subject name.
    let mut merged_subjects: Vec<Subject> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    if let Some(p) = &published {
        for s in visible(p) {
            seen.insert(s.name.trim().to_ascii_lowercase());
            merged_subjects.push(s);
        }
    }
    if let Some(p) = &pending {
        for s in visible(p) {
            if seen.insert(s.name.trim().to_ascii_lowercase()) {
                merged_subjects.push(s);
            }
        }
    }

    let base = match (published, pending) {
        (Some(p), _) => p,
        (None, Some(p)) => p,
        (None, None) => return Ok(json!({})),
    };
    if merged_subjects.is_empty() {
        // Nothing reviewed yet; the student sees nothing.
        return Ok(json!({}));
    }

    let mut view = base;
    view.subjects = merged_subjects;
    // Displayed figures must match the visible subjects only.
    view.recompute_derived();

    let key = view.student_id.clone();
    let value =
        serde_json::to_value(&view).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(json!({ key: value }))
}

struct ResolvedEntry {
    student_id: String,
    student_name: String,
    grade: String,
    section: String,
    roll_number: Option<String>,
    gender: Option<String>,
    conduct: Option<String>,
    level: SubmissionLevel,
    subjects: Vec<merge::IncomingSubject>,
}

fn resolve_entries(
    conn: &Connection,
    entries: Vec<IncomingResult>,
    call_level: Option<SubmissionLevel>,
) -> Result<(Vec<ResolvedEntry>, Vec<serde_json::Value>), HandlerErr> {
    let single = entries.len() == 1;
    let mut resolved = Vec::new();
    let mut skipped = Vec::new();

    for e in entries {
        let level = e.submission_level.or(call_level).unwrap_or(SubmissionLevel::Subject);
        match db::find_student(conn, &e.student_key).map_err(HandlerErr::storage)? {
            Some(s) => resolved.push(ResolvedEntry {
                student_id: s.id,
                student_name: s.name,
                grade: s.grade,
                section: s.section,
                roll_number: e.roll_number.or(s.roll_number),
                gender: e.gender.or(s.gender),
                conduct: e.conduct,
                level,
                subjects: e.subjects,
            }),
            None => {
                // No roster match: the payload may still self-describe its
                // class, which is enough to file the result.
                match (e.grade, e.section) {
                    (Some(grade), Some(section)) => resolved.push(ResolvedEntry {
                        student_id: e.student_key.trim().to_string(),
                        student_name: e.student_name.unwrap_or_else(|| e.student_key.clone()),
                        grade,
                        section,
                        roll_number: e.roll_number,
                        gender: e.gender,
                        conduct: e.conduct,
                        level,
                        subjects: e.subjects,
                    }),
                    _ if single => {
                        return Err(HandlerErr::with_details(
                            "unresolvable_student",
                            format!("unknown student '{}'", e.student_key),
                            json!({ "studentKey": e.student_key }),
                        ));
                    }
                    _ => skipped.push(json!({
                        "studentKey": e.student_key,
                        "reason": "unresolvable student",
                    })),
                }
            }
        }
    }
    Ok((resolved, skipped))
}

fn handle_results_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let role = match actor_role(req) {
        Some(r @ ("admin" | "teacher")) => r.to_string(),
        Some(other) => {
            return err(
                &req.id,
                "permission_denied",
                format!("role '{}' may not submit results", other),
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing actorRole", None),
    };

    let Some(results_obj) = req.params.get("results").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing results object", None);
    };
    if results_obj.is_empty() {
        return err(&req.id, "bad_params", "results batch is empty", None);
    }

    let call_level = match req.params.get("submissionLevel").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match SubmissionLevel::parse(raw) {
            Some(l) => Some(l),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown submission level '{}'", raw),
                    None,
                )
            }
        },
    };

    // Normalize every entry before touching anything.
    let mut incoming = Vec::with_capacity(results_obj.len());
    for (key, payload) in results_obj {
        match merge::normalize_entry(key, payload) {
            Ok(e) => incoming.push(e),
            Err(msg) => return err(&req.id, "bad_params", msg, Some(json!({ "entry": key }))),
        }
    }

    let outcome = if role == "teacher" {
        submit_as_teacher(conn, req, incoming, call_level)
    } else {
        submit_as_admin(conn, req, incoming, call_level)
    };
    match outcome {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn submit_as_teacher(
    conn: &mut Connection,
    req: &Request,
    incoming: Vec<IncomingResult>,
    call_level: Option<SubmissionLevel>,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(actor) = actor_id(req) else {
        return Err(HandlerErr::new("bad_params", "missing actorId"));
    };
    let teacher: TeacherIdentity = db::find_teacher(conn, actor)
        .map_err(HandlerErr::storage)?
        .ok_or_else(|| HandlerErr::new("permission_denied", format!("unknown teacher '{}'", actor)))?;
    let allocations: Vec<Allocation> =
        db::teacher_allocations(conn, &teacher.id).map_err(HandlerErr::storage)?;

    let types = load_assessment_types(conn)?;
    let (resolved, skipped) = resolve_entries(conn, incoming, call_level)?;

    // Authorization runs over the whole batch before any write so a denied
    // request never leaves half-applied state.
    for e in &resolved {
        permissions::authorize_submission(&teacher, &allocations, &e.grade, &e.section, e.level)
            .map_err(|d| {
                HandlerErr::with_details(
                    "permission_denied",
                    d.reason,
                    json!({ "grade": d.grade, "section": d.section }),
                )
            })?;
    }

    let now = now_utc();
    let tx = conn
        .transaction()
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let mut saved = Vec::new();
    let mut roster_classes: HashSet<(String, String)> = HashSet::new();
    for e in &resolved {
        let built = merge::build_subjects(&e.subjects, &types, e.level.stamp(), &teacher.id, &now)
            .map_err(|msg| HandlerErr::new("bad_params", msg))?;
        let existing = db::get_pending(&tx, &e.student_id).map_err(HandlerErr::storage)?;
        let (existing_subjects, existing_rank, existing_conduct) = match existing {
            Some(row) => (row.subjects, row.rank, row.conduct),
            None => (Vec::new(), None, None),
        };
        let merged = merge::merge_subject_lists(existing_subjects, built);

        let mut row = ResultRow {
            student_id: e.student_id.clone(),
            student_name: e.student_name.clone(),
            grade: e.grade.clone(),
            section: e.section.clone(),
            roll_number: e.roll_number.clone(),
            gender: e.gender.clone(),
            subjects: merged,
            total: 0.0,
            average: 0.0,
            rank: existing_rank,
            conduct: e.conduct.clone().or(existing_conduct),
            result: None,
            promoted_or_detained: None,
            status: if e.level == SubmissionLevel::Subject {
                RowStatus::Draft
            } else {
                RowStatus::Pending
            },
            submission_level: Some(e.level),
            submitted_by: Some(teacher.id.clone()),
            submitted_at: Some(now.clone()),
            updated_at: Some(now.clone()),
            published_at: None,
            approved_by: None,
            approved_at: None,
        };
        row.recompute_derived();
        db::upsert_pending(&tx, &row).map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        saved.push(row.student_id.clone());

        if e.level == SubmissionLevel::Roster {
            roster_classes.insert((e.grade.clone(), e.section.clone()));
        }
    }

    // A roster submission finalizes the class: rank over the union of every
    // pending row for that grade/section, inside the same transaction.
    for (grade, section) in &roster_classes {
        rerank_pending_class(&tx, grade, section)?;
    }

    let _ = db::log_activity(
        &tx,
        Some(&teacher.id),
        "results.submit",
        &json!({ "saved": saved, "level": call_level.map(SubmissionLevel::as_str) }),
        &now,
    );

    tx.commit()
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "saved": saved, "skipped": skipped }))
}

fn submit_as_admin(
    conn: &mut Connection,
    req: &Request,
    incoming: Vec<IncomingResult>,
    call_level: Option<SubmissionLevel>,
) -> Result<serde_json::Value, HandlerErr> {
    let approver = actor_id(req).unwrap_or("admin").to_string();
    let types = load_assessment_types(conn)?;
    let (resolved, skipped) = resolve_entries(conn, incoming, call_level)?;

    let now = now_utc();
    let tx = conn
        .transaction()
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let mut saved = Vec::new();
    let mut classes: HashSet<(String, String)> = HashSet::new();
    for e in &resolved {
        let built = merge::build_subjects(
            &e.subjects,
            &types,
            Some(SubjectStatus::Published),
            &approver,
            &now,
        )
        .map_err(|msg| HandlerErr::new("bad_params", msg))?;
        let mut subjects = built;
        for s in &mut subjects {
            s.approved_by = Some(approver.clone());
            s.approved_at = Some(now.clone());
        }

        let mut row = ResultRow {
            student_id: e.student_id.clone(),
            student_name: e.student_name.clone(),
            grade: e.grade.clone(),
            section: e.section.clone(),
            roll_number: e.roll_number.clone(),
            gender: e.gender.clone(),
            subjects,
            total: 0.0,
            average: 0.0,
            rank: None,
            conduct: e.conduct.clone(),
            result: None,
            promoted_or_detained: None,
            status: RowStatus::Published,
            submission_level: Some(e.level),
            submitted_by: Some(approver.clone()),
            submitted_at: Some(now.clone()),
            updated_at: Some(now.clone()),
            published_at: Some(now.clone()),
            approved_by: Some(approver.clone()),
            approved_at: Some(now.clone()),
        };
        row.recompute_derived();
        db::replace_published(&tx, &row)
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        let _ = db::notify_student(
            &tx,
            &row.student_id,
            "Result published",
            "Your result has been published.",
            &now,
        );
        classes.insert((e.grade.clone(), e.section.clone()));
        saved.push(row.student_id.clone());
    }

    for (grade, section) in &classes {
        rerank_published_class(&tx, grade, section)?;
    }

    let _ = db::log_activity(
        &tx,
        Some(&approver),
        "results.submit.admin",
        &json!({ "saved": saved }),
        &now,
    );

    tx.commit()
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "saved": saved, "skipped": skipped }))
}

fn string_list(req: &Request, key: &str) -> Result<Vec<String>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => {
            let mut out = Vec::new();
            for v in items {
                match v.as_str() {
                    Some(s) if !s.trim().is_empty() => {
                        let s = s.trim().to_string();
                        if !out.contains(&s) {
                            out.push(s);
                        }
                    }
                    _ => {
                        return Err(HandlerErr::new(
                            "bad_params",
                            format!("{} must be an array of student keys", key),
                        ))
                    }
                }
            }
            Ok(out)
        }
        Some(_) => Err(HandlerErr::new(
            "bad_params",
            format!("{} must be an array of student keys", key),
        )),
    }
}

fn canonical_student_id(conn: &Connection, key: &str) -> Result<String, HandlerErr> {
    Ok(db::find_student(conn, key)
        .map_err(HandlerErr::storage)?
        .map(|s| s.id)
        .unwrap_or_else(|| key.trim().to_string()))
}

fn handle_results_review(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if actor_role(req) != Some("admin") {
        return err(
            &req.id,
            "permission_denied",
            "results.review requires the admin role",
            None,
        );
    }

    match review(conn, req) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn review(conn: &mut Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let approver = actor_id(req).unwrap_or("admin").to_string();
    let approve_keys = string_list(req, "approve")?;
    let reject_keys = string_list(req, "reject")?;
    let unlock_keys = string_list(req, "unlock")?;
    let delete_keys = string_list(req, "deletePublished")?;
    let approve_subject = req.params.get("approveSubject").cloned();

    if approve_keys.is_empty()
        && reject_keys.is_empty()
        && unlock_keys.is_empty()
        && delete_keys.is_empty()
        && approve_subject.is_none()
    {
        return Err(HandlerErr::new("bad_params", "no review operation given"));
    }

    let types = load_assessment_types(conn)?;
    let now = now_utc();
    let tx = conn
        .transaction()
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    // Resolve and validate every key up front; a bad batch mutates nothing.
    let mut approve_rows = Vec::new();
    let mut already_published = Vec::new();
    for key in &approve_keys {
        let sid = canonical_student_id(&tx, key)?;
        match db::get_pending(&tx, &sid).map_err(HandlerErr::storage)? {
            Some(row) => {
                // Same gate as the per-subject path: a draft row was never
                // submitted for review and cannot jump straight to published.
                if row.status == RowStatus::Draft {
                    return Err(HandlerErr::with_details(
                        "invalid_status",
                        format!("result for '{}' is draft and cannot be approved", key),
                        json!({ "studentKey": key }),
                    ));
                }
                approve_rows.push(row)
            }
            None => {
                // Re-approving an already-published key is a no-op, not an
                // error; anything else is a missing result.
                if db::get_published(&tx, &sid).map_err(HandlerErr::storage)?.is_some() {
                    already_published.push(sid);
                } else {
                    return Err(HandlerErr::with_details(
                        "bad_params",
                        format!("no pending result for '{}'", key),
                        json!({ "studentKey": key }),
                    ));
                }
            }
        }
    }
    let mut reject_rows = Vec::new();
    for key in &reject_keys {
        let sid = canonical_student_id(&tx, key)?;
        let row = db::get_pending(&tx, &sid)
            .map_err(HandlerErr::storage)?
            .ok_or_else(|| {
                HandlerErr::with_details(
                    "bad_params",
                    format!("no pending result for '{}'", key),
                    json!({ "studentKey": key }),
                )
            })?;
        reject_rows.push(row);
    }
    let mut unlock_rows = Vec::new();
    for key in &unlock_keys {
        let sid = canonical_student_id(&tx, key)?;
        let row = db::get_published(&tx, &sid)
            .map_err(HandlerErr::storage)?
            .ok_or_else(|| {
                HandlerErr::with_details(
                    "bad_params",
                    format!("no published result for '{}'", key),
                    json!({ "studentKey": key }),
                )
            })?;
        unlock_rows.push(row);
    }
    let mut delete_ids = Vec::new();
    for key in &delete_keys {
        delete_ids.push(canonical_student_id(&tx, key)?);
    }

    // Approve: promote full rows into the published table.
    let mut approved = Vec::new();
    let mut approved_classes: HashSet<(String, String)> = HashSet::new();
    for mut row in approve_rows {
        reweigh_subjects(&mut row.subjects, &types);
        for s in &mut row.subjects {
            // Subjects already published (per-subject approval) keep their
            // stamps; a draft subject in a pending row stays unreviewed.
            if s.status.can_transition(SubjectStatus::Published) {
                s.status = SubjectStatus::Published;
                s.approved_by = Some(approver.clone());
                s.approved_at = Some(now.clone());
            }
        }
        row.status = RowStatus::Published;
        row.published_at = Some(now.clone());
        row.approved_by = Some(approver.clone());
        row.approved_at = Some(now.clone());
        row.updated_at = Some(now.clone());
        row.recompute_derived();

        db::replace_published(&tx, &row)
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        db::delete_pending(&tx, &row.student_id).map_err(HandlerErr::storage)?;
        let _ = db::notify_student(
            &tx,
            &row.student_id,
            "Result published",
            "Your result has been reviewed and published.",
            &now,
        );
        approved_classes.insert((row.grade.clone(), row.section.clone()));
        approved.push(row.student_id.clone());
    }
    for (grade, section) in &approved_classes {
        rerank_published_class(&tx, grade, section)?;
    }

    // Reject: back to draft, marks preserved; stale published rows removed.
    let mut rejected = Vec::new();
    for mut row in reject_rows {
        for s in &mut row.subjects {
            if s.status != SubjectStatus::Draft {
                s.status = SubjectStatus::Draft;
            }
        }
        row.status = RowStatus::Draft;
        row.updated_at = Some(now.clone());
        db::upsert_pending(&tx, &row)
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        db::delete_published(&tx, &row.student_id).map_err(HandlerErr::storage)?;
        rejected.push(row.student_id.clone());
    }

    // Unlock: the only published -> pending transition; preserves the data
    // minus the publish-only stamps.
    let mut unlocked = Vec::new();
    for mut row in unlock_rows {
        row.strip_publish_fields();
        for s in &mut row.subjects {
            s.status = SubjectStatus::Draft;
        }
        row.status = RowStatus::Draft;
        row.updated_at = Some(now.clone());
        db::upsert_pending(&tx, &row)
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        db::delete_published(&tx, &row.student_id).map_err(HandlerErr::storage)?;
        unlocked.push(row.student_id.clone());
    }

    // Delete published: removes the student's result everywhere.
    let mut deleted = Vec::new();
    for sid in &delete_ids {
        db::delete_published(&tx, sid).map_err(HandlerErr::storage)?;
        db::delete_pending(&tx, sid).map_err(HandlerErr::storage)?;
        deleted.push(sid.clone());
    }

    // Single-subject approve: flips one subject inside a still-pending row.
    let mut approved_subject = None;
    if let Some(payload) = approve_subject {
        let student_key = payload
            .get("studentKey")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::new("bad_params", "approveSubject.studentKey is required"))?;
        let subject_name = payload
            .get("subjectName")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::new("bad_params", "approveSubject.subjectName is required"))?;

        let sid = canonical_student_id(&tx, student_key)?;
        let mut row = db::get_pending(&tx, &sid)
            .map_err(HandlerErr::storage)?
            .ok_or_else(|| {
                HandlerErr::with_details(
                    "bad_params",
                    format!("no pending result for '{}'", student_key),
                    json!({ "studentKey": student_key }),
                )
            })?;

        let idx = row
            .subjects
            .iter()
            .position(|s| s.name.trim().eq_ignore_ascii_case(subject_name))
            .ok_or_else(|| {
                HandlerErr::with_details(
                    "not_found",
                    format!("subject '{}' not found", subject_name),
                    json!({ "studentKey": student_key }),
                )
            })?;
        if !row.subjects[idx].status.can_transition(SubjectStatus::Published) {
            return Err(HandlerErr::with_details(
                "invalid_status",
                format!(
                    "subject '{}' is {} and cannot be approved",
                    subject_name,
                    row.subjects[idx].status.as_str()
                ),
                json!({ "studentKey": student_key }),
            ));
        }

        if !types.is_empty() {
            if let Some(raw) = &row.subjects[idx].assessments {
                row.subjects[idx].marks = calc::derived_mark(&types, raw);
            }
        }
        row.subjects[idx].status = SubjectStatus::Published;
        row.subjects[idx].approved_by = Some(approver.clone());
        row.subjects[idx].approved_at = Some(now.clone());
        row.updated_at = Some(now.clone());
        // The row stays pending and the class is not re-ranked; only the
        // totals move with the re-derived mark.
        row.recompute_derived();
        db::upsert_pending(&tx, &row)
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        let _ = db::notify_student(
            &tx,
            &row.student_id,
            "Subject result approved",
            &format!("Your {} result has been approved.", subject_name),
            &now,
        );
        approved_subject = Some(json!({
            "studentId": row.student_id,
            "subjectName": subject_name,
        }));
    }

    let _ = db::log_activity(
        &tx,
        Some(&approver),
        "results.review",
        &json!({
            "approved": approved,
            "rejected": rejected,
            "unlocked": unlocked,
            "deletedPublished": deleted,
        }),
        &now,
    );

    tx.commit()
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({
        "approved": approved,
        "alreadyPublished": already_published,
        "rejected": rejected,
        "unlocked": unlocked,
        "deletedPublished": deleted,
        "approvedSubject": approved_subject,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.get" => Some(handle_results_get(state, req)),
        "results.submit" => Some(handle_results_submit(state, req)),
        "results.review" => Some(handle_results_review(state, req)),
        _ => None,
    }
}
