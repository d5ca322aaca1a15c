use anyhow::{anyhow, Context};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::model::{Promotion, ResultRow, RowStatus, Subject, SubmissionLevel, Verdict};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("resultsd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT NOT NULL,
            gender TEXT,
            roll_number TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(grade, section)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            teacher_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            grade TEXT,
            section TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS allocations(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT NOT NULL,
            UNIQUE(teacher_id, grade, section),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_allocations_teacher ON allocations(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results_pending(
            student_id TEXT PRIMARY KEY,
            student_name TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT NOT NULL,
            roll_number TEXT,
            gender TEXT,
            subjects TEXT NOT NULL,
            total REAL NOT NULL,
            average REAL NOT NULL,
            rank INTEGER,
            conduct TEXT,
            result TEXT,
            promoted_or_detained TEXT,
            status TEXT NOT NULL,
            submission_level TEXT,
            submitted_by TEXT,
            submitted_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_pending_class ON results_pending(grade, section)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            student_id TEXT PRIMARY KEY,
            student_name TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT NOT NULL,
            roll_number TEXT,
            gender TEXT,
            subjects TEXT NOT NULL,
            total REAL NOT NULL,
            average REAL NOT NULL,
            rank INTEGER,
            conduct TEXT,
            result TEXT,
            promoted_or_detained TEXT,
            status TEXT NOT NULL,
            submission_level TEXT,
            submitted_by TEXT,
            submitted_at TEXT,
            updated_at TEXT,
            published_at TEXT,
            approved_by TEXT,
            approved_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_class ON results(grade, section)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_student ON notifications(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log(
            id TEXT PRIMARY KEY,
            actor_id TEXT,
            action TEXT NOT NULL,
            details TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

const PENDING_COLS: &str = "student_id, student_name, grade, section, roll_number, gender, \
     subjects, total, average, rank, conduct, result, promoted_or_detained, status, \
     submission_level, submitted_by, submitted_at, updated_at";

const PUBLISHED_COLS: &str = "student_id, student_name, grade, section, roll_number, gender, \
     subjects, total, average, rank, conduct, result, promoted_or_detained, status, \
     submission_level, submitted_by, submitted_at, updated_at, published_at, approved_by, \
     approved_at";

fn parse_verdict(s: Option<String>) -> anyhow::Result<Option<Verdict>> {
    match s.as_deref() {
        None => Ok(None),
        Some("PASS") => Ok(Some(Verdict::Pass)),
        Some("FAIL") => Ok(Some(Verdict::Fail)),
        Some(other) => Err(anyhow!("unknown result verdict '{}'", other)),
    }
}

fn parse_promotion(s: Option<String>) -> anyhow::Result<Option<Promotion>> {
    match s.as_deref() {
        None => Ok(None),
        Some("PROMOTED") => Ok(Some(Promotion::Promoted)),
        Some("DETAINED") => Ok(Some(Promotion::Detained)),
        Some(other) => Err(anyhow!("unknown promotion '{}'", other)),
    }
}

fn row_to_result(row: &Row, published: bool) -> anyhow::Result<ResultRow> {
    let subjects_json: String = row.get("subjects")?;
    let subjects: Vec<Subject> =
        serde_json::from_str(&subjects_json).context("stored subjects blob is not valid")?;

    let status_raw: String = row.get("status")?;
    let status = RowStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown row status '{}'", status_raw))?;

    let level_raw: Option<String> = row.get("submission_level")?;
    let submission_level = match level_raw {
        None => None,
        Some(raw) => Some(
            SubmissionLevel::parse(&raw).ok_or_else(|| anyhow!("unknown submission level '{}'", raw))?,
        ),
    };

    Ok(ResultRow {
        student_id: row.get("student_id")?,
        student_name: row.get("student_name")?,
        grade: row.get("grade")?,
        section: row.get("section")?,
        roll_number: row.get("roll_number")?,
        gender: row.get("gender")?,
        subjects,
        total: row.get("total")?,
        average: row.get("average")?,
        rank: row.get("rank")?,
        conduct: row.get("conduct")?,
        result: parse_verdict(row.get("result")?)?,
        promoted_or_detained: parse_promotion(row.get("promoted_or_detained")?)?,
        status,
        submission_level,
        submitted_by: row.get("submitted_by")?,
        submitted_at: row.get("submitted_at")?,
        updated_at: row.get("updated_at")?,
        published_at: if published { row.get("published_at")? } else { None },
        approved_by: if published { row.get("approved_by")? } else { None },
        approved_at: if published { row.get("approved_at")? } else { None },
    })
}

#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub grade: Option<String>,
    pub section: Option<String>,
    pub student_id: Option<String>,
    pub limit: Option<i64>,
}

fn list_rows(
    conn: &Connection,
    table: &str,
    cols: &str,
    published: bool,
    filter: &ResultFilter,
) -> anyhow::Result<Vec<ResultRow>> {
    let mut sql = format!("SELECT {} FROM {} WHERE 1=1", cols, table);
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(g) = &filter.grade {
        sql.push_str(" AND LOWER(TRIM(grade)) = LOWER(TRIM(?))");
        bind_values.push(Value::Text(g.clone()));
    }
    if let Some(s) = &filter.section {
        sql.push_str(" AND LOWER(TRIM(section)) = LOWER(TRIM(?))");
        bind_values.push(Value::Text(s.clone()));
    }
    if let Some(sid) = &filter.student_id {
        sql.push_str(" AND student_id = ?");
        bind_values.push(Value::Text(sid.clone()));
    }
    sql.push_str(" ORDER BY grade, section, student_id");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        bind_values.push(Value::Integer(limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_result(row, published)?);
    }
    Ok(out)
}

pub fn list_pending(conn: &Connection, filter: &ResultFilter) -> anyhow::Result<Vec<ResultRow>> {
    list_rows(conn, "results_pending", PENDING_COLS, false, filter)
}

pub fn list_published(conn: &Connection, filter: &ResultFilter) -> anyhow::Result<Vec<ResultRow>> {
    list_rows(conn, "results", PUBLISHED_COLS, true, filter)
}

pub fn get_pending(conn: &Connection, student_id: &str) -> anyhow::Result<Option<ResultRow>> {
    let filter = ResultFilter {
        student_id: Some(student_id.to_string()),
        ..Default::default()
    };
    Ok(list_pending(conn, &filter)?.into_iter().next())
}

pub fn get_published(conn: &Connection, student_id: &str) -> anyhow::Result<Option<ResultRow>> {
    let filter = ResultFilter {
        student_id: Some(student_id.to_string()),
        ..Default::default()
    };
    Ok(list_published(conn, &filter)?.into_iter().next())
}

/// Upsert into the pending table; one row per student.
pub fn upsert_pending(conn: &Connection, r: &ResultRow) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO results_pending(student_id, student_name, grade, section, roll_number, \
         gender, subjects, total, average, rank, conduct, result, promoted_or_detained, status, \
         submission_level, submitted_by, submitted_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(student_id) DO UPDATE SET
           student_name = excluded.student_name,
           grade = excluded.grade,
           section = excluded.section,
           roll_number = excluded.roll_number,
           gender = excluded.gender,
           subjects = excluded.subjects,
           total = excluded.total,
           average = excluded.average,
           rank = excluded.rank,
           conduct = excluded.conduct,
           result = excluded.result,
           promoted_or_detained = excluded.promoted_or_detained,
           status = excluded.status,
           submission_level = excluded.submission_level,
           submitted_by = excluded.submitted_by,
           submitted_at = excluded.submitted_at,
           updated_at = excluded.updated_at",
        rusqlite::params![
            r.student_id,
            r.student_name,
            r.grade,
            r.section,
            r.roll_number,
            r.gender,
            serde_json::to_string(&r.subjects)?,
            r.total,
            r.average,
            r.rank,
            r.conduct,
            r.result.map(Verdict::as_str),
            r.promoted_or_detained.map(Promotion::as_str),
            r.status.as_str(),
            r.submission_level.map(SubmissionLevel::as_str),
            r.submitted_by,
            r.submitted_at,
            r.updated_at,
        ],
    )?;
    Ok(())
}

/// Publish is always delete-then-insert so re-approving the same key can
/// never leave duplicate published rows.
pub fn replace_published(conn: &Connection, r: &ResultRow) -> anyhow::Result<()> {
    conn.execute("DELETE FROM results WHERE student_id = ?", [&r.student_id])?;
    conn.execute(
        "INSERT INTO results(student_id, student_name, grade, section, roll_number, gender, \
         subjects, total, average, rank, conduct, result, promoted_or_detained, status, \
         submission_level, submitted_by, submitted_at, updated_at, published_at, approved_by, \
         approved_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
         ?19, ?20, ?21)",
        rusqlite::params![
            r.student_id,
            r.student_name,
            r.grade,
            r.section,
            r.roll_number,
            r.gender,
            serde_json::to_string(&r.subjects)?,
            r.total,
            r.average,
            r.rank,
            r.conduct,
            r.result.map(Verdict::as_str),
            r.promoted_or_detained.map(Promotion::as_str),
            r.status.as_str(),
            r.submission_level.map(SubmissionLevel::as_str),
            r.submitted_by,
            r.submitted_at,
            r.updated_at,
            r.published_at,
            r.approved_by,
            r.approved_at,
        ],
    )?;
    Ok(())
}

pub fn delete_pending(conn: &Connection, student_id: &str) -> anyhow::Result<usize> {
    Ok(conn.execute(
        "DELETE FROM results_pending WHERE student_id = ?",
        [student_id],
    )?)
}

pub fn delete_published(conn: &Connection, student_id: &str) -> anyhow::Result<usize> {
    Ok(conn.execute("DELETE FROM results WHERE student_id = ?", [student_id])?)
}

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: String,
    pub student_no: String,
    pub name: String,
    pub grade: String,
    pub section: String,
    pub gender: Option<String>,
    pub roll_number: Option<String>,
}

/// Case-insensitive lookup by business id or internal id.
pub fn find_student(conn: &Connection, key: &str) -> anyhow::Result<Option<StudentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_no, name, grade, section, gender, roll_number FROM students
         WHERE LOWER(student_no) = LOWER(TRIM(?1)) OR LOWER(id) = LOWER(TRIM(?1))",
    )?;
    let rec = stmt
        .query_row([key], |row| {
            Ok(StudentRecord {
                id: row.get(0)?,
                student_no: row.get(1)?,
                name: row.get(2)?,
                grade: row.get(3)?,
                section: row.get(4)?,
                gender: row.get(5)?,
                roll_number: row.get(6)?,
            })
        })
        .optional()?;
    Ok(rec)
}

pub fn find_teacher(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<crate::permissions::TeacherIdentity>> {
    let mut stmt = conn.prepare(
        "SELECT id, teacher_no, name, grade, section FROM teachers
         WHERE LOWER(teacher_no) = LOWER(TRIM(?1)) OR LOWER(id) = LOWER(TRIM(?1))",
    )?;
    let rec = stmt
        .query_row([key], |row| {
            Ok(crate::permissions::TeacherIdentity {
                id: row.get(0)?,
                teacher_no: row.get(1)?,
                name: row.get(2)?,
                grade: row.get(3)?,
                section: row.get(4)?,
            })
        })
        .optional()?;
    Ok(rec)
}

pub fn teacher_allocations(
    conn: &Connection,
    teacher_id: &str,
) -> anyhow::Result<Vec<crate::permissions::Allocation>> {
    let mut stmt =
        conn.prepare("SELECT teacher_id, grade, section FROM allocations WHERE teacher_id = ?")?;
    let rows = stmt
        .query_map([teacher_id], |row| {
            Ok(crate::permissions::Allocation {
                teacher_id: row.get(0)?,
                grade: row.get(1)?,
                section: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Fire-and-forget sinks. Callers deliberately ignore these results so a
/// sink failure never fails the triggering mutation.
pub fn notify_student(
    conn: &Connection,
    student_id: &str,
    title: &str,
    body: &str,
    now: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO notifications(id, student_id, title, body, created_at) VALUES(?, ?, ?, ?, ?)",
        (
            uuid::Uuid::new_v4().to_string(),
            student_id,
            title,
            body,
            now,
        ),
    )?;
    Ok(())
}

pub fn log_activity(
    conn: &Connection,
    actor_id: Option<&str>,
    action: &str,
    details: &serde_json::Value,
    now: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO activity_log(id, actor_id, action, details, created_at) VALUES(?, ?, ?, ?, ?)",
        (
            uuid::Uuid::new_v4().to_string(),
            actor_id,
            action,
            serde_json::to_string(details)?,
            now,
        ),
    )?;
    Ok(())
}
