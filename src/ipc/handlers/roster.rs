use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_students_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_no = match req.params.get("studentNo").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing studentNo", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let grade = match req.params.get("grade").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing grade", None),
    };
    let section = match req.params.get("section").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing section", None),
    };
    let gender = req
        .params
        .get("gender")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let roll_number = req
        .params
        .get("rollNumber")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let id = Uuid::new_v4().to_string();
    let res = conn.execute(
        "INSERT INTO students(id, student_no, name, grade, section, gender, roll_number)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_no) DO UPDATE SET
           name = excluded.name,
           grade = excluded.grade,
           section = excluded.section,
           gender = excluded.gender,
           roll_number = excluded.roll_number",
        (&id, &student_no, &name, &grade, &section, &gender, &roll_number),
    );
    if let Err(e) = res {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // The insert may have resolved to an update; report the stored record.
    match crate::db::find_student(conn, &student_no) {
        Ok(Some(s)) => ok(&req.id, json!({ "studentId": s.id, "studentNo": s.student_no })),
        Ok(None) => err(&req.id, "db_query_failed", "student vanished after upsert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let grade = req.params.get("grade").and_then(|v| v.as_str());
    let section = req.params.get("section").and_then(|v| v.as_str());

    let mut stmt = match conn.prepare(
        "SELECT id, student_no, name, grade, section, gender, roll_number FROM students
         ORDER BY grade, section, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([], |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "studentNo": row.get::<_, String>(1)?,
            "name": row.get::<_, String>(2)?,
            "grade": row.get::<_, String>(3)?,
            "section": row.get::<_, String>(4)?,
            "gender": row.get::<_, Option<String>>(5)?,
            "rollNumber": row.get::<_, Option<String>>(6)?,
        }))
    });
    let students = match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let filtered: Vec<serde_json::Value> = students
        .into_iter()
        .filter(|s| {
            let class_match = |field: &str, want: Option<&str>| match want {
                None => true,
                Some(w) => s
                    .get(field)
                    .and_then(|v| v.as_str())
                    .map(|v| v.trim().eq_ignore_ascii_case(w.trim()))
                    .unwrap_or(false),
            };
            class_match("grade", grade) && class_match("section", section)
        })
        .collect();

    ok(&req.id, json!({ "students": filtered }))
}

fn handle_teachers_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_no = match req.params.get("teacherNo").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing teacherNo", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    // A teacher's stored grade/section marks their homeroom class, if any.
    let grade = req
        .params
        .get("grade")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let section = req
        .params
        .get("section")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let id = Uuid::new_v4().to_string();
    let res = conn.execute(
        "INSERT INTO teachers(id, teacher_no, name, grade, section)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(teacher_no) DO UPDATE SET
           name = excluded.name,
           grade = excluded.grade,
           section = excluded.section",
        (&id, &teacher_no, &name, &grade, &section),
    );
    if let Err(e) = res {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    match crate::db::find_teacher(conn, &teacher_no) {
        Ok(Some(t)) => ok(&req.id, json!({ "teacherId": t.id, "teacherNo": t.teacher_no })),
        Ok(None) => err(&req.id, "db_query_failed", "teacher vanished after upsert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_allocations_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_key = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v,
        _ => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let teacher = match crate::db::find_teacher(conn, teacher_key) {
        Ok(Some(t)) => t,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "teacher not found",
                Some(json!({ "teacherId": teacher_key })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some(classes) = req.params.get("classes").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing classes array", None);
    };

    // Validate the whole batch before touching the table so a bad entry
    // leaves the existing allocation set intact.
    let mut pairs: Vec<(String, String)> = Vec::with_capacity(classes.len());
    for (i, c) in classes.iter().enumerate() {
        let grade = c.get("grade").and_then(|v| v.as_str()).unwrap_or("");
        let section = c.get("section").and_then(|v| v.as_str()).unwrap_or("");
        if grade.trim().is_empty() || section.trim().is_empty() {
            return err(
                &req.id,
                "bad_params",
                "each class needs grade and section",
                Some(json!({ "index": i })),
            );
        }
        pairs.push((grade.trim().to_string(), section.trim().to_string()));
    }

    // Replace the full allocation set for the teacher in one shot.
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM allocations WHERE teacher_id = ?",
        [&teacher.id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    for (grade, section) in &pairs {
        let res = tx.execute(
            "INSERT INTO allocations(id, teacher_id, grade, section) VALUES(?, ?, ?, ?)
             ON CONFLICT(teacher_id, grade, section) DO NOTHING",
            (Uuid::new_v4().to_string(), &teacher.id, grade, section),
        );
        if let Err(e) = res {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "teacherId": teacher.id, "count": pairs.len() }))
}

fn handle_allocations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_key = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v,
        _ => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let teacher = match crate::db::find_teacher(conn, teacher_key) {
        Ok(Some(t)) => t,
        Ok(None) => return ok(&req.id, json!({ "allocations": [] })),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match crate::db::teacher_allocations(conn, &teacher.id) {
        Ok(allocs) => {
            let list: Vec<serde_json::Value> = allocs
                .iter()
                .map(|a| json!({ "grade": a.grade, "section": a.section }))
                .collect();
            ok(
                &req.id,
                json!({
                    "teacherId": teacher.id,
                    "teacherName": teacher.name,
                    "allocations": list,
                }),
            )
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.upsert" => Some(handle_students_upsert(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "teachers.upsert" => Some(handle_teachers_upsert(state, req)),
        "allocations.set" => Some(handle_allocations_set(state, req)),
        "allocations.list" => Some(handle_allocations_list(state, req)),
        _ => None,
    }
}
