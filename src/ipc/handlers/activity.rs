use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = req.params.get("studentId").and_then(|v| v.as_str());

    let (sql, binds): (&str, Vec<String>) = match student_id {
        Some(sid) => (
            "SELECT id, student_id, title, body, created_at FROM notifications
             WHERE student_id = ? ORDER BY created_at DESC",
            vec![sid.to_string()],
        ),
        None => (
            "SELECT id, student_id, title, body, created_at FROM notifications
             ORDER BY created_at DESC",
            vec![],
        ),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "body": row.get::<_, String>(3)?,
                "createdAt": row.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(list) => ok(&req.id, json!({ "notifications": list })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_activity_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(100);

    let mut stmt = match conn.prepare(
        "SELECT id, actor_id, action, details, created_at FROM activity_log
         ORDER BY created_at DESC LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit], |row| {
            let details_raw: Option<String> = row.get(3)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "actorId": row.get::<_, Option<String>>(1)?,
                "action": row.get::<_, String>(2)?,
                "details": details_raw
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok())
                    .unwrap_or(serde_json::Value::Null),
                "createdAt": row.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(list) => ok(&req.id, json!({ "activity": list })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(handle_notifications_list(state, req)),
        "activity.list" => Some(handle_activity_list(state, req)),
        _ => None,
    }
}
