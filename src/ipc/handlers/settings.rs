use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let key = match req.params.get("key").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing key", None),
    };
    let Some(value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };

    // Assessment types are validated on write so the submit path can trust
    // the stored shape.
    if key == "assessment_types" {
        let parsed: Result<Vec<crate::calc::AssessmentType>, _> =
            serde_json::from_value(value.clone());
        match parsed {
            Ok(types) => {
                if types.iter().any(|t| t.id.trim().is_empty()) {
                    return err(&req.id, "bad_params", "assessment type id is empty", None);
                }
            }
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("assessment_types is malformed: {}", e),
                    None,
                )
            }
        }
    }

    match db::settings_set_json(conn, &key, value) {
        Ok(()) => ok(&req.id, json!({ "key": key })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let key = match req.params.get("key").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim(),
        _ => return err(&req.id, "bad_params", "missing key", None),
    };

    match db::settings_get_json(conn, key) {
        Ok(value) => ok(
            &req.id,
            json!({ "key": key, "value": value.unwrap_or(serde_json::Value::Null) }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.set" => Some(handle_settings_set(state, req)),
        "settings.get" => Some(handle_settings_get(state, req)),
        _ => None,
    }
}
