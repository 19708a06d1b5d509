use rusqlite::Connection;

use crate::auth::{Role, Session};
use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_session(state: &AppState) -> Result<&Session, HandlerErr> {
    state
        .session
        .as_ref()
        .ok_or_else(|| HandlerErr::new("auth_required", "sign in first"))
}

pub fn require_admin(state: &AppState) -> Result<&Session, HandlerErr> {
    let session = require_session(state)?;
    if session.role() != Role::Admin {
        return Err(HandlerErr::new(
            "forbidden",
            "this operation requires the admin role",
        ));
    }
    Ok(session)
}

/// Explicit per-role field allow-list for update-style methods. Any param
/// outside the list (besides the id key) is rejected before the rule
/// components see the request.
pub fn check_allowed_fields(
    params: &serde_json::Value,
    id_key: &str,
    allowed: &[&str],
) -> Result<(), HandlerErr> {
    let Some(map) = params.as_object() else {
        return Err(HandlerErr::new("bad_params", "params must be an object"));
    };
    for key in map.keys() {
        if key == id_key {
            continue;
        }
        if !allowed.contains(&key.as_str()) {
            return Err(HandlerErr::new(
                "bad_params",
                format!("field not allowed for this role: {}", key),
            ));
        }
    }
    Ok(())
}

pub fn now_naive() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}
