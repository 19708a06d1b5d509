use crate::auth::{self, Session};
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, require_admin, require_db};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn session_json(session: &Session) -> serde_json::Value {
    json!({
        "userId": session.user_id,
        "email": session.email,
        "role": session.role().as_str(),
        "instructorId": session.instructor_id,
    })
}

/// First-run bootstrap: allowed only while the credential store is empty.
/// The identity it creates has no instructor link, which is what makes it
/// the admin.
fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match get_required_str(&req.params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match auth::user_count(conn) {
        Ok(0) => {}
        Ok(_) => {
            return err(
                &req.id,
                "forbidden",
                "registration is only open for the first admin account",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let user_id = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().to_string();
    let hash = auth::hash_password(&salt, &password);
    if let Err(e) = conn.execute(
        "INSERT INTO app_users(id, email, salt, password_hash, created_at)
         VALUES(?, ?, ?, ?, datetime('now'))",
        (&user_id, &email, &salt, &hash),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "app_users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id, "email": email }))
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match get_required_str(&req.params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let user = match auth::get_user_by_email(conn, &email) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user) = user else {
        state.session = None;
        return err(&req.id, "login_denied", "invalid credentials", None);
    };
    if !auth::verify_password(&user, &password) {
        state.session = None;
        return err(&req.id, "login_denied", "invalid credentials", None);
    }

    let instructor = match db::get_instructor_by_user(conn, &user.id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(instructor) = &instructor {
        // Deactivated instructors are locked out at the login boundary; any
        // live session for them is dropped right here.
        if instructor.estado == "inactivo" {
            state.session = None;
            return err(
                &req.id,
                "login_denied",
                "instructor account is deactivated",
                None,
            );
        }
    }

    let session = Session {
        user_id: user.id,
        email: user.email,
        instructor_id: instructor.map(|i| i.id),
    };
    let body = session_json(&session);
    state.session = Some(session);
    ok(&req.id, body)
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

fn handle_me(state: &mut AppState, req: &Request) -> serde_json::Value {
    match &state.session {
        Some(session) => ok(
            &req.id,
            json!({ "authenticated": true, "user": session_json(session) }),
        ),
        None => ok(&req.id, json!({ "authenticated": false })),
    }
}

fn activate_instructor_login(
    conn: &rusqlite::Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let instructor_id = get_required_str(params, "instructorId")?;
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;

    let instructor = db::get_instructor(conn, &instructor_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "instructor not found"))?;

    let existing = auth::get_user_by_email(conn, &email).map_err(HandlerErr::db)?;
    let user_id = match existing {
        Some(user) => {
            // Re-activation path: only this instructor's own login may have
            // its password updated through here.
            if instructor.user_id.as_deref() != Some(user.id.as_str()) {
                return Err(HandlerErr::new("conflict", "email is already in use"));
            }
            let salt = Uuid::new_v4().to_string();
            let hash = auth::hash_password(&salt, &password);
            conn.execute(
                "UPDATE app_users SET salt = ?, password_hash = ? WHERE id = ?",
                (&salt, &hash, &user.id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            user.id
        }
        None => {
            let user_id = Uuid::new_v4().to_string();
            let salt = Uuid::new_v4().to_string();
            let hash = auth::hash_password(&salt, &password);
            conn.execute(
                "INSERT INTO app_users(id, email, salt, password_hash, created_at)
                 VALUES(?, ?, ?, ?, datetime('now'))",
                (&user_id, &email, &salt, &hash),
            )
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
            user_id
        }
    };

    conn.execute(
        "UPDATE instructors SET user_id = ? WHERE id = ?",
        (&user_id, &instructor_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "instructorId": instructor_id, "userId": user_id, "email": email }))
}

fn handle_activate_instructor_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state) {
        return e.response(&req.id);
    }
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match activate_instructor_login(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.register" => Some(handle_register(state, req)),
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.me" => Some(handle_me(state, req)),
        "auth.activateInstructorLogin" => Some(handle_activate_instructor_login(state, req)),
        _ => None,
    }
}
