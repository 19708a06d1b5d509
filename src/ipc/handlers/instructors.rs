use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    check_allowed_fields, get_opt_str, get_required_str, require_admin, require_db,
    require_session,
};
use crate::ipc::types::{AppState, Request};
use crate::rules;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

pub fn instructor_json(row: &db::InstructorRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "nombre": row.nombre,
        "email": row.email,
        "estado": row.estado,
        "horaInicio": row.hora_inicio,
        "horaFin": row.hora_fin,
        "hasLogin": row.user_id.is_some(),
    })
}

/// Window bounds are optional, but whatever is present must parse, and a
/// complete window must be ordered.
fn validate_window(
    hora_inicio: Option<&str>,
    hora_fin: Option<&str>,
) -> Result<(), HandlerErr> {
    let inicio = match hora_inicio {
        Some(s) => Some(rules::parse_hora(s).ok_or_else(|| {
            HandlerErr::new("bad_params", format!("horaInicio is not a valid time: {}", s))
        })?),
        None => None,
    };
    let fin = match hora_fin {
        Some(s) => Some(rules::parse_hora(s).ok_or_else(|| {
            HandlerErr::new("bad_params", format!("horaFin is not a valid time: {}", s))
        })?),
        None => None,
    };
    if let (Some(inicio), Some(fin)) = (inicio, fin) {
        if inicio >= fin {
            return Err(HandlerErr::new(
                "bad_params",
                "horaInicio must be before horaFin",
            ));
        }
    }
    Ok(())
}

fn instructors_list(conn: &Connection, scope: &db::Scope) -> Result<serde_json::Value, HandlerErr> {
    let rows = db::list_instructors(conn, scope).map_err(HandlerErr::db)?;
    let instructors: Vec<serde_json::Value> = rows.iter().map(instructor_json).collect();
    Ok(json!({ "instructors": instructors }))
}

fn instructors_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(
        params,
        "instructorId",
        &["nombre", "email", "horaInicio", "horaFin"],
    )?;
    let nombre = get_required_str(params, "nombre")?;
    if nombre.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "nombre must not be empty"));
    }
    let email = get_opt_str(params, "email");
    let hora_inicio = get_opt_str(params, "horaInicio");
    let hora_fin = get_opt_str(params, "horaFin");
    validate_window(hora_inicio.as_deref(), hora_fin.as_deref())?;

    let instructor_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO instructors(id, nombre, email, estado, hora_inicio, hora_fin)
         VALUES(?, ?, ?, 'activo', ?, ?)",
        (&instructor_id, nombre.trim(), &email, &hora_inicio, &hora_fin),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "instructors" }),
        )
    })?;

    let row = db::get_instructor(conn, &instructor_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "instructor not found"))?;
    Ok(json!({ "instructor": instructor_json(&row) }))
}

fn instructors_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(
        params,
        "instructorId",
        &["nombre", "email", "estado", "horaInicio", "horaFin"],
    )?;
    let instructor_id = get_required_str(params, "instructorId")?;
    db::get_instructor(conn, &instructor_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "instructor not found"))?;

    if let Some(estado) = get_opt_str(params, "estado") {
        if estado != "activo" && estado != "inactivo" {
            return Err(HandlerErr::new(
                "bad_params",
                format!("unknown estado: {}", estado),
            ));
        }
    }
    let hora_inicio = get_opt_str(params, "horaInicio");
    let hora_fin = get_opt_str(params, "horaFin");
    validate_window(hora_inicio.as_deref(), hora_fin.as_deref())?;

    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (param, column) in [
        ("nombre", "nombre"),
        ("email", "email"),
        ("estado", "estado"),
        ("horaInicio", "hora_inicio"),
        ("horaFin", "hora_fin"),
    ] {
        // An explicit null clears the column (used to drop a window bound).
        match params.get(param) {
            Some(v) if v.is_null() => {
                sets.push(format!("{} = NULL", column));
            }
            Some(v) => {
                if let Some(s) = v.as_str() {
                    sets.push(format!("{} = ?", column));
                    values.push(rusqlite::types::Value::from(s.to_string()));
                }
            }
            None => {}
        }
    }
    if sets.is_empty() {
        return Err(HandlerErr::new("bad_params", "no fields to update"));
    }
    values.push(rusqlite::types::Value::from(instructor_id.clone()));
    let sql = format!("UPDATE instructors SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let row = db::get_instructor(conn, &instructor_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "instructor not found"))?;
    Ok(json!({ "instructor": instructor_json(&row) }))
}

/// Instructors keep their class history; "delete" deactivates the account,
/// which also locks the login out at the next auth boundary.
fn instructors_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let instructor_id = get_required_str(params, "instructorId")?;
    let changed = conn
        .execute(
            "UPDATE instructors SET estado = 'inactivo' WHERE id = ?",
            [&instructor_id],
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "instructor not found"));
    }
    Ok(json!({ "ok": true }))
}

fn handle_instructors_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s.clone(),
        Err(e) => return e.response(&req.id),
    };
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match instructors_list(conn, &session.scope()) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_admin_mutation(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    if let Err(e) = require_admin(state) {
        return e.response(&req.id);
    }
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "instructors.list" => Some(handle_instructors_list(state, req)),
        "instructors.create" => Some(handle_admin_mutation(state, req, instructors_create)),
        "instructors.update" => Some(handle_admin_mutation(state, req, instructors_update)),
        "instructors.delete" => Some(handle_admin_mutation(state, req, instructors_delete)),
        _ => None,
    }
}
