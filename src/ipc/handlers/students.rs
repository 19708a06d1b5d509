use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    check_allowed_fields, get_opt_str, get_required_str, require_admin, require_db,
    require_session,
};
use crate::ipc::types::{AppState, Request};
use crate::rules::EstudianteEstado;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

pub fn student_json(row: &db::StudentRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "nombre": row.nombre,
        "email": row.email,
        "telefono": row.telefono,
        "estado": row.estado,
        "createdAt": row.created_at,
    })
}

fn students_list(conn: &Connection, scope: &db::Scope) -> Result<serde_json::Value, HandlerErr> {
    let rows = db::list_students(conn, scope).map_err(HandlerErr::db)?;
    let students: Vec<serde_json::Value> = rows.iter().map(student_json).collect();
    Ok(json!({ "students": students }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(params, "estudianteId", &["nombre", "email", "telefono"])?;
    let nombre = get_required_str(params, "nombre")?;
    if nombre.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "nombre must not be empty"));
    }
    let email = get_opt_str(params, "email");
    let telefono = get_opt_str(params, "telefono");

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, nombre, email, telefono, estado, created_at)
         VALUES(?, ?, ?, ?, 'activo', datetime('now'))",
        (&student_id, nombre.trim(), &email, &telefono),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    let row = db::get_student(conn, &student_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    Ok(json!({ "student": student_json(&row) }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(params, "estudianteId", &["nombre", "email", "telefono", "estado"])?;
    let student_id = get_required_str(params, "estudianteId")?;
    db::get_student(conn, &student_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;

    if let Some(estado) = get_opt_str(params, "estado") {
        if EstudianteEstado::parse(&estado).is_none() {
            return Err(HandlerErr::new(
                "bad_params",
                format!("unknown estado: {}", estado),
            ));
        }
    }

    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for field in ["nombre", "email", "telefono", "estado"] {
        if let Some(v) = get_opt_str(params, field) {
            sets.push(format!("{} = ?", field));
            values.push(rusqlite::types::Value::from(v));
        }
    }
    if sets.is_empty() {
        return Err(HandlerErr::new("bad_params", "no fields to update"));
    }
    values.push(rusqlite::types::Value::from(student_id.clone()));
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let row = db::get_student(conn, &student_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    Ok(json!({ "student": student_json(&row) }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "estudianteId")?;
    db::get_student(conn, &student_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (sql, table) in [
        (
            "DELETE FROM student_progress WHERE estudiante_id = ?",
            "student_progress",
        ),
        ("DELETE FROM classes WHERE estudiante_id = ?", "classes"),
        ("DELETE FROM students WHERE id = ?", "students"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": table }),
            ));
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s.clone(),
        Err(e) => return e.response(&req.id),
    };
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match students_list(conn, &session.scope()) {
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
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_admin_mutation(state, req, students_create)),
        "students.update" => Some(handle_admin_mutation(state, req, students_update)),
        "students.delete" => Some(handle_admin_mutation(state, req, students_delete)),
        _ => None,
    }
}
