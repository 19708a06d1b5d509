use crate::auth::Session;
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    check_allowed_fields, get_required_str, require_admin, require_db, require_session,
};
use crate::ipc::types::{AppState, Request};
use crate::rules;
use rusqlite::Connection;
use serde_json::json;

pub fn progress_json(row: &db::ProgressRow) -> serde_json::Value {
    json!({
        "estudianteId": row.estudiante_id,
        "minutosPracticasRealizadas": row.minutos_practicas_realizadas,
        "minutosTeoricasRealizadas": row.minutos_teoricas_realizadas,
        "horasPracticasRequeridas": row.horas_practicas_requeridas,
        "horasTeoricasRequeridas": row.horas_teoricas_requeridas,
        "horasPenalizacionPracticas": row.horas_penalizacion_practicas,
        "horasPenalizacionTeoricas": row.horas_penalizacion_teoricas,
        "porcentajeAvance": row.porcentaje_avance,
        "notaFinal": row.nota_final,
        "aprobado": row.aprobado,
        "reintentos": row.reintentos,
    })
}

fn visible_student(
    conn: &Connection,
    session: &Session,
    estudiante_id: &str,
) -> Result<(), HandlerErr> {
    let exists = db::get_student(conn, estudiante_id)
        .map_err(HandlerErr::db)?
        .is_some();
    if !exists
        || !db::student_visible(conn, &session.scope(), estudiante_id).map_err(HandlerErr::db)?
    {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    Ok(())
}

fn progress_get(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let estudiante_id = get_required_str(params, "estudianteId")?;
    visible_student(conn, session, &estudiante_id)?;
    let row = db::get_progress(conn, &estudiante_id)
        .map_err(HandlerErr::db)?
        .unwrap_or_else(|| db::ProgressRow::empty(&estudiante_id));
    Ok(json!({ "progress": progress_json(&row) }))
}

fn progress_recompute(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let estudiante_id = get_required_str(params, "estudianteId")?;
    visible_student(conn, session, &estudiante_id)?;
    let outcome = rules::recompute_progress(conn, &estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({
        "progress": progress_json(&outcome.progress),
        "sideEffects": outcome.side_effects,
    }))
}

/// Requirement and penalty-hour edits share one path so the exam lock is
/// enforced in a single place: any graded final exam freezes them.
fn progress_set_requirements(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(
        params,
        "estudianteId",
        &[
            "horasPracticasRequeridas",
            "horasTeoricasRequeridas",
            "horasPenalizacionPracticas",
            "horasPenalizacionTeoricas",
        ],
    )?;
    let estudiante_id = get_required_str(params, "estudianteId")?;
    db::get_student(conn, &estudiante_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;

    let current = db::get_progress(conn, &estudiante_id)
        .map_err(HandlerErr::db)?
        .unwrap_or_else(|| db::ProgressRow::empty(&estudiante_id));
    if current.nota_final.is_some() {
        return Err(HandlerErr::new(
            "state_locked",
            "requirements are locked once the final exam is graded",
        ));
    }

    let base_field = |key: &str, current: Option<i64>| -> Result<Option<i64>, HandlerErr> {
        match params.get(key) {
            None => Ok(current),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => {
                let n = v
                    .as_i64()
                    .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be an integer", key)))?;
                if n < 0 {
                    return Err(HandlerErr::new(
                        "bad_params",
                        format!("{} must not be negative", key),
                    ));
                }
                Ok(Some(n))
            }
        }
    };
    let penalty_field = |key: &str, current: i64| -> Result<i64, HandlerErr> {
        Ok(base_field(key, Some(current))?.unwrap_or(0))
    };

    let base_practicas = base_field("horasPracticasRequeridas", current.horas_practicas_requeridas)?;
    let base_teoricas = base_field("horasTeoricasRequeridas", current.horas_teoricas_requeridas)?;
    let pen_practicas =
        penalty_field("horasPenalizacionPracticas", current.horas_penalizacion_practicas)?;
    let pen_teoricas =
        penalty_field("horasPenalizacionTeoricas", current.horas_penalizacion_teoricas)?;

    db::upsert_progress_requirements(
        conn,
        &estudiante_id,
        base_practicas,
        base_teoricas,
        pen_practicas,
        pen_teoricas,
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let outcome = rules::recompute_progress(conn, &estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({
        "progress": progress_json(&outcome.progress),
        "sideEffects": outcome.side_effects,
    }))
}

fn handle_scoped(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &Session, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s.clone(),
        Err(e) => return e.response(&req.id),
    };
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match f(conn, &session, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_set_requirements(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state) {
        return e.response(&req.id);
    }
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match progress_set_requirements(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "progress.get" => Some(handle_scoped(state, req, progress_get)),
        "progress.recompute" => Some(handle_scoped(state, req, progress_recompute)),
        "progress.setRequirements" => Some(handle_set_requirements(state, req)),
        _ => None,
    }
}
