use crate::auth::{Role, Session};
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    check_allowed_fields, get_opt_i64, get_opt_str, get_required_str, now_naive, require_db,
    require_session,
};
use crate::ipc::types::{AppState, Request};
use crate::rules::{
    self, ClaseEstado, ClaseTipo, EstudianteEstado, SideEffect, SlotRequest, SlotVerdict,
};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

/// A class as reported on the wire: `estado` carries the lazily promoted
/// value, never the raw stored one.
pub fn class_json(row: &db::ClassRow, now: NaiveDateTime) -> serde_json::Value {
    let estado = reported_estado(row, now);
    json!({
        "id": row.id,
        "estudianteId": row.estudiante_id,
        "instructorId": row.instructor_id,
        "tipo": row.tipo,
        "fecha": row.fecha,
        "hora": row.hora,
        "duracionMinutos": row.duracion_minutos,
        "estado": estado.as_str(),
        "nota": row.nota,
        "observaciones": row.observaciones,
        "updatedAt": row.updated_at,
    })
}

fn reported_estado(row: &db::ClassRow, now: NaiveDateTime) -> ClaseEstado {
    let stored = ClaseEstado::parse(&row.estado).unwrap_or(ClaseEstado::Agendado);
    match (rules::parse_fecha(&row.fecha), rules::parse_hora(&row.hora)) {
        (Some(fecha), Some(hora)) => {
            rules::effective_estado(now, stored, row.nota, fecha, hora, row.duracion_minutos)
        }
        _ => stored,
    }
}

fn verdict_error(verdict: SlotVerdict) -> Result<(), HandlerErr> {
    match verdict {
        SlotVerdict::Free => Ok(()),
        SlotVerdict::Conflict { message } => Err(HandlerErr::new("conflict", message)),
        SlotVerdict::Unavailable { message } => {
            Err(HandlerErr::new("instructor_unavailable", message))
        }
        SlotVerdict::Exceeded { message, limit } => Err(HandlerErr::with_details(
            "hours_exceeded",
            message,
            json!({ "limitMinutos": limit }),
        )),
    }
}

fn load_scoped_class(
    conn: &Connection,
    session: &Session,
    class_id: &str,
) -> Result<db::ClassRow, HandlerErr> {
    db::get_class(conn, &session.scope(), class_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "class not found"))
}

fn student_accepts_classes(conn: &Connection, estudiante_id: &str) -> Result<(), HandlerErr> {
    let student = db::get_student(conn, estudiante_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    if student.estado == EstudianteEstado::Graduado.as_str() {
        return Err(HandlerErr::new(
            "state_locked",
            "graduated students cannot receive new classes",
        ));
    }
    Ok(())
}

/// activo -> en_curso when the first class lands; best effort.
fn sync_student_started(conn: &Connection, estudiante_id: &str, effects: &mut Vec<SideEffect>) {
    let flip = (|| -> anyhow::Result<bool> {
        let Some(student) = db::get_student(conn, estudiante_id)? else {
            return Ok(false);
        };
        Ok(student.estado == "activo"
            && db::count_scheduled_classes(conn, estudiante_id)? >= 1)
    })();
    match flip {
        Ok(false) => {}
        Ok(true) => match db::set_student_estado(conn, estudiante_id, "en_curso") {
            Ok(()) => effects.push(SideEffect::applied("student.en_curso")),
            Err(e) => effects.push(SideEffect::failed("student.en_curso", e.to_string())),
        },
        Err(e) => effects.push(SideEffect::failed("student.en_curso", e.to_string())),
    }
}

/// en_curso -> activo when the last non-suspended class goes away; never
/// touches graduado/inactivo. Best effort.
fn sync_student_stopped(conn: &Connection, estudiante_id: &str, effects: &mut Vec<SideEffect>) {
    let flip = (|| -> anyhow::Result<bool> {
        let Some(student) = db::get_student(conn, estudiante_id)? else {
            return Ok(false);
        };
        Ok(student.estado == "en_curso"
            && db::count_scheduled_classes(conn, estudiante_id)? == 0)
    })();
    match flip {
        Ok(false) => {}
        Ok(true) => match db::set_student_estado(conn, estudiante_id, "activo") {
            Ok(()) => effects.push(SideEffect::applied("student.activo")),
            Err(e) => effects.push(SideEffect::failed("student.activo", e.to_string())),
        },
        Err(e) => effects.push(SideEffect::failed("student.activo", e.to_string())),
    }
}

fn classes_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let estudiante_id = get_opt_str(params, "estudianteId");
    let instructor_id = get_opt_str(params, "instructorId");
    let rows = db::list_classes(
        conn,
        &session.scope(),
        estudiante_id.as_deref(),
        instructor_id.as_deref(),
    )
    .map_err(HandlerErr::db)?;
    let now = now_naive();
    let classes: Vec<serde_json::Value> = rows.iter().map(|r| class_json(r, now)).collect();
    Ok(json!({ "classes": classes }))
}

fn classes_check_slot(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let fecha = get_required_str(params, "fecha")?;
    let hora = get_required_str(params, "hora")?;
    if rules::parse_fecha(&fecha).is_none() {
        return Err(HandlerErr::new("bad_params", "fecha must be YYYY-MM-DD"));
    }
    if rules::parse_hora(&hora).is_none() {
        return Err(HandlerErr::new("bad_params", "hora must be HH:MM"));
    }
    let tipo = match get_opt_str(params, "tipo") {
        Some(t) => Some(
            ClaseTipo::parse(&t)
                .ok_or_else(|| HandlerErr::new("bad_params", format!("unknown tipo: {}", t)))?,
        ),
        None => None,
    };

    let slot = SlotRequest {
        fecha,
        hora,
        estudiante_id: get_opt_str(params, "estudianteId"),
        instructor_id: get_opt_str(params, "instructorId"),
        tipo,
        duracion_minutos: get_opt_i64(params, "duracionMinutos"),
        exclude_id: get_opt_str(params, "excludeId"),
    };
    let verdict = rules::validate_slot(conn, &slot).map_err(HandlerErr::db)?;
    let body = match verdict {
        SlotVerdict::Free => json!({ "conflict": false, "available": true, "exceeded": false }),
        SlotVerdict::Conflict { message } => {
            json!({ "conflict": true, "available": true, "exceeded": false, "message": message })
        }
        SlotVerdict::Unavailable { message } => {
            json!({ "conflict": false, "available": false, "exceeded": false, "message": message })
        }
        SlotVerdict::Exceeded { message, .. } => {
            json!({ "conflict": false, "available": true, "exceeded": true, "message": message })
        }
    };
    Ok(body)
}

fn classes_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(
        params,
        "classId",
        &[
            "estudianteId",
            "instructorId",
            "tipo",
            "fecha",
            "hora",
            "duracionMinutos",
            "observaciones",
        ],
    )?;
    let estudiante_id = get_required_str(params, "estudianteId")?;
    let tipo_raw = get_required_str(params, "tipo")?;
    let fecha = get_required_str(params, "fecha")?;
    let hora = get_required_str(params, "hora")?;

    // Instructors schedule for themselves only; admin picks any instructor.
    let instructor_id = match (&session.instructor_id, get_opt_str(params, "instructorId")) {
        (Some(own), Some(requested)) if requested != *own => {
            return Err(HandlerErr::new(
                "forbidden",
                "instructors can only schedule their own classes",
            ));
        }
        (Some(own), _) => own.clone(),
        (None, Some(requested)) => requested,
        (None, None) => return Err(HandlerErr::new("bad_params", "missing instructorId")),
    };

    let tipo = ClaseTipo::parse(&tipo_raw)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("unknown tipo: {}", tipo_raw)))?;
    if rules::parse_fecha(&fecha).is_none() {
        return Err(HandlerErr::new("bad_params", "fecha must be YYYY-MM-DD"));
    }
    if rules::parse_hora(&hora).is_none() {
        return Err(HandlerErr::new("bad_params", "hora must be HH:MM"));
    }
    let duracion = get_opt_i64(params, "duracionMinutos")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing duracionMinutos"))?;
    if duracion <= 0 {
        return Err(HandlerErr::new("bad_params", "duracionMinutos must be positive"));
    }

    student_accepts_classes(conn, &estudiante_id)?;
    db::get_instructor(conn, &instructor_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "instructor not found"))?;

    let slot = SlotRequest {
        fecha: fecha.clone(),
        hora: hora.clone(),
        estudiante_id: Some(estudiante_id.clone()),
        instructor_id: Some(instructor_id.clone()),
        tipo: Some(tipo),
        duracion_minutos: Some(duracion),
        exclude_id: None,
    };
    verdict_error(rules::validate_slot(conn, &slot).map_err(HandlerErr::db)?)?;

    let class_id = Uuid::new_v4().to_string();
    let observaciones = get_opt_str(params, "observaciones");
    conn.execute(
        "INSERT INTO classes(id, estudiante_id, instructor_id, tipo, fecha, hora,
                             duracion_minutos, estado, nota, observaciones, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'agendado', NULL, ?, datetime('now'))",
        (
            &class_id,
            &estudiante_id,
            &instructor_id,
            tipo.as_str(),
            &fecha,
            &hora,
            duracion,
            &observaciones,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "classes" }))
    })?;

    let mut side_effects = Vec::new();
    sync_student_started(conn, &estudiante_id, &mut side_effects);

    let outcome = rules::recompute_progress(conn, &estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    side_effects.extend(outcome.side_effects);

    let row = load_scoped_class(conn, session, &class_id)?;
    Ok(json!({
        "class": class_json(&row, now_naive()),
        "progress": super::progress::progress_json(&outcome.progress),
        "sideEffects": side_effects,
    }))
}

fn classes_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_fields = [
        "fecha",
        "hora",
        "estudianteId",
        "instructorId",
        "tipo",
        "duracionMinutos",
        "nota",
        "observaciones",
        "estado",
    ];
    let instructor_fields = ["fecha", "hora", "duracionMinutos", "observaciones"];
    match session.role() {
        Role::Admin => check_allowed_fields(params, "classId", &admin_fields)?,
        Role::Instructor => check_allowed_fields(params, "classId", &instructor_fields)?,
    }

    let class_id = get_required_str(params, "classId")?;
    let current = load_scoped_class(conn, session, &class_id)?;

    // Graded and suspended rows are immutable except by admin.
    if session.role() == Role::Instructor
        && (current.estado == "cursado" || current.estado == "suspendida")
    {
        return Err(HandlerErr::new(
            "state_locked",
            format!("a {} class can only be edited by an admin", current.estado),
        ));
    }

    let estudiante_id = get_opt_str(params, "estudianteId").unwrap_or_else(|| current.estudiante_id.clone());
    let instructor_id = get_opt_str(params, "instructorId").unwrap_or_else(|| current.instructor_id.clone());
    let fecha = get_opt_str(params, "fecha").unwrap_or_else(|| current.fecha.clone());
    let hora = get_opt_str(params, "hora").unwrap_or_else(|| current.hora.clone());
    let tipo_raw = get_opt_str(params, "tipo").unwrap_or_else(|| current.tipo.clone());
    let duracion = get_opt_i64(params, "duracionMinutos").unwrap_or(current.duracion_minutos);

    let tipo = ClaseTipo::parse(&tipo_raw)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("unknown tipo: {}", tipo_raw)))?;
    if rules::parse_fecha(&fecha).is_none() {
        return Err(HandlerErr::new("bad_params", "fecha must be YYYY-MM-DD"));
    }
    if rules::parse_hora(&hora).is_none() {
        return Err(HandlerErr::new("bad_params", "hora must be HH:MM"));
    }
    if duracion <= 0 {
        return Err(HandlerErr::new("bad_params", "duracionMinutos must be positive"));
    }

    let nota = match params.get("nota") {
        None => current.nota,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| HandlerErr::new("bad_params", "nota must be a number"))?;
            if !rules::nota_valida(n) {
                return Err(HandlerErr::new("bad_params", "nota must be between 0 and 100"));
            }
            Some(n)
        }
    };

    // Grade edits never reach a graduated student's record.
    if params.get("nota").is_some() {
        let student = db::get_student(conn, &current.estudiante_id)
            .map_err(HandlerErr::db)?
            .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
        if student.estado == "graduado" {
            return Err(HandlerErr::new(
                "state_locked",
                "graduated students cannot receive grade edits",
            ));
        }
    }

    let estado = match get_opt_str(params, "estado") {
        None => current.estado.clone(),
        Some(e) => {
            let parsed = ClaseEstado::parse(&e)
                .ok_or_else(|| HandlerErr::new("bad_params", format!("unknown estado: {}", e)))?;
            if parsed == ClaseEstado::PorCalificar {
                return Err(HandlerErr::new(
                    "bad_params",
                    "por_calificar is derived from the schedule and cannot be stored",
                ));
            }
            if parsed == ClaseEstado::Cursado && nota.is_none() {
                return Err(HandlerErr::new("bad_params", "a cursado class requires a nota"));
            }
            e
        }
    };

    if estudiante_id != current.estudiante_id {
        student_accepts_classes(conn, &estudiante_id)?;
    }
    if instructor_id != current.instructor_id {
        db::get_instructor(conn, &instructor_id)
            .map_err(HandlerErr::db)?
            .ok_or_else(|| HandlerErr::new("not_found", "instructor not found"))?;
    }

    // Schedule-affecting edits re-run the full validation, excluding the row
    // being edited.
    let schedule_changed = fecha != current.fecha
        || hora != current.hora
        || estudiante_id != current.estudiante_id
        || instructor_id != current.instructor_id
        || tipo.as_str() != current.tipo
        || duracion != current.duracion_minutos;
    if schedule_changed {
        let slot = SlotRequest {
            fecha: fecha.clone(),
            hora: hora.clone(),
            estudiante_id: Some(estudiante_id.clone()),
            instructor_id: Some(instructor_id.clone()),
            tipo: Some(tipo),
            duracion_minutos: Some(duracion),
            exclude_id: Some(class_id.clone()),
        };
        verdict_error(rules::validate_slot(conn, &slot).map_err(HandlerErr::db)?)?;
    }

    let observaciones = match params.get("observaciones") {
        None => current.observaciones.clone(),
        Some(v) if v.is_null() => None,
        Some(v) => v.as_str().map(|s| s.to_string()),
    };

    conn.execute(
        "UPDATE classes SET estudiante_id = ?, instructor_id = ?, tipo = ?, fecha = ?,
                hora = ?, duracion_minutos = ?, estado = ?, nota = ?, observaciones = ?,
                updated_at = datetime('now')
         WHERE id = ?",
        (
            &estudiante_id,
            &instructor_id,
            tipo.as_str(),
            &fecha,
            &hora,
            duracion,
            &estado,
            nota,
            &observaciones,
            &class_id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let mut side_effects = Vec::new();
    let outcome = rules::recompute_progress(conn, &estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    side_effects.extend(outcome.side_effects);
    if estudiante_id != current.estudiante_id {
        // The class moved: the previous owner's aggregates shrink too.
        let previous = rules::recompute_progress(conn, &current.estudiante_id)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        side_effects.extend(previous.side_effects);
        sync_student_stopped(conn, &current.estudiante_id, &mut side_effects);
        sync_student_started(conn, &estudiante_id, &mut side_effects);
    }

    let row = load_scoped_class(conn, session, &class_id)?;
    Ok(json!({
        "class": class_json(&row, now_naive()),
        "progress": super::progress::progress_json(&outcome.progress),
        "sideEffects": side_effects,
    }))
}

fn classes_grade(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(params, "classId", &["nota", "observaciones"])?;
    let class_id = get_required_str(params, "classId")?;
    let nota = params
        .get("nota")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing nota"))?;
    if !rules::nota_valida(nota) {
        return Err(HandlerErr::new("bad_params", "nota must be between 0 and 100"));
    }

    let current = load_scoped_class(conn, session, &class_id)?;

    // First-time grading of a pending class completes history and stays open
    // even after auto-graduation; only re-grading is locked (see
    // classes.update for the nota-edit lock).
    match reported_estado(&current, now_naive()) {
        ClaseEstado::PorCalificar => {}
        ClaseEstado::Agendado => {
            return Err(HandlerErr::new(
                "state_locked",
                "the class has not finished yet",
            ))
        }
        ClaseEstado::Cursado => {
            return Err(HandlerErr::new("state_locked", "the class is already graded"))
        }
        ClaseEstado::Suspendida => {
            return Err(HandlerErr::new("state_locked", "the class is suspended"))
        }
    }

    let observaciones = get_opt_str(params, "observaciones");
    conn.execute(
        "UPDATE classes SET estado = 'cursado', nota = ?,
                observaciones = COALESCE(?, observaciones),
                updated_at = datetime('now')
         WHERE id = ?",
        (nota, &observaciones, &class_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let outcome = rules::recompute_progress(conn, &current.estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let row = load_scoped_class(conn, session, &class_id)?;
    Ok(json!({
        "class": class_json(&row, now_naive()),
        "progress": super::progress::progress_json(&outcome.progress),
        "sideEffects": outcome.side_effects,
    }))
}

/// Admin delete removes the row; an instructor "delete" soft-suspends, and
/// only from agendado/por_calificar.
fn classes_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let current = load_scoped_class(conn, session, &class_id)?;

    match session.role() {
        Role::Admin => {
            conn.execute("DELETE FROM classes WHERE id = ?", [&class_id])
                .map_err(|e| {
                    HandlerErr::with_details(
                        "db_delete_failed",
                        e.to_string(),
                        json!({ "table": "classes" }),
                    )
                })?;
        }
        Role::Instructor => {
            if current.estado != "agendado" {
                return Err(HandlerErr::new(
                    "state_locked",
                    format!("a {} class cannot be suspended", current.estado),
                ));
            }
            conn.execute(
                "UPDATE classes SET estado = 'suspendida', updated_at = datetime('now')
                 WHERE id = ?",
                [&class_id],
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
    }

    let mut side_effects = Vec::new();
    sync_student_stopped(conn, &current.estudiante_id, &mut side_effects);

    let outcome = rules::recompute_progress(conn, &current.estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    side_effects.extend(outcome.side_effects);

    Ok(json!({
        "ok": true,
        "suspended": session.role() == Role::Instructor,
        "progress": super::progress::progress_json(&outcome.progress),
        "sideEffects": side_effects,
    }))
}

fn handle(
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

fn handle_check_slot(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_session(state) {
        return e.response(&req.id);
    }
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match classes_check_slot(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle(state, req, classes_list)),
        "classes.checkSlot" => Some(handle_check_slot(state, req)),
        "classes.create" => Some(handle(state, req, classes_create)),
        "classes.update" => Some(handle(state, req, classes_update)),
        "classes.grade" => Some(handle(state, req, classes_grade)),
        "classes.delete" => Some(handle(state, req, classes_delete)),
        _ => None,
    }
}
