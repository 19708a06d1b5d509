use crate::auth::Session;
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    check_allowed_fields, get_opt_i64, get_required_str, require_admin, require_db,
    require_session,
};
use crate::ipc::types::{AppState, Request};
use crate::rules::{self, ClaseTipo, CourseRequirements, Promedios, RealizedMinutes};
use rusqlite::Connection;
use serde_json::json;

use super::progress::progress_json;

fn promedios_for(conn: &Connection, estudiante_id: &str) -> Result<Promedios, HandlerErr> {
    let notas = db::list_graded_notas(conn, estudiante_id).map_err(HandlerErr::db)?;
    Ok(rules::promedios_por_tipo(notas.into_iter().filter_map(
        |(tipo, nota)| ClaseTipo::parse(&tipo).map(|t| (t, nota)),
    )))
}

fn gate_for(
    conn: &Connection,
    estudiante_id: &str,
) -> Result<(db::ProgressRow, rules::Elegibilidad), HandlerErr> {
    // Refresh aggregates first so the gate never judges stale minutes.
    let outcome = rules::recompute_progress(conn, estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    let row = outcome.progress;
    let reqs = CourseRequirements::from_progress(&row);
    let realized = RealizedMinutes {
        practicas: row.minutos_practicas_realizadas,
        teoricas: row.minutos_teoricas_realizadas,
    };
    let promedios = promedios_for(conn, estudiante_id)?;
    let gate = rules::elegibilidad_examen(&reqs, realized, &promedios);
    Ok((row, gate))
}

fn exam_eligibility(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let estudiante_id = get_required_str(params, "estudianteId")?;
    let exists = db::get_student(conn, &estudiante_id)
        .map_err(HandlerErr::db)?
        .is_some();
    if !exists
        || !db::student_visible(conn, &session.scope(), &estudiante_id).map_err(HandlerErr::db)?
    {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    let (row, gate) = gate_for(conn, &estudiante_id)?;
    Ok(json!({
        "eligible": gate.eligible,
        "reasons": gate.reasons,
        "progress": progress_json(&row),
    }))
}

/// Final exam grading is write-once: the row mutates here exactly once and
/// every later submission is rejected until an admin reset after a failure.
fn exam_submit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    check_allowed_fields(
        params,
        "estudianteId",
        &[
            "notaFinal",
            "horasPenalizacionPracticas",
            "horasPenalizacionTeoricas",
        ],
    )?;
    let estudiante_id = get_required_str(params, "estudianteId")?;
    db::get_student(conn, &estudiante_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;

    let nota_final = params
        .get("notaFinal")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing notaFinal"))?;
    if !rules::nota_valida(nota_final) {
        return Err(HandlerErr::new(
            "bad_params",
            "notaFinal must be between 0 and 100",
        ));
    }

    let (row, gate) = gate_for(conn, &estudiante_id)?;
    if row.nota_final.is_some() {
        return Err(HandlerErr::new(
            "state_locked",
            "the final exam is already graded",
        ));
    }
    if !gate.eligible {
        return Err(HandlerErr::with_details(
            "not_eligible",
            "the student is not eligible for the final exam",
            json!({ "reasons": gate.reasons }),
        ));
    }

    let aprobado = rules::aprobado_from_nota(nota_final);
    let (reintentos, pen_practicas, pen_teoricas) = if aprobado {
        (
            row.reintentos,
            row.horas_penalizacion_practicas,
            row.horas_penalizacion_teoricas,
        )
    } else {
        // Penalty minutes supplied with the failing grade replace the
        // previous ones and feed the next attempt's required minutes.
        let pen_p = match get_opt_i64(params, "horasPenalizacionPracticas") {
            Some(n) if n < 0 => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "horasPenalizacionPracticas must not be negative",
                ))
            }
            Some(n) => n,
            None => row.horas_penalizacion_practicas,
        };
        let pen_t = match get_opt_i64(params, "horasPenalizacionTeoricas") {
            Some(n) if n < 0 => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "horasPenalizacionTeoricas must not be negative",
                ))
            }
            Some(n) => n,
            None => row.horas_penalizacion_teoricas,
        };
        (row.reintentos + 1, pen_p, pen_t)
    };

    db::update_progress_exam(
        conn,
        &estudiante_id,
        Some(nota_final),
        Some(aprobado),
        reintentos,
        pen_practicas,
        pen_teoricas,
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let mut side_effects = Vec::new();
    if !aprobado {
        // A failed exam reopens the course: a student auto-graduated on
        // hours alone goes back to en_curso so penalty classes can be
        // scheduled. Best effort, like the other estado syncs.
        let sync = (|| -> anyhow::Result<bool> {
            let Some(student) = db::get_student(conn, &estudiante_id)? else {
                return Ok(false);
            };
            Ok(student.estado == "graduado")
        })();
        match sync {
            Ok(false) => {}
            Ok(true) => match db::set_student_estado(conn, &estudiante_id, "en_curso") {
                Ok(()) => side_effects.push(rules::SideEffect::applied("student.en_curso")),
                Err(e) => {
                    side_effects.push(rules::SideEffect::failed("student.en_curso", e.to_string()))
                }
            },
            Err(e) => {
                side_effects.push(rules::SideEffect::failed("student.en_curso", e.to_string()))
            }
        }
    }

    // Re-run the aggregation: new penalties move the percentage, and a pass
    // with complete hours graduates the student here.
    let outcome = rules::recompute_progress(conn, &estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    side_effects.extend(outcome.side_effects);

    Ok(json!({
        "progress": progress_json(&outcome.progress),
        "sideEffects": side_effects,
    }))
}

/// Opens the next attempt cycle after a failed exam. Retries and penalty
/// hours survive the reset; a passed exam is final.
fn exam_reset(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let estudiante_id = get_required_str(params, "estudianteId")?;
    let row = db::get_progress(conn, &estudiante_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student progress not found"))?;

    if row.nota_final.is_none() {
        return Err(HandlerErr::new("bad_params", "there is no final exam to reset"));
    }
    if row.aprobado == Some(true) {
        return Err(HandlerErr::new(
            "state_locked",
            "a passed final exam cannot be reset",
        ));
    }

    db::update_progress_exam(
        conn,
        &estudiante_id,
        None,
        None,
        row.reintentos,
        row.horas_penalizacion_practicas,
        row.horas_penalizacion_teoricas,
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let outcome = rules::recompute_progress(conn, &estudiante_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({
        "progress": progress_json(&outcome.progress),
        "sideEffects": outcome.side_effects,
    }))
}

fn handle_eligibility(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s.clone(),
        Err(e) => return e.response(&req.id),
    };
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match exam_eligibility(conn, &session, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_admin(
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
        "exam.eligibility" => Some(handle_eligibility(state, req)),
        "exam.submit" => Some(handle_admin(state, req, exam_submit)),
        "exam.reset" => Some(handle_admin(state, req, exam_reset)),
        _ => None,
    }
}
