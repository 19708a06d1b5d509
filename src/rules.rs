use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::Connection;
use serde::Serialize;

use crate::db;

/// Passing threshold for class averages and the final exam.
pub const NOTA_MINIMA: f64 = 51.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaseTipo {
    Practica,
    Teorica,
}

impl ClaseTipo {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaseTipo::Practica => "practica",
            ClaseTipo::Teorica => "teorica",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "practica" => Some(ClaseTipo::Practica),
            "teorica" => Some(ClaseTipo::Teorica),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaseEstado {
    Agendado,
    PorCalificar,
    Cursado,
    Suspendida,
}

impl ClaseEstado {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaseEstado::Agendado => "agendado",
            ClaseEstado::PorCalificar => "por_calificar",
            ClaseEstado::Cursado => "cursado",
            ClaseEstado::Suspendida => "suspendida",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agendado" => Some(ClaseEstado::Agendado),
            "por_calificar" => Some(ClaseEstado::PorCalificar),
            "cursado" => Some(ClaseEstado::Cursado),
            "suspendida" => Some(ClaseEstado::Suspendida),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstudianteEstado {
    Activo,
    EnCurso,
    Graduado,
    Inactivo,
}

impl EstudianteEstado {
    pub fn as_str(self) -> &'static str {
        match self {
            EstudianteEstado::Activo => "activo",
            EstudianteEstado::EnCurso => "en_curso",
            EstudianteEstado::Graduado => "graduado",
            EstudianteEstado::Inactivo => "inactivo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activo" => Some(EstudianteEstado::Activo),
            "en_curso" => Some(EstudianteEstado::EnCurso),
            "graduado" => Some(EstudianteEstado::Graduado),
            "inactivo" => Some(EstudianteEstado::Inactivo),
            _ => None,
        }
    }
}

pub fn parse_fecha(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn parse_hora(s: &str) -> Option<NaiveTime> {
    let t = s.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .ok()
}

pub fn class_end(fecha: NaiveDate, hora: NaiveTime, duracion_minutos: i64) -> NaiveDateTime {
    fecha.and_time(hora) + Duration::minutes(duracion_minutos)
}

/// Lazy agendado -> por_calificar promotion. Pure function of `(now, class)`;
/// the stored row keeps `agendado` until a grade or suspension lands.
pub fn effective_estado(
    now: NaiveDateTime,
    estado: ClaseEstado,
    nota: Option<f64>,
    fecha: NaiveDate,
    hora: NaiveTime,
    duracion_minutos: i64,
) -> ClaseEstado {
    if estado == ClaseEstado::Agendado
        && nota.is_none()
        && class_end(fecha, hora, duracion_minutos) <= now
    {
        return ClaseEstado::PorCalificar;
    }
    estado
}

/// An instructor availability window. Both bounds must be present for the
/// window to apply; a partial or absent window means always available.
#[derive(Debug, Clone, Copy)]
pub struct Ventana {
    pub inicio: NaiveTime,
    pub fin: NaiveTime,
}

pub fn ventana_permite(ventana: Option<Ventana>, hora: NaiveTime) -> bool {
    match ventana {
        None => true,
        Some(v) => v.inicio <= hora && hora < v.fin,
    }
}

/// Per-student course requirements, resolved once at the progress boundary.
/// `base_*` is None while unconfigured; there is no silent defaulting and the
/// hours ceiling is skipped for an unconfigured type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CourseRequirements {
    pub base_practicas: Option<i64>,
    pub base_teoricas: Option<i64>,
    pub penalizacion_practicas: i64,
    pub penalizacion_teoricas: i64,
}

impl CourseRequirements {
    pub fn from_progress(row: &db::ProgressRow) -> Self {
        CourseRequirements {
            base_practicas: row.horas_practicas_requeridas,
            base_teoricas: row.horas_teoricas_requeridas,
            penalizacion_practicas: row.horas_penalizacion_practicas,
            penalizacion_teoricas: row.horas_penalizacion_teoricas,
        }
    }

    /// base + penalty for a type, or None while the base is unconfigured.
    pub fn required_for(&self, tipo: ClaseTipo) -> Option<i64> {
        match tipo {
            ClaseTipo::Practica => self
                .base_practicas
                .map(|b| b + self.penalizacion_practicas),
            ClaseTipo::Teorica => self.base_teoricas.map(|b| b + self.penalizacion_teoricas),
        }
    }

    pub fn total_required(&self) -> i64 {
        self.required_for(ClaseTipo::Practica).unwrap_or(0)
            + self.required_for(ClaseTipo::Teorica).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealizedMinutes {
    pub practicas: i64,
    pub teoricas: i64,
}

impl RealizedMinutes {
    pub fn for_tipo(&self, tipo: ClaseTipo) -> i64 {
        match tipo {
            ClaseTipo::Practica => self.practicas,
            ClaseTipo::Teorica => self.teoricas,
        }
    }

    pub fn total(&self) -> i64 {
        self.practicas + self.teoricas
    }
}

pub fn porcentaje_avance(realized: RealizedMinutes, reqs: &CourseRequirements) -> i64 {
    let total_required = reqs.total_required();
    if total_required <= 0 {
        return 0;
    }
    let pct = (100.0 * realized.total() as f64 / total_required as f64).round() as i64;
    pct.clamp(0, 100)
}

/// Hours ceiling for one scheduling request. Returns the violated limit when
/// `existing + duracion` would push past base + penalty for the type; None
/// when the addition fits or the type is unconfigured (unlimited).
pub fn exceeds_ceiling(
    reqs: &CourseRequirements,
    tipo: ClaseTipo,
    existing_minutos: i64,
    duracion_minutos: i64,
) -> Option<i64> {
    let limit = reqs.required_for(tipo)?;
    if existing_minutos + duracion_minutos > limit {
        Some(limit)
    } else {
        None
    }
}

/// Auto-graduation predicate. A student who explicitly failed the exam is
/// never auto-graduated, no matter how many hours are logged.
pub fn should_graduate(
    reqs: &CourseRequirements,
    realized: RealizedMinutes,
    aprobado: Option<bool>,
    estado: EstudianteEstado,
) -> bool {
    if aprobado == Some(false) {
        return false;
    }
    if !matches!(
        estado,
        EstudianteEstado::Activo | EstudianteEstado::EnCurso
    ) {
        return false;
    }
    let (Some(req_practicas), Some(req_teoricas)) = (
        reqs.required_for(ClaseTipo::Practica),
        reqs.required_for(ClaseTipo::Teorica),
    ) else {
        return false;
    };
    req_practicas > 0
        && req_teoricas > 0
        && realized.practicas >= req_practicas
        && realized.teoricas >= req_teoricas
}

/// Unweighted mean of `nota` over graded (cursado, non-null) classes, per type.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Promedios {
    pub practicas: Option<f64>,
    pub teoricas: Option<f64>,
}

pub fn promedios_por_tipo<I>(notas: I) -> Promedios
where
    I: IntoIterator<Item = (ClaseTipo, f64)>,
{
    let mut sum_p = 0.0;
    let mut n_p = 0usize;
    let mut sum_t = 0.0;
    let mut n_t = 0usize;
    for (tipo, nota) in notas {
        match tipo {
            ClaseTipo::Practica => {
                sum_p += nota;
                n_p += 1;
            }
            ClaseTipo::Teorica => {
                sum_t += nota;
                n_t += 1;
            }
        }
    }
    Promedios {
        practicas: (n_p > 0).then(|| sum_p / n_p as f64),
        teoricas: (n_t > 0).then(|| sum_t / n_t as f64),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Elegibilidad {
    pub eligible: bool,
    pub reasons: Vec<String>,
}

/// Exam eligibility gate: hour completion for both types plus a passing
/// average over at least one graded class per type.
pub fn elegibilidad_examen(
    reqs: &CourseRequirements,
    realized: RealizedMinutes,
    promedios: &Promedios,
) -> Elegibilidad {
    let mut reasons = Vec::new();

    match reqs.required_for(ClaseTipo::Practica) {
        None => reasons.push("horas practicas requeridas are not configured".to_string()),
        Some(req) => {
            if realized.practicas < req {
                reasons.push(format!(
                    "practical hours incomplete: {} of {} minutes",
                    realized.practicas, req
                ));
            }
        }
    }
    match reqs.required_for(ClaseTipo::Teorica) {
        None => reasons.push("horas teoricas requeridas are not configured".to_string()),
        Some(req) => {
            if realized.teoricas < req {
                reasons.push(format!(
                    "theory hours incomplete: {} of {} minutes",
                    realized.teoricas, req
                ));
            }
        }
    }
    match promedios.practicas {
        None => reasons.push("no graded practical classes".to_string()),
        Some(avg) => {
            if avg < NOTA_MINIMA {
                reasons.push(format!(
                    "practical average {:.1} is below {}",
                    avg, NOTA_MINIMA
                ));
            }
        }
    }
    match promedios.teoricas {
        None => reasons.push("no graded theory classes".to_string()),
        Some(avg) => {
            if avg < NOTA_MINIMA {
                reasons.push(format!("theory average {:.1} is below {}", avg, NOTA_MINIMA));
            }
        }
    }

    Elegibilidad {
        eligible: reasons.is_empty(),
        reasons,
    }
}

pub fn nota_valida(nota: f64) -> bool {
    (0.0..=100.0).contains(&nota)
}

pub fn aprobado_from_nota(nota_final: f64) -> bool {
    nota_final >= NOTA_MINIMA
}

/// Outcome of a best-effort secondary write (student estado sync). Failures
/// here never fail the parent operation; they are surfaced to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffect {
    pub action: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SideEffect {
    pub fn applied(action: &str) -> Self {
        SideEffect {
            action: action.to_string(),
            ok: true,
            detail: None,
        }
    }

    pub fn failed(action: &str, detail: impl Into<String>) -> Self {
        SideEffect {
            action: action.to_string(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug)]
pub struct RecomputeOutcome {
    pub progress: db::ProgressRow,
    pub side_effects: Vec<SideEffect>,
}

/// Recompute a student's progress row from their classes: realized minutes by
/// type (suspended classes excluded), porcentaje_avance against the resolved
/// requirements, and the auto-graduation transition as a best-effort side
/// effect. Pure aggregation; calling it twice with unchanged classes writes
/// the same row twice.
pub fn recompute_progress(conn: &Connection, estudiante_id: &str) -> anyhow::Result<RecomputeOutcome> {
    let realized = db::sum_realized_minutes(conn, estudiante_id, None)?;

    let mut row = db::get_progress(conn, estudiante_id)?
        .unwrap_or_else(|| db::ProgressRow::empty(estudiante_id));
    let reqs = CourseRequirements::from_progress(&row);

    row.minutos_practicas_realizadas = realized.practicas;
    row.minutos_teoricas_realizadas = realized.teoricas;
    row.porcentaje_avance = porcentaje_avance(realized, &reqs);
    db::upsert_progress_realized(conn, &row)?;

    let mut side_effects = Vec::new();
    if let Some(student) = db::get_student(conn, estudiante_id)? {
        let estado = EstudianteEstado::parse(&student.estado)
            .unwrap_or(EstudianteEstado::Inactivo);
        let aprobado = row.aprobado;
        if should_graduate(&reqs, realized, aprobado, estado) {
            match db::set_student_estado(conn, estudiante_id, EstudianteEstado::Graduado.as_str())
            {
                Ok(()) => side_effects.push(SideEffect::applied("student.graduado")),
                Err(e) => side_effects.push(SideEffect::failed("student.graduado", e.to_string())),
            }
        }
    }

    Ok(RecomputeOutcome {
        progress: row,
        side_effects,
    })
}

/// One scheduling request as seen by the validator. Absent optional fields
/// skip the corresponding check (the UI probes with partial data).
#[derive(Debug, Clone, Default)]
pub struct SlotRequest {
    pub fecha: String,
    pub hora: String,
    pub estudiante_id: Option<String>,
    pub instructor_id: Option<String>,
    pub tipo: Option<ClaseTipo>,
    pub duracion_minutos: Option<i64>,
    pub exclude_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotVerdict {
    Free,
    Conflict { message: String },
    Unavailable { message: String },
    Exceeded { message: String, limit: i64 },
}

pub fn validate_slot(conn: &Connection, req: &SlotRequest) -> anyhow::Result<SlotVerdict> {
    let hora = parse_hora(&req.hora);

    // Date/time conflict: another non-suspended class at the identical slot
    // sharing the student or the instructor.
    if req.estudiante_id.is_some() || req.instructor_id.is_some() {
        if let Some(holder) = db::find_slot_holder(
            conn,
            &req.fecha,
            &req.hora,
            req.estudiante_id.as_deref(),
            req.instructor_id.as_deref(),
            req.exclude_id.as_deref(),
        )? {
            let who = match holder {
                db::SlotHolder::Estudiante => "the student",
                db::SlotHolder::Instructor => "the instructor",
            };
            return Ok(SlotVerdict::Conflict {
                message: format!(
                    "schedule conflict: {} already has a class on {} at {}",
                    who, req.fecha, req.hora
                ),
            });
        }
    }

    // Instructor availability window.
    if let (Some(instructor_id), Some(hora)) = (req.instructor_id.as_deref(), hora) {
        if let Some(instructor) = db::get_instructor(conn, instructor_id)? {
            let ventana = match (
                instructor.hora_inicio.as_deref().and_then(parse_hora),
                instructor.hora_fin.as_deref().and_then(parse_hora),
            ) {
                (Some(inicio), Some(fin)) => Some(Ventana { inicio, fin }),
                _ => None,
            };
            if !ventana_permite(ventana, hora) {
                let v = ventana.unwrap();
                return Ok(SlotVerdict::Unavailable {
                    message: format!(
                        "instructor {} is only available between {} and {}",
                        instructor.nombre,
                        v.inicio.format("%H:%M"),
                        v.fin.format("%H:%M")
                    ),
                });
            }
        }
    }

    // Hours ceiling for the student's type, against base + penalty.
    if let (Some(estudiante_id), Some(tipo), Some(duracion)) = (
        req.estudiante_id.as_deref(),
        req.tipo,
        req.duracion_minutos,
    ) {
        if let Some(progress) = db::get_progress(conn, estudiante_id)? {
            let reqs = CourseRequirements::from_progress(&progress);
            let realized =
                db::sum_realized_minutes(conn, estudiante_id, req.exclude_id.as_deref())?;
            if let Some(limit) = exceeds_ceiling(&reqs, tipo, realized.for_tipo(tipo), duracion)
            {
                return Ok(SlotVerdict::Exceeded {
                    message: format!(
                        "adding {} minutes would exceed the {} minute limit for {}",
                        duracion,
                        limit,
                        tipo.as_str()
                    ),
                    limit,
                });
            }
        }
    }

    Ok(SlotVerdict::Free)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fecha(s: &str) -> NaiveDate {
        parse_fecha(s).expect("fecha")
    }

    fn hora(s: &str) -> NaiveTime {
        parse_hora(s).expect("hora")
    }

    #[test]
    fn promotion_only_past_ungraded_agendado() {
        let now = fecha("2024-03-10").and_time(hora("12:00"));
        // Ended 10:00-11:00, no grade yet.
        assert_eq!(
            effective_estado(now, ClaseEstado::Agendado, None, fecha("2024-03-10"), hora("10:00"), 60),
            ClaseEstado::PorCalificar
        );
        // Still running.
        assert_eq!(
            effective_estado(now, ClaseEstado::Agendado, None, fecha("2024-03-10"), hora("11:30"), 60),
            ClaseEstado::Agendado
        );
        // Graded rows are not re-promoted.
        assert_eq!(
            effective_estado(now, ClaseEstado::Cursado, Some(80.0), fecha("2024-03-10"), hora("10:00"), 60),
            ClaseEstado::Cursado
        );
        assert_eq!(
            effective_estado(now, ClaseEstado::Suspendida, None, fecha("2024-03-10"), hora("10:00"), 60),
            ClaseEstado::Suspendida
        );
    }

    #[test]
    fn ventana_half_open_interval() {
        let v = Some(Ventana {
            inicio: hora("08:00"),
            fin: hora("12:00"),
        });
        assert!(ventana_permite(v, hora("08:00")));
        assert!(ventana_permite(v, hora("11:59")));
        assert!(!ventana_permite(v, hora("12:00")));
        assert!(!ventana_permite(v, hora("13:00")));
        assert!(ventana_permite(None, hora("03:00")));
    }

    #[test]
    fn requirements_resolution_and_ceiling() {
        let reqs = CourseRequirements {
            base_practicas: Some(720),
            base_teoricas: None,
            penalizacion_practicas: 120,
            penalizacion_teoricas: 0,
        };
        assert_eq!(reqs.required_for(ClaseTipo::Practica), Some(840));
        assert_eq!(reqs.required_for(ClaseTipo::Teorica), None);
        assert_eq!(reqs.total_required(), 840);

        assert_eq!(exceeds_ceiling(&reqs, ClaseTipo::Practica, 800, 60), Some(840));
        assert_eq!(exceeds_ceiling(&reqs, ClaseTipo::Practica, 780, 60), None);
        // Unconfigured type is unlimited.
        assert_eq!(exceeds_ceiling(&reqs, ClaseTipo::Teorica, 10_000, 60), None);
    }

    #[test]
    fn porcentaje_clamped_and_zero_when_unconfigured() {
        let unconfigured = CourseRequirements::default();
        let realized = RealizedMinutes {
            practicas: 500,
            teoricas: 500,
        };
        assert_eq!(porcentaje_avance(realized, &unconfigured), 0);

        let reqs = CourseRequirements {
            base_practicas: Some(720),
            base_teoricas: Some(600),
            ..Default::default()
        };
        assert_eq!(porcentaje_avance(RealizedMinutes::default(), &reqs), 0);
        assert_eq!(
            porcentaje_avance(
                RealizedMinutes {
                    practicas: 360,
                    teoricas: 300
                },
                &reqs
            ),
            50
        );
        assert_eq!(
            porcentaje_avance(
                RealizedMinutes {
                    practicas: 2000,
                    teoricas: 2000
                },
                &reqs
            ),
            100
        );
    }

    #[test]
    fn graduation_requires_both_types_and_no_failed_exam() {
        let reqs = CourseRequirements {
            base_practicas: Some(120),
            base_teoricas: Some(60),
            ..Default::default()
        };
        let done = RealizedMinutes {
            practicas: 120,
            teoricas: 60,
        };
        assert!(should_graduate(&reqs, done, None, EstudianteEstado::EnCurso));
        assert!(should_graduate(&reqs, done, Some(true), EstudianteEstado::Activo));
        assert!(!should_graduate(&reqs, done, Some(false), EstudianteEstado::EnCurso));
        assert!(!should_graduate(&reqs, done, None, EstudianteEstado::Graduado));
        assert!(!should_graduate(&reqs, done, None, EstudianteEstado::Inactivo));

        let partial = RealizedMinutes {
            practicas: 120,
            teoricas: 30,
        };
        assert!(!should_graduate(&reqs, partial, None, EstudianteEstado::EnCurso));

        let half_configured = CourseRequirements {
            base_practicas: Some(120),
            ..Default::default()
        };
        assert!(!should_graduate(&half_configured, done, None, EstudianteEstado::EnCurso));
    }

    #[test]
    fn eligibility_reasons_name_the_failing_gate() {
        let reqs = CourseRequirements {
            base_practicas: Some(120),
            base_teoricas: Some(60),
            ..Default::default()
        };
        let done = RealizedMinutes {
            practicas: 120,
            teoricas: 60,
        };

        let ok = elegibilidad_examen(
            &reqs,
            done,
            &Promedios {
                practicas: Some(60.0),
                teoricas: Some(51.0),
            },
        );
        assert!(ok.eligible);
        assert!(ok.reasons.is_empty());

        let low_theory = elegibilidad_examen(
            &reqs,
            done,
            &Promedios {
                practicas: Some(60.0),
                teoricas: Some(45.0),
            },
        );
        assert!(!low_theory.eligible);
        assert!(low_theory
            .reasons
            .iter()
            .any(|r| r.contains("theory average 45.0 is below 51")));

        let no_hours = elegibilidad_examen(
            &reqs,
            RealizedMinutes {
                practicas: 30,
                teoricas: 60,
            },
            &Promedios {
                practicas: Some(60.0),
                teoricas: Some(60.0),
            },
        );
        assert!(no_hours
            .reasons
            .iter()
            .any(|r| r.contains("practical hours incomplete: 30 of 120")));

        let ungraded = elegibilidad_examen(&reqs, done, &Promedios::default());
        assert!(ungraded.reasons.contains(&"no graded practical classes".to_string()));
        assert!(ungraded.reasons.contains(&"no graded theory classes".to_string()));
    }

    #[test]
    fn promedios_unweighted_by_tipo() {
        let p = promedios_por_tipo(vec![
            (ClaseTipo::Practica, 80.0),
            (ClaseTipo::Practica, 40.0),
            (ClaseTipo::Teorica, 45.0),
        ]);
        assert_eq!(p.practicas, Some(60.0));
        assert_eq!(p.teoricas, Some(45.0));

        let empty = promedios_por_tipo(Vec::new());
        assert_eq!(empty.practicas, None);
        assert_eq!(empty.teoricas, None);
    }

    #[test]
    fn aprobado_threshold() {
        assert!(nota_valida(0.0));
        assert!(nota_valida(100.0));
        assert!(!nota_valida(-1.0));
        assert!(!nota_valida(101.0));
        assert!(aprobado_from_nota(51.0));
        assert!(!aprobado_from_nota(50.0));
        assert!(!aprobado_from_nota(40.0));
    }
}
