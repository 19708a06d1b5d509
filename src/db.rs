use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use std::path::Path;

use crate::rules::RealizedMinutes;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("autoescuela.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS app_users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            nombre TEXT NOT NULL,
            email TEXT,
            telefono TEXT,
            estado TEXT NOT NULL DEFAULT 'activo',
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instructors(
            id TEXT PRIMARY KEY,
            nombre TEXT NOT NULL,
            email TEXT,
            estado TEXT NOT NULL DEFAULT 'activo',
            hora_inicio TEXT,
            hora_fin TEXT,
            user_id TEXT,
            FOREIGN KEY(user_id) REFERENCES app_users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instructors_user ON instructors(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            estudiante_id TEXT NOT NULL,
            instructor_id TEXT NOT NULL,
            tipo TEXT NOT NULL,
            fecha TEXT NOT NULL,
            hora TEXT NOT NULL,
            duracion_minutos INTEGER NOT NULL,
            estado TEXT NOT NULL DEFAULT 'agendado',
            nota REAL,
            observaciones TEXT,
            updated_at TEXT,
            FOREIGN KEY(estudiante_id) REFERENCES students(id),
            FOREIGN KEY(instructor_id) REFERENCES instructors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_estudiante ON classes(estudiante_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_instructor ON classes(instructor_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_slot ON classes(fecha, hora)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_progress(
            estudiante_id TEXT PRIMARY KEY,
            minutos_practicas_realizadas INTEGER NOT NULL DEFAULT 0,
            minutos_teoricas_realizadas INTEGER NOT NULL DEFAULT 0,
            horas_practicas_requeridas INTEGER,
            horas_teoricas_requeridas INTEGER,
            horas_penalizacion_practicas INTEGER NOT NULL DEFAULT 0,
            horas_penalizacion_teoricas INTEGER NOT NULL DEFAULT 0,
            porcentaje_avance INTEGER NOT NULL DEFAULT 0,
            nota_final REAL,
            aprobado INTEGER,
            reintentos INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(estudiante_id) REFERENCES students(id)
        )",
        [],
    )?;

    // Existing workspaces may predate the observaciones column.
    ensure_classes_observaciones(&conn)?;

    Ok(conn)
}

fn ensure_classes_observaciones(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "classes", "observaciones")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE classes ADD COLUMN observaciones TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Data-access scope derived from the session. Instructor scope is applied in
/// SQL by every class-reaching helper, so handler-level checks are backed up
/// here (the only authorization mechanism in the system).
#[derive(Debug, Clone)]
pub enum Scope {
    Admin,
    Instructor(String),
}

impl Scope {
    pub fn instructor_id(&self) -> Option<&str> {
        match self {
            Scope::Admin => None,
            Scope::Instructor(id) => Some(id.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub nombre: String,
    pub email: Option<String>,
    pub telefono: Option<String>,
    pub estado: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstructorRow {
    pub id: String,
    pub nombre: String,
    pub email: Option<String>,
    pub estado: String,
    pub hora_inicio: Option<String>,
    pub hora_fin: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub estudiante_id: String,
    pub instructor_id: String,
    pub tipo: String,
    pub fecha: String,
    pub hora: String,
    pub duracion_minutos: i64,
    pub estado: String,
    pub nota: Option<f64>,
    pub observaciones: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressRow {
    pub estudiante_id: String,
    pub minutos_practicas_realizadas: i64,
    pub minutos_teoricas_realizadas: i64,
    pub horas_practicas_requeridas: Option<i64>,
    pub horas_teoricas_requeridas: Option<i64>,
    pub horas_penalizacion_practicas: i64,
    pub horas_penalizacion_teoricas: i64,
    pub porcentaje_avance: i64,
    pub nota_final: Option<f64>,
    pub aprobado: Option<bool>,
    pub reintentos: i64,
}

impl ProgressRow {
    pub fn empty(estudiante_id: &str) -> Self {
        ProgressRow {
            estudiante_id: estudiante_id.to_string(),
            minutos_practicas_realizadas: 0,
            minutos_teoricas_realizadas: 0,
            horas_practicas_requeridas: None,
            horas_teoricas_requeridas: None,
            horas_penalizacion_practicas: 0,
            horas_penalizacion_teoricas: 0,
            porcentaje_avance: 0,
            nota_final: None,
            aprobado: None,
            reintentos: 0,
        }
    }
}

pub fn get_student(conn: &Connection, id: &str) -> anyhow::Result<Option<StudentRow>> {
    conn.query_row(
        "SELECT id, nombre, email, telefono, estado, created_at FROM students WHERE id = ?",
        [id],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                nombre: r.get(1)?,
                email: r.get(2)?,
                telefono: r.get(3)?,
                estado: r.get(4)?,
                created_at: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Students visible to the scope: everyone for admin, only students with at
/// least one class under the instructor otherwise.
pub fn list_students(conn: &Connection, scope: &Scope) -> anyhow::Result<Vec<StudentRow>> {
    let mut sql = String::from(
        "SELECT s.id, s.nombre, s.email, s.telefono, s.estado, s.created_at FROM students s",
    );
    let mut params: Vec<Value> = Vec::new();
    if let Some(instructor_id) = scope.instructor_id() {
        sql.push_str(
            " WHERE EXISTS (SELECT 1 FROM classes c
               WHERE c.estudiante_id = s.id AND c.instructor_id = ?)",
        );
        params.push(Value::from(instructor_id.to_string()));
    }
    sql.push_str(" ORDER BY s.nombre");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                nombre: r.get(1)?,
                email: r.get(2)?,
                telefono: r.get(3)?,
                estado: r.get(4)?,
                created_at: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// True when the scope may see this student's data at all.
pub fn student_visible(conn: &Connection, scope: &Scope, estudiante_id: &str) -> anyhow::Result<bool> {
    let Some(instructor_id) = scope.instructor_id() else {
        return Ok(true);
    };
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classes WHERE estudiante_id = ? AND instructor_id = ? LIMIT 1",
            [estudiante_id, instructor_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub fn get_instructor(conn: &Connection, id: &str) -> anyhow::Result<Option<InstructorRow>> {
    conn.query_row(
        "SELECT id, nombre, email, estado, hora_inicio, hora_fin, user_id
         FROM instructors WHERE id = ?",
        [id],
        |r| {
            Ok(InstructorRow {
                id: r.get(0)?,
                nombre: r.get(1)?,
                email: r.get(2)?,
                estado: r.get(3)?,
                hora_inicio: r.get(4)?,
                hora_fin: r.get(5)?,
                user_id: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_instructor_by_user(
    conn: &Connection,
    user_id: &str,
) -> anyhow::Result<Option<InstructorRow>> {
    conn.query_row(
        "SELECT id, nombre, email, estado, hora_inicio, hora_fin, user_id
         FROM instructors WHERE user_id = ?",
        [user_id],
        |r| {
            Ok(InstructorRow {
                id: r.get(0)?,
                nombre: r.get(1)?,
                email: r.get(2)?,
                estado: r.get(3)?,
                hora_inicio: r.get(4)?,
                hora_fin: r.get(5)?,
                user_id: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_instructors(conn: &Connection, scope: &Scope) -> anyhow::Result<Vec<InstructorRow>> {
    let mut sql = String::from(
        "SELECT id, nombre, email, estado, hora_inicio, hora_fin, user_id FROM instructors",
    );
    let mut params: Vec<Value> = Vec::new();
    if let Some(instructor_id) = scope.instructor_id() {
        sql.push_str(" WHERE id = ?");
        params.push(Value::from(instructor_id.to_string()));
    }
    sql.push_str(" ORDER BY nombre");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            Ok(InstructorRow {
                id: r.get(0)?,
                nombre: r.get(1)?,
                email: r.get(2)?,
                estado: r.get(3)?,
                hora_inicio: r.get(4)?,
                hora_fin: r.get(5)?,
                user_id: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const CLASS_COLUMNS: &str = "id, estudiante_id, instructor_id, tipo, fecha, hora,
    duracion_minutos, estado, nota, observaciones, updated_at";

fn class_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ClassRow> {
    Ok(ClassRow {
        id: r.get(0)?,
        estudiante_id: r.get(1)?,
        instructor_id: r.get(2)?,
        tipo: r.get(3)?,
        fecha: r.get(4)?,
        hora: r.get(5)?,
        duracion_minutos: r.get(6)?,
        estado: r.get(7)?,
        nota: r.get(8)?,
        observaciones: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

pub fn get_class(conn: &Connection, scope: &Scope, id: &str) -> anyhow::Result<Option<ClassRow>> {
    let mut sql = format!("SELECT {} FROM classes WHERE id = ?", CLASS_COLUMNS);
    let mut params: Vec<Value> = vec![Value::from(id.to_string())];
    if let Some(instructor_id) = scope.instructor_id() {
        sql.push_str(" AND instructor_id = ?");
        params.push(Value::from(instructor_id.to_string()));
    }
    conn.query_row(&sql, params_from_iter(params), class_from_row)
        .optional()
        .map_err(Into::into)
}

pub fn list_classes(
    conn: &Connection,
    scope: &Scope,
    estudiante_id: Option<&str>,
    instructor_id: Option<&str>,
) -> anyhow::Result<Vec<ClassRow>> {
    let mut sql = format!("SELECT {} FROM classes WHERE 1=1", CLASS_COLUMNS);
    let mut params: Vec<Value> = Vec::new();
    if let Some(est) = estudiante_id {
        sql.push_str(" AND estudiante_id = ?");
        params.push(Value::from(est.to_string()));
    }
    if let Some(ins) = instructor_id {
        sql.push_str(" AND instructor_id = ?");
        params.push(Value::from(ins.to_string()));
    }
    if let Some(own) = scope.instructor_id() {
        sql.push_str(" AND instructor_id = ?");
        params.push(Value::from(own.to_string()));
    }
    sql.push_str(" ORDER BY fecha, hora");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), class_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotHolder {
    Estudiante,
    Instructor,
}

/// Finds a non-suspended class occupying the identical (fecha, hora) slot for
/// the given student or instructor, excluding the row being edited.
pub fn find_slot_holder(
    conn: &Connection,
    fecha: &str,
    hora: &str,
    estudiante_id: Option<&str>,
    instructor_id: Option<&str>,
    exclude_id: Option<&str>,
) -> anyhow::Result<Option<SlotHolder>> {
    let mut sql = format!(
        "SELECT {} FROM classes
         WHERE fecha = ? AND hora = ? AND estado != 'suspendida'",
        CLASS_COLUMNS
    );
    let mut params: Vec<Value> = vec![
        Value::from(fecha.to_string()),
        Value::from(hora.to_string()),
    ];
    match (estudiante_id, instructor_id) {
        (Some(est), Some(ins)) => {
            sql.push_str(" AND (estudiante_id = ? OR instructor_id = ?)");
            params.push(Value::from(est.to_string()));
            params.push(Value::from(ins.to_string()));
        }
        (Some(est), None) => {
            sql.push_str(" AND estudiante_id = ?");
            params.push(Value::from(est.to_string()));
        }
        (None, Some(ins)) => {
            sql.push_str(" AND instructor_id = ?");
            params.push(Value::from(ins.to_string()));
        }
        (None, None) => return Ok(None),
    }
    if let Some(ex) = exclude_id {
        sql.push_str(" AND id != ?");
        params.push(Value::from(ex.to_string()));
    }
    sql.push_str(" LIMIT 1");

    let hit = conn
        .query_row(&sql, params_from_iter(params), class_from_row)
        .optional()?;
    Ok(hit.map(|row| {
        if estudiante_id == Some(row.estudiante_id.as_str()) {
            SlotHolder::Estudiante
        } else {
            SlotHolder::Instructor
        }
    }))
}

/// Realized minutes by type over the student's non-suspended classes,
/// optionally excluding one class (the row being edited).
pub fn sum_realized_minutes(
    conn: &Connection,
    estudiante_id: &str,
    exclude_id: Option<&str>,
) -> anyhow::Result<RealizedMinutes> {
    let mut sql = String::from(
        "SELECT tipo, COALESCE(SUM(duracion_minutos), 0)
         FROM classes
         WHERE estudiante_id = ? AND estado != 'suspendida'",
    );
    let mut params: Vec<Value> = vec![Value::from(estudiante_id.to_string())];
    if let Some(ex) = exclude_id {
        sql.push_str(" AND id != ?");
        params.push(Value::from(ex.to_string()));
    }
    sql.push_str(" GROUP BY tipo");

    let mut realized = RealizedMinutes::default();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (tipo, minutos) in rows {
        match tipo.as_str() {
            "practica" => realized.practicas = minutos,
            "teorica" => realized.teoricas = minutos,
            _ => {}
        }
    }
    Ok(realized)
}

/// Count of a student's non-suspended classes (drives activo/en_curso sync).
pub fn count_scheduled_classes(conn: &Connection, estudiante_id: &str) -> anyhow::Result<i64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM classes WHERE estudiante_id = ? AND estado != 'suspendida'",
        [estudiante_id],
        |r| r.get(0),
    )?;
    Ok(n)
}

/// (tipo, nota) pairs over graded classes, for per-type averages.
pub fn list_graded_notas(
    conn: &Connection,
    estudiante_id: &str,
) -> anyhow::Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT tipo, nota FROM classes
         WHERE estudiante_id = ? AND estado = 'cursado' AND nota IS NOT NULL",
    )?;
    let rows = stmt
        .query_map([estudiante_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_progress(conn: &Connection, estudiante_id: &str) -> anyhow::Result<Option<ProgressRow>> {
    conn.query_row(
        "SELECT estudiante_id, minutos_practicas_realizadas, minutos_teoricas_realizadas,
                horas_practicas_requeridas, horas_teoricas_requeridas,
                horas_penalizacion_practicas, horas_penalizacion_teoricas,
                porcentaje_avance, nota_final, aprobado, reintentos
         FROM student_progress WHERE estudiante_id = ?",
        [estudiante_id],
        |r| {
            Ok(ProgressRow {
                estudiante_id: r.get(0)?,
                minutos_practicas_realizadas: r.get(1)?,
                minutos_teoricas_realizadas: r.get(2)?,
                horas_practicas_requeridas: r.get(3)?,
                horas_teoricas_requeridas: r.get(4)?,
                horas_penalizacion_practicas: r.get(5)?,
                horas_penalizacion_teoricas: r.get(6)?,
                porcentaje_avance: r.get(7)?,
                nota_final: r.get(8)?,
                aprobado: r
                    .get::<_, Option<i64>>(9)?
                    .map(|v| v != 0),
                reintentos: r.get(10)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Upsert the recomputed aggregate fields, leaving requirement and exam
/// fields untouched for existing rows.
pub fn upsert_progress_realized(conn: &Connection, row: &ProgressRow) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO student_progress(
            estudiante_id, minutos_practicas_realizadas, minutos_teoricas_realizadas,
            porcentaje_avance)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(estudiante_id) DO UPDATE SET
           minutos_practicas_realizadas = excluded.minutos_practicas_realizadas,
           minutos_teoricas_realizadas = excluded.minutos_teoricas_realizadas,
           porcentaje_avance = excluded.porcentaje_avance",
        (
            &row.estudiante_id,
            row.minutos_practicas_realizadas,
            row.minutos_teoricas_realizadas,
            row.porcentaje_avance,
        ),
    )?;
    Ok(())
}

pub fn upsert_progress_requirements(
    conn: &Connection,
    estudiante_id: &str,
    base_practicas: Option<i64>,
    base_teoricas: Option<i64>,
    penalizacion_practicas: i64,
    penalizacion_teoricas: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO student_progress(
            estudiante_id, horas_practicas_requeridas, horas_teoricas_requeridas,
            horas_penalizacion_practicas, horas_penalizacion_teoricas)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(estudiante_id) DO UPDATE SET
           horas_practicas_requeridas = excluded.horas_practicas_requeridas,
           horas_teoricas_requeridas = excluded.horas_teoricas_requeridas,
           horas_penalizacion_practicas = excluded.horas_penalizacion_practicas,
           horas_penalizacion_teoricas = excluded.horas_penalizacion_teoricas",
        (
            estudiante_id,
            base_practicas,
            base_teoricas,
            penalizacion_practicas,
            penalizacion_teoricas,
        ),
    )?;
    Ok(())
}

pub fn update_progress_exam(
    conn: &Connection,
    estudiante_id: &str,
    nota_final: Option<f64>,
    aprobado: Option<bool>,
    reintentos: i64,
    penalizacion_practicas: i64,
    penalizacion_teoricas: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE student_progress SET
           nota_final = ?,
           aprobado = ?,
           reintentos = ?,
           horas_penalizacion_practicas = ?,
           horas_penalizacion_teoricas = ?
         WHERE estudiante_id = ?",
        (
            nota_final,
            aprobado.map(|b| b as i64),
            reintentos,
            penalizacion_practicas,
            penalizacion_teoricas,
            estudiante_id,
        ),
    )?;
    Ok(())
}

pub fn set_student_estado(conn: &Connection, id: &str, estado: &str) -> anyhow::Result<()> {
    conn.execute("UPDATE students SET estado = ? WHERE id = ?", (estado, id))?;
    Ok(())
}
