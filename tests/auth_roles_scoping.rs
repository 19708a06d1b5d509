use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_autoescuelad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn autoescuelad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed).to_string();
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
    code: &str,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    let error = value.get("error").cloned().expect("error body");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some(code),
        "unexpected error for {}: {}",
        method,
        error
    );
    error
}

fn setup_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &Path) {
    let _ = request_ok(
        stdin,
        reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "auth.register",
        json!({ "email": "admin@escuela.test", "password": "cambiame" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "auth.login",
        json!({ "email": "admin@escuela.test", "password": "cambiame" }),
    );
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    email: &str,
    password: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        "auth.login",
        json!({ "email": email, "password": password }),
    )
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    nombre: &str,
) -> String {
    request_ok(stdin, reader, "students.create", json!({ "nombre": nombre }))
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string()
}

fn create_instructor(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    nombre: &str,
) -> String {
    request_ok(stdin, reader, "instructors.create", json!({ "nombre": nombre }))
        .pointer("/instructor/id")
        .and_then(|v| v.as_str())
        .expect("instructor id")
        .to_string()
}

#[test]
fn registration_bootstraps_exactly_one_admin() {
    let workspace = temp_dir("autoescuela-bootstrap");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "health", json!({}));
    assert_eq!(health.get("workspacePath"), Some(&json!(null)));

    // Everything behind the auth boundary needs a session.
    let _ = request_err(&mut stdin, &mut reader, "students.list", json!({}), "auth_required");
    let me = request_ok(&mut stdin, &mut reader, "auth.me", json!({}));
    assert_eq!(me.get("authenticated"), Some(&json!(false)));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "auth.register",
        json!({ "email": "admin@escuela.test", "password": "cambiame" }),
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "auth.register",
        json!({ "email": "otro@escuela.test", "password": "x" }),
        "forbidden",
    );

    let _ = request_err(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "admin@escuela.test", "password": "equivocada" }),
        "login_denied",
    );
    let session = login(&mut stdin, &mut reader, "admin@escuela.test", "cambiame");
    assert_eq!(session.get("role"), Some(&json!("admin")));
    assert_eq!(session.get("instructorId"), Some(&json!(null)));

    let me = request_ok(&mut stdin, &mut reader, "auth.me", json!({}));
    assert_eq!(me.get("authenticated"), Some(&json!(true)));
    assert_eq!(me.pointer("/user/role"), Some(&json!("admin")));

    let _ = request_ok(&mut stdin, &mut reader, "auth.logout", json!({}));
    let _ = request_err(&mut stdin, &mut reader, "students.list", json!({}), "auth_required");

    let _ = request_err(
        &mut stdin,
        &mut reader,
        "no.such.method",
        json!({}),
        "not_implemented",
    );
}

#[test]
fn instructor_sessions_see_only_their_own_slice() {
    let workspace = temp_dir("autoescuela-scoping");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_admin(&mut stdin, &mut reader, &workspace);

    let ana = create_student(&mut stdin, &mut reader, "Ana Torres");
    let beto = create_student(&mut stdin, &mut reader, "Beto Diaz");
    let carlos = create_instructor(&mut stdin, &mut reader, "Carlos Vega");
    let diana = create_instructor(&mut stdin, &mut reader, "Diana Sol");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "auth.activateInstructorLogin",
        json!({ "instructorId": carlos, "email": "carlos@escuela.test", "password": "clave" }),
    );

    let own_class = request_ok(
        &mut stdin,
        &mut reader,
        "classes.create",
        json!({
            "estudianteId": ana, "instructorId": carlos, "tipo": "practica",
            "fecha": "2031-05-12", "hora": "08:00", "duracionMinutos": 60
        }),
    )
    .pointer("/class/id")
    .and_then(|v| v.as_str())
    .expect("class id")
    .to_string();
    let other_class = request_ok(
        &mut stdin,
        &mut reader,
        "classes.create",
        json!({
            "estudianteId": beto, "instructorId": diana, "tipo": "practica",
            "fecha": "2031-05-12", "hora": "09:00", "duracionMinutos": 60
        }),
    )
    .pointer("/class/id")
    .and_then(|v| v.as_str())
    .expect("class id")
    .to_string();

    let session = login(&mut stdin, &mut reader, "carlos@escuela.test", "clave");
    assert_eq!(session.get("role"), Some(&json!("instructor")));
    assert_eq!(session.get("instructorId"), Some(&json!(carlos.clone())));

    let students = request_ok(&mut stdin, &mut reader, "students.list", json!({}));
    let ids: Vec<&str> = students
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .filter_map(|s| s.get("id").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(ids, vec![ana.as_str()]);

    let classes = request_ok(&mut stdin, &mut reader, "classes.list", json!({}));
    let class_ids: Vec<&str> = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .expect("classes")
        .iter()
        .filter_map(|c| c.get("id").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(class_ids, vec![own_class.as_str()]);

    let instructors = request_ok(&mut stdin, &mut reader, "instructors.list", json!({}));
    let rows = instructors
        .get("instructors")
        .and_then(|v| v.as_array())
        .expect("instructors");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&json!(carlos.clone())));

    // Another instructor's data is indistinguishable from absent data.
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "progress.get",
        json!({ "estudianteId": beto }),
        "not_found",
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "classes.update",
        json!({ "classId": other_class, "hora": "10:00" }),
        "not_found",
    );

    let _ = request_err(
        &mut stdin,
        &mut reader,
        "classes.create",
        json!({
            "estudianteId": ana, "instructorId": diana, "tipo": "practica",
            "fecha": "2031-05-13", "hora": "08:00", "duracionMinutos": 60
        }),
        "forbidden",
    );
}

#[test]
fn admin_only_methods_reject_instructor_sessions() {
    let workspace = temp_dir("autoescuela-admin-only");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_admin(&mut stdin, &mut reader, &workspace);

    let ana = create_student(&mut stdin, &mut reader, "Ana Torres");
    let carlos = create_instructor(&mut stdin, &mut reader, "Carlos Vega");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "auth.activateInstructorLogin",
        json!({ "instructorId": carlos, "email": "carlos@escuela.test", "password": "clave" }),
    );
    let _ = login(&mut stdin, &mut reader, "carlos@escuela.test", "clave");

    for (method, params) in [
        ("students.create", json!({ "nombre": "Otro" })),
        ("students.delete", json!({ "estudianteId": ana })),
        ("instructors.create", json!({ "nombre": "Otra" })),
        ("instructors.delete", json!({ "instructorId": carlos })),
        (
            "progress.setRequirements",
            json!({ "estudianteId": ana, "horasPracticasRequeridas": 60 }),
        ),
        ("exam.submit", json!({ "estudianteId": ana, "notaFinal": 60 })),
        ("exam.reset", json!({ "estudianteId": ana })),
        (
            "auth.activateInstructorLogin",
            json!({ "instructorId": carlos, "email": "x@escuela.test", "password": "y" }),
        ),
    ] {
        let _ = request_err(&mut stdin, &mut reader, method, params, "forbidden");
    }
}

#[test]
fn update_fields_are_allow_listed_per_role() {
    let workspace = temp_dir("autoescuela-allow-list");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_admin(&mut stdin, &mut reader, &workspace);

    let ana = create_student(&mut stdin, &mut reader, "Ana Torres");
    let carlos = create_instructor(&mut stdin, &mut reader, "Carlos Vega");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "auth.activateInstructorLogin",
        json!({ "instructorId": carlos, "email": "carlos@escuela.test", "password": "clave" }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "students.update",
        json!({ "estudianteId": ana, "apodo": "Anita" }),
        "bad_params",
    );
    assert!(error
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("apodo"));

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "classes.create",
        json!({
            "estudianteId": ana, "instructorId": carlos, "tipo": "practica",
            "fecha": "2031-05-12", "hora": "08:00", "duracionMinutos": 60
        }),
    )
    .pointer("/class/id")
    .and_then(|v| v.as_str())
    .expect("class id")
    .to_string();

    let _ = login(&mut stdin, &mut reader, "carlos@escuela.test", "clave");

    // nota and reassignment fields belong to the admin surface.
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "classes.update",
        json!({ "classId": class, "nota": 80 }),
        "bad_params",
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "classes.update",
        json!({ "classId": class, "estudianteId": ana }),
        "bad_params",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "classes.update",
        json!({ "classId": class, "observaciones": "trae gafas" }),
    );
}

#[test]
fn deactivated_instructors_cannot_sign_in() {
    let workspace = temp_dir("autoescuela-deactivated");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_admin(&mut stdin, &mut reader, &workspace);

    let carlos = create_instructor(&mut stdin, &mut reader, "Carlos Vega");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "auth.activateInstructorLogin",
        json!({ "instructorId": carlos, "email": "carlos@escuela.test", "password": "clave" }),
    );
    let _ = login(&mut stdin, &mut reader, "carlos@escuela.test", "clave");

    let _ = login(&mut stdin, &mut reader, "admin@escuela.test", "cambiame");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "instructors.delete",
        json!({ "instructorId": carlos }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "carlos@escuela.test", "password": "clave" }),
        "login_denied",
    );
    assert!(error
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("deactivated"));

    // Reactivation through the same call resets the credentials.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "instructors.update",
        json!({ "instructorId": carlos, "estado": "activo" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "auth.activateInstructorLogin",
        json!({ "instructorId": carlos, "email": "carlos@escuela.test", "password": "nueva" }),
    );
    let session = login(&mut stdin, &mut reader, "carlos@escuela.test", "nueva");
    assert_eq!(session.get("role"), Some(&json!("instructor")));

    // A login email can never be claimed for a different instructor.
    let _ = login(&mut stdin, &mut reader, "admin@escuela.test", "cambiame");
    let diana = create_instructor(&mut stdin, &mut reader, "Diana Sol");
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "auth.activateInstructorLogin",
        json!({ "instructorId": diana, "email": "carlos@escuela.test", "password": "robada" }),
        "conflict",
    );
}
