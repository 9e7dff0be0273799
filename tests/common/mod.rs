#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tempfile::TempDir;

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub workspace: TempDir,
}

impl Sidecar {
    /// Spawns the binary without opening a workspace.
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env_remove("SCHOOLD_WORKSPACE")
            .spawn()
            .expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
            workspace: tempfile::tempdir().expect("temp workspace"),
        }
    }

    /// Spawns the binary and selects a fresh workspace.
    pub fn start() -> Self {
        let mut sc = Self::spawn();
        let path = sc.workspace.path().to_string_lossy().to_string();
        sc.ok("workspace.select", json!({ "path": path }));
        sc
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        self.read_line()
    }

    fn read_line(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response");
        serde_json::from_str(line.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Error code of a request expected to fail.
    pub fn fail(&mut self, method: &str, params: Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"].as_str().unwrap_or("").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn root() -> Value {
    json!({ "role": "super_admin" })
}

pub fn admin(school_id: &str) -> Value {
    json!({ "role": "admin", "schoolId": school_id, "userId": "admin-1" })
}

pub fn teacher(school_id: &str, teacher_id: &str) -> Value {
    json!({ "role": "teacher", "schoolId": school_id, "userId": teacher_id })
}

pub fn student(school_id: &str, student_id: &str) -> Value {
    json!({ "role": "student", "schoolId": school_id, "userId": student_id })
}

pub fn parent(school_id: &str, parent_id: &str) -> Value {
    json!({ "role": "parent", "schoolId": school_id, "userId": parent_id })
}

/// `params` with `actor` set.
pub fn as_actor(actor: Value, mut params: Value) -> Value {
    params["actor"] = actor;
    params
}

pub fn str_of<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {key} in {v}"))
}

pub struct School {
    pub id: String,
    pub session_id: String,
    pub term_id: String,
    pub class_id: String,
    pub class_term_id: String,
    pub teacher_id: String,
    /// Math, English, Science, in that order.
    pub subjects: Vec<String>,
}

/// One school with a 2024 session, a first term, class "JSS1 A" opened for
/// that term and three subjects assigned (Math taught by `teacher_id`).
pub fn seed_school(sc: &mut Sidecar, code: &str) -> School {
    let created = sc.ok(
        "schools.create",
        as_actor(root(), json!({ "name": format!("{code} Academy"), "code": code })),
    );
    let id = str_of(&created, "schoolId").to_string();
    let a = admin(&id);

    let session = sc.ok(
        "sessions.create",
        as_actor(
            a.clone(),
            json!({ "name": "2024/2025", "startDate": "2024-01-01", "endDate": "2024-12-31" }),
        ),
    );
    let session_id = str_of(&session, "sessionId").to_string();
    let term = sc.ok(
        "terms.create",
        as_actor(
            a.clone(),
            json!({
                "sessionId": session_id,
                "name": "First Term",
                "startDate": "2024-01-08",
                "endDate": "2024-03-29"
            }),
        ),
    );
    let term_id = str_of(&term, "termId").to_string();

    let class = sc.ok("classes.create", as_actor(a.clone(), json!({ "name": "JSS1 A" })));
    let class_id = str_of(&class, "classId").to_string();
    let ct = sc.ok(
        "classTerms.open",
        as_actor(a.clone(), json!({ "classId": class_id, "termId": term_id })),
    );
    let class_term_id = str_of(&ct, "classTermId").to_string();

    let t = sc.ok(
        "teachers.create",
        as_actor(a.clone(), json!({ "firstName": "Ada", "lastName": "Obi" })),
    );
    let teacher_id = str_of(&t, "teacherId").to_string();

    let mut subjects = Vec::new();
    for name in ["Mathematics", "English", "Science"] {
        let s = sc.ok("subjects.create", as_actor(a.clone(), json!({ "name": name })));
        subjects.push(str_of(&s, "subjectId").to_string());
    }
    sc.ok(
        "classTerms.setSubjects",
        as_actor(
            a.clone(),
            json!({
                "classTermId": class_term_id,
                "subjects": [
                    { "subjectId": subjects[0], "teacherId": teacher_id },
                    { "subjectId": subjects[1] },
                    { "subjectId": subjects[2] }
                ]
            }),
        ),
    );

    School {
        id,
        session_id,
        term_id,
        class_id,
        class_term_id,
        teacher_id,
        subjects,
    }
}

pub fn add_student(sc: &mut Sidecar, school: &School, first: &str, last: &str) -> String {
    let created = sc.ok(
        "students.create",
        as_actor(
            admin(&school.id),
            json!({
                "firstName": first,
                "lastName": last,
                "classId": school.class_id,
                "admissionYear": 2024
            }),
        ),
    );
    str_of(&created, "studentId").to_string()
}

/// Exam-only score rows, one per `(subject index, exam)` pair.
pub fn record_exams(sc: &mut Sidecar, school: &School, student_id: &str, exams: &[(usize, f64)]) {
    let entries: Vec<Value> = exams
        .iter()
        .map(|(i, exam)| json!({ "studentId": student_id, "subjectId": school.subjects[*i], "exam": exam }))
        .collect();
    sc.ok(
        "scores.upsert",
        as_actor(
            admin(&school.id),
            json!({ "classTermId": school.class_term_id, "entries": entries }),
        ),
    );
}
