use crate::auth::{Actor, Role};
use crate::error::{AppError, AppResult};
use crate::ipc::types::AppState;
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

pub fn conn(state: &AppState) -> AppResult<&Connection> {
    state.db.as_ref().ok_or(AppError::NoWorkspace)
}

/// Required string param, trimmed and non-empty.
pub fn req_str(params: &Value, key: &str) -> AppResult<String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(AppError::bad_params(format!("{key} must not be empty"))),
        Some(_) => Err(AppError::bad_params(format!("{key} must be a string"))),
        None => Err(AppError::bad_params(format!("missing {key}"))),
    }
}

/// Optional string param; missing, null and blank all read as `None`.
pub fn opt_str(params: &Value, key: &str) -> AppResult<Option<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(AppError::bad_params(format!("{key} must be a string or null"))),
    }
}

pub fn opt_f64(params: &Value, key: &str) -> AppResult<Option<f64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{key} must be a number or null"))),
    }
}

pub fn opt_bool(params: &Value, key: &str) -> AppResult<Option<bool>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(AppError::bad_params(format!("{key} must be boolean"))),
    }
}

pub fn parse_date(raw: &str, key: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| AppError::bad_params(format!("{key} must be a YYYY-MM-DD date")))
}

pub fn req_date(params: &Value, key: &str) -> AppResult<NaiveDate> {
    parse_date(&req_str(params, key)?, key)
}

/// `params.asOf` or today's local date.
pub fn as_of(params: &Value) -> AppResult<NaiveDate> {
    match opt_str(params, "asOf")? {
        Some(s) => parse_date(&s, "asOf"),
        None => Ok(Local::now().date_naive()),
    }
}

/// Owning school of a row, looked up with a single-column query.
pub fn owner_school(conn: &Connection, sql: &str, id: &str, what: &'static str) -> AppResult<String> {
    let school: Option<String> = conn.query_row(sql, [id], |r| r.get(0)).optional()?;
    school.ok_or_else(|| AppError::not_found_id(what, id))
}

pub fn require_school_exists(conn: &Connection, school_id: &str) -> AppResult<()> {
    owner_school(conn, "SELECT id FROM schools WHERE id = ?", school_id, "school").map(|_| ())
}

pub fn session_school(conn: &Connection, session_id: &str) -> AppResult<String> {
    owner_school(
        conn,
        "SELECT school_id FROM academic_sessions WHERE id = ?",
        session_id,
        "session",
    )
}

pub fn term_school(conn: &Connection, term_id: &str) -> AppResult<String> {
    owner_school(
        conn,
        "SELECT s.school_id FROM terms t JOIN academic_sessions s ON s.id = t.session_id WHERE t.id = ?",
        term_id,
        "term",
    )
}

pub fn class_school(conn: &Connection, class_id: &str) -> AppResult<String> {
    owner_school(conn, "SELECT school_id FROM classes WHERE id = ?", class_id, "class")
}

pub fn subject_school(conn: &Connection, subject_id: &str) -> AppResult<String> {
    owner_school(conn, "SELECT school_id FROM subjects WHERE id = ?", subject_id, "subject")
}

pub fn student_school(conn: &Connection, student_id: &str) -> AppResult<String> {
    owner_school(conn, "SELECT school_id FROM students WHERE id = ?", student_id, "student")
}

pub fn teacher_school(conn: &Connection, teacher_id: &str) -> AppResult<String> {
    owner_school(conn, "SELECT school_id FROM teachers WHERE id = ?", teacher_id, "teacher")
}

pub fn parent_school(conn: &Connection, parent_id: &str) -> AppResult<String> {
    owner_school(conn, "SELECT school_id FROM parents WHERE id = ?", parent_id, "parent")
}

/// Staff of the school see every student; a student sees only themself and
/// a parent only linked children.
pub fn authorize_student_view(conn: &Connection, actor: &Actor, student_id: &str) -> AppResult<()> {
    let school_id = student_school(conn, student_id)?;
    actor.require_school(&school_id)?;
    match actor.role {
        Role::SuperAdmin | Role::Admin | Role::Teacher => Ok(()),
        Role::Student if actor.user_id() == student_id => Ok(()),
        Role::Parent => {
            let linked: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM parent_students WHERE parent_id = ? AND student_id = ?",
                    (actor.user_id(), student_id),
                    |r| r.get(0),
                )
                .optional()?;
            linked
                .map(|_| ())
                .ok_or_else(|| AppError::Unauthorized("student is not linked to this parent".into()))
        }
        Role::Student => Err(AppError::Unauthorized(
            "students may only view their own records".into(),
        )),
    }
}

pub fn now_stamp() -> String {
    Local::now().to_rfc3339()
}
