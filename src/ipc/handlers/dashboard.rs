use crate::auth::{Actor, Role};
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::handlers::classes::teacher_assignments;
use crate::ipc::handlers::sessions::current_session_calendar;
use crate::ipc::helpers::{as_of, conn, opt_str, parent_school, student_school, teacher_school};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

fn count(conn: &Connection, sql: &str, school_id: &str) -> AppResult<i64> {
    Ok(conn.query_row(sql, [school_id], |r| r.get(0))?)
}

fn school_counts(conn: &Connection, school_id: &str) -> AppResult<Value> {
    Ok(json!({
        "students": count(conn, "SELECT COUNT(*) FROM students WHERE school_id = ?", school_id)?,
        "unplacedStudents": count(
            conn,
            "SELECT COUNT(*) FROM students WHERE school_id = ? AND class_id IS NULL",
            school_id,
        )?,
        "teachers": count(conn, "SELECT COUNT(*) FROM teachers WHERE school_id = ?", school_id)?,
        "parents": count(conn, "SELECT COUNT(*) FROM parents WHERE school_id = ?", school_id)?,
        "classes": count(conn, "SELECT COUNT(*) FROM classes WHERE school_id = ?", school_id)?,
        "subjects": count(conn, "SELECT COUNT(*) FROM subjects WHERE school_id = ?", school_id)?,
    }))
}

fn student_card(conn: &Connection, student_id: &str) -> AppResult<Value> {
    let row = conn
        .query_row(
            "SELECT s.first_name, s.last_name, s.admission_no, s.class_id, c.name
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [student_id],
            |r| {
                Ok(json!({
                    "id": student_id,
                    "firstName": r.get::<_, String>(0)?,
                    "lastName": r.get::<_, String>(1)?,
                    "admissionNo": r.get::<_, String>(2)?,
                    "classId": r.get::<_, Option<String>>(3)?,
                    "className": r.get::<_, Option<String>>(4)?,
                }))
            },
        )
        .optional()?;
    row.ok_or_else(|| AppError::not_found_id("student", student_id))
}

fn linked_children(conn: &Connection, parent_id: &str) -> AppResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT ps.student_id
         FROM parent_students ps
         JOIN students s ON s.id = ps.student_id
         WHERE ps.parent_id = ?
         ORDER BY s.last_name, s.first_name",
    )?;
    let ids = stmt
        .query_map([parent_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| student_card(conn, id)).collect()
}

fn dashboard_summary(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let today = as_of(params)?;

    if actor.role == Role::SuperAdmin && opt_str(params, "schoolId")?.is_none() {
        let schools: i64 = conn.query_row("SELECT COUNT(*) FROM schools", [], |r| r.get(0))?;
        let students: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
        return Ok(json!({
            "role": actor.role,
            "asOf": today,
            "schools": schools,
            "students": students,
        }));
    }

    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    let calendar = current_session_calendar(conn, &school_id, today)?;
    let mut out = json!({
        "role": actor.role,
        "asOf": today,
        "schoolId": school_id,
        "calendar": calendar,
    });

    match actor.role {
        Role::SuperAdmin | Role::Admin => {
            out["counts"] = school_counts(conn, &school_id)?;
        }
        Role::Teacher => {
            actor.require_school(&teacher_school(conn, actor.user_id())?)?;
            out["assignments"] = json!(teacher_assignments(conn, actor.user_id())?);
        }
        Role::Student => {
            actor.require_school(&student_school(conn, actor.user_id())?)?;
            out["student"] = student_card(conn, actor.user_id())?;
        }
        Role::Parent => {
            actor.require_school(&parent_school(conn, actor.user_id())?)?;
            out["children"] = json!(linked_children(conn, actor.user_id())?);
        }
    }
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "dashboard.summary" => dashboard_summary(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
