use crate::admission;
use crate::auth::{Actor, ADMINS, STAFF};
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    as_of, class_school, conn, now_stamp, opt_str, parent_school, req_str, require_school_exists,
    student_school,
};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const MAX_SEQUENCE_SKIPS: u32 = 1000;

fn teachers_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(STAFF)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;

    let mut stmt = conn.prepare(
        "SELECT t.id, t.first_name, t.last_name, t.email,
           (SELECT COUNT(*) FROM class_term_subjects cts WHERE cts.teacher_id = t.id)
         FROM teachers t
         WHERE t.school_id = ?
         ORDER BY t.last_name, t.first_name",
    )?;
    let teachers = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "email": r.get::<_, Option<String>>(3)?,
                "assignmentCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let first_name = req_str(params, "firstName")?;
    let last_name = req_str(params, "lastName")?;
    let email = opt_str(params, "email")?;

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, school_id, first_name, last_name, email) VALUES(?, ?, ?, ?, ?)",
        (&teacher_id, &school_id, &first_name, &last_name, &email),
    )?;
    Ok(json!({ "teacherId": teacher_id }))
}

fn school_code(conn: &Connection, school_id: &str) -> AppResult<String> {
    let code: Option<String> = conn
        .query_row("SELECT code FROM schools WHERE id = ?", [school_id], |r| {
            r.get(0)
        })
        .optional()?;
    code.ok_or_else(|| AppError::not_found_id("school", school_id))
}

fn admission_taken(conn: &Connection, school_id: &str, admission_no: &str) -> AppResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM students WHERE school_id = ? AND admission_no = ?",
            (school_id, admission_no),
            |r| r.get(0),
        )
        .optional()?)
}

fn check_class(conn: &Connection, class_id: &str, school_id: &str) -> AppResult<()> {
    if class_school(conn, class_id)? != school_id {
        return Err(AppError::integrity(
            "class belongs to another school",
            json!({ "classId": class_id }),
        ));
    }
    Ok(())
}

fn students_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(STAFF)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    let class_id = opt_str(params, "classId")?;
    if let Some(c) = &class_id {
        actor.require_school(&class_school(conn, c)?)?;
    }

    let mut stmt = conn.prepare(
        "SELECT s.id, s.first_name, s.last_name, s.admission_no, s.admission_year, s.class_id, c.name
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.school_id = ?1 AND (?2 IS NULL OR s.class_id = ?2)
         ORDER BY s.last_name, s.first_name, s.admission_no",
    )?;
    let students = stmt
        .query_map((&school_id, &class_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "admissionNo": r.get::<_, String>(3)?,
                "admissionYear": r.get::<_, i64>(4)?,
                "classId": r.get::<_, Option<String>>(5)?,
                "className": r.get::<_, Option<String>>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

/// Inserts a student. Unless `admissionNo` is given, the next free number
/// for `(school, admissionYear)` is reserved in the same transaction.
fn students_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    let code = school_code(conn, &school_id)?;

    let first_name = req_str(params, "firstName")?;
    let last_name = req_str(params, "lastName")?;
    let class_id = opt_str(params, "classId")?;
    if let Some(c) = &class_id {
        check_class(conn, c, &school_id)?;
    }
    let year = match params.get("admissionYear") {
        None | Some(Value::Null) => as_of(params)?.year(),
        Some(v) => v
            .as_i64()
            .filter(|y| (1900..=9999).contains(y))
            .map(|y| y as i32)
            .ok_or_else(|| AppError::bad_params("admissionYear must be a four-digit year"))?,
    };
    let manual = opt_str(params, "admissionNo")?;

    let tx = conn.unchecked_transaction()?;
    let (admission_no, sequence) = match manual {
        Some(no) => {
            if let Some(existing) = admission_taken(&tx, &school_id, &no)? {
                return Err(AppError::integrity(
                    format!("admission number {no} is already in use"),
                    json!({ "admissionNo": no, "studentId": existing }),
                ));
            }
            (no, None)
        }
        None => {
            let format = setup::admission_format(&tx, &school_id)?;
            let mut attempt = 0;
            loop {
                let seq = admission::allocate_sequence(&tx, &school_id, year, format.start_at)?;
                let no = admission::format_admission_number(&format, &code, year, seq);
                // Manually entered numbers can occupy a slot; step past them.
                if admission_taken(&tx, &school_id, &no)?.is_none() {
                    break (no, Some(seq));
                }
                attempt += 1;
                if attempt >= MAX_SEQUENCE_SKIPS {
                    return Err(AppError::integrity(
                        "no free admission number near the current sequence",
                        json!({ "schoolId": school_id, "year": year, "lastTried": no }),
                    ));
                }
                tracing::debug!(admission_no = %no, "admission number taken, skipping");
            }
        }
    };

    let student_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO students(id, school_id, class_id, first_name, last_name, admission_no, admission_year, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &school_id,
            &class_id,
            &first_name,
            &last_name,
            &admission_no,
            year,
            now_stamp(),
        ),
    )?;
    tx.commit()?;

    tracing::info!(
        school_id = %school_id,
        student_id = %student_id,
        admission_no = %admission_no,
        "student created"
    );
    Ok(json!({
        "studentId": student_id,
        "admissionNo": admission_no,
        "admissionYear": year,
        "sequence": sequence,
    }))
}

fn students_update(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let student_id = req_str(params, "studentId")?;
    let school_id = student_school(conn, &student_id)?;
    actor.require_school(&school_id)?;

    let Some(patch) = params.get("patch").filter(|p| p.is_object()) else {
        return Err(AppError::bad_params("patch must be an object"));
    };
    let first_name = opt_str(patch, "firstName")?;
    let last_name = opt_str(patch, "lastName")?;
    let admission_no = opt_str(patch, "admissionNo")?;
    if let Some(no) = &admission_no {
        if let Some(other) = admission_taken(conn, &school_id, no)?.filter(|id| *id != student_id) {
            return Err(AppError::integrity(
                format!("admission number {no} is already in use"),
                json!({ "admissionNo": no, "studentId": other }),
            ));
        }
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE students
         SET first_name = COALESCE(?, first_name),
             last_name = COALESCE(?, last_name),
             admission_no = COALESCE(?, admission_no)
         WHERE id = ?",
        (&first_name, &last_name, &admission_no, &student_id),
    )?;
    // `classId: null` unplaces the student; an absent key leaves it alone.
    if let Some(raw) = patch.get("classId") {
        let class_id = match raw {
            Value::Null => None,
            _ => Some(req_str(patch, "classId")?),
        };
        if let Some(c) = &class_id {
            check_class(&tx, c, &school_id)?;
        }
        tx.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (&class_id, &student_id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "ok": true }))
}

fn link(conn: &Connection, parent_id: &str, student_id: &str, school_id: &str) -> AppResult<()> {
    if student_school(conn, student_id)? != school_id {
        return Err(AppError::integrity(
            "student belongs to another school",
            json!({ "parentId": parent_id, "studentId": student_id }),
        ));
    }
    conn.execute(
        "INSERT OR IGNORE INTO parent_students(parent_id, student_id) VALUES(?, ?)",
        (parent_id, student_id),
    )?;
    Ok(())
}

fn parents_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let first_name = req_str(params, "firstName")?;
    let last_name = req_str(params, "lastName")?;
    let email = opt_str(params, "email")?;
    let student_ids: Vec<String> = match params.get("studentIds") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_params("studentIds must be strings"))
            })
            .collect::<AppResult<_>>()?,
        Some(_) => return Err(AppError::bad_params("studentIds must be an array")),
    };

    let parent_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO parents(id, school_id, first_name, last_name, email) VALUES(?, ?, ?, ?, ?)",
        (&parent_id, &school_id, &first_name, &last_name, &email),
    )?;
    for student_id in &student_ids {
        link(&tx, &parent_id, student_id, &school_id)?;
    }
    tx.commit()?;
    Ok(json!({ "parentId": parent_id, "linked": student_ids.len() }))
}

fn parents_link_student(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let parent_id = req_str(params, "parentId")?;
    let student_id = req_str(params, "studentId")?;
    let school_id = parent_school(conn, &parent_id)?;
    actor.require_school(&school_id)?;

    link(conn, &parent_id, &student_id, &school_id)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "teachers.list" => teachers_list(state, &req.params),
        "teachers.create" => teachers_create(state, &req.params),
        "students.list" => students_list(state, &req.params),
        "students.create" => students_create(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "parents.create" => parents_create(state, &req.params),
        "parents.linkStudent" => parents_link_student(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
