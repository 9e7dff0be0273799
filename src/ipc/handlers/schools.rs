use crate::auth::{Actor, Role, ADMINS};
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{conn, now_stamp, opt_str, req_str, require_school_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn normalize_code(raw: &str) -> AppResult<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() || code.len() > 16 {
        return Err(AppError::bad_params("code must be 1..=16 characters"));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(AppError::bad_params(
            "code may only contain letters, digits and '-'",
        ));
    }
    Ok(code)
}

fn code_taken(conn: &Connection, code: &str, except_id: Option<&str>) -> AppResult<bool> {
    let hit: Option<String> = conn
        .query_row("SELECT id FROM schools WHERE code = ?", [code], |r| r.get(0))
        .optional()?;
    Ok(matches!(hit, Some(id) if Some(id.as_str()) != except_id))
}

fn schools_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;

    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.code,
           s.default_grading_system_id,
           (SELECT COUNT(*) FROM students st WHERE st.school_id = s.id) AS student_count,
           (SELECT COUNT(*) FROM teachers t WHERE t.school_id = s.id) AS teacher_count,
           (SELECT COUNT(*) FROM classes c WHERE c.school_id = s.id) AS class_count
         FROM schools s
         WHERE ?1 IS NULL OR s.id = ?1
         ORDER BY s.name",
    )?;
    let scope = if actor.role == Role::SuperAdmin {
        None
    } else {
        actor.school_id.clone()
    };
    let schools = stmt
        .query_map([scope], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "code": row.get::<_, String>(2)?,
                "defaultGradingSystemId": row.get::<_, Option<String>>(3)?,
                "studentCount": row.get::<_, i64>(4)?,
                "teacherCount": row.get::<_, i64>(5)?,
                "classCount": row.get::<_, i64>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "schools": schools }))
}

fn schools_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(&[Role::SuperAdmin])?;

    let name = req_str(params, "name")?;
    let code = normalize_code(&req_str(params, "code")?)?;
    if code_taken(conn, &code, None)? {
        return Err(AppError::bad_params(format!("school code {code} is already in use")));
    }

    let school_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name, code, created_at) VALUES(?, ?, ?, ?)",
        (&school_id, &name, &code, now_stamp()),
    )?;
    tracing::info!(school_id = %school_id, code = %code, "school created");
    Ok(json!({ "schoolId": school_id, "name": name, "code": code }))
}

fn schools_update(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = req_str(params, "schoolId")?;
    require_school_exists(conn, &school_id)?;
    actor.require_school(&school_id)?;

    let Some(patch) = params.get("patch").filter(|p| p.is_object()) else {
        return Err(AppError::bad_params("patch must be an object"));
    };
    let name = opt_str(patch, "name")?;
    let code = match opt_str(patch, "code")? {
        Some(c) => Some(normalize_code(&c)?),
        None => None,
    };
    if let Some(c) = &code {
        if code_taken(conn, c, Some(&school_id))? {
            return Err(AppError::bad_params(format!("school code {c} is already in use")));
        }
    }

    conn.execute(
        "UPDATE schools SET name = COALESCE(?, name), code = COALESCE(?, code) WHERE id = ?",
        (name, code, &school_id),
    )?;
    Ok(json!({ "ok": true }))
}

/// Removes a school and every row that hangs off it. No ON DELETE CASCADE:
/// children go first, in dependency order.
fn delete_school_rows(conn: &Connection, school_id: &str) -> AppResult<()> {
    let steps: [(&str, &str); 16] = [
        (
            "subject_scores",
            "DELETE FROM subject_scores WHERE class_term_id IN (
               SELECT ct.id FROM class_terms ct JOIN classes c ON c.id = ct.class_id
               WHERE c.school_id = ?)",
        ),
        (
            "class_term_subjects",
            "DELETE FROM class_term_subjects WHERE class_term_id IN (
               SELECT ct.id FROM class_terms ct JOIN classes c ON c.id = ct.class_id
               WHERE c.school_id = ?)",
        ),
        (
            "class_terms",
            "DELETE FROM class_terms WHERE class_id IN (SELECT id FROM classes WHERE school_id = ?)",
        ),
        (
            "parent_students",
            "DELETE FROM parent_students WHERE student_id IN (SELECT id FROM students WHERE school_id = ?)",
        ),
        ("parents", "DELETE FROM parents WHERE school_id = ?"),
        ("students", "DELETE FROM students WHERE school_id = ?"),
        ("teachers", "DELETE FROM teachers WHERE school_id = ?"),
        (
            "schools",
            "UPDATE schools SET default_grading_system_id = NULL WHERE id = ?",
        ),
        (
            "grade_levels",
            "DELETE FROM grade_levels WHERE grading_system_id IN (
               SELECT id FROM grading_systems WHERE school_id = ?)",
        ),
        ("grading_systems", "DELETE FROM grading_systems WHERE school_id = ?"),
        (
            "terms",
            "DELETE FROM terms WHERE session_id IN (SELECT id FROM academic_sessions WHERE school_id = ?)",
        ),
        ("academic_sessions", "DELETE FROM academic_sessions WHERE school_id = ?"),
        ("subjects", "DELETE FROM subjects WHERE school_id = ?"),
        ("classes", "DELETE FROM classes WHERE school_id = ?"),
        ("admission_sequences", "DELETE FROM admission_sequences WHERE school_id = ?"),
        ("schools", "DELETE FROM schools WHERE id = ?"),
    ];
    for (table, sql) in steps {
        conn.execute(sql, [school_id]).map_err(|e| {
            tracing::error!(table, error = %e, "school delete step failed");
            AppError::Db(e)
        })?;
    }
    conn.execute(
        "DELETE FROM settings WHERE key LIKE ?",
        [format!("school:{school_id}:%")],
    )?;
    Ok(())
}

fn schools_delete(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(&[Role::SuperAdmin])?;
    let school_id = req_str(params, "schoolId")?;
    require_school_exists(conn, &school_id)?;

    let tx = conn.unchecked_transaction()?;
    delete_school_rows(&tx, &school_id)?;
    tx.commit()?;
    tracing::info!(school_id = %school_id, "school deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "schools.list" => schools_list(state, &req.params),
        "schools.create" => schools_create(state, &req.params),
        "schools.update" => schools_update(state, &req.params),
        "schools.delete" => schools_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
