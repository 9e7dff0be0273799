use crate::auth::{Actor, ADMINS, STAFF};
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    class_school, conn, opt_str, req_str, require_school_exists, subject_school, teacher_school,
    term_school,
};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

fn classes_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;

    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.level,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM class_terms ct WHERE ct.class_id = c.id) AS class_term_count
         FROM classes c
         WHERE c.school_id = ?
         ORDER BY c.name",
    )?;
    let classes = stmt
        .query_map([&school_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "level": row.get::<_, Option<String>>(2)?,
                "studentCount": row.get::<_, i64>(3)?,
                "classTermCount": row.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let name = req_str(params, "name")?;
    let level = opt_str(params, "level")?;
    let dup: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classes WHERE school_id = ? AND name = ?",
            (&school_id, &name),
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(AppError::bad_params(format!("class {name} already exists")));
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_id, name, level) VALUES(?, ?, ?, ?)",
        (&class_id, &school_id, &name, &level),
    )?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_delete(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let class_id = req_str(params, "classId")?;
    actor.require_school(&class_school(conn, &class_id)?)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM subject_scores WHERE class_term_id IN (SELECT id FROM class_terms WHERE class_id = ?)",
        [&class_id],
    )?;
    tx.execute(
        "DELETE FROM class_term_subjects WHERE class_term_id IN (SELECT id FROM class_terms WHERE class_id = ?)",
        [&class_id],
    )?;
    tx.execute("DELETE FROM class_terms WHERE class_id = ?", [&class_id])?;
    // Students outlive their class; they just become unplaced.
    tx.execute(
        "UPDATE students SET class_id = NULL WHERE class_id = ?",
        [&class_id],
    )?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])?;
    tx.commit()?;
    Ok(json!({ "ok": true }))
}

fn class_terms_open(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let class_id = req_str(params, "classId")?;
    let term_id = req_str(params, "termId")?;
    let class_school_id = class_school(conn, &class_id)?;
    actor.require_school(&class_school_id)?;
    let term_school_id = term_school(conn, &term_id)?;
    if term_school_id != class_school_id {
        return Err(AppError::integrity(
            "class and term belong to different schools",
            json!({ "classId": class_id, "termId": term_id }),
        ));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM class_terms WHERE class_id = ? AND term_id = ?",
            (&class_id, &term_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(json!({ "classTermId": id, "created": false }));
    }

    let class_term_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_terms(id, class_id, term_id) VALUES(?, ?, ?)",
        (&class_term_id, &class_id, &term_id),
    )?;
    Ok(json!({ "classTermId": class_term_id, "created": true }))
}

fn class_terms_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let class_id = opt_str(params, "classId")?;
    let term_id = opt_str(params, "termId")?;
    let school_id = match (&class_id, &term_id) {
        (Some(c), _) => class_school(conn, c)?,
        (None, Some(t)) => term_school(conn, t)?,
        (None, None) => return Err(AppError::bad_params("classId or termId is required")),
    };
    actor.require_school(&school_id)?;

    let mut stmt = conn.prepare(
        "SELECT ct.id, c.id, c.name, t.id, t.name, t.start_date, t.end_date,
           (SELECT COUNT(*) FROM class_term_subjects cts WHERE cts.class_term_id = ct.id)
         FROM class_terms ct
         JOIN classes c ON c.id = ct.class_id
         JOIN terms t ON t.id = ct.term_id
         WHERE (?1 IS NULL OR ct.class_id = ?1) AND (?2 IS NULL OR ct.term_id = ?2)
         ORDER BY t.start_date, c.name",
    )?;
    let rows = stmt
        .query_map((&class_id, &term_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "className": r.get::<_, String>(2)?,
                "termId": r.get::<_, String>(3)?,
                "termName": r.get::<_, String>(4)?,
                "startDate": r.get::<_, String>(5)?,
                "endDate": r.get::<_, String>(6)?,
                "subjectCount": r.get::<_, i64>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classTerms": rows }))
}

fn subjects_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;

    if let Some(class_term_id) = opt_str(params, "classTermId")? {
        let ct = roster::class_term_info(conn, &class_term_id)?;
        actor.require_school(&ct.school_id)?;
        let subjects = roster::offered_subjects(conn, &class_term_id)?;
        return Ok(json!({ "subjects": subjects }));
    }

    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    let mut stmt = conn.prepare(
        "SELECT id, name, code FROM subjects WHERE school_id = ? ORDER BY name",
    )?;
    let subjects = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let name = req_str(params, "name")?;
    let code = opt_str(params, "code")?.map(|c| c.to_ascii_uppercase());
    let dup: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM subjects WHERE school_id = ? AND name = ?",
            (&school_id, &name),
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(AppError::bad_params(format!("subject {name} already exists")));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, school_id, name, code) VALUES(?, ?, ?, ?)",
        (&subject_id, &school_id, &name, &code),
    )?;
    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_delete(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let subject_id = req_str(params, "subjectId")?;
    actor.require_school(&subject_school(conn, &subject_id)?)?;

    let mut stmt = conn.prepare(
        "SELECT class_term_id FROM class_term_subjects WHERE subject_id = ? ORDER BY class_term_id",
    )?;
    let in_use = stmt
        .query_map([&subject_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if !in_use.is_empty() {
        return Err(AppError::integrity(
            "subject is still assigned to class terms",
            json!({ "subjectId": subject_id, "classTermIds": in_use }),
        ));
    }
    conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])?;
    Ok(json!({ "ok": true }))
}

/// Desired `(subject -> teacher)` map from `params.subjects`.
fn parse_assignments(params: &Value) -> AppResult<BTreeMap<String, Option<String>>> {
    let Some(items) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(AppError::bad_params("subjects must be an array"));
    };
    let mut out = BTreeMap::new();
    for item in items {
        let subject_id = req_str(item, "subjectId")?;
        let teacher_id = opt_str(item, "teacherId")?;
        if out.insert(subject_id.clone(), teacher_id).is_some() {
            return Err(AppError::bad_params(format!(
                "subject {subject_id} listed more than once"
            )));
        }
    }
    Ok(out)
}

/// Diffs the class term's current assignments against the desired list and
/// applies removals, additions and teacher changes in one transaction.
fn class_terms_set_subjects(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let class_term_id = req_str(params, "classTermId")?;
    let ct = roster::class_term_info(conn, &class_term_id)?;
    actor.require_school(&ct.school_id)?;
    let desired = parse_assignments(params)?;

    for (subject_id, teacher_id) in &desired {
        if subject_school(conn, subject_id)? != ct.school_id {
            return Err(AppError::integrity(
                "subject belongs to another school",
                json!({ "subjectId": subject_id, "classTermId": class_term_id }),
            ));
        }
        if let Some(t) = teacher_id {
            if teacher_school(conn, t)? != ct.school_id {
                return Err(AppError::integrity(
                    "teacher belongs to another school",
                    json!({ "teacherId": t, "classTermId": class_term_id }),
                ));
            }
        }
    }

    let current: HashMap<String, Option<String>> = roster::offered_subjects(conn, &class_term_id)?
        .into_iter()
        .map(|s| (s.id, s.teacher_id))
        .collect();

    let removed: Vec<&String> = current.keys().filter(|k| !desired.contains_key(*k)).collect();
    let added: Vec<(&String, &Option<String>)> = desired
        .iter()
        .filter(|(k, _)| !current.contains_key(*k))
        .collect();
    let changed: Vec<(&String, &Option<String>)> = desired
        .iter()
        .filter(|(k, t)| current.get(*k).is_some_and(|cur| cur != *t))
        .collect();

    let tx = conn.unchecked_transaction()?;
    for subject_id in &removed {
        tx.execute(
            "DELETE FROM subject_scores WHERE class_term_id = ? AND subject_id = ?",
            (&class_term_id, subject_id),
        )?;
        tx.execute(
            "DELETE FROM class_term_subjects WHERE class_term_id = ? AND subject_id = ?",
            (&class_term_id, subject_id),
        )?;
    }
    for (subject_id, teacher_id) in &added {
        tx.execute(
            "INSERT INTO class_term_subjects(class_term_id, subject_id, teacher_id) VALUES(?, ?, ?)",
            (&class_term_id, subject_id, teacher_id),
        )?;
    }
    for (subject_id, teacher_id) in &changed {
        tx.execute(
            "UPDATE class_term_subjects SET teacher_id = ? WHERE class_term_id = ? AND subject_id = ?",
            (teacher_id, &class_term_id, subject_id),
        )?;
    }
    tx.commit()?;

    tracing::info!(
        class_term_id = %class_term_id,
        added = added.len(),
        removed = removed.len(),
        changed = changed.len(),
        "class term subjects reconciled"
    );
    Ok(json!({
        "added": added.len(),
        "removed": removed.len(),
        "updated": changed.len(),
    }))
}

/// Teachers see the class terms and subjects they are assigned to.
fn class_terms_mine(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(STAFF)?;
    Ok(json!({ "assignments": teacher_assignments(conn, actor.user_id())? }))
}

pub fn teacher_assignments(conn: &Connection, teacher_id: &str) -> AppResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT ct.id, c.name, t.name, s.id, s.name
         FROM class_term_subjects cts
         JOIN class_terms ct ON ct.id = cts.class_term_id
         JOIN classes c ON c.id = ct.class_id
         JOIN terms t ON t.id = ct.term_id
         JOIN subjects s ON s.id = cts.subject_id
         WHERE cts.teacher_id = ?
         ORDER BY t.start_date DESC, c.name, s.name",
    )?;
    let rows = stmt
        .query_map([teacher_id], |r| {
            Ok(json!({
                "classTermId": r.get::<_, String>(0)?,
                "className": r.get::<_, String>(1)?,
                "termName": r.get::<_, String>(2)?,
                "subjectId": r.get::<_, String>(3)?,
                "subjectName": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.list" => classes_list(state, &req.params),
        "classes.create" => classes_create(state, &req.params),
        "classes.delete" => classes_delete(state, &req.params),
        "classTerms.open" => class_terms_open(state, &req.params),
        "classTerms.list" => class_terms_list(state, &req.params),
        "classTerms.mine" => class_terms_mine(state, &req.params),
        "classTerms.setSubjects" => class_terms_set_subjects(state, &req.params),
        "subjects.list" => subjects_list(state, &req.params),
        "subjects.create" => subjects_create(state, &req.params),
        "subjects.delete" => subjects_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
