use crate::auth::{Actor, STAFF};
use crate::compiler::{self, ClassTermResults};
use crate::error::{AppError, AppResult};
use crate::grading;
use crate::ipc::error::respond;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{authorize_student_view, conn, opt_str, req_str};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, ClassTermInfo};
use rusqlite::Connection;
use serde_json::{json, Value};

fn compile(conn: &Connection, ct: &ClassTermInfo) -> AppResult<ClassTermResults> {
    let system = grading::load_school_grading_system(conn, &ct.school_id)?;
    let opts = setup::result_options(conn, &ct.school_id)?;
    compiler::compile_class_term(conn, ct, &system, opts)
}

fn to_json<T: serde::Serialize>(v: &T) -> AppResult<Value> {
    Ok(serde_json::to_value(v).map_err(anyhow::Error::from)?)
}

fn results_class_term(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(STAFF)?;
    let class_term_id = req_str(params, "classTermId")?;
    let ct = roster::class_term_info(conn, &class_term_id)?;
    actor.require_school(&ct.school_id)?;

    to_json(&compile(conn, &ct)?)
}

/// Class terms a student has a result in: the ones for their current class
/// plus any where scores were recorded for them.
fn student_class_terms(conn: &Connection, student_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT ct.id
         FROM class_terms ct
         JOIN terms t ON t.id = ct.term_id
         WHERE ct.class_id = (SELECT class_id FROM students WHERE id = ?1)
            OR ct.id IN (SELECT class_term_id FROM subject_scores WHERE student_id = ?1)
         ORDER BY t.start_date, ct.id",
    )?;
    let ids = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn one_student(results: ClassTermResults, student_id: &str) -> AppResult<Option<Value>> {
    let class_size = results.students.len();
    let Some(mine) = results.students.into_iter().find(|r| r.student_id == student_id) else {
        return Ok(None);
    };
    Ok(Some(json!({
        "classTerm": to_json(&results.class_term)?,
        "gradingSystemId": results.grading_system.id,
        "subjects": to_json(&results.subjects)?,
        "classSize": class_size,
        "result": to_json(&mine)?,
    })))
}

/// One student's results, positioned within their class. Students see only
/// themselves; parents only linked children.
fn results_student(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let student_id = req_str(params, "studentId")?;
    authorize_student_view(conn, &actor, &student_id)?;

    let class_term_ids = match opt_str(params, "classTermId")? {
        Some(id) => vec![id],
        None => student_class_terms(conn, &student_id)?,
    };

    let mut terms = Vec::with_capacity(class_term_ids.len());
    for id in &class_term_ids {
        let ct = roster::class_term_info(conn, id)?;
        actor.require_school(&ct.school_id)?;
        if let Some(v) = one_student(compile(conn, &ct)?, &student_id)? {
            terms.push(v);
        }
    }
    if terms.is_empty() && params.get("classTermId").is_some_and(|v| !v.is_null()) {
        return Err(AppError::not_found_id("student result", &student_id));
    }
    Ok(json!({ "studentId": student_id, "terms": terms }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "results.classTerm" => results_class_term(state, &req.params),
        "results.student" => results_student(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
