use crate::auth::{Actor, ADMINS};
use crate::error::{AppError, AppResult};
use crate::grading::{self, GradeLevel, GradingSystem};
use crate::ipc::error::respond;
use crate::ipc::helpers::{conn, opt_bool, opt_f64, opt_str, req_str, require_school_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const DEFAULT_PASS_MARK: f64 = 40.0;

fn parse_levels(params: &Value) -> AppResult<Vec<GradeLevel>> {
    let Some(raw) = params.get("levels") else {
        return Err(AppError::bad_params("missing levels"));
    };
    let mut levels: Vec<GradeLevel> = serde_json::from_value(raw.clone())
        .map_err(|e| AppError::bad_params(format!("invalid levels: {e}")))?;
    for l in levels.iter_mut() {
        l.grade = l.grade.trim().to_string();
        l.remark = l.remark.trim().to_string();
    }
    grading::validate_levels(&levels).map_err(|e| AppError::bad_params(e.to_string()))?;
    Ok(levels)
}

fn parse_pass_mark(params: &Value) -> AppResult<Option<f64>> {
    let pass_mark = opt_f64(params, "passMark")?;
    if let Some(p) = pass_mark {
        grading::validate_pass_mark(p).map_err(|e| AppError::bad_params(e.to_string()))?;
    }
    Ok(pass_mark)
}

fn write_levels(conn: &Connection, grading_system_id: &str, levels: &[GradeLevel]) -> AppResult<()> {
    conn.execute(
        "DELETE FROM grade_levels WHERE grading_system_id = ?",
        [grading_system_id],
    )?;
    let mut sorted: Vec<&GradeLevel> = levels.iter().collect();
    sorted.sort_by(|a, b| b.min_score.total_cmp(&a.min_score));
    for (i, l) in sorted.iter().enumerate() {
        conn.execute(
            "INSERT INTO grade_levels(id, grading_system_id, min_score, max_score, grade, remark, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                grading_system_id,
                l.min_score,
                l.max_score,
                &l.grade,
                &l.remark,
                i as i64,
            ),
        )?;
    }
    Ok(())
}

fn default_id(conn: &Connection, school_id: &str) -> AppResult<Option<String>> {
    let id: Option<Option<String>> = conn
        .query_row(
            "SELECT default_grading_system_id FROM schools WHERE id = ?",
            [school_id],
            |r| r.get(0),
        )
        .optional()?;
    match id {
        Some(v) => Ok(v),
        None => Err(AppError::not_found_id("school", school_id)),
    }
}

/// Stored system plus a tenant check against the caller.
fn load_owned(conn: &Connection, actor: &Actor, grading_system_id: &str) -> AppResult<(String, GradingSystem)> {
    let Some((school_id, system)) = grading::load_grading_system(conn, grading_system_id)? else {
        return Err(AppError::not_found_id("grading system", grading_system_id));
    };
    actor.require_school(&school_id)?;
    Ok((school_id, system))
}

fn system_json(system: &GradingSystem, is_default: bool, source: &str) -> Value {
    json!({
        "id": system.id,
        "name": system.name,
        "passMark": system.pass_mark,
        "levels": system.levels(),
        "isDefault": is_default,
        "source": source,
    })
}

fn grading_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    let default_system = default_id(conn, &school_id)?;

    let mut stmt = conn.prepare(
        "SELECT g.id, g.name, g.pass_mark,
           (SELECT COUNT(*) FROM grade_levels l WHERE l.grading_system_id = g.id)
         FROM grading_systems g
         WHERE g.school_id = ?
         ORDER BY g.name",
    )?;
    let systems = stmt
        .query_map([&school_id], |r| {
            let id: String = r.get(0)?;
            Ok(json!({
                "isDefault": default_system.as_deref() == Some(id.as_str()),
                "id": id,
                "name": r.get::<_, String>(1)?,
                "passMark": r.get::<_, f64>(2)?,
                "levelCount": r.get::<_, i64>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "gradingSystems": systems, "defaultGradingSystemId": default_system }))
}

/// A stored system by id, or the one results for the school are graded with.
fn grading_get(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;

    if let Some(id) = opt_str(params, "gradingSystemId")? {
        let (school_id, system) = load_owned(conn, &actor, &id)?;
        let is_default = default_id(conn, &school_id)?.as_deref() == Some(id.as_str());
        return Ok(system_json(&system, is_default, "stored"));
    }

    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;
    let system = grading::load_school_grading_system(conn, &school_id)?;
    let source = if system.id.is_some() { "school_default" } else { "built_in" };
    Ok(system_json(&system, system.id.is_some(), source))
}

fn set_default(conn: &Connection, school_id: &str, grading_system_id: Option<&str>) -> AppResult<()> {
    conn.execute(
        "UPDATE schools SET default_grading_system_id = ? WHERE id = ?",
        (grading_system_id, school_id),
    )?;
    Ok(())
}

fn grading_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let name = req_str(params, "name")?;
    let pass_mark = parse_pass_mark(params)?.unwrap_or(DEFAULT_PASS_MARK);
    let levels = parse_levels(params)?;
    let make_default = opt_bool(params, "setDefault")?.unwrap_or(false);

    let dup: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM grading_systems WHERE school_id = ? AND name = ?",
            (&school_id, &name),
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(AppError::bad_params(format!(
            "grading system {name} already exists"
        )));
    }

    let grading_system_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO grading_systems(id, school_id, name, pass_mark) VALUES(?, ?, ?, ?)",
        (&grading_system_id, &school_id, &name, pass_mark),
    )?;
    write_levels(&tx, &grading_system_id, &levels)?;
    if make_default {
        set_default(&tx, &school_id, Some(&grading_system_id))?;
    }
    tx.commit()?;

    tracing::info!(
        school_id = %school_id,
        grading_system_id = %grading_system_id,
        levels = levels.len(),
        is_default = make_default,
        "grading system created"
    );
    Ok(json!({ "gradingSystemId": grading_system_id, "isDefault": make_default }))
}

fn grading_set_levels(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let id = req_str(params, "gradingSystemId")?;
    load_owned(conn, &actor, &id)?;
    let levels = parse_levels(params)?;
    let pass_mark = parse_pass_mark(params)?;

    let tx = conn.unchecked_transaction()?;
    write_levels(&tx, &id, &levels)?;
    if let Some(p) = pass_mark {
        tx.execute(
            "UPDATE grading_systems SET pass_mark = ? WHERE id = ?",
            (p, &id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "ok": true, "levels": levels.len() }))
}

/// Points the school at one of its systems; `null` falls back to the
/// built-in table.
fn grading_set_default(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;

    let target = opt_str(params, "gradingSystemId")?;
    let school_id = match &target {
        Some(id) => {
            let (owner, system) = load_owned(conn, &actor, id)?;
            if system.levels().is_empty() {
                return Err(AppError::bad_params("grading system has no levels"));
            }
            owner
        }
        None => actor.target_school(opt_str(params, "schoolId")?.as_deref())?,
    };
    require_school_exists(conn, &school_id)?;
    set_default(conn, &school_id, target.as_deref())?;
    tracing::info!(school_id = %school_id, grading_system_id = ?target, "default grading system set");
    Ok(json!({ "ok": true, "defaultGradingSystemId": target }))
}

fn grading_resolve(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let Some(score) = opt_f64(params, "score")? else {
        return Err(AppError::bad_params("missing score"));
    };

    let system = match opt_str(params, "gradingSystemId")? {
        Some(id) => load_owned(conn, &actor, &id)?.1,
        None => {
            let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
            grading::load_school_grading_system(conn, &school_id)?
        }
    };
    let rounded = grading::round_2dp(score);
    let level = system.resolve(rounded);
    Ok(json!({
        "score": rounded,
        "grade": level.map(|l| l.grade.clone()),
        "remark": level.map(|l| l.remark.clone()),
        "passed": system.passes(rounded),
        "gradingSystemId": system.id,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grading.list" => grading_list(state, &req.params),
        "grading.get" => grading_get(state, &req.params),
        "grading.create" => grading_create(state, &req.params),
        "grading.setLevels" => grading_set_levels(state, &req.params),
        "grading.setDefault" => grading_set_default(state, &req.params),
        "grading.resolve" => grading_resolve(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
