use crate::auth::{Actor, ADMINS};
use crate::calendar::{self, TermWindow};
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    as_of, conn, opt_str, parse_date, req_date, req_str, require_school_exists, session_school,
    term_school,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

struct SessionRow {
    id: String,
    name: String,
    start: NaiveDate,
    end: NaiveDate,
}

fn load_session(conn: &Connection, session_id: &str) -> AppResult<SessionRow> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT name, start_date, end_date FROM academic_sessions WHERE id = ?",
            [session_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((name, start, end)) = row else {
        return Err(AppError::not_found_id("session", session_id));
    };
    Ok(SessionRow {
        id: session_id.to_string(),
        name,
        start: parse_date(&start, "startDate")?,
        end: parse_date(&end, "endDate")?,
    })
}

fn load_terms(conn: &Connection, session_id: &str) -> AppResult<Vec<(TermWindow, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, start_date, end_date, sequence
         FROM terms
         WHERE session_id = ?
         ORDER BY start_date, sequence",
    )?;
    let raw = stmt
        .query_map([session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(id, name, start, end, sequence)| {
            Ok((
                TermWindow {
                    id,
                    name,
                    start: parse_date(&start, "startDate")?,
                    end: parse_date(&end, "endDate")?,
                },
                sequence,
            ))
        })
        .collect()
}

fn sessions_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.start_date, s.end_date,
           (SELECT COUNT(*) FROM terms t WHERE t.session_id = s.id) AS term_count
         FROM academic_sessions s
         WHERE s.school_id = ?
         ORDER BY s.start_date DESC",
    )?;
    let sessions = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "termCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "sessions": sessions }))
}

fn sessions_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let name = req_str(params, "name")?;
    let start = req_date(params, "startDate")?;
    let end = req_date(params, "endDate")?;
    if end < start {
        return Err(AppError::bad_params("endDate must not be before startDate"));
    }
    let dup: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM academic_sessions WHERE school_id = ? AND name = ?",
            (&school_id, &name),
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(AppError::bad_params(format!("session {name} already exists")));
    }

    let session_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_sessions(id, school_id, name, start_date, end_date) VALUES(?, ?, ?, ?, ?)",
        (
            &session_id,
            &school_id,
            &name,
            start.to_string(),
            end.to_string(),
        ),
    )?;
    tracing::info!(school_id = %school_id, session_id = %session_id, "session created");
    Ok(json!({ "sessionId": session_id }))
}

const DELETE_TERM_CHILDREN: [&str; 3] = [
    "DELETE FROM subject_scores WHERE class_term_id IN (SELECT id FROM class_terms WHERE term_id = ?)",
    "DELETE FROM class_term_subjects WHERE class_term_id IN (SELECT id FROM class_terms WHERE term_id = ?)",
    "DELETE FROM class_terms WHERE term_id = ?",
];

fn delete_term_rows(conn: &Connection, term_id: &str) -> AppResult<()> {
    for sql in DELETE_TERM_CHILDREN {
        conn.execute(sql, [term_id])?;
    }
    conn.execute("DELETE FROM terms WHERE id = ?", [term_id])?;
    Ok(())
}

fn sessions_delete(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let session_id = req_str(params, "sessionId")?;
    actor.require_school(&session_school(conn, &session_id)?)?;

    let tx = conn.unchecked_transaction()?;
    let term_ids: Vec<String> = {
        let mut stmt = tx.prepare("SELECT id FROM terms WHERE session_id = ?")?;
        let ids = stmt
            .query_map([&session_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    for term_id in &term_ids {
        delete_term_rows(&tx, term_id)?;
    }
    tx.execute("DELETE FROM academic_sessions WHERE id = ?", [&session_id])?;
    tx.commit()?;
    Ok(json!({ "ok": true, "deletedTerms": term_ids.len() }))
}

fn terms_list(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let session_id = req_str(params, "sessionId")?;
    actor.require_school(&session_school(conn, &session_id)?)?;
    let today = as_of(params)?;

    let terms: Vec<Value> = load_terms(conn, &session_id)?
        .into_iter()
        .map(|(t, sequence)| {
            json!({
                "id": t.id,
                "name": t.name,
                "sequence": sequence,
                "startDate": t.start,
                "endDate": t.end,
                "status": calendar::term_status(t.start, t.end, today),
            })
        })
        .collect();
    Ok(json!({ "terms": terms }))
}

fn terms_create(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let session_id = req_str(params, "sessionId")?;
    actor.require_school(&session_school(conn, &session_id)?)?;
    let session = load_session(conn, &session_id)?;

    let name = req_str(params, "name")?;
    let start = req_date(params, "startDate")?;
    let end = req_date(params, "endDate")?;
    if end < start {
        return Err(AppError::bad_params("endDate must not be before startDate"));
    }
    if start < session.start || end > session.end {
        return Err(AppError::bad_params(format!(
            "term must fall within the session ({} to {})",
            session.start, session.end
        )));
    }

    let existing = load_terms(conn, &session_id)?;
    if let Some((clash, _)) = existing.iter().find(|(t, _)| start <= t.end && t.start <= end) {
        return Err(AppError::bad_params(format!("term overlaps {}", clash.name)));
    }

    let sequence = match params.get("sequence").and_then(|v| v.as_i64()) {
        Some(n) if n >= 1 => {
            if existing.iter().any(|(_, s)| *s == n) {
                return Err(AppError::bad_params(format!("sequence {n} is already used")));
            }
            n
        }
        Some(_) => return Err(AppError::bad_params("sequence must be >= 1")),
        None => existing.iter().map(|(_, s)| *s).max().unwrap_or(0) + 1,
    };

    let term_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, session_id, name, sequence, start_date, end_date) VALUES(?, ?, ?, ?, ?, ?)",
        (
            &term_id,
            &session_id,
            &name,
            sequence,
            start.to_string(),
            end.to_string(),
        ),
    )?;
    Ok(json!({ "termId": term_id, "sequence": sequence }))
}

fn terms_delete(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let term_id = req_str(params, "termId")?;
    actor.require_school(&term_school(conn, &term_id)?)?;

    let tx = conn.unchecked_transaction()?;
    delete_term_rows(&tx, &term_id)?;
    tx.commit()?;
    Ok(json!({ "ok": true }))
}

/// The session holding `today`, else the latest one that already started.
fn pick_session_for(conn: &Connection, school_id: &str, today: NaiveDate) -> AppResult<String> {
    let day = today.to_string();
    let hit: Option<String> = conn
        .query_row(
            "SELECT id FROM academic_sessions
             WHERE school_id = ?1 AND start_date <= ?2
             ORDER BY (end_date >= ?2) DESC, start_date DESC
             LIMIT 1",
            (school_id, &day),
            |r| r.get(0),
        )
        .optional()?;
    hit.ok_or_else(|| AppError::not_found("session"))
}

pub fn session_calendar_for(
    conn: &Connection,
    session_id: &str,
    today: NaiveDate,
) -> AppResult<Value> {
    let session = load_session(conn, session_id)?;
    let terms: Vec<TermWindow> = load_terms(conn, session_id)?
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    let cal = calendar::session_calendar(session.start, session.end, &terms, today);
    let mut out = serde_json::to_value(cal).map_err(anyhow::Error::from)?;
    out["sessionId"] = json!(session.id);
    out["sessionName"] = json!(session.name);
    Ok(out)
}

pub fn current_session_calendar(
    conn: &Connection,
    school_id: &str,
    today: NaiveDate,
) -> AppResult<Option<Value>> {
    match pick_session_for(conn, school_id, today) {
        Ok(id) => Ok(Some(session_calendar_for(conn, &id, today)?)),
        Err(AppError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn calendar_session(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    let today = as_of(params)?;
    let session_id = match opt_str(params, "sessionId")? {
        Some(id) => {
            actor.require_school(&session_school(conn, &id)?)?;
            id
        }
        None => {
            let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
            pick_session_for(conn, &school_id, today)?
        }
    };
    session_calendar_for(conn, &session_id, today)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "sessions.list" => sessions_list(state, &req.params),
        "sessions.create" => sessions_create(state, &req.params),
        "sessions.delete" => sessions_delete(state, &req.params),
        "terms.list" => terms_list(state, &req.params),
        "terms.create" => terms_create(state, &req.params),
        "terms.delete" => terms_delete(state, &req.params),
        "calendar.session" => calendar_session(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
