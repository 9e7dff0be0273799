use crate::auth::{Actor, Role, STAFF};
use crate::compiler::SubjectAssessment;
use crate::error::{AppError, AppResult};
use crate::grading::round_2dp;
use crate::ipc::error::respond;
use crate::ipc::helpers::{conn, now_stamp, opt_bool, opt_f64, opt_str, req_str};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, ClassTermInfo};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

const MAX_TOTAL: f64 = 100.0;

struct ScoreEntry {
    student_id: String,
    assessment: SubjectAssessment,
}

fn parse_entry(index: usize, raw: &Value) -> AppResult<ScoreEntry> {
    let at = |e: AppError| match e {
        AppError::BadParams(m) => AppError::BadParams(format!("entries[{index}]: {m}")),
        other => other,
    };
    let assessment = SubjectAssessment {
        subject_id: req_str(raw, "subjectId").map_err(at)?,
        ca1: opt_f64(raw, "ca1").map_err(at)?,
        ca2: opt_f64(raw, "ca2").map_err(at)?,
        ca3: opt_f64(raw, "ca3").map_err(at)?,
        exam: opt_f64(raw, "exam").map_err(at)?,
        is_absent: opt_bool(raw, "isAbsent").map_err(at)?.unwrap_or(false),
        is_exempt: opt_bool(raw, "isExempt").map_err(at)?.unwrap_or(false),
    };
    for (name, value) in [
        ("ca1", assessment.ca1),
        ("ca2", assessment.ca2),
        ("ca3", assessment.ca3),
        ("exam", assessment.exam),
    ] {
        if value.is_some_and(|v| v < 0.0) {
            return Err(AppError::bad_params(format!(
                "entries[{index}]: {name} must not be negative"
            )));
        }
    }
    // Components are entered to hundredths; compare the rounded sum.
    let total = round_2dp(assessment.total());
    if total > MAX_TOTAL {
        return Err(AppError::bad_params(format!(
            "entries[{index}]: total {total} exceeds {MAX_TOTAL}"
        )));
    }
    Ok(ScoreEntry {
        student_id: req_str(raw, "studentId").map_err(at)?,
        assessment,
    })
}

fn parse_entries(params: &Value) -> AppResult<Vec<ScoreEntry>> {
    let Some(items) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(AppError::bad_params("entries must be an array"));
    };
    let entries = items
        .iter()
        .enumerate()
        .map(|(i, raw)| parse_entry(i, raw))
        .collect::<AppResult<Vec<_>>>()?;
    let mut seen = HashSet::new();
    for e in &entries {
        if !seen.insert((e.student_id.as_str(), e.assessment.subject_id.as_str())) {
            return Err(AppError::bad_params(format!(
                "duplicate entry for student {} subject {}",
                e.student_id, e.assessment.subject_id
            )));
        }
    }
    Ok(entries)
}

/// Students who may carry scores in the class term: current members of the
/// class and anyone already scored there.
fn eligible_students(conn: &Connection, ct: &ClassTermInfo) -> AppResult<HashSet<String>> {
    Ok(roster::class_term_students(conn, ct)?
        .into_iter()
        .map(|s| s.id)
        .collect())
}

fn scores_get(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(STAFF)?;
    let class_term_id = req_str(params, "classTermId")?;
    let ct = roster::class_term_info(conn, &class_term_id)?;
    actor.require_school(&ct.school_id)?;
    let subject_filter = opt_str(params, "subjectId")?;
    let student_filter = opt_str(params, "studentId")?;

    let entries: Vec<Value> = roster::score_rows(conn, &class_term_id)?
        .into_iter()
        .filter(|(student_id, a)| {
            subject_filter.as_deref().map_or(true, |s| s == a.subject_id)
                && student_filter.as_deref().map_or(true, |s| s == student_id)
        })
        .map(|(student_id, a)| {
            json!({
                "studentId": student_id,
                "subjectId": a.subject_id,
                "ca1": a.ca1,
                "ca2": a.ca2,
                "ca3": a.ca3,
                "exam": a.exam,
                "isAbsent": a.is_absent,
                "isExempt": a.is_exempt,
                "total": if a.is_counted() { Some(a.total()) } else { None },
            })
        })
        .collect();
    Ok(json!({ "classTermId": class_term_id, "entries": entries }))
}

/// Writes a batch of score rows for one class term. Every entry is checked
/// before anything is written; the batch commits or fails as a whole.
fn scores_upsert(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(STAFF)?;
    let class_term_id = req_str(params, "classTermId")?;
    let ct = roster::class_term_info(conn, &class_term_id)?;
    actor.require_school(&ct.school_id)?;
    let entries = parse_entries(params)?;

    let offered: HashMap<String, Option<String>> = roster::offered_subjects(conn, &class_term_id)?
        .into_iter()
        .map(|s| (s.id, s.teacher_id))
        .collect();
    let students = eligible_students(conn, &ct)?;

    for e in &entries {
        let subject_id = &e.assessment.subject_id;
        let Some(teacher) = offered.get(subject_id) else {
            return Err(AppError::integrity(
                "subject is not offered in this class term",
                json!({ "classTermId": class_term_id, "subjectId": subject_id }),
            ));
        };
        if actor.role == Role::Teacher && teacher.as_deref() != Some(actor.user_id()) {
            return Err(AppError::Unauthorized(format!(
                "teacher is not assigned to subject {subject_id} in this class term"
            )));
        }
        if !students.contains(&e.student_id) {
            return Err(AppError::integrity(
                "student is not in this class",
                json!({ "classTermId": class_term_id, "studentId": e.student_id }),
            ));
        }
    }

    let stamp = now_stamp();
    let tx = conn.unchecked_transaction()?;
    let mut created = 0usize;
    for e in &entries {
        let a = &e.assessment;
        let existed: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM subject_scores WHERE class_term_id = ? AND student_id = ? AND subject_id = ?",
                (&class_term_id, &e.student_id, &a.subject_id),
                |r| r.get(0),
            )
            .optional()?;
        if existed.is_none() {
            created += 1;
        }
        tx.execute(
            "INSERT INTO subject_scores(class_term_id, student_id, subject_id, ca1, ca2, ca3, exam, is_absent, is_exempt, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(class_term_id, student_id, subject_id) DO UPDATE SET
               ca1 = excluded.ca1,
               ca2 = excluded.ca2,
               ca3 = excluded.ca3,
               exam = excluded.exam,
               is_absent = excluded.is_absent,
               is_exempt = excluded.is_exempt,
               updated_at = excluded.updated_at",
            (
                &class_term_id,
                &e.student_id,
                &a.subject_id,
                a.ca1,
                a.ca2,
                a.ca3,
                a.exam,
                a.is_absent as i64,
                a.is_exempt as i64,
                &stamp,
            ),
        )?;
    }
    tx.commit()?;

    tracing::info!(
        class_term_id = %class_term_id,
        written = entries.len(),
        created,
        "scores upserted"
    );
    Ok(json!({
        "written": entries.len(),
        "created": created,
        "updated": entries.len() - created,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scores.get" => scores_get(state, &req.params),
        "scores.upsert" => scores_upsert(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_rejects_negative_and_oversized_totals() {
        let neg = json!({ "studentId": "s", "subjectId": "m", "ca1": -1 });
        assert_eq!(parse_entry(0, &neg).err().map(|e| e.code()), Some("bad_params"));

        let big = json!({ "studentId": "s", "subjectId": "m", "ca1": 30, "exam": 71 });
        let msg = parse_entry(2, &big).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(msg.contains("entries[2]"), "{msg}");

        let full = json!({ "studentId": "s", "subjectId": "m", "ca1": 30, "exam": 70 });
        let e = parse_entry(0, &full).unwrap();
        assert_eq!(e.assessment.total(), 100.0);
        assert!(!e.assessment.is_absent);
    }

    #[test]
    fn decimal_components_summing_to_the_limit_are_accepted() {
        let raw = json!({
            "studentId": "s", "subjectId": "m",
            "ca1": 18.8, "ca2": 23.9, "ca3": 26.1, "exam": 31.2
        });
        assert!(parse_entry(0, &raw).is_ok());

        let over = json!({
            "studentId": "s", "subjectId": "m",
            "ca1": 18.8, "ca2": 23.9, "ca3": 26.1, "exam": 31.22
        });
        assert_eq!(parse_entry(0, &over).err().map(|e| e.code()), Some("bad_params"));
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let p = json!({ "entries": [
            { "studentId": "s", "subjectId": "m", "exam": 50 },
            { "studentId": "s", "subjectId": "m", "exam": 60 }
        ]});
        assert!(parse_entries(&p).is_err());
        assert!(parse_entries(&json!({})).is_err());
    }
}
