use crate::compiler::SubjectAssessment;
use crate::error::{AppError, AppResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassTermInfo {
    pub id: String,
    pub class_id: String,
    pub class_name: String,
    pub term_id: String,
    pub term_name: String,
    pub session_name: String,
    pub school_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInfo {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub teacher_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub admission_no: Option<String>,
}

impl RosterStudent {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

pub fn class_term_info(conn: &Connection, class_term_id: &str) -> AppResult<ClassTermInfo> {
    let row = conn
        .query_row(
            "SELECT ct.id, c.id, c.name, t.id, t.name, s.name, c.school_id
             FROM class_terms ct
             JOIN classes c ON c.id = ct.class_id
             JOIN terms t ON t.id = ct.term_id
             JOIN academic_sessions s ON s.id = t.session_id
             WHERE ct.id = ?",
            [class_term_id],
            |r| {
                Ok(ClassTermInfo {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    class_name: r.get(2)?,
                    term_id: r.get(3)?,
                    term_name: r.get(4)?,
                    session_name: r.get(5)?,
                    school_id: r.get(6)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| AppError::not_found_id("class term", class_term_id))
}

pub fn offered_subjects(conn: &Connection, class_term_id: &str) -> rusqlite::Result<Vec<SubjectInfo>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.code, cts.teacher_id
         FROM class_term_subjects cts
         JOIN subjects s ON s.id = cts.subject_id
         WHERE cts.class_term_id = ?
         ORDER BY s.name, s.id",
    )?;
    let rows = stmt
        .query_map([class_term_id], |r| {
            Ok(SubjectInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
                teacher_id: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Students currently in the class plus anyone who already has scores in
/// this class term (e.g. moved to another class since).
pub fn class_term_students(
    conn: &Connection,
    class_term: &ClassTermInfo,
) -> rusqlite::Result<Vec<RosterStudent>> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, admission_no
         FROM students
         WHERE class_id = ?1
            OR id IN (SELECT student_id FROM subject_scores WHERE class_term_id = ?2)
         ORDER BY last_name, first_name, id",
    )?;
    let rows = stmt
        .query_map((&class_term.class_id, &class_term.id), |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                admission_no: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `(student_id, assessment)` for every recorded score in the class term.
pub fn score_rows(
    conn: &Connection,
    class_term_id: &str,
) -> rusqlite::Result<Vec<(String, SubjectAssessment)>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, subject_id, ca1, ca2, ca3, exam, is_absent, is_exempt
         FROM subject_scores
         WHERE class_term_id = ?
         ORDER BY student_id, subject_id",
    )?;
    let rows = stmt
        .query_map([class_term_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                SubjectAssessment {
                    subject_id: r.get(1)?,
                    ca1: r.get(2)?,
                    ca2: r.get(3)?,
                    ca3: r.get(4)?,
                    exam: r.get(5)?,
                    is_absent: r.get::<_, i64>(6)? != 0,
                    is_exempt: r.get::<_, i64>(7)? != 0,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
