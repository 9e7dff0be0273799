use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Largest distance allowed between one band's max and the next band's min.
/// Bands are written to hundredths (`60..=69.99`) and scores are rounded to
/// two decimals before lookup, so this keeps a valid table total.
const BAND_STEP: f64 = 0.01;
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeLevel {
    pub min_score: f64,
    pub max_score: f64,
    pub grade: String,
    #[serde(default)]
    pub remark: String,
}

impl GradeLevel {
    pub fn new(min_score: f64, max_score: f64, grade: &str, remark: &str) -> Self {
        Self {
            min_score,
            max_score,
            grade: grade.to_string(),
            remark: remark.to_string(),
        }
    }

    pub fn contains(&self, score: f64) -> bool {
        self.min_score <= score && score <= self.max_score
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingSystem {
    pub id: Option<String>,
    pub name: String,
    pub pass_mark: f64,
    /// Sorted by descending `min_score`.
    levels: Vec<GradeLevel>,
}

impl GradingSystem {
    pub fn new(id: Option<String>, name: String, pass_mark: f64, mut levels: Vec<GradeLevel>) -> Self {
        levels.sort_by(|a, b| {
            b.min_score
                .partial_cmp(&a.min_score)
                .unwrap_or(Ordering::Equal)
        });
        Self {
            id,
            name,
            pass_mark,
            levels,
        }
    }

    /// Fallback table for schools that never configured a default system.
    pub fn default_table() -> Self {
        Self::new(
            None,
            "Default".to_string(),
            40.0,
            vec![
                GradeLevel::new(70.0, 100.0, "A", "Excellent"),
                GradeLevel::new(60.0, 69.99, "B", "Very Good"),
                GradeLevel::new(50.0, 59.99, "C", "Good"),
                GradeLevel::new(45.0, 49.99, "D", "Fair"),
                GradeLevel::new(40.0, 44.99, "E", "Poor"),
                GradeLevel::new(0.0, 39.99, "F", "Fail"),
            ],
        )
    }

    pub fn levels(&self) -> &[GradeLevel] {
        &self.levels
    }

    pub fn resolve(&self, score: f64) -> Option<&GradeLevel> {
        resolve_grade(score, self)
    }

    pub fn passes(&self, score: f64) -> bool {
        score >= self.pass_mark
    }
}

/// First level (highest band first) whose closed range holds `score`.
/// Scores outside every band, including negatives and values above 100,
/// come back ungraded rather than clamped.
pub fn resolve_grade(score: f64, system: &GradingSystem) -> Option<&GradeLevel> {
    if !score.is_finite() {
        return None;
    }
    system.levels.iter().find(|l| l.contains(score))
}

/// Half-away-from-zero rounding to two decimals.
pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LevelError {
    #[error("a grading system needs at least one grade level")]
    Empty,
    #[error("grade label must not be empty")]
    EmptyGrade,
    #[error("level {grade} must satisfy 0 <= minScore <= maxScore <= 100")]
    OutOfRange { grade: String },
    #[error("levels {lower} and {upper} overlap")]
    Overlap { lower: String, upper: String },
    #[error("gap between {lower} (max {lower_max}) and {upper} (min {upper_min}); write bands to hundredths, e.g. 60-69.99")]
    Gap {
        lower: String,
        lower_max: f64,
        upper: String,
        upper_min: f64,
    },
    #[error("lowest level must start at 0")]
    MissingFloor,
    #[error("highest level must end at 100")]
    MissingCeiling,
    #[error("pass mark must be within 0..=100")]
    PassMark,
}

/// Checks that `levels` partitions [0, 100] without overlaps or gaps.
pub fn validate_levels(levels: &[GradeLevel]) -> Result<(), LevelError> {
    if levels.is_empty() {
        return Err(LevelError::Empty);
    }
    for l in levels {
        if l.grade.trim().is_empty() {
            return Err(LevelError::EmptyGrade);
        }
        let in_range = l.min_score.is_finite()
            && l.max_score.is_finite()
            && l.min_score >= 0.0
            && l.max_score <= 100.0
            && l.min_score <= l.max_score;
        if !in_range {
            return Err(LevelError::OutOfRange {
                grade: l.grade.clone(),
            });
        }
    }

    let mut sorted: Vec<&GradeLevel> = levels.iter().collect();
    sorted.sort_by(|a, b| {
        a.min_score
            .partial_cmp(&b.min_score)
            .unwrap_or(Ordering::Equal)
    });

    if sorted[0].min_score > EPS {
        return Err(LevelError::MissingFloor);
    }
    if sorted[sorted.len() - 1].max_score < 100.0 - EPS {
        return Err(LevelError::MissingCeiling);
    }

    for pair in sorted.windows(2) {
        let (lower, upper) = (pair[0], pair[1]);
        if upper.min_score <= lower.max_score {
            return Err(LevelError::Overlap {
                lower: lower.grade.clone(),
                upper: upper.grade.clone(),
            });
        }
        if upper.min_score - lower.max_score > BAND_STEP + EPS {
            return Err(LevelError::Gap {
                lower: lower.grade.clone(),
                lower_max: lower.max_score,
                upper: upper.grade.clone(),
                upper_min: upper.min_score,
            });
        }
    }
    Ok(())
}

pub fn validate_pass_mark(pass_mark: f64) -> Result<(), LevelError> {
    if pass_mark.is_finite() && (0.0..=100.0).contains(&pass_mark) {
        Ok(())
    } else {
        Err(LevelError::PassMark)
    }
}

pub fn load_levels(conn: &Connection, grading_system_id: &str) -> rusqlite::Result<Vec<GradeLevel>> {
    let mut stmt = conn.prepare(
        "SELECT min_score, max_score, grade, COALESCE(remark, '')
         FROM grade_levels
         WHERE grading_system_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([grading_system_id], |r| {
            Ok(GradeLevel {
                min_score: r.get(0)?,
                max_score: r.get(1)?,
                grade: r.get(2)?,
                remark: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Loads one stored grading system together with its owning school id.
pub fn load_grading_system(
    conn: &Connection,
    grading_system_id: &str,
) -> rusqlite::Result<Option<(String, GradingSystem)>> {
    let row: Option<(String, String, f64)> = conn
        .query_row(
            "SELECT school_id, name, pass_mark FROM grading_systems WHERE id = ?",
            [grading_system_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((school_id, name, pass_mark)) = row else {
        return Ok(None);
    };
    let levels = load_levels(conn, grading_system_id)?;
    Ok(Some((
        school_id,
        GradingSystem::new(Some(grading_system_id.to_string()), name, pass_mark, levels),
    )))
}

/// The school's default grading system, or the built-in table when the
/// school has none (or its default has no levels yet).
pub fn load_school_grading_system(
    conn: &Connection,
    school_id: &str,
) -> rusqlite::Result<GradingSystem> {
    let default_id: Option<String> = conn
        .query_row(
            "SELECT default_grading_system_id FROM schools WHERE id = ?",
            [school_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    if let Some(id) = default_id {
        if let Some((_, system)) = load_grading_system(conn, &id)? {
            if !system.levels().is_empty() {
                return Ok(system);
            }
        }
        tracing::warn!(school_id, grading_system_id = %id, "default grading system unusable, using built-in table");
    }
    Ok(GradingSystem::default_table())
}
