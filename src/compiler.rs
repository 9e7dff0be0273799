use crate::error::AppResult;
use crate::grading::{round_2dp, GradingSystem};
use crate::roster::{self, ClassTermInfo, RosterStudent, SubjectInfo};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

/// One subject's raw components for one student in one term.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAssessment {
    pub subject_id: String,
    #[serde(default)]
    pub ca1: Option<f64>,
    #[serde(default)]
    pub ca2: Option<f64>,
    #[serde(default)]
    pub ca3: Option<f64>,
    #[serde(default)]
    pub exam: Option<f64>,
    #[serde(default)]
    pub is_absent: bool,
    #[serde(default)]
    pub is_exempt: bool,
}

impl SubjectAssessment {
    pub fn is_counted(&self) -> bool {
        !self.is_absent && !self.is_exempt
    }

    /// Sum of the components, missing ones counting as zero.
    pub fn total(&self) -> f64 {
        [self.ca1, self.ca2, self.ca3, self.exam]
            .iter()
            .map(|c| c.unwrap_or(0.0))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub score: Option<f64>,
    pub grade: Option<String>,
    pub remark: Option<String>,
}

impl SubjectResult {
    pub fn excluded() -> Self {
        Self {
            score: None,
            grade: None,
            remark: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAggregate {
    pub subject_scores: BTreeMap<String, SubjectResult>,
    pub total_score: f64,
    pub average_score: f64,
    pub counted_subjects: usize,
    pub grade: Option<String>,
    pub remark: Option<String>,
    pub passed: bool,
}

/// Sums each counted subject, grades it, and grades the overall average.
/// Absent or exempt subjects are recorded with null score and grade and
/// stay out of both the total and the counted-subject divisor.
pub fn aggregate_student(assessments: &[SubjectAssessment], system: &GradingSystem) -> StudentAggregate {
    let mut subject_scores: BTreeMap<String, SubjectResult> = BTreeMap::new();
    let mut total_score = 0.0_f64;
    let mut counted_subjects: usize = 0;

    for a in assessments {
        if subject_scores.contains_key(&a.subject_id) {
            continue;
        }
        if !a.is_counted() {
            subject_scores.insert(a.subject_id.clone(), SubjectResult::excluded());
            continue;
        }
        let score = round_2dp(a.total());
        let level = system.resolve(score);
        subject_scores.insert(
            a.subject_id.clone(),
            SubjectResult {
                score: Some(score),
                grade: level.map(|l| l.grade.clone()),
                remark: level.map(|l| l.remark.clone()),
            },
        );
        total_score += score;
        counted_subjects += 1;
    }

    let average_score = if counted_subjects > 0 {
        round_2dp(total_score / counted_subjects as f64)
    } else {
        0.0
    };
    let level = system.resolve(average_score);

    StudentAggregate {
        subject_scores,
        total_score: round_2dp(total_score),
        average_score,
        counted_subjects,
        grade: level.map(|l| l.grade.clone()),
        remark: level.map(|l| l.remark.clone()),
        passed: counted_subjects > 0 && system.passes(average_score),
    }
}

/// Secondary ordering for equal averages: names, then admission number,
/// then id.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TieKey {
    last_name: String,
    first_name: String,
    admission_no: String,
    student_id: String,
}

impl TieKey {
    pub fn new(last_name: &str, first_name: &str, admission_no: Option<&str>, student_id: &str) -> Self {
        Self {
            last_name: last_name.to_lowercase(),
            first_name: first_name.to_lowercase(),
            admission_no: admission_no.unwrap_or_default().to_string(),
            student_id: student_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTermResult {
    pub student_id: String,
    pub display_name: String,
    pub admission_no: Option<String>,
    #[serde(flatten)]
    pub aggregate: StudentAggregate,
    pub position: Option<i64>,
    #[serde(skip)]
    tie_key: TieKey,
}

impl StudentTermResult {
    pub fn new(student: &RosterStudent, aggregate: StudentAggregate) -> Self {
        Self {
            student_id: student.id.clone(),
            display_name: student.display_name(),
            admission_no: student.admission_no.clone(),
            aggregate,
            position: None,
            tie_key: TieKey::new(
                &student.last_name,
                &student.first_name,
                student.admission_no.as_deref(),
                &student.id,
            ),
        }
    }
}

/// Positions for scores already sorted descending. Tied scores share the
/// 1-based index of the first of them, so `[90, 80, 80, 70]` gives
/// `[1, 2, 2, 4]`.
pub fn assign_positions(sorted_scores: &[f64]) -> Vec<i64> {
    let mut positions = Vec::with_capacity(sorted_scores.len());
    let mut current_position = 0_i64;
    let mut previous_score = -1.0_f64;
    for (index, &score) in sorted_scores.iter().enumerate() {
        if score != previous_score {
            current_position = index as i64 + 1;
        }
        positions.push(current_position);
        previous_score = score;
    }
    positions
}

/// Sorts by average descending (tie key ascending) and fills `position`.
/// Averages are compared after rounding to 2dp, so 66.666.. and 66.67 tie.
pub fn rank_results(results: &mut [StudentTermResult]) {
    results.sort_by(|a, b| {
        b.aggregate
            .average_score
            .partial_cmp(&a.aggregate.average_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.tie_key.cmp(&b.tie_key))
    });
    let scores: Vec<f64> = results.iter().map(|r| r.aggregate.average_score).collect();
    for (r, position) in results.iter_mut().zip(assign_positions(&scores)) {
        r.position = Some(position);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject_id: String,
    pub class_average: Option<f64>,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub graded_count: usize,
}

pub fn subject_stats(subject_ids: &[String], results: &[StudentTermResult]) -> Vec<SubjectStats> {
    subject_ids
        .iter()
        .map(|subject_id| {
            let scores: Vec<f64> = results
                .iter()
                .filter_map(|r| r.aggregate.subject_scores.get(subject_id))
                .filter_map(|s| s.score)
                .collect();
            if scores.is_empty() {
                return SubjectStats {
                    subject_id: subject_id.clone(),
                    class_average: None,
                    highest: None,
                    lowest: None,
                    graded_count: 0,
                };
            }
            let sum: f64 = scores.iter().sum();
            SubjectStats {
                subject_id: subject_id.clone(),
                class_average: Some(round_2dp(sum / scores.len() as f64)),
                highest: scores.iter().copied().reduce(f64::max),
                lowest: scores.iter().copied().reduce(f64::min),
                graded_count: scores.len(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct ResultOptions {
    pub show_positions: bool,
    pub show_subject_stats: bool,
}

impl Default for ResultOptions {
    fn default() -> Self {
        Self {
            show_positions: true,
            show_subject_stats: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassTermResults {
    pub class_term: ClassTermInfo,
    pub grading_system: GradingSystem,
    pub subjects: Vec<SubjectInfo>,
    pub students: Vec<StudentTermResult>,
    pub subject_stats: Vec<SubjectStats>,
}

/// Builds ranked results for a whole class term from stored scores.
/// Read-only; every call recomputes from the current rows.
pub fn compile_class_term(
    conn: &Connection,
    class_term: &ClassTermInfo,
    system: &GradingSystem,
    opts: ResultOptions,
) -> AppResult<ClassTermResults> {
    let started = Instant::now();
    let subjects = roster::offered_subjects(conn, &class_term.id)?;
    let students = roster::class_term_students(conn, class_term)?;

    let offered: HashSet<&str> = subjects.iter().map(|s| s.id.as_str()).collect();
    let mut by_student: HashMap<String, Vec<SubjectAssessment>> = HashMap::new();
    for (student_id, assessment) in roster::score_rows(conn, &class_term.id)? {
        if offered.contains(assessment.subject_id.as_str()) {
            by_student.entry(student_id).or_default().push(assessment);
        }
    }

    let mut results: Vec<StudentTermResult> = Vec::with_capacity(students.len());
    for s in &students {
        let assessments = by_student.remove(&s.id).unwrap_or_default();
        let mut aggregate = aggregate_student(&assessments, system);
        // Offered but never recorded: present, ungraded, not counted.
        for subject in &subjects {
            aggregate
                .subject_scores
                .entry(subject.id.clone())
                .or_insert_with(SubjectResult::excluded);
        }
        results.push(StudentTermResult::new(s, aggregate));
    }

    rank_results(&mut results);
    if !opts.show_positions {
        for r in results.iter_mut() {
            r.position = None;
        }
    }

    let subject_stats = if opts.show_subject_stats {
        let ids: Vec<String> = subjects.iter().map(|s| s.id.clone()).collect();
        subject_stats(&ids, &results)
    } else {
        Vec::new()
    };

    tracing::debug!(
        class_term_id = %class_term.id,
        students = results.len(),
        subjects = subjects.len(),
        elapsed = ?started.elapsed(),
        "compiled class term results"
    );

    Ok(ClassTermResults {
        class_term: class_term.clone(),
        grading_system: system.clone(),
        subjects,
        students: results,
        subject_stats,
    })
}
