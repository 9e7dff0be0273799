//! Academic calendar arithmetic: week counts, progress, and the break
//! windows between terms. Everything is derived from dates at query time.

use chrono::{Days, NaiveDate};
use serde::Serialize;

pub fn weeks(start: NaiveDate, end: NaiveDate) -> i64 {
    let days = (end - start).num_days().abs();
    (days + 6) / 7
}

pub fn completed_weeks(start: NaiveDate, end: NaiveDate, now: NaiveDate) -> i64 {
    if now < start {
        return 0;
    }
    weeks(start, now.min(end))
}

pub fn progress_percentage(completed: i64, total: i64) -> i64 {
    if total == 0 {
        return 0;
    }
    (completed as f64 / total as f64 * 100.0).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TermStatus {
    Upcoming,
    Current,
    Completed,
}

pub fn term_status(start: NaiveDate, end: NaiveDate, now: NaiveDate) -> TermStatus {
    if now < start {
        TermStatus::Upcoming
    } else if now > end {
        TermStatus::Completed
    } else {
        TermStatus::Current
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermWindow {
    pub id: String,
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakWindow {
    pub after_term_id: String,
    pub before_term_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub weeks: i64,
}

/// Gaps between consecutive terms (by start date). A break runs from the
/// day after one term ends to the day before the next starts, and is only
/// emitted when that span is non-degenerate.
pub fn break_windows(terms: &[TermWindow]) -> Vec<BreakWindow> {
    let mut sorted: Vec<&TermWindow> = terms.iter().collect();
    sorted.sort_by_key(|t| (t.start, t.end));

    let mut out = Vec::new();
    for pair in sorted.windows(2) {
        let (cur, next) = (pair[0], pair[1]);
        let (Some(start), Some(end)) = (
            cur.end.checked_add_days(Days::new(1)),
            next.start.checked_sub_days(Days::new(1)),
        ) else {
            continue;
        };
        if start < end {
            out.push(BreakWindow {
                after_term_id: cur.id.clone(),
                before_term_id: next.id.clone(),
                start_date: start,
                end_date: end,
                weeks: weeks(start, end),
            });
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermProgress {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: TermStatus,
    pub total_weeks: i64,
    pub completed_weeks: i64,
    pub progress_percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCalendar {
    pub as_of: NaiveDate,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: TermStatus,
    pub total_weeks: i64,
    pub completed_weeks: i64,
    pub progress_percentage: i64,
    pub break_weeks: i64,
    pub academic_weeks: i64,
    pub breaks: Vec<BreakWindow>,
    pub terms: Vec<TermProgress>,
    pub current_term_id: Option<String>,
}

pub fn session_calendar(
    start: NaiveDate,
    end: NaiveDate,
    terms: &[TermWindow],
    now: NaiveDate,
) -> SessionCalendar {
    let total_weeks = weeks(start, end);
    let done = completed_weeks(start, end, now);
    let breaks = break_windows(terms);
    let break_weeks: i64 = breaks.iter().map(|b| b.weeks).sum();
    if break_weeks > total_weeks {
        tracing::warn!(
            total_weeks,
            break_weeks,
            "breaks between terms exceed the session length"
        );
    }

    let mut term_rows: Vec<TermProgress> = terms
        .iter()
        .map(|t| {
            let total = weeks(t.start, t.end);
            let completed = completed_weeks(t.start, t.end, now);
            TermProgress {
                id: t.id.clone(),
                name: t.name.clone(),
                start_date: t.start,
                end_date: t.end,
                status: term_status(t.start, t.end, now),
                total_weeks: total,
                completed_weeks: completed,
                progress_percentage: progress_percentage(completed, total),
            }
        })
        .collect();
    term_rows.sort_by_key(|t| (t.start_date, t.end_date));
    let current_term_id = term_rows
        .iter()
        .find(|t| t.status == TermStatus::Current)
        .map(|t| t.id.clone());

    SessionCalendar {
        as_of: now,
        start_date: start,
        end_date: end,
        status: term_status(start, end, now),
        total_weeks,
        completed_weeks: done,
        progress_percentage: progress_percentage(done, total_weeks),
        break_weeks,
        academic_weeks: (total_weeks - break_weeks).max(0),
        breaks,
        terms: term_rows,
        current_term_id,
    }
}
