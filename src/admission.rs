use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TEMPLATE: &str = "{CODE}/{YEAR}/{SEQ}";
pub const DEFAULT_PADDING: usize = 4;
const MAX_PADDING: usize = 10;
const TOKENS: [&str; 4] = ["CODE", "YEAR", "YY", "SEQ"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionFormat {
    pub template: String,
    pub padding: usize,
    pub start_at: i64,
}

impl Default for AdmissionFormat {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            padding: DEFAULT_PADDING,
            start_at: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template must not be empty")]
    Empty,
    #[error("template must contain {{SEQ}}")]
    MissingSequence,
    #[error("unknown template token {{{0}}}")]
    UnknownToken(String),
    #[error("unterminated '{{' in template")]
    Unterminated,
    #[error("padding must be within 1..=10")]
    Padding,
}

#[derive(Debug, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    Token(&'a str),
}

fn split_template(template: &str) -> Result<Vec<Piece<'_>>, TemplateError> {
    let mut pieces = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            pieces.push(Piece::Text(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(TemplateError::Unterminated);
        };
        pieces.push(Piece::Token(&after[..close]));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty);
    }
    let pieces = split_template(template)?;
    let mut has_seq = false;
    for p in &pieces {
        if let Piece::Token(t) = p {
            if !TOKENS.contains(t) {
                return Err(TemplateError::UnknownToken((*t).to_string()));
            }
            has_seq |= *t == "SEQ";
        }
    }
    if !has_seq {
        return Err(TemplateError::MissingSequence);
    }
    Ok(())
}

pub fn validate_padding(padding: usize) -> Result<(), TemplateError> {
    if (1..=MAX_PADDING).contains(&padding) {
        Ok(())
    } else {
        Err(TemplateError::Padding)
    }
}

/// Renders an admission number. Templates are validated when saved, so
/// unknown tokens are copied through literally here.
pub fn format_admission_number(format: &AdmissionFormat, school_code: &str, year: i32, seq: i64) -> String {
    let pieces = match split_template(&format.template) {
        Ok(p) => p,
        Err(_) => return format!("{}/{}/{:0width$}", school_code, year, seq, width = format.padding),
    };
    let mut out = String::new();
    for p in pieces {
        match p {
            Piece::Text(t) => out.push_str(t),
            Piece::Token("CODE") => out.push_str(school_code),
            Piece::Token("YEAR") => out.push_str(&format!("{:04}", year)),
            Piece::Token("YY") => out.push_str(&format!("{:02}", year.rem_euclid(100))),
            Piece::Token("SEQ") => out.push_str(&format!("{:0width$}", seq, width = format.padding)),
            Piece::Token(other) => {
                out.push('{');
                out.push_str(other);
                out.push('}');
            }
        }
    }
    out
}

/// Reserves the next sequence value for `(school, year)`. Call inside the
/// transaction that inserts the student so a failed insert gives it back.
pub fn allocate_sequence(conn: &Connection, school_id: &str, year: i32, start_at: i64) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO admission_sequences(school_id, year, last_value)
         VALUES(?, ?, ?)
         ON CONFLICT(school_id, year) DO NOTHING",
        (school_id, year, start_at - 1),
    )?;
    conn.execute(
        "UPDATE admission_sequences SET last_value = last_value + 1
         WHERE school_id = ? AND year = ?",
        (school_id, year),
    )?;
    conn.query_row(
        "SELECT last_value FROM admission_sequences WHERE school_id = ? AND year = ?",
        (school_id, year),
        |r| r.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(template: &str, padding: usize) -> AdmissionFormat {
        AdmissionFormat {
            template: template.to_string(),
            padding,
            start_at: 1,
        }
    }

    #[test]
    fn default_format_pads_the_sequence() {
        let f = AdmissionFormat::default();
        assert_eq!(format_admission_number(&f, "GHS", 2024, 7), "GHS/2024/0007");
        assert_eq!(format_admission_number(&f, "GHS", 2024, 12345), "GHS/2024/12345");
    }

    #[test]
    fn two_digit_year_and_literal_text() {
        let f = fmt("ADM-{YY}{SEQ}", 3);
        assert_eq!(format_admission_number(&f, "X", 2025, 42), "ADM-25042");
        let f = fmt("{SEQ}", 1);
        assert_eq!(format_admission_number(&f, "X", 2009, 5), "5");
    }

    #[test]
    fn template_validation() {
        assert!(validate_template("{CODE}/{YEAR}/{SEQ}").is_ok());
        assert_eq!(validate_template(""), Err(TemplateError::Empty));
        assert_eq!(validate_template("{CODE}/{YEAR}"), Err(TemplateError::MissingSequence));
        assert_eq!(
            validate_template("{SEQ}-{MONTH}"),
            Err(TemplateError::UnknownToken("MONTH".into()))
        );
        assert_eq!(validate_template("{SEQ}-{CODE"), Err(TemplateError::Unterminated));
        assert!(validate_padding(0).is_err());
        assert!(validate_padding(4).is_ok());
    }

    #[test]
    fn sequences_are_per_school_and_year() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE admission_sequences(
                school_id TEXT NOT NULL,
                year INTEGER NOT NULL,
                last_value INTEGER NOT NULL,
                PRIMARY KEY(school_id, year)
            )",
            [],
        )
        .unwrap();

        assert_eq!(allocate_sequence(&conn, "s1", 2024, 1).unwrap(), 1);
        assert_eq!(allocate_sequence(&conn, "s1", 2024, 1).unwrap(), 2);
        assert_eq!(allocate_sequence(&conn, "s1", 2025, 1).unwrap(), 1);
        assert_eq!(allocate_sequence(&conn, "s2", 2024, 100).unwrap(), 100);
        assert_eq!(allocate_sequence(&conn, "s2", 2024, 100).unwrap(), 101);
        // start_at only seeds a fresh counter.
        assert_eq!(allocate_sequence(&conn, "s1", 2024, 50).unwrap(), 3);
    }
}
