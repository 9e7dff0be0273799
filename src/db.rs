use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "school.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            default_grading_system_id TEXT,
            created_at TEXT
        )",
        [],
    )?;
    // Workspaces from before the per-school default pointer.
    ensure_schools_default_grading_system(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_sessions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_school ON academic_sessions(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES academic_sessions(id),
            UNIQUE(session_id, sequence)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_session ON terms(session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            level TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_terms(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(class_id, term_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_terms_term ON class_terms(term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_school ON teachers(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_term_subjects(
            class_term_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT,
            PRIMARY KEY(class_term_id, subject_id),
            FOREIGN KEY(class_term_id) REFERENCES class_terms(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cts_teacher ON class_term_subjects(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            class_id TEXT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            admission_no TEXT NOT NULL,
            admission_year INTEGER NOT NULL,
            created_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(school_id, admission_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS parents(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS parent_students(
            parent_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(parent_id, student_id),
            FOREIGN KEY(parent_id) REFERENCES parents(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_systems(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            pass_mark REAL NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_levels(
            id TEXT PRIMARY KEY,
            grading_system_id TEXT NOT NULL,
            min_score REAL NOT NULL,
            max_score REAL NOT NULL,
            grade TEXT NOT NULL,
            remark TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(grading_system_id) REFERENCES grading_systems(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_levels_system ON grade_levels(grading_system_id)",
        [],
    )?;
    migrate_grading_default_flag(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_scores(
            class_term_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            ca1 REAL,
            ca2 REAL,
            ca3 REAL,
            exam REAL,
            is_absent INTEGER NOT NULL DEFAULT 0,
            is_exempt INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            PRIMARY KEY(class_term_id, student_id, subject_id),
            FOREIGN KEY(class_term_id) REFERENCES class_terms(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_scores_student ON subject_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admission_sequences(
            school_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            last_value INTEGER NOT NULL,
            PRIMARY KEY(school_id, year),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    tracing::debug!(workspace = %workspace.display(), "database ready");
    Ok(conn)
}

fn ensure_schools_default_grading_system(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "schools", "default_grading_system_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE schools ADD COLUMN default_grading_system_id TEXT",
        [],
    )?;
    Ok(())
}

fn migrate_grading_default_flag(conn: &Connection) -> anyhow::Result<()> {
    // Older workspaces flagged the default on grading_systems.is_default.
    // Carry the flag over to the school pointer, then clear it so a default
    // cleared later is not restored on the next open.
    if !table_has_column(conn, "grading_systems", "is_default")? {
        return Ok(());
    }
    let tx = conn.unchecked_transaction()?;
    let moved = tx.execute(
        "UPDATE schools
         SET default_grading_system_id = (
           SELECT gs.id FROM grading_systems gs
           WHERE gs.school_id = schools.id AND gs.is_default = 1
           ORDER BY gs.rowid
           LIMIT 1
         )
         WHERE default_grading_system_id IS NULL
           AND EXISTS (
             SELECT 1 FROM grading_systems gs
             WHERE gs.school_id = schools.id AND gs.is_default = 1
           )",
        [],
    )?;
    tx.execute("UPDATE grading_systems SET is_default = 0 WHERE is_default <> 0", [])?;
    tx.commit()?;
    if moved > 0 {
        tracing::info!(schools = moved, "migrated grading system default flags");
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_creates_schema_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        assert!(table_has_column(&conn, "subject_scores", "is_exempt").unwrap());
        assert!(table_has_column(&conn, "schools", "default_grading_system_id").unwrap());
        drop(conn);
        let again = open_db(dir.path()).unwrap();
        assert!(table_has_column(&again, "students", "admission_no").unwrap());
    }

    #[test]
    fn settings_round_trip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        assert!(settings_get_json(&conn, "k").unwrap().is_none());
        settings_set_json(&conn, "k", &json!({ "a": 1 })).unwrap();
        settings_set_json(&conn, "k", &json!({ "a": 2 })).unwrap();
        assert_eq!(settings_get_json(&conn, "k").unwrap(), Some(json!({ "a": 2 })));
    }

    #[test]
    fn legacy_default_flag_moves_to_school_pointer() {
        let dir = tempfile::tempdir().unwrap();
        {
            let old = Connection::open(dir.path().join(DB_FILE)).unwrap();
            old.execute_batch(
                "CREATE TABLE schools(id TEXT PRIMARY KEY, name TEXT NOT NULL, code TEXT NOT NULL UNIQUE, created_at TEXT);
                 CREATE TABLE grading_systems(id TEXT PRIMARY KEY, school_id TEXT NOT NULL, name TEXT NOT NULL,
                    pass_mark REAL NOT NULL, is_default INTEGER NOT NULL DEFAULT 0);
                 INSERT INTO schools(id, name, code) VALUES('s1', 'One', 'ONE'), ('s2', 'Two', 'TWO');
                 INSERT INTO grading_systems(id, school_id, name, pass_mark, is_default)
                   VALUES('g1', 's1', 'Old', 40, 0), ('g2', 's1', 'New', 50, 1), ('g3', 's2', 'Other', 45, 0);",
            )
            .unwrap();
        }
        let conn = open_db(dir.path()).unwrap();
        let d1: Option<String> = conn
            .query_row("SELECT default_grading_system_id FROM schools WHERE id = 's1'", [], |r| r.get(0))
            .unwrap();
        let d2: Option<String> = conn
            .query_row("SELECT default_grading_system_id FROM schools WHERE id = 's2'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(d1.as_deref(), Some("g2"));
        assert_eq!(d2, None);
    }

    #[test]
    fn cleared_default_stays_cleared_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let old = Connection::open(dir.path().join(DB_FILE)).unwrap();
            old.execute_batch(
                "CREATE TABLE schools(id TEXT PRIMARY KEY, name TEXT NOT NULL, code TEXT NOT NULL UNIQUE, created_at TEXT);
                 CREATE TABLE grading_systems(id TEXT PRIMARY KEY, school_id TEXT NOT NULL, name TEXT NOT NULL,
                    pass_mark REAL NOT NULL, is_default INTEGER NOT NULL DEFAULT 0);
                 INSERT INTO schools(id, name, code) VALUES('s1', 'One', 'ONE');
                 INSERT INTO grading_systems(id, school_id, name, pass_mark, is_default)
                   VALUES('g1', 's1', 'Old', 40, 0), ('g2', 's1', 'New', 50, 1);",
            )
            .unwrap();
        }
        {
            let conn = open_db(dir.path()).unwrap();
            conn.execute("UPDATE schools SET default_grading_system_id = NULL WHERE id = 's1'", [])
                .unwrap();
        }
        let conn = open_db(dir.path()).unwrap();
        let d1: Option<String> = conn
            .query_row("SELECT default_grading_system_id FROM schools WHERE id = 's1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(d1, None);
    }
}
