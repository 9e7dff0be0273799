use crate::admission::{self, AdmissionFormat};
use crate::auth::{Actor, ADMINS, STAFF};
use crate::compiler::ResultOptions;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{conn, opt_str, req_str, require_school_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Admission,
    Results,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "admission" => Some(Self::Admission),
            "results" => Some(Self::Results),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Admission => "admission",
            Self::Results => "results",
        }
    }

    fn key(self, school_id: &str) -> String {
        format!("school:{}:setup.{}", school_id, self.name())
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Admission => {
            let d = AdmissionFormat::default();
            json!({
                "template": d.template,
                "padding": d.padding,
                "startAt": d.start_at
            })
        }
        SetupSection::Results => json!({
            "showPositions": true,
            "showSubjectStats": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Admission => match k.as_str() {
                "template" => {
                    let t = parse_string_max(v, k, 64)?;
                    admission::validate_template(&t).map_err(|e| e.to_string())?;
                    obj.insert(k.clone(), Value::String(t));
                }
                "padding" => {
                    let n = parse_i64_range(v, k, 1, 10)?;
                    admission::validate_padding(n as usize).map_err(|e| e.to_string())?;
                    obj.insert(k.clone(), Value::from(n));
                }
                "startAt" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 999_999)?));
                }
                _ => return Err(format!("unknown admission field: {}", k)),
            },
            SetupSection::Results => match k.as_str() {
                "showPositions" | "showSubjectStats" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown results field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, school_id: &str, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key(school_id))? {
        if let Some(saved_obj) = saved.as_object() {
            // A stale stored field must not hide the rest of the section.
            if let Err(msg) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(school_id, section = section.name(), error = %msg, "ignoring invalid stored setup");
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

/// Admission number format for a school, merged over the defaults.
pub fn admission_format(conn: &Connection, school_id: &str) -> AppResult<AdmissionFormat> {
    let v = load_section(conn, school_id, SetupSection::Admission)?;
    let format: AdmissionFormat = serde_json::from_value(v).map_err(anyhow::Error::from)?;
    Ok(format)
}

pub fn result_options(conn: &Connection, school_id: &str) -> AppResult<ResultOptions> {
    let v = load_section(conn, school_id, SetupSection::Results)?;
    let defaults = ResultOptions::default();
    Ok(ResultOptions {
        show_positions: v
            .get("showPositions")
            .and_then(|b| b.as_bool())
            .unwrap_or(defaults.show_positions),
        show_subject_stats: v
            .get("showSubjectStats")
            .and_then(|b| b.as_bool())
            .unwrap_or(defaults.show_subject_stats),
    })
}

fn handle_setup_get(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(STAFF)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    Ok(json!({
        "admission": load_section(conn, &school_id, SetupSection::Admission)?,
        "results": load_section(conn, &school_id, SetupSection::Results)?,
    }))
}

fn handle_setup_update(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = conn(state)?;
    let actor = Actor::from_params(params)?;
    actor.require_role(ADMINS)?;
    let school_id = actor.target_school(opt_str(params, "schoolId")?.as_deref())?;
    require_school_exists(conn, &school_id)?;

    let section_raw = req_str(params, "section")?;
    let Some(section) = SetupSection::parse(&section_raw) else {
        return Err(AppError::bad_params(format!("unknown section: {section_raw}")));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(AppError::bad_params("patch must be an object"));
    };

    let mut current = load_section(conn, &school_id, section)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(AppError::BadParams)?;
    db::settings_set_json(conn, &section.key(&school_id), &current)?;
    tracing::info!(school_id = %school_id, section = section.name(), "setup updated");
    Ok(json!({ "ok": true, "section": section.name(), "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "setup.get" => handle_setup_get(state, &req.params),
        "setup.update" => handle_setup_update(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_patch_is_validated() {
        let mut cur = default_section(SetupSection::Admission);
        let ok = json!({ "template": "{CODE}-{YY}-{SEQ}", "padding": 3 });
        merge_section_patch(SetupSection::Admission, &mut cur, ok.as_object().unwrap()).unwrap();
        assert_eq!(cur["template"], "{CODE}-{YY}-{SEQ}");
        assert_eq!(cur["padding"], 3);

        let no_seq = json!({ "template": "{CODE}/{YEAR}" });
        assert!(merge_section_patch(SetupSection::Admission, &mut cur, no_seq.as_object().unwrap()).is_err());
        let unknown = json!({ "prefix": "X" });
        assert!(merge_section_patch(SetupSection::Admission, &mut cur, unknown.as_object().unwrap()).is_err());
        let wide = json!({ "padding": 11 });
        assert!(merge_section_patch(SetupSection::Admission, &mut cur, wide.as_object().unwrap()).is_err());
    }

    #[test]
    fn results_patch_requires_booleans() {
        let mut cur = default_section(SetupSection::Results);
        let p = json!({ "showPositions": false });
        merge_section_patch(SetupSection::Results, &mut cur, p.as_object().unwrap()).unwrap();
        assert_eq!(cur["showPositions"], false);
        assert_eq!(cur["showSubjectStats"], true);
        let bad = json!({ "showPositions": "no" });
        assert!(merge_section_patch(SetupSection::Results, &mut cur, bad.as_object().unwrap()).is_err());
    }

    #[test]
    fn keys_are_scoped_per_school() {
        assert_eq!(SetupSection::Admission.key("s1"), "school:s1:setup.admission");
        assert_eq!(SetupSection::parse("results").map(|s| s.name()), Some("results"));
        assert!(SetupSection::parse("printer").is_none());
    }
}
