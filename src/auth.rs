use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Teacher,
    Student,
    Parent,
}

pub const STAFF: &[Role] = &[Role::SuperAdmin, Role::Admin, Role::Teacher];
pub const ADMINS: &[Role] = &[Role::SuperAdmin, Role::Admin];

/// The already-authenticated caller, passed as `params.actor`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub role: Role,
    #[serde(default)]
    pub school_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Actor {
    pub fn from_params(params: &serde_json::Value) -> AppResult<Self> {
        let Some(raw) = params.get("actor") else {
            return Err(AppError::Unauthorized("missing actor".into()));
        };
        let actor: Actor = serde_json::from_value(raw.clone())
            .map_err(|e| AppError::Unauthorized(format!("invalid actor: {e}")))?;
        if actor.role != Role::SuperAdmin && actor.school_id.is_none() {
            return Err(AppError::Unauthorized("actor.schoolId is required".into()));
        }
        if matches!(actor.role, Role::Teacher | Role::Student | Role::Parent) && actor.user_id.is_none() {
            return Err(AppError::Unauthorized("actor.userId is required".into()));
        }
        Ok(actor)
    }

    pub fn require_role(&self, allowed: &[Role]) -> AppResult<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::Unauthorized(format!(
                "role {:?} may not perform this action",
                self.role
            )))
        }
    }

    /// Tenant check: everyone except a super admin is pinned to one school.
    pub fn require_school(&self, school_id: &str) -> AppResult<()> {
        if self.role == Role::SuperAdmin || self.school_id.as_deref() == Some(school_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "resource belongs to another school".into(),
            ))
        }
    }

    /// School an operation applies to: the actor's own school, or for a
    /// super admin the one named in the request.
    pub fn target_school(&self, requested: Option<&str>) -> AppResult<String> {
        match (self.role, requested, self.school_id.as_deref()) {
            (Role::SuperAdmin, Some(s), _) => Ok(s.to_string()),
            (Role::SuperAdmin, None, _) => Err(AppError::bad_params("missing schoolId")),
            (_, Some(s), Some(own)) if s != own => Err(AppError::Forbidden(
                "resource belongs to another school".into(),
            )),
            (_, _, Some(own)) => Ok(own.to_string()),
            (_, _, None) => Err(AppError::Unauthorized("actor.schoolId is required".into())),
        }
    }

    pub fn user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or_default()
    }
}
