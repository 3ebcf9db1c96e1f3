//! Caller identity injected by the upstream identity layer.
//!
//! - `x-user-id`    -> caller UUID
//! - `x-user-roles` -> JSON array (`["admin"]`) or comma-separated list
//!
//! Missing or unparsable headers yield an anonymous caller with no roles.

use crate::errors::{CatalogError, CatalogResult};
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use std::convert::Infallible;
use tracing::debug;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub id: Option<Uuid>,
    pub roles: Vec<String>,
}

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok());
        let roles = headers
            .get(USER_ROLES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(parse_roles)
            .unwrap_or_default();
        Self { id, roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// The caller id, provided the caller carries `role`.
    pub fn require_role(&self, role: &str) -> CatalogResult<Uuid> {
        match self.id {
            Some(id) if self.has_role(role) => Ok(id),
            Some(id) => {
                debug!(caller = %id, role, "caller lacks required role");
                Err(CatalogError::AccessDenied(format!("role `{}` required", role)))
            }
            None => Err(CatalogError::AccessDenied(
                "authenticated caller required".into(),
            )),
        }
    }
}

fn parse_roles(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        return serde_json::from_str::<Vec<String>>(raw).unwrap_or_default();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(String::from)
        .collect()
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller::from_headers(&parts.headers))
    }
}
