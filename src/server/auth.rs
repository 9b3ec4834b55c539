//! Bearer-token callers. Tokens and roles come from the `users` list in
//! settings.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use patterns_core::Role;

use super::error::ApiError;
use super::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    pub role: Role,
}

impl Caller {
    pub fn require(&self, role: Role) -> Result<(), ApiError> {
        if self.role >= role {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "{} may not do this (needs {:?})",
                self.user, role
            )))
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Caller for the request headers, if the token is known.
pub fn identify(headers: &HeaderMap, state: &AppState) -> Option<Caller> {
    let token = bearer(headers)?;
    state.services.settings.read(|s| {
        s.user_for_token(token).map(|u| Caller {
            user: u.user.clone(),
            role: u.role,
        })
    })
}

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        identify(&parts.headers, state).ok_or(ApiError::Unauthorized)
    }
}
