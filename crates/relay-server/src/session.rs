//! Session lookup.
//!
//! Authentication lives outside this server; the upgrade request is expected
//! to carry the already-established identity.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use relay_core::User;
use std::collections::HashMap;
use thiserror::Error;

/// Errors resolving the user behind an upgrade request.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Missing user id")]
    MissingUser,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Resolves the [`User`] for an upgrade request.
pub trait SessionLookup: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`SessionError`] when the request carries no usable identity.
    fn lookup(&self, query: &HashMap<String, String>, headers: &HeaderMap) -> Result<User, SessionError>;
}

/// Reads `user_id` / `name` query parameters, falling back to the
/// `x-user-id` / `x-user-name` headers. The name defaults to the id.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuerySession;

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl SessionLookup for QuerySession {
    fn lookup(&self, query: &HashMap<String, String>, headers: &HeaderMap) -> Result<User, SessionError> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let id = non_empty(query.get("user_id").map(String::as_str))
            .or_else(|| non_empty(header("x-user-id")))
            .ok_or(SessionError::MissingUser)?;
        let name = non_empty(query.get("name").map(String::as_str))
            .or_else(|| non_empty(header("x-user-name")))
            .unwrap_or(id);

        Ok(User::new(id, name))
    }
}
