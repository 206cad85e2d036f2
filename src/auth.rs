//! Admin authentication.
//!
//! Admin routes require `Authorization: Bearer <admin_password>`.  The
//! comparison is constant-time.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::errors::ApiError;
use crate::AppState;

/// Constant-time comparison of two strings.
///
/// Returns `false` immediately if lengths differ (this leaks length
/// information, which is acceptable for fixed-length secrets).
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Token of a `Bearer` authorization header. The scheme is
/// case-insensitive.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Check the request headers against the admin password.
pub fn verify_admin(headers: &HeaderMap, admin_password: &str) -> Result<(), ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ApiError::Unauthorized)?;
    if constant_time_eq(token, admin_password) {
        Ok(())
    } else {
        debug!("Rejected admin token");
        Err(ApiError::Unauthorized)
    }
}

/// Middleware guarding admin routes.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    verify_admin(req.headers(), &state.config.auth.admin_password)?;
    Ok(next.run(req).await)
}
