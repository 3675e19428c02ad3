//! Authentication and tenant-selection middleware.
//!
//! The bearer check is deliberately format-only (the service runs behind a
//! trust boundary); when `FOREMAN_AUTH_TOKEN` is configured the token must
//! also match it exactly. Tenant routes additionally require an `x-org-id`
//! header, from which the request's [`TenantContext`] is built.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use foreman_db::TenantContext;

use crate::error::ApiError;
use crate::state::AppState;

/// Require a well-formed `Authorization: Bearer <token>` header.
pub async fn require_bearer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthenticated("missing Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthenticated("malformed Authorization header"))?;

    if let Some(expected) = &state.config.auth_token {
        if token != expected {
            return Err(ApiError::unauthenticated("invalid token"));
        }
    }

    Ok(next.run(req).await)
}

/// Build a [`TenantContext`] from the `x-org-id` header and attach it to the
/// request.
pub async fn require_org(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let org_id = req
        .headers()
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthenticated("x-org-id header required"))?;

    let ctx = TenantContext::tenant(org_id)
        .map_err(|e| ApiError::unauthenticated(format!("invalid x-org-id header: {e}")))?;

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}
