//! Policy-enforcement point: required roles per route vs. the principal.
//!
//! The decision is evaluated on every request and never cached. A route that
//! declares no roles is public; everything else requires a principal whose
//! role set intersects the requirement. A principal whose session payload
//! lost its roles collection entirely is treated as corrupted rather than
//! merely forbidden, so operators can tell the two apart in logs.

use std::collections::HashSet;

use crate::auth::oidc::Principal;
use crate::core::error::{GatewayError, GatewayResult};

/// Role names used by the dashboard routes.
pub const ROLE_VIEWER: &str = "analytics-viewer";
pub const ROLE_UPLOADER: &str = "analytics-uploader";

/// Check `principal` against `required_roles`.
///
/// Grants unconditionally when `required_roles` is empty, regardless of
/// whether a principal is present.
pub fn authorize(principal: Option<&Principal>, required_roles: &[&str]) -> GatewayResult<()> {
    if required_roles.is_empty() {
        return Ok(());
    }

    let principal = principal.ok_or(GatewayError::Unauthenticated)?;
    let roles: &HashSet<String> = principal
        .roles
        .as_ref()
        .ok_or(GatewayError::CorruptedSession)?;

    if required_roles.iter().any(|r| roles.contains(*r)) {
        Ok(())
    } else {
        tracing::warn!(
            subject = %principal.subject,
            required = ?required_roles,
            "access denied: no intersecting role"
        );
        Err(GatewayError::Forbidden)
    }
}
