//! Caller identity set by the upstream authenticator.
//!
//! | Header | Required | Meaning |
//! |--------|----------|---------|
//! | `X-Tenant-Id` | yes | Tenant the request acts for |
//! | `X-Actor-Id` | yes | Authenticated user or service |
//! | `X-Actor-Role` | no | Role used for rate-limit overrides and admin routes |
//! | `X-Forwarded-For` | no | Network origin (first hop) |

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use crate::error::ApiError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ACTOR_HEADER: &str = "x-actor-id";
pub const ROLE_HEADER: &str = "x-actor-role";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub tenant_id: String,
    pub actor_id: String,
    pub role: Option<String>,
    pub origin: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let tenant_id = header_str(headers, TENANT_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("missing X-Tenant-Id".to_string()))?;
        let actor_id = header_str(headers, ACTOR_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("missing X-Actor-Id".to_string()))?;
        let origin = header_str(headers, FORWARDED_FOR_HEADER)
            .and_then(|v| v.split(',').next().map(|hop| hop.trim().to_string()))
            .filter(|v| !v.is_empty());
        Ok(Self {
            tenant_id,
            actor_id,
            role: header_str(headers, ROLE_HEADER),
            origin,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "administrator role required".to_string(),
            ))
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Caller::from_headers(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_full_identity() {
        let caller = Caller::from_headers(&headers(&[
            (TENANT_HEADER, "acme"),
            (ACTOR_HEADER, "alice"),
            (ROLE_HEADER, "admin"),
            (FORWARDED_FOR_HEADER, "203.0.113.7, 10.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(caller.tenant_id, "acme");
        assert_eq!(caller.origin.as_deref(), Some("203.0.113.7"));
        assert!(caller.is_admin());
    }

    #[test]
    fn test_missing_actor_is_unauthorized() {
        let err = Caller::from_headers(&headers(&[(TENANT_HEADER, "acme")])).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn test_blank_tenant_is_unauthorized() {
        let err = Caller::from_headers(&headers(&[(TENANT_HEADER, "  "), (ACTOR_HEADER, "bob")]))
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}
