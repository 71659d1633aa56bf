//! Authentication Middleware

use crate::auth::{jwt::JwtHandler, models::Claims};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

fn bearer_claims(jwt_handler: &JwtHandler, req: &Request) -> Result<Claims, AuthError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?;
    let token = header
        .to_str()
        .ok()
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidFormat)?;
    jwt_handler
        .validate_token(token)
        .map_err(|_| AuthError::InvalidToken)
}

/// Validates the bearer token and stores its [`Claims`] in the request extensions.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let claims = bearer_claims(&jwt_handler, &req)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Same as [`auth_middleware`], then requires the admin role.
pub async fn admin_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let claims = bearer_claims(&jwt_handler, &req)?;
    if !claims.is_admin() {
        warn!(user = %claims.sub, path = %req.uri().path(), "Admin route refused");
        return Err(AuthError::NotAdmin);
    }
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Extract claims from request (use after auth middleware)
pub fn extract_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidToken,
    NotAdmin,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidFormat => (
                StatusCode::UNAUTHORIZED,
                "Invalid authorization format. Use: Bearer {token}",
            ),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::NotAdmin => (StatusCode::FORBIDDEN, "Admin role required"),
        };

        let code = if status == StatusCode::FORBIDDEN {
            "FORBIDDEN"
        } else {
            "UNAUTHORIZED"
        };
        (status, Json(json!({ "status": code, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::Role;
    use axum::body::Body;

    #[test]
    fn test_auth_error_responses() {
        assert_eq!(
            AuthError::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InvalidFormat.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::NotAdmin.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_extract_claims_from_request() {
        let mut req = Request::new(Body::empty());
        assert!(extract_claims(&req).is_none());

        req.extensions_mut().insert(Claims {
            sub: "u1".to_string(),
            role: Role::Player,
            exp: 1234567890,
        });
        assert_eq!(extract_claims(&req).map(|c| c.sub.as_str()), Some("u1"));
    }
}
