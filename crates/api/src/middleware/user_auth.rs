//! Bearer token authentication middleware.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use shared::jwt::TokenVerifier;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::policy::Capability;

/// Authenticated caller, stored in request extensions.
#[derive(Debug, Clone)]
pub struct UserAuth {
    /// User ID from the token subject.
    pub user_id: Uuid,
    /// Token id (jti), for log correlation.
    pub jti: String,
    pub capabilities: Vec<Capability>,
}

impl UserAuth {
    /// Verifies a bearer token. Unknown scope entries are ignored.
    pub fn validate(verifier: &TokenVerifier, token: &str) -> Result<Self, ApiError> {
        let claims = verifier.verify(token).map_err(|e| {
            tracing::debug!(error = %e, "Token verification failed");
            ApiError::Unauthorized("Invalid or expired token".to_string())
        })?;

        let user_id = claims
            .user_id()
            .map_err(|_| ApiError::Unauthorized("Invalid user ID in token".to_string()))?;

        let capabilities = claims
            .scopes()
            .filter_map(|s| s.parse::<Capability>().ok())
            .collect();

        Ok(UserAuth {
            user_id,
            jti: claims.jti,
            capabilities,
        })
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Pulls the token out of an `Authorization: Bearer` header value.
pub fn bearer_token(header_value: Option<&str>) -> Option<&str> {
    header_value
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Middleware that requires a valid bearer token.
///
/// Authenticated user information is stored in request extensions for the
/// rate limiter, the quota gate and the handlers.
pub async fn require_user_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(token) = bearer_token(header_value) else {
        return ApiError::Unauthorized("Missing or invalid Authorization header".to_string())
            .into_response();
    };

    match UserAuth::validate(&state.verifier, token) {
        Ok(auth) => {
            tracing::Span::current().record("user_id", tracing::field::display(auth.user_id));
            req.extensions_mut().insert(auth);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}
