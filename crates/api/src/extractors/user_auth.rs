//! Caller extractor.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;
use crate::middleware::user_auth::UserAuth;

/// The authenticated caller placed in extensions by
/// [`crate::middleware::require_user_auth`].
#[derive(Debug, Clone)]
pub struct Caller(pub UserAuth);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserAuth>()
            .cloned()
            .map(Caller)
            .ok_or_else(|| ApiError::Unauthorized("Missing authentication".to_string()))
    }
}

impl std::ops::Deref for Caller {
    type Target = UserAuth;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
