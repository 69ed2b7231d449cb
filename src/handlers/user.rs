//! Caller identity, taken from the `x-user-id` header set by the
//! authenticating proxy in front of this service.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};

pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::unauthorized(format!("missing {USER_HEADER} header")))?;
        Ok(UserId(user.to_string()))
    }
}
