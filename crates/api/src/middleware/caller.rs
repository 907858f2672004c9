//! Caller identity extractor.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Opaque caller id read from the `x-user-id` header.
///
/// Authentication happens upstream of this service; a missing header means
/// an anonymous caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub Option<String>);

impl CallerId {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl FromRequestParts<AppState> for CallerId {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_ID_HEADER) else {
            return Ok(CallerId(None));
        };

        let user_id = value
            .to_str()
            .map_err(|_| AppError::BadRequest(format!("Invalid {USER_ID_HEADER} header")))?
            .trim();

        Ok(CallerId((!user_id.is_empty()).then(|| user_id.to_string())))
    }
}
