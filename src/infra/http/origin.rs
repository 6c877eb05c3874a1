use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::application::error::AppError;
use crate::cache::ContextId;

/// Header naming the context a request originates from.
pub const CONTEXT_HEADER: &str = "x-gazette-context";

/// Optional originating context, read from [`CONTEXT_HEADER`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginContext(pub Option<ContextId>);

impl<S> FromRequestParts<S> for OriginContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(CONTEXT_HEADER) else {
            return Ok(Self(None));
        };
        let id = value
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .ok_or_else(|| AppError::validation(format!("{CONTEXT_HEADER} must be a UUID")))?;
        Ok(Self(Some(ContextId::from_uuid(id))))
    }
}
