//! Caller identity, as asserted by the authenticating gateway in front of us.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use super::error::ApiError;
use crate::model::{Actor, Role};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, ACTOR_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_ID_HEADER} header")))?;
        let user_id = Uuid::parse_str(id.trim())
            .map_err(|_| ApiError::Unauthorized(format!("malformed {ACTOR_ID_HEADER} header")))?;
        let role = match header(parts, ACTOR_ROLE_HEADER) {
            Some(r) => r
                .parse::<Role>()
                .map_err(|_| ApiError::Unauthorized(format!("malformed {ACTOR_ROLE_HEADER} header")))?,
            None => Role::User,
        };
        Ok(Actor { user_id, role })
    }
}
