//! Identity supplied by the fronting gateway.
//!
//! Credentials are verified upstream; the server trusts `x-user-id`,
//! `x-user-role` and `x-user-name`. A request without a user id is
//! anonymous.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chorus_core::{Identity, Role};
use std::convert::Infallible;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const USER_NAME_HEADER: &str = "x-user-name";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build an identity from explicit fields.
///
/// The display name defaults to the user id; the role to participant.
#[must_use]
pub fn identity_from_parts(user_id: Option<&str>, role: Option<&str>, name: Option<&str>) -> Identity {
    let Some(user_id) = user_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return Identity::Anonymous;
    };
    let role = role.map_or(Role::Participant, Role::parse);
    let role = if role == Role::Anonymous { Role::Participant } else { role };
    Identity::user(user_id, role, name.unwrap_or(user_id))
}

#[must_use]
pub fn identity_from_headers(headers: &HeaderMap) -> Identity {
    identity_from_parts(
        header(headers, USER_ID_HEADER),
        header(headers, USER_ROLE_HEADER),
        header(headers, USER_NAME_HEADER),
    )
}

/// Extractor for the request's identity.
#[derive(Debug, Clone)]
pub struct RequestIdentity(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for RequestIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestIdentity(identity_from_headers(&parts.headers)))
    }
}
