//! Axum extractors pulling the session record out of the `kuro_sid` cookie.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;

use super::store::SessionRecord;
use crate::error::Error;
use crate::state::AppState;

/// Rejects if no valid session cookie is present.
pub struct TypedSession(pub SessionRecord);

impl<S> FromRequestParts<S> for TypedSession
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        let cookie_name = &app_state.config().session.cookie_name;
        let session_id = jar
            .get(cookie_name)
            .map(|c| c.value().to_string())
            .ok_or_else(|| Error::Unauthorized("no session cookie".into()))?;

        let record = app_state
            .sessions()
            .load(&session_id)
            .await?
            .ok_or_else(|| Error::Unauthorized("session expired or not found".into()))?;

        Ok(Self(record))
    }
}

/// Never rejects; `None` when no valid session is present.
pub struct OptionalSession(pub Option<SessionRecord>);

impl<S> FromRequestParts<S> for OptionalSession
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match TypedSession::from_request_parts(parts, state).await {
            Ok(TypedSession(record)) => Ok(Self(Some(record))),
            Err(_) => Ok(Self(None)),
        }
    }
}
