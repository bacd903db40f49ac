//! Front-door sessions.

use axum::{
    extract::{rejection::PathRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use uuid::Uuid;

use docket_core::{Clock, NewSession, Session};

use crate::error::ApiResult;
use crate::identity::Caller;
use crate::state::AppState;

/// Open a session. The device defaults to the `User-Agent` header.
pub async fn create_session(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    body: Option<Json<NewSession>>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    state.admit(&caller, "sessions.create").await?;
    let device = body.and_then(|Json(b)| b.device).or_else(|| {
        headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let session = state
        .sessions
        .create(
            &caller.tenant_id,
            &caller.actor_id,
            caller.origin.as_deref(),
            device.as_deref(),
            state.clock.now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn touch_session(
    State(state): State<AppState>,
    caller: Caller,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Session>> {
    let Path(session_id) = id?;
    state.admit(&caller, "sessions.touch").await?;
    let session = state
        .sessions
        .touch(&caller.tenant_id, session_id, state.clock.now())
        .await?;
    Ok(Json(session))
}
