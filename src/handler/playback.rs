/// HTTP endpoints that start, observe and stop playback sessions.
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{future, stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;
use tracing::{error, info};
use uuid::Uuid;

use crate::handler::ApiError;
use crate::playback::engine::PlaybackState;
use crate::playback::session::SessionStatus;
use crate::AppState;

/// Request payload for starting playback.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlayRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlayResponse {
    pub id: Uuid,
    pub name: String,
}

/// Start playing a file on a new session.
pub async fn start_playback(State(state): State<AppState>, Json(request): Json<PlayRequest>) -> Result<(StatusCode, Json<PlayResponse>), ApiError> {
    info!("Play requested for '{}'", request.name);

    let handle = state.sessions.play(&request.name).await.inspect_err(|e| error!("Cannot start playback: {e}"))?;

    // The session runs on its own; progress is observed through the session endpoints
    Ok((
        StatusCode::ACCEPTED,
        Json(PlayResponse {
            id: handle.id(),
            name: request.name,
        }),
    ))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionStatus>> {
    Json(state.sessions.statuses().await)
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<SessionStatus>, ApiError> {
    state
        .sessions
        .status(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Session {id} not found")))
}

/// Request a stop. Teardown finishes asynchronously.
pub async fn stop_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    if state.sessions.cancel(id).await {
        info!("Stop requested for session {id}");
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::not_found(format!("Session {id} not found")))
    }
}

/// Server-sent state transitions, ending with the outcome and then `released`.
pub async fn session_events(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state
        .sessions
        .events(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Session {id} not found")))?;

    let receiver = session.state.clone();
    let outcome = move || session.outcome().map(|outcome| outcome.state);
    let events = state_events(WatchStream::new(receiver), outcome).map(move |state| Ok(state_event(id, state)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Pass states through up to and including `Released`.
///
/// The watch channel only keeps the latest state, so a terminal state can be
/// overwritten before it is seen. It is then taken from `outcome` and sent
/// just before `Released`.
fn state_events(states: impl Stream<Item = PlaybackState>, outcome: impl Fn() -> Option<PlaybackState>) -> impl Stream<Item = PlaybackState> {
    states
        .scan((false, false), move |(terminal_sent, released), state| {
            if *released {
                return future::ready(None);
            }

            let mut batch = Vec::with_capacity(2);
            if state == PlaybackState::Released {
                *released = true;
                if !*terminal_sent {
                    batch.extend(outcome());
                }
            } else if state.is_terminal() {
                *terminal_sent = true;
            }
            batch.push(state);

            future::ready(Some(stream::iter(batch)))
        })
        .flatten()
}

fn state_event(id: Uuid, state: PlaybackState) -> Event {
    Event::default().event("state").id(id.to_string()).data(state_name(state))
}

fn state_name(state: PlaybackState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|value| value.as_str().map(str::to_owned))
        .unwrap_or_else(|| format!("{state:?}"))
}
