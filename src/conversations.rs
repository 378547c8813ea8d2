use axum::{debug_handler, extract::{Path, State}, routing::get, Json, Router};
use serde::Serialize;

use crate::{hub::Hub, participants, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{conversation_id}/presence", get(presence))
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub(crate) struct ParticipantPresence {
    identity: String,
    online: bool,
}

/// Durable participants of a conversation and whether each is currently reachable.
#[debug_handler(state = AppState)]
pub(crate) async fn presence(
    Path(conversation_id): Path<String>,
    State(hub): State<Hub>,
) -> AppResult<Json<Vec<ParticipantPresence>>> {
    let identities = participants::resolve_within(
        hub.participants().as_ref(),
        &conversation_id,
        hub.settings().participant_timeout,
    )
    .await?;

    Ok(Json(
        hub.online_status(identities)
            .await
            .into_iter()
            .map(|(identity, online)| ParticipantPresence { identity, online })
            .collect(),
    ))
}
