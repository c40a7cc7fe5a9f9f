//! GET /api/messages/due - messages whose retention period has elapsed.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;

use mailsweep_core::MessageRepository;

use super::{ApiError, Owner};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/due", get(list_due))
}

#[derive(Debug, Default, Deserialize)]
pub struct DueQuery {
    /// Reference time; defaults to now.
    pub now: Option<DateTime<Utc>>,
}

async fn list_due(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<DueQuery>,
) -> Response {
    let now = query.now.unwrap_or_else(Utc::now);
    let repo = MessageRepository::new(state.db.clone(), state.parser.clone());
    match repo.list_due_for_deletion(&owner, now).await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(err) => {
            error!(owner_user_id = owner.as_str(), error = %err, "failed to list due messages");
            ApiError::internal("Failed to list due messages")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
