//! POST /api/ownership/claim - take over records stored under a legacy id.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use tracing::error;

use mailsweep_core::{OwnerId, OwnershipError};

use super::{ApiError, Owner};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/claim", post(claim))
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub legacy_owner_id: String,
}

async fn claim(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(body): Json<ClaimRequest>,
) -> Response {
    let legacy = match OwnerId::parse(&body.legacy_owner_id) {
        Ok(legacy) => legacy,
        Err(err) => {
            return ApiError::bad_request(err.to_string())
                .into_response_with(StatusCode::BAD_REQUEST);
        }
    };

    match state.ownership_migrator().claim(&legacy, &owner).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err @ OwnershipError::NotLegacy(_)) => {
            ApiError::forbidden(err.to_string()).into_response_with(StatusCode::FORBIDDEN)
        }
        Err(err @ (OwnershipError::SameOwner(_) | OwnershipError::Owner(_))) => {
            ApiError::bad_request(err.to_string()).into_response_with(StatusCode::BAD_REQUEST)
        }
        Err(err) => {
            error!(owner_user_id = owner.as_str(), error = %err, "ownership claim failed");
            ApiError::internal("Ownership claim failed")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
