//! POST /api/classify - run the classification engine over stored messages.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use mailsweep_core::{ClassifyError, OwnerScope, Selection};

use super::{ApiError, Owner};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(classify))
}

#[derive(Debug, Default, Deserialize)]
pub struct ClassifyRequest {
    /// Sweep every owner's messages instead of the caller's. Admins only.
    #[serde(default)]
    pub all_users: bool,
    /// Reclassify messages that already carry a verdict.
    #[serde(default)]
    pub reevaluate: bool,
}

async fn classify(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(body): Json<ClassifyRequest>,
) -> Response {
    let selection = if body.reevaluate {
        Selection::All
    } else {
        Selection::Pending
    };
    let scope = if body.all_users {
        if !state.access.is_admin(&owner) {
            warn!(requested_by = owner.as_str(), "global classification sweep refused");
            return ApiError::forbidden("Classifying all users requires an admin owner")
                .into_response_with(StatusCode::FORBIDDEN);
        }
        info!(requested_by = owner.as_str(), "global classification sweep requested");
        OwnerScope::AllUsers
    } else {
        OwnerScope::User(owner)
    };

    match state.classifier().evaluate(&scope, selection).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(ClassifyError::Owner(err)) => {
            ApiError::bad_request(err.to_string()).into_response_with(StatusCode::BAD_REQUEST)
        }
        Err(err) => {
            error!(error = %err, "classification failed");
            ApiError::internal("Classification failed")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
