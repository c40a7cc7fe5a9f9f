//! HTTP API for rule management and classification.
//!
//! Every route under `/api` acts on behalf of the owner named in the
//! `x-owner-id` header, which the session layer in front of this service sets.

pub mod audit;
pub mod classify;
pub mod messages;
pub mod ownership;
pub mod rules;

use axum::{
    Json, Router,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use mailsweep_core::{MutationError, OwnerError, OwnerId};

use crate::AppState;

pub const OWNER_HEADER: &str = "x-owner-id";

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/rules", rules::router())
        .nest("/classify", classify::router())
        .nest("/messages", messages::router())
        .nest("/audit", audit::router())
        .nest("/ownership", ownership::router())
}

/// Error body shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

/// Status code for a failed rule mutation.
pub fn mutation_status(err: &MutationError) -> StatusCode {
    match err {
        MutationError::Validation(_) => StatusCode::BAD_REQUEST,
        MutationError::NotFound(_) => StatusCode::NOT_FOUND,
        MutationError::Conflict(_) => StatusCode::CONFLICT,
        MutationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Owner taken from the `x-owner-id` header. Missing or blank ids are
/// rejected with 400 before the handler runs.
#[derive(Debug, Clone)]
pub struct Owner(pub OwnerId);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(OWNER_HEADER)
            .map(|value| value.to_str().unwrap_or_default());
        owner_from_header(value)
            .map(Owner)
            .map_err(|err| ApiError::bad_request(err.to_string()).into_response_with(StatusCode::BAD_REQUEST))
    }
}

pub fn owner_from_header(value: Option<&str>) -> Result<OwnerId, OwnerError> {
    OwnerId::require(value)
}
