//! Rule endpoints.
//!
//! - POST /api/rules/modify - ADD/REMOVE/UPDATE/CLEAR/GET on one dimension
//! - POST /api/rules/quick-add - create a rule from a message
//! - GET /api/rules - the owner's full rule tree

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::error;

use mailsweep_core::{ModifyRequest, ModifyResponse, MutationError, QuickAddRequest, RuleStore};

use super::{ApiError, Owner, mutation_status};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_rule_tree))
        .route("/modify", post(modify_rule))
        .route("/quick-add", post(quick_add))
}

/// POST /api/rules/modify
///
/// The owner always comes from the header; any id in the body is ignored.
async fn modify_rule(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(mut body): Json<ModifyRequest>,
) -> Response {
    body.owner_user_id = Some(owner.to_string());
    let result = state.rule_engine().modify(body).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            log_storage_failure(err);
            mutation_status(err)
        }
    };
    (status, Json(ModifyResponse::from_result(&result))).into_response()
}

/// POST /api/rules/quick-add
async fn quick_add(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(mut body): Json<QuickAddRequest>,
) -> Response {
    body.owner_user_id = Some(owner.to_string());
    match state.rule_engine().quick_add(body).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => {
            log_storage_failure(&err);
            let status = mutation_status(&err);
            ApiError::new(error_code(&err), err.to_string()).into_response_with(status)
        }
    }
}

/// GET /api/rules
async fn get_rule_tree(State(state): State<AppState>, Owner(owner): Owner) -> Response {
    match RuleStore::new(state.db.clone()).load_rule_set(&owner).await {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(err) => {
            error!(owner_user_id = owner.as_str(), error = %err, "failed to load rule tree");
            ApiError::internal("Failed to load rules")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn error_code(err: &MutationError) -> &'static str {
    match err {
        MutationError::Validation(_) => "bad_request",
        MutationError::NotFound(_) => "not_found",
        MutationError::Conflict(_) => "conflict",
        MutationError::Storage(_) => "internal_error",
    }
}

fn log_storage_failure(err: &MutationError) {
    if let MutationError::Storage(inner) = err {
        error!(error = %inner, "rule mutation failed in storage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{json_body, owner, setup_state};
    use mailsweep_core::RuleSet;
    use serde_json::Value;

    fn request(operation: &str, dimension: &str, key: &str, action: Option<&str>) -> ModifyRequest {
        ModifyRequest {
            operation: operation.into(),
            dimension: dimension.into(),
            key_value: Some(key.into()),
            action: action.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn modify_uses_header_owner_over_body() {
        let (state, _dir) = setup_state().await;
        let mut body = request("add", "domain", "Bank.COM", Some("delete"));
        body.owner_user_id = Some("mallory".into());

        let response = modify_rule(State(state.clone()), owner("alice"), Json(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let payload: Value = json_body(response).await;
        assert_eq!(payload["success"], true);

        let response = get_rule_tree(State(state.clone()), owner("alice")).await;
        let rules: RuleSet = json_body(response).await;
        assert!(rules.domains.contains_key("bank.com"));

        let response = get_rule_tree(State(state), owner("mallory")).await;
        let rules: RuleSet = json_body(response).await;
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn modify_failures_map_to_status_codes() {
        let (state, _dir) = setup_state().await;

        let response = modify_rule(
            State(state.clone()),
            owner("alice"),
            Json(request("frobnicate", "domain", "x.com", Some("keep"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload: Value = json_body(response).await;
        assert_eq!(payload["success"], false);

        let response = modify_rule(
            State(state),
            owner("alice"),
            Json(request("update", "domain", "missing.com", Some("keep"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn quick_add_creates_domain_rule() {
        let (state, _dir) = setup_state().await;
        let body = QuickAddRequest {
            from_address: "News <news@shop.example.com>".into(),
            action: "delete".into(),
            level: "domain".into(),
            ..Default::default()
        };

        let response = quick_add(State(state.clone()), owner("alice"), Json(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let payload: Value = json_body(response).await;
        assert_eq!(payload["success"], true);

        let response = get_rule_tree(State(state), owner("alice")).await;
        let rules: RuleSet = json_body(response).await;
        assert!(rules.domains.contains_key("example.com"));
    }

    #[tokio::test]
    async fn quick_add_with_bad_level_is_rejected() {
        let (state, _dir) = setup_state().await;
        let body = QuickAddRequest {
            from_address: "a@b.com".into(),
            action: "keep".into(),
            level: "planet".into(),
            ..Default::default()
        };

        let response = quick_add(State(state), owner("alice"), Json(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload: ApiError = json_body(response).await;
        assert_eq!(payload.error, "bad_request");
    }
}
