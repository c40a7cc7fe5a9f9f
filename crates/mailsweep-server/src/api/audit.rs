use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::error;

use mailsweep_core::AuditRepository;

use super::{ApiError, Owner};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_audit))
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

/// GET /api/audit
async fn list_audit(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<AuditQuery>,
) -> Response {
    match AuditRepository::new(state.db.clone())
        .list_for_owner(&owner, query.limit)
        .await
    {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(err) => {
            error!(owner_user_id = owner.as_str(), error = %err, "failed to list audit log");
            ApiError::internal("Failed to list audit log")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{json_body, owner, setup_state};
    use mailsweep_core::{AuditActionType, AuditLogEntry, ModifyRequest};

    #[tokio::test]
    async fn audit_lists_only_the_callers_entries() {
        let (state, _dir) = setup_state().await;
        for owner_id in ["alice", "bob"] {
            state
                .rule_engine()
                .modify(ModifyRequest {
                    operation: "add".into(),
                    dimension: "domain".into(),
                    owner_user_id: Some(owner_id.into()),
                    key_value: Some("x.com".into()),
                    action: Some("keep".into()),
                    ..Default::default()
                })
                .await
                .expect("add rule");
        }

        let response = list_audit(
            State(state),
            owner("alice"),
            Query(AuditQuery { limit: Some(10) }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let entries: Vec<AuditLogEntry> = json_body(response).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner_user_id, "alice");
        assert_eq!(entries[0].action_type, AuditActionType::Insert);
    }
}
