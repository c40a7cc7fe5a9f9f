//! One-time reassignment of records stored under a legacy owner id.

use std::sync::Arc;

use libsql::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{self, AuditActionType, AuditError, NewAuditEntry};
use crate::db::{Database, DbError, write_transaction};
use crate::owner::{OwnerError, OwnerId};
use crate::rules::RuleSetCache;

#[derive(Debug, Error)]
pub enum OwnershipError {
    #[error("invalid owner: {0}")]
    Owner(#[from] OwnerError),
    #[error("legacy owner and new owner are both {0}")]
    SameOwner(String),
    #[error("{0} is not a claimable legacy owner")]
    NotLegacy(String),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSummary {
    /// Domain and email criteria moved to the new owner.
    pub criteria: u64,
    pub subdomains: u64,
    /// Legacy criteria left behind because the new owner already had the key.
    pub skipped: u64,
    pub messages: u64,
}

pub struct OwnershipMigrator {
    db: Database,
    cache: Arc<RuleSetCache>,
    legacy_owners: Vec<OwnerId>,
}

impl OwnershipMigrator {
    /// Only ids in `legacy_owners` can be claimed; an empty list disables claims.
    pub fn new(db: Database, cache: Arc<RuleSetCache>, legacy_owners: Vec<OwnerId>) -> Self {
        Self {
            db,
            cache,
            legacy_owners,
        }
    }

    /// Move everything `legacy` owns to `owner` in one transaction. Patterns
    /// follow their criteria. Audit rows keep the id they were written with.
    pub async fn claim(
        &self,
        legacy: &OwnerId,
        owner: &OwnerId,
    ) -> Result<ClaimSummary, OwnershipError> {
        if legacy == owner {
            return Err(OwnershipError::SameOwner(owner.to_string()));
        }
        if !self.legacy_owners.contains(legacy) {
            warn!(
                legacy_owner_id = legacy.as_str(),
                owner_user_id = owner.as_str(),
                "refused claim of non-legacy owner"
            );
            return Err(OwnershipError::NotLegacy(legacy.to_string()));
        }

        let conn = self.db.connection().await?;
        let tx = write_transaction(&conn).await?;
        let summary = match reassign(&tx, legacy, owner).await {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "failed to roll back ownership claim");
                }
                return Err(err);
            }
        };
        tx.commit().await?;

        self.cache.invalidate(legacy).await;
        self.cache.invalidate(owner).await;

        info!(
            legacy_owner_id = legacy.as_str(),
            owner_user_id = owner.as_str(),
            criteria = summary.criteria,
            subdomains = summary.subdomains,
            skipped = summary.skipped,
            messages = summary.messages,
            "claimed legacy records"
        );
        Ok(summary)
    }
}

async fn reassign(
    conn: &Connection,
    legacy: &OwnerId,
    owner: &OwnerId,
) -> Result<ClaimSummary, OwnershipError> {
    let criteria = conn
        .execute(
            "UPDATE criteria
             SET owner_user_id = ?2
             WHERE owner_user_id = ?1
               AND parent_id IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM criteria existing
                   WHERE existing.owner_user_id = ?2
                     AND existing.parent_id IS NULL
                     AND existing.key_kind = criteria.key_kind
                     AND existing.key_value = criteria.key_value
               )",
            params![legacy.as_str(), owner.as_str()],
        )
        .await?;

    let subdomains = conn
        .execute(
            "UPDATE criteria
             SET owner_user_id = ?2
             WHERE owner_user_id = ?1
               AND parent_id IN (SELECT id FROM criteria WHERE owner_user_id = ?2)",
            params![legacy.as_str(), owner.as_str()],
        )
        .await?;

    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM criteria WHERE owner_user_id = ?1 AND parent_id IS NULL",
            params![legacy.as_str()],
        )
        .await?;
    let skipped = match rows.next().await? {
        Some(row) => row.get::<i64>(0)?.max(0) as u64,
        None => 0,
    };

    let messages = conn
        .execute(
            "UPDATE messages SET owner_user_id = ?2 WHERE owner_user_id = ?1",
            params![legacy.as_str(), owner.as_str()],
        )
        .await?;

    let summary = ClaimSummary {
        criteria,
        subdomains,
        skipped,
        messages,
    };

    audit::append(
        conn,
        NewAuditEntry {
            owner_user_id: owner.clone(),
            action_type: AuditActionType::Update,
            table_name: "criteria",
            record_id: None,
            domain_context: String::new(),
            details: json!({
                "operation": "claim",
                "legacy_owner_id": legacy.as_str(),
                "criteria": summary.criteria,
                "subdomains": summary.subdomains,
                "skipped": summary.skipped,
                "messages": summary.messages,
            }),
        },
    )
    .await?;

    Ok(summary)
}
