//! Append-only record of every rule mutation.

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::owner::OwnerId;

const AUDIT_COLUMNS: &str =
    "id, owner_user_id, action_type, table_name, record_id, domain_context, details_json, created_at";
const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActionType {
    Insert,
    Update,
    Delete,
    Error,
}

impl AuditActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActionType::Insert => "insert",
            AuditActionType::Update => "update",
            AuditActionType::Delete => "delete",
            AuditActionType::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub owner_user_id: String,
    pub action_type: AuditActionType,
    pub table_name: String,
    pub record_id: Option<String>,
    pub domain_context: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub owner_user_id: OwnerId,
    pub action_type: AuditActionType,
    pub table_name: &'static str,
    pub record_id: Option<String>,
    pub domain_context: String,
    pub details: Value,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid audit action type {0}")]
    InvalidActionType(String),
    #[error("audit insert returned no row")]
    InsertFailed,
}

/// Append an entry using the caller's connection, so it commits or rolls back
/// with whatever transaction the connection is in.
pub async fn append(conn: &Connection, entry: NewAuditEntry) -> Result<AuditLogEntry, AuditError> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let details_json = serde_json::to_string(&entry.details)?;

    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO audit_log (id, owner_user_id, action_type, table_name, record_id, domain_context, details_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 RETURNING {AUDIT_COLUMNS}"
            ),
            params![
                id,
                entry.owner_user_id.as_str(),
                entry.action_type.as_str(),
                entry.table_name,
                entry.record_id,
                entry.domain_context,
                details_json,
                now
            ],
        )
        .await?;

    match rows.next().await? {
        Some(row) => row_to_entry(row),
        None => Err(AuditError::InsertFailed),
    }
}

#[derive(Clone)]
pub struct AuditRepository {
    db: Database,
}

impl AuditRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, AuditError> {
        let conn = self.db.connection().await?;
        append(&conn, entry).await
    }

    /// Most recent entries first.
    pub async fn list_for_owner(
        &self,
        owner: &OwnerId,
        limit: Option<i64>,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIST_LIMIT);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS}
                     FROM audit_log
                     WHERE owner_user_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2"
                ),
                params![owner.as_str(), limit],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(row)?);
        }
        Ok(entries)
    }
}

fn row_to_entry(row: Row) -> Result<AuditLogEntry, AuditError> {
    let action_type: String = row.get(2)?;
    let details_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    let action_type = AuditActionType::from_str(&action_type)
        .ok_or_else(|| AuditError::InvalidActionType(action_type.clone()))?;

    Ok(AuditLogEntry {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        action_type,
        table_name: row.get(3)?,
        record_id: row.get(4)?,
        domain_context: row.get(5)?,
        details: serde_json::from_str(&details_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}
