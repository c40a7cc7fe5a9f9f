use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::classify::{Classification, MatchedRule, MessageFacts, Selection, Verdict};
use crate::db::{Database, DbError};
use crate::domain::{DomainParser, normalize_address};
use crate::owner::{OwnerId, OwnerScope};

const MESSAGE_COLUMNS: &str = "id, owner_user_id, from_address, to_address, subject, domain, subdomain, received_at, action, matched_rule, matched_pattern, classified_at, created_at";

/// Inbound message as handed over by the mail fetcher, plus the verdict the
/// classifier wrote back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub owner_user_id: String,
    pub from_address: String,
    pub to_address: String,
    pub subject: String,
    pub domain: String,
    pub subdomain: Option<String>,
    pub received_at: DateTime<Utc>,
    pub verdict: Option<Verdict>,
    pub matched_rule: Option<MatchedRule>,
    pub matched_pattern: Option<String>,
    pub classified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn facts(&self, parser: &dyn DomainParser) -> MessageFacts {
        MessageFacts::new(&self.from_address, &self.to_address, &self.subject, parser)
            .with_stored_domains(&self.domain, self.subdomain.as_deref())
    }

    /// When a delete verdict may be executed. `None` for keep and undecided.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        let retention = self.verdict?.action()?.retention()?;
        Some(self.received_at + retention)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub owner_user_id: OwnerId,
    pub from_address: String,
    pub to_address: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid {column} value {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("message not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
    parser: Arc<dyn DomainParser>,
}

impl MessageRepository {
    pub fn new(db: Database, parser: Arc<dyn DomainParser>) -> Self {
        Self { db, parser }
    }

    /// Store an unclassified message, deriving its domain keys from the sender.
    pub async fn insert(&self, new_msg: NewMessage) -> Result<Message, MessageError> {
        let NewMessage {
            owner_user_id,
            from_address,
            to_address,
            subject,
            received_at,
        } = new_msg;

        let id = Uuid::new_v4().to_string();
        let from_address = normalize_address(&from_address);
        let (domain, subdomain) = match self.parser.sender_domains(&from_address) {
            Some(domains) => (domains.domain, domains.subdomain),
            None => (String::new(), None),
        };

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO messages (id, owner_user_id, from_address, to_address, subject, domain, subdomain, received_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![
                    id.clone(),
                    owner_user_id.as_str(),
                    from_address,
                    to_address,
                    subject,
                    domain,
                    subdomain,
                    to_rfc3339(received_at),
                    now_rfc3339()
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(id)),
        }
    }

    pub async fn get_by_id(&self, owner: &OwnerId, id: &str) -> Result<Message, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE owner_user_id = ?1 AND id = ?2"
                ),
                params![owner.as_str(), id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(id.to_string())),
        }
    }

    /// Messages with a delete verdict whose retention has elapsed at `now`,
    /// oldest first.
    pub async fn list_due_for_deletion(
        &self,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                     FROM messages
                     WHERE owner_user_id = ?1
                       AND action IN ('delete', 'delete_1d', 'delete_10d')
                     ORDER BY received_at, id"
                ),
                params![owner.as_str()],
            )
            .await?;

        let mut due = Vec::new();
        while let Some(row) = rows.next().await? {
            let message = row_to_message(row)?;
            if message.due_at().is_some_and(|at| at <= now) {
                due.push(message);
            }
        }
        Ok(due)
    }
}

/// Batch the classifier works on. Runs on the caller's connection so the
/// read and the write-back share one transaction.
pub async fn list_for_classification(
    conn: &Connection,
    scope: &OwnerScope,
    selection: Selection,
) -> Result<Vec<Message>, MessageError> {
    let pending_only = match selection {
        Selection::Pending => 1_i64,
        Selection::All => 0_i64,
    };
    let mut rows = match scope {
        OwnerScope::User(owner) => {
            conn.query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                     FROM messages
                     WHERE owner_user_id = ?1 AND (?2 = 0 OR classified_at IS NULL)
                     ORDER BY received_at, id"
                ),
                params![owner.as_str(), pending_only],
            )
            .await?
        }
        OwnerScope::AllUsers => {
            conn.query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                     FROM messages
                     WHERE (?1 = 0 OR classified_at IS NULL)
                     ORDER BY owner_user_id, received_at, id"
                ),
                params![pending_only],
            )
            .await?
        }
    };

    let mut messages = Vec::new();
    while let Some(row) = rows.next().await? {
        messages.push(row_to_message(row)?);
    }
    Ok(messages)
}

pub async fn record_classification(
    conn: &Connection,
    message: &Message,
    classification: &Classification,
    classified_at: DateTime<Utc>,
) -> Result<(), MessageError> {
    let updated = conn
        .execute(
            "UPDATE messages
             SET action = ?3, matched_rule = ?4, matched_pattern = ?5, classified_at = ?6
             WHERE id = ?1 AND owner_user_id = ?2",
            params![
                message.id.as_str(),
                message.owner_user_id.as_str(),
                classification.verdict.as_str(),
                classification.matched_rule.as_str(),
                classification.matched_pattern.clone(),
                to_rfc3339(classified_at)
            ],
        )
        .await?;

    if updated == 0 {
        return Err(MessageError::NotFound(message.id.clone()));
    }
    Ok(())
}

fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, MessageError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn row_to_message(row: Row) -> Result<Message, MessageError> {
    let received_at: String = row.get(7)?;
    let verdict: Option<String> = row.get(8)?;
    let matched_rule: Option<String> = row.get(9)?;
    let classified_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;

    let verdict = verdict
        .map(|value| {
            Verdict::from_str(&value).ok_or(MessageError::InvalidValue {
                column: "action",
                value,
            })
        })
        .transpose()?;
    let matched_rule = matched_rule
        .map(|value| {
            MatchedRule::from_str(&value).ok_or(MessageError::InvalidValue {
                column: "matched_rule",
                value,
            })
        })
        .transpose()?;

    Ok(Message {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        from_address: row.get(2)?,
        to_address: row.get(3)?,
        subject: row.get(4)?,
        domain: row.get(5)?,
        subdomain: row.get(6)?,
        received_at: parse_timestamp(&received_at)?,
        verdict,
        matched_rule,
        matched_pattern: row.get(10)?,
        classified_at: classified_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}
