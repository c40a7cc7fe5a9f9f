use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditError;
use crate::db::{Database, DbError};
use crate::owner::OwnerId;

use super::rule_set::{CriterionRules, RuleSet};
use super::types::{
    Action, AddressAction, AddressPattern, Criterion, CriterionCounts, Direction, KeyKind,
    RemovalCounts, SubjectPattern,
};

const CRITERION_COLUMNS: &str =
    "id, owner_user_id, key_value, key_kind, default_action, parent_id, created_at, updated_at";
const SUBJECT_PATTERN_COLUMNS: &str = "id, criterion_id, action, pattern, created_at";
const ADDRESS_PATTERN_COLUMNS: &str =
    "id, criterion_id, direction, action, address, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
    #[error("invalid {column} value {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("write to {0} returned no row")]
    NoRow(&'static str),
}

/// Read access to an owner's rules outside of a mutation.
#[derive(Clone)]
pub struct RuleStore {
    db: Database,
}

impl RuleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn load_rule_set(&self, owner: &OwnerId) -> Result<RuleSet, StoreError> {
        let conn = self.db.connection().await?;
        load_rule_set(&conn, owner).await
    }
}

/// Domain or email criterion, i.e. one without a parent.
pub async fn find_top_level(
    conn: &Connection,
    owner: &OwnerId,
    kind: KeyKind,
    key_value: &str,
) -> Result<Option<Criterion>, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {CRITERION_COLUMNS}
                 FROM criteria
                 WHERE owner_user_id = ?1 AND key_kind = ?2 AND key_value = ?3 AND parent_id IS NULL"
            ),
            params![owner.as_str(), kind.as_str(), key_value],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(row_to_criterion(row)?)),
        None => Ok(None),
    }
}

pub async fn find_subdomain(
    conn: &Connection,
    owner: &OwnerId,
    parent_id: &str,
    key_value: &str,
) -> Result<Option<Criterion>, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {CRITERION_COLUMNS}
                 FROM criteria
                 WHERE owner_user_id = ?1 AND parent_id = ?2 AND key_value = ?3"
            ),
            params![owner.as_str(), parent_id, key_value],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(row_to_criterion(row)?)),
        None => Ok(None),
    }
}

pub async fn list_subdomains(
    conn: &Connection,
    owner: &OwnerId,
    parent_id: &str,
) -> Result<Vec<Criterion>, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {CRITERION_COLUMNS}
                 FROM criteria
                 WHERE owner_user_id = ?1 AND parent_id = ?2
                 ORDER BY key_value"
            ),
            params![owner.as_str(), parent_id],
        )
        .await?;

    let mut criteria = Vec::new();
    while let Some(row) = rows.next().await? {
        criteria.push(row_to_criterion(row)?);
    }
    Ok(criteria)
}

/// Insert a domain or email criterion, or return the existing one. A supplied
/// action overwrites the stored default; `None` leaves it untouched so that
/// auto-created parents never clobber an existing default.
pub async fn upsert_top_level(
    conn: &Connection,
    owner: &OwnerId,
    kind: KeyKind,
    key_value: &str,
    action: Option<Action>,
) -> Result<Criterion, StoreError> {
    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO criteria (id, owner_user_id, key_value, key_kind, default_action, parent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)
                 ON CONFLICT(owner_user_id, key_kind, key_value) WHERE parent_id IS NULL
                 DO UPDATE SET
                    default_action = COALESCE(excluded.default_action, criteria.default_action),
                    updated_at = CASE
                        WHEN excluded.default_action IS NULL THEN criteria.updated_at
                        ELSE excluded.updated_at
                    END
                 RETURNING {CRITERION_COLUMNS}"
            ),
            params![
                id,
                owner.as_str(),
                key_value,
                kind.as_str(),
                action.map(|a| a.as_str()),
                now
            ],
        )
        .await?;

    match rows.next().await? {
        Some(row) => row_to_criterion(row),
        None => Err(StoreError::NoRow("criteria")),
    }
}

/// Same contract as [`upsert_top_level`], keyed on the parent domain.
pub async fn upsert_subdomain(
    conn: &Connection,
    owner: &OwnerId,
    parent_id: &str,
    key_value: &str,
    action: Option<Action>,
) -> Result<Criterion, StoreError> {
    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO criteria (id, owner_user_id, key_value, key_kind, default_action, parent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'subdomain', ?4, ?5, ?6, ?6)
                 ON CONFLICT(owner_user_id, parent_id, key_value) WHERE parent_id IS NOT NULL
                 DO UPDATE SET
                    default_action = COALESCE(excluded.default_action, criteria.default_action),
                    updated_at = CASE
                        WHEN excluded.default_action IS NULL THEN criteria.updated_at
                        ELSE excluded.updated_at
                    END
                 RETURNING {CRITERION_COLUMNS}"
            ),
            params![
                id,
                owner.as_str(),
                key_value,
                action.map(|a| a.as_str()),
                parent_id,
                now
            ],
        )
        .await?;

    match rows.next().await? {
        Some(row) => row_to_criterion(row),
        None => Err(StoreError::NoRow("criteria")),
    }
}

pub async fn set_default_action(
    conn: &Connection,
    criterion_id: &str,
    action: Action,
) -> Result<Criterion, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "UPDATE criteria
                 SET default_action = ?2, updated_at = ?3
                 WHERE id = ?1
                 RETURNING {CRITERION_COLUMNS}"
            ),
            params![criterion_id, action.as_str(), now_rfc3339()],
        )
        .await?;

    match rows.next().await? {
        Some(row) => row_to_criterion(row),
        None => Err(StoreError::NoRow("criteria")),
    }
}

pub async fn count_children(
    conn: &Connection,
    criterion_id: &str,
) -> Result<CriterionCounts, StoreError> {
    let mut rows = conn
        .query(
            "SELECT
                (SELECT COUNT(*) FROM criteria WHERE parent_id = ?1),
                (SELECT COUNT(*) FROM subject_patterns WHERE criterion_id = ?1),
                (SELECT COUNT(*) FROM address_patterns WHERE criterion_id = ?1)",
            params![criterion_id],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(CriterionCounts {
            subdomains: row.get(0)?,
            subject_patterns: row.get(1)?,
            address_patterns: row.get(2)?,
        }),
        None => Ok(CriterionCounts::default()),
    }
}

/// Delete a criterion and everything under it, children first. The foreign
/// key cascade would do the same, but doing it explicitly yields the counts.
pub async fn delete_criterion(
    conn: &Connection,
    criterion_id: &str,
) -> Result<RemovalCounts, StoreError> {
    let mut counts = RemovalCounts::default();

    counts.subject_patterns += conn
        .execute(
            "DELETE FROM subject_patterns
             WHERE criterion_id IN (SELECT id FROM criteria WHERE parent_id = ?1)",
            params![criterion_id],
        )
        .await? as i64;
    counts.address_patterns += conn
        .execute(
            "DELETE FROM address_patterns
             WHERE criterion_id IN (SELECT id FROM criteria WHERE parent_id = ?1)",
            params![criterion_id],
        )
        .await? as i64;
    counts.criteria += conn
        .execute(
            "DELETE FROM criteria WHERE parent_id = ?1",
            params![criterion_id],
        )
        .await? as i64;

    counts.subject_patterns += conn
        .execute(
            "DELETE FROM subject_patterns WHERE criterion_id = ?1",
            params![criterion_id],
        )
        .await? as i64;
    counts.address_patterns += conn
        .execute(
            "DELETE FROM address_patterns WHERE criterion_id = ?1",
            params![criterion_id],
        )
        .await? as i64;
    counts.criteria += conn
        .execute("DELETE FROM criteria WHERE id = ?1", params![criterion_id])
        .await? as i64;

    Ok(counts)
}

pub async fn find_subject_pattern(
    conn: &Connection,
    criterion_id: &str,
    action: Action,
    pattern: &str,
) -> Result<Option<SubjectPattern>, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {SUBJECT_PATTERN_COLUMNS}
                 FROM subject_patterns
                 WHERE criterion_id = ?1 AND action = ?2 AND pattern = ?3"
            ),
            params![criterion_id, action.as_str(), pattern],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(row_to_subject_pattern(row)?)),
        None => Ok(None),
    }
}

/// Returns `None` when the identical pattern is already stored.
pub async fn insert_subject_pattern(
    conn: &Connection,
    criterion_id: &str,
    action: Action,
    pattern: &str,
) -> Result<Option<SubjectPattern>, StoreError> {
    let id = Uuid::new_v4().to_string();
    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO subject_patterns (id, criterion_id, action, pattern, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(criterion_id, action, pattern) DO NOTHING
                 RETURNING {SUBJECT_PATTERN_COLUMNS}"
            ),
            params![id, criterion_id, action.as_str(), pattern, now_rfc3339()],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(row_to_subject_pattern(row)?)),
        None => Ok(None),
    }
}

pub async fn update_subject_pattern_action(
    conn: &Connection,
    pattern_id: &str,
    action: Action,
) -> Result<SubjectPattern, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "UPDATE subject_patterns SET action = ?2 WHERE id = ?1
                 RETURNING {SUBJECT_PATTERN_COLUMNS}"
            ),
            params![pattern_id, action.as_str()],
        )
        .await?;

    match rows.next().await? {
        Some(row) => row_to_subject_pattern(row),
        None => Err(StoreError::NoRow("subject_patterns")),
    }
}

/// Without an action every row carrying the pattern text is removed.
pub async fn delete_subject_patterns(
    conn: &Connection,
    criterion_id: &str,
    pattern: &str,
    action: Option<Action>,
) -> Result<i64, StoreError> {
    let deleted = match action {
        Some(action) => {
            conn.execute(
                "DELETE FROM subject_patterns WHERE criterion_id = ?1 AND pattern = ?2 AND action = ?3",
                params![criterion_id, pattern, action.as_str()],
            )
            .await?
        }
        None => {
            conn.execute(
                "DELETE FROM subject_patterns WHERE criterion_id = ?1 AND pattern = ?2",
                params![criterion_id, pattern],
            )
            .await?
        }
    };
    Ok(deleted as i64)
}

pub async fn delete_subject_pattern_by_id(
    conn: &Connection,
    pattern_id: &str,
) -> Result<i64, StoreError> {
    let deleted = conn
        .execute(
            "DELETE FROM subject_patterns WHERE id = ?1",
            params![pattern_id],
        )
        .await?;
    Ok(deleted as i64)
}

pub async fn list_subject_patterns(
    conn: &Connection,
    criterion_id: &str,
) -> Result<Vec<SubjectPattern>, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {SUBJECT_PATTERN_COLUMNS}
                 FROM subject_patterns
                 WHERE criterion_id = ?1
                 ORDER BY created_at, id"
            ),
            params![criterion_id],
        )
        .await?;

    let mut patterns = Vec::new();
    while let Some(row) = rows.next().await? {
        patterns.push(row_to_subject_pattern(row)?);
    }
    Ok(patterns)
}

pub async fn find_address_pattern(
    conn: &Connection,
    criterion_id: &str,
    direction: Direction,
    address: &str,
) -> Result<Option<AddressPattern>, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {ADDRESS_PATTERN_COLUMNS}
                 FROM address_patterns
                 WHERE criterion_id = ?1 AND direction = ?2 AND address = ?3"
            ),
            params![criterion_id, direction.as_str(), address],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(row_to_address_pattern(row)?)),
        None => Ok(None),
    }
}

pub async fn upsert_address_pattern(
    conn: &Connection,
    criterion_id: &str,
    direction: Direction,
    address: &str,
    action: AddressAction,
) -> Result<AddressPattern, StoreError> {
    let id = Uuid::new_v4().to_string();
    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO address_patterns (id, criterion_id, direction, action, address, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(criterion_id, direction, address)
                 DO UPDATE SET action = excluded.action, updated_at = excluded.updated_at
                 RETURNING {ADDRESS_PATTERN_COLUMNS}"
            ),
            params![
                id,
                criterion_id,
                direction.as_str(),
                action.as_str(),
                address,
                now_rfc3339()
            ],
        )
        .await?;

    match rows.next().await? {
        Some(row) => row_to_address_pattern(row),
        None => Err(StoreError::NoRow("address_patterns")),
    }
}

pub async fn delete_address_pattern(
    conn: &Connection,
    criterion_id: &str,
    direction: Direction,
    address: &str,
) -> Result<i64, StoreError> {
    let deleted = conn
        .execute(
            "DELETE FROM address_patterns WHERE criterion_id = ?1 AND direction = ?2 AND address = ?3",
            params![criterion_id, direction.as_str(), address],
        )
        .await?;
    Ok(deleted as i64)
}

pub async fn list_address_patterns(
    conn: &Connection,
    criterion_id: &str,
    direction: Direction,
) -> Result<Vec<AddressPattern>, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {ADDRESS_PATTERN_COLUMNS}
                 FROM address_patterns
                 WHERE criterion_id = ?1 AND direction = ?2
                 ORDER BY created_at, id"
            ),
            params![criterion_id, direction.as_str()],
        )
        .await?;

    let mut patterns = Vec::new();
    while let Some(row) = rows.next().await? {
        patterns.push(row_to_address_pattern(row)?);
    }
    Ok(patterns)
}

/// Snapshot every rule the owner has, nested the way the classifier walks it.
pub async fn load_rule_set(conn: &Connection, owner: &OwnerId) -> Result<RuleSet, StoreError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {CRITERION_COLUMNS}
                 FROM criteria
                 WHERE owner_user_id = ?1
                 ORDER BY created_at, id"
            ),
            params![owner.as_str()],
        )
        .await?;

    let mut criteria = Vec::new();
    while let Some(row) = rows.next().await? {
        criteria.push(row_to_criterion(row)?);
    }

    let mut by_id: HashMap<String, CriterionRules> = criteria
        .iter()
        .map(|criterion| (criterion.id.clone(), CriterionRules::new(criterion.clone())))
        .collect();

    let mut rows = conn
        .query(
            &format!(
                "SELECT {SUBJECT_PATTERN_COLUMNS}
                 FROM subject_patterns
                 WHERE criterion_id IN (SELECT id FROM criteria WHERE owner_user_id = ?1)
                 ORDER BY created_at, id"
            ),
            params![owner.as_str()],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        let pattern = row_to_subject_pattern(row)?;
        if let Some(rules) = by_id.get_mut(&pattern.criterion_id) {
            rules.subject_patterns.push(pattern);
        }
    }

    let mut rows = conn
        .query(
            &format!(
                "SELECT {ADDRESS_PATTERN_COLUMNS}
                 FROM address_patterns
                 WHERE criterion_id IN (SELECT id FROM criteria WHERE owner_user_id = ?1)
                 ORDER BY created_at, id"
            ),
            params![owner.as_str()],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        let pattern = row_to_address_pattern(row)?;
        if let Some(rules) = by_id.get_mut(&pattern.criterion_id) {
            rules.address_patterns.push(pattern);
        }
    }

    let mut rule_set = RuleSet::empty(owner.as_str());

    // Subdomains are attached before their parents are moved into the set.
    for criterion in criteria.iter().filter(|c| c.key_kind == KeyKind::Subdomain) {
        let Some(rules) = by_id.remove(&criterion.id) else {
            continue;
        };
        let Some(parent_id) = criterion.parent_id.as_deref() else {
            continue;
        };
        if let Some(parent) = by_id.get_mut(parent_id) {
            parent
                .subdomains
                .insert(criterion.key_value.clone(), rules);
        }
    }

    for criterion in &criteria {
        let Some(rules) = by_id.remove(&criterion.id) else {
            continue;
        };
        match criterion.key_kind {
            KeyKind::Domain => {
                rule_set.domains.insert(criterion.key_value.clone(), rules);
            }
            KeyKind::Email => {
                rule_set.emails.insert(criterion.key_value.clone(), rules.criterion);
            }
            KeyKind::Subdomain => {}
        }
    }

    Ok(rule_set)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_action(column: &'static str, value: &str) -> Result<Action, StoreError> {
    Action::from_str(value).ok_or_else(|| StoreError::InvalidValue {
        column,
        value: value.to_string(),
    })
}

fn row_to_criterion(row: Row) -> Result<Criterion, StoreError> {
    let key_kind: String = row.get(3)?;
    let default_action: Option<String> = row.get(4)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    let key_kind = KeyKind::from_str(&key_kind).ok_or_else(|| StoreError::InvalidValue {
        column: "key_kind",
        value: key_kind.clone(),
    })?;
    let default_action = default_action
        .as_deref()
        .map(|value| parse_action("default_action", value))
        .transpose()?;

    Ok(Criterion {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        key_value: row.get(2)?,
        key_kind,
        default_action,
        parent_id: row.get(5)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_subject_pattern(row: Row) -> Result<SubjectPattern, StoreError> {
    let action: String = row.get(2)?;
    let created_at: String = row.get(4)?;

    Ok(SubjectPattern {
        id: row.get(0)?,
        criterion_id: row.get(1)?,
        action: parse_action("action", &action)?,
        pattern: row.get(3)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_address_pattern(row: Row) -> Result<AddressPattern, StoreError> {
    let direction: String = row.get(2)?;
    let action: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    let direction = Direction::from_str(&direction).ok_or_else(|| StoreError::InvalidValue {
        column: "direction",
        value: direction.clone(),
    })?;
    let action = AddressAction::from_str(&action).ok_or_else(|| StoreError::InvalidValue {
        column: "action",
        value: action.clone(),
    })?;

    Ok(AddressPattern {
        id: row.get(0)?,
        criterion_id: row.get(1)?,
        direction,
        action,
        address: row.get(4)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (db, dir)
    }

    fn owner(name: &str) -> OwnerId {
        OwnerId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn upsert_without_action_keeps_existing_default() {
        let (db, _dir) = setup_db().await;
        let conn = db.connection().await.expect("conn");
        let alice = owner("alice");

        let first = upsert_top_level(&conn, &alice, KeyKind::Domain, "bank.com", Some(Action::Keep))
            .await
            .expect("insert");
        let second = upsert_top_level(&conn, &alice, KeyKind::Domain, "bank.com", None)
            .await
            .expect("upsert without action");

        assert_eq!(first.id, second.id);
        assert_eq!(second.default_action, Some(Action::Keep));

        let third = upsert_top_level(
            &conn,
            &alice,
            KeyKind::Domain,
            "bank.com",
            Some(Action::Delete10d),
        )
        .await
        .expect("upsert with action");
        assert_eq!(third.id, first.id);
        assert_eq!(third.default_action, Some(Action::Delete10d));
    }

    #[tokio::test]
    async fn same_key_is_independent_per_owner_and_kind() {
        let (db, _dir) = setup_db().await;
        let conn = db.connection().await.expect("conn");

        let a = upsert_top_level(&conn, &owner("alice"), KeyKind::Domain, "x.com", None)
            .await
            .expect("alice");
        let b = upsert_top_level(&conn, &owner("bob"), KeyKind::Domain, "x.com", None)
            .await
            .expect("bob");
        assert_ne!(a.id, b.id);

        let found = find_top_level(&conn, &owner("bob"), KeyKind::Email, "x.com")
            .await
            .expect("find");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn subject_pattern_insert_is_idempotent() {
        let (db, _dir) = setup_db().await;
        let conn = db.connection().await.expect("conn");
        let domain = upsert_top_level(&conn, &owner("alice"), KeyKind::Domain, "bank.com", None)
            .await
            .expect("domain");

        let first = insert_subject_pattern(&conn, &domain.id, Action::Delete1d, "otp")
            .await
            .expect("insert");
        assert!(first.is_some());
        let again = insert_subject_pattern(&conn, &domain.id, Action::Delete1d, "otp")
            .await
            .expect("re-insert");
        assert!(again.is_none());

        let listed = list_subject_patterns(&conn, &domain.id)
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn address_pattern_upsert_replaces_action() {
        let (db, _dir) = setup_db().await;
        let conn = db.connection().await.expect("conn");
        let domain = upsert_top_level(&conn, &owner("alice"), KeyKind::Domain, "bank.com", None)
            .await
            .expect("domain");

        let first = upsert_address_pattern(
            &conn,
            &domain.id,
            Direction::From,
            "ceo@bank.com",
            AddressAction::Keep,
        )
        .await
        .expect("insert");
        let second = upsert_address_pattern(
            &conn,
            &domain.id,
            Direction::From,
            "ceo@bank.com",
            AddressAction::Delete,
        )
        .await
        .expect("upsert");

        assert_eq!(first.id, second.id);
        assert_eq!(second.action, AddressAction::Delete);
    }

    #[tokio::test]
    async fn delete_domain_cascades_and_counts() {
        let (db, _dir) = setup_db().await;
        let conn = db.connection().await.expect("conn");
        let alice = owner("alice");
        let domain = upsert_top_level(&conn, &alice, KeyKind::Domain, "bank.com", None)
            .await
            .expect("domain");
        let sub = upsert_subdomain(&conn, &alice, &domain.id, "alerts.bank.com", None)
            .await
            .expect("subdomain");
        insert_subject_pattern(&conn, &sub.id, Action::Delete, "promo")
            .await
            .expect("sub pattern");
        insert_subject_pattern(&conn, &domain.id, Action::Keep, "statement")
            .await
            .expect("domain pattern");
        upsert_address_pattern(
            &conn,
            &domain.id,
            Direction::To,
            "me@home.com",
            AddressAction::Keep,
        )
        .await
        .expect("address pattern");

        let counts = delete_criterion(&conn, &domain.id).await.expect("delete");
        assert_eq!(
            counts,
            RemovalCounts {
                criteria: 2,
                subject_patterns: 2,
                address_patterns: 1,
            }
        );

        let rules = load_rule_set(&conn, &alice).await.expect("load");
        assert!(rules.domains.is_empty());
    }

    #[tokio::test]
    async fn load_rule_set_nests_subdomains_and_patterns() {
        let (db, _dir) = setup_db().await;
        let conn = db.connection().await.expect("conn");
        let alice = owner("alice");
        let domain = upsert_top_level(&conn, &alice, KeyKind::Domain, "bank.com", Some(Action::Keep))
            .await
            .expect("domain");
        let sub = upsert_subdomain(&conn, &alice, &domain.id, "alerts.bank.com", Some(Action::Delete))
            .await
            .expect("subdomain");
        insert_subject_pattern(&conn, &sub.id, Action::Delete1d, "otp")
            .await
            .expect("pattern");
        upsert_top_level(&conn, &alice, KeyKind::Email, "boss@work.com", Some(Action::Keep))
            .await
            .expect("email");
        upsert_top_level(&conn, &owner("bob"), KeyKind::Domain, "other.com", None)
            .await
            .expect("other owner");

        let rules = RuleStore::new(db.clone())
            .load_rule_set(&alice)
            .await
            .expect("load");
        assert_eq!(rules.owner_user_id, "alice");
        assert_eq!(rules.domains.len(), 1);
        let bank = &rules.domains["bank.com"];
        assert_eq!(bank.criterion.default_action, Some(Action::Keep));
        let alerts = &bank.subdomains["alerts.bank.com"];
        assert_eq!(alerts.subject_patterns[0].pattern, "otp");
        assert!(rules.emails.contains_key("boss@work.com"));
    }

    #[tokio::test]
    async fn count_children_reports_each_table() {
        let (db, _dir) = setup_db().await;
        let conn = db.connection().await.expect("conn");
        let alice = owner("alice");
        let domain = upsert_top_level(&conn, &alice, KeyKind::Domain, "bank.com", None)
            .await
            .expect("domain");
        upsert_subdomain(&conn, &alice, &domain.id, "a.bank.com", None)
            .await
            .expect("sub a");
        upsert_subdomain(&conn, &alice, &domain.id, "b.bank.com", None)
            .await
            .expect("sub b");
        insert_subject_pattern(&conn, &domain.id, Action::Delete, "sale")
            .await
            .expect("pattern");

        let counts = count_children(&conn, &domain.id).await.expect("counts");
        assert_eq!(counts.subdomains, 2);
        assert_eq!(counts.subject_patterns, 1);
        assert_eq!(counts.address_patterns, 0);
    }
}
