use std::sync::Arc;

use libsql::{Connection, Transaction};
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::audit::{self, AuditActionType, AuditError, NewAuditEntry};
use crate::db::{Database, DbError, write_transaction};
use crate::domain::DomainParser;
use crate::owner::{OwnerError, OwnerId};

use super::cache::RuleSetCache;
use super::command::{
    ModifyRequest, ParentRef, QuickAddRequest, RuleCommand, RuleQuery, RuleSelector, RuleTarget,
    RuleUpdate, ValidationError,
};
use super::store::{self, StoreError};
use super::types::{
    Action, AddressPattern, Criterion, CriterionCounts, Direction, KeyKind, RemovalCounts,
    SubjectPattern,
};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<OwnerError> for MutationError {
    fn from(err: OwnerError) -> Self {
        MutationError::Validation(err.into())
    }
}

impl From<DbError> for MutationError {
    fn from(err: DbError) -> Self {
        MutationError::Storage(err.into())
    }
}

impl From<libsql::Error> for MutationError {
    fn from(err: libsql::Error) -> Self {
        MutationError::Storage(err.into())
    }
}

impl From<AuditError> for MutationError {
    fn from(err: AuditError) -> Self {
        MutationError::Storage(err.into())
    }
}

/// What a GET found, or what a REMOVE deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleDetails {
    Criterion {
        criterion: Criterion,
        counts: CriterionCounts,
    },
    Subdomains {
        parent: Criterion,
        subdomains: Vec<Criterion>,
    },
    SubjectPatterns {
        criterion: Criterion,
        patterns: Vec<SubjectPattern>,
    },
    AddressPatterns {
        criterion: Criterion,
        direction: Direction,
        patterns: Vec<AddressPattern>,
    },
    Removed {
        counts: RemovalCounts,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifyOutcome {
    pub message: String,
    /// Row the operation touched.
    pub record_id: Option<String>,
    /// Criterion the row belongs to (the row itself for criteria).
    pub criterion_id: Option<String>,
    pub audit_id: Option<String>,
    pub details: Option<RuleDetails>,
}

/// Flat success/failure shape handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifyResponse {
    pub success: bool,
    pub message: String,
    pub record_id: Option<String>,
    pub audit_id: Option<String>,
    pub details: Option<RuleDetails>,
}

impl ModifyResponse {
    pub fn from_result(result: &Result<ModifyOutcome, MutationError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                message: outcome.message.clone(),
                record_id: outcome.record_id.clone(),
                audit_id: outcome.audit_id.clone(),
                details: outcome.details.clone(),
            },
            Err(err) => Self {
                success: false,
                message: err.to_string(),
                record_id: None,
                audit_id: None,
                details: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuickAddOutcome {
    pub success: bool,
    pub message: String,
    pub criteria_id: Option<String>,
}

#[derive(Clone)]
pub struct RuleMutationEngine {
    db: Database,
    parser: Arc<dyn DomainParser>,
    cache: Arc<RuleSetCache>,
}

impl RuleMutationEngine {
    pub fn new(db: Database, parser: Arc<dyn DomainParser>, cache: Arc<RuleSetCache>) -> Self {
        Self { db, parser, cache }
    }

    /// Validate a raw request and run it.
    pub async fn modify(&self, request: ModifyRequest) -> Result<ModifyOutcome, MutationError> {
        let (owner, command) = request.into_command(self.parser.as_ref())?;
        self.execute(&owner, command).await
    }

    /// Turn a message the user is looking at into a rule in one step.
    pub async fn quick_add(
        &self,
        request: QuickAddRequest,
    ) -> Result<QuickAddOutcome, MutationError> {
        let plan = request.into_plan(self.parser.as_ref())?;
        let outcome = self.execute(&plan.owner, plan.command).await?;
        let message = if plan.fell_back_to_domain {
            format!(
                "{} (sender has no subdomain, applied at domain level)",
                outcome.message
            )
        } else {
            outcome.message
        };
        Ok(QuickAddOutcome {
            success: true,
            message,
            criteria_id: outcome.criterion_id,
        })
    }

    pub async fn execute(
        &self,
        owner: &OwnerId,
        command: RuleCommand,
    ) -> Result<ModifyOutcome, MutationError> {
        let conn = self.db.connection().await?;

        if let RuleCommand::Get(query) = &command {
            return Ok(get(&conn, owner, query).await?);
        }

        let tx = write_transaction(&conn).await?;
        match self.apply(&tx, owner, &command).await {
            Ok(outcome) => match tx.commit().await {
                Ok(()) => {
                    self.cache.invalidate(owner).await;
                    info!(
                        owner_user_id = %owner,
                        operation = command.operation().as_str(),
                        dimension = command.dimension().as_str(),
                        key = command.key(),
                        audit_id = outcome.audit_id.as_deref().unwrap_or_default(),
                        "rule mutation committed"
                    );
                    Ok(outcome)
                }
                Err(err) => {
                    let err = StoreError::from(err);
                    self.record_failure(&conn, owner, &command, &err).await;
                    Err(MutationError::Storage(err))
                }
            },
            Err(MutationError::Storage(err)) => {
                rollback(tx).await;
                self.record_failure(&conn, owner, &command, &err).await;
                Err(MutationError::Storage(err))
            }
            Err(err) => {
                rollback(tx).await;
                info!(
                    owner_user_id = %owner,
                    operation = command.operation().as_str(),
                    dimension = command.dimension().as_str(),
                    key = command.key(),
                    error = %err,
                    "rule mutation rejected"
                );
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        conn: &Connection,
        owner: &OwnerId,
        command: &RuleCommand,
    ) -> Result<ModifyOutcome, MutationError> {
        let mut mutation = Mutation {
            conn,
            owner,
            created: Vec::new(),
        };
        let applied = match command {
            RuleCommand::Add(target) => mutation.add(target).await?,
            RuleCommand::Remove(selector) => mutation.remove(selector).await?,
            RuleCommand::Update(update) => mutation.update(update).await?,
            RuleCommand::Clear { domain } => mutation.remove_top_level(KeyKind::Domain, domain).await?,
            RuleCommand::Get(query) => return Ok(get(conn, owner, query).await?),
        };

        let audit_id = match applied.audit {
            Some(record) => {
                let mut details = command_details(command);
                details.extend(record.details);
                if !mutation.created.is_empty() {
                    details.insert("created_parents".into(), json!(mutation.created));
                }
                let entry = audit::append(
                    conn,
                    NewAuditEntry {
                        owner_user_id: owner.clone(),
                        action_type: record.action_type,
                        table_name: command.table_name(),
                        record_id: applied.record_id.clone(),
                        domain_context: command.domain_context(self.parser.as_ref()),
                        details: Value::Object(details),
                    },
                )
                .await?;
                Some(entry.id)
            }
            None => None,
        };

        Ok(ModifyOutcome {
            message: applied.message,
            record_id: applied.record_id,
            criterion_id: applied.criterion_id,
            audit_id,
            details: applied.details,
        })
    }

    /// Written on the bare connection after the rollback so it survives it.
    async fn record_failure(
        &self,
        conn: &Connection,
        owner: &OwnerId,
        command: &RuleCommand,
        err: &StoreError,
    ) {
        error!(
            owner_user_id = %owner,
            operation = command.operation().as_str(),
            dimension = command.dimension().as_str(),
            key = command.key(),
            error = %err,
            "rule mutation failed"
        );

        let mut details = command_details(command);
        details.insert("error".into(), json!(err.to_string()));
        let entry = NewAuditEntry {
            owner_user_id: owner.clone(),
            action_type: AuditActionType::Error,
            table_name: command.table_name(),
            record_id: None,
            domain_context: command.domain_context(self.parser.as_ref()),
            details: Value::Object(details),
        };
        if let Err(audit_err) = audit::append(conn, entry).await {
            error!(error = %audit_err, "failed to record mutation failure in audit log");
        }
    }
}

async fn rollback(tx: Transaction) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "failed to roll back rule mutation");
    }
}

fn command_details(command: &RuleCommand) -> Map<String, Value> {
    let mut details = Map::new();
    details.insert("operation".into(), json!(command.operation().as_str()));
    details.insert("dimension".into(), json!(command.dimension().as_str()));
    details.insert("key".into(), json!(command.key()));
    details
}

/// Result of one mutation before it is audited.
struct Applied {
    message: String,
    record_id: Option<String>,
    criterion_id: Option<String>,
    details: Option<RuleDetails>,
    audit: Option<AuditRecord>,
}

struct AuditRecord {
    action_type: AuditActionType,
    details: Map<String, Value>,
}

impl AuditRecord {
    fn new(action_type: AuditActionType, details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            action_type,
            details,
        }
    }
}

impl Applied {
    fn nothing_removed(label: &str, key: &str) -> Self {
        Self {
            message: format!("{label} {key} not found, nothing removed"),
            record_id: None,
            criterion_id: None,
            details: None,
            audit: None,
        }
    }
}

/// Mutation state scoped to one transaction.
struct Mutation<'a> {
    conn: &'a Connection,
    owner: &'a OwnerId,
    /// Parents auto-created along the way.
    created: Vec<String>,
}

impl Mutation<'_> {
    async fn ensure_domain(&mut self, domain: &str) -> Result<Criterion, StoreError> {
        if let Some(existing) =
            store::find_top_level(self.conn, self.owner, KeyKind::Domain, domain).await?
        {
            return Ok(existing);
        }
        let created =
            store::upsert_top_level(self.conn, self.owner, KeyKind::Domain, domain, None).await?;
        self.created.push(domain.to_string());
        Ok(created)
    }

    async fn ensure_subdomain(
        &mut self,
        parent: &Criterion,
        subdomain: &str,
    ) -> Result<Criterion, StoreError> {
        if let Some(existing) =
            store::find_subdomain(self.conn, self.owner, &parent.id, subdomain).await?
        {
            return Ok(existing);
        }
        let created =
            store::upsert_subdomain(self.conn, self.owner, &parent.id, subdomain, None).await?;
        self.created.push(subdomain.to_string());
        Ok(created)
    }

    async fn ensure_parent(&mut self, parent: &ParentRef) -> Result<Criterion, StoreError> {
        match parent {
            ParentRef::Domain(domain) => self.ensure_domain(domain).await,
            ParentRef::Subdomain { domain, subdomain } => {
                let parent = self.ensure_domain(domain).await?;
                self.ensure_subdomain(&parent, subdomain).await
            }
            ParentRef::Effective { domain, subdomain } => {
                let parent = self.ensure_domain(domain).await?;
                if let Some(subdomain) = subdomain {
                    if let Some(existing) =
                        store::find_subdomain(self.conn, self.owner, &parent.id, subdomain).await?
                    {
                        return Ok(existing);
                    }
                }
                Ok(parent)
            }
        }
    }

    async fn add(&mut self, target: &RuleTarget) -> Result<Applied, MutationError> {
        match target {
            RuleTarget::Domain { domain, action } => {
                self.add_top_level(KeyKind::Domain, domain, *action).await
            }
            RuleTarget::Email { email, action } => {
                self.add_top_level(KeyKind::Email, email, *action).await
            }
            RuleTarget::Subdomain {
                domain,
                subdomain,
                action,
            } => {
                let parent = self.ensure_domain(domain).await?;
                let prior =
                    store::find_subdomain(self.conn, self.owner, &parent.id, subdomain).await?;
                let criterion =
                    store::upsert_subdomain(self.conn, self.owner, &parent.id, subdomain, *action)
                        .await?;
                Ok(criterion_added("subdomain", subdomain, prior, criterion, *action))
            }
            RuleTarget::Subject {
                parent,
                pattern,
                action,
            } => {
                let criterion = self.ensure_parent(parent).await?;
                let inserted =
                    store::insert_subject_pattern(self.conn, &criterion.id, *action, pattern)
                        .await?;
                match inserted {
                    Some(row) => Ok(Applied {
                        message: format!(
                            "added subject pattern '{pattern}' ({}) under {}",
                            action.as_str(),
                            criterion.key_value
                        ),
                        record_id: Some(row.id),
                        criterion_id: Some(criterion.id),
                        details: None,
                        audit: Some(AuditRecord::new(
                            AuditActionType::Insert,
                            json!({"outcome": "inserted", "action": action.as_str()}),
                        )),
                    }),
                    None => {
                        let existing =
                            store::find_subject_pattern(self.conn, &criterion.id, *action, pattern)
                                .await?;
                        Ok(Applied {
                            message: format!(
                                "subject pattern '{pattern}' ({}) already exists under {}",
                                action.as_str(),
                                criterion.key_value
                            ),
                            record_id: existing.map(|p| p.id),
                            criterion_id: Some(criterion.id),
                            details: None,
                            audit: Some(AuditRecord::new(
                                AuditActionType::Update,
                                json!({"outcome": "unchanged", "action": action.as_str()}),
                            )),
                        })
                    }
                }
            }
            RuleTarget::Address {
                parent,
                direction,
                address,
                action,
            } => {
                let criterion = self.ensure_parent(parent).await?;
                let prior =
                    store::find_address_pattern(self.conn, &criterion.id, *direction, address)
                        .await?;
                let row = store::upsert_address_pattern(
                    self.conn,
                    &criterion.id,
                    *direction,
                    address,
                    *action,
                )
                .await?;
                let label = address_label(*direction);
                let (action_type, outcome, message) = match prior {
                    None => (
                        AuditActionType::Insert,
                        "inserted",
                        format!(
                            "added {label} {address} ({}) under {}",
                            action.as_str(),
                            criterion.key_value
                        ),
                    ),
                    Some(prior) if prior.action != *action => (
                        AuditActionType::Update,
                        "updated",
                        format!("updated {label} {address} to {}", action.as_str()),
                    ),
                    Some(_) => (
                        AuditActionType::Update,
                        "unchanged",
                        format!("{label} {address} already exists"),
                    ),
                };
                Ok(Applied {
                    message,
                    record_id: Some(row.id),
                    criterion_id: Some(criterion.id),
                    details: None,
                    audit: Some(AuditRecord::new(
                        action_type,
                        json!({"outcome": outcome, "action": action.as_str()}),
                    )),
                })
            }
        }
    }

    async fn add_top_level(
        &mut self,
        kind: KeyKind,
        key: &str,
        action: Option<Action>,
    ) -> Result<Applied, MutationError> {
        let prior = store::find_top_level(self.conn, self.owner, kind, key).await?;
        let criterion = store::upsert_top_level(self.conn, self.owner, kind, key, action).await?;
        Ok(criterion_added(kind.as_str(), key, prior, criterion, action))
    }

    async fn remove(&mut self, selector: &RuleSelector) -> Result<Applied, MutationError> {
        match selector {
            RuleSelector::Domain { domain } => {
                self.remove_top_level(KeyKind::Domain, domain).await
            }
            RuleSelector::Email { email } => self.remove_top_level(KeyKind::Email, email).await,
            RuleSelector::Subdomain { domain, subdomain } => {
                let Some(parent) =
                    store::find_top_level(self.conn, self.owner, KeyKind::Domain, domain).await?
                else {
                    return Ok(Applied::nothing_removed("subdomain", subdomain));
                };
                match store::find_subdomain(self.conn, self.owner, &parent.id, subdomain).await? {
                    Some(criterion) => self.remove_criterion("subdomain", criterion).await,
                    None => Ok(Applied::nothing_removed("subdomain", subdomain)),
                }
            }
            RuleSelector::Subject {
                parent,
                pattern,
                action,
            } => {
                let label = format!("subject pattern '{pattern}'");
                let Some(criterion) = resolve_parent(self.conn, self.owner, parent).await? else {
                    return Ok(Applied::nothing_removed(&label, "under missing parent"));
                };
                let deleted =
                    store::delete_subject_patterns(self.conn, &criterion.id, pattern, *action)
                        .await?;
                if deleted == 0 {
                    return Ok(Applied::nothing_removed(
                        &label,
                        &format!("under {}", criterion.key_value),
                    ));
                }
                let counts = RemovalCounts {
                    subject_patterns: deleted,
                    ..Default::default()
                };
                Ok(Applied {
                    message: format!("removed {label} from {}", criterion.key_value),
                    record_id: None,
                    criterion_id: Some(criterion.id),
                    details: Some(RuleDetails::Removed { counts }),
                    audit: Some(AuditRecord::new(
                        AuditActionType::Delete,
                        json!({
                            "removed": counts,
                            "action": action.map(|a| a.as_str()),
                        }),
                    )),
                })
            }
            RuleSelector::Address {
                parent,
                direction,
                address,
            } => {
                let label = address_label(*direction);
                let Some(criterion) = resolve_parent(self.conn, self.owner, parent).await? else {
                    return Ok(Applied::nothing_removed(label, address));
                };
                let deleted =
                    store::delete_address_pattern(self.conn, &criterion.id, *direction, address)
                        .await?;
                if deleted == 0 {
                    return Ok(Applied::nothing_removed(label, address));
                }
                let counts = RemovalCounts {
                    address_patterns: deleted,
                    ..Default::default()
                };
                Ok(Applied {
                    message: format!("removed {label} {address} from {}", criterion.key_value),
                    record_id: None,
                    criterion_id: Some(criterion.id),
                    details: Some(RuleDetails::Removed { counts }),
                    audit: Some(AuditRecord::new(
                        AuditActionType::Delete,
                        json!({ "removed": counts }),
                    )),
                })
            }
        }
    }

    async fn remove_top_level(
        &mut self,
        kind: KeyKind,
        key: &str,
    ) -> Result<Applied, MutationError> {
        match store::find_top_level(self.conn, self.owner, kind, key).await? {
            Some(criterion) => self.remove_criterion(kind.as_str(), criterion).await,
            None => Ok(Applied::nothing_removed(kind.as_str(), key)),
        }
    }

    async fn remove_criterion(
        &mut self,
        label: &str,
        criterion: Criterion,
    ) -> Result<Applied, MutationError> {
        let counts = store::delete_criterion(self.conn, &criterion.id).await?;
        let nested = counts.criteria.saturating_sub(1);
        let message = if counts.criteria > 1 || counts.subject_patterns > 0 || counts.address_patterns > 0
        {
            format!(
                "removed {label} {} with {nested} subdomains, {} subject patterns and {} address patterns",
                criterion.key_value, counts.subject_patterns, counts.address_patterns
            )
        } else {
            format!("removed {label} {}", criterion.key_value)
        };
        Ok(Applied {
            message,
            record_id: Some(criterion.id.clone()),
            criterion_id: Some(criterion.id),
            details: Some(RuleDetails::Removed { counts }),
            audit: Some(AuditRecord::new(
                AuditActionType::Delete,
                json!({
                    "removed": counts,
                    "previous_action": criterion.default_action.map(|a| a.as_str()),
                }),
            )),
        })
    }

    async fn update(&mut self, update: &RuleUpdate) -> Result<Applied, MutationError> {
        match update {
            RuleUpdate::Domain {
                domain,
                action,
                expected,
            } => {
                let criterion = self.require_top_level(KeyKind::Domain, domain).await?;
                self.update_default("domain", criterion, *action, *expected)
                    .await
            }
            RuleUpdate::Email {
                email,
                action,
                expected,
            } => {
                let criterion = self.require_top_level(KeyKind::Email, email).await?;
                self.update_default("email", criterion, *action, *expected)
                    .await
            }
            RuleUpdate::Subdomain {
                domain,
                subdomain,
                action,
                expected,
            } => {
                let parent = self.require_top_level(KeyKind::Domain, domain).await?;
                let criterion = store::find_subdomain(self.conn, self.owner, &parent.id, subdomain)
                    .await?
                    .ok_or_else(|| MutationError::NotFound(format!("subdomain {subdomain} not found")))?;
                self.update_default("subdomain", criterion, *action, *expected)
                    .await
            }
            RuleUpdate::Subject {
                parent,
                pattern,
                from,
                to,
            } => {
                let criterion = self.require_parent(parent).await?;
                let existing =
                    store::find_subject_pattern(self.conn, &criterion.id, *from, pattern)
                        .await?
                        .ok_or_else(|| {
                            MutationError::NotFound(format!(
                                "subject pattern '{pattern}' ({}) not found under {}",
                                from.as_str(),
                                criterion.key_value
                            ))
                        })?;

                if from == to {
                    return Ok(Applied {
                        message: format!(
                            "subject pattern '{pattern}' already has action {}",
                            to.as_str()
                        ),
                        record_id: Some(existing.id),
                        criterion_id: Some(criterion.id),
                        details: None,
                        audit: Some(AuditRecord::new(
                            AuditActionType::Update,
                            json!({"outcome": "unchanged", "action": to.as_str()}),
                        )),
                    });
                }

                let (record_id, outcome) = match store::find_subject_pattern(
                    self.conn,
                    &criterion.id,
                    *to,
                    pattern,
                )
                .await?
                {
                    // The target triple already exists, so the old row folds into it.
                    Some(target) => {
                        store::delete_subject_pattern_by_id(self.conn, &existing.id).await?;
                        (target.id, "merged")
                    }
                    None => {
                        let updated =
                            store::update_subject_pattern_action(self.conn, &existing.id, *to)
                                .await?;
                        (updated.id, "updated")
                    }
                };

                Ok(Applied {
                    message: format!(
                        "updated subject pattern '{pattern}' from {} to {}",
                        from.as_str(),
                        to.as_str()
                    ),
                    record_id: Some(record_id),
                    criterion_id: Some(criterion.id),
                    details: None,
                    audit: Some(AuditRecord::new(
                        AuditActionType::Update,
                        json!({
                            "outcome": outcome,
                            "action": to.as_str(),
                            "previous_action": from.as_str(),
                        }),
                    )),
                })
            }
            RuleUpdate::Address {
                parent,
                direction,
                address,
                action,
                expected,
            } => {
                let label = address_label(*direction);
                let criterion = self.require_parent(parent).await?;
                let existing =
                    store::find_address_pattern(self.conn, &criterion.id, *direction, address)
                        .await?
                        .ok_or_else(|| {
                            MutationError::NotFound(format!("{label} {address} not found"))
                        })?;

                if let Some(expected) = expected {
                    if existing.action != *expected {
                        return Err(MutationError::Conflict(format!(
                            "{label} {address} has action {}, expected {}",
                            existing.action.as_str(),
                            expected.as_str()
                        )));
                    }
                }

                if existing.action == *action {
                    return Ok(Applied {
                        message: format!("{label} {address} already has action {}", action.as_str()),
                        record_id: Some(existing.id),
                        criterion_id: Some(criterion.id),
                        details: None,
                        audit: Some(AuditRecord::new(
                            AuditActionType::Update,
                            json!({"outcome": "unchanged", "action": action.as_str()}),
                        )),
                    });
                }

                let updated = store::upsert_address_pattern(
                    self.conn,
                    &criterion.id,
                    *direction,
                    address,
                    *action,
                )
                .await?;
                Ok(Applied {
                    message: format!("updated {label} {address} to {}", action.as_str()),
                    record_id: Some(updated.id),
                    criterion_id: Some(criterion.id),
                    details: None,
                    audit: Some(AuditRecord::new(
                        AuditActionType::Update,
                        json!({
                            "outcome": "updated",
                            "action": action.as_str(),
                            "previous_action": existing.action.as_str(),
                        }),
                    )),
                })
            }
        }
    }

    async fn require_top_level(&self, kind: KeyKind, key: &str) -> Result<Criterion, MutationError> {
        store::find_top_level(self.conn, self.owner, kind, key)
            .await?
            .ok_or_else(|| MutationError::NotFound(format!("{} {key} not found", kind.as_str())))
    }

    async fn require_parent(&self, parent: &ParentRef) -> Result<Criterion, MutationError> {
        resolve_parent(self.conn, self.owner, parent)
            .await?
            .ok_or_else(|| MutationError::NotFound(format!("{} not found", describe_parent(parent))))
    }

    async fn update_default(
        &self,
        label: &str,
        criterion: Criterion,
        action: Action,
        expected: Option<Action>,
    ) -> Result<Applied, MutationError> {
        if let Some(expected) = expected {
            if criterion.default_action != Some(expected) {
                return Err(MutationError::Conflict(format!(
                    "{label} {} has action {}, expected {}",
                    criterion.key_value,
                    describe_action(criterion.default_action),
                    expected.as_str()
                )));
            }
        }

        if criterion.default_action == Some(action) {
            return Ok(Applied {
                message: format!(
                    "{label} {} already has action {}",
                    criterion.key_value,
                    action.as_str()
                ),
                record_id: Some(criterion.id.clone()),
                criterion_id: Some(criterion.id),
                details: None,
                audit: Some(AuditRecord::new(
                    AuditActionType::Update,
                    json!({"outcome": "unchanged", "action": action.as_str()}),
                )),
            });
        }

        let updated = store::set_default_action(self.conn, &criterion.id, action).await?;
        Ok(Applied {
            message: format!(
                "updated {label} {} to {}",
                updated.key_value,
                action.as_str()
            ),
            record_id: Some(updated.id.clone()),
            criterion_id: Some(updated.id),
            details: None,
            audit: Some(AuditRecord::new(
                AuditActionType::Update,
                json!({
                    "outcome": "updated",
                    "action": action.as_str(),
                    "previous_action": criterion.default_action.map(|a| a.as_str()),
                }),
            )),
        })
    }
}

fn criterion_added(
    label: &str,
    key: &str,
    prior: Option<Criterion>,
    criterion: Criterion,
    action: Option<Action>,
) -> Applied {
    let previous_action = prior.as_ref().and_then(|p| p.default_action);
    let (action_type, outcome, message) = match (&prior, action) {
        (None, Some(action)) => (
            AuditActionType::Insert,
            "inserted",
            format!("added {label} {key} with action {}", action.as_str()),
        ),
        (None, None) => (
            AuditActionType::Insert,
            "inserted",
            format!("added {label} {key}"),
        ),
        (Some(_), Some(action)) if previous_action != Some(action) => (
            AuditActionType::Update,
            "updated",
            format!("updated {label} {key} to {}", action.as_str()),
        ),
        (Some(_), _) => (
            AuditActionType::Update,
            "unchanged",
            format!("{label} {key} already exists"),
        ),
    };

    Applied {
        message,
        record_id: Some(criterion.id.clone()),
        criterion_id: Some(criterion.id),
        details: None,
        audit: Some(AuditRecord::new(
            action_type,
            json!({
                "outcome": outcome,
                "action": action.map(|a| a.as_str()),
                "previous_action": previous_action.map(|a| a.as_str()),
            }),
        )),
    }
}

/// Find a parent criterion without creating anything.
async fn resolve_parent(
    conn: &Connection,
    owner: &OwnerId,
    parent: &ParentRef,
) -> Result<Option<Criterion>, StoreError> {
    let Some(domain) = store::find_top_level(conn, owner, KeyKind::Domain, parent.domain()).await?
    else {
        return Ok(None);
    };
    match parent {
        ParentRef::Domain(_) => Ok(Some(domain)),
        ParentRef::Subdomain { subdomain, .. } => {
            store::find_subdomain(conn, owner, &domain.id, subdomain).await
        }
        ParentRef::Effective { subdomain, .. } => {
            if let Some(subdomain) = subdomain {
                if let Some(found) = store::find_subdomain(conn, owner, &domain.id, subdomain).await? {
                    return Ok(Some(found));
                }
            }
            Ok(Some(domain))
        }
    }
}

async fn get(
    conn: &Connection,
    owner: &OwnerId,
    query: &RuleQuery,
) -> Result<ModifyOutcome, StoreError> {
    let found = |message: String, criterion_id: &str, details: RuleDetails| ModifyOutcome {
        message,
        record_id: Some(criterion_id.to_string()),
        criterion_id: Some(criterion_id.to_string()),
        audit_id: None,
        details: Some(details),
    };
    let missing = |message: String| ModifyOutcome {
        message,
        record_id: None,
        criterion_id: None,
        audit_id: None,
        details: None,
    };

    match query {
        RuleQuery::Domain { domain } => {
            match store::find_top_level(conn, owner, KeyKind::Domain, domain).await? {
                Some(criterion) => {
                    let counts = store::count_children(conn, &criterion.id).await?;
                    let id = criterion.id.clone();
                    Ok(found(
                        format!("domain {domain} found"),
                        &id,
                        RuleDetails::Criterion { criterion, counts },
                    ))
                }
                None => Ok(missing(format!("domain {domain} not found"))),
            }
        }
        RuleQuery::Email { email } => {
            match store::find_top_level(conn, owner, KeyKind::Email, email).await? {
                Some(criterion) => {
                    let counts = store::count_children(conn, &criterion.id).await?;
                    let id = criterion.id.clone();
                    Ok(found(
                        format!("email {email} found"),
                        &id,
                        RuleDetails::Criterion { criterion, counts },
                    ))
                }
                None => Ok(missing(format!("email {email} not found"))),
            }
        }
        RuleQuery::Subdomain { domain, subdomain } => {
            let Some(parent) = store::find_top_level(conn, owner, KeyKind::Domain, domain).await?
            else {
                return Ok(missing(format!("domain {domain} not found")));
            };
            match subdomain {
                Some(subdomain) => {
                    match store::find_subdomain(conn, owner, &parent.id, subdomain).await? {
                        Some(criterion) => {
                            let counts = store::count_children(conn, &criterion.id).await?;
                            let id = criterion.id.clone();
                            Ok(found(
                                format!("subdomain {subdomain} found"),
                                &id,
                                RuleDetails::Criterion { criterion, counts },
                            ))
                        }
                        None => Ok(missing(format!("subdomain {subdomain} not found"))),
                    }
                }
                None => {
                    let subdomains = store::list_subdomains(conn, owner, &parent.id).await?;
                    let id = parent.id.clone();
                    Ok(found(
                        format!("{} subdomains under {domain}", subdomains.len()),
                        &id,
                        RuleDetails::Subdomains { parent, subdomains },
                    ))
                }
            }
        }
        RuleQuery::Subject { parent } => match resolve_parent(conn, owner, parent).await? {
            Some(criterion) => {
                let patterns = store::list_subject_patterns(conn, &criterion.id).await?;
                let id = criterion.id.clone();
                Ok(found(
                    format!(
                        "{} subject patterns under {}",
                        patterns.len(),
                        criterion.key_value
                    ),
                    &id,
                    RuleDetails::SubjectPatterns {
                        criterion,
                        patterns,
                    },
                ))
            }
            None => Ok(missing(format!("{} not found", describe_parent(parent)))),
        },
        RuleQuery::Address { parent, direction } => {
            match resolve_parent(conn, owner, parent).await? {
                Some(criterion) => {
                    let patterns =
                        store::list_address_patterns(conn, &criterion.id, *direction).await?;
                    let id = criterion.id.clone();
                    Ok(found(
                        format!(
                            "{} {} patterns under {}",
                            patterns.len(),
                            address_label(*direction),
                            criterion.key_value
                        ),
                        &id,
                        RuleDetails::AddressPatterns {
                            criterion,
                            direction: *direction,
                            patterns,
                        },
                    ))
                }
                None => Ok(missing(format!("{} not found", describe_parent(parent)))),
            }
        }
    }
}

fn address_label(direction: Direction) -> &'static str {
    match direction {
        Direction::From => "from address",
        Direction::To => "to address",
    }
}

fn describe_parent(parent: &ParentRef) -> String {
    match parent {
        ParentRef::Domain(domain) => format!("domain {domain}"),
        ParentRef::Subdomain { subdomain, .. } => format!("subdomain {subdomain}"),
        ParentRef::Effective { domain, .. } => format!("domain {domain}"),
    }
}

fn describe_action(action: Option<Action>) -> &'static str {
    action.map(|a| a.as_str()).unwrap_or("none")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRepository;
    use crate::domain::LabelCountParser;
    use crate::migrations::run_migrations;
    use crate::rules::rule_set::RuleSet;
    use crate::rules::types::AddressAction;
    use libsql::params;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (db, dir)
    }

    fn engine(db: &Database) -> (RuleMutationEngine, Arc<RuleSetCache>) {
        let cache = Arc::new(RuleSetCache::new(Duration::from_secs(300)));
        let engine = RuleMutationEngine::new(db.clone(), Arc::new(LabelCountParser), cache.clone());
        (engine, cache)
    }

    fn request(operation: &str, dimension: &str, key: &str) -> ModifyRequest {
        ModifyRequest {
            operation: operation.into(),
            dimension: dimension.into(),
            owner_user_id: Some("alice".into()),
            key_value: Some(key.into()),
            ..Default::default()
        }
    }

    fn with_action(mut req: ModifyRequest, action: &str) -> ModifyRequest {
        req.action = Some(action.into());
        req
    }

    fn with_parent(mut req: ModifyRequest, domain: &str) -> ModifyRequest {
        req.parent_domain = Some(domain.into());
        req
    }

    async fn count(db: &Database, sql: &str) -> i64 {
        let conn = db.connection().await.expect("conn");
        let mut rows = conn.query(sql, ()).await.expect("query");
        rows.next()
            .await
            .expect("row")
            .expect("row value")
            .get(0)
            .expect("count")
    }

    fn alice() -> OwnerId {
        OwnerId::parse("alice").unwrap()
    }

    #[tokio::test]
    async fn add_is_idempotent_and_audited_each_time() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let first = engine
            .modify(with_action(request("add", "domain", "bank.com"), "delete"))
            .await
            .expect("first add");
        let second = engine
            .modify(with_action(request("add", "domain", "bank.com"), "delete"))
            .await
            .expect("second add");

        assert_eq!(first.record_id, second.record_id);
        assert!(second.message.contains("already exists"));
        assert_eq!(count(&db, "SELECT COUNT(*) FROM criteria").await, 1);

        let audit = AuditRepository::new(db.clone())
            .list_for_owner(&alice(), None)
            .await
            .expect("audit");
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].action_type, AuditActionType::Update);
        assert_eq!(audit[0].details["outcome"], "unchanged");
        assert_eq!(audit[1].action_type, AuditActionType::Insert);
        assert_eq!(audit[1].domain_context, "bank.com");
        assert_eq!(second.audit_id.as_deref(), Some(audit[0].id.as_str()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_all_succeed_with_one_row_per_key() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let mut tasks = Vec::new();
        for owner in ["alice", "bob", "carol", "dave"] {
            for _ in 0..4 {
                let engine = engine.clone();
                let mut req = with_action(request("add", "domain", "bank.com"), "delete");
                req.owner_user_id = Some(owner.into());
                tasks.push(tokio::spawn(async move { engine.modify(req).await }));
            }
        }

        for task in tasks {
            let outcome = task.await.expect("join").expect("concurrent add");
            assert!(outcome.record_id.is_some());
        }

        assert_eq!(count(&db, "SELECT COUNT(*) FROM criteria").await, 4);
        assert_eq!(
            count(
                &db,
                "SELECT COUNT(*) FROM (SELECT owner_user_id, key_value FROM criteria \
                 GROUP BY owner_user_id, key_value HAVING COUNT(*) > 1)"
            )
            .await,
            0
        );
        assert_eq!(count(&db, "SELECT COUNT(*) FROM audit_log").await, 16);
    }

    #[tokio::test]
    async fn add_subject_auto_creates_parent_domain() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let outcome = engine
            .modify(with_parent(
                with_action(request("add", "subject", "OTP"), "delete_1d"),
                "Bank.com",
            ))
            .await
            .expect("add subject");

        let criterion_id = outcome.criterion_id.expect("criterion id");
        let rules = store::load_rule_set(&db.connection().await.unwrap(), &alice())
            .await
            .expect("load");
        let bank = &rules.domains["bank.com"];
        assert_eq!(bank.criterion.id, criterion_id);
        assert_eq!(bank.criterion.default_action, None);
        assert_eq!(bank.subject_patterns[0].pattern, "otp");
        assert_eq!(bank.subject_patterns[0].action, Action::Delete1d);

        let audit = AuditRepository::new(db.clone())
            .list_for_owner(&alice(), None)
            .await
            .expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].table_name, "subject_patterns");
        assert_eq!(audit[0].details["created_parents"][0], "bank.com");
    }

    #[tokio::test]
    async fn auto_created_parent_keeps_existing_default() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        engine
            .modify(with_action(request("add", "domain", "bank.com"), "keep"))
            .await
            .expect("domain");
        engine
            .modify(with_parent(
                with_action(request("add", "subject", "promo"), "delete"),
                "bank.com",
            ))
            .await
            .expect("subject");

        let outcome = engine
            .modify(request("get", "domain", "bank.com"))
            .await
            .expect("get");
        match outcome.details {
            Some(RuleDetails::Criterion { criterion, counts }) => {
                assert_eq!(criterion.default_action, Some(Action::Keep));
                assert_eq!(counts.subject_patterns, 1);
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_domain_cascades_everything_beneath() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        engine
            .modify(with_action(request("add", "domain", "bank.com"), "keep"))
            .await
            .expect("domain");
        engine
            .modify(with_action(
                request("add", "subdomain", "alerts.bank.com"),
                "delete",
            ))
            .await
            .expect("subdomain");
        let mut sub_subject = with_action(request("add", "subject", "otp"), "delete_1d");
        sub_subject.parent_subdomain = Some("alerts.bank.com".into());
        engine.modify(sub_subject).await.expect("sub subject");
        engine
            .modify(with_action(
                request("add", "from_email", "ceo@bank.com"),
                "keep",
            ))
            .await
            .expect("from");

        let outcome = engine
            .modify(request("remove", "domain", "bank.com"))
            .await
            .expect("remove");
        assert_eq!(
            outcome.details,
            Some(RuleDetails::Removed {
                counts: RemovalCounts {
                    criteria: 2,
                    subject_patterns: 1,
                    address_patterns: 1,
                }
            })
        );
        assert_eq!(count(&db, "SELECT COUNT(*) FROM criteria").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM subject_patterns").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM address_patterns").await, 0);
    }

    #[tokio::test]
    async fn remove_absent_succeeds_without_audit() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let outcome = engine
            .modify(request("remove", "domain", "nowhere.com"))
            .await
            .expect("remove absent");
        assert!(outcome.message.contains("not found"));
        assert_eq!(outcome.audit_id, None);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM audit_log").await, 0);
    }

    #[tokio::test]
    async fn update_requires_existing_target_and_matching_old_action() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let err = engine
            .modify(with_action(request("update", "domain", "bank.com"), "keep"))
            .await
            .expect_err("absent");
        assert!(matches!(err, MutationError::NotFound(_)));

        engine
            .modify(with_action(request("add", "domain", "bank.com"), "delete"))
            .await
            .expect("add");

        let mut stale = with_action(request("update", "domain", "bank.com"), "keep");
        stale.old_action = Some("delete_10d".into());
        let err = engine.modify(stale).await.expect_err("conflict");
        assert!(matches!(err, MutationError::Conflict(_)));

        let mut fresh = with_action(request("update", "domain", "bank.com"), "keep");
        fresh.old_action = Some("delete".into());
        let outcome = engine.modify(fresh).await.expect("update");
        assert!(outcome.message.contains("to keep"));
    }

    #[tokio::test]
    async fn update_subject_merges_into_existing_triple() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        for action in ["delete", "delete_1d"] {
            engine
                .modify(with_parent(
                    with_action(request("add", "subject", "otp"), action),
                    "bank.com",
                ))
                .await
                .expect("add subject");
        }

        let mut update = with_parent(with_action(request("update", "subject", "otp"), "delete"), "bank.com");
        update.old_action = Some("delete_1d".into());
        engine.modify(update).await.expect("update");

        assert_eq!(count(&db, "SELECT COUNT(*) FROM subject_patterns").await, 1);
        assert_eq!(
            count(
                &db,
                "SELECT COUNT(*) FROM subject_patterns WHERE action = 'delete'"
            )
            .await,
            1
        );
    }

    #[tokio::test]
    async fn get_absent_is_success_without_details() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let outcome = engine
            .modify(request("get", "email", "ghost@nowhere.com"))
            .await
            .expect("get");
        assert_eq!(outcome.details, None);
        assert!(outcome.message.contains("not found"));
    }

    #[tokio::test]
    async fn owners_never_see_each_others_rules() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        engine
            .modify(with_action(request("add", "domain", "x.com"), "keep"))
            .await
            .expect("alice adds");

        let mut bob_remove = request("remove", "domain", "x.com");
        bob_remove.owner_user_id = Some("bob".into());
        let outcome = engine.modify(bob_remove).await.expect("bob removes");
        assert!(outcome.message.contains("not found"));

        let mut bob_get = request("get", "domain", "x.com");
        bob_get.owner_user_id = Some("bob".into());
        assert_eq!(engine.modify(bob_get).await.expect("bob get").details, None);

        assert_eq!(count(&db, "SELECT COUNT(*) FROM criteria").await, 1);
    }

    #[tokio::test]
    async fn validation_failure_touches_nothing() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let mut req = with_action(request("add", "domain", "bank.com"), "keep");
        req.owner_user_id = Some(" ".into());
        let err = engine.modify(req).await.expect_err("blank owner");
        assert!(matches!(err, MutationError::Validation(_)));

        assert_eq!(count(&db, "SELECT COUNT(*) FROM criteria").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM audit_log").await, 0);
    }

    #[tokio::test]
    async fn storage_failure_rolls_back_and_records_error() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);
        let conn = db.connection().await.expect("conn");
        conn.execute(
            "CREATE TRIGGER reject_subjects BEFORE INSERT ON subject_patterns
             BEGIN SELECT RAISE(ABORT, 'subject patterns disabled'); END",
            (),
        )
        .await
        .expect("trigger");

        let err = engine
            .modify(with_parent(
                with_action(request("add", "subject", "otp"), "delete"),
                "bank.com",
            ))
            .await
            .expect_err("storage failure");
        assert!(matches!(err, MutationError::Storage(_)));

        assert_eq!(count(&db, "SELECT COUNT(*) FROM criteria").await, 0);
        let mut rows = conn
            .query(
                "SELECT action_type, table_name FROM audit_log WHERE owner_user_id = ?1",
                params!["alice"],
            )
            .await
            .expect("audit query");
        let row = rows.next().await.expect("row").expect("error entry");
        assert_eq!(row.get::<String>(0).unwrap(), "error");
        assert_eq!(row.get::<String>(1).unwrap(), "subject_patterns");
        assert!(rows.next().await.expect("row").is_none());
    }

    #[tokio::test]
    async fn commit_invalidates_cached_rule_set() {
        let (db, _dir) = setup_db().await;
        let (engine, cache) = engine(&db);
        let owner = alice();

        let generation = cache.generation(&owner).await;
        cache.insert(&owner, generation, RuleSet::empty("alice")).await;
        assert!(cache.get(&owner).await.is_some());

        engine
            .modify(with_action(request("add", "domain", "bank.com"), "keep"))
            .await
            .expect("add");
        assert!(cache.get(&owner).await.is_none());
    }

    #[tokio::test]
    async fn quick_add_subdomain_level_falls_back_to_domain() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        let outcome = engine
            .quick_add(QuickAddRequest {
                owner_user_id: Some("alice".into()),
                from_address: "news@shop.com".into(),
                action: "delete".into(),
                level: "subdomain".into(),
                ..Default::default()
            })
            .await
            .expect("quick add");
        assert!(outcome.success);
        assert!(outcome.message.contains("domain level"));

        let rules = store::load_rule_set(&db.connection().await.unwrap(), &alice())
            .await
            .expect("load");
        let shop = &rules.domains["shop.com"];
        assert_eq!(outcome.criteria_id.as_deref(), Some(shop.criterion.id.as_str()));
        assert_eq!(shop.criterion.default_action, Some(Action::Delete));
    }

    #[tokio::test]
    async fn quick_add_subject_pattern_under_subdomain() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        engine
            .quick_add(QuickAddRequest {
                owner_user_id: Some("alice".into()),
                from_address: "OTP <otp@custcomm.icicibank.com>".into(),
                subject: Some("Your OTP is 1234".into()),
                action: "delete_1d".into(),
                level: "subdomain".into(),
                subject_pattern: Some("OTP".into()),
                ..Default::default()
            })
            .await
            .expect("quick add");

        let rules = store::load_rule_set(&db.connection().await.unwrap(), &alice())
            .await
            .expect("load");
        let sub = &rules.domains["icicibank.com"].subdomains["custcomm.icicibank.com"];
        assert_eq!(sub.criterion.default_action, None);
        assert_eq!(sub.subject_patterns[0].pattern, "otp");
    }

    #[tokio::test]
    async fn quick_add_from_email_records_sender() {
        let (db, _dir) = setup_db().await;
        let (engine, _) = engine(&db);

        engine
            .quick_add(QuickAddRequest {
                owner_user_id: Some("alice".into()),
                from_address: "CEO@Bank.com".into(),
                action: "keep".into(),
                level: "from_email".into(),
                ..Default::default()
            })
            .await
            .expect("quick add");

        let rules = store::load_rule_set(&db.connection().await.unwrap(), &alice())
            .await
            .expect("load");
        let bank = &rules.domains["bank.com"];
        assert_eq!(bank.address_patterns[0].address, "ceo@bank.com");
        assert_eq!(bank.address_patterns[0].direction, Direction::From);
        assert_eq!(bank.address_patterns[0].action, AddressAction::Keep);

        let err = engine
            .quick_add(QuickAddRequest {
                owner_user_id: Some("alice".into()),
                from_address: "ceo@bank.com".into(),
                action: "delete_10d".into(),
                level: "from_email".into(),
                ..Default::default()
            })
            .await
            .expect_err("delayed delete on address");
        assert!(matches!(err, MutationError::Validation(_)));
    }

    #[test]
    fn response_shape_reports_failures() {
        let result: Result<ModifyOutcome, MutationError> =
            Err(MutationError::NotFound("domain x.com not found".into()));
        let response = ModifyResponse::from_result(&result);
        assert!(!response.success);
        assert_eq!(response.message, "domain x.com not found");
        assert_eq!(response.record_id, None);
    }
}
