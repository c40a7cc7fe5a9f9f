use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use libsql::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::{Database, DbError, write_transaction};
use crate::domain::DomainParser;
use crate::messages::{self, MessageError};
use crate::owner::{OwnerError, OwnerId, OwnerScope};
use crate::rules::store::{self, StoreError};
use crate::rules::{RuleSet, RuleSetCache};

use super::cascade::Verdict;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Messages never classified.
    #[default]
    Pending,
    /// Every message in scope, overwriting earlier verdicts.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub total: u64,
    /// Keyed by verdict; every verdict is present, zero when unused.
    pub per_action: BTreeMap<String, u64>,
}

impl ClassificationSummary {
    pub fn new() -> Self {
        Self {
            total: 0,
            per_action: Verdict::ALL
                .iter()
                .map(|verdict| (verdict.as_str().to_string(), 0))
                .collect(),
        }
    }

    fn record(&mut self, verdict: Verdict) {
        self.total += 1;
        *self
            .per_action
            .entry(verdict.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn count(&self, verdict: Verdict) -> u64 {
        self.per_action.get(verdict.as_str()).copied().unwrap_or(0)
    }
}

impl Default for ClassificationSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid owner: {0}")]
    Owner(#[from] OwnerError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("rule store error: {0}")]
    Store(#[from] StoreError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
}

pub struct ClassificationEngine {
    db: Database,
    parser: Arc<dyn DomainParser>,
    cache: Arc<RuleSetCache>,
}

impl ClassificationEngine {
    pub fn new(db: Database, parser: Arc<dyn DomainParser>, cache: Arc<RuleSetCache>) -> Self {
        Self { db, parser, cache }
    }

    /// Classify one caller's messages. Missing or blank ids are rejected
    /// before anything is read.
    pub async fn evaluate_owner(
        &self,
        owner_user_id: Option<&str>,
        selection: Selection,
    ) -> Result<ClassificationSummary, ClassifyError> {
        let scope = OwnerScope::user(owner_user_id)?;
        self.evaluate(&scope, selection).await
    }

    /// Resolve a verdict for every selected message in scope and write it
    /// back. The whole batch commits or rolls back together.
    pub async fn evaluate(
        &self,
        scope: &OwnerScope,
        selection: Selection,
    ) -> Result<ClassificationSummary, ClassifyError> {
        let owner = scope.owner().map(OwnerId::as_str).unwrap_or("*");
        let conn = self.db.connection().await?;
        let tx = write_transaction(&conn).await?;

        match self.classify_batch(&tx, scope, selection).await {
            Ok(summary) => {
                tx.commit().await?;
                info!(
                    owner_user_id = owner,
                    ?selection,
                    total = summary.total,
                    keep = summary.count(Verdict::Keep),
                    delete = summary.count(Verdict::Delete),
                    delete_1d = summary.count(Verdict::Delete1d),
                    delete_10d = summary.count(Verdict::Delete10d),
                    undecided = summary.count(Verdict::Undecided),
                    "classified message batch"
                );
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "failed to roll back classification batch");
                }
                error!(owner_user_id = owner, error = %err, "classification batch failed");
                Err(err)
            }
        }
    }

    /// Rule set for one owner, served from the cache when fresh.
    pub async fn rules_for(
        &self,
        conn: &Connection,
        owner: &OwnerId,
    ) -> Result<Arc<RuleSet>, StoreError> {
        if let Some(rules) = self.cache.get(owner).await {
            return Ok(rules);
        }
        let generation = self.cache.generation(owner).await;
        let rules = store::load_rule_set(conn, owner).await?;
        Ok(self.cache.insert(owner, generation, rules).await)
    }

    async fn classify_batch(
        &self,
        conn: &Connection,
        scope: &OwnerScope,
        selection: Selection,
    ) -> Result<ClassificationSummary, ClassifyError> {
        let batch = messages::list_for_classification(conn, scope, selection).await?;
        let classified_at = Utc::now();
        let mut rule_sets: HashMap<String, Arc<RuleSet>> = HashMap::new();
        let mut summary = ClassificationSummary::new();

        for message in &batch {
            let rules = match rule_sets.get(&message.owner_user_id) {
                Some(rules) => rules.clone(),
                None => {
                    let owner = OwnerId::parse(&message.owner_user_id)?;
                    let rules = self.rules_for(conn, &owner).await?;
                    rule_sets.insert(message.owner_user_id.clone(), rules.clone());
                    rules
                }
            };

            let classification = rules.classify(&message.facts(self.parser.as_ref()));
            messages::record_classification(conn, message, &classification, classified_at)
                .await?;
            summary.record(classification.verdict);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::MatchedRule;
    use crate::domain::LabelCountParser;
    use crate::messages::{MessageRepository, NewMessage};
    use crate::migrations::run_migrations;
    use crate::rules::{ModifyRequest, RuleMutationEngine};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Harness {
        db: Database,
        rules: RuleMutationEngine,
        classifier: ClassificationEngine,
        messages: MessageRepository,
        _dir: TempDir,
    }

    async fn setup() -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");

        let parser: Arc<dyn DomainParser> = Arc::new(LabelCountParser);
        let cache = Arc::new(RuleSetCache::new(Duration::from_secs(300)));
        Harness {
            rules: RuleMutationEngine::new(db.clone(), parser.clone(), cache.clone()),
            classifier: ClassificationEngine::new(db.clone(), parser.clone(), cache),
            messages: MessageRepository::new(db.clone(), parser),
            db,
            _dir: dir,
        }
    }

    impl Harness {
        async fn rule(&self, owner: &str, operation: &str, dimension: &str, key: &str, action: &str) {
            self.rules
                .modify(ModifyRequest {
                    operation: operation.into(),
                    dimension: dimension.into(),
                    owner_user_id: Some(owner.into()),
                    key_value: Some(key.into()),
                    action: Some(action.into()),
                    ..Default::default()
                })
                .await
                .expect("rule mutation");
        }

        async fn message(&self, owner: &str, from: &str, subject: &str) -> String {
            self.messages
                .insert(NewMessage {
                    owner_user_id: OwnerId::parse(owner).unwrap(),
                    from_address: from.into(),
                    to_address: "me@home.com".into(),
                    subject: subject.into(),
                    received_at: Utc::now(),
                })
                .await
                .expect("insert message")
                .id
        }

        async fn verdict(&self, owner: &str, id: &str) -> (Option<Verdict>, Option<MatchedRule>) {
            let message = self
                .messages
                .get_by_id(&OwnerId::parse(owner).unwrap(), id)
                .await
                .expect("message");
            (message.verdict, message.matched_rule)
        }
    }

    #[tokio::test]
    async fn pending_messages_are_classified_and_counted() {
        let h = setup().await;
        h.rule("alice", "add", "domain", "bank.com", "delete").await;
        h.rule("alice", "add", "from_email", "ceo@bank.com", "keep").await;

        let ceo = h.message("alice", "ceo@bank.com", "Board meeting").await;
        let promo = h.message("alice", "promo@bank.com", "Offers").await;
        let stranger = h.message("alice", "hi@nowhere.org", "Hello").await;

        let summary = h
            .classifier
            .evaluate_owner(Some("alice"), Selection::Pending)
            .await
            .expect("evaluate");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(Verdict::Keep), 1);
        assert_eq!(summary.count(Verdict::Delete), 1);
        assert_eq!(summary.count(Verdict::Undecided), 1);

        assert_eq!(
            h.verdict("alice", &ceo).await,
            (Some(Verdict::Keep), Some(MatchedRule::FromKeep))
        );
        assert_eq!(
            h.verdict("alice", &promo).await,
            (Some(Verdict::Delete), Some(MatchedRule::DomainDefault))
        );
        assert_eq!(
            h.verdict("alice", &stranger).await,
            (Some(Verdict::Undecided), Some(MatchedRule::None))
        );

        let again = h
            .classifier
            .evaluate_owner(Some("alice"), Selection::Pending)
            .await
            .expect("second pass");
        assert_eq!(again.total, 0);
    }

    #[tokio::test]
    async fn blank_owner_is_rejected_before_any_write() {
        let h = setup().await;
        h.message("alice", "a@x.com", "hi").await;

        let err = h
            .classifier
            .evaluate_owner(Some("  "), Selection::Pending)
            .await
            .expect_err("blank");
        assert!(matches!(err, ClassifyError::Owner(OwnerError::Blank)));
        let err = h
            .classifier
            .evaluate_owner(None, Selection::Pending)
            .await
            .expect_err("missing");
        assert!(matches!(err, ClassifyError::Owner(OwnerError::Missing)));

        let conn = h.db.connection().await.expect("conn");
        let pending = messages::list_for_classification(
            &conn,
            &OwnerScope::AllUsers,
            Selection::Pending,
        )
        .await
        .expect("pending");
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn global_sweep_uses_each_owners_rules() {
        let h = setup().await;
        h.rule("alice", "add", "domain", "x.com", "keep").await;
        h.rule("bob", "add", "domain", "x.com", "delete").await;
        let a = h.message("alice", "news@x.com", "News").await;
        let b = h.message("bob", "news@x.com", "News").await;

        let summary = h
            .classifier
            .evaluate(&OwnerScope::AllUsers, Selection::Pending)
            .await
            .expect("sweep");
        assert_eq!(summary.total, 2);
        assert_eq!(h.verdict("alice", &a).await.0, Some(Verdict::Keep));
        assert_eq!(h.verdict("bob", &b).await.0, Some(Verdict::Delete));
    }

    #[tokio::test]
    async fn reevaluation_sees_rule_changes_through_the_cache() {
        let h = setup().await;
        h.rule("alice", "add", "domain", "bank.com", "keep").await;
        let id = h.message("alice", "otp@bank.com", "Your OTP 1234").await;

        h.classifier
            .evaluate_owner(Some("alice"), Selection::Pending)
            .await
            .expect("first");
        assert_eq!(h.verdict("alice", &id).await.0, Some(Verdict::Keep));

        h.rules
            .modify(ModifyRequest {
                operation: "add".into(),
                dimension: "subject".into(),
                owner_user_id: Some("alice".into()),
                key_value: Some("otp".into()),
                action: Some("delete_1d".into()),
                parent_domain: Some("bank.com".into()),
                ..Default::default()
            })
            .await
            .expect("add subject");

        h.classifier
            .evaluate_owner(Some("alice"), Selection::All)
            .await
            .expect("reevaluate");
        assert_eq!(
            h.verdict("alice", &id).await,
            (Some(Verdict::Delete1d), Some(MatchedRule::SubjectDelete1d))
        );
    }

    #[test]
    fn summary_lists_every_verdict() {
        let summary = ClassificationSummary::new();
        assert_eq!(summary.per_action.len(), Verdict::ALL.len());
        assert_eq!(summary.count(Verdict::Delete10d), 0);
    }
}
