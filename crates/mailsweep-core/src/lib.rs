pub mod audit;
pub mod classify;
pub mod config;
pub mod db;
pub mod domain;
pub mod messages;
pub mod migrations;
pub mod owner;
pub mod ownership;
pub mod rules;
pub mod telemetry;

pub use audit::{AuditActionType, AuditError, AuditLogEntry, AuditRepository};
pub use classify::{
    Classification, ClassificationEngine, ClassificationSummary, ClassifyError, MatchedRule,
    MessageFacts, Selection, Verdict,
};
pub use config::{AccessConfig, Config};
pub use db::{Database, DbError};
pub use domain::{DomainParser, LabelCountParser, SenderDomains};
pub use messages::{Message, MessageError, MessageRepository, NewMessage};
pub use migrations::run_migrations;
pub use owner::{OwnerError, OwnerId, OwnerScope};
pub use ownership::{ClaimSummary, OwnershipError, OwnershipMigrator};
pub use rules::{
    Action, ModifyOutcome, ModifyRequest, ModifyResponse, MutationError, QuickAddOutcome,
    QuickAddRequest, RuleMutationEngine, RuleSet, RuleSetCache, RuleStore,
};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
