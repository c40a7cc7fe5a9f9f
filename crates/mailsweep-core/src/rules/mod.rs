pub mod cache;
pub mod command;
pub mod engine;
pub mod rule_set;
pub mod store;
pub mod types;

pub use cache::RuleSetCache;
pub use command::{
    Dimension, ModifyRequest, Operation, ParentRef, QuickAddLevel, QuickAddPlan, QuickAddRequest,
    RuleCommand, RuleQuery, RuleSelector, RuleTarget, RuleUpdate, ValidationError,
};
pub use engine::{
    ModifyOutcome, ModifyResponse, MutationError, QuickAddOutcome, RuleDetails,
    RuleMutationEngine,
};
pub use rule_set::{CriterionRules, RuleSet};
pub use store::{RuleStore, StoreError};
pub use types::{
    Action, AddressAction, AddressPattern, Criterion, CriterionCounts, Direction, KeyKind,
    RemovalCounts, SubjectPattern,
};
