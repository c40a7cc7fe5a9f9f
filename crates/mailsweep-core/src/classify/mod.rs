pub mod cascade;
pub mod engine;

pub use cascade::{Classification, MatchedRule, MessageFacts, Verdict};
pub use engine::{ClassificationEngine, ClassificationSummary, ClassifyError, Selection};
