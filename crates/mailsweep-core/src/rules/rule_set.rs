use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{AddressPattern, Criterion, SubjectPattern};

/// In-memory snapshot of one owner's rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub owner_user_id: String,
    /// Domain criteria keyed by domain.
    pub domains: BTreeMap<String, CriterionRules>,
    /// Sender email criteria keyed by address.
    pub emails: BTreeMap<String, Criterion>,
}

/// A domain or subdomain criterion with the patterns hanging off it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionRules {
    pub criterion: Criterion,
    /// Empty for subdomain criteria.
    pub subdomains: BTreeMap<String, CriterionRules>,
    /// Oldest first.
    pub subject_patterns: Vec<SubjectPattern>,
    pub address_patterns: Vec<AddressPattern>,
}

impl RuleSet {
    pub fn empty(owner_user_id: impl Into<String>) -> Self {
        Self {
            owner_user_id: owner_user_id.into(),
            domains: BTreeMap::new(),
            emails: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.emails.is_empty()
    }

    /// Criterion that governs a sender host: the subdomain when one is stored
    /// under the domain, else the domain itself.
    pub fn effective(&self, domain: &str, subdomain: Option<&str>) -> Option<&CriterionRules> {
        let parent = self.domains.get(domain)?;
        subdomain
            .and_then(|sub| parent.subdomains.get(sub))
            .or(Some(parent))
    }
}

impl CriterionRules {
    pub fn new(criterion: Criterion) -> Self {
        Self {
            criterion,
            subdomains: BTreeMap::new(),
            subject_patterns: Vec::new(),
            address_patterns: Vec::new(),
        }
    }
}
