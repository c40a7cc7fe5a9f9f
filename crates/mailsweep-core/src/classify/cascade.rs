//! The priority cascade that turns a rule set and one message into a verdict.
//!
//! Evaluation order, first match wins:
//!
//! 1. sender address is an email criterion with a default action
//! 2. from-address keep, then 3. from-address delete
//! 4. to-address keep, then 5. to-address delete
//! 6. subject keep, 7. delete, 8. delete_1d, 9. delete_10d
//! 10. default action of the effective criterion
//! 11. undecided
//!
//! Steps 2 through 10 only consult the effective criterion: the subdomain
//! criterion when the sender's host has one stored, otherwise its domain.

use serde::{Deserialize, Serialize};

use crate::domain::{DomainParser, normalize_address};
use crate::rules::{Action, AddressAction, Direction, KeyKind, RuleSet};

/// Resolved action for a message. `Undecided` when no rule applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Keep,
    Delete,
    #[serde(rename = "delete_1d")]
    Delete1d,
    #[serde(rename = "delete_10d")]
    Delete10d,
    Undecided,
}

impl Verdict {
    pub const ALL: [Verdict; 5] = [
        Verdict::Keep,
        Verdict::Delete,
        Verdict::Delete1d,
        Verdict::Delete10d,
        Verdict::Undecided,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Keep => "keep",
            Verdict::Delete => "delete",
            Verdict::Delete1d => "delete_1d",
            Verdict::Delete10d => "delete_10d",
            Verdict::Undecided => "undecided",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "undecided" => Some(Self::Undecided),
            other => Action::from_str(other).map(Self::from),
        }
    }

    pub fn action(&self) -> Option<Action> {
        match self {
            Verdict::Keep => Some(Action::Keep),
            Verdict::Delete => Some(Action::Delete),
            Verdict::Delete1d => Some(Action::Delete1d),
            Verdict::Delete10d => Some(Action::Delete10d),
            Verdict::Undecided => None,
        }
    }
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Keep => Verdict::Keep,
            Action::Delete => Verdict::Delete,
            Action::Delete1d => Verdict::Delete1d,
            Action::Delete10d => Verdict::Delete10d,
        }
    }
}

/// Which cascade level produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedRule {
    SenderEmail,
    FromKeep,
    FromDelete,
    ToKeep,
    ToDelete,
    SubjectKeep,
    SubjectDelete,
    #[serde(rename = "subject_delete_1d")]
    SubjectDelete1d,
    #[serde(rename = "subject_delete_10d")]
    SubjectDelete10d,
    DomainDefault,
    SubdomainDefault,
    None,
}

impl MatchedRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedRule::SenderEmail => "sender_email",
            MatchedRule::FromKeep => "from_keep",
            MatchedRule::FromDelete => "from_delete",
            MatchedRule::ToKeep => "to_keep",
            MatchedRule::ToDelete => "to_delete",
            MatchedRule::SubjectKeep => "subject_keep",
            MatchedRule::SubjectDelete => "subject_delete",
            MatchedRule::SubjectDelete1d => "subject_delete_1d",
            MatchedRule::SubjectDelete10d => "subject_delete_10d",
            MatchedRule::DomainDefault => "domain_default",
            MatchedRule::SubdomainDefault => "subdomain_default",
            MatchedRule::None => "none",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sender_email" => Some(Self::SenderEmail),
            "from_keep" => Some(Self::FromKeep),
            "from_delete" => Some(Self::FromDelete),
            "to_keep" => Some(Self::ToKeep),
            "to_delete" => Some(Self::ToDelete),
            "subject_keep" => Some(Self::SubjectKeep),
            "subject_delete" => Some(Self::SubjectDelete),
            "subject_delete_1d" => Some(Self::SubjectDelete1d),
            "subject_delete_10d" => Some(Self::SubjectDelete10d),
            "domain_default" => Some(Self::DomainDefault),
            "subdomain_default" => Some(Self::SubdomainDefault),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

const ADDRESS_LEVELS: [(Direction, AddressAction, MatchedRule); 4] = [
    (Direction::From, AddressAction::Keep, MatchedRule::FromKeep),
    (Direction::From, AddressAction::Delete, MatchedRule::FromDelete),
    (Direction::To, AddressAction::Keep, MatchedRule::ToKeep),
    (Direction::To, AddressAction::Delete, MatchedRule::ToDelete),
];

const SUBJECT_LEVELS: [(Action, MatchedRule); 4] = [
    (Action::Keep, MatchedRule::SubjectKeep),
    (Action::Delete, MatchedRule::SubjectDelete),
    (Action::Delete1d, MatchedRule::SubjectDelete1d),
    (Action::Delete10d, MatchedRule::SubjectDelete10d),
];

/// The parts of a message the cascade looks at, already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFacts {
    pub from: String,
    pub to: Vec<String>,
    /// Lowercased.
    pub subject: String,
    pub domain: Option<String>,
    pub subdomain: Option<String>,
}

impl MessageFacts {
    /// `to` may hold several comma-separated recipients.
    pub fn new(from: &str, to: &str, subject: &str, parser: &dyn DomainParser) -> Self {
        let from = normalize_address(from);
        let (domain, subdomain) = match parser.sender_domains(&from) {
            Some(domains) => (Some(domains.domain), domains.subdomain),
            None => (None, None),
        };
        Self {
            to: to
                .split(',')
                .map(normalize_address)
                .filter(|address| !address.is_empty())
                .collect(),
            subject: subject.to_lowercase(),
            from,
            domain,
            subdomain,
        }
    }

    /// Prefer keys stored on the message over ones derived from the sender.
    pub fn with_stored_domains(mut self, domain: &str, subdomain: Option<&str>) -> Self {
        let domain = domain.trim().to_lowercase();
        if !domain.is_empty() {
            self.domain = Some(domain);
            self.subdomain = subdomain
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub verdict: Verdict,
    pub matched_rule: MatchedRule,
    /// Address or subject substring that matched, for pattern levels.
    pub matched_pattern: Option<String>,
}

impl Classification {
    fn matched(action: Action, rule: MatchedRule, pattern: Option<String>) -> Self {
        Self {
            verdict: action.into(),
            matched_rule: rule,
            matched_pattern: pattern,
        }
    }

    pub fn undecided() -> Self {
        Self {
            verdict: Verdict::Undecided,
            matched_rule: MatchedRule::None,
            matched_pattern: None,
        }
    }
}

impl RuleSet {
    pub fn classify(&self, facts: &MessageFacts) -> Classification {
        if let Some(action) = self
            .emails
            .get(&facts.from)
            .and_then(|criterion| criterion.default_action)
        {
            return Classification::matched(action, MatchedRule::SenderEmail, None);
        }

        let Some(domain) = facts.domain.as_deref() else {
            return Classification::undecided();
        };
        let Some(rules) = self.effective(domain, facts.subdomain.as_deref()) else {
            return Classification::undecided();
        };

        for (direction, action, rule) in ADDRESS_LEVELS {
            let hit = rules.address_patterns.iter().find(|pattern| {
                pattern.direction == direction
                    && pattern.action == action
                    && match direction {
                        Direction::From => pattern.address == facts.from,
                        Direction::To => facts.to.iter().any(|to| *to == pattern.address),
                    }
            });
            if let Some(pattern) = hit {
                return Classification::matched(action.into(), rule, Some(pattern.address.clone()));
            }
        }

        for (action, rule) in SUBJECT_LEVELS {
            let hit = rules
                .subject_patterns
                .iter()
                .find(|pattern| pattern.action == action && facts.subject.contains(&pattern.pattern));
            if let Some(pattern) = hit {
                return Classification::matched(action, rule, Some(pattern.pattern.clone()));
            }
        }

        match rules.criterion.default_action {
            Some(action) => {
                let rule = if rules.criterion.key_kind == KeyKind::Subdomain {
                    MatchedRule::SubdomainDefault
                } else {
                    MatchedRule::DomainDefault
                };
                Classification::matched(action, rule, None)
            }
            None => Classification::undecided(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LabelCountParser;
    use crate::rules::{AddressPattern, Criterion, CriterionRules, SubjectPattern};
    use chrono::{TimeZone, Utc};

    fn criterion(id: &str, key: &str, kind: KeyKind, action: Option<Action>) -> Criterion {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Criterion {
            id: id.into(),
            owner_user_id: "alice".into(),
            key_value: key.into(),
            key_kind: kind,
            default_action: action,
            parent_id: (kind == KeyKind::Subdomain).then(|| "bank".to_string()),
            created_at: at,
            updated_at: at,
        }
    }

    fn subject(criterion_id: &str, action: Action, pattern: &str) -> SubjectPattern {
        SubjectPattern {
            id: format!("{criterion_id}-{pattern}-{}", action.as_str()),
            criterion_id: criterion_id.into(),
            action,
            pattern: pattern.into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn address(
        criterion_id: &str,
        direction: Direction,
        action: AddressAction,
        address: &str,
    ) -> AddressPattern {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        AddressPattern {
            id: format!("{criterion_id}-{address}"),
            criterion_id: criterion_id.into(),
            direction,
            action,
            address: address.into(),
            created_at: at,
            updated_at: at,
        }
    }

    fn bank_rules() -> RuleSet {
        let mut bank = CriterionRules::new(criterion(
            "bank",
            "bank.com",
            KeyKind::Domain,
            Some(Action::Delete),
        ));
        bank.address_patterns.push(address(
            "bank",
            Direction::From,
            AddressAction::Keep,
            "ceo@bank.com",
        ));
        bank.address_patterns.push(address(
            "bank",
            Direction::To,
            AddressAction::Keep,
            "me@home.com",
        ));
        bank.subject_patterns
            .push(subject("bank", Action::Delete1d, "otp"));
        bank.subject_patterns
            .push(subject("bank", Action::Keep, "statement"));

        let mut alerts = CriterionRules::new(criterion(
            "alerts",
            "alerts.bank.com",
            KeyKind::Subdomain,
            Some(Action::Delete10d),
        ));
        alerts
            .subject_patterns
            .push(subject("alerts", Action::Keep, "fraud"));
        bank.subdomains.insert("alerts.bank.com".into(), alerts);

        let quiet = CriterionRules::new(criterion(
            "quiet",
            "quiet.bank.com",
            KeyKind::Subdomain,
            None,
        ));
        bank.subdomains.insert("quiet.bank.com".into(), quiet);

        let mut rules = RuleSet::empty("alice");
        rules.domains.insert("bank.com".into(), bank);
        rules.emails.insert(
            "boss@work.com".into(),
            criterion("boss", "boss@work.com", KeyKind::Email, Some(Action::Keep)),
        );
        rules
    }

    fn facts(from: &str, to: &str, subject: &str) -> MessageFacts {
        MessageFacts::new(from, to, subject, &LabelCountParser)
    }

    #[test]
    fn sender_email_beats_everything() {
        let result = bank_rules().classify(&facts("Boss@Work.com", "", "whatever"));
        assert_eq!(result.verdict, Verdict::Keep);
        assert_eq!(result.matched_rule, MatchedRule::SenderEmail);
    }

    #[test]
    fn from_keep_beats_domain_default() {
        let result = bank_rules().classify(&facts("ceo@bank.com", "", "quarterly results"));
        assert_eq!(result.verdict, Verdict::Keep);
        assert_eq!(result.matched_rule, MatchedRule::FromKeep);
        assert_eq!(result.matched_pattern.as_deref(), Some("ceo@bank.com"));

        let other = bank_rules().classify(&facts("intern@bank.com", "", "quarterly results"));
        assert_eq!(other.verdict, Verdict::Delete);
        assert_eq!(other.matched_rule, MatchedRule::DomainDefault);
    }

    #[test]
    fn to_keep_matches_any_recipient() {
        let result = bank_rules().classify(&facts(
            "promo@bank.com",
            "someone@else.com, Me <ME@home.com>",
            "sale",
        ));
        assert_eq!(result.matched_rule, MatchedRule::ToKeep);
    }

    #[test]
    fn subject_substring_is_case_insensitive() {
        let result = bank_rules().classify(&facts("noreply@bank.com", "", "Your OTP is 1234"));
        assert_eq!(result.verdict, Verdict::Delete1d);
        assert_eq!(result.matched_rule, MatchedRule::SubjectDelete1d);
        assert_eq!(result.matched_pattern.as_deref(), Some("otp"));
    }

    #[test]
    fn subject_keep_outranks_subject_delete() {
        let result = bank_rules().classify(&facts(
            "noreply@bank.com",
            "",
            "OTP for your statement",
        ));
        assert_eq!(result.verdict, Verdict::Keep);
        assert_eq!(result.matched_rule, MatchedRule::SubjectKeep);
    }

    #[test]
    fn subdomain_criterion_replaces_domain_rules() {
        let result = bank_rules().classify(&facts("x@alerts.bank.com", "", "Your OTP"));
        assert_eq!(result.verdict, Verdict::Delete10d);
        assert_eq!(result.matched_rule, MatchedRule::SubdomainDefault);

        let fraud = bank_rules().classify(&facts("x@alerts.bank.com", "", "Fraud alert"));
        assert_eq!(fraud.matched_rule, MatchedRule::SubjectKeep);
    }

    #[test]
    fn subdomain_without_default_is_undecided() {
        let result = bank_rules().classify(&facts("x@quiet.bank.com", "", "hello"));
        assert_eq!(result, Classification::undecided());
    }

    #[test]
    fn unknown_subdomain_falls_back_to_domain() {
        let result = bank_rules().classify(&facts("x@other.bank.com", "", "hello"));
        assert_eq!(result.matched_rule, MatchedRule::DomainDefault);
    }

    #[test]
    fn unknown_sender_is_undecided() {
        let result = bank_rules().classify(&facts("a@nowhere.org", "", "hello"));
        assert_eq!(result.verdict, Verdict::Undecided);
        assert_eq!(result.matched_rule, MatchedRule::None);
        assert_eq!(bank_rules().classify(&facts("", "", "")).verdict, Verdict::Undecided);
    }

    #[test]
    fn stored_domains_override_derived_ones() {
        let facts = facts("x@mail.elsewhere.com", "", "hi").with_stored_domains("Bank.com", None);
        let result = bank_rules().classify(&facts);
        assert_eq!(result.matched_rule, MatchedRule::DomainDefault);
    }

    #[test]
    fn verdict_strings_round_trip() {
        for verdict in Verdict::ALL {
            assert_eq!(Verdict::from_str(verdict.as_str()), Some(verdict));
        }
        assert_eq!(Verdict::Undecided.action(), None);
        assert_eq!(
            MatchedRule::from_str("subject_delete_10d"),
            Some(MatchedRule::SubjectDelete10d)
        );
    }
}
