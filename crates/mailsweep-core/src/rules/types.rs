use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Retention decision attached to a criterion or subject pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Keep,
    Delete,
    #[serde(rename = "delete_1d")]
    Delete1d,
    #[serde(rename = "delete_10d")]
    Delete10d,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Keep => "keep",
            Action::Delete => "delete",
            Action::Delete1d => "delete_1d",
            Action::Delete10d => "delete_10d",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "keep" => Some(Self::Keep),
            "delete" => Some(Self::Delete),
            "delete_1d" => Some(Self::Delete1d),
            "delete_10d" => Some(Self::Delete10d),
            _ => None,
        }
    }

    /// Minimum message age before a delete outcome may be executed.
    pub fn retention(&self) -> Option<Duration> {
        match self {
            Action::Keep => None,
            Action::Delete => Some(Duration::zero()),
            Action::Delete1d => Some(Duration::days(1)),
            Action::Delete10d => Some(Duration::days(10)),
        }
    }
}

/// Address patterns only ever keep or delete outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressAction {
    Keep,
    Delete,
}

impl AddressAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressAction::Keep => "keep",
            AddressAction::Delete => "delete",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "keep" => Some(Self::Keep),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl From<AddressAction> for Action {
    fn from(value: AddressAction) -> Self {
        match value {
            AddressAction::Keep => Action::Keep,
            AddressAction::Delete => Action::Delete,
        }
    }
}

impl TryFrom<Action> for AddressAction {
    type Error = Action;

    fn try_from(value: Action) -> Result<Self, Self::Error> {
        match value {
            Action::Keep => Ok(AddressAction::Keep),
            Action::Delete => Ok(AddressAction::Delete),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Domain,
    Subdomain,
    Email,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Domain => "domain",
            KeyKind::Subdomain => "subdomain",
            KeyKind::Email => "email",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "domain" => Some(Self::Domain),
            "subdomain" => Some(Self::Subdomain),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    From,
    To,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::From => "from",
            Direction::To => "to",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "from" => Some(Self::From),
            "to" => Some(Self::To),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub owner_user_id: String,
    pub key_value: String,
    pub key_kind: KeyKind,
    pub default_action: Option<Action>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectPattern {
    pub id: String,
    pub criterion_id: String,
    pub action: Action,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressPattern {
    pub id: String,
    pub criterion_id: String,
    pub direction: Direction,
    pub action: AddressAction,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate child counts returned alongside a criterion by GET.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionCounts {
    pub subdomains: i64,
    pub subject_patterns: i64,
    pub address_patterns: i64,
}

/// Rows removed by a cascading delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalCounts {
    pub criteria: i64,
    pub subject_patterns: i64,
    pub address_patterns: i64,
}

impl RemovalCounts {
    pub fn is_empty(&self) -> bool {
        self.criteria == 0 && self.subject_patterns == 0 && self.address_patterns == 0
    }
}

impl std::ops::AddAssign for RemovalCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.criteria += rhs.criteria;
        self.subject_patterns += rhs.subject_patterns;
        self.address_patterns += rhs.address_patterns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_str_and_serde() {
        for action in [
            Action::Keep,
            Action::Delete,
            Action::Delete1d,
            Action::Delete10d,
        ] {
            assert_eq!(Action::from_str(action.as_str()), Some(action));
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
        assert_eq!(Action::from_str("archive"), None);
    }

    #[test]
    fn retention_thresholds() {
        assert_eq!(Action::Keep.retention(), None);
        assert_eq!(Action::Delete.retention(), Some(Duration::zero()));
        assert_eq!(Action::Delete1d.retention(), Some(Duration::days(1)));
        assert_eq!(Action::Delete10d.retention(), Some(Duration::days(10)));
    }

    #[test]
    fn address_action_rejects_delayed_deletes() {
        assert_eq!(AddressAction::try_from(Action::Keep), Ok(AddressAction::Keep));
        assert_eq!(
            AddressAction::try_from(Action::Delete1d),
            Err(Action::Delete1d)
        );
    }
}
