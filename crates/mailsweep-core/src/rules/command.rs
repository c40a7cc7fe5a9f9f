//! Caller-facing request shapes and their validation into typed commands.
//!
//! Everything here is pure: a request that fails to convert never reaches
//! the database.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DomainParser, normalize_address};
use crate::owner::{OwnerError, OwnerId};

use super::types::{Action, AddressAction, Direction};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    Owner(#[from] OwnerError),
    #[error("unknown operation {0}")]
    UnknownOperation(String),
    #[error("unknown dimension {0}")]
    UnknownDimension(String),
    #[error("unknown quick-add level {0}")]
    UnknownLevel(String),
    #[error("invalid action {0}")]
    InvalidAction(String),
    #[error("address patterns only accept keep or delete, got {0}")]
    InvalidAddressAction(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid {field}: {value}")]
    InvalidKey { field: &'static str, value: String },
    #[error("{operation} is not supported for {dimension}")]
    Unsupported {
        operation: &'static str,
        dimension: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    Remove,
    Update,
    Clear,
    Get,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Remove => "remove",
            Operation::Update => "update",
            Operation::Clear => "clear",
            Operation::Get => "get",
        }
    }

    /// Case-insensitive; callers send both `ADD` and `add`.
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "update" => Some(Self::Update),
            "clear" => Some(Self::Clear),
            "get" => Some(Self::Get),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Domain,
    Subdomain,
    Email,
    Subject,
    FromEmail,
    ToEmail,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Domain => "domain",
            Dimension::Subdomain => "subdomain",
            Dimension::Email => "email",
            Dimension::Subject => "subject",
            Dimension::FromEmail => "from_email",
            Dimension::ToEmail => "to_email",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "domain" => Some(Self::Domain),
            "subdomain" => Some(Self::Subdomain),
            "email" => Some(Self::Email),
            "subject" => Some(Self::Subject),
            "from_email" => Some(Self::FromEmail),
            "to_email" => Some(Self::ToEmail),
            _ => None,
        }
    }

    fn direction(&self) -> Option<Direction> {
        match self {
            Dimension::FromEmail => Some(Direction::From),
            Dimension::ToEmail => Some(Direction::To),
            _ => None,
        }
    }
}

/// Raw mutation request as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub operation: String,
    pub dimension: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub key_value: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub parent_domain: Option<String>,
    #[serde(default)]
    pub parent_subdomain: Option<String>,
    #[serde(default)]
    pub old_action: Option<String>,
}

/// Criterion a pattern hangs off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    Domain(String),
    Subdomain { domain: String, subdomain: String },
    /// Whichever criterion classification consults for a sender host: the
    /// subdomain when one is stored, else the domain.
    Effective {
        domain: String,
        subdomain: Option<String>,
    },
}

impl ParentRef {
    pub fn domain(&self) -> &str {
        match self {
            ParentRef::Domain(domain) => domain,
            ParentRef::Subdomain { domain, .. } => domain,
            ParentRef::Effective { domain, .. } => domain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Domain {
        domain: String,
        action: Option<Action>,
    },
    Subdomain {
        domain: String,
        subdomain: String,
        action: Option<Action>,
    },
    Email {
        email: String,
        action: Option<Action>,
    },
    Subject {
        parent: ParentRef,
        pattern: String,
        action: Action,
    },
    Address {
        parent: ParentRef,
        direction: Direction,
        address: String,
        action: AddressAction,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSelector {
    Domain {
        domain: String,
    },
    Subdomain {
        domain: String,
        subdomain: String,
    },
    Email {
        email: String,
    },
    /// Without an action every pattern with this text is removed.
    Subject {
        parent: ParentRef,
        pattern: String,
        action: Option<Action>,
    },
    Address {
        parent: ParentRef,
        direction: Direction,
        address: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleUpdate {
    Domain {
        domain: String,
        action: Action,
        expected: Option<Action>,
    },
    Subdomain {
        domain: String,
        subdomain: String,
        action: Action,
        expected: Option<Action>,
    },
    Email {
        email: String,
        action: Action,
        expected: Option<Action>,
    },
    Subject {
        parent: ParentRef,
        pattern: String,
        from: Action,
        to: Action,
    },
    Address {
        parent: ParentRef,
        direction: Direction,
        address: String,
        action: AddressAction,
        expected: Option<AddressAction>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleQuery {
    Domain {
        domain: String,
    },
    /// `None` lists every subdomain under the domain.
    Subdomain {
        domain: String,
        subdomain: Option<String>,
    },
    Email {
        email: String,
    },
    Subject {
        parent: ParentRef,
    },
    Address {
        parent: ParentRef,
        direction: Direction,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCommand {
    Add(RuleTarget),
    Remove(RuleSelector),
    Update(RuleUpdate),
    Clear { domain: String },
    Get(RuleQuery),
}

impl RuleCommand {
    pub fn operation(&self) -> Operation {
        match self {
            RuleCommand::Add(_) => Operation::Add,
            RuleCommand::Remove(_) => Operation::Remove,
            RuleCommand::Update(_) => Operation::Update,
            RuleCommand::Clear { .. } => Operation::Clear,
            RuleCommand::Get(_) => Operation::Get,
        }
    }

    pub fn dimension(&self) -> Dimension {
        match self {
            RuleCommand::Add(target) => match target {
                RuleTarget::Domain { .. } => Dimension::Domain,
                RuleTarget::Subdomain { .. } => Dimension::Subdomain,
                RuleTarget::Email { .. } => Dimension::Email,
                RuleTarget::Subject { .. } => Dimension::Subject,
                RuleTarget::Address { direction, .. } => address_dimension(*direction),
            },
            RuleCommand::Remove(selector) => match selector {
                RuleSelector::Domain { .. } => Dimension::Domain,
                RuleSelector::Subdomain { .. } => Dimension::Subdomain,
                RuleSelector::Email { .. } => Dimension::Email,
                RuleSelector::Subject { .. } => Dimension::Subject,
                RuleSelector::Address { direction, .. } => address_dimension(*direction),
            },
            RuleCommand::Update(update) => match update {
                RuleUpdate::Domain { .. } => Dimension::Domain,
                RuleUpdate::Subdomain { .. } => Dimension::Subdomain,
                RuleUpdate::Email { .. } => Dimension::Email,
                RuleUpdate::Subject { .. } => Dimension::Subject,
                RuleUpdate::Address { direction, .. } => address_dimension(*direction),
            },
            RuleCommand::Clear { .. } => Dimension::Domain,
            RuleCommand::Get(query) => match query {
                RuleQuery::Domain { .. } => Dimension::Domain,
                RuleQuery::Subdomain { .. } => Dimension::Subdomain,
                RuleQuery::Email { .. } => Dimension::Email,
                RuleQuery::Subject { .. } => Dimension::Subject,
                RuleQuery::Address { direction, .. } => address_dimension(*direction),
            },
        }
    }

    /// Table the command writes to, for audit entries.
    pub fn table_name(&self) -> &'static str {
        match self.dimension() {
            Dimension::Domain | Dimension::Subdomain | Dimension::Email => "criteria",
            Dimension::Subject => "subject_patterns",
            Dimension::FromEmail | Dimension::ToEmail => "address_patterns",
        }
    }

    /// Key the command is about, used to label audit entries and logs.
    pub fn key(&self) -> &str {
        match self {
            RuleCommand::Add(target) => match target {
                RuleTarget::Domain { domain, .. } => domain,
                RuleTarget::Subdomain { subdomain, .. } => subdomain,
                RuleTarget::Email { email, .. } => email,
                RuleTarget::Subject { pattern, .. } => pattern,
                RuleTarget::Address { address, .. } => address,
            },
            RuleCommand::Remove(selector) => match selector {
                RuleSelector::Domain { domain } => domain,
                RuleSelector::Subdomain { subdomain, .. } => subdomain,
                RuleSelector::Email { email } => email,
                RuleSelector::Subject { pattern, .. } => pattern,
                RuleSelector::Address { address, .. } => address,
            },
            RuleCommand::Update(update) => match update {
                RuleUpdate::Domain { domain, .. } => domain,
                RuleUpdate::Subdomain { subdomain, .. } => subdomain,
                RuleUpdate::Email { email, .. } => email,
                RuleUpdate::Subject { pattern, .. } => pattern,
                RuleUpdate::Address { address, .. } => address,
            },
            RuleCommand::Clear { domain } => domain,
            RuleCommand::Get(query) => match query {
                RuleQuery::Domain { domain } => domain,
                RuleQuery::Subdomain {
                    domain, subdomain, ..
                } => subdomain.as_deref().unwrap_or(domain),
                RuleQuery::Email { email } => email,
                RuleQuery::Subject { parent } => parent.domain(),
                RuleQuery::Address { parent, .. } => parent.domain(),
            },
        }
    }

    /// Domain the command is filed under in the audit log. Email criteria
    /// are filed under the address's host.
    pub fn domain_context(&self, parser: &dyn DomainParser) -> String {
        let email_context = |email: &str| parser.domain_of(email).unwrap_or_default();
        match self {
            RuleCommand::Add(target) => match target {
                RuleTarget::Domain { domain, .. } | RuleTarget::Subdomain { domain, .. } => {
                    domain.clone()
                }
                RuleTarget::Email { email, .. } => email_context(email),
                RuleTarget::Subject { parent, .. } | RuleTarget::Address { parent, .. } => {
                    parent.domain().to_string()
                }
            },
            RuleCommand::Remove(selector) => match selector {
                RuleSelector::Domain { domain } | RuleSelector::Subdomain { domain, .. } => {
                    domain.clone()
                }
                RuleSelector::Email { email } => email_context(email),
                RuleSelector::Subject { parent, .. } | RuleSelector::Address { parent, .. } => {
                    parent.domain().to_string()
                }
            },
            RuleCommand::Update(update) => match update {
                RuleUpdate::Domain { domain, .. } | RuleUpdate::Subdomain { domain, .. } => {
                    domain.clone()
                }
                RuleUpdate::Email { email, .. } => email_context(email),
                RuleUpdate::Subject { parent, .. } | RuleUpdate::Address { parent, .. } => {
                    parent.domain().to_string()
                }
            },
            RuleCommand::Clear { domain } => domain.clone(),
            RuleCommand::Get(query) => match query {
                RuleQuery::Domain { domain } | RuleQuery::Subdomain { domain, .. } => {
                    domain.clone()
                }
                RuleQuery::Email { email } => email_context(email),
                RuleQuery::Subject { parent } | RuleQuery::Address { parent, .. } => {
                    parent.domain().to_string()
                }
            },
        }
    }
}

fn address_dimension(direction: Direction) -> Dimension {
    match direction {
        Direction::From => Dimension::FromEmail,
        Direction::To => Dimension::ToEmail,
    }
}

impl ModifyRequest {
    /// Validate the request and resolve it into an owner and a typed command.
    pub fn into_command(
        self,
        parser: &dyn DomainParser,
    ) -> Result<(OwnerId, RuleCommand), ValidationError> {
        let owner = OwnerId::require(self.owner_user_id.as_deref())?;
        let operation = Operation::from_str(&self.operation)
            .ok_or_else(|| ValidationError::UnknownOperation(self.operation.clone()))?;
        let dimension = Dimension::from_str(&self.dimension)
            .ok_or_else(|| ValidationError::UnknownDimension(self.dimension.clone()))?;

        let fields = Fields::from_request(&self)?;
        let command = match operation {
            Operation::Add => RuleCommand::Add(fields.target(dimension, parser)?),
            Operation::Remove => RuleCommand::Remove(fields.selector(dimension, parser)?),
            Operation::Update => RuleCommand::Update(fields.update(dimension, parser)?),
            Operation::Clear => match dimension {
                Dimension::Domain => RuleCommand::Clear {
                    domain: fields.domain_key()?,
                },
                other => {
                    return Err(ValidationError::Unsupported {
                        operation: Operation::Clear.as_str(),
                        dimension: other.as_str(),
                    });
                }
            },
            Operation::Get => RuleCommand::Get(fields.query(dimension, parser)?),
        };

        Ok((owner, command))
    }
}

/// Request fields after trimming, lowercasing and action parsing.
struct Fields {
    key: Option<String>,
    action: Option<Action>,
    raw_action: Option<String>,
    old_action: Option<Action>,
    raw_old_action: Option<String>,
    parent_domain: Option<String>,
    parent_subdomain: Option<String>,
}

impl Fields {
    fn from_request(request: &ModifyRequest) -> Result<Self, ValidationError> {
        let raw_action = clean(request.action.as_deref());
        let raw_old_action = clean(request.old_action.as_deref());
        Ok(Self {
            key: clean(request.key_value.as_deref()),
            action: raw_action.as_deref().map(parse_action).transpose()?,
            raw_action,
            old_action: raw_old_action.as_deref().map(parse_action).transpose()?,
            raw_old_action,
            parent_domain: clean(request.parent_domain.as_deref()),
            parent_subdomain: clean(request.parent_subdomain.as_deref()),
        })
    }

    fn key(&self) -> Result<&str, ValidationError> {
        self.key
            .as_deref()
            .ok_or(ValidationError::MissingField("key_value"))
    }

    fn required_action(&self) -> Result<Action, ValidationError> {
        self.action.ok_or(ValidationError::MissingField("action"))
    }

    fn address_action(&self) -> Result<AddressAction, ValidationError> {
        let action = self.required_action()?;
        AddressAction::try_from(action).map_err(|_| {
            ValidationError::InvalidAddressAction(self.raw_action.clone().unwrap_or_default())
        })
    }

    fn expected_address_action(&self) -> Result<Option<AddressAction>, ValidationError> {
        self.old_action
            .map(|action| {
                AddressAction::try_from(action).map_err(|_| {
                    ValidationError::InvalidAddressAction(
                        self.raw_old_action.clone().unwrap_or_default(),
                    )
                })
            })
            .transpose()
    }

    fn domain_key(&self) -> Result<String, ValidationError> {
        host_key("key_value", self.key()?)
    }

    fn email_key(&self) -> Result<String, ValidationError> {
        email_key("key_value", self.key()?)
    }

    fn pattern_key(&self) -> Result<String, ValidationError> {
        Ok(self.key()?.to_string())
    }

    /// Parent domain and full subdomain host for the subdomain dimension.
    fn subdomain_keys(&self, parser: &dyn DomainParser) -> Result<(String, String), ValidationError> {
        let key = self.key()?;
        let domain = match &self.parent_domain {
            Some(domain) => host_key("parent_domain", domain)?,
            None => {
                let host = host_key("key_value", key)?;
                if !parser.has_subdomain(&host) {
                    return Err(ValidationError::MissingField("parent_domain"));
                }
                parser.primary_domain(&host)
            }
        };
        let subdomain = subdomain_key(key, &domain)?;
        Ok((domain, subdomain))
    }

    fn subdomain_domain(&self, parser: &dyn DomainParser) -> Result<String, ValidationError> {
        match (&self.parent_domain, &self.key) {
            (Some(domain), _) => host_key("parent_domain", domain),
            (None, Some(key)) => Ok(parser.primary_domain(&host_key("key_value", key)?)),
            (None, None) => Err(ValidationError::MissingField("parent_domain")),
        }
    }

    /// Explicit parent for subject and to_email patterns.
    fn explicit_parent(&self, parser: &dyn DomainParser) -> Result<ParentRef, ValidationError> {
        match (&self.parent_domain, &self.parent_subdomain) {
            (Some(domain), None) => Ok(ParentRef::Domain(host_key("parent_domain", domain)?)),
            (Some(domain), Some(subdomain)) => {
                let domain = host_key("parent_domain", domain)?;
                let subdomain = subdomain_key(subdomain, &domain)?;
                Ok(ParentRef::Subdomain { domain, subdomain })
            }
            (None, Some(subdomain)) => {
                let host = host_key("parent_subdomain", subdomain)?;
                let domain = parser.primary_domain(&host);
                let subdomain = subdomain_key(&host, &domain)?;
                Ok(ParentRef::Subdomain { domain, subdomain })
            }
            (None, None) => Err(ValidationError::MissingField("parent_domain")),
        }
    }

    /// Parent for address patterns. A sender address can locate its own
    /// criterion; a recipient address cannot.
    fn address_parent(
        &self,
        direction: Direction,
        address: &str,
        parser: &dyn DomainParser,
    ) -> Result<ParentRef, ValidationError> {
        if self.parent_domain.is_some() || self.parent_subdomain.is_some() {
            return self.explicit_parent(parser);
        }
        match direction {
            Direction::From => {
                let domains =
                    parser
                        .sender_domains(address)
                        .ok_or_else(|| ValidationError::InvalidKey {
                            field: "key_value",
                            value: address.to_string(),
                        })?;
                Ok(ParentRef::Effective {
                    domain: domains.domain,
                    subdomain: domains.subdomain,
                })
            }
            Direction::To => Err(ValidationError::MissingField("parent_domain")),
        }
    }

    fn target(
        &self,
        dimension: Dimension,
        parser: &dyn DomainParser,
    ) -> Result<RuleTarget, ValidationError> {
        Ok(match dimension {
            Dimension::Domain => RuleTarget::Domain {
                domain: self.domain_key()?,
                action: self.action,
            },
            Dimension::Subdomain => {
                let (domain, subdomain) = self.subdomain_keys(parser)?;
                RuleTarget::Subdomain {
                    domain,
                    subdomain,
                    action: self.action,
                }
            }
            Dimension::Email => RuleTarget::Email {
                email: self.email_key()?,
                action: self.action,
            },
            Dimension::Subject => RuleTarget::Subject {
                pattern: self.pattern_key()?,
                action: self.required_action()?,
                parent: self.explicit_parent(parser)?,
            },
            Dimension::FromEmail | Dimension::ToEmail => {
                let direction = dimension.direction().unwrap_or(Direction::From);
                let address = self.email_key()?;
                RuleTarget::Address {
                    parent: self.address_parent(direction, &address, parser)?,
                    action: self.address_action()?,
                    direction,
                    address,
                }
            }
        })
    }

    fn selector(
        &self,
        dimension: Dimension,
        parser: &dyn DomainParser,
    ) -> Result<RuleSelector, ValidationError> {
        Ok(match dimension {
            Dimension::Domain => RuleSelector::Domain {
                domain: self.domain_key()?,
            },
            Dimension::Subdomain => {
                let (domain, subdomain) = self.subdomain_keys(parser)?;
                RuleSelector::Subdomain { domain, subdomain }
            }
            Dimension::Email => RuleSelector::Email {
                email: self.email_key()?,
            },
            Dimension::Subject => RuleSelector::Subject {
                pattern: self.pattern_key()?,
                action: self.action,
                parent: self.explicit_parent(parser)?,
            },
            Dimension::FromEmail | Dimension::ToEmail => {
                let direction = dimension.direction().unwrap_or(Direction::From);
                let address = self.email_key()?;
                RuleSelector::Address {
                    parent: self.address_parent(direction, &address, parser)?,
                    direction,
                    address,
                }
            }
        })
    }

    fn update(
        &self,
        dimension: Dimension,
        parser: &dyn DomainParser,
    ) -> Result<RuleUpdate, ValidationError> {
        Ok(match dimension {
            Dimension::Domain => RuleUpdate::Domain {
                domain: self.domain_key()?,
                action: self.required_action()?,
                expected: self.old_action,
            },
            Dimension::Subdomain => {
                let (domain, subdomain) = self.subdomain_keys(parser)?;
                RuleUpdate::Subdomain {
                    domain,
                    subdomain,
                    action: self.required_action()?,
                    expected: self.old_action,
                }
            }
            Dimension::Email => RuleUpdate::Email {
                email: self.email_key()?,
                action: self.required_action()?,
                expected: self.old_action,
            },
            Dimension::Subject => RuleUpdate::Subject {
                pattern: self.pattern_key()?,
                to: self.required_action()?,
                from: self
                    .old_action
                    .ok_or(ValidationError::MissingField("old_action"))?,
                parent: self.explicit_parent(parser)?,
            },
            Dimension::FromEmail | Dimension::ToEmail => {
                let direction = dimension.direction().unwrap_or(Direction::From);
                let address = self.email_key()?;
                RuleUpdate::Address {
                    parent: self.address_parent(direction, &address, parser)?,
                    action: self.address_action()?,
                    expected: self.expected_address_action()?,
                    direction,
                    address,
                }
            }
        })
    }

    fn query(
        &self,
        dimension: Dimension,
        parser: &dyn DomainParser,
    ) -> Result<RuleQuery, ValidationError> {
        Ok(match dimension {
            Dimension::Domain => RuleQuery::Domain {
                domain: self.domain_key()?,
            },
            Dimension::Subdomain => {
                let domain = self.subdomain_domain(parser)?;
                let subdomain = self
                    .key
                    .as_deref()
                    .map(|key| subdomain_key(key, &domain))
                    .transpose()?;
                RuleQuery::Subdomain { domain, subdomain }
            }
            Dimension::Email => RuleQuery::Email {
                email: self.email_key()?,
            },
            Dimension::Subject => RuleQuery::Subject {
                parent: self.explicit_parent(parser)?,
            },
            Dimension::FromEmail | Dimension::ToEmail => {
                let direction = dimension.direction().unwrap_or(Direction::From);
                RuleQuery::Address {
                    parent: self.explicit_parent(parser)?,
                    direction,
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickAddLevel {
    Domain,
    Subdomain,
    FromEmail,
    ToEmail,
}

impl QuickAddLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuickAddLevel::Domain => "domain",
            QuickAddLevel::Subdomain => "subdomain",
            QuickAddLevel::FromEmail => "from_email",
            QuickAddLevel::ToEmail => "to_email",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "domain" => Some(Self::Domain),
            "subdomain" => Some(Self::Subdomain),
            "from_email" => Some(Self::FromEmail),
            "to_email" => Some(Self::ToEmail),
            _ => None,
        }
    }
}

/// One-step rule creation from a message the user is looking at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuickAddRequest {
    #[serde(default)]
    pub owner_user_id: Option<String>,
    pub from_address: String,
    #[serde(default)]
    pub to_address: Option<String>,
    /// Subject of the message the rule was created from; kept for the log.
    #[serde(default)]
    pub subject: Option<String>,
    pub action: String,
    pub level: String,
    #[serde(default)]
    pub subject_pattern: Option<String>,
}

/// A validated quick-add, expressed as an ordinary ADD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickAddPlan {
    pub owner: OwnerId,
    pub command: RuleCommand,
    /// Subdomain level was requested for a sender without one.
    pub fell_back_to_domain: bool,
}

impl QuickAddRequest {
    pub fn into_plan(self, parser: &dyn DomainParser) -> Result<QuickAddPlan, ValidationError> {
        let owner = OwnerId::require(self.owner_user_id.as_deref())?;
        let raw_action = clean(Some(self.action.as_str())).ok_or(ValidationError::MissingField("action"))?;
        let action = parse_action(&raw_action)?;
        let level = QuickAddLevel::from_str(&self.level)
            .ok_or_else(|| ValidationError::UnknownLevel(self.level.clone()))?;
        let from = email_key("from_address", &self.from_address)?;
        let domains = parser
            .sender_domains(&from)
            .ok_or_else(|| ValidationError::InvalidKey {
                field: "from_address",
                value: self.from_address.clone(),
            })?;

        let (level, fell_back_to_domain) = match (level, &domains.subdomain) {
            (QuickAddLevel::Subdomain, None) => (QuickAddLevel::Domain, true),
            (level, _) => (level, false),
        };
        let domain = domains.domain;
        let effective = ParentRef::Effective {
            domain: domain.clone(),
            subdomain: domains.subdomain.clone(),
        };
        let level_parent = match (level, domains.subdomain) {
            (QuickAddLevel::Subdomain, Some(subdomain)) => ParentRef::Subdomain {
                domain: domain.clone(),
                subdomain,
            },
            (QuickAddLevel::Domain, _) => ParentRef::Domain(domain.clone()),
            _ => effective.clone(),
        };
        let address_action = || {
            AddressAction::try_from(action)
                .map_err(|_| ValidationError::InvalidAddressAction(raw_action.clone()))
        };

        let target = match (clean(self.subject_pattern.as_deref()), level_parent) {
            (Some(pattern), parent) => RuleTarget::Subject {
                parent,
                pattern,
                action,
            },
            (None, ParentRef::Domain(domain)) => RuleTarget::Domain {
                domain,
                action: Some(action),
            },
            (None, ParentRef::Subdomain { domain, subdomain }) => RuleTarget::Subdomain {
                domain,
                subdomain,
                action: Some(action),
            },
            (None, parent @ ParentRef::Effective { .. }) => match level {
                QuickAddLevel::ToEmail => {
                    let to = self
                        .to_address
                        .as_deref()
                        .ok_or(ValidationError::MissingField("to_address"))?;
                    RuleTarget::Address {
                        parent,
                        direction: Direction::To,
                        address: email_key("to_address", to)?,
                        action: address_action()?,
                    }
                }
                _ => RuleTarget::Address {
                    parent,
                    direction: Direction::From,
                    address: from,
                    action: address_action()?,
                },
            },
        };

        if let Some(subject) = self.subject.as_deref() {
            tracing::debug!(
                owner_user_id = %owner,
                level = level.as_str(),
                subject,
                "quick add from message"
            );
        }

        Ok(QuickAddPlan {
            owner,
            command: RuleCommand::Add(target),
            fell_back_to_domain,
        })
    }
}

/// Trimmed, lowercased value, or `None` when blank.
fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

pub(crate) fn parse_action(value: &str) -> Result<Action, ValidationError> {
    Action::from_str(&value.trim().to_lowercase())
        .ok_or_else(|| ValidationError::InvalidAction(value.to_string()))
}

fn host_key(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let host = value.trim().trim_end_matches('.').to_lowercase();
    let valid = !host.is_empty()
        && !host.contains('@')
        && !host.contains(char::is_whitespace)
        && !host.starts_with('.')
        && !host.contains("..");
    if valid {
        Ok(host)
    } else {
        Err(ValidationError::InvalidKey {
            field,
            value: value.to_string(),
        })
    }
}

pub(crate) fn email_key(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let address = normalize_address(value);
    match address.split_once('@') {
        Some((local, host)) if !local.is_empty() && !host.is_empty() => Ok(address),
        _ => Err(ValidationError::InvalidKey {
            field,
            value: value.to_string(),
        }),
    }
}

/// Full hostname of a subdomain under `domain`. A bare label such as
/// `custcomm` is expanded to `custcomm.<domain>`.
pub(crate) fn subdomain_key(value: &str, domain: &str) -> Result<String, ValidationError> {
    let host = host_key("subdomain", value)?;
    let subdomain = if host.contains('.') {
        host
    } else {
        format!("{host}.{domain}")
    };
    if subdomain != domain && subdomain.ends_with(&format!(".{domain}")) {
        Ok(subdomain)
    } else {
        Err(ValidationError::InvalidKey {
            field: "subdomain",
            value: value.to_string(),
        })
    }
}
