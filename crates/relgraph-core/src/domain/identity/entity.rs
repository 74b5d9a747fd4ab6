//! Canonical entities, their aliases and the hints that resolve to them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of canonical entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Repo,
    Ticket,
    File,
    Service,
    Label,
    Team,
    Other,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Repo => "repo",
            Self::Ticket => "ticket",
            Self::File => "file",
            Self::Service => "service",
            Self::Label => "label",
            Self::Team => "team",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "person" | "user" => Some(Self::Person),
            "repo" | "repository" => Some(Self::Repo),
            "ticket" => Some(Self::Ticket),
            "file" => Some(Self::File),
            "service" => Some(Self::Service),
            "label" => Some(Self::Label),
            "team" => Some(Self::Team),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A canonical entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub workspace_id: String,
    pub kind: EntityKind,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(
        workspace_id: impl Into<String>,
        kind: EntityKind,
        display_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            kind,
            display_name: display_name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasType {
    /// `<provider>:<id>` as issued by a source system
    ProviderId,
    /// Lower-cased email address
    Email,
    /// `<provider>:<handle>`
    Handle,
}

impl AliasType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderId => "provider_id",
            Self::Email => "email",
            Self::Handle => "handle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provider_id" => Some(Self::ProviderId),
            "email" => Some(Self::Email),
            "handle" => Some(Self::Handle),
            _ => None,
        }
    }
}

/// One name under which an entity is known
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAlias {
    pub id: String,
    pub entity_id: String,
    pub workspace_id: String,
    pub alias_type: AliasType,
    pub value: String,
    /// Source system the alias was observed in
    pub provider: Option<String>,
    /// Only true when the source field itself was verified
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl EntityAlias {
    pub fn new(
        entity_id: impl Into<String>,
        workspace_id: impl Into<String>,
        alias_type: AliasType,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            workspace_id: workspace_id.into(),
            alias_type,
            value: value.into(),
            provider: None,
            verified: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    pub fn verified(mut self, verified: bool) -> Self {
        self.verified = verified;
        self
    }

    /// Handle part of a `provider:handle` alias
    pub fn handle(&self) -> Option<&str> {
        if self.alias_type != AliasType::Handle {
            return None;
        }
        Some(
            self.value
                .split_once(':')
                .map(|(_, h)| h)
                .unwrap_or(&self.value),
        )
    }

    /// Domain part of an email alias
    pub fn email_domain(&self) -> Option<&str> {
        if self.alias_type != AliasType::Email {
            return None;
        }
        email_domain(&self.value)
    }
}

/// Raw identity signals observed in a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityHint {
    pub kind: Option<EntityKind>,
    /// Source system that issued `source_id` and `handle`
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    pub handle: Option<String>,
    pub display_name: Option<String>,
}

impl IdentityHint {
    /// A person seen in a source system
    pub fn person(source_type: impl Into<String>) -> Self {
        Self {
            kind: Some(EntityKind::Person),
            source_type: Some(source_type.into().to_lowercase()),
            ..Default::default()
        }
    }

    /// A non-person entity identified by a name inside a kind namespace
    /// (e.g. label `bug`, file `acme/api:src/main.rs`)
    pub fn named(kind: EntityKind, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: Some(kind),
            source_type: Some(kind.as_str().to_string()),
            source_id: Some(name.clone()),
            display_name: Some(name),
            ..Default::default()
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.email = Some(email.into());
        self.email_verified = verified;
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.kind.unwrap_or(EntityKind::Person)
    }

    pub fn is_empty(&self) -> bool {
        self.provider_id().is_none()
            && self.normalized_email().is_none()
            && self.handle_alias().is_none()
            && self.display_name.as_deref().is_none_or(|n| n.trim().is_empty())
    }

    /// `provider:id` alias value
    pub fn provider_id(&self) -> Option<String> {
        let provider = self.source_type.as_deref()?.trim();
        let id = self.source_id.as_deref()?.trim();
        if provider.is_empty() || id.is_empty() {
            return None;
        }
        Some(format!("{}:{}", provider.to_lowercase(), id))
    }

    pub fn normalized_email(&self) -> Option<String> {
        let email = self.email.as_deref()?.trim().to_lowercase();
        if email.contains('@') && !email.starts_with('@') && !email.ends_with('@') {
            Some(email)
        } else {
            None
        }
    }

    pub fn normalized_handle(&self) -> Option<String> {
        let handle = self.handle.as_deref()?.trim().trim_start_matches('@');
        (!handle.is_empty()).then(|| handle.to_lowercase())
    }

    /// `provider:handle` alias value
    pub fn handle_alias(&self) -> Option<String> {
        let handle = self.normalized_handle()?;
        let provider = self.source_type.as_deref().unwrap_or("unknown").to_lowercase();
        Some(format!("{}:{}", provider, handle))
    }

    /// Best available display name
    pub fn best_name(&self) -> String {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .map(|n| n.trim().to_string())
            .or_else(|| self.normalized_handle())
            .or_else(|| self.normalized_email())
            .or_else(|| self.source_id.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Aliases this hint would register on an entity
    pub fn aliases(&self, entity_id: &str, workspace_id: &str) -> Vec<EntityAlias> {
        let provider = self.source_type.as_ref().map(|s| s.to_lowercase());
        let mut aliases = Vec::new();
        if let Some(value) = self.provider_id() {
            aliases.push(
                EntityAlias::new(entity_id, workspace_id, AliasType::ProviderId, value)
                    .with_provider(provider.clone())
                    .verified(true),
            );
        }
        if let Some(value) = self.normalized_email() {
            aliases.push(
                EntityAlias::new(entity_id, workspace_id, AliasType::Email, value)
                    .with_provider(provider.clone())
                    .verified(self.email_verified),
            );
        }
        if let Some(value) = self.handle_alias() {
            aliases.push(
                EntityAlias::new(entity_id, workspace_id, AliasType::Handle, value)
                    .with_provider(provider),
            );
        }
        aliases
    }
}

/// Domain of an email address
pub fn email_domain(email: &str) -> Option<&str> {
    email
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
}

/// Case and whitespace insensitive form of a display name
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
