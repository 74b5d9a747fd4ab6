//! Structured-field rules
//!
//! Every structural field maps to exactly one relationship type and always yields
//! confidence 1.0.

use serde_json::Value;

use crate::domain::documents::{Document, DocumentKey};
use crate::domain::identity::{EntityKind, IdentityHint};
use crate::domain::relationships::RelationshipType;

/// What a structured field points at
#[derive(Debug, Clone, PartialEq)]
pub enum FieldTarget {
    Document(DocumentKey),
    Entity(IdentityHint),
}

/// One reference found in the structured fields
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReference {
    pub field: &'static str,
    pub relationship_type: RelationshipType,
    pub target: FieldTarget,
    /// Field value as shown in evidence
    pub quote: String,
}

/// Collect every reference in a document's structured fields
///
/// Unknown fields and values of the wrong shape are ignored.
pub fn field_references(document: &Document) -> Vec<FieldReference> {
    let Some(fields) = document.structured_fields.as_object() else {
        return Vec::new();
    };
    let provider = document.source_type.to_lowercase();
    let repository = repository_name(document);
    let mut refs = Vec::new();

    if let Some(author) = fields.get("author") {
        push_people(&mut refs, "author", RelationshipType::AuthoredBy, author, &provider);
    }
    if let Some(assignees) = fields.get("assignees") {
        push_people(&mut refs, "assignees", RelationshipType::AssignedTo, assignees, &provider);
    }
    if let Some(reviewers) = fields.get("reviewers") {
        push_people(&mut refs, "reviewers", RelationshipType::ReviewedBy, reviewers, &provider);
    }

    for label in values(fields.get("labels")) {
        let name = match label {
            Value::String(s) => Some(s.as_str()),
            Value::Object(o) => o.get("name").and_then(Value::as_str),
            _ => None,
        };
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            let name = name.to_lowercase();
            refs.push(FieldReference {
                field: "labels",
                relationship_type: RelationshipType::Labeled,
                target: FieldTarget::Entity(IdentityHint::named(EntityKind::Label, &name)),
                quote: name,
            });
        }
    }

    for item in values(fields.get("linked_items")) {
        let Some(obj) = item.as_object() else { continue };
        let source_type = obj.get("source_type").and_then(Value::as_str);
        let source_id = obj.get("source_id").and_then(scalar_string);
        let (Some(source_type), Some(source_id)) = (source_type, source_id) else {
            continue;
        };
        if source_type.trim().is_empty() || source_id.trim().is_empty() {
            continue;
        }
        let relationship_type = obj
            .get("relation")
            .and_then(Value::as_str)
            .and_then(RelationshipType::parse)
            .unwrap_or(RelationshipType::References);
        let key = DocumentKey::new(source_type, source_id);
        refs.push(FieldReference {
            field: "linked_items",
            relationship_type,
            quote: key.to_string(),
            target: FieldTarget::Document(key),
        });
    }

    for path in values(fields.get("changed_files")) {
        let Some(path) = path.as_str().map(str::trim).filter(|p| !p.is_empty()) else {
            continue;
        };
        let name = match &repository {
            Some(repo) => format!("{}:{}", repo, path),
            None => path.to_string(),
        };
        refs.push(FieldReference {
            field: "changed_files",
            relationship_type: RelationshipType::Modifies,
            target: FieldTarget::Entity(IdentityHint::named(EntityKind::File, &name)),
            quote: path.to_string(),
        });
    }

    if let Some(repo) = fields
        .get("repository")
        .and_then(Value::as_str)
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
    {
        refs.push(FieldReference {
            field: "repository",
            relationship_type: RelationshipType::PartOf,
            target: FieldTarget::Entity(IdentityHint::named(EntityKind::Repo, &repo)),
            quote: repo,
        });
    }

    if let Some(service) = fields
        .get("service")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
    {
        refs.push(FieldReference {
            field: "service",
            relationship_type: RelationshipType::Affects,
            target: FieldTarget::Entity(IdentityHint::named(EntityKind::Service, &service)),
            quote: service,
        });
    }

    refs
}

/// `owner/repo` of a document, from the `repository` field or a GitHub source id
pub fn repository_name(document: &Document) -> Option<String> {
    if let Some(repo) = document
        .structured_fields
        .get("repository")
        .and_then(Value::as_str)
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
    {
        return Some(repo);
    }
    if document.source_type.eq_ignore_ascii_case("github") {
        return document
            .source_id
            .split_once('#')
            .map(|(repo, _)| repo.to_lowercase());
    }
    None
}

fn push_people(
    refs: &mut Vec<FieldReference>,
    field: &'static str,
    relationship_type: RelationshipType,
    value: &Value,
    provider: &str,
) {
    let people: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for person in people {
        if let Some(hint) = person_hint(person, provider) {
            refs.push(FieldReference {
                field,
                relationship_type,
                quote: hint.best_name(),
                target: FieldTarget::Entity(hint),
            });
        }
    }
}

/// Parse a person from a bare handle string or an object of identity signals
pub fn person_hint(value: &Value, provider: &str) -> Option<IdentityHint> {
    let hint = match value {
        Value::String(handle) => IdentityHint::person(provider).with_handle(handle.trim()),
        Value::Object(obj) => {
            let str_field = |names: &[&str]| {
                names
                    .iter()
                    .find_map(|n| obj.get(*n).and_then(scalar_string))
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            };
            IdentityHint {
                kind: Some(EntityKind::Person),
                source_type: Some(
                    str_field(&["source_type", "provider"])
                        .unwrap_or_else(|| provider.to_string())
                        .to_lowercase(),
                ),
                source_id: str_field(&["source_id", "id"]),
                email: str_field(&["email"]),
                email_verified: obj
                    .get("email_verified")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                handle: str_field(&["handle", "login", "username"]),
                display_name: str_field(&["display_name", "name"]),
            }
        }
        _ => return None,
    };
    (!hint.is_empty()).then_some(hint)
}

fn values(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
