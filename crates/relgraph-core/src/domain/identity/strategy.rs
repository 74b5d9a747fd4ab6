//! Ordered resolution strategies
//!
//! Resolution walks [`DEFAULT_STRATEGIES`] in order and stops at the first match. New
//! alias types get a new variant appended where they belong in the priority.

use serde::{Deserialize, Serialize};

use super::entity::{EntityAlias, IdentityHint, normalize_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Exact alias match on `provider:id`
    ProviderId,
    /// Exact match on an email alias, when both sides are verified
    VerifiedEmail,
    /// Email domain plus handle/name signals; suggests, applies only above threshold
    Heuristic,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderId => "provider_id",
            Self::VerifiedEmail => "verified_email",
            Self::Heuristic => "heuristic",
        }
    }
}

pub const DEFAULT_STRATEGIES: &[ResolutionStrategy] = &[
    ResolutionStrategy::ProviderId,
    ResolutionStrategy::VerifiedEmail,
    ResolutionStrategy::Heuristic,
];

const BASE_SCORE: f32 = 0.50;
const DOMAIN_WEIGHT: f32 = 0.20;
const HANDLE_WEIGHT: f32 = 0.15;
const NAME_WEIGHT: f32 = 0.10;
const MULTI_PROVIDER_WEIGHT: f32 = 0.05;

/// Heuristic score of a hint against one candidate entity
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicScore {
    pub confidence: f32,
    pub signals: Vec<String>,
}

/// Score a candidate that owns an email alias in the hint's domain
///
/// Returns `None` unless a handle or display name also matches; a shared domain on its
/// own says nothing about identity.
pub fn score_candidate(
    hint: &IdentityHint,
    candidate_name: &str,
    candidate_aliases: &[EntityAlias],
) -> Option<HeuristicScore> {
    let email = hint.normalized_email()?;
    let domain = super::entity::email_domain(&email)?;

    let domain_alias = candidate_aliases
        .iter()
        .find(|a| a.email_domain() == Some(domain))?;

    let mut confidence = BASE_SCORE + DOMAIN_WEIGHT;
    let mut signals = vec!["email_domain".to_string()];
    let mut providers: Vec<Option<&str>> = vec![
        hint.source_type.as_deref(),
        domain_alias.provider.as_deref(),
    ];

    let handle_alias = hint.normalized_handle().and_then(|handle| {
        candidate_aliases
            .iter()
            .find(|a| a.handle().is_some_and(|h| h.eq_ignore_ascii_case(&handle)))
    });
    if let Some(alias) = handle_alias {
        confidence += HANDLE_WEIGHT;
        signals.push("handle".to_string());
        providers.push(alias.provider.as_deref());
    }

    let name_matches = hint
        .display_name
        .as_deref()
        .map(normalize_name)
        .is_some_and(|n| !n.is_empty() && n == normalize_name(candidate_name));
    if name_matches {
        confidence += NAME_WEIGHT;
        signals.push("display_name".to_string());
    }

    if handle_alias.is_none() && !name_matches {
        return None;
    }

    let mut distinct: Vec<&str> = providers.into_iter().flatten().collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() >= 2 {
        confidence += MULTI_PROVIDER_WEIGHT;
        signals.push("multi_provider".to_string());
    }

    Some(HeuristicScore {
        confidence: confidence.min(1.0),
        signals,
    })
}
