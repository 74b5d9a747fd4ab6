//! Entity resolver
//!
//! Maps raw identity hints to canonical entity ids. Deterministic strategies run first;
//! the heuristic only suggests merges unless its score clears the auto-merge threshold.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::IdentityConfig;
use crate::error::{Error, Result};

use super::entity::{AliasType, Entity, EntityAlias, IdentityHint, email_domain};
use super::merge::MergeSuggestion;
use super::repository::IdentityRepository;
use super::strategy::{DEFAULT_STRATEGIES, ResolutionStrategy, score_candidate};

/// Re-read attempts after losing an alias insert race
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Result of resolving one hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub entity_id: String,
    /// A new canonical entity was created
    pub created: bool,
    /// Strategy that matched an existing entity
    pub matched_by: Option<ResolutionStrategy>,
    /// Merge suggestions recorded for a newly created entity
    pub suggestions: usize,
}

pub struct EntityResolver {
    repository: Arc<dyn IdentityRepository>,
    config: IdentityConfig,
    strategies: Vec<ResolutionStrategy>,
}

impl EntityResolver {
    pub fn new(repository: Arc<dyn IdentityRepository>, config: IdentityConfig) -> Self {
        Self {
            repository,
            config,
            strategies: DEFAULT_STRATEGIES.to_vec(),
        }
    }

    /// Replace the strategy order
    pub fn with_strategies(mut self, strategies: Vec<ResolutionStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn repository(&self) -> &Arc<dyn IdentityRepository> {
        &self.repository
    }

    /// Resolve a hint to a canonical entity id, creating the entity when nothing matches
    ///
    /// Safe under concurrent calls: a lost alias race is re-read and retried.
    pub async fn resolve(&self, workspace_id: &str, hint: &IdentityHint) -> Result<Resolution> {
        if hint.is_empty() {
            return Err(Error::Validation(
                "identity hint carries no usable signal".to_string(),
            ));
        }

        let mut last_conflict = String::new();
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            match self.try_resolve(workspace_id, hint).await {
                Err(Error::Conflict(what)) => {
                    debug!(attempt = attempt, conflict = %what, "Alias race lost, re-reading");
                    last_conflict = what;
                }
                other => return other,
            }
        }
        Err(Error::Conflict(last_conflict))
    }

    async fn try_resolve(&self, workspace_id: &str, hint: &IdentityHint) -> Result<Resolution> {
        let mut suggestions: Vec<(String, f32, Vec<String>)> = Vec::new();
        let mut email_owned = false;

        for strategy in &self.strategies {
            match strategy {
                ResolutionStrategy::ProviderId => {
                    if let Some(value) = hint.provider_id()
                        && let Some(alias) = self
                            .repository
                            .find_alias(workspace_id, AliasType::ProviderId, &value)
                            .await?
                    {
                        return self.matched(workspace_id, hint, alias.entity_id, *strategy).await;
                    }
                    // provider-scoped handles are unique inside their provider
                    if let Some(value) = hint.handle_alias()
                        && let Some(alias) = self
                            .repository
                            .find_alias(workspace_id, AliasType::Handle, &value)
                            .await?
                    {
                        return self.matched(workspace_id, hint, alias.entity_id, *strategy).await;
                    }
                }
                ResolutionStrategy::VerifiedEmail => {
                    let Some(email) = hint.normalized_email() else { continue };
                    if let Some(alias) = self
                        .repository
                        .find_alias(workspace_id, AliasType::Email, &email)
                        .await?
                    {
                        email_owned = true;
                        if alias.verified && hint.email_verified {
                            return self.matched(workspace_id, hint, alias.entity_id, *strategy).await;
                        }
                    }
                }
                ResolutionStrategy::Heuristic => {
                    let Some(email) = hint.normalized_email() else { continue };
                    let Some(domain) = email_domain(&email) else { continue };

                    let candidates = self
                        .repository
                        .heuristic_candidates(workspace_id, hint.kind(), domain)
                        .await?;

                    let scored: Vec<(String, f32, Vec<String>)> = candidates
                        .iter()
                        .filter_map(|(entity, aliases)| {
                            score_candidate(hint, &entity.display_name, aliases)
                                .map(|s| (entity.id.clone(), s.confidence, s.signals))
                        })
                        .filter(|(_, confidence, _)| *confidence >= self.config.suggestion_threshold)
                        .collect();

                    let confident: Vec<&(String, f32, Vec<String>)> = scored
                        .iter()
                        .filter(|(_, confidence, _)| *confidence >= self.config.auto_merge_threshold)
                        .collect();

                    if let [(entity_id, confidence, signals)] = confident.as_slice() {
                        info!(
                            entity_id = %entity_id,
                            confidence = *confidence,
                            signals = ?signals,
                            "Heuristic identity match applied"
                        );
                        return self
                            .matched(workspace_id, hint, entity_id.clone(), *strategy)
                            .await;
                    }

                    suggestions = scored;
                }
            }
        }

        self.create(workspace_id, hint, email_owned, suggestions).await
    }

    async fn matched(
        &self,
        workspace_id: &str,
        hint: &IdentityHint,
        entity_id: String,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution> {
        let attached = self
            .repository
            .attach_aliases(&hint.aliases(&entity_id, workspace_id))
            .await?;

        debug!(
            entity_id = %entity_id,
            strategy = strategy.as_str(),
            new_aliases = attached,
            "Identity hint resolved"
        );

        Ok(Resolution {
            entity_id,
            created: false,
            matched_by: Some(strategy),
            suggestions: 0,
        })
    }

    async fn create(
        &self,
        workspace_id: &str,
        hint: &IdentityHint,
        email_owned: bool,
        suggestions: Vec<(String, f32, Vec<String>)>,
    ) -> Result<Resolution> {
        let entity = Entity::new(workspace_id, hint.kind(), hint.best_name());
        let aliases = hint.aliases(&entity.id, workspace_id);

        // Key alias: provider id, else a verified email nobody owns yet, else the handle
        let key_index = aliases
            .iter()
            .position(|a| a.alias_type == AliasType::ProviderId)
            .or_else(|| {
                if email_owned {
                    None
                } else {
                    aliases
                        .iter()
                        .position(|a| a.alias_type == AliasType::Email && a.verified)
                }
            })
            .or_else(|| {
                if hint.normalized_email().is_some() {
                    None
                } else {
                    aliases.iter().position(|a| a.alias_type == AliasType::Handle)
                }
            });

        let key_alias: Option<&EntityAlias> = key_index.map(|i| &aliases[i]);
        let rest: Vec<EntityAlias> = aliases
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != key_index)
            .map(|(_, a)| a.clone())
            .collect();

        self.repository
            .create_entity(&entity, key_alias, &rest)
            .await?;

        let mut recorded = 0;
        for (candidate_id, confidence, signals) in suggestions {
            let suggestion =
                MergeSuggestion::new(workspace_id, &entity.id, candidate_id, confidence, signals);
            self.repository.save_suggestion(&suggestion).await?;
            recorded += 1;
        }

        info!(
            entity_id = %entity.id,
            kind = %entity.kind,
            display_name = %entity.display_name,
            suggestions = recorded,
            "Entity created"
        );

        Ok(Resolution {
            entity_id: entity.id,
            created: true,
            matched_by: None,
            suggestions: recorded,
        })
    }
}
