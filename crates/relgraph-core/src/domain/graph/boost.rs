//! Graph boost for retrieval ranking
//!
//! A candidate connected to one of the query's anchor nodes gets an additive boost of
//! `weight * confidence * hop_decay(hop)`, never more than `weight`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GraphConfig;
use crate::domain::relationships::Direction;
use crate::error::Result;

use super::adjacency::AdjacencyCache;

/// A retrieval candidate with its base score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub node_id: String,
    pub score: f32,
}

impl ScoredCandidate {
    pub fn new(node_id: impl Into<String>, score: f32) -> Self {
        Self {
            node_id: node_id.into(),
            score,
        }
    }
}

/// A candidate after graph boosting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedCandidate {
    pub node_id: String,
    pub base_score: f32,
    pub boost: f32,
    pub score: f32,
    /// Anchor that produced the boost, if any
    pub via_anchor: Option<String>,
    pub hop: Option<u32>,
}

/// Computes bounded graph boosts from the adjacency cache
pub struct GraphBooster {
    cache: Arc<AdjacencyCache>,
    config: GraphConfig,
}

impl GraphBooster {
    pub fn new(cache: Arc<AdjacencyCache>, config: GraphConfig) -> Self {
        Self { cache, config }
    }

    /// Boost candidates by their graph proximity to the anchors
    ///
    /// Results are sorted by boosted score, highest first.
    pub async fn boost_scores(
        &self,
        workspace_id: &str,
        anchors: &[String],
        candidates: &[ScoredCandidate],
    ) -> Result<Vec<BoostedCandidate>> {
        let weight = self.config.boost_weight.clamp(0.0, 1.0);
        let max_hops = self.config.max_hops.min(super::adjacency::MAX_HOPS);

        // node -> (boost, anchor, hop)
        let mut boosts: HashMap<String, (f32, String, u32)> = HashMap::new();
        for anchor in anchors {
            let neighbors = self
                .cache
                .get_neighbors(
                    workspace_id,
                    anchor,
                    Direction::Both,
                    &self.config.type_allowlist,
                    max_hops,
                )
                .await?;

            for neighbor in neighbors {
                let boost = (weight * neighbor.confidence * self.config.decay_for(neighbor.hop))
                    .clamp(0.0, weight);
                let entry = boosts
                    .entry(neighbor.node_id)
                    .or_insert((0.0, anchor.clone(), neighbor.hop));
                if boost > entry.0 {
                    *entry = (boost, anchor.clone(), neighbor.hop);
                }
            }
        }

        let mut boosted: Vec<BoostedCandidate> = candidates
            .iter()
            .map(|candidate| match boosts.get(&candidate.node_id) {
                Some((boost, anchor, hop)) if *boost > 0.0 => BoostedCandidate {
                    node_id: candidate.node_id.clone(),
                    base_score: candidate.score,
                    boost: *boost,
                    score: candidate.score + boost,
                    via_anchor: Some(anchor.clone()),
                    hop: Some(*hop),
                },
                _ => BoostedCandidate {
                    node_id: candidate.node_id.clone(),
                    base_score: candidate.score,
                    boost: 0.0,
                    score: candidate.score,
                    via_anchor: None,
                    hop: None,
                },
            })
            .collect();

        boosted.sort_by(|a, b| b.score.total_cmp(&a.score));

        debug!(
            workspace_id = %workspace_id,
            anchors = anchors.len(),
            boosted = boosted.iter().filter(|c| c.boost > 0.0).count(),
            "Graph boost applied"
        );
        Ok(boosted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::relationships::{
        Endpoint, PairWrite, Relationship, RelationshipSource, RelationshipType, WriteOutcome,
    };

    async fn cache_with(edges: &[(&str, &str, f32)]) -> Arc<AdjacencyCache> {
        let cache = Arc::new(AdjacencyCache::new());
        for (from, to, confidence) in edges {
            let forward = Relationship::new(
                "ws",
                Endpoint::document(*from),
                Endpoint::document(*to),
                RelationshipType::References,
                RelationshipSource::Deterministic,
            )
            .with_confidence(*confidence);
            let reverse = forward.reverse();
            cache
                .apply_write(&PairWrite {
                    outcome: WriteOutcome::Created,
                    forward: Some(forward),
                    reverse: Some(reverse),
                    superseded: Vec::new(),
                })
                .await;
        }
        cache
    }

    #[tokio::test]
    async fn test_boost_by_hop() {
        let cache = cache_with(&[("anchor", "a", 1.0), ("a", "b", 0.5)]).await;
        let booster = GraphBooster::new(cache, GraphConfig::default());

        let results = booster
            .boost_scores(
                "ws",
                &["anchor".to_string()],
                &[
                    ScoredCandidate::new("a", 0.5),
                    ScoredCandidate::new("b", 0.5),
                    ScoredCandidate::new("c", 0.6),
                ],
            )
            .await
            .unwrap();

        let a = results.iter().find(|c| c.node_id == "a").unwrap();
        assert!((a.boost - 0.2).abs() < 1e-6);
        assert_eq!(a.hop, Some(1));

        // 0.2 * (1.0 * 0.5) * 0.6
        let b = results.iter().find(|c| c.node_id == "b").unwrap();
        assert!((b.boost - 0.06).abs() < 1e-6);

        let c = results.iter().find(|c| c.node_id == "c").unwrap();
        assert_eq!(c.boost, 0.0);
        assert_eq!(c.via_anchor, None);

        assert_eq!(results[0].node_id, "a");
    }

    #[tokio::test]
    async fn test_boost_never_exceeds_weight() {
        let cache = cache_with(&[("x", "a", 1.0), ("y", "a", 1.0)]).await;
        let booster = GraphBooster::new(cache, GraphConfig::default());

        let results = booster
            .boost_scores(
                "ws",
                &["x".to_string(), "y".to_string()],
                &[ScoredCandidate::new("a", 0.1)],
            )
            .await
            .unwrap();
        assert!(results[0].boost <= 0.2 + 1e-6);
    }

    #[tokio::test]
    async fn test_allowlist_limits_boost() {
        let cache = cache_with(&[("anchor", "a", 1.0)]).await;
        let config = GraphConfig {
            type_allowlist: vec![RelationshipType::Resolves],
            ..GraphConfig::default()
        };
        let booster = GraphBooster::new(cache, config);

        let results = booster
            .boost_scores("ws", &["anchor".to_string()], &[ScoredCandidate::new("a", 0.5)])
            .await
            .unwrap();
        assert_eq!(results[0].boost, 0.0);
    }
}
