//! In-process adjacency projection of the relationship store
//!
//! Each workspace keeps an arena of nodes and edges with per-node forward and backward
//! edge index lists. Cycles are normal. Removed edges are tombstoned and dropped on
//! the next rebuild.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::relationships::{
    Direction, Endpoint, NodeKind, PairWrite, Relationship, RelationshipType,
};
use crate::error::{Error, Result};

/// Traversal depth supported by the cache
pub const MAX_HOPS: u32 = 2;

/// A node reached from a starting node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node_id: String,
    pub kind: NodeKind,
    /// Type of the last edge on the path
    pub relationship_type: RelationshipType,
    /// Product of edge confidences along the path
    pub confidence: f32,
    pub hop: u32,
}

#[derive(Debug, Clone)]
struct EdgeSlot {
    relationship_id: String,
    from: usize,
    to: usize,
    relationship_type: RelationshipType,
    confidence: f32,
    live: bool,
}

#[derive(Debug, Default)]
struct WorkspaceGraph {
    nodes: Vec<(String, NodeKind)>,
    node_index: HashMap<String, usize>,
    edges: Vec<EdgeSlot>,
    forward: Vec<Vec<usize>>,
    backward: Vec<Vec<usize>>,
    edge_index: HashMap<String, usize>,
    tombstones: usize,
}

impl WorkspaceGraph {
    fn node(&mut self, endpoint: &Endpoint) -> usize {
        if let Some(&idx) = self.node_index.get(&endpoint.id) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push((endpoint.id.clone(), endpoint.kind));
        self.forward.push(Vec::new());
        self.backward.push(Vec::new());
        self.node_index.insert(endpoint.id.clone(), idx);
        idx
    }

    fn upsert(&mut self, relationship: &Relationship) {
        if let Some(&idx) = self.edge_index.get(&relationship.id) {
            let slot = &mut self.edges[idx];
            slot.confidence = relationship.confidence;
            slot.relationship_type = relationship.relationship_type;
            return;
        }

        let from = self.node(&relationship.from);
        let to = self.node(&relationship.to);
        let idx = self.edges.len();
        self.edges.push(EdgeSlot {
            relationship_id: relationship.id.clone(),
            from,
            to,
            relationship_type: relationship.relationship_type,
            confidence: relationship.confidence,
            live: true,
        });
        self.forward[from].push(idx);
        self.backward[to].push(idx);
        self.edge_index.insert(relationship.id.clone(), idx);
    }

    fn remove(&mut self, relationship_id: &str) -> bool {
        let Some(idx) = self.edge_index.remove(relationship_id) else {
            return false;
        };
        let slot = &mut self.edges[idx];
        slot.live = false;
        let (from, to) = (slot.from, slot.to);
        self.forward[from].retain(|&e| e != idx);
        self.backward[to].retain(|&e| e != idx);
        self.tombstones += 1;
        true
    }

    fn live_edges(&self) -> usize {
        self.edges.len() - self.tombstones
    }

    /// Edges leaving `node` in the traversal direction, as `(edge, other end)`
    fn step(&self, node: usize, direction: Direction) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            out.extend(self.forward[node].iter().map(|&e| (e, self.edges[e].to)));
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            out.extend(self.backward[node].iter().map(|&e| (e, self.edges[e].from)));
        }
        out
    }
}

/// Per-workspace adjacency cache
#[derive(Default)]
pub struct AdjacencyCache {
    graphs: RwLock<HashMap<String, WorkspaceGraph>>,
}

impl AdjacencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh one edge
    pub async fn apply(&self, relationship: &Relationship) {
        let mut graphs = self.graphs.write().await;
        graphs
            .entry(relationship.workspace_id.clone())
            .or_default()
            .upsert(relationship);
    }

    /// Mirror the effect of a pair write
    pub async fn apply_write(&self, write: &PairWrite) {
        let mut graphs = self.graphs.write().await;
        for removed in &write.superseded {
            if let Some(graph) = graphs.get_mut(&removed.workspace_id) {
                graph.remove(&removed.id);
            }
        }
        for relationship in write.forward.iter().chain(write.reverse.iter()) {
            graphs
                .entry(relationship.workspace_id.clone())
                .or_default()
                .upsert(relationship);
        }
    }

    /// Tombstone an edge
    pub async fn remove(&self, workspace_id: &str, relationship_id: &str) -> bool {
        let mut graphs = self.graphs.write().await;
        graphs
            .get_mut(workspace_id)
            .map(|g| g.remove(relationship_id))
            .unwrap_or(false)
    }

    /// Replace a workspace projection with a fresh one built from the store
    pub async fn rebuild_workspace(&self, workspace_id: &str, relationships: &[Relationship]) {
        let mut graph = WorkspaceGraph::default();
        for relationship in relationships {
            graph.upsert(relationship);
        }
        let edges = graph.live_edges();

        self.graphs
            .write()
            .await
            .insert(workspace_id.to_string(), graph);

        info!(workspace_id = %workspace_id, edges = edges, "Adjacency cache rebuilt");
    }

    /// Whether a workspace has been loaded
    pub async fn contains_workspace(&self, workspace_id: &str) -> bool {
        self.graphs.read().await.contains_key(workspace_id)
    }

    /// Live edge count of a workspace
    pub async fn edge_count(&self, workspace_id: &str) -> usize {
        self.graphs
            .read()
            .await
            .get(workspace_id)
            .map(|g| g.live_edges())
            .unwrap_or(0)
    }

    /// Nodes within `max_hops` of `node_id`
    ///
    /// For each neighbor the shortest hop wins and a higher confidence breaks ties. An
    /// empty allowlist follows every relationship type.
    pub async fn get_neighbors(
        &self,
        workspace_id: &str,
        node_id: &str,
        direction: Direction,
        type_allowlist: &[RelationshipType],
        max_hops: u32,
    ) -> Result<Vec<Neighbor>> {
        if max_hops > MAX_HOPS {
            return Err(Error::Validation(format!(
                "max_hops must be at most {} (got {})",
                MAX_HOPS, max_hops
            )));
        }

        let graphs = self.graphs.read().await;
        let Some(graph) = graphs.get(workspace_id) else {
            return Ok(Vec::new());
        };
        let Some(&start) = graph.node_index.get(node_id) else {
            return Ok(Vec::new());
        };

        let allowed =
            |t: RelationshipType| type_allowlist.is_empty() || type_allowlist.contains(&t);

        // node index -> (hop, confidence, type)
        let mut best: HashMap<usize, (u32, f32, RelationshipType)> = HashMap::new();
        let mut frontier: Vec<(usize, f32)> = vec![(start, 1.0)];

        for hop in 1..=max_hops {
            let mut next = Vec::new();
            for &(node, path_confidence) in &frontier {
                for (edge_idx, other) in graph.step(node, direction) {
                    let edge = &graph.edges[edge_idx];
                    if !edge.live || other == start || !allowed(edge.relationship_type) {
                        continue;
                    }
                    let confidence = path_confidence * edge.confidence;
                    let better = match best.get(&other) {
                        None => true,
                        Some(&(h, c, _)) => hop < h || (hop == h && confidence > c),
                    };
                    if better {
                        best.insert(other, (hop, confidence, edge.relationship_type));
                        next.push((other, confidence));
                    }
                }
            }
            frontier = next;
        }

        let mut neighbors: Vec<Neighbor> = best
            .into_iter()
            .map(|(idx, (hop, confidence, relationship_type))| {
                let (id, kind) = &graph.nodes[idx];
                Neighbor {
                    node_id: id.clone(),
                    kind: *kind,
                    relationship_type,
                    confidence,
                    hop,
                }
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.hop
                .cmp(&b.hop)
                .then(b.confidence.total_cmp(&a.confidence))
                .then(a.node_id.cmp(&b.node_id))
        });

        debug!(
            workspace_id = %workspace_id,
            node_id = %node_id,
            neighbors = neighbors.len(),
            "Neighbors resolved from cache"
        );
        Ok(neighbors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::relationships::RelationshipSource;

    fn pair(from: &str, to: &str, t: RelationshipType, confidence: f32) -> PairWrite {
        let forward = Relationship::new(
            "ws",
            Endpoint::document(from),
            Endpoint::document(to),
            t,
            RelationshipSource::Deterministic,
        )
        .with_confidence(confidence);
        let reverse = forward.reverse();
        PairWrite {
            outcome: crate::domain::relationships::WriteOutcome::Created,
            forward: Some(forward),
            reverse: Some(reverse),
            superseded: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_one_and_two_hop_neighbors() {
        let cache = AdjacencyCache::new();
        cache.apply_write(&pair("pr", "issue", RelationshipType::Resolves, 0.95)).await;
        cache.apply_write(&pair("issue", "incident", RelationshipType::CausedBy, 0.5)).await;

        let neighbors = cache
            .get_neighbors("ws", "pr", Direction::Outgoing, &[], 2)
            .await
            .unwrap();

        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].node_id, "issue");
        assert_eq!(neighbors[0].hop, 1);
        assert_eq!(neighbors[0].relationship_type, RelationshipType::Resolves);
        assert_eq!(neighbors[1].node_id, "incident");
        assert_eq!(neighbors[1].hop, 2);
        assert!((neighbors[1].confidence - 0.475).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_shortest_hop_wins_over_confidence() {
        let cache = AdjacencyCache::new();
        cache.apply_write(&pair("a", "b", RelationshipType::References, 1.0)).await;
        cache.apply_write(&pair("b", "c", RelationshipType::References, 1.0)).await;
        cache.apply_write(&pair("a", "c", RelationshipType::References, 0.6)).await;

        let neighbors = cache
            .get_neighbors("ws", "a", Direction::Outgoing, &[], 2)
            .await
            .unwrap();
        let c = neighbors.iter().find(|n| n.node_id == "c").unwrap();
        assert_eq!(c.hop, 1);
        assert!((c.confidence - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cycles_do_not_return_start() {
        let cache = AdjacencyCache::new();
        cache.apply_write(&pair("a", "b", RelationshipType::RelatedTo, 0.9)).await;

        let neighbors = cache
            .get_neighbors("ws", "a", Direction::Both, &[], 2)
            .await
            .unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].node_id, "b");
    }

    #[tokio::test]
    async fn test_allowlist_and_direction() {
        let cache = AdjacencyCache::new();
        cache.apply_write(&pair("pr", "issue", RelationshipType::Resolves, 0.95)).await;
        cache.apply_write(&pair("pr", "other", RelationshipType::References, 0.9)).await;

        let neighbors = cache
            .get_neighbors("ws", "pr", Direction::Outgoing, &[RelationshipType::Resolves], 1)
            .await
            .unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].node_id, "issue");

        let incoming = cache
            .get_neighbors("ws", "issue", Direction::Incoming, &[], 1)
            .await
            .unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].relationship_type, RelationshipType::Resolves);
    }

    #[tokio::test]
    async fn test_remove_and_rebuild() {
        let cache = AdjacencyCache::new();
        let write = pair("a", "b", RelationshipType::Blocks, 1.0);
        cache.apply_write(&write).await;
        assert_eq!(cache.edge_count("ws").await, 2);

        let forward = write.forward.clone().unwrap();
        assert!(cache.remove("ws", &forward.id).await);
        assert!(!cache.remove("ws", &forward.id).await);
        assert_eq!(cache.edge_count("ws").await, 1);

        let neighbors = cache
            .get_neighbors("ws", "a", Direction::Outgoing, &[], 1)
            .await
            .unwrap();
        assert!(neighbors.is_empty());

        cache.rebuild_workspace("ws", &[forward]).await;
        assert_eq!(cache.edge_count("ws").await, 1);
    }

    #[tokio::test]
    async fn test_superseded_edges_removed() {
        let cache = AdjacencyCache::new();
        let semantic = pair("a", "b", RelationshipType::References, 0.85);
        cache.apply_write(&semantic).await;

        let mut deterministic = pair("a", "b", RelationshipType::References, 1.0);
        deterministic.superseded = vec![
            semantic.forward.clone().unwrap(),
            semantic.reverse.clone().unwrap(),
        ];
        cache.apply_write(&deterministic).await;

        assert_eq!(cache.edge_count("ws").await, 2);
        let neighbors = cache
            .get_neighbors("ws", "a", Direction::Outgoing, &[], 1)
            .await
            .unwrap();
        assert_eq!(neighbors[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_rejects_deep_traversal() {
        let cache = AdjacencyCache::new();
        let result = cache.get_neighbors("ws", "a", Direction::Outgoing, &[], 3).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_workspace_is_empty() {
        let cache = AdjacencyCache::new();
        assert!(
            cache
                .get_neighbors("nope", "a", Direction::Both, &[], 2)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(!cache.contains_workspace("nope").await);
    }
}
