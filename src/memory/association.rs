/// Association Network Builder: long-term memory.
///
/// Long-term memory is a weighted concept graph. Every schematized episode
/// strengthens the associations between the concepts it contains using a
/// Hebbian rule:
///
/// ```text
/// weight ← clamp(weight + η × co_activation − decay × weight, 0, 1)
/// ```
///
/// Independently of new consolidations, a passive decay pass weakens every
/// edge over time (pruning edges that stay negligible), and a homeostasis
/// pass rescales all weights toward a target mean so the graph neither
/// saturates nor fades out.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::memory::centrality;
use crate::types::{clamp_unit, AssociationEdge, ConceptNode, EdgeKey, Episode};

/// Association network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Hebbian learning rate η
    pub learning_rate: f64,

    /// Synaptic decay applied with every Hebbian update
    pub decay_rate: f64,

    /// Passive exponential decay per hour (stored on each edge)
    pub passive_decay_per_hour: f64,

    /// Edges below this weight are candidates for pruning
    pub prune_threshold: f64,

    /// How long an edge must stay below the threshold before it is pruned
    pub prune_after_secs: u64,

    /// Number of regions concepts are partitioned into
    pub region_count: u32,

    /// Mean edge weight homeostasis steers toward
    pub homeostasis_target: f64,

    /// Fraction of the gap to the target closed per homeostasis pass
    pub homeostasis_rate: f64,

    /// Most frequent concepts kept per episode (bounds the pair count)
    pub max_concepts_per_episode: usize,

    /// Heaviest neighbours considered by the betweenness proxy
    pub centrality_neighbor_cap: usize,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            decay_rate: 0.005,
            passive_decay_per_hour: 0.002,
            prune_threshold: 0.01,
            prune_after_secs: 7 * 24 * 3600,
            region_count: 16,
            homeostasis_target: 0.3,
            homeostasis_rate: 0.5,
            max_concepts_per_episode: 32,
            centrality_neighbor_cap: 64,
        }
    }
}

impl AssociationConfig {
    /// Prune grace period.
    pub fn prune_after(&self) -> Duration {
        Duration::seconds(self.prune_after_secs as i64)
    }
}

/// The concept graph owned by long-term memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssociationGraph {
    nodes: HashMap<String, ConceptNode>,
    edges: HashMap<EdgeKey, AssociationEdge>,
    adjacency: HashMap<String, BTreeSet<String>>,
}

impl AssociationGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of concepts (dormant ones included).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Look up a concept.
    pub fn node(&self, label: &str) -> Option<&ConceptNode> {
        self.nodes.get(label)
    }

    /// All concepts.
    pub fn nodes(&self) -> impl Iterator<Item = &ConceptNode> {
        self.nodes.values()
    }

    /// All edges.
    pub fn edges(&self) -> impl Iterator<Item = &AssociationEdge> {
        self.edges.values()
    }

    /// Look up an edge; argument order does not matter.
    pub fn edge(&self, a: &str, b: &str) -> Option<&AssociationEdge> {
        self.edges.get(&EdgeKey::new(a, b))
    }

    /// Weight of an edge, 0.0 when absent.
    pub fn weight(&self, a: &str, b: &str) -> f64 {
        self.edge(a, b).map(|e| e.weight).unwrap_or(0.0)
    }

    /// Whether two concepts are directly associated.
    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        self.edges.contains_key(&EdgeKey::new(a, b))
    }

    /// Neighbours of a concept.
    pub fn neighbors(&self, label: &str) -> impl Iterator<Item = &String> {
        self.adjacency.get(label).into_iter().flatten()
    }

    /// Mean edge weight, 0.0 for an empty graph.
    pub fn mean_weight(&self) -> f64 {
        if self.edges.is_empty() {
            return 0.0;
        }
        self.edges.values().map(|e| e.weight).sum::<f64>() / self.edges.len() as f64
    }

    fn ensure_node(&mut self, label: &str, region_count: u32, now: DateTime<Utc>) -> bool {
        if let Some(node) = self.nodes.get_mut(label) {
            node.last_activated = now;
            return false;
        }
        self.nodes.insert(
            label.to_string(),
            ConceptNode {
                label: label.to_string(),
                region: centrality::region_for(label, region_count),
                degree: 0,
                weighted_degree: 0.0,
                betweenness: 0.0,
                first_seen: now,
                last_activated: now,
            },
        );
        true
    }

    fn link(&mut self, key: &EdgeKey) {
        self.adjacency
            .entry(key.0.clone())
            .or_default()
            .insert(key.1.clone());
        self.adjacency
            .entry(key.1.clone())
            .or_default()
            .insert(key.0.clone());
        for label in [&key.0, &key.1] {
            let degree = self.adjacency.get(label).map(|n| n.len()).unwrap_or(0);
            if let Some(node) = self.nodes.get_mut(label) {
                node.degree = degree;
            }
        }
    }

    fn unlink(&mut self, key: &EdgeKey) {
        if let Some(n) = self.adjacency.get_mut(&key.0) {
            n.remove(&key.1);
        }
        if let Some(n) = self.adjacency.get_mut(&key.1) {
            n.remove(&key.0);
        }
        for label in [&key.0, &key.1] {
            let degree = self.adjacency.get(label).map(|n| n.len()).unwrap_or(0);
            if let Some(node) = self.nodes.get_mut(label) {
                node.degree = degree;
            }
        }
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut ConceptNode> {
        self.nodes.values_mut()
    }
}

/// Result of applying one episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HebbianReport {
    pub concepts: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub pairs_updated: usize,
}

/// Result of a passive decay pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecayReport {
    pub edges_decayed: usize,
    pub edges_pruned: usize,
}

/// Result of a homeostasis pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HomeostasisReport {
    pub mean_before: f64,
    pub mean_after: f64,
    pub scale: f64,
}

/// Applies learning, decay and homeostasis to an [`AssociationGraph`].
#[derive(Debug, Clone)]
pub struct AssociationBuilder {
    config: AssociationConfig,
}

impl AssociationBuilder {
    /// Create a builder.
    pub fn new(config: AssociationConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &AssociationConfig {
        &self.config
    }

    /// One Hebbian step for a single edge weight.
    pub fn hebbian(&self, weight: f64, co_activation: f64) -> f64 {
        let co = clamp_unit(co_activation, "co_activation");
        clamp_unit(
            weight + self.config.learning_rate * co - self.config.decay_rate * weight,
            "edge.weight",
        )
    }

    /// Concepts of an episode with their mean activation, most frequent first.
    fn episode_concepts(&self, episode: &Episode) -> Vec<(String, f64)> {
        let mut acc: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
        for member in &episode.members {
            for concept in &member.concepts {
                let entry = acc.entry(concept.as_str()).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += member.activation;
            }
        }
        let mut ranked: Vec<(String, usize, f64)> = acc
            .into_iter()
            .map(|(label, (count, sum))| (label.to_string(), count, sum / count as f64))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.2.total_cmp(&a.2))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(self.config.max_concepts_per_episode);
        ranked
            .into_iter()
            .map(|(label, _, activation)| (label, clamp_unit(activation, "concept.activation")))
            .collect()
    }

    /// Strengthen every co-occurring concept pair of a schematized episode.
    pub fn consolidate(
        &self,
        graph: &mut AssociationGraph,
        episode: &Episode,
        now: DateTime<Utc>,
    ) -> HebbianReport {
        let concepts = self.episode_concepts(episode);
        let mut report = HebbianReport {
            concepts: concepts.len(),
            ..HebbianReport::default()
        };

        for (label, _) in &concepts {
            if graph.ensure_node(label, self.config.region_count, now) {
                report.nodes_created += 1;
            }
        }

        for (i, (a, act_a)) in concepts.iter().enumerate() {
            for (b, act_b) in concepts.iter().skip(i + 1) {
                let key = EdgeKey::new(a, b);
                let created = !graph.edges.contains_key(&key);
                let edge = graph
                    .edges
                    .entry(key.clone())
                    .or_insert_with(|| AssociationEdge::new(&key, self.config.passive_decay_per_hour, now));
                edge.weight = self.hebbian(edge.weight, act_a * act_b);
                edge.last_updated = now;
                if edge.weight >= self.config.prune_threshold {
                    edge.below_threshold_since = None;
                }
                if created {
                    graph.link(&key);
                    report.edges_created += 1;
                }
                report.pairs_updated += 1;
            }
        }

        debug!(
            episode_id = %episode.id,
            concepts = report.concepts,
            pairs = report.pairs_updated,
            "hebbian update applied"
        );
        report
    }

    /// Passive exponential decay of every edge, pruning long-negligible ones.
    pub fn decay(&self, graph: &mut AssociationGraph, now: DateTime<Utc>) -> DecayReport {
        let mut report = DecayReport::default();
        let mut doomed = Vec::new();
        let prune_after = self.config.prune_after();

        for (key, edge) in graph.edges.iter_mut() {
            let hours = now
                .signed_duration_since(edge.last_decayed)
                .num_milliseconds()
                .max(0) as f64
                / 3_600_000.0;
            if hours > 0.0 {
                edge.weight = clamp_unit(edge.weight * (-edge.decay_rate * hours).exp(), "edge.weight");
                edge.last_decayed = now;
                report.edges_decayed += 1;
            }

            if edge.weight < self.config.prune_threshold {
                let since = *edge.below_threshold_since.get_or_insert(now);
                if now.signed_duration_since(since) >= prune_after {
                    doomed.push(key.clone());
                }
            } else {
                edge.below_threshold_since = None;
            }
        }

        for key in doomed {
            graph.edges.remove(&key);
            graph.unlink(&key);
            report.edges_pruned += 1;
        }

        if report.edges_pruned > 0 {
            info!(pruned = report.edges_pruned, remaining = graph.edge_count(), "pruned dormant associations");
        }
        report
    }

    /// Rescale all weights toward the target mean, then refresh centrality.
    pub fn homeostasis(&self, graph: &mut AssociationGraph) -> HomeostasisReport {
        let mean_before = graph.mean_weight();
        if graph.edges.is_empty() || mean_before <= f64::EPSILON {
            self.recompute_centrality(graph);
            return HomeostasisReport {
                mean_before,
                mean_after: mean_before,
                scale: 1.0,
            };
        }

        let target = self.config.homeostasis_target / mean_before;
        let scale = 1.0 + self.config.homeostasis_rate * (target - 1.0);
        for edge in graph.edges.values_mut() {
            edge.weight = clamp_unit(edge.weight * scale, "edge.weight");
        }
        let mean_after = graph.mean_weight();
        self.recompute_centrality(graph);

        info!(mean_before, mean_after, scale, "synaptic homeostasis applied");
        HomeostasisReport {
            mean_before,
            mean_after,
            scale,
        }
    }

    /// Recompute degree and the betweenness proxy for every concept.
    pub fn recompute_centrality(&self, graph: &mut AssociationGraph) {
        centrality::recompute(graph, self.config.centrality_neighbor_cap);
    }
}
