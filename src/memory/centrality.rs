/// Concept regions and centrality metrics.
///
/// Regions are a stable hash partition of concept labels. Betweenness is
/// approximated per node on its ego network (the node plus its heaviest
/// neighbours): for each pair of neighbours that are not directly linked,
/// the node earns `1 / brokers`, where `brokers` counts every node in the
/// ego network that connects the pair in two hops. The sum is normalized
/// by the number of neighbour pairs.
use std::collections::HashMap;

use serde::Serialize;

use crate::memory::association::AssociationGraph;

/// Region of a concept label.
pub fn region_for(label: &str, region_count: u32) -> u32 {
    let hash = blake3::hash(label.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % region_count.max(1) as u64) as u32
}

/// Ego betweenness of `center` given its (capped) neighbour list.
pub fn ego_betweenness(graph: &AssociationGraph, center: &str, ego: &[String]) -> f64 {
    let k = ego.len();
    if k < 2 {
        return 0.0;
    }
    let mut score = 0.0;
    for i in 0..k {
        for j in (i + 1)..k {
            let (a, b) = (&ego[i], &ego[j]);
            if graph.has_edge(a, b) {
                continue;
            }
            let others = ego
                .iter()
                .filter(|c| *c != a && *c != b && c.as_str() != center)
                .filter(|c| graph.has_edge(c, a) && graph.has_edge(c, b))
                .count();
            score += 1.0 / (1 + others) as f64;
        }
    }
    let pairs = (k * (k - 1) / 2) as f64;
    (score / pairs).clamp(0.0, 1.0)
}

/// Refresh degree, weighted degree and betweenness of every node.
pub fn recompute(graph: &mut AssociationGraph, neighbor_cap: usize) {
    let mut computed: HashMap<String, (usize, f64, f64)> = HashMap::with_capacity(graph.node_count());

    for node in graph.nodes() {
        let mut neighbors: Vec<(String, f64)> = graph
            .neighbors(&node.label)
            .map(|n| (n.clone(), graph.weight(&node.label, n)))
            .collect();
        let degree = neighbors.len();
        let weighted: f64 = neighbors.iter().map(|(_, w)| w).sum();

        neighbors.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        neighbors.truncate(neighbor_cap);
        let ego: Vec<String> = neighbors.into_iter().map(|(n, _)| n).collect();

        let betweenness = ego_betweenness(graph, &node.label, &ego);
        computed.insert(node.label.clone(), (degree, weighted, betweenness));
    }

    for node in graph.nodes_mut() {
        if let Some((degree, weighted, betweenness)) = computed.remove(&node.label) {
            node.degree = degree;
            node.weighted_degree = weighted;
            node.betweenness = betweenness;
        }
    }
}

/// Per-region aggregate used by health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionSummary {
    pub region: u32,
    pub concepts: usize,
    pub mean_degree: f64,
    /// Concept with the highest betweenness in the region
    pub hub: Option<String>,
}

/// Summarize every non-empty region, ordered by region id.
pub fn region_summaries(graph: &AssociationGraph) -> Vec<RegionSummary> {
    let mut regions: HashMap<u32, (usize, usize, Option<(f64, String)>)> = HashMap::new();
    for node in graph.nodes() {
        let entry = regions.entry(node.region).or_insert((0, 0, None));
        entry.0 += 1;
        entry.1 += node.degree;
        let better = match &entry.2 {
            None => true,
            Some((b, label)) => {
                node.betweenness > *b || (node.betweenness == *b && node.label < *label)
            }
        };
        if better {
            entry.2 = Some((node.betweenness, node.label.clone()));
        }
    }

    let mut out: Vec<RegionSummary> = regions
        .into_iter()
        .map(|(region, (concepts, degree_sum, hub))| RegionSummary {
            region,
            concepts,
            mean_degree: degree_sum as f64 / concepts as f64,
            hub: hub.map(|(_, label)| label),
        })
        .collect();
    out.sort_by_key(|r| r.region);
    out
}
