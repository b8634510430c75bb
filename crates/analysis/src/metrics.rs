/// Module for computing analytical metrics to evaluate chunk obfuscation passes.
///
/// Quantifies a chunk's control-flow graph by size, block and edge counts, the share of
/// instructions hidden inside obfuscated windows, dominator-tree depth and dominator overlap,
/// and folds them into a composite potency score. Passes compare the score before and after they
/// run to decide whether to keep their result.
///
/// # Usage
/// ```rust,ignore
/// let flow = build_control_flow(&mut chunk)?;
/// let metrics = metrics::collect_metrics(&flow)?;
/// tracing::info!("potency {:.2}", metrics.potency);
/// ```
use murk_core::cfg_ir::{Block, BlockType, ControlFlow, EdgeType};
use murk_utils::errors::MetricsError;
use petgraph::{
    algo::dominators::{simple_fast, Dominators},
    graph::{DiGraph, NodeIndex},
    visit::Reversed,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Represents a set of analytical metrics for one chunk's control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Number of instructions across all body blocks.
    pub instruction_cnt: usize,
    /// Number of body blocks (the root sentinel excluded).
    pub block_cnt: usize,
    /// Number of edges, root edge included.
    pub edge_cnt: usize,
    /// Body blocks per block type.
    pub block_types: BTreeMap<BlockType, usize>,
    /// Instructions inside obfuscated windows.
    pub obfuscated_cnt: usize,
    /// Body blocks reachable from the root.
    pub reachable_cnt: usize,
    /// Depth of the deepest node in the dominator tree.
    pub max_dom_depth: usize,
    /// Fraction of nodes whose immediate dominator is also their immediate post-dominator.
    pub dom_overlap: f64,
    /// Composite potency score.
    pub potency: f64,
}

/// Collects metrics from a built control-flow graph.
///
/// # Errors
/// [`MetricsError::EmptyCfg`] for a graph without nodes and [`MetricsError::NoBodyBlocks`] for a
/// graph that only holds the root sentinel.
pub fn collect_metrics(flow: &ControlFlow) -> Result<Metrics, MetricsError> {
    if flow.graph.node_count() == 0 {
        return Err(MetricsError::EmptyCfg);
    }
    if flow.is_empty() {
        return Err(MetricsError::NoBodyBlocks);
    }

    let mut block_types = BTreeMap::new();
    let mut instruction_cnt = 0;
    let mut obfuscated_cnt = 0;
    for block in flow.blocks() {
        *block_types.entry(block.kind).or_insert(0) += 1;
        instruction_cnt += block.len();
        if block.kind == BlockType::Obfuscated {
            obfuscated_cnt += block.len();
        }
    }

    let doms = simple_fast(&flow.graph, flow.root);
    let reachable_cnt = flow
        .blocks()
        .filter_map(|b| flow.node(b.id))
        .filter(|&n| doms.dominators(n).is_some())
        .count();
    let max_dom_depth = max_depth(&flow.graph, &doms);

    let (dom_map, pdom_map) = dominator_pairs(&flow.graph, &doms);
    let overlap = dom_overlap(&dom_map, &pdom_map);
    let block_cnt = flow.len();
    let edge_cnt = flow.graph.edge_count();

    tracing::debug!(
        "metrics: {} blocks, {} edges, {} obfuscated instructions, dom depth {}",
        block_cnt,
        edge_cnt,
        obfuscated_cnt,
        max_dom_depth
    );

    Ok(Metrics {
        instruction_cnt,
        block_cnt,
        edge_cnt,
        block_types,
        obfuscated_cnt,
        reachable_cnt,
        max_dom_depth,
        dom_overlap: overlap,
        potency: score(overlap, block_cnt, edge_cnt, obfuscated_cnt),
    })
}

fn max_depth(g: &DiGraph<Block, EdgeType>, doms: &Dominators<NodeIndex>) -> usize {
    g.node_indices()
        .filter_map(|n| doms.dominators(n).map(|chain| chain.count().saturating_sub(1)))
        .max()
        .unwrap_or(0)
}

type DominatorMap = HashMap<NodeIndex, NodeIndex>;

/// Immediate dominators from the root and immediate post-dominators from the last body block.
fn dominator_pairs(
    g: &DiGraph<Block, EdgeType>,
    doms: &Dominators<NodeIndex>,
) -> (DominatorMap, DominatorMap) {
    let dom_map = g
        .node_indices()
        .filter_map(|n| doms.immediate_dominator(n).map(|idom| (n, idom)))
        .collect();

    let exit = NodeIndex::new(g.node_count() - 1);
    let post = simple_fast(Reversed(g), exit);
    let pdom_map = g
        .node_indices()
        .filter_map(|n| post.immediate_dominator(n).map(|ipdom| (n, ipdom)))
        .collect();

    (dom_map, pdom_map)
}

fn dom_overlap(doms: &DominatorMap, pdoms: &DominatorMap) -> f64 {
    let common = doms
        .iter()
        .filter(|(n, d)| pdoms.get(*n) == Some(*d))
        .count();
    if doms.is_empty() {
        0.0
    } else {
        common as f64 / doms.len() as f64
    }
}

/// Heuristic analyst-effort score: more blocks, edges and hidden instructions raise it, a linear
/// dominator structure lowers it.
fn score(overlap: f64, nodes: usize, edges: usize, obfuscated: usize) -> f64 {
    5.0 * (nodes as f64).log2() + edges as f64 + 2.0 * obfuscated as f64 + 30.0 * (1.0 - overlap)
}

/// Potency gained by going from `before` to `after`, discounted by instruction growth.
pub fn compare(before: &Metrics, after: &Metrics) -> f64 {
    after.potency
        - before.potency
        - 0.25 * (after.instruction_cnt as f64 - before.instruction_cnt as f64)
}
