/// Module for reconstructing the control-flow graph of a chunk from its flat instruction list.
///
/// The graph is derived data: it partitions the chunk's current instruction ordering into
/// contiguous basic blocks, each tagged with the kind of control transfer that ends it, and links
/// them through fallthrough and jump edges. Any pass that inserts, removes or reorders
/// instructions invalidates it, and the graph has to be rebuilt before its edges are trusted
/// again.
use crate::chunk::{Chunk, InstrId};
use murk_utils::errors::CfgIrError;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use self::builder::build_control_flow;

mod builder;
mod edges;
mod updates;

/// Position-based identifier of a block within one [`ControlFlow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub usize);

impl BlockId {
    /// Id carried by the root sentinel.
    pub const ROOT: Self = Self(usize::MAX);
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ROOT {
            write!(f, "root")
        } else {
            write!(f, "b{}", self.0)
        }
    }
}

/// Kind of control transfer a block ends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockType {
    /// Straight-line code that falls through.
    Straight,
    /// A single unconditional jump.
    Jump,
    /// A test plus the conditional jump it may skip.
    Comparison,
    /// A numeric for-loop prep or step.
    NumericLoop,
    /// A generic for-loop step plus its back jump.
    GenericLoop,
    /// A return or table unpack.
    Return,
    /// A closure plus its upvalue capture instructions.
    Closure,
    /// A fixed-length window of helper scaffolding around a payload instruction.
    Obfuscated,
    /// Sentinel that precedes the first block.
    Root,
}

impl BlockType {
    /// Whether blocks of this type carry an outgoing jump edge.
    pub const fn has_branch(self) -> bool {
        matches!(
            self,
            Self::Jump | Self::NumericLoop | Self::Comparison | Self::GenericLoop
        )
    }
}

/// A contiguous run of one chunk's instructions.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockType,
    pub instructions: Vec<InstrId>,
}

impl Block {
    fn root() -> Self {
        Self {
            id: BlockId::ROOT,
            kind: BlockType::Root,
            instructions: Vec::new(),
        }
    }

    pub fn first(&self) -> Option<InstrId> {
        self.instructions.first().copied()
    }

    pub fn last(&self) -> Option<InstrId> {
        self.instructions.last().copied()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The instruction whose jump reference defines the block's jump edge.
    pub fn branch_instruction(&self) -> Option<InstrId> {
        match self.kind {
            BlockType::Jump | BlockType::NumericLoop => self.instructions.first().copied(),
            BlockType::Comparison | BlockType::GenericLoop => self.instructions.get(1).copied(),
            _ => None,
        }
    }
}

/// Represents the type of edge connecting blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeType {
    /// Execution continues with the block that follows in program order.
    Fallthrough,
    /// Execution continues at the block holding the branch target.
    Jump,
}

/// Control-flow graph of one chunk.
///
/// Blocks are graph nodes, the root sentinel is node 0 and body blocks follow in program order,
/// so a block's id is its position among the body blocks. Incoming-edge sets are the graph's
/// incoming edges.
#[derive(Debug, Clone)]
pub struct ControlFlow {
    /// Graph with blocks as nodes and control transfers as edges.
    pub graph: DiGraph<Block, EdgeType>,
    /// The root sentinel node.
    pub root: NodeIndex,
    nodes: Vec<NodeIndex>,
}

impl ControlFlow {
    /// Analyzes `chunk` and returns its fully linked graph.
    pub fn build(chunk: &mut Chunk) -> Result<Self, CfgIrError> {
        build_control_flow(chunk)
    }

    /// Number of body blocks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Body blocks in program order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.nodes.iter().map(move |&n| &self.graph[n])
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.node(id).map(|n| &self.graph[n])
    }

    /// Graph node of a body block.
    pub fn node(&self, id: BlockId) -> Option<NodeIndex> {
        self.nodes.get(id.0).copied()
    }

    /// The first body block.
    pub fn entry(&self) -> Option<BlockId> {
        self.successor(self.root, EdgeType::Fallthrough)
    }

    /// Fallthrough successor of `id`.
    pub fn next(&self, id: BlockId) -> Option<BlockId> {
        self.node(id)
            .and_then(|n| self.successor(n, EdgeType::Fallthrough))
    }

    /// Jump successor of `id`.
    pub fn jump(&self, id: BlockId) -> Option<BlockId> {
        self.node(id)
            .and_then(|n| self.successor(n, EdgeType::Jump))
    }

    /// Blocks with an edge into `id`, in edge order. The root is reported as [`BlockId::ROOT`].
    pub fn incoming(&self, id: BlockId) -> Vec<BlockId> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        let mut sources: Vec<BlockId> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| self.graph[e.source()].id)
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    /// Instruction handles of all blocks concatenated in id order.
    pub fn flatten(&self) -> Vec<InstrId> {
        self.blocks()
            .flat_map(|b| b.instructions.iter().copied())
            .collect()
    }

    fn successor(&self, node: NodeIndex, kind: EdgeType) -> Option<BlockId> {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .find(|e| *e.weight() == kind)
            .map(|e| self.graph[e.target()].id)
    }
}
