//! Core block splitting and mapping logic

use crate::chunk::{Chunk, InstrId};
use crate::opcode::Opcode;
use murk_utils::errors::CfgIrError;
use petgraph::graph::DiGraph;

use super::{Block, BlockId, BlockType, ControlFlow, EdgeType};

/// Builds the control-flow graph of `chunk`.
///
/// Splits the current instruction ordering into typed blocks, records each instruction's owning
/// block, normalizes pending block-level jumps to instruction-level jumps, adds fallthrough edges
/// and finally resolves jump edges.
///
/// # Errors
/// Fails with a [`CfgIrError`] when the instruction stream violates a structural invariant
/// (truncated comparison, closure or window, unknown window kind, dangling branch).
pub fn build_control_flow(chunk: &mut Chunk) -> Result<ControlFlow, CfgIrError> {
    tracing::debug!(
        "Starting CFG construction for {} with {} instructions",
        chunk.name,
        chunk.len()
    );

    chunk.clear_block_assignments();

    // Step 1: Block splitter
    let pending = split_blocks(chunk)?;
    tracing::debug!("Split into {} blocks", pending.len());

    // Step 2: Nodes in program order behind the root sentinel
    let mut graph = DiGraph::new();
    let root = graph.add_node(Block::root());
    let mut nodes = Vec::with_capacity(pending.len());
    for (idx, (kind, instructions)) in pending.into_iter().enumerate() {
        nodes.push(graph.add_node(Block {
            id: BlockId(idx),
            kind,
            instructions,
        }));
    }
    let mut flow = ControlFlow { graph, root, nodes };

    // Step 3: Mapping pass
    flow.map_blocks(chunk)?;

    // Step 4: Fallthrough edges
    flow.link_fallthrough(chunk);

    // Step 5: Jump edges
    flow.resolve_edges(chunk)?;

    tracing::debug!(
        "Built CFG for {} with {} blocks and {} edges",
        chunk.name,
        flow.len(),
        flow.graph.edge_count()
    );
    Ok(flow)
}

/// Partitions the instruction ordering into `(kind, instructions)` runs in one left-to-right
/// pass.
fn split_blocks(chunk: &Chunk) -> Result<Vec<(BlockType, Vec<InstrId>)>, CfgIrError> {
    let ids = chunk.instruction_ids();
    let mut blocks: Vec<(BlockType, Vec<InstrId>)> = Vec::new();
    let mut i = 0;

    while i < ids.len() {
        let ins = &chunk[ids[i]];
        let opcode = ins.logical_opcode();

        if ins.untouched {
            push_straight(&mut blocks, ids[i]);
            i += 1;
            continue;
        }

        // 1. Fixed-length obfuscated windows
        if opcode.is_window_entry() {
            let len = ins
                .obfuscation
                .filter(|tag| tag.entry_opcode() == Some(opcode))
                .and_then(|tag| tag.window_len())
                .ok_or_else(|| CfgIrError::UnrecognizedGroup {
                    position: i,
                    tag: format!("{:?}", ins.obfuscation),
                })?;
            if i + len > ids.len() {
                return Err(CfgIrError::TruncatedGroup { position: i, len });
            }
            tracing::debug!("Obfuscated group of {} at position {}", len, i);
            blocks.push((BlockType::Obfuscated, ids[i..i + len].to_vec()));
            i += len;
            continue;
        }

        // 2. Tests bundled with their conditional skip
        if opcode.is_comparison() || opcode == Opcode::TForLoop {
            if i + 1 >= ids.len() {
                return Err(CfgIrError::TruncatedBlock {
                    opcode: opcode.to_string(),
                    position: i,
                });
            }
            let kind = if opcode == Opcode::TForLoop {
                BlockType::GenericLoop
            } else {
                BlockType::Comparison
            };
            blocks.push((kind, ids[i..i + 2].to_vec()));
            i += 2;
            continue;
        }

        // 3. Single-instruction control transfers and closures
        match opcode {
            Opcode::Jmp => blocks.push((BlockType::Jump, vec![ids[i]])),
            Opcode::ForPrep | Opcode::ForLoop => blocks.push((BlockType::NumericLoop, vec![ids[i]])),
            Opcode::Return | Opcode::SetList => blocks.push((BlockType::Return, vec![ids[i]])),
            Opcode::Closure => {
                let needed = closure_captures(chunk, ids[i], i)?;
                if i + 1 + needed > ids.len() {
                    return Err(CfgIrError::TruncatedClosure {
                        position: i,
                        needed,
                    });
                }
                blocks.push((BlockType::Closure, ids[i..=i + needed].to_vec()));
                i += 1 + needed;
                continue;
            }
            // 4. Everything else is straight-line code
            _ => push_straight(&mut blocks, ids[i]),
        }
        i += 1;
    }

    Ok(blocks)
}

/// Appends to the current block if it is straight-line, otherwise opens a new one.
fn push_straight(blocks: &mut Vec<(BlockType, Vec<InstrId>)>, id: InstrId) {
    match blocks.last_mut() {
        Some((BlockType::Straight, instructions)) => instructions.push(id),
        _ => blocks.push((BlockType::Straight, vec![id])),
    }
}

/// Number of capture instructions that follow a closure.
fn closure_captures(chunk: &Chunk, id: InstrId, position: usize) -> Result<usize, CfgIrError> {
    let ins = &chunk[id];
    let target = ins.closure_target().or_else(|| {
        usize::try_from(ins.b)
            .ok()
            .and_then(|pos| chunk.child_at(pos))
    });
    target
        .and_then(|child| chunk.child(child))
        .map(|proto| usize::from(proto.upvalue_count))
        .ok_or(CfgIrError::UnresolvedClosure { position })
}

impl ControlFlow {
    /// Records each instruction's owning block and turns pending block-level jumps into
    /// instruction-level jumps to the target block's first instruction.
    pub(crate) fn map_blocks(&self, chunk: &mut Chunk) -> Result<(), CfgIrError> {
        for block in self.blocks() {
            for &id in &block.instructions {
                chunk[id].block = Some(block.id);
            }
        }

        for block in self.blocks() {
            for &id in &block.instructions {
                let Some(target) = chunk[id].jump_block.take() else {
                    continue;
                };
                let leader = self
                    .block(target)
                    .and_then(Block::first)
                    .ok_or(CfgIrError::UnknownBlock(target.0))?;
                tracing::debug!("Normalized jump of {} to {}", block.id, target);
                chunk[id].set_jump_target(leader);
            }
        }
        Ok(())
    }

    fn link_fallthrough(&mut self, chunk: &Chunk) {
        let mut edges = Vec::with_capacity(self.nodes.len() + 1);
        if let Some(&first) = self.nodes.first() {
            edges.push((self.root, first));
        }
        for pair in self.nodes.windows(2) {
            let block = &self.graph[pair[0]];
            // A test may skip its trailing jump.
            let falls_through = matches!(block.kind, BlockType::Comparison | BlockType::GenericLoop)
                || block
                    .last()
                    .is_none_or(|id| chunk[id].logical_opcode().falls_through());
            if falls_through {
                edges.push((pair[0], pair[1]));
            }
        }
        for (from, to) in edges {
            self.graph.add_edge(from, to, EdgeType::Fallthrough);
        }
    }
}
