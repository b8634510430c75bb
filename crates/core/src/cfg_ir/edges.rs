//! Jump edge resolution

use crate::chunk::Chunk;
use murk_utils::errors::CfgIrError;

use super::{BlockId, ControlFlow, EdgeType};

impl ControlFlow {
    /// Recomputes every jump edge from the branch instructions' resolved targets.
    ///
    /// Fallthrough edges are left alone. Branch carriers flagged `untouched` are window payloads
    /// and contribute no edge.
    ///
    /// # Errors
    /// [`CfgIrError::MissingJumpTarget`] when a branch carrier has no resolved target and
    /// [`CfgIrError::UnmappedJumpTarget`] when the target has no owning block in this graph. Both
    /// abort the pass; the graph is left without jump edges.
    pub fn resolve_edges(&mut self, chunk: &Chunk) -> Result<(), CfgIrError> {
        self.graph
            .retain_edges(|g, e| g[e] != EdgeType::Jump);

        let mut edges = Vec::new();
        for block in self.blocks() {
            if !block.kind.has_branch() {
                continue;
            }
            let Some(carrier) = block.branch_instruction() else {
                continue;
            };
            let ins = &chunk[carrier];
            if ins.untouched {
                continue;
            }

            let target = ins
                .jump_target()
                .ok_or(CfgIrError::MissingJumpTarget { block: block.id.0 })?;
            let target_block = chunk[target]
                .block
                .filter(|id| id.0 < self.len())
                .ok_or(CfgIrError::UnmappedJumpTarget { block: block.id.0 })?;

            tracing::debug!("Jump edge {} -> {}", block.id, target_block);
            edges.push((block.id, target_block));
        }

        for (from, to) in edges {
            self.link(from, to, EdgeType::Jump)?;
        }
        Ok(())
    }

    fn link(&mut self, from: BlockId, to: BlockId, kind: EdgeType) -> Result<(), CfgIrError> {
        let source = self.node(from).ok_or(CfgIrError::UnknownBlock(from.0))?;
        let target = self.node(to).ok_or(CfgIrError::UnknownBlock(to.0))?;
        self.graph.add_edge(source, target, kind);
        Ok(())
    }
}
