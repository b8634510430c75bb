//! CFG update operations

use crate::chunk::Chunk;
use murk_utils::errors::CfgIrError;

use super::{build_control_flow, BlockId, ControlFlow};

impl ControlFlow {
    /// Points the branch of `block` at the start of `target`.
    ///
    /// The retarget is recorded as a block-level jump on the block's branch instruction and
    /// normalized by the mapping pass, after which jump edges are resolved again.
    ///
    /// # Errors
    /// [`CfgIrError::UnknownBlock`] when either block does not exist and
    /// [`CfgIrError::MissingJumpTarget`] when `block` has no branch instruction.
    pub fn retarget(
        &mut self,
        chunk: &mut Chunk,
        block: BlockId,
        target: BlockId,
    ) -> Result<(), CfgIrError> {
        let source = self.block(block).ok_or(CfgIrError::UnknownBlock(block.0))?;
        if self.block(target).is_none() {
            return Err(CfgIrError::UnknownBlock(target.0));
        }
        let carrier = source
            .branch_instruction()
            .ok_or(CfgIrError::MissingJumpTarget { block: block.0 })?;

        tracing::debug!("Retargeting {} to {}", block, target);
        chunk[carrier].jump_block = Some(target);

        self.map_blocks(chunk)?;
        self.resolve_edges(chunk)
    }

    /// Rebuilds the graph after the chunk's instruction ordering changed.
    pub fn rebuild(&mut self, chunk: &mut Chunk) -> Result<(), CfgIrError> {
        *self = build_control_flow(chunk)?;
        Ok(())
    }
}
