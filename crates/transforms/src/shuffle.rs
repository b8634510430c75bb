use crate::Transform;
use murk_core::cfg_ir::{BlockId, ControlFlow};
use murk_core::{Chunk, Instruction, Opcode};
use murk_utils::errors::TransformError;
use rand::{rngs::StdRng, seq::SliceRandom};
use tracing::debug;

/// Permutes basic blocks, keeping the entry and the final block in place.
///
/// Instructions reference each other by handle, so jumps survive the reorder. Fallthrough is
/// restored with an explicit `Jmp` wherever a block's successor no longer follows it.
pub struct BlockShuffle;

impl BlockShuffle {
    /// Groups blocks that must stay adjacent.
    ///
    /// A filler block belongs to the instruction before it, and the block after a skipping
    /// `LoadBool` must stay where the skip lands.
    fn units(chunk: &Chunk, flow: &ControlFlow) -> Vec<Vec<BlockId>> {
        let mut units: Vec<Vec<BlockId>> = Vec::new();
        let mut glue_next = false;
        for block in flow.blocks() {
            let glued = glue_next
                || block.first().is_some_and(|id| chunk[id].is_data());
            match units.last_mut() {
                Some(unit) if glued => unit.push(block.id),
                _ => units.push(vec![block.id]),
            }
            glue_next = block.last().is_some_and(|id| {
                let ins = &chunk[id];
                ins.logical_opcode() == Opcode::LoadBool && ins.c != 0
            });
        }
        units
    }
}

impl Transform for BlockShuffle {
    fn name(&self) -> &'static str {
        "BlockShuffle"
    }

    fn apply(&self, chunk: &mut Chunk, rng: &mut StdRng) -> Result<bool, TransformError> {
        let flow = ControlFlow::build(chunk)?;
        let mut units = Self::units(chunk, &flow);
        if units.len() < 4 {
            debug!("Not enough blocks to shuffle in `{}`", chunk.name);
            return Ok(false);
        }

        let original: Vec<BlockId> = units.iter().flatten().copied().collect();
        let last = units.len() - 1;
        units[1..last].shuffle(rng);
        let shuffled: Vec<BlockId> = units.iter().flatten().copied().collect();
        if original == shuffled {
            debug!("Shuffle produced no change");
            return Ok(false);
        }

        let mut order = Vec::with_capacity(chunk.len() + shuffled.len());
        let mut bridges = 0;
        for (i, &id) in shuffled.iter().enumerate() {
            let Some(block) = flow.block(id) else {
                continue;
            };
            order.extend_from_slice(&block.instructions);

            let Some(next) = flow.next(id) else {
                continue;
            };
            if shuffled.get(i + 1) == Some(&next) {
                continue;
            }
            let Some(leader) = flow.block(next).and_then(|b| b.first()) else {
                continue;
            };
            let mut bridge = Instruction::asbx(Opcode::Jmp, 0, 0);
            bridge.set_jump_target(leader);
            order.push(chunk.allocate_instruction(bridge));
            bridges += 1;
        }

        chunk.reorder(order);
        chunk.refresh_indices();
        debug!(
            "shuffled {} blocks of `{}`, {} fallthrough bridges",
            shuffled.len(),
            chunk.name,
            bridges
        );
        Ok(true)
    }
}
