//! Operand permutation: relabels A, B and C and routes the instruction to a handler that knows
//! the relabeling.

use crate::context::{HandlerKey, ObfuscationContext};
use crate::engine::{ObfuscationEngine, Strategy};
use murk_core::{Chunk, InstrId, ObfuscationType};
use murk_utils::errors::TransformError;

/// Applies one of the five permutations of the primary operands.
#[derive(Debug, Clone, Copy)]
pub struct Permutation(pub ObfuscationType);

/// `(a, b, c)` after `kind`. Non-permutation kinds leave the operands alone.
pub const fn permute(kind: ObfuscationType, (a, b, c): (i32, i32, i32)) -> (i32, i32, i32) {
    match kind {
        ObfuscationType::SwapAB => (b, a, c),
        ObfuscationType::SwapAC => (c, b, a),
        ObfuscationType::SwapBC => (a, c, b),
        // A→B→C: A's value moves to B, B's to C, C's to A.
        ObfuscationType::RotateABC => (c, a, b),
        // A→C→B: A's value moves to C, C's to B, B's to A.
        ObfuscationType::RotateACB => (b, c, a),
        _ => (a, b, c),
    }
}

impl Strategy for Permutation {
    fn name(&self) -> &'static str {
        "Permutation"
    }

    fn apply(
        &self,
        _engine: &ObfuscationEngine,
        chunk: &mut Chunk,
        at: InstrId,
        ctx: &mut ObfuscationContext,
    ) -> Result<(), TransformError> {
        let opcode = chunk
            .get_instruction(at)
            .ok_or(TransformError::UnknownInstruction(at.raw()))?
            .logical_opcode();
        let id = ctx.virtual_opcode(HandlerKey::Permuted {
            opcode,
            permutation: self.0,
        })?;

        let ins = &mut chunk[at];
        (ins.a, ins.b, ins.c) = permute(self.0, (ins.a, ins.b, ins.c));
        ins.virtual_opcode = Some(id);
        Ok(())
    }
}
