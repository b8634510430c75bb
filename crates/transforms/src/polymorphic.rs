//! Polymorphic recoding: hides the real opcode behind the shared marker and shifts every operand
//! by a per-instruction offset.

use crate::context::{HandlerKey, ObfuscationContext};
use crate::engine::{ObfuscationEngine, Strategy};
use murk_core::{Chunk, InstrId, OffsetMode, Opcode, Operand};
use murk_utils::errors::TransformError;
use rand::Rng;

/// Largest offset drawn for one instruction.
pub const MAX_OFFSET: i32 = 0x7F;

/// Replaces the opcode with [`Opcode::VmPolymorphic`] and offsets the operands.
#[derive(Debug, Clone, Copy)]
pub struct Polymorphic;

/// A random direction for each operand.
pub fn random_modes<R: Rng>(rng: &mut R) -> [OffsetMode; 5] {
    std::array::from_fn(|_| match rng.random_range(0..3) {
        0 => OffsetMode::Add,
        1 => OffsetMode::Subtract,
        _ => OffsetMode::Skip,
    })
}

impl Strategy for Polymorphic {
    fn name(&self) -> &'static str {
        "Polymorphic"
    }

    fn apply(
        &self,
        _engine: &ObfuscationEngine,
        chunk: &mut Chunk,
        at: InstrId,
        ctx: &mut ObfuscationContext,
    ) -> Result<(), TransformError> {
        let ins = chunk
            .get_instruction(at)
            .ok_or(TransformError::UnknownInstruction(at.raw()))?;
        let opcode = ins.logical_opcode();
        let modes = match ins.offset_modes {
            Some(modes) => modes,
            None => random_modes(&mut ctx.rng),
        };
        let offset = ctx.rng.random_range(1..=MAX_OFFSET);
        let id = ctx.virtual_opcode(HandlerKey::Polymorphic {
            opcode,
            modes,
            offset,
        })?;

        let ins = &mut chunk[at];
        for (operand, mode) in Operand::ALL.into_iter().zip(modes) {
            let value = ins.operand(operand);
            match mode {
                OffsetMode::Add => ins.set_operand(operand, value.wrapping_add(offset)),
                OffsetMode::Subtract => ins.set_operand(operand, value.wrapping_sub(offset)),
                OffsetMode::Skip => {}
            }
        }
        ins.opcode = Opcode::VmPolymorphic;
        ins.substituted = Some(opcode);
        ins.offset_modes = Some(modes);
        ins.virtual_opcode = Some(id);
        Ok(())
    }
}
