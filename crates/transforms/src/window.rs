//! Structural window strategies.
//!
//! A window is a fixed run of instructions starting at an entry pseudo-instruction. One slot holds
//! the real (payload) instruction, the others are helper scaffolding. At serialization time the
//! entry learns how far to skip, the payload is mutated first if it is tagged itself, and its
//! opcode id is handed to a helper so the interpreter only learns the real operation at run time.

use crate::context::ObfuscationContext;
use crate::engine::{ObfuscationEngine, Strategy};
use murk_core::instruction::RK_BIAS;
use murk_core::{Chunk, InstrId, Instruction, ObfuscationType, Opcode, Operand};
use murk_utils::errors::TransformError;
use rand::Rng;

/// Fixed layout of one window kind, as offsets from the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLayout {
    pub kind: ObfuscationType,
    pub len: usize,
    /// Offset of the payload instruction.
    pub payload: usize,
    /// Helper offset and operand receiving the payload's opcode id.
    pub opcode_slot: (usize, Operand),
    /// Payload operand replaced by a decoy, and the helper offset its real value is copied to.
    pub decoy: Option<(Operand, usize)>,
    /// Helper opcodes for every non-entry, non-payload slot, in order.
    pub helpers: &'static [Opcode],
}

pub const REDIRECT: WindowLayout = WindowLayout {
    kind: ObfuscationType::Redirect,
    len: 4,
    payload: 2,
    opcode_slot: (1, Operand::C),
    decoy: None,
    helpers: &[Opcode::VmOpcodeHolder, Opcode::VmResume],
};

pub const REGISTER_RELOAD: WindowLayout = WindowLayout {
    kind: ObfuscationType::RegisterReload,
    len: 4,
    payload: 1,
    opcode_slot: (3, Operand::B),
    decoy: Some((Operand::A, 2)),
    helpers: &[Opcode::VmReload, Opcode::VmOpcodeHolder],
};

pub const RESET_OPCODE_DATA: WindowLayout = WindowLayout {
    kind: ObfuscationType::ResetOpcodeData,
    len: 6,
    payload: 3,
    opcode_slot: (1, Operand::A),
    decoy: Some((Operand::B, 2)),
    helpers: &[
        Opcode::VmOpcodeHolder,
        Opcode::VmReset,
        Opcode::VmNop,
        Opcode::VmResume,
    ],
};

pub const DYNAMIC_HANDLER: WindowLayout = WindowLayout {
    kind: ObfuscationType::DynamicHandler,
    len: 6,
    payload: 4,
    opcode_slot: (1, Operand::F),
    decoy: Some((Operand::C, 3)),
    helpers: &[
        Opcode::VmOpcodeHolder,
        Opcode::VmNop,
        Opcode::VmReload,
        Opcode::VmResume,
    ],
};

impl WindowLayout {
    pub const fn of(kind: ObfuscationType) -> Option<Self> {
        match kind {
            ObfuscationType::Redirect => Some(REDIRECT),
            ObfuscationType::RegisterReload => Some(REGISTER_RELOAD),
            ObfuscationType::ResetOpcodeData => Some(RESET_OPCODE_DATA),
            ObfuscationType::DynamicHandler => Some(DYNAMIC_HANDLER),
            _ => None,
        }
    }

    /// Entry skip distance: from the entry past the last window slot.
    pub const fn skip_distance(&self) -> i32 {
        self.len as i32 - 1
    }

    /// Allocates the entry and helpers around `payload` and returns the window in order.
    ///
    /// The handles are allocated but not placed; the caller splices them into the ordering.
    pub fn scaffold(&self, chunk: &mut Chunk, payload: InstrId) -> Vec<InstrId> {
        let mut entry = Instruction::abc(Opcode::VmRedirect, 0, 0, 0);
        if let Some(opcode) = self.kind.entry_opcode() {
            entry.opcode = opcode;
        }
        entry.obfuscation = Some(self.kind);

        let mut window = Vec::with_capacity(self.len);
        window.push(chunk.allocate_instruction(entry));
        let mut helpers = self.helpers.iter();
        for offset in 1..self.len {
            if offset == self.payload {
                window.push(payload);
            } else if let Some(&opcode) = helpers.next() {
                window.push(chunk.allocate_instruction(Instruction::abc(opcode, 0, 0, 0)));
            }
        }
        window
    }
}

/// Strategy for one window kind.
#[derive(Debug, Clone, Copy)]
pub struct Window(pub WindowLayout);

impl Window {
    pub const fn new(kind: ObfuscationType) -> Option<Self> {
        match WindowLayout::of(kind) {
            Some(layout) => Some(Self(layout)),
            None => None,
        }
    }
}

impl Strategy for Window {
    fn name(&self) -> &'static str {
        match self.0.kind {
            ObfuscationType::Redirect => "Redirect",
            ObfuscationType::RegisterReload => "RegisterReload",
            ObfuscationType::ResetOpcodeData => "ResetOpcodeData",
            _ => "DynamicHandler",
        }
    }

    fn apply(
        &self,
        engine: &ObfuscationEngine,
        chunk: &mut Chunk,
        at: InstrId,
        ctx: &mut ObfuscationContext,
    ) -> Result<(), TransformError> {
        let layout = &self.0;
        let position = chunk
            .position(at)
            .ok_or(TransformError::UnknownInstruction(at.raw()))?;
        let window = (0..layout.len)
            .map(|k| chunk.instruction_at(position + k))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TransformError::TruncatedWindow {
                kind: layout.kind.to_string(),
                position,
                len: layout.len,
            })?;
        let payload = window[layout.payload];

        chunk[at].b = layout.skip_distance();

        if !chunk[payload].mutated {
            chunk.update_references(payload)?;
            engine.mutate(chunk, payload, ctx)?;
        }
        {
            let ins = &mut chunk[payload];
            ins.untouched = true;
            ins.mutated = true;
            ins.skip = true;
        }

        let opcode_id = chunk[payload].emitted_opcode();
        let (slot, operand) = layout.opcode_slot;
        chunk[window[slot]].set_operand(operand, opcode_id as i32);

        if let Some((operand, slot)) = layout.decoy {
            let real = chunk[payload].operand(operand);
            chunk[window[slot]].set_operand(operand, real);
            let decoy = ctx.rng.random_range(0..RK_BIAS);
            chunk[payload].set_operand(operand, decoy);
        }

        tracing::trace!(
            "{} window at {} carries opcode {}",
            layout.kind,
            position,
            opcode_id
        );
        Ok(())
    }
}
