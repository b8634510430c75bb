//! The mutable instruction node and the conversions between raw operands and symbolic
//! references.

use crate::cfg_ir::BlockId;
use crate::chunk::{ChunkId, ConstId, IndexView, InstrId};
use crate::opcode::{Opcode, OperandMode, Shape};
use murk_utils::errors::ReferenceError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bias that distinguishes constant-pool operands from register operands in RK slots.
pub const RK_BIAS: i32 = 256;

/// Value seeded into the primary operands of a freshly constructed instruction.
///
/// An operand still holding it when the serializer writes it means a reference was never
/// resolved; debug builds assert on that.
pub const UNSET_OPERAND: i32 = i32::MIN;

/// One of the five operand slots of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    A,
    B,
    C,
    E,
    F,
}

impl Operand {
    /// All operand slots in wire order.
    pub const ALL: [Self; 5] = [Self::A, Self::B, Self::C, Self::E, Self::F];
}

/// Symbolic target of a B or C operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A slot in the owning chunk's constant pool.
    Constant(ConstId),
    /// Another instruction of the owning chunk (jump and loop targets).
    Instruction(InstrId),
    /// A nested prototype of the owning chunk (closures).
    Chunk(ChunkId),
}

/// Obfuscation strategy assigned to an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObfuscationType {
    SwapAB,
    SwapAC,
    SwapBC,
    RotateABC,
    RotateACB,
    Polymorphic,
    Redirect,
    RegisterReload,
    ResetOpcodeData,
    DynamicHandler,
}

impl ObfuscationType {
    /// The five operand permutations.
    pub const PERMUTATIONS: [Self; 5] = [
        Self::SwapAB,
        Self::SwapAC,
        Self::SwapBC,
        Self::RotateABC,
        Self::RotateACB,
    ];

    /// The four structural window kinds.
    pub const WINDOWS: [Self; 4] = [
        Self::Redirect,
        Self::RegisterReload,
        Self::ResetOpcodeData,
        Self::DynamicHandler,
    ];

    /// Length of the helper window, for structural kinds.
    pub const fn window_len(self) -> Option<usize> {
        match self {
            Self::Redirect | Self::RegisterReload => Some(4),
            Self::ResetOpcodeData | Self::DynamicHandler => Some(6),
            _ => None,
        }
    }

    /// Pseudo-opcode of the entry instruction, for structural kinds.
    pub const fn entry_opcode(self) -> Option<Opcode> {
        match self {
            Self::Redirect => Some(Opcode::VmRedirect),
            Self::RegisterReload => Some(Opcode::VmRegisterReload),
            Self::ResetOpcodeData => Some(Opcode::VmResetOpcodeData),
            Self::DynamicHandler => Some(Opcode::VmDynamicHandler),
            _ => None,
        }
    }

    pub const fn is_permutation(self) -> bool {
        matches!(
            self,
            Self::SwapAB | Self::SwapAC | Self::SwapBC | Self::RotateABC | Self::RotateACB
        )
    }
}

impl fmt::Display for ObfuscationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-operand direction of the polymorphic offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OffsetMode {
    Add,
    Subtract,
    Skip,
}

/// A single bytecode operation of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Opcode as it will be serialized (a marker opcode once polymorphic recoding ran).
    pub opcode: Opcode,
    pub a: i32,
    pub b: i32,
    pub c: i32,
    /// VM extension field, 16 bits on the wire.
    pub e: i32,
    /// VM extension field, 32 bits on the wire.
    pub f: i32,
    /// Symbolic meaning of B, if it refers to something.
    pub b_ref: Option<Reference>,
    /// Symbolic meaning of C, if it refers to something.
    pub c_ref: Option<Reference>,
    /// Owning block of the most recent control-flow build.
    pub block: Option<BlockId>,
    /// Pending block-level jump, normalized to an instruction jump by the CFG mapping pass.
    pub jump_block: Option<BlockId>,
    /// Set once the obfuscation engine has processed the instruction.
    pub mutated: bool,
    /// Repurposed as window payload; ordinary flow analysis ignores its branch.
    pub untouched: bool,
    /// Serialized with the skip flag in its shape byte.
    pub skip: bool,
    pub obfuscation: Option<ObfuscationType>,
    /// Per-operand directions for polymorphic recoding, in A/B/C/E/F order.
    pub offset_modes: Option<[OffsetMode; 5]>,
    /// Real opcode hidden behind a marker opcode.
    pub substituted: Option<Opcode>,
    /// Id written instead of the real opcode id.
    pub virtual_opcode: Option<u32>,
}

impl Instruction {
    /// Creates an instruction whose primary operands are still unset.
    pub const fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            a: UNSET_OPERAND,
            b: UNSET_OPERAND,
            c: UNSET_OPERAND,
            e: 0,
            f: 0,
            b_ref: None,
            c_ref: None,
            block: None,
            jump_block: None,
            mutated: false,
            untouched: false,
            skip: false,
            obfuscation: None,
            offset_modes: None,
            substituted: None,
            virtual_opcode: None,
        }
    }

    pub const fn abc(opcode: Opcode, a: i32, b: i32, c: i32) -> Self {
        let mut ins = Self::new(opcode);
        ins.a = a;
        ins.b = b;
        ins.c = c;
        ins
    }

    pub const fn abx(opcode: Opcode, a: i32, bx: i32) -> Self {
        Self::abc(opcode, a, bx, 0)
    }

    pub const fn asbx(opcode: Opcode, a: i32, sbx: i32) -> Self {
        Self::abc(opcode, a, sbx, 0)
    }

    /// A filler instruction.
    pub const fn data() -> Self {
        Self::abc(Opcode::Data, 0, 0, 0)
    }

    pub const fn shape(&self) -> Shape {
        self.opcode.shape()
    }

    pub const fn is_data(&self) -> bool {
        matches!(self.opcode.shape(), Shape::Data)
    }

    /// The operation the instruction performs, looking through a polymorphic marker.
    pub fn logical_opcode(&self) -> Opcode {
        self.substituted.unwrap_or(self.opcode)
    }

    /// The opcode id written to the wire.
    pub fn emitted_opcode(&self) -> u32 {
        self.virtual_opcode
            .unwrap_or_else(|| u32::from(self.opcode.id()))
    }

    pub const fn operand(&self, operand: Operand) -> i32 {
        match operand {
            Operand::A => self.a,
            Operand::B => self.b,
            Operand::C => self.c,
            Operand::E => self.e,
            Operand::F => self.f,
        }
    }

    pub fn set_operand(&mut self, operand: Operand, value: i32) {
        match operand {
            Operand::A => self.a = value,
            Operand::B => self.b = value,
            Operand::C => self.c = value,
            Operand::E => self.e = value,
            Operand::F => self.f = value,
        }
    }

    /// The instruction this one jumps to, if it is a resolved branch.
    pub fn jump_target(&self) -> Option<InstrId> {
        match self.b_ref {
            Some(Reference::Instruction(id)) => Some(id),
            _ => None,
        }
    }

    pub fn set_jump_target(&mut self, target: InstrId) {
        self.b_ref = Some(Reference::Instruction(target));
    }

    /// The nested prototype a closure instantiates.
    pub fn closure_target(&self) -> Option<ChunkId> {
        match self.b_ref {
            Some(Reference::Chunk(id)) => Some(id),
            _ => None,
        }
    }

    /// Operands that the instruction's shape writes to the wire.
    pub const fn written_operands(&self) -> &'static [Operand] {
        match self.opcode.shape() {
            Shape::ABC | Shape::AsBxC => &Operand::ALL,
            Shape::ABx | Shape::AsBx => &[Operand::A, Operand::B],
            Shape::Data => &[],
        }
    }

    /// Whether any operand the shape writes still holds [`UNSET_OPERAND`].
    pub fn has_unset_operand(&self) -> bool {
        self.written_operands()
            .iter()
            .any(|&op| self.operand(op) == UNSET_OPERAND)
    }

    /// Populates the symbolic references from raw B and C.
    ///
    /// Best-effort: an operand whose raw value does not resolve against `view` keeps its raw
    /// value and gets no reference; the first such failure is returned after both operands were
    /// tried.
    pub fn setup_references(
        &mut self,
        position: usize,
        view: &IndexView<'_>,
    ) -> Result<(), ReferenceError> {
        let opcode = self.logical_opcode();
        let b = decode_operand(opcode.b_mode(), self.b, position, view);
        let c = decode_operand(opcode.c_mode(), self.c, position, view);

        let mut first_err = None;
        match b {
            Ok(Some(reference)) => self.b_ref = Some(reference),
            Ok(None) => {}
            Err(e) => first_err = Some(e),
        }
        match c {
            Ok(Some(reference)) => self.c_ref = Some(reference),
            Ok(None) => {}
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Recomputes raw B and C from the symbolic references and the current index maps.
    ///
    /// An operand whose reference cannot be found keeps its previous value and the error is
    /// returned.
    pub fn update_references(
        &mut self,
        position: usize,
        view: &IndexView<'_>,
    ) -> Result<(), ReferenceError> {
        let opcode = self.logical_opcode();
        if let Some(reference) = self.b_ref {
            self.b = encode_operand(opcode.b_mode(), reference, position, view)?;
        }
        if let Some(reference) = self.c_ref {
            self.c = encode_operand(opcode.c_mode(), reference, position, view)?;
        }
        Ok(())
    }
}

fn decode_operand(
    mode: OperandMode,
    raw: i32,
    position: usize,
    view: &IndexView<'_>,
) -> Result<Option<Reference>, ReferenceError> {
    if raw == UNSET_OPERAND {
        return Ok(None);
    }
    match mode {
        OperandMode::Constant => constant_at(raw, view).map(Some),
        OperandMode::RegisterOrConstant if raw >= RK_BIAS => {
            constant_at(raw - RK_BIAS, view).map(Some)
        }
        OperandMode::Jump => {
            let target = position as i64 + i64::from(raw) + 1;
            usize::try_from(target)
                .ok()
                .and_then(|pos| view.instruction_at(pos))
                .map(|id| Some(Reference::Instruction(id)))
                .ok_or(ReferenceError::Instruction(target as u32))
        }
        OperandMode::Prototype => usize::try_from(raw)
            .ok()
            .and_then(|pos| view.chunk_at(pos))
            .map(|id| Some(Reference::Chunk(id)))
            .ok_or(ReferenceError::Chunk(raw as u32)),
        _ => Ok(None),
    }
}

fn constant_at(raw: i32, view: &IndexView<'_>) -> Result<Reference, ReferenceError> {
    usize::try_from(raw)
        .ok()
        .and_then(|pos| view.constant_at(pos))
        .map(Reference::Constant)
        .ok_or(ReferenceError::Constant(raw as u32))
}

fn encode_operand(
    mode: OperandMode,
    reference: Reference,
    position: usize,
    view: &IndexView<'_>,
) -> Result<i32, ReferenceError> {
    match reference {
        Reference::Constant(id) => {
            let slot = view
                .constant_position(id)
                .ok_or(ReferenceError::Constant(id.raw()))? as i32;
            if mode == OperandMode::RegisterOrConstant {
                Ok(slot + RK_BIAS)
            } else {
                Ok(slot)
            }
        }
        Reference::Instruction(id) => {
            let target = view
                .instruction_position(id)
                .ok_or(ReferenceError::Instruction(id.raw()))?;
            Ok(target as i32 - position as i32 - 1)
        }
        Reference::Chunk(id) => view
            .chunk_position(id)
            .map(|pos| pos as i32)
            .ok_or(ReferenceError::Chunk(id.raw())),
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape() {
            Shape::Data => write!(f, "{:<14}", self.opcode),
            Shape::ABx | Shape::AsBx => write!(f, "{:<14} {} {}", self.opcode, self.a, self.b),
            Shape::ABC | Shape::AsBxC => {
                write!(f, "{:<14} {} {} {}", self.opcode, self.a, self.b, self.c)?;
                if self.e != 0 || self.f != 0 {
                    write!(f, " [{} {}]", self.e, self.f)?;
                }
                Ok(())
            }
        }
    }
}
