/// Module defining the logical opcode set of the register-based Lua VM and its static encoding
/// catalog.
///
/// Every opcode maps to exactly one [`Shape`], which fixes how its operands are laid out on the
/// wire, and to an [`OperandMode`] for its B and C operands, which tells the reference decoder
/// whether a raw operand is a register, a constant-pool slot, a jump displacement or a nested
/// prototype index. The catalog is total: anything not listed explicitly falls back to the
/// `ABC` shape and `Value` operands, which is what the VM-internal pseudo-opcodes rely on.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operand-encoding layout of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// Three short operands plus the two extension fields E and F.
    ABC,
    /// One wide unsigned operand.
    ABx,
    /// One wide signed operand.
    AsBx,
    /// Wide signed operand plus C and the extension fields.
    AsBxC,
    /// Opaque filler, no operands.
    Data,
}

impl Shape {
    /// Numeric tag written (shifted left by one) in front of every serialized instruction.
    pub const fn tag(self) -> u8 {
        match self {
            Self::ABC => 0,
            Self::ABx => 1,
            Self::AsBx => 2,
            Self::AsBxC => 3,
            Self::Data => 4,
        }
    }

    /// Inverse of [`Shape::tag`].
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::ABC),
            1 => Some(Self::ABx),
            2 => Some(Self::AsBx),
            3 => Some(Self::AsBxC),
            4 => Some(Self::Data),
            _ => None,
        }
    }

    /// Number of bytes an instruction of this shape occupies after its opcode varint.
    pub const fn operand_len(self) -> usize {
        match self {
            // A(2) + B(3) + C(3) + E(2) + F(4)
            Self::ABC => 14,
            // A(2) + Bx(4)
            Self::ABx => 6,
            // A(2) + sBx(4)
            Self::AsBx => 6,
            // A(2) + sBx(4) + C(3) + E(2) + F(4)
            Self::AsBxC => 15,
            Self::Data => 0,
        }
    }
}

/// How the raw value of a B or C operand is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandMode {
    /// Operand is not used by the opcode.
    Unused,
    /// Register index.
    Register,
    /// Plain immediate (counts, flags, upvalue indices).
    Value,
    /// Constant-pool index.
    Constant,
    /// Register, or constant-pool index biased by [`crate::instruction::RK_BIAS`].
    RegisterOrConstant,
    /// Signed displacement relative to the following instruction.
    Jump,
    /// Index into the nested chunk list.
    Prototype,
}

/// Logical bytecode operation.
///
/// The first block mirrors the Lua 5.1 instruction set extended with the 5.3 integer-division and
/// bitwise operations. `Data` is the operand-less filler that follows a table-unpack with an
/// out-of-line count. The `Vm*` variants only exist inside the generated interpreter: window entry
/// and helper scaffolding placed by the VM generator, and the shared polymorphic marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    Move,
    LoadConst,
    LoadBool,
    LoadNil,
    GetUpval,
    GetGlobal,
    GetTable,
    SetGlobal,
    SetUpval,
    SetTable,
    NewTable,
    Method,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    Not,
    BNot,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForLoop,
    SetList,
    Close,
    Closure,
    VarArg,
    Data,
    VmPolymorphic,
    VmRedirect,
    VmRegisterReload,
    VmResetOpcodeData,
    VmDynamicHandler,
    VmOpcodeHolder,
    VmReload,
    VmReset,
    VmResume,
    VmNop,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Opcode {
    /// Every opcode, ordered by id.
    pub const ALL: [Self; 56] = [
        Self::Move,
        Self::LoadConst,
        Self::LoadBool,
        Self::LoadNil,
        Self::GetUpval,
        Self::GetGlobal,
        Self::GetTable,
        Self::SetGlobal,
        Self::SetUpval,
        Self::SetTable,
        Self::NewTable,
        Self::Method,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Pow,
        Self::IDiv,
        Self::BAnd,
        Self::BOr,
        Self::BXor,
        Self::Shl,
        Self::Shr,
        Self::Unm,
        Self::Not,
        Self::BNot,
        Self::Len,
        Self::Concat,
        Self::Jmp,
        Self::Eq,
        Self::Lt,
        Self::Le,
        Self::Test,
        Self::TestSet,
        Self::Call,
        Self::TailCall,
        Self::Return,
        Self::ForLoop,
        Self::ForPrep,
        Self::TForLoop,
        Self::SetList,
        Self::Close,
        Self::Closure,
        Self::VarArg,
        Self::Data,
        Self::VmPolymorphic,
        Self::VmRedirect,
        Self::VmRegisterReload,
        Self::VmResetOpcodeData,
        Self::VmDynamicHandler,
        Self::VmOpcodeHolder,
        Self::VmReload,
        Self::VmReset,
        Self::VmResume,
        Self::VmNop,
    ];

    /// Number of real opcode ids. Virtual ids are allocated above this.
    pub const COUNT: u32 = Self::ALL.len() as u32;

    /// The opcode's real numeric id.
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Looks an opcode up by its real id.
    pub fn from_id(id: u32) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| Self::ALL.get(idx))
            .copied()
    }

    /// Returns the wire shape of the opcode.
    pub const fn shape(self) -> Shape {
        use Opcode::*;

        match self {
            LoadConst | GetGlobal | SetGlobal | Closure => Shape::ABx,
            Jmp | ForLoop | ForPrep => Shape::AsBx,
            VmRedirect | VmRegisterReload | VmResetOpcodeData | VmDynamicHandler => Shape::AsBxC,
            Data => Shape::Data,
            _ => Shape::ABC,
        }
    }

    /// Interpretation of operand B.
    pub const fn b_mode(self) -> OperandMode {
        use Opcode::*;

        match self {
            Move | LoadNil | GetTable | Method | Unm | Not | BNot | Len | Concat | TestSet => {
                OperandMode::Register
            }
            LoadConst | GetGlobal | SetGlobal => OperandMode::Constant,
            SetTable | Add | Sub | Mul | Div | Mod | Pow | IDiv | BAnd | BOr | BXor | Shl | Shr
            | Eq | Lt | Le => OperandMode::RegisterOrConstant,
            Jmp | ForLoop | ForPrep => OperandMode::Jump,
            Closure => OperandMode::Prototype,
            Close | Test | TForLoop | Data => OperandMode::Unused,
            _ => OperandMode::Value,
        }
    }

    /// Interpretation of operand C.
    pub const fn c_mode(self) -> OperandMode {
        use Opcode::*;

        match self {
            GetTable | SetTable | Method | Add | Sub | Mul | Div | Mod | Pow | IDiv | BAnd | BOr
            | BXor | Shl | Shr | Eq | Lt | Le => OperandMode::RegisterOrConstant,
            Concat => OperandMode::Register,
            Move | LoadConst | LoadNil | GetUpval | GetGlobal | SetGlobal | SetUpval | Unm | Not
            | BNot | Len | Jmp | Return | ForLoop | ForPrep | Close | Closure | VarArg | Data => {
                OperandMode::Unused
            }
            _ => OperandMode::Value,
        }
    }

    /// Conditional tests that skip the following instruction.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Lt | Self::Le | Self::Test | Self::TestSet
        )
    }

    /// Entry pseudo-instruction of a fixed-length obfuscated window.
    pub const fn is_window_entry(self) -> bool {
        matches!(
            self,
            Self::VmRedirect | Self::VmRegisterReload | Self::VmResetOpcodeData | Self::VmDynamicHandler
        )
    }

    /// Whether execution can continue with the next instruction in sequence.
    pub const fn falls_through(self) -> bool {
        !matches!(self, Self::Jmp | Self::ForPrep | Self::Return)
    }

    /// Whether the opcode carries a jump displacement in operand B.
    pub const fn is_branch(self) -> bool {
        matches!(self.b_mode(), OperandMode::Jump)
    }

    /// VM-internal pseudo-opcodes that never appear in compiler output.
    pub const fn is_internal(self) -> bool {
        (self as u16) >= (Self::VmPolymorphic as u16)
    }
}
