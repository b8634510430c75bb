pub mod cfg_ir;
pub mod chunk;
pub mod decoder;
pub mod encoder;
pub mod instruction;
pub mod opcode;

pub use chunk::{Chunk, ChunkId, ConstId, Constant, InstrId};
pub use instruction::{Instruction, ObfuscationType, OffsetMode, Operand, Reference};
pub use opcode::{Opcode, OperandMode, Shape};
