//! Wire primitives shared by the serializer and the reference reader.
//!
//! Every byte that goes through a [`ByteWriter`] is XOR-masked with the writer's key. Multi-byte
//! fields are little-endian. Operand fields carry the low bits of the operand; the interpreter
//! reads them modulo the field width.

use crate::chunk::Constant;
use crate::instruction::Instruction;
use crate::opcode::Shape;
use serde::{Deserialize, Serialize};

/// Bias added to signed wide operands before they are written as unsigned.
pub const SBX_BIAS: i32 = 1 << 16;

/// Low bit of the shape byte, set on instructions serialized as no-ops after their mutation.
pub const SKIP_FLAG: u8 = 1;

/// The complete encoding of a filler instruction.
pub const DATA_BYTE: u8 = Shape::Data.tag() << 1;

/// One section of a serialized chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkStep {
    /// Parameter count, one byte.
    ParameterCount,
    /// Upvalue count, one byte.
    UpvalueCount,
    /// Vararg flag, one byte.
    Vararg,
    /// Maximum stack size, one byte.
    MaxStackSize,
    /// First and last defined line, LEB128 each.
    LineInfo,
    /// Constant pool.
    Constants,
    /// Instruction list.
    Instructions,
    /// Nested prototypes.
    Chunks,
}

impl ChunkStep {
    /// Step order used when a format does not configure one.
    pub const DEFAULT_ORDER: [Self; 4] = [
        Self::ParameterCount,
        Self::Constants,
        Self::Instructions,
        Self::Chunks,
    ];
}

/// Type tags written in front of each constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantTags {
    pub nil: u8,
    pub boolean: u8,
    pub number: u8,
    pub string: u8,
    /// Pre-encrypted string, written as a placeholder only.
    pub tampered: u8,
}

impl Default for ConstantTags {
    fn default() -> Self {
        Self {
            nil: 0,
            boolean: 1,
            number: 3,
            string: 4,
            tampered: 5,
        }
    }
}

impl ConstantTags {
    /// Tag written for `constant`.
    pub const fn tag_of(&self, constant: &Constant) -> u8 {
        match constant {
            Constant::Nil => self.nil,
            Constant::Boolean(_) => self.boolean,
            Constant::Number(_) => self.number,
            Constant::String { tampered: true, .. } => self.tampered,
            Constant::String { .. } => self.string,
        }
    }
}

/// Layout parameters of the serialized output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireFormat {
    /// XOR mask applied to every chunk-local byte.
    pub key: u8,
    /// Whether the parameter count byte is masked like everything else.
    pub mask_parameter_count: bool,
    /// Sections of each chunk, in emission order.
    pub steps: Vec<ChunkStep>,
    pub constant_tags: ConstantTags,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            key: 0,
            mask_parameter_count: true,
            steps: ChunkStep::DEFAULT_ORDER.to_vec(),
            constant_tags: ConstantTags::default(),
        }
    }
}

/// Append-only, key-masked byte buffer.
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
    key: u8,
}

impl ByteWriter {
    pub const fn new(key: u8) -> Self {
        Self {
            buf: Vec::new(),
            key,
        }
    }

    pub const fn key(&self) -> u8 {
        self.key
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value ^ self.key);
    }

    /// Writes a byte without applying the mask.
    pub fn write_unmasked(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let key = self.key;
        self.buf.extend(bytes.iter().map(|b| b ^ key));
    }

    /// Appends already-encoded bytes verbatim.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes the low three bytes of `value`, least significant first.
    pub fn write_u24(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes an unsigned LEB128 integer.
    pub fn write_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.write_u8(byte);
                break;
            }
            self.write_u8(byte | 0x80);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        tracing::trace!("writer finished: {}", hex::encode(&self.buf));
        self.buf
    }
}

/// Number of bytes `value` occupies as LEB128.
pub const fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Serialized size of `ins` as it currently stands.
pub fn instruction_len(ins: &Instruction) -> usize {
    match ins.shape() {
        Shape::Data => 1,
        shape => 1 + varint_len(u64::from(ins.emitted_opcode())) + shape.operand_len(),
    }
}

/// Writes one instruction: shape byte, opcode id, then the operand fields of its shape.
///
/// Operands are written as they are; refreshing them from references and applying the
/// instruction's mutation is the caller's job.
pub fn write_instruction(w: &mut ByteWriter, ins: &Instruction) {
    let shape = ins.shape();
    if shape == Shape::Data {
        w.write_u8(DATA_BYTE);
        return;
    }
    debug_assert!(!ins.has_unset_operand(), "unset operand in `{ins}`");

    let mut head = shape.tag() << 1;
    if ins.skip {
        head |= SKIP_FLAG;
    }
    w.write_u8(head);
    w.write_varint(u64::from(ins.emitted_opcode()));
    w.write_i16(ins.a as i16);

    match shape {
        Shape::ABC => {
            w.write_u24(ins.b as u32);
            w.write_u24(ins.c as u32);
            w.write_u16(ins.e as u16);
            w.write_u32(ins.f as u32);
        }
        Shape::ABx => w.write_u32(ins.b as u32),
        Shape::AsBx => w.write_u32(ins.b.wrapping_add(SBX_BIAS) as u32),
        Shape::AsBxC => {
            w.write_u32(ins.b.wrapping_add(SBX_BIAS) as u32);
            w.write_u24(ins.c as u32);
            w.write_u16(ins.e as u16);
            w.write_u32(ins.f as u32);
        }
        Shape::Data => {}
    }
}

/// Writes one constant: its tag followed by the payload of its kind.
pub fn write_constant(w: &mut ByteWriter, constant: &Constant, tags: &ConstantTags) {
    w.write_u8(tags.tag_of(constant));
    match constant {
        Constant::Nil => {}
        Constant::Boolean(value) => w.write_u8(u8::from(*value)),
        Constant::Number(value) => w.write_f64(*value),
        Constant::String { tampered: true, .. } => w.write_u8(0),
        Constant::String { bytes, .. } => {
            w.write_varint(bytes.len() as u64);
            w.write_bytes(bytes);
        }
    }
}
