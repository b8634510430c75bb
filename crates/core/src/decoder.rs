//! Reference reader for the serialized chunk format.
//!
//! Mirrors what the generated interpreter does with the serializer's output: unmask, read the
//! configured chunk steps in order and decode each instruction by its self-describing shape
//! byte. Nested chunks are read with an explicit frame stack.

use crate::encoder::{ChunkStep, ConstantTags, WireFormat, SBX_BIAS, SKIP_FLAG};
use crate::opcode::{Opcode, Shape};
use murk_utils::errors::DecodeError;
use serde::Serialize;

/// A constant as read back from the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DecodedConstant {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Vec<u8>),
    /// Placeholder of a pre-encrypted string.
    Tampered,
}

/// An instruction as read back from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodedInstruction {
    pub shape: Shape,
    pub skip: bool,
    /// Real or virtual opcode id.
    pub opcode: u32,
    pub a: i16,
    /// B, Bx or the unbiased sBx, depending on the shape.
    pub b: i32,
    pub c: u32,
    pub e: u16,
    pub f: u32,
}

impl DecodedInstruction {
    const fn filler() -> Self {
        Self {
            shape: Shape::Data,
            skip: false,
            opcode: Opcode::Data.id() as u32,
            a: 0,
            b: 0,
            c: 0,
            e: 0,
            f: 0,
        }
    }

    /// The real opcode, if the id is not a virtual one.
    pub fn real_opcode(&self) -> Option<Opcode> {
        Opcode::from_id(self.opcode)
    }
}

/// A chunk as read back from the wire. Sections the format does not carry stay `None`/empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedChunk {
    pub parameter_count: Option<u8>,
    pub upvalue_count: Option<u8>,
    pub is_vararg: Option<bool>,
    pub max_stack_size: Option<u8>,
    pub line_info: Option<(u64, u64)>,
    pub constants: Vec<DecodedConstant>,
    pub instructions: Vec<DecodedInstruction>,
    pub chunks: Vec<DecodedChunk>,
}

/// Cursor over masked input.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    key: u8,
}

impl<'a> ByteReader<'a> {
    pub const fn new(bytes: &'a [u8], key: u8) -> Self {
        Self { bytes, pos: 0, key }
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn read_unmasked(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_unmasked()? ^ self.key)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        for byte in &mut out {
            *byte = self.read_u8()?;
        }
        Ok(out)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_u24(&mut self) -> Result<u32, DecodeError> {
        let [b0, b1, b2] = self.read_array()?;
        Ok(u32::from_le_bytes([b0, b1, b2, 0]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.read_array().map(f64::from_le_bytes)
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && byte & 0x7E != 0) {
                return Err(DecodeError::VarintOverflow(start));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::InvalidLength(self.pos));
        }
        let key = self.key;
        let out = self.bytes[self.pos..self.pos + len]
            .iter()
            .map(|b| b ^ key)
            .collect();
        self.pos += len;
        Ok(out)
    }

    /// Reads one instruction.
    pub fn read_instruction(&mut self) -> Result<DecodedInstruction, DecodeError> {
        let offset = self.pos;
        let head = self.read_u8()?;
        let shape = Shape::from_tag(head >> 1)
            .ok_or(DecodeError::InvalidShape { byte: head, offset })?;
        if shape == Shape::Data {
            return Ok(DecodedInstruction::filler());
        }

        let opcode = u32::try_from(self.read_varint()?)
            .map_err(|_| DecodeError::VarintOverflow(offset + 1))?;
        let a = self.read_i16()?;
        let mut ins = DecodedInstruction {
            shape,
            skip: head & SKIP_FLAG != 0,
            opcode,
            a,
            b: 0,
            c: 0,
            e: 0,
            f: 0,
        };

        match shape {
            Shape::ABC => {
                ins.b = self.read_u24()? as i32;
                ins.c = self.read_u24()?;
                ins.e = self.read_u16()?;
                ins.f = self.read_u32()?;
            }
            Shape::ABx => ins.b = self.read_u32()? as i32,
            Shape::AsBx => ins.b = (self.read_u32()? as i32).wrapping_sub(SBX_BIAS),
            Shape::AsBxC => {
                ins.b = (self.read_u32()? as i32).wrapping_sub(SBX_BIAS);
                ins.c = self.read_u24()?;
                ins.e = self.read_u16()?;
                ins.f = self.read_u32()?;
            }
            Shape::Data => {}
        }
        Ok(ins)
    }

    /// Reads one tagged constant.
    pub fn read_constant(&mut self, tags: &ConstantTags) -> Result<DecodedConstant, DecodeError> {
        let offset = self.pos;
        let tag = self.read_u8()?;
        if tag == tags.nil {
            Ok(DecodedConstant::Nil)
        } else if tag == tags.boolean {
            Ok(DecodedConstant::Boolean(self.read_u8()? != 0))
        } else if tag == tags.number {
            Ok(DecodedConstant::Number(self.read_f64()?))
        } else if tag == tags.string {
            let len = usize::try_from(self.read_varint()?)
                .map_err(|_| DecodeError::InvalidLength(offset))?;
            Ok(DecodedConstant::String(self.read_bytes(len)?))
        } else if tag == tags.tampered {
            self.read_u8()?;
            Ok(DecodedConstant::Tampered)
        } else {
            Err(DecodeError::UnknownConstantTag { tag, offset })
        }
    }

    fn read_count(&mut self) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let count = usize::try_from(self.read_varint()?)
            .map_err(|_| DecodeError::VarintOverflow(offset))?;
        // Every element takes at least one byte.
        if count > self.remaining() {
            return Err(DecodeError::UnexpectedEof(self.bytes.len()));
        }
        Ok(count)
    }
}

#[derive(Debug, Default)]
struct Frame {
    chunk: DecodedChunk,
    step: usize,
    pending_children: usize,
}

/// Decodes a serialized chunk tree.
///
/// # Errors
/// Any [`DecodeError`] raised by the reader, and [`DecodeError::TrailingBytes`] if input remains
/// after the root chunk.
pub fn decode_chunk(bytes: &[u8], format: &WireFormat) -> Result<DecodedChunk, DecodeError> {
    let mut reader = ByteReader::new(bytes, format.key);
    let mut stack = vec![Frame::default()];

    while let Some(frame) = stack.last_mut() {
        if frame.pending_children > 0 {
            frame.pending_children -= 1;
            stack.push(Frame::default());
            continue;
        }

        if let Some(&step) = format.steps.get(frame.step) {
            frame.step += 1;
            if step == ChunkStep::Chunks {
                frame.pending_children = reader.read_count()?;
            } else {
                read_step(&mut reader, step, format, &mut frame.chunk)?;
            }
            continue;
        }

        let Some(done) = stack.pop() else { break };
        tracing::debug!(
            "decoded chunk with {} instructions and {} constants at depth {}",
            done.chunk.instructions.len(),
            done.chunk.constants.len(),
            stack.len()
        );
        match stack.last_mut() {
            Some(parent) => parent.chunk.chunks.push(done.chunk),
            None => {
                if reader.remaining() > 0 {
                    return Err(DecodeError::TrailingBytes(reader.remaining()));
                }
                return Ok(done.chunk);
            }
        }
    }

    Ok(DecodedChunk::default())
}

fn read_step(
    reader: &mut ByteReader<'_>,
    step: ChunkStep,
    format: &WireFormat,
    chunk: &mut DecodedChunk,
) -> Result<(), DecodeError> {
    match step {
        ChunkStep::ParameterCount => {
            chunk.parameter_count = Some(if format.mask_parameter_count {
                reader.read_u8()?
            } else {
                reader.read_unmasked()?
            });
        }
        ChunkStep::UpvalueCount => chunk.upvalue_count = Some(reader.read_u8()?),
        ChunkStep::Vararg => chunk.is_vararg = Some(reader.read_u8()? != 0),
        ChunkStep::MaxStackSize => chunk.max_stack_size = Some(reader.read_u8()?),
        ChunkStep::LineInfo => {
            let first = reader.read_varint()?;
            let last = reader.read_varint()?;
            chunk.line_info = Some((first, last));
        }
        ChunkStep::Constants => {
            let count = reader.read_count()?;
            chunk.constants.reserve(count);
            for _ in 0..count {
                chunk
                    .constants
                    .push(reader.read_constant(&format.constant_tags)?);
            }
        }
        ChunkStep::Instructions => {
            let count = reader.read_count()?;
            chunk.instructions.reserve(count);
            for _ in 0..count {
                chunk.instructions.push(reader.read_instruction()?);
            }
        }
        // Handled by the frame stack.
        ChunkStep::Chunks => {}
    }
    Ok(())
}
