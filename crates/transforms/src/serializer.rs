//! Chunk tree serializer.
//!
//! Chunks are encoded in depth-first pre-order, which is also the order the obfuscation engine
//! sees them in. Each chunk's bytes are masked with the format key on their own; nested chunk
//! output is spliced in verbatim at the `Chunks` step, so the mask never stacks.

use crate::context::ObfuscationContext;
use crate::engine::ObfuscationEngine;
use murk_core::encoder::{write_constant, write_instruction, ByteWriter, ChunkStep, DATA_BYTE};
use murk_core::{Chunk, ChunkId};
use murk_utils::errors::EncodeError;
use std::collections::HashMap;
use tracing::debug;

/// Encoded piece of one chunk.
#[derive(Debug)]
enum Part {
    Bytes(Vec<u8>),
    /// Where the serialized nested chunks go.
    Children,
}

/// Serializes `root` and everything nested in it.
///
/// Instructions are mutated as they are written, so `root` carries the obfuscated operands
/// afterwards and a second call emits the same instruction bytes.
pub fn serialize(
    root: &mut Chunk,
    engine: &ObfuscationEngine,
    ctx: &mut ObfuscationContext,
) -> Result<Vec<u8>, EncodeError> {
    let paths = root.chunk_paths();
    let mut encoded = Vec::with_capacity(paths.len());
    for path in &paths {
        let Some(chunk) = root.descendant_mut(path) else {
            continue;
        };
        encoded.push((path.clone(), encode_chunk(chunk, engine, ctx)?));
    }

    // Reverse pre-order finishes every child before its parent.
    let mut done: HashMap<Vec<ChunkId>, Vec<u8>> = HashMap::with_capacity(encoded.len());
    for (path, parts) in encoded.into_iter().rev() {
        let child_ids = root
            .descendant(&path)
            .map(|chunk| chunk.child_ids().to_vec())
            .unwrap_or_default();
        let mut out = Vec::new();
        for part in parts {
            match part {
                Part::Bytes(bytes) => out.extend_from_slice(&bytes),
                Part::Children => {
                    for id in &child_ids {
                        let mut child_path = path.clone();
                        child_path.push(*id);
                        if let Some(bytes) = done.get(&child_path) {
                            out.extend_from_slice(bytes);
                        }
                    }
                }
            }
        }
        done.insert(path, out);
    }

    let bytes = done.remove(&Vec::new()).unwrap_or_default();
    debug!("serialized {} chunks into {} bytes", paths.len(), bytes.len());
    Ok(bytes)
}

fn encode_chunk(
    chunk: &mut Chunk,
    engine: &ObfuscationEngine,
    ctx: &mut ObfuscationContext,
) -> Result<Vec<Part>, EncodeError> {
    chunk.refresh_indices();
    let format = ctx.format.clone();
    let mut parts = Vec::new();
    let mut w = ByteWriter::new(format.key);

    for step in &format.steps {
        match step {
            ChunkStep::ParameterCount => {
                if format.mask_parameter_count {
                    w.write_u8(chunk.parameter_count);
                } else {
                    w.write_unmasked(chunk.parameter_count);
                }
            }
            ChunkStep::UpvalueCount => w.write_u8(chunk.upvalue_count),
            ChunkStep::Vararg => w.write_u8(u8::from(chunk.is_vararg)),
            ChunkStep::MaxStackSize => w.write_u8(chunk.max_stack_size),
            ChunkStep::LineInfo => {
                w.write_varint(u64::from(chunk.line_defined));
                w.write_varint(u64::from(chunk.last_line_defined));
            }
            ChunkStep::Constants => {
                w.write_varint(chunk.constant_count() as u64);
                for (_, constant) in chunk.constants() {
                    write_constant(&mut w, constant, &format.constant_tags);
                }
            }
            ChunkStep::Instructions => encode_instructions(&mut w, chunk, engine, ctx)?,
            ChunkStep::Chunks => {
                w.write_varint(chunk.child_count() as u64);
                let head = std::mem::replace(&mut w, ByteWriter::new(format.key));
                parts.push(Part::Bytes(head.into_bytes()));
                parts.push(Part::Children);
            }
        }
    }
    parts.push(Part::Bytes(w.into_bytes()));

    debug!(
        "encoded chunk `{}`: {} instructions, {} constants, {} children",
        chunk.name,
        chunk.len(),
        chunk.constant_count(),
        chunk.child_count()
    );
    Ok(parts)
}

fn encode_instructions(
    w: &mut ByteWriter,
    chunk: &mut Chunk,
    engine: &ObfuscationEngine,
    ctx: &mut ObfuscationContext,
) -> Result<(), EncodeError> {
    let ids = chunk.instruction_ids().to_vec();
    w.write_varint(ids.len() as u64);
    for id in ids {
        if chunk[id].is_data() {
            w.write_u8(DATA_BYTE);
            continue;
        }
        // A mutated instruction's operands are final; refreshing would undo the mutation.
        if !chunk[id].mutated {
            chunk.update_references(id)?;
        }
        engine.mutate(chunk, id, ctx)?;
        write_instruction(w, &chunk[id]);
    }
    Ok(())
}
