//! Per-run state shared by the obfuscation strategies and the serializer.

use murk_core::encoder::WireFormat;
use murk_core::{ObfuscationType, OffsetMode, Opcode};
use murk_utils::errors::TransformError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Highest opcode id the wire format can carry.
pub const MAX_OPCODE_ID: u32 = 0xFFFF;

/// What a virtual opcode's handler has to undo before running the real operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HandlerKey {
    /// Operands were relabeled by `permutation`.
    Permuted {
        opcode: Opcode,
        permutation: ObfuscationType,
    },
    /// Operands were shifted by `offset` in the directions of `modes`.
    Polymorphic {
        opcode: Opcode,
        modes: [OffsetMode; 5],
        offset: i32,
    },
}

/// One allocated virtual opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Handler {
    pub id: u32,
    pub key: HandlerKey,
}

/// Registry of virtual opcode ids.
///
/// Ids are drawn at random above the real opcode range and never reused; equal keys share an id.
#[derive(Debug, Clone, Default)]
pub struct VirtualOpcodes {
    assigned: HashMap<HandlerKey, u32>,
    used: HashSet<u32>,
    handlers: Vec<Handler>,
}

impl VirtualOpcodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `key`, allocating one on first use.
    pub fn resolve<R: Rng>(
        &mut self,
        key: HandlerKey,
        rng: &mut R,
    ) -> Result<u32, TransformError> {
        if let Some(&id) = self.assigned.get(&key) {
            return Ok(id);
        }
        let id = self.allocate(rng)?;
        tracing::trace!("virtual opcode {} for {:?}", id, key);
        self.assigned.insert(key, id);
        self.used.insert(id);
        self.handlers.push(Handler { id, key });
        Ok(id)
    }

    fn allocate<R: Rng>(&self, rng: &mut R) -> Result<u32, TransformError> {
        let space = MAX_OPCODE_ID - Opcode::COUNT + 1;
        if self.used.len() >= space as usize {
            return Err(TransformError::OpcodeSpaceExhausted);
        }
        let start = rng.random_range(Opcode::COUNT..=MAX_OPCODE_ID);
        // Probe forward from the random start; the space is known to have a gap.
        (0..space)
            .map(|step| Opcode::COUNT + (start - Opcode::COUNT + step) % space)
            .find(|id| !self.used.contains(id))
            .ok_or(TransformError::OpcodeSpaceExhausted)
    }

    pub fn get(&self, key: &HandlerKey) -> Option<u32> {
        self.assigned.get(key).copied()
    }

    /// Allocated handlers in allocation order.
    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Everything a strategy needs besides the chunk it rewrites.
#[derive(Debug, Clone)]
pub struct ObfuscationContext {
    pub format: WireFormat,
    pub virtual_opcodes: VirtualOpcodes,
    pub rng: StdRng,
}

impl ObfuscationContext {
    pub fn new(format: WireFormat, rng: StdRng) -> Self {
        Self {
            format,
            virtual_opcodes: VirtualOpcodes::new(),
            rng,
        }
    }

    /// Context with a reproducible random stream.
    pub fn seeded(format: WireFormat, seed: u64) -> Self {
        Self::new(format, StdRng::seed_from_u64(seed))
    }

    /// Resolves a handler key against this run's registry and random stream.
    pub fn virtual_opcode(&mut self, key: HandlerKey) -> Result<u32, TransformError> {
        self.virtual_opcodes.resolve(key, &mut self.rng)
    }
}
