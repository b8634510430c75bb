//! Per-instruction obfuscation dispatch.
//!
//! Strategies run at serialization time, once per instruction. The `mutated` flag makes a
//! second request for the same instruction a no-op, which matters because window strategies
//! mutate their payload ahead of the serializer reaching it.

use crate::context::ObfuscationContext;
use crate::permutation::Permutation;
use crate::polymorphic::Polymorphic;
use crate::window::Window;
use murk_core::{Chunk, InstrId, ObfuscationType};
use murk_utils::errors::TransformError;
use std::collections::HashMap;
use std::fmt;

/// Rewrites one instruction (and possibly its fixed window) for one obfuscation type.
pub trait Strategy: Send + Sync {
    /// Returns the strategy's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the strategy to the instruction `at`, which is already flagged as mutated.
    fn apply(
        &self,
        engine: &ObfuscationEngine,
        chunk: &mut Chunk,
        at: InstrId,
        ctx: &mut ObfuscationContext,
    ) -> Result<(), TransformError>;
}

/// Registry mapping each obfuscation type to its strategy.
pub struct ObfuscationEngine {
    strategies: HashMap<ObfuscationType, Box<dyn Strategy>>,
}

impl fmt::Debug for ObfuscationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.strategies.keys().collect();
        kinds.sort();
        f.debug_struct("ObfuscationEngine")
            .field("strategies", &kinds)
            .finish()
    }
}

impl Default for ObfuscationEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ObfuscationEngine {
    /// An engine without strategies.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// An engine with every built-in strategy registered.
    pub fn with_defaults() -> Self {
        let mut engine = Self::empty();
        for kind in ObfuscationType::PERMUTATIONS {
            engine.register(kind, Box::new(Permutation(kind)));
        }
        engine.register(ObfuscationType::Polymorphic, Box::new(Polymorphic));
        for kind in ObfuscationType::WINDOWS {
            if let Some(window) = Window::new(kind) {
                engine.register(kind, Box::new(window));
            }
        }
        engine
    }

    /// Registers `strategy` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: ObfuscationType, strategy: Box<dyn Strategy>) {
        self.strategies.insert(kind, strategy);
    }

    pub fn strategy(&self, kind: ObfuscationType) -> Option<&dyn Strategy> {
        self.strategies.get(&kind).map(|s| s.as_ref())
    }

    /// Applies the strategy tagged on `id`, at most once per instruction.
    ///
    /// Untagged and already mutated instructions are left alone.
    pub fn mutate(
        &self,
        chunk: &mut Chunk,
        id: InstrId,
        ctx: &mut ObfuscationContext,
    ) -> Result<(), TransformError> {
        let ins = chunk
            .get_instruction_mut(id)
            .ok_or(TransformError::UnknownInstruction(id.raw()))?;
        if ins.mutated {
            return Ok(());
        }
        let Some(kind) = ins.obfuscation else {
            return Ok(());
        };
        ins.mutated = true;

        let strategy = self
            .strategies
            .get(&kind)
            .ok_or_else(|| TransformError::UnknownStrategy(kind.to_string()))?;
        tracing::trace!("{} on instruction {}", strategy.name(), id.raw());
        strategy.apply(self, chunk, id, ctx)
    }
}
