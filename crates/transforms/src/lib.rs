pub mod assign;
pub mod context;
pub mod encryption;
pub mod engine;
pub mod obfuscator;
pub mod pass;
pub mod permutation;
pub mod polymorphic;
pub mod serializer;
pub mod shuffle;
pub mod window;

use murk_core::Chunk;
use murk_utils::errors::TransformError;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Trait for whole-chunk obfuscation passes that run before serialization.
pub trait Transform: Send + Sync {
    /// Returns the transform's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the transform to one chunk (not its nested chunks), returning whether changes
    /// were made.
    fn apply(&self, chunk: &mut Chunk, rng: &mut StdRng) -> Result<bool, TransformError>;
}

/// Configuration for transform passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    /// Minimum potency delta for accepting a pass result
    pub accept_threshold: f64,
    /// Keep every pass result regardless of its potency delta
    pub aggressive: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.0,
            aggressive: true,
        }
    }
}

/// Named obfuscation features. Only gates which obfuscation tags get assigned; the strategies
/// themselves always run for whatever is tagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationSettings {
    /// Tag instructions with operand permutations
    pub permute_operands: bool,
    /// Tag instructions with polymorphic recoding
    pub polymorphic_opcodes: bool,
    /// Wrap instructions in structural helper windows
    pub structural_windows: bool,
    /// Shuffle basic blocks
    pub shuffle_blocks: bool,
    /// Replace string constants with encrypted expressions
    pub encrypt_strings: bool,
    /// Share of eligible instructions to permute
    pub permutation_ratio: f32,
    /// Share of eligible instructions to recode polymorphically
    pub polymorphic_ratio: f32,
    /// Share of eligible instructions to wrap in a window
    pub window_ratio: f32,
}

impl Default for ObfuscationSettings {
    fn default() -> Self {
        Self {
            permute_operands: true,
            polymorphic_opcodes: true,
            structural_windows: true,
            shuffle_blocks: true,
            encrypt_strings: false,
            permutation_ratio: 0.3,
            polymorphic_ratio: 0.2,
            window_ratio: 0.1,
        }
    }
}

impl ObfuscationSettings {
    /// Whether any per-instruction tagging is enabled.
    pub const fn tags_anything(&self) -> bool {
        self.permute_operands || self.polymorphic_opcodes || self.structural_windows
    }
}
