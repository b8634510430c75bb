use crate::assign::Tagger;
use crate::context::{Handler, ObfuscationContext};
use crate::encryption::StringEncryptor;
use crate::engine::ObfuscationEngine;
use crate::pass;
use crate::serializer::serialize;
use crate::shuffle::BlockShuffle;
use crate::{ObfuscationSettings, PassConfig, Transform};
use murk_core::encoder::WireFormat;
use murk_core::{Chunk, ChunkId, Constant, ObfuscationType};
use murk_utils::errors::ObfuscateError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Configuration for the obfuscation pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    /// Random seed for deterministic obfuscation; drawn from the OS when absent
    pub seed: Option<u64>,
    /// Which features to apply
    pub settings: ObfuscationSettings,
    /// Output layout shared with the interpreter
    pub format: WireFormat,
    /// Pass configuration for transform behavior
    pub pass_config: PassConfig,
    /// Encryptor used when `settings.encrypt_strings` is on
    pub encryptor: StringEncryptor,
}

impl ObfuscationConfig {
    pub fn from_json(json: &str) -> Result<Self, ObfuscateError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A string constant replaced by an encrypted placeholder.
#[derive(Debug, Clone, Serialize)]
pub struct EncryptedConstant {
    /// Child positions from the root down to the owning chunk, `/`-separated; empty for the root
    pub chunk: String,
    /// Constant pool slot
    pub slot: usize,
    /// Decrypt expression to embed in place of the literal
    pub expression: String,
}

/// Result of the obfuscation pipeline
#[derive(Debug, Clone, Serialize)]
pub struct ObfuscationResult {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// The serialized chunk tree as hex string (with 0x prefix)
    pub hex: String,
    /// Keccak-256 of the serialized bytes (with 0x prefix)
    pub digest: String,
    /// Serialized size in bytes
    pub size: usize,
    /// Virtual opcodes the interpreter needs handlers for
    pub handlers: Vec<Handler>,
    /// Strings that must be emitted as decrypt expressions
    pub encrypted_strings: Vec<EncryptedConstant>,
    /// Metadata about the obfuscation process
    pub metadata: ObfuscationMetadata,
}

impl ObfuscationResult {
    pub fn to_json(&self) -> Result<String, ObfuscateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObfuscationMetadata {
    /// Number of chunks in the tree
    pub chunks: usize,
    /// Instructions serialized across all chunks
    pub instructions: usize,
    /// Structural windows spliced in
    pub windows: usize,
    /// Instructions tagged with an operand permutation
    pub permuted: usize,
    /// Instructions tagged for polymorphic recoding
    pub polymorphic: usize,
    /// Names of transforms that were applied, once per chunk they were kept for
    pub transforms_applied: Vec<String>,
    /// Seed used for the obfuscation
    pub seed_used: u64,
    /// Raw operands that could not be turned into references
    pub unresolved_references: usize,
}

fn path_label(root: &Chunk, path: &[ChunkId]) -> String {
    let mut labels = Vec::with_capacity(path.len());
    let mut chunk = root;
    for &id in path {
        labels.push(chunk.child_position(id).unwrap_or_default().to_string());
        match chunk.child(id) {
            Some(child) => chunk = child,
            None => break,
        }
    }
    labels.join("/")
}

fn encrypt_strings(
    root: &mut Chunk,
    paths: &[Vec<ChunkId>],
    encryptor: &StringEncryptor,
    rng: &mut StdRng,
) -> Vec<EncryptedConstant> {
    let mut encrypted = Vec::new();
    for path in paths {
        let label = path_label(root, path);
        let Some(chunk) = root.descendant_mut(path) else {
            continue;
        };
        let ids: Vec<_> = chunk.constants().map(|(id, _)| id).collect();
        for (slot, id) in ids.into_iter().enumerate() {
            let Some(Constant::String {
                bytes,
                tampered: false,
            }) = chunk.constant(id)
            else {
                continue;
            };
            let result = encryptor.encrypt(bytes, rng);
            if let Some(constant) = chunk.constant_mut(id) {
                *constant = Constant::tampered(result.cipher);
            }
            encrypted.push(EncryptedConstant {
                chunk: label.clone(),
                slot,
                expression: result.expression,
            });
        }
    }
    tracing::debug!("encrypted {} string constants", encrypted.len());
    encrypted
}

/// Main obfuscation pipeline
///
/// Decodes references across the tree, runs the enabled passes on every chunk, then serializes
/// with the strategies applied on the way out. `root` is left in its obfuscated state.
pub fn obfuscate(
    root: &mut Chunk,
    config: &ObfuscationConfig,
) -> Result<ObfuscationResult, ObfuscateError> {
    let seed = config
        .seed
        .unwrap_or_else(|| StdRng::from_os_rng().random());
    let mut rng = StdRng::seed_from_u64(seed);
    let paths = root.chunk_paths();

    tracing::debug!("Starting obfuscation pipeline:");
    tracing::debug!("  Chunks: {}", paths.len());
    tracing::debug!("  Seed: 0x{:x}", seed);

    let mut unresolved_references = 0;
    for path in &paths {
        if let Some(chunk) = root.descendant_mut(path) {
            unresolved_references += chunk.setup_references().len();
        }
    }

    let encrypted_strings = if config.settings.encrypt_strings {
        encrypt_strings(root, &paths, &config.encryptor, &mut rng)
    } else {
        Vec::new()
    };

    let mut passes: Vec<Box<dyn Transform>> = Vec::new();
    if config.settings.shuffle_blocks {
        passes.push(Box::new(BlockShuffle));
    }
    if config.settings.tags_anything() {
        passes.push(Box::new(Tagger::new(config.settings.clone())));
    }

    let mut metadata = ObfuscationMetadata {
        chunks: paths.len(),
        seed_used: seed,
        unresolved_references,
        ..ObfuscationMetadata::default()
    };
    for path in &paths {
        let Some(chunk) = root.descendant_mut(path) else {
            continue;
        };
        let applied = pass::run(chunk, &passes, &config.pass_config, &mut rng)?;
        metadata
            .transforms_applied
            .extend(applied.into_iter().map(str::to_string));

        for (_, ins) in chunk.instructions() {
            match ins.obfuscation {
                Some(kind) if kind.is_permutation() => metadata.permuted += 1,
                Some(ObfuscationType::Polymorphic) => metadata.polymorphic += 1,
                Some(_) if ins.opcode.is_window_entry() => metadata.windows += 1,
                _ => {}
            }
        }
        metadata.instructions += chunk.len();
    }

    let engine = ObfuscationEngine::with_defaults();
    let mut ctx = ObfuscationContext::new(config.format.clone(), rng);
    let bytes = serialize(root, &engine, &mut ctx)?;

    let digest = Keccak256::digest(&bytes);
    let result = ObfuscationResult {
        hex: format!("0x{}", hex::encode(&bytes)),
        digest: format!("0x{}", hex::encode(digest)),
        size: bytes.len(),
        handlers: ctx.virtual_opcodes.handlers().to_vec(),
        encrypted_strings,
        metadata,
        bytes,
    };

    tracing::debug!("  Output size: {} bytes", result.size);
    tracing::debug!("  Handlers: {}", result.handlers.len());
    tracing::debug!("  Digest: {}", result.digest);
    Ok(result)
}
