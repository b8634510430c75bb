use thiserror::Error;

/// Error type for control-flow graph construction and edge resolution.
///
/// Every variant signals a broken structural invariant upstream of the builder. None of them are
/// recoverable and a run that hits one is aborted.
#[derive(Debug, Error)]
pub enum CfgIrError {
    /// The chunk has no instructions, so there is nothing to hang the root edge on.
    #[error("no valid entry block found")]
    NoEntryBlock,
    /// A comparison or loop-step instruction is not followed by its conditional skip.
    #[error("{opcode} at position {position} is missing its trailing instruction")]
    TruncatedBlock { opcode: String, position: usize },
    /// A closure whose prototype reference cannot be resolved to a nested chunk.
    #[error("closure at position {position} does not reference a nested chunk")]
    UnresolvedClosure { position: usize },
    /// A closure claims more upvalue captures than there are instructions left.
    #[error("closure at position {position} needs {needed} capture instructions")]
    TruncatedClosure { position: usize, needed: usize },
    /// A window entry instruction whose obfuscation tag is not a window kind.
    #[error("unrecognized obfuscation group at position {position}: {tag}")]
    UnrecognizedGroup { position: usize, tag: String },
    /// A window that runs past the end of the instruction list.
    #[error("obfuscation group at position {position} needs {len} instructions")]
    TruncatedGroup { position: usize, len: usize },
    /// A branch instruction whose jump reference was never set.
    #[error("branch instruction of block {block} has no jump target")]
    MissingJumpTarget { block: usize },
    /// A branch whose target instruction does not belong to any block.
    #[error("jump target of block {block} does not belong to any block")]
    UnmappedJumpTarget { block: usize },
    /// A block id that does not exist in the graph.
    #[error("unknown block {0}")]
    UnknownBlock(usize),
}

/// A symbolic reference that cannot be turned into a raw operand against the current index maps.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("constant {0} is not in the constant pool")]
    Constant(u32),
    #[error("instruction {0} is not in the instruction list")]
    Instruction(u32),
    #[error("prototype {0} is not in the nested chunk list")]
    Chunk(u32),
    #[error("instruction {0} is not part of this chunk")]
    Source(u32),
}

/// Errors raised by the binary serializer.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A symbolic operand could not be resolved while refreshing raw operands.
    #[error("reference resolution failed: {0}")]
    Reference(#[from] ReferenceError),
    /// An obfuscation strategy failed while mutating an instruction.
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
}

/// Errors raised by the wire reader.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid shape byte 0x{byte:02x} at offset {offset}")]
    InvalidShape { byte: u8, offset: usize },
    #[error("variable-length integer overflows at offset {0}")]
    VarintOverflow(usize),
    #[error("unknown constant tag 0x{tag:02x} at offset {offset}")]
    UnknownConstantTag { tag: u8, offset: usize },
    #[error("string constant at offset {0} runs past the end of input")]
    InvalidLength(usize),
    #[error("{0} trailing bytes after the root chunk")]
    TrailingBytes(usize),
}

/// Error type for metrics computation.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("control flow graph is empty")]
    EmptyCfg,
    #[error("no body blocks found")]
    NoBodyBlocks,
}

/// Error type for transform operations.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("no strategy registered for {0}")]
    UnknownStrategy(String),
    #[error("instruction {0} is not part of the chunk")]
    UnknownInstruction(u32),
    #[error("{kind} window at position {position} needs {len} instructions")]
    TruncatedWindow {
        kind: String,
        position: usize,
        len: usize,
    },
    #[error("virtual opcode space exhausted")]
    OpcodeSpaceExhausted,
    #[error("reference resolution failed: {0}")]
    Reference(#[from] ReferenceError),
    #[error("core operation failed: {0}")]
    CoreError(#[from] CfgIrError),
    #[error("metrics computation failed: {0}")]
    MetricsError(#[from] MetricsError),
}

/// Errors that can occur during a whole obfuscation run.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    /// Transform application failed.
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    /// Control-flow reconstruction failed.
    #[error("control flow error: {0}")]
    Cfg(#[from] CfgIrError),
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
