//! Function prototypes: instruction list, constant pool and nested prototypes.
//!
//! Each collection is an append-only arena addressed by a typed handle, plus an ordering and a
//! handle→position index. Cross references between instructions, constants and nested chunks are
//! stored as handles and only turned into positions through the index, which is why the index has
//! to be refreshed after any pass that inserts or reorders instructions.

use crate::instruction::Instruction;
use murk_utils::errors::ReferenceError;
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Index, IndexMut};

/// Typed index into one of a chunk's arenas.
pub trait Handle: Copy + Eq + Hash {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Raw arena slot, for diagnostics.
            pub const fn raw(self) -> u32 {
                self.0
            }
        }

        impl Handle for $name {
            fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

handle!(
    /// Stable handle of an instruction within its chunk.
    InstrId
);
handle!(
    /// Stable handle of a constant within its chunk.
    ConstId
);
handle!(
    /// Stable handle of a nested prototype within its parent chunk.
    ChunkId
);

/// Ordering of an arena plus the reverse handle→position map.
#[derive(Debug, Clone)]
pub struct SeqIndex<K> {
    order: Vec<K>,
    positions: HashMap<K, usize>,
    stale: bool,
}

impl<K: Handle> SeqIndex<K> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            positions: HashMap::new(),
            stale: false,
        }
    }

    /// Position of `key` in the current ordering.
    pub fn position(&self, key: K) -> Option<usize> {
        debug_assert!(!self.stale, "index map read before refresh");
        self.positions.get(&key).copied()
    }

    /// Handle at `position` in the current ordering.
    pub fn at(&self, position: usize) -> Option<K> {
        self.order.get(position).copied()
    }

    pub fn order(&self) -> &[K] {
        &self.order
    }

    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    fn refresh(&mut self) {
        self.positions.clear();
        self.positions.reserve(self.order.len());
        for (pos, &key) in self.order.iter().enumerate() {
            self.positions.insert(key, pos);
        }
        self.stale = false;
    }
}

#[derive(Debug, Clone)]
struct Sequence<K, T> {
    items: Vec<T>,
    index: SeqIndex<K>,
}

impl<K: Handle, T> Sequence<K, T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            index: SeqIndex::new(),
        }
    }

    fn allocate(&mut self, item: T) -> K {
        let key = K::from_index(self.items.len());
        self.items.push(item);
        key
    }

    fn push(&mut self, item: T) -> K {
        let key = self.allocate(item);
        self.index.positions.insert(key, self.index.order.len());
        self.index.order.push(key);
        key
    }

    fn insert(&mut self, position: usize, item: T) -> K {
        let key = self.allocate(item);
        self.index.order.insert(position, key);
        self.index.stale = true;
        key
    }

    fn get(&self, key: K) -> Option<&T> {
        self.items.get(key.index())
    }

    fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.items.get_mut(key.index())
    }

    fn len(&self) -> usize {
        self.index.order.len()
    }
}

/// Read-only view of a chunk's three index maps.
#[derive(Debug, Clone, Copy)]
pub struct IndexView<'a> {
    instructions: &'a SeqIndex<InstrId>,
    constants: &'a SeqIndex<ConstId>,
    chunks: &'a SeqIndex<ChunkId>,
}

impl IndexView<'_> {
    pub fn instruction_position(&self, id: InstrId) -> Option<usize> {
        self.instructions.position(id)
    }

    pub fn instruction_at(&self, position: usize) -> Option<InstrId> {
        self.instructions.at(position)
    }

    pub fn constant_position(&self, id: ConstId) -> Option<usize> {
        self.constants.position(id)
    }

    pub fn constant_at(&self, position: usize) -> Option<ConstId> {
        self.constants.at(position)
    }

    pub fn chunk_position(&self, id: ChunkId) -> Option<usize> {
        self.chunks.position(id)
    }

    pub fn chunk_at(&self, position: usize) -> Option<ChunkId> {
        self.chunks.at(position)
    }
}

/// A literal in the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    String {
        bytes: Vec<u8>,
        /// Already encrypted in the generated source; serialized as a placeholder only.
        tampered: bool,
    },
}

impl Constant {
    pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
        Self::String {
            bytes: bytes.into(),
            tampered: false,
        }
    }

    pub fn tampered(bytes: impl Into<Vec<u8>>) -> Self {
        Self::String {
            bytes: bytes.into(),
            tampered: true,
        }
    }
}

/// One compiled function.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub parameter_count: u8,
    /// Number of upvalues the prototype captures; closures over it are followed by this many
    /// capture instructions.
    pub upvalue_count: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub upvalue_names: Vec<String>,
    code: Sequence<InstrId, Instruction>,
    constants: Sequence<ConstId, Constant>,
    children: Sequence<ChunkId, Self>,
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new("")
    }
}

impl Chunk {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line_defined: 0,
            last_line_defined: 0,
            parameter_count: 0,
            upvalue_count: 0,
            is_vararg: false,
            max_stack_size: 2,
            upvalue_names: Vec::new(),
            code: Sequence::new(),
            constants: Sequence::new(),
            children: Sequence::new(),
        }
    }

    // --- instructions -------------------------------------------------------------------------

    /// Appends an instruction; the index map stays valid.
    pub fn push_instruction(&mut self, ins: Instruction) -> InstrId {
        self.code.push(ins)
    }

    /// Splices an instruction in at `position`; the index map goes stale.
    pub fn insert_instruction(&mut self, position: usize, ins: Instruction) -> InstrId {
        self.code.insert(position, ins)
    }

    /// Allocates an instruction without placing it in the ordering.
    pub fn allocate_instruction(&mut self, ins: Instruction) -> InstrId {
        self.code.allocate(ins)
    }

    /// Drops an instruction from the ordering. Its handle stays valid but has no position.
    pub fn remove_instruction(&mut self, id: InstrId) -> bool {
        let before = self.code.index.order.len();
        self.code.index.order.retain(|&k| k != id);
        let removed = self.code.index.order.len() != before;
        self.code.index.stale |= removed;
        removed
    }

    /// Replaces the instruction ordering wholesale.
    pub fn reorder(&mut self, order: Vec<InstrId>) {
        debug_assert!(order.iter().all(|id| id.index() < self.code.items.len()));
        self.code.index.order = order;
        self.code.index.stale = true;
    }

    pub fn get_instruction(&self, id: InstrId) -> Option<&Instruction> {
        self.code.get(id)
    }

    pub fn get_instruction_mut(&mut self, id: InstrId) -> Option<&mut Instruction> {
        self.code.get_mut(id)
    }

    /// Instruction handles in program order.
    pub fn instruction_ids(&self) -> &[InstrId] {
        self.code.index.order()
    }

    /// Instructions in program order.
    pub fn instructions(&self) -> impl Iterator<Item = (InstrId, &Instruction)> + '_ {
        self.code
            .index
            .order
            .iter()
            .map(move |&id| (id, &self.code.items[id.index()]))
    }

    /// Forgets block ownership on every allocated instruction, placed or not.
    pub(crate) fn clear_block_assignments(&mut self) {
        for ins in &mut self.code.items {
            ins.block = None;
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.len() == 0
    }

    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.code.index.position(id)
    }

    pub fn instruction_at(&self, position: usize) -> Option<InstrId> {
        self.code.index.at(position)
    }

    // --- constants ----------------------------------------------------------------------------

    pub fn push_constant(&mut self, constant: Constant) -> ConstId {
        self.constants.push(constant)
    }

    pub fn constant(&self, id: ConstId) -> Option<&Constant> {
        self.constants.get(id)
    }

    /// Mutable access to a constant; its pool slot is unchanged.
    pub fn constant_mut(&mut self, id: ConstId) -> Option<&mut Constant> {
        self.constants.get_mut(id)
    }

    /// Constants in pool order.
    pub fn constants(&self) -> impl Iterator<Item = (ConstId, &Constant)> + '_ {
        self.constants
            .index
            .order
            .iter()
            .map(move |&id| (id, &self.constants.items[id.index()]))
    }

    pub fn constant_count(&self) -> usize {
        self.constants.len()
    }

    pub fn constant_position(&self, id: ConstId) -> Option<usize> {
        self.constants.index.position(id)
    }

    pub fn constant_at(&self, position: usize) -> Option<ConstId> {
        self.constants.index.at(position)
    }

    // --- nested chunks ------------------------------------------------------------------------

    pub fn push_child(&mut self, chunk: Self) -> ChunkId {
        self.children.push(chunk)
    }

    pub fn child(&self, id: ChunkId) -> Option<&Self> {
        self.children.get(id)
    }

    pub fn child_mut(&mut self, id: ChunkId) -> Option<&mut Self> {
        self.children.get_mut(id)
    }

    pub fn child_ids(&self) -> &[ChunkId] {
        self.children.index.order()
    }

    /// Nested chunks in declaration order.
    pub fn children(&self) -> impl Iterator<Item = (ChunkId, &Self)> + '_ {
        self.children
            .index
            .order
            .iter()
            .map(move |&id| (id, &self.children.items[id.index()]))
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn child_position(&self, id: ChunkId) -> Option<usize> {
        self.children.index.position(id)
    }

    pub fn child_at(&self, position: usize) -> Option<ChunkId> {
        self.children.index.at(position)
    }

    /// Follows a path of child handles down from this chunk.
    pub fn descendant(&self, path: &[ChunkId]) -> Option<&Self> {
        path.iter()
            .try_fold(self, |chunk, &id| chunk.children.get(id))
    }

    pub fn descendant_mut(&mut self, path: &[ChunkId]) -> Option<&mut Self> {
        path.iter()
            .try_fold(self, |chunk, &id| chunk.children.get_mut(id))
    }

    /// Paths of every chunk in the tree (the root is the empty path), depth-first pre-order.
    ///
    /// Walks with an explicit stack so deeply nested closures cannot exhaust the call stack.
    pub fn chunk_paths(&self) -> Vec<Vec<ChunkId>> {
        let mut paths = Vec::new();
        let mut stack: Vec<(Vec<ChunkId>, &Self)> = vec![(Vec::new(), self)];
        while let Some((path, chunk)) = stack.pop() {
            for (id, child) in chunk.children().collect::<Vec<_>>().into_iter().rev() {
                let mut child_path = path.clone();
                child_path.push(id);
                stack.push((child_path, child));
            }
            paths.push(path);
        }
        paths
    }

    // --- index maintenance --------------------------------------------------------------------

    /// Rebuilds the instruction, constant and nested chunk position maps.
    pub fn refresh_indices(&mut self) {
        self.code.index.refresh();
        self.constants.index.refresh();
        self.children.index.refresh();
    }

    pub fn index_view(&self) -> IndexView<'_> {
        IndexView {
            instructions: &self.code.index,
            constants: &self.constants.index,
            chunks: &self.children.index,
        }
    }

    /// Decodes raw operands of every instruction into symbolic references.
    ///
    /// Best-effort: unresolvable operands are reported and skipped, never fatal.
    pub fn setup_references(&mut self) -> Vec<ReferenceError> {
        self.refresh_indices();
        let view = IndexView {
            instructions: &self.code.index,
            constants: &self.constants.index,
            chunks: &self.children.index,
        };
        let mut failures = Vec::new();
        for (position, &id) in self.code.index.order.iter().enumerate() {
            let ins = &mut self.code.items[id.index()];
            if let Err(e) = ins.setup_references(position, &view) {
                tracing::warn!(
                    "unresolved operand in {} at position {}: {}",
                    self.name,
                    position,
                    e
                );
                failures.push(e);
            }
        }
        failures
    }

    /// Recomputes raw operands of one instruction from its references.
    pub fn update_references(&mut self, id: InstrId) -> Result<(), ReferenceError> {
        let view = IndexView {
            instructions: &self.code.index,
            constants: &self.constants.index,
            chunks: &self.children.index,
        };
        let position = view
            .instruction_position(id)
            .ok_or(ReferenceError::Source(id.raw()))?;
        let ins = self
            .code
            .items
            .get_mut(id.index())
            .ok_or(ReferenceError::Source(id.raw()))?;
        ins.update_references(position, &view)
    }
}

impl Index<InstrId> for Chunk {
    type Output = Instruction;

    fn index(&self, id: InstrId) -> &Instruction {
        &self.code.items[id.index()]
    }
}

impl IndexMut<InstrId> for Chunk {
    fn index_mut(&mut self, id: InstrId) -> &mut Instruction {
        &mut self.code.items[id.index()]
    }
}
