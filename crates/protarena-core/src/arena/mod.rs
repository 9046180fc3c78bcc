//! Region allocator that owns every message graph built in it.
//!
//! An [`Arena`] owns a chain of bump-allocated byte blocks, slabs of message,
//! array and map objects, buffers aliased from outside, and a list of
//! finalizers. Nothing is freed individually: all of it is released at once
//! when the arena is torn down (explicitly with [`Arena::teardown`] or by
//! dropping it).
//!
//! Objects are addressed through small `Copy` handles such as [`MessageId`]
//! and [`Span`]. Each handle records the id of the arena that issued it, and
//! an arena rejects handles it does not know with [`Error::ForeignHandle`].
//! [`Arena::fuse`] moves another arena's storage into this one, after which
//! handles issued by either arena resolve here.
//!
//! ```
//! use protarena_core::Arena;
//!
//! let mut arena = Arena::new();
//! let span = arena.allocate(16, 8)?;
//! arena.bytes_mut(span)?.copy_from_slice(&[7; 16]);
//! assert_eq!(arena.bytes(span)?, &[7; 16]);
//!
//! let stats = arena.teardown();
//! assert_eq!(stats.used_bytes, 16);
//! # Ok::<(), protarena_core::Error>(())
//! ```

mod block;

use crate::error::{Error, Result};
use crate::message::MessageData;
use crate::value::array::ArrayData;
use crate::value::map::MapData;
use block::BlockChain;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(u32);

impl ArenaId {
    fn next() -> Self {
        Self(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena#{}", self.0)
    }
}

/// Handle to a message stored in an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub(crate) arena: ArenaId,
    pub(crate) index: u32,
}

impl MessageId {
    /// The arena that created this message
    pub fn arena(&self) -> ArenaId {
        self.arena
    }
}

/// Handle to a repeated-field array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ArrayId {
    arena: ArenaId,
    index: u32,
}

/// Handle to a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MapId {
    arena: ArenaId,
    index: u32,
}

/// Where the bytes of a [`Span`] live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Loc {
    /// Inside an arena block
    Block(u32),
    /// Inside a buffer registered with [`Arena::alias`]
    Alias(u32),
}

/// Handle to a byte range owned by an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    arena: ArenaId,
    loc: Loc,
    offset: u32,
    len: u32,
}

impl Span {
    fn empty(arena: ArenaId) -> Self {
        Self {
            arena,
            loc: Loc::Block(0),
            offset: 0,
            len: 0,
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true for a zero-length span
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The arena that issued this span
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// True if the bytes live in an aliased external buffer
    pub fn is_alias(&self) -> bool {
        matches!(self.loc, Loc::Alias(_))
    }

    /// A span covering `len` bytes starting `start` bytes into this one
    pub fn subspan(&self, start: usize, len: usize) -> Option<Span> {
        let end = start.checked_add(len)?;
        if end > self.len as usize {
            return None;
        }
        Some(Span {
            offset: self.offset + start as u32,
            len: len as u32,
            ..*self
        })
    }
}

/// Configuration for an arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of the first block linked into the arena
    pub initial_block_size: usize,
    /// Upper bound on block growth (oversized requests still get their own block)
    pub max_block_size: usize,
    /// Total bytes the arena may reserve for blocks (None = unbounded)
    pub memory_limit: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_block_size: 256,
            max_block_size: 64 * 1024, // 64 KB
            memory_limit: None,
        }
    }
}

impl ArenaConfig {
    /// Creates a new arena config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the first block
    pub fn initial_block_size(mut self, size: usize) -> Self {
        self.initial_block_size = size;
        self
    }

    /// Sets the maximum size blocks grow to
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    /// Sets the block memory budget
    pub fn memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }
}

/// Snapshot of what an arena holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of linked blocks
    pub blocks: usize,
    /// Bytes reserved for blocks
    pub reserved_bytes: usize,
    /// Bytes handed out from blocks
    pub used_bytes: usize,
    /// Messages allocated
    pub messages: usize,
    /// Repeated-field arrays allocated
    pub arrays: usize,
    /// Maps allocated
    pub maps: usize,
    /// External buffers kept alive
    pub aliases: usize,
    /// Finalizers not yet run
    pub finalizers: usize,
}

/// Rejected [`Arena::fuse`]; hands the offered arena back untouched
pub struct FuseError {
    /// The arena that could not be fused
    pub arena: Arena,
    left: Option<usize>,
}

impl fmt::Debug for FuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuseError")
            .field("arena", &self.arena.id)
            .field("left", &self.left)
            .field("right", &self.arena.config.memory_limit)
            .finish()
    }
}

impl fmt::Display for FuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot fuse arenas with different memory limits ({:?} vs {:?})",
            self.left, self.arena.config.memory_limit
        )
    }
}

impl std::error::Error for FuseError {}

impl From<FuseError> for Error {
    fn from(err: FuseError) -> Self {
        Error::FuseIncompatible {
            left: err.left,
            right: err.arena.config.memory_limit,
        }
    }
}

/// Offsets that translate a member arena's handles into this arena's storage
#[derive(Debug, Clone, Copy, Default)]
struct Bases {
    messages: usize,
    arrays: usize,
    maps: usize,
    blocks: u32,
    aliases: u32,
}

/// Pre-images of the objects an [`Arena::transaction`] has modified
///
/// Objects created after the transaction began are not recorded; a rollback
/// truncates the slabs back to their lengths at the start.
#[derive(Debug, Default)]
struct Journal {
    message_mark: usize,
    array_mark: usize,
    map_mark: usize,
    messages: HashMap<usize, MessageData>,
    arrays: HashMap<usize, ArrayData>,
    maps: HashMap<usize, MapData>,
}

enum Cleanup {
    Callback(Box<dyn FnOnce() + Send + Sync>),
    ReleaseAlias(u32),
}

/// Owner of blocks, objects, aliased buffers and finalizers
pub struct Arena {
    id: ArenaId,
    config: ArenaConfig,
    blocks: BlockChain,
    aliases: Vec<Bytes>,
    pub(crate) messages: Vec<MessageData>,
    pub(crate) arrays: Vec<ArrayData>,
    pub(crate) maps: Vec<MapData>,
    members: HashMap<ArenaId, Bases>,
    cleanups: Vec<Cleanup>,
    journal: Option<Journal>,
    torn_down: bool,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("members", &self.members.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Arena {
    /// Creates an arena with the default configuration
    pub fn new() -> Self {
        Self::with_config(ArenaConfig::default())
    }

    /// Creates an arena with the given configuration
    pub fn with_config(config: ArenaConfig) -> Self {
        let id = ArenaId::next();
        let mut members = HashMap::new();
        members.insert(id, Bases::default());
        Self {
            id,
            blocks: BlockChain::new(&config),
            config,
            aliases: Vec::new(),
            messages: Vec::new(),
            arrays: Vec::new(),
            maps: Vec::new(),
            members,
            cleanups: Vec::new(),
            journal: None,
            torn_down: false,
        }
    }

    /// Identity of this arena
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Configuration the arena was created with
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Returns true if handles issued by `arena` resolve here
    pub fn owns(&self, arena: ArenaId) -> bool {
        self.members.contains_key(&arena)
    }

    /// Allocate `size` zeroed bytes aligned to `align` (a power of two).
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<Span> {
        let (block, offset) = self.blocks.allocate(size, align)?;
        Ok(Span {
            arena: self.id,
            loc: Loc::Block(block),
            offset,
            len: size as u32,
        })
    }

    /// Copy `data` into the arena.
    pub(crate) fn store(&mut self, data: &[u8]) -> Result<Span> {
        if data.is_empty() {
            return Ok(Span::empty(self.id));
        }
        let span = self.allocate(data.len(), 1)?;
        self.bytes_mut(span)?.copy_from_slice(data);
        Ok(span)
    }

    /// Keep `data` alive until teardown and return a span over it without
    /// copying.
    pub fn alias(&mut self, data: Bytes) -> Result<Span> {
        let len = u32::try_from(data.len()).map_err(|_| {
            Error::InvalidArgument(format!(
                "aliased buffer of {} bytes exceeds the span range",
                data.len()
            ))
        })?;
        let index = self.aliases.len() as u32;
        self.aliases.push(data);
        self.cleanups.push(Cleanup::ReleaseAlias(index));
        Ok(Span {
            arena: self.id,
            loc: Loc::Alias(index),
            offset: 0,
            len,
        })
    }

    /// Read access to the bytes of a span
    pub fn bytes(&self, span: Span) -> Result<&[u8]> {
        let bases = self.bases(span.arena)?;
        if span.len == 0 {
            return Ok(&[]);
        }
        let found = match span.loc {
            Loc::Block(block) => self.blocks.get(bases.blocks + block, span.offset, span.len),
            Loc::Alias(alias) => self
                .aliases
                .get((bases.aliases + alias) as usize)
                .and_then(|buf| {
                    let start = span.offset as usize;
                    buf.get(start..start + span.len as usize)
                }),
        };
        found.ok_or_else(|| Error::InvalidArgument("span does not address arena memory".into()))
    }

    /// Write access to the bytes of a block span
    ///
    /// Aliased spans are read-only.
    pub fn bytes_mut(&mut self, span: Span) -> Result<&mut [u8]> {
        let bases = self.bases(span.arena)?;
        if span.len == 0 {
            return Ok(&mut []);
        }
        match span.loc {
            Loc::Block(block) => self
                .blocks
                .get_mut(bases.blocks + block, span.offset, span.len)
                .ok_or_else(|| Error::InvalidArgument("span does not address arena memory".into())),
            Loc::Alias(_) => Err(Error::InvalidArgument(
                "aliased buffers cannot be written through the arena".into(),
            )),
        }
    }

    /// Run `finalizer` when the arena is torn down.
    ///
    /// Finalizers run in reverse registration order.
    pub fn register_finalizer<F>(&mut self, finalizer: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.cleanups.push(Cleanup::Callback(Box::new(finalizer)));
    }

    /// Absorb `other` so both lifetimes end with this arena.
    ///
    /// Handles issued by `other` (or by anything fused into it) resolve in
    /// this arena afterwards. Arenas with different memory limits cannot be
    /// fused; the offered arena is returned inside the error and nothing
    /// changes.
    pub fn fuse(&mut self, mut other: Arena) -> std::result::Result<(), FuseError> {
        if other.config.memory_limit != self.config.memory_limit {
            return Err(FuseError {
                left: self.config.memory_limit,
                arena: other,
            });
        }

        let offset = Bases {
            messages: self.messages.len(),
            arrays: self.arrays.len(),
            maps: self.maps.len(),
            blocks: self.blocks.len() as u32,
            aliases: self.aliases.len() as u32,
        };

        for (id, bases) in other.members.drain() {
            self.members.insert(
                id,
                Bases {
                    messages: offset.messages + bases.messages,
                    arrays: offset.arrays + bases.arrays,
                    maps: offset.maps + bases.maps,
                    blocks: offset.blocks + bases.blocks,
                    aliases: offset.aliases + bases.aliases,
                },
            );
        }

        self.blocks.absorb(std::mem::take(&mut other.blocks));
        self.aliases.append(&mut other.aliases);
        self.messages.append(&mut other.messages);
        self.arrays.append(&mut other.arrays);
        self.maps.append(&mut other.maps);
        self.cleanups
            .extend(other.cleanups.drain(..).map(|cleanup| match cleanup {
                Cleanup::ReleaseAlias(index) => Cleanup::ReleaseAlias(offset.aliases + index),
                callback => callback,
            }));
        other.torn_down = true;

        debug!(
            "fused {} into {} ({} member arenas)",
            other.id,
            self.id,
            self.members.len()
        );
        Ok(())
    }

    /// Current block and object counts
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            blocks: self.blocks.len(),
            reserved_bytes: self.blocks.reserved(),
            used_bytes: self.blocks.used(),
            messages: self.messages.len(),
            arrays: self.arrays.len(),
            maps: self.maps.len(),
            aliases: self.aliases.len(),
            finalizers: self
                .cleanups
                .iter()
                .filter(|cleanup| matches!(cleanup, Cleanup::Callback(_)))
                .count(),
        }
    }

    /// Run finalizers and release every block and object.
    ///
    /// Returns the statistics the arena had just before teardown.
    pub fn teardown(mut self) -> ArenaStats {
        self.release()
    }

    fn release(&mut self) -> ArenaStats {
        let stats = self.stats();
        while let Some(cleanup) = self.cleanups.pop() {
            match cleanup {
                Cleanup::Callback(finalizer) => finalizer(),
                Cleanup::ReleaseAlias(index) => {
                    if let Some(buf) = self.aliases.get_mut(index as usize) {
                        *buf = Bytes::new();
                    }
                }
            }
        }
        self.messages = Vec::new();
        self.arrays = Vec::new();
        self.maps = Vec::new();
        self.aliases = Vec::new();
        self.blocks.release();
        self.torn_down = true;
        debug!(
            "tore down {} ({} blocks, {} bytes used, {} messages)",
            self.id, stats.blocks, stats.used_bytes, stats.messages
        );
        stats
    }

    /// Run `f` so that an error leaves every existing object as it was
    ///
    /// Messages, arrays and maps modified by `f` are restored and objects it
    /// created are dropped from the slabs. Bytes it allocated from blocks stay
    /// reserved until teardown. A nested call joins the outer transaction.
    pub(crate) fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Arena) -> Result<T>,
    ) -> Result<T> {
        if self.journal.is_some() {
            return f(self);
        }
        self.journal = Some(Journal {
            message_mark: self.messages.len(),
            array_mark: self.arrays.len(),
            map_mark: self.maps.len(),
            ..Journal::default()
        });
        let result = f(self);
        if let Some(journal) = self.journal.take() {
            if result.is_err() {
                self.roll_back(journal);
            }
        }
        result
    }

    fn roll_back(&mut self, journal: Journal) {
        trace!(
            "rolling back {} ({} messages, {} arrays, {} maps restored)",
            self.id,
            journal.messages.len(),
            journal.arrays.len(),
            journal.maps.len()
        );
        self.messages.truncate(journal.message_mark);
        self.arrays.truncate(journal.array_mark);
        self.maps.truncate(journal.map_mark);
        for (index, data) in journal.messages {
            self.messages[index] = data;
        }
        for (index, data) in journal.arrays {
            self.arrays[index] = data;
        }
        for (index, data) in journal.maps {
            self.maps[index] = data;
        }
    }

    /// Record the pre-image of a message about to be modified
    pub(crate) fn journal_message(&mut self, index: usize) {
        if let Some(journal) = self.journal.as_mut() {
            if index < journal.message_mark {
                journal
                    .messages
                    .entry(index)
                    .or_insert_with(|| self.messages[index].clone());
            }
        }
    }

    fn bases(&self, arena: ArenaId) -> Result<Bases> {
        self.members
            .get(&arena)
            .copied()
            .ok_or(Error::ForeignHandle {
                handle_arena: arena.0,
            })
    }

    /// Reserve one more slot in an object slab.
    fn grow<T>(slab: &mut Vec<T>) -> Result<()> {
        slab.try_reserve(1).map_err(|_| Error::AllocationExhausted {
            requested: std::mem::size_of::<T>(),
            limit: None,
        })
    }

    pub(crate) fn insert_message(&mut self, data: MessageData) -> Result<MessageId> {
        Self::grow(&mut self.messages)?;
        let index = self.messages.len() as u32;
        self.messages.push(data);
        Ok(MessageId {
            arena: self.id,
            index,
        })
    }

    pub(crate) fn insert_array(&mut self, data: ArrayData) -> Result<ArrayId> {
        Self::grow(&mut self.arrays)?;
        let index = self.arrays.len() as u32;
        self.arrays.push(data);
        Ok(ArrayId {
            arena: self.id,
            index,
        })
    }

    pub(crate) fn insert_map(&mut self, data: MapData) -> Result<MapId> {
        Self::grow(&mut self.maps)?;
        let index = self.maps.len() as u32;
        self.maps.push(data);
        Ok(MapId {
            arena: self.id,
            index,
        })
    }

    /// Slab position of a message handle
    pub(crate) fn message_index(&self, id: MessageId) -> Result<usize> {
        let index = self.bases(id.arena)?.messages + id.index as usize;
        if index >= self.messages.len() {
            return Err(Error::InvalidArgument(format!(
                "message handle {} is out of range",
                id.index
            )));
        }
        Ok(index)
    }

    pub(crate) fn array(&self, id: ArrayId) -> Result<&ArrayData> {
        let index = self.bases(id.arena)?.arrays + id.index as usize;
        self.arrays
            .get(index)
            .ok_or_else(|| Error::InvalidArgument("array handle is out of range".into()))
    }

    pub(crate) fn array_mut(&mut self, id: ArrayId) -> Result<&mut ArrayData> {
        let index = self.bases(id.arena)?.arrays + id.index as usize;
        if let (Some(journal), Some(data)) = (self.journal.as_mut(), self.arrays.get(index)) {
            if index < journal.array_mark {
                journal.arrays.entry(index).or_insert_with(|| data.clone());
            }
        }
        self.arrays
            .get_mut(index)
            .ok_or_else(|| Error::InvalidArgument("array handle is out of range".into()))
    }

    pub(crate) fn map(&self, id: MapId) -> Result<&MapData> {
        let index = self.bases(id.arena)?.maps + id.index as usize;
        self.maps
            .get(index)
            .ok_or_else(|| Error::InvalidArgument("map handle is out of range".into()))
    }

    pub(crate) fn map_mut(&mut self, id: MapId) -> Result<&mut MapData> {
        let index = self.bases(id.arena)?.maps + id.index as usize;
        if let (Some(journal), Some(data)) = (self.journal.as_mut(), self.maps.get(index)) {
            if index < journal.map_mark {
                journal.maps.entry(index).or_insert_with(|| data.clone());
            }
        }
        self.maps
            .get_mut(index)
            .ok_or_else(|| Error::InvalidArgument("map handle is out of range".into()))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.torn_down {
            self.release();
        }
    }
}
