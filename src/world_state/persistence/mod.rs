//! # Persistence Module
//!
//! Key-value backends mapping block coordinates to serialized block bytes.
//! The map writes through whichever backend it was constructed with; the
//! emerge workers read from the same backend when deciding between loading
//! and generating.
//!
//! Keys are written in the current text form (`a<x>,<y>,<z>`); the legacy
//! packed-integer form is accepted on read and when listing, so old worlds
//! keep loading. A missing key is `None`, never an error; "not yet
//! generated" is a normal answer. A write failure is fatal only to the block
//! being written; batch saves log it and continue with their siblings.

mod file;
mod memory;

pub use file::FileDatabase;
pub use memory::MemoryDatabase;

use anyhow::Result;

use crate::world_state::position::BlockPos;

/// A block persistence backend.
///
/// Implementations must be callable from both the simulation thread (saves)
/// and the emerge workers (loads) concurrently.
pub trait MapDatabase: Send + Sync {
    /// Stores the serialized bytes of one block, replacing any previous
    /// value. Partial writes must never become visible to readers.
    fn save_block(&self, pos: BlockPos, data: &[u8]) -> Result<()>;

    /// Fetches the serialized bytes of one block. `None` when the block was
    /// never saved; backend-internal read failures are logged and also
    /// reported as `None`.
    fn load_block(&self, pos: BlockPos) -> Option<Vec<u8>>;

    /// Lists every block position the backend has data for.
    fn list_all_loadable_blocks(&self) -> Vec<BlockPos>;

    /// Called before a batch of saves. Backends with transactions hook this.
    fn begin_save(&self) {}

    /// Called after a batch of saves.
    fn end_save(&self) {}
}
