use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::world_state::position::BlockPos;

use super::MapDatabase;

/// An in-memory backend for tests and throwaway worlds.
///
/// Keyed by the raw block position; the key-encoding concerns of the trait
/// only matter for backends with external storage.
#[derive(Default)]
pub struct MemoryDatabase {
    blocks: Mutex<BTreeMap<(i16, i16, i16), Vec<u8>>>,
}

impl MemoryDatabase {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    /// `true` when no block has been saved.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().unwrap().is_empty()
    }
}

impl MapDatabase for MemoryDatabase {
    fn save_block(&self, pos: BlockPos, data: &[u8]) -> Result<()> {
        self.blocks
            .lock()
            .unwrap()
            .insert((pos.x, pos.y, pos.z), data.to_vec());
        Ok(())
    }

    fn load_block(&self, pos: BlockPos) -> Option<Vec<u8>> {
        self.blocks
            .lock()
            .unwrap()
            .get(&(pos.x, pos.y, pos.z))
            .cloned()
    }

    fn list_all_loadable_blocks(&self) -> Vec<BlockPos> {
        self.blocks
            .lock()
            .unwrap()
            .keys()
            .map(|&(x, y, z)| BlockPos::new(x, y, z))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_list() {
        let db = MemoryDatabase::new();
        let pos = BlockPos::new(1, -2, 3);
        assert!(db.load_block(pos).is_none());

        db.save_block(pos, b"abc").unwrap();
        assert_eq!(db.load_block(pos).as_deref(), Some(&b"abc"[..]));
        assert_eq!(db.list_all_loadable_blocks(), vec![pos]);

        db.save_block(pos, b"xyz").unwrap();
        assert_eq!(db.load_block(pos).as_deref(), Some(&b"xyz"[..]));
        assert_eq!(db.len(), 1);
    }
}
