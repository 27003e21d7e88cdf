use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{error, warn};

use crate::world_state::position::{block_as_string, string_as_block, BlockPos};

use super::MapDatabase;

/// A directory-of-files backend: one file per block, named by the block's
/// database key.
///
/// Files are written with the current text key; files named with the legacy
/// integer key are still found by reads and listings. Writes go through a
/// temporary file renamed into place, so a crash mid-write leaves either the
/// old bytes or none, never a torn block.
pub struct FileDatabase {
    dir: PathBuf,
}

impl FileDatabase {
    /// Opens (creating if needed) the block directory under `map_dir`.
    pub fn new(map_dir: &Path) -> Result<Self> {
        let dir = map_dir.join("blocks");
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating block directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn block_path(&self, pos: BlockPos) -> PathBuf {
        self.dir.join(block_as_string(pos))
    }

    fn legacy_block_path(&self, pos: BlockPos) -> PathBuf {
        use crate::world_state::position::block_as_integer;
        self.dir.join(block_as_integer(pos).to_string())
    }
}

impl MapDatabase for FileDatabase {
    fn save_block(&self, pos: BlockPos, data: &[u8]) -> Result<()> {
        let path = self.block_path(pos);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    fn load_block(&self, pos: BlockPos) -> Option<Vec<u8>> {
        let path = self.block_path(pos);
        match fs::read(&path) {
            Ok(data) => return Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("failed to read {}: {}", path.display(), e);
                return None;
            }
        }
        // old key format
        let legacy = self.legacy_block_path(pos);
        match fs::read(&legacy) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                error!("failed to read {}: {}", legacy.display(), e);
                None
            }
        }
    }

    fn list_all_loadable_blocks(&self) -> Vec<BlockPos> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to list {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };
        let mut positions = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            match string_as_block(name) {
                Some(pos) => positions.push(pos),
                None => warn!("foreign file in block directory: {name:?}"),
            }
        }
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("voxel-server-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_load_round_trip() {
        let dir = temp_dir("fdb");
        let db = FileDatabase::new(&dir).unwrap();
        let pos = BlockPos::new(-5, 0, 12);

        assert!(db.load_block(pos).is_none());
        db.save_block(pos, b"payload").unwrap();
        assert_eq!(db.load_block(pos).as_deref(), Some(&b"payload"[..]));
        assert_eq!(db.list_all_loadable_blocks(), vec![pos]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn legacy_named_files_are_readable() {
        use crate::world_state::position::block_as_integer;

        let dir = temp_dir("fdb-legacy");
        let db = FileDatabase::new(&dir).unwrap();
        let pos = BlockPos::new(3, -1, 2);

        // A file written by an old server under the integer key.
        let legacy_name = block_as_integer(pos).to_string();
        fs::write(dir.join("blocks").join(legacy_name), b"old").unwrap();

        assert_eq!(db.load_block(pos).as_deref(), Some(&b"old"[..]));
        assert_eq!(db.list_all_loadable_blocks(), vec![pos]);

        let _ = fs::remove_dir_all(&dir);
    }
}
