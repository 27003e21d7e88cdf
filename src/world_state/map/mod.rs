//! # Map Module
//!
//! The sparse block store: a mapping from block coordinates to loaded
//! [`MapBlock`]s, plus the node-granular convenience layer everything else is
//! written against. This is the authoritative world state; all other
//! components hold [`MtResource`] handles into it and re-fetch blocks rather
//! than caching them across ticks.
//!
//! ## Concurrency
//!
//! The map itself is shared as `MtResource<Map>`: any number of readers can
//! look blocks up while a single writer inserts or evicts. Per-block contents
//! sit behind each block's own lock, so node mutation only needs the map's
//! read guard. Long algorithms (lighting, liquid) acquire and release block
//! guards per node as they walk their worklists; they never pin the whole
//! map. Callers must not invoke map node operations while already holding a
//! guard on the affected block.
//!
//! ## Eviction
//!
//! [`Map::timer_update`] implements the unload policy: a block whose only
//! remaining reference is the store's own and whose usage timer exceeds the
//! unload timeout is saved (if dirty) and erased. The sweep is bounded by a
//! millisecond budget; whatever does not fit is deferred to the next call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info, warn};
use lru::LruCache;

use crate::core::MtResource;
use crate::world_state::block::metadata::NodeMetadata;
use crate::world_state::block::node_timer::NodeTimer;
use crate::world_state::block::MapBlock;
use crate::world_state::content::ContentRegistry;
use crate::world_state::lighting::LightingEngine;
use crate::world_state::node::MapNode;
use crate::world_state::persistence::MapDatabase;
use crate::world_state::position::{node_to_block_pos, node_to_local, BlockPos, NodePos};

/// Capacity of the known-missing-key cache in front of the database.
const DB_MISS_CACHE_SIZE: usize = 512;

/// The sparse block store. See the module documentation.
pub struct Map {
    registry: Arc<ContentRegistry>,
    blocks: HashMap<BlockPos, MtResource<MapBlock>>,
    // Single-slot cache for the common access pattern of hammering one block
    // in a tight loop. Invalidated on every map mutation.
    block_cache: Mutex<Option<(BlockPos, MtResource<MapBlock>)>>,
    database: Option<Arc<dyn MapDatabase>>,
    db_miss_cache: LruCache<BlockPos, ()>,
    saving_enabled: bool,
    unload_pending: VecDeque<BlockPos>,
}

impl Map {
    /// Creates a map over the given content registry and optional backend.
    pub fn new(
        registry: Arc<ContentRegistry>,
        database: Option<Arc<dyn MapDatabase>>,
        saving_enabled: bool,
    ) -> Self {
        Self {
            registry,
            blocks: HashMap::new(),
            block_cache: Mutex::new(None),
            database,
            db_miss_cache: LruCache::new(NonZeroUsize::new(DB_MISS_CACHE_SIZE).unwrap()),
            saving_enabled,
            unload_pending: VecDeque::new(),
        }
    }

    /// The content registry this map resolves ids through.
    pub fn registry(&self) -> &ContentRegistry {
        &self.registry
    }

    /// Shared handle to the registry.
    pub fn registry_arc(&self) -> Arc<ContentRegistry> {
        self.registry.clone()
    }

    /// The persistence backend, when one is attached.
    pub fn database(&self) -> Option<Arc<dyn MapDatabase>> {
        self.database.clone()
    }

    /// Number of loaded blocks.
    pub fn blocks_loaded(&self) -> usize {
        self.blocks.len()
    }

    /// Positions of all loaded blocks.
    pub fn loaded_block_positions(&self) -> Vec<BlockPos> {
        self.blocks.keys().copied().collect()
    }

    /// Drops the single-slot block cache. Called internally on every map
    /// mutation; exposed for callers that hand block contents to another
    /// thread.
    pub fn block_cache_flush(&self) {
        *self.block_cache.lock().unwrap() = None;
    }

    /// Fetches a loaded block, refreshing its usage timer. Does not create
    /// and does not touch the database.
    pub fn get_block(&self, pos: BlockPos) -> Option<MtResource<MapBlock>> {
        {
            let cache = self.block_cache.lock().unwrap();
            if let Some((cached_pos, block)) = cache.as_ref() {
                if *cached_pos == pos {
                    let block = block.clone();
                    drop(cache);
                    // try_get_mut: the caller may already hold this block.
                    if let Some(mut guard) = block.try_get_mut() {
                        guard.reset_usage_timer();
                    }
                    return Some(block);
                }
            }
        }
        let block = self.blocks.get(&pos)?.clone();
        if let Some(mut guard) = block.try_get_mut() {
            guard.reset_usage_timer();
        }
        *self.block_cache.lock().unwrap() = Some((pos, block.clone()));
        Some(block)
    }

    /// Fetches a block, creating a blank one if none is loaded.
    pub fn get_or_create_blank_block(&mut self, pos: BlockPos) -> MtResource<MapBlock> {
        if let Some(block) = self.get_block(pos) {
            return block;
        }
        self.create_blank_block(pos)
    }

    /// Inserts a new blank block. If one is already loaded at `pos` it is
    /// returned unchanged.
    pub fn create_blank_block(&mut self, pos: BlockPos) -> MtResource<MapBlock> {
        if let Some(existing) = self.blocks.get(&pos) {
            return existing.clone();
        }
        let block = MtResource::new(MapBlock::new_blank(pos));
        self.blocks.insert(pos, block.clone());
        self.block_cache_flush();
        block
    }

    /// Inserts a populated block, typically the result of an emerge.
    ///
    /// If a blank placeholder is already loaded at the same position its
    /// contents are replaced in place so existing handles observe the new
    /// data; a populated block is never silently overwritten.
    pub fn insert_block(&mut self, block: MapBlock) -> MtResource<MapBlock> {
        let pos = block.pos();
        if let Some(existing) = self.blocks.get(&pos) {
            let existing = existing.clone();
            {
                let mut guard = existing.get_mut();
                if guard.is_generated() {
                    warn!("insert_block: block {pos:?} already generated, keeping loaded data");
                } else {
                    *guard = block;
                }
            }
            self.block_cache_flush();
            return existing;
        }
        let handle = MtResource::new(block);
        self.blocks.insert(pos, handle.clone());
        self.block_cache_flush();
        handle
    }

    /// Unloads a block without saving it. Returns `true` when one existed.
    pub fn delete_block(&mut self, pos: BlockPos) -> bool {
        let existed = self.blocks.remove(&pos).is_some();
        if existed {
            self.block_cache_flush();
        }
        existed
    }

    /// Loads one block synchronously from the database. Corrupt data is
    /// logged and reported as `None`, like a missing key.
    pub fn load_block(&mut self, pos: BlockPos) -> Option<MtResource<MapBlock>> {
        if let Some(block) = self.get_block(pos) {
            return Some(block);
        }
        let database = self.database.clone()?;
        if self.db_miss_cache.get(&pos).is_some() {
            return None;
        }
        let Some(data) = database.load_block(pos) else {
            self.db_miss_cache.put(pos, ());
            return None;
        };
        match MapBlock::deserialize(pos, &data) {
            Ok(block) => Some(self.insert_block(block)),
            Err(e) => {
                error!("discarding corrupt block {pos:?}: {e:#}");
                None
            }
        }
    }

    // ---- node-granular layer -------------------------------------------

    /// The node at `p`, or `None` when its block is not loaded.
    pub fn get_node_opt(&self, p: NodePos) -> Option<MapNode> {
        let block = self.get_block(node_to_block_pos(p))?;
        let node = block.get().node_at(node_to_local(p));
        Some(node)
    }

    /// The node at `p`, or the "ignore" sentinel when its block is not
    /// loaded. Callers that must distinguish use [`Map::get_node_opt`].
    pub fn get_node(&self, p: NodePos) -> MapNode {
        self.get_node_opt(p).unwrap_or_else(MapNode::ignore)
    }

    /// Writes a node, marking its block modified. Returns `false` (and does
    /// nothing) when the block is not loaded.
    pub fn set_node(&self, p: NodePos, node: MapNode) -> bool {
        let Some(block) = self.get_block(node_to_block_pos(p)) else {
            return false;
        };
        block.get_mut().set_node_at(node_to_local(p), node);
        true
    }

    /// Places a node and restores the lighting invariants around it,
    /// collecting every block whose stored nodes changed into
    /// `modified_blocks`. Returns `false` when the target block is not
    /// loaded.
    pub fn add_node_and_update(
        &self,
        p: NodePos,
        node: MapNode,
        modified_blocks: &mut HashSet<BlockPos>,
        remove_metadata: bool,
    ) -> bool {
        let block_pos = node_to_block_pos(p);
        let Some(block) = self.get_block(block_pos) else {
            return false;
        };
        if remove_metadata {
            let mut guard = block.get_mut();
            if guard.metadata().get(node_to_local(p)).is_some() {
                guard.metadata_mut().remove(node_to_local(p));
            }
        }

        // Light removal first: the new content may block or emit differently
        // than whatever stood here. Re-lighting waits until the node is in
        // place so no light leaks through the position being changed.
        use crate::world_state::node::LightBank;
        use crate::world_state::position::DIRS_6;

        let lighting = LightingEngine::new();
        let mut touched = HashSet::new();
        let mut relight_seeds = [Vec::new(), Vec::new()];
        for (i, bank) in [LightBank::Day, LightBank::Night].into_iter().enumerate() {
            relight_seeds[i] = lighting.unspread_collect(self, &[p], bank, &mut touched);
        }

        block.get_mut().set_node_at(node_to_local(p), node);
        touched.insert(block_pos);

        for (i, bank) in [LightBank::Day, LightBank::Night].into_iter().enumerate() {
            let mut seeds = std::mem::take(&mut relight_seeds[i]);
            seeds.push(p);
            for dir in DIRS_6 {
                seeds.push(p + dir);
            }
            lighting.spread_from(self, &seeds, bank, &mut touched);
        }
        modified_blocks.extend(touched);
        true
    }

    /// Removes a node (replaces it with air) and restores lighting, like
    /// [`Map::add_node_and_update`].
    pub fn remove_node_and_update(
        &self,
        p: NodePos,
        modified_blocks: &mut HashSet<BlockPos>,
    ) -> bool {
        use crate::world_state::node::CONTENT_AIR;
        self.add_node_and_update(p, MapNode::new(CONTENT_AIR), modified_blocks, true)
    }

    // ---- metadata and timer wrappers -----------------------------------

    /// Clones the metadata at a node position.
    pub fn get_node_metadata(&self, p: NodePos) -> Option<NodeMetadata> {
        let block = self.get_block(node_to_block_pos(p))?;
        let meta = block.get().metadata().get(node_to_local(p)).cloned();
        meta
    }

    /// Replaces the metadata at a node position. `false` when the block is
    /// not loaded.
    pub fn set_node_metadata(&self, p: NodePos, meta: NodeMetadata) -> bool {
        let Some(block) = self.get_block(node_to_block_pos(p)) else {
            return false;
        };
        block.get_mut().metadata_mut().set(node_to_local(p), meta);
        true
    }

    /// Deletes the metadata at a node position.
    pub fn remove_node_metadata(&self, p: NodePos) -> bool {
        let Some(block) = self.get_block(node_to_block_pos(p)) else {
            return false;
        };
        let removed = block.get_mut().metadata_mut().remove(node_to_local(p));
        removed
    }

    /// The timer at a node position.
    pub fn get_node_timer(&self, p: NodePos) -> Option<NodeTimer> {
        let block = self.get_block(node_to_block_pos(p))?;
        let timer = block.get().node_timers().get(node_to_local(p));
        timer
    }

    /// Sets the timer at a node position. `false` when the block is not
    /// loaded.
    pub fn set_node_timer(&self, p: NodePos, timer: NodeTimer) -> bool {
        let Some(block) = self.get_block(node_to_block_pos(p)) else {
            return false;
        };
        block.get_mut().node_timers_mut().set(node_to_local(p), timer);
        true
    }

    /// Removes the timer at a node position.
    pub fn remove_node_timer(&self, p: NodePos) -> bool {
        let Some(block) = self.get_block(node_to_block_pos(p)) else {
            return false;
        };
        let removed = block.get_mut().node_timers_mut().remove(node_to_local(p));
        removed
    }

    // ---- saving and eviction -------------------------------------------

    /// Saves every modified block. Per-block failures are logged and the
    /// sweep continues; returns `(saved, failed)`.
    pub fn save_modified_blocks(&mut self) -> (u32, u32) {
        let Some(database) = self.database.clone() else {
            return (0, 0);
        };
        if !self.saving_enabled {
            return (0, 0);
        }
        database.begin_save();
        let mut saved = 0;
        let mut failed = 0;
        for (pos, block) in &self.blocks {
            let mut guard = block.get_mut();
            if !guard.is_modified() {
                continue;
            }
            let data = guard.serialize();
            match database.save_block(*pos, &data) {
                Ok(()) => {
                    guard.clear_modified();
                    self.db_miss_cache.pop(pos);
                    saved += 1;
                }
                Err(e) => {
                    error!("failed to save block {pos:?}: {e:#}");
                    failed += 1;
                }
            }
        }
        database.end_save();
        if saved > 0 {
            debug!("saved {saved} modified blocks");
        }
        if failed > 0 {
            warn!("{failed} blocks failed to save and remain dirty");
        }
        (saved, failed)
    }

    /// Advances usage timers and unloads stale blocks.
    ///
    /// A block is evicted once no handle besides the store's own remains and
    /// its usage timer exceeds `unload_timeout` seconds. Dirty blocks are
    /// saved first; a failed save keeps the block loaded for a later retry.
    /// At most `max_cycle_ms` milliseconds are spent; leftover candidates
    /// carry over to the next call. Returns the number of blocks saved.
    pub fn timer_update(
        &mut self,
        dtime: f32,
        unload_timeout: f32,
        max_cycle_ms: u64,
        mut unloaded: Option<&mut Vec<BlockPos>>,
    ) -> u32 {
        let start = Instant::now();
        // The cache handle must not count as a user of its block.
        self.block_cache_flush();

        for block in self.blocks.values() {
            if let Some(mut guard) = block.try_get_mut() {
                guard.inc_usage_timer(dtime);
            }
        }

        // Candidates deferred from the previous call go first; they are
        // re-validated below, so stale entries are harmless.
        let mut candidates: VecDeque<BlockPos> = std::mem::take(&mut self.unload_pending);
        for (pos, block) in &self.blocks {
            if block.ref_count() == 1 && !candidates.contains(pos) {
                candidates.push_back(*pos);
            }
        }

        let database = self.database.clone();
        let mut saved = 0;
        let mut deleted = 0;
        while let Some(pos) = candidates.pop_front() {
            if start.elapsed().as_millis() as u64 >= max_cycle_ms {
                // Out of budget; the rest waits for the next sweep.
                self.unload_pending = candidates;
                break;
            }
            let Some(block) = self.blocks.get(&pos) else {
                continue;
            };
            if block.ref_count() > 1 {
                continue;
            }
            let eligible = {
                let guard = block.get();
                guard.usage_timer() > unload_timeout
            };
            if !eligible {
                continue;
            }
            {
                let mut guard = block.get_mut();
                if guard.is_modified() {
                    match (&database, self.saving_enabled) {
                        (Some(db), true) => {
                            let data = guard.serialize();
                            match db.save_block(pos, &data) {
                                Ok(()) => {
                                    guard.clear_modified();
                                    self.db_miss_cache.pop(&pos);
                                    saved += 1;
                                }
                                Err(e) => {
                                    error!("failed to save block {pos:?} before unload: {e:#}");
                                    continue;
                                }
                            }
                        }
                        // No backend or saving disabled: modified data is
                        // discarded with the block, as configured.
                        _ => {}
                    }
                }
            }
            self.blocks.remove(&pos);
            deleted += 1;
            if let Some(out) = unloaded.as_deref_mut() {
                out.push(pos);
            }
        }

        if deleted > 0 {
            self.block_cache_flush();
            info!("unloaded {deleted} blocks ({saved} saved)");
        }
        saved
    }
}
