//! # Environment Module
//!
//! The authoritative simulation tick. A [`ServerEnvironment`] owns the block
//! store, the object registry, the rule scheduler, the liquid engine and the
//! emerge pipeline, and advances them all from a single thread:
//!
//! 1. step every active object, then sweep removals,
//! 2. recompute the active block set around players (requesting emerges for
//!    holes) on the management interval, activating newcomers,
//! 3. ingest completed emerges,
//! 4. run due rules over the active blocks,
//! 5. settle liquids under budget,
//! 6. repair lighting on a few expired blocks,
//! 7. save modified blocks and evict stale ones.
//!
//! The climate fields live here too: slow 2D noise over world position with
//! a seasonal wobble, cached per block for a few seconds because growth
//! rules sample them for every trigger.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use cgmath::Point3;
use log::{debug, info, warn};
use noise::{NoiseFn, Perlin};

use crate::core::{MtResource, UniqueQueue};
use crate::settings::Settings;
use crate::world_state::block::node_timer::NodeTimer;
use crate::simulation_state::abm::{AbmContext, AbmScheduler, ActiveBlockModifier};
use crate::simulation_state::emerge::mapgen::MapgenParams;
use crate::simulation_state::emerge::{EmergeManager, EmergeReply};
use crate::simulation_state::objects::{ActiveObject, ActiveObjectMgr, ObjectId};
use crate::world_state::content::ContentRegistry;
use crate::world_state::lighting::repair_block_lighting;
use crate::world_state::liquid::{queue_block_liquids, LiquidEngine};
use crate::world_state::map::Map;
use crate::world_state::persistence::MapDatabase;
use crate::world_state::position::{
    block_to_node_origin, blockpos_over_limit, node_to_block_pos, BlockPos, NodePos,
    MAP_BLOCKSIZE,
};

/// Seconds a block's cached heat/humidity stays valid.
pub const WEATHER_UPDATE_INTERVAL: f64 = 10.0;
/// Horizontal scale of the climate noise fields.
const CLIMATE_SCALE: f64 = 0.005;
/// Seconds per full seasonal cycle of the climate wobble.
const SEASON_PERIOD: f64 = 1200.0;
/// Milliseconds one liquid step may spend.
const LIQUID_BUDGET_MS: u64 = 30;
/// Milliseconds one eviction sweep may spend.
const UNLOAD_BUDGET_MS: u64 = 5;
/// Expired blocks relit per tick.
const LIGHTING_REPAIRS_PER_TICK: usize = 4;

/// Heat and humidity fields sampled by the growth rules.
///
/// Values are cached in each block (`heat`, `humidity`, `weather_update`) so
/// a rule pass over a block costs one noise sample per bank per cache
/// interval, not one per trigger.
pub struct Climate {
    heat_noise: Perlin,
    humidity_noise: Perlin,
    fixed: Option<(f32, f32)>,
}

impl Climate {
    /// Noise-driven climate for the given world seed.
    pub fn new(seed: u32) -> Self {
        Self {
            heat_noise: Perlin::new(seed.wrapping_add(0x5eed)),
            humidity_noise: Perlin::new(seed.wrapping_add(0x9e37_79b9)),
            fixed: None,
        }
    }

    /// A climate pinned to fixed values, for deterministic tests.
    pub fn constant(heat: f32, humidity: f32) -> Self {
        Self {
            heat_noise: Perlin::new(0),
            humidity_noise: Perlin::new(0),
            fixed: Some((heat, humidity)),
        }
    }

    fn sample_heat(&self, p: NodePos, game_time: f64) -> f32 {
        if let Some((heat, _)) = self.fixed {
            return heat;
        }
        let n = self
            .heat_noise
            .get([p.x as f64 * CLIMATE_SCALE, p.z as f64 * CLIMATE_SCALE]) as f32;
        let season =
            ((game_time * std::f64::consts::TAU / SEASON_PERIOD).sin() * 3.0) as f32;
        15.0 + n * 25.0 - (p.y.max(0) as f32) * 0.05 + season
    }

    fn sample_humidity(&self, p: NodePos, game_time: f64) -> f32 {
        if let Some((_, humidity)) = self.fixed {
            return humidity;
        }
        let n = self
            .humidity_noise
            .get([p.x as f64 * CLIMATE_SCALE, p.z as f64 * CLIMATE_SCALE]) as f32;
        let season =
            ((game_time * std::f64::consts::TAU / SEASON_PERIOD).cos() * 10.0) as f32;
        (50.0 + n * 50.0 + season).clamp(0.0, 100.0)
    }

    fn refresh_block(&self, map: &Map, p: NodePos, game_time: f64) -> Option<(f32, f32)> {
        let bp = node_to_block_pos(p);
        let block = map.get_block(bp)?;
        {
            let guard = block.get();
            if game_time - guard.weather_update < WEATHER_UPDATE_INTERVAL {
                return Some((guard.heat, guard.humidity));
            }
        }
        let origin = block_to_node_origin(bp);
        let half = MAP_BLOCKSIZE / 2;
        let center = NodePos::new(origin.x + half, origin.y + half, origin.z + half);
        let heat = self.sample_heat(center, game_time);
        let humidity = self.sample_humidity(center, game_time);
        let mut guard = block.get_mut();
        guard.heat = heat;
        guard.humidity = humidity;
        guard.weather_update = game_time;
        Some((heat, humidity))
    }

    /// Surface temperature around `p`, degrees. Cached per block.
    pub fn block_heat(&self, map: &Map, p: NodePos, game_time: f64) -> f32 {
        match self.refresh_block(map, p, game_time) {
            Some((heat, _)) => heat,
            None => self.sample_heat(p, game_time),
        }
    }

    /// Humidity around `p`, percent. Cached per block.
    pub fn block_humidity(&self, map: &Map, p: NodePos, game_time: f64) -> f32 {
        match self.refresh_block(map, p, game_time) {
            Some((_, humidity)) => humidity,
            None => self.sample_humidity(p, game_time),
        }
    }
}

/// A snapshot of the environment's load, for periodic stats logging.
#[derive(Copy, Clone, Debug)]
pub struct EnvStats {
    /// Blocks currently loaded in the store.
    pub blocks_loaded: usize,
    /// Blocks in the active set.
    pub active_blocks: usize,
    /// Registered active objects.
    pub objects: usize,
    /// Positions waiting in the liquid queue.
    pub liquid_queue: usize,
    /// Requests somewhere in the emerge pipeline.
    pub pending_emerge: usize,
}

/// The server-side world simulation. See the module documentation.
pub struct ServerEnvironment {
    map: MtResource<Map>,
    registry: Arc<ContentRegistry>,
    settings: Settings,
    objects: ActiveObjectMgr,
    scheduler: AbmScheduler,
    liquid: LiquidEngine,
    emerge: Option<EmergeManager>,
    climate: Climate,
    rng: fastrand::Rng,
    game_time: f64,
    active_blocks: HashSet<BlockPos>,
    lighting_queue: UniqueQueue<BlockPos>,
    elapsed_timers: Vec<(NodePos, NodeTimer)>,
    mgmt_timer: f32,
    abm_timer: f32,
    liquid_timer: f32,
    save_timer: f32,
}

impl ServerEnvironment {
    /// Builds an environment over the given registry, optional persistence
    /// backend and settings, starting the emerge workers.
    pub fn new(
        registry: Arc<ContentRegistry>,
        database: Option<Arc<dyn MapDatabase>>,
        settings: Settings,
    ) -> Self {
        let map = MtResource::new(Map::new(registry.clone(), database.clone(), true));
        let emerge = EmergeManager::new(
            settings.emerge_threads,
            registry.clone(),
            database,
            MapgenParams {
                seed: settings.mapgen_seed,
                water_level: settings.water_level,
            },
        );
        Self {
            map,
            registry,
            climate: Climate::new(settings.mapgen_seed),
            rng: fastrand::Rng::with_seed(settings.mapgen_seed as u64),
            objects: ActiveObjectMgr::new(),
            scheduler: AbmScheduler::new(),
            liquid: LiquidEngine::new(),
            emerge: Some(emerge),
            game_time: 0.0,
            active_blocks: HashSet::new(),
            lighting_queue: UniqueQueue::new(),
            elapsed_timers: Vec::new(),
            // Primed so the first step computes an active set immediately.
            mgmt_timer: settings.active_block_mgmt_interval,
            abm_timer: 0.0,
            liquid_timer: 0.0,
            save_timer: 0.0,
            settings,
        }
    }

    /// Replaces the climate fields; tests pin them to constants.
    pub fn with_climate(mut self, climate: Climate) -> Self {
        self.climate = climate;
        self
    }

    /// Re-seeds the rule RNG; tests use this for reproducible draws.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = fastrand::Rng::with_seed(seed);
        self
    }

    /// Shared handle to the block store.
    pub fn map(&self) -> MtResource<Map> {
        self.map.clone()
    }

    /// The content registry.
    pub fn registry(&self) -> &ContentRegistry {
        &self.registry
    }

    /// Shared handle to the content registry.
    pub fn registry_arc(&self) -> Arc<ContentRegistry> {
        self.registry.clone()
    }

    /// The settings this environment was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Elapsed simulation time, seconds.
    pub fn game_time(&self) -> f64 {
        self.game_time
    }

    /// The active object registry.
    pub fn objects(&self) -> &ActiveObjectMgr {
        &self.objects
    }

    /// Mutable access to the object registry, for registration.
    pub fn objects_mut(&mut self) -> &mut ActiveObjectMgr {
        &mut self.objects
    }

    /// Registers a rule with the scheduler.
    pub fn add_abm(&mut self, abm: Box<dyn ActiveBlockModifier>) {
        self.scheduler.register(abm, &self.registry);
    }

    /// Registers an object after checking the per-block population cap, the
    /// damper against runaway spawners.
    pub fn add_object(&mut self, obj: Box<dyn ActiveObject>) -> Option<ObjectId> {
        let pos = obj.base_position();
        let bp = node_to_block_pos(NodePos::new(
            pos.x.floor() as i16,
            pos.y.floor() as i16,
            pos.z.floor() as i16,
        ));
        let (count, _) = self.block_object_counts(bp);
        if count >= self.settings.max_objects_per_block as u32 {
            warn!("refusing object at {bp:?}: block already holds {count} objects");
            return None;
        }
        self.objects.register_object(obj)
    }

    /// The current active block set.
    pub fn active_blocks(&self) -> &HashSet<BlockPos> {
        &self.active_blocks
    }

    /// A load snapshot for stats logging.
    pub fn stats(&self) -> EnvStats {
        EnvStats {
            blocks_loaded: self.map.get().blocks_loaded(),
            active_blocks: self.active_blocks.len(),
            objects: self.objects.len(),
            liquid_queue: self.liquid.queue_len(),
            pending_emerge: self.emerge.as_ref().map_or(0, EmergeManager::pending),
        }
    }

    /// Advances the simulation by `dtime` seconds.
    pub fn step(&mut self, dtime: f32) {
        self.game_time += dtime as f64;

        self.objects.step(dtime, |handle, dtime| {
            handle.get_mut().step(dtime);
        });
        self.objects.sweep_removed();

        self.mgmt_timer += dtime;
        if self.mgmt_timer >= self.settings.active_block_mgmt_interval {
            self.mgmt_timer = 0.0;
            self.update_active_blocks();
        }

        self.ingest_emerged();

        self.abm_timer += dtime;
        if self.abm_timer >= self.settings.abm_interval {
            let due = self.scheduler.advance(self.abm_timer);
            self.abm_timer = 0.0;
            if !due.is_empty() && !self.active_blocks.is_empty() {
                let blocks: Vec<BlockPos> = self.active_blocks.iter().copied().collect();
                self.abm_pass(&blocks, &due, false);
            }
        }

        self.step_node_timers(dtime);

        self.liquid_timer += dtime;
        if self.liquid_timer >= self.settings.liquid_update {
            self.liquid_timer = 0.0;
            let modified = {
                let map_handle = self.map.clone();
                let map = map_handle.get();
                self.liquid
                    .step(&map, self.settings.liquid_loop_max, LIQUID_BUDGET_MS)
            };
            for bp in modified {
                self.lighting_queue.push_back(bp);
            }
        }

        self.process_lighting_queue();

        self.save_timer += dtime;
        if self.save_timer >= self.settings.server_map_save_interval {
            self.save_timer = 0.0;
            self.map.get_mut().save_modified_blocks();
        }
        self.map.get_mut().timer_update(
            dtime,
            self.settings.server_unload_unused_data_timeout,
            UNLOAD_BUDGET_MS,
            None,
        );
    }

    /// Recomputes the active block set from player positions, requesting
    /// emerges for blocks that are not loaded yet and activating blocks that
    /// just entered the set.
    fn update_active_blocks(&mut self) {
        let range = self.settings.active_block_range;
        let players = self.objects.player_positions();
        let mut wanted = HashSet::new();
        let mut missing = Vec::new();
        {
            let map_handle = self.map.clone();
            let map = map_handle.get();
            for ppos in players {
                let pnode = NodePos::new(
                    ppos.x.floor() as i16,
                    ppos.y.floor() as i16,
                    ppos.z.floor() as i16,
                );
                let center = node_to_block_pos(pnode);
                for dx in -range..=range {
                    for dy in -range..=range {
                        for dz in -range..=range {
                            let bp =
                                BlockPos::new(center.x + dx, center.y + dy, center.z + dz);
                            if blockpos_over_limit(bp) {
                                continue;
                            }
                            match map.get_block(bp) {
                                Some(block) if block.get().is_generated() => {
                                    wanted.insert(bp);
                                }
                                _ => missing.push(bp),
                            }
                        }
                    }
                }
            }
        }

        if let Some(emerge) = self.emerge.as_mut() {
            for bp in missing {
                emerge.request_block(bp);
            }
        }

        let newly: Vec<BlockPos> = wanted.difference(&self.active_blocks).copied().collect();
        self.active_blocks = wanted;
        if newly.is_empty() {
            return;
        }
        {
            let map_handle = self.map.clone();
            let map = map_handle.get();
            for &bp in &newly {
                queue_block_liquids(&mut self.liquid, &map, bp);
                if map
                    .get_block(bp)
                    .is_some_and(|block| block.get().is_lighting_expired())
                {
                    self.lighting_queue.push_back(bp);
                }
            }
        }
        debug!("{} blocks activated", newly.len());
        self.abm_pass(&newly, &[], true);
    }

    /// Runs the due rules over the given blocks, bounded by the configured
    /// time budget. Activation passes (`activate`) always finish: skipping a
    /// block's catch-up would lose it for good.
    fn abm_pass(&mut self, blocks: &[BlockPos], due: &[usize], activate: bool) {
        let start = Instant::now();
        let map_handle = self.map.clone();
        let map = map_handle.get();
        for &bp in blocks {
            if !activate && start.elapsed().as_secs_f32() > self.settings.abm_time_budget {
                debug!("abm pass out of budget; remaining blocks wait for the next interval");
                break;
            }
            let Some(block) = map.get_block(bp) else {
                continue;
            };
            let (count, wider) = self.block_object_counts(bp);
            let mut ctx = AbmContext {
                map: &map,
                climate: &self.climate,
                rng: &mut self.rng,
                game_time: self.game_time,
            };
            self.scheduler
                .apply_block(&mut ctx, &block, due, count, wider, activate);
        }
    }

    fn block_object_counts(&self, bp: BlockPos) -> (u32, u32) {
        let origin = block_to_node_origin(bp);
        let size = MAP_BLOCKSIZE as f32;
        let min = Point3::new(origin.x as f32, origin.y as f32, origin.z as f32);
        let max = Point3::new(min.x + size, min.y + size, min.z + size);
        let count = self.objects.objects_in_area(min, max, |_| true).len() as u32;
        let wider_min = Point3::new(min.x - size, min.y - size, min.z - size);
        let wider_max = Point3::new(max.x + size, max.y + size, max.z + size);
        let wider = self
            .objects
            .objects_in_area(wider_min, wider_max, |_| true)
            .len() as u32;
        (count, wider)
    }

    /// Drains the emerge completion queue into the map. Called once per
    /// tick.
    fn ingest_emerged(&mut self) {
        let replies = match self.emerge.as_mut() {
            Some(emerge) => {
                emerge.process_queued();
                emerge.collect_replies()
            }
            None => return,
        };
        for reply in replies {
            match reply {
                EmergeReply::Loaded { pos, block } | EmergeReply::Generated { pos, block } => {
                    self.map.get_mut().insert_block(block);
                    {
                        let map_handle = self.map.clone();
                        let map = map_handle.get();
                        queue_block_liquids(&mut self.liquid, &map, pos);
                    }
                    self.lighting_queue.push_back(pos);
                }
                EmergeReply::Failed { pos } => {
                    warn!("block {pos:?} can never be emerged");
                }
            }
        }
    }

    /// Advances node timers in the active blocks. Elapsed timers accumulate
    /// until [`ServerEnvironment::take_elapsed_node_timers`] collects them;
    /// the callbacks themselves belong to the scripting layer above this
    /// crate.
    fn step_node_timers(&mut self, dtime: f32) {
        let map_handle = self.map.clone();
        let map = map_handle.get();
        for &bp in &self.active_blocks {
            let Some(block) = map.get_block(bp) else {
                continue;
            };
            if block.get().node_timers().is_empty() {
                continue;
            }
            let elapsed = block.get_mut().node_timers_mut().step(dtime);
            let origin = block_to_node_origin(bp);
            for (local, timer) in elapsed {
                self.elapsed_timers.push((
                    NodePos::new(origin.x + local.x, origin.y + local.y, origin.z + local.z),
                    timer,
                ));
            }
        }
    }

    /// Takes the node timers that elapsed since the last call, with the
    /// world positions they were attached to.
    pub fn take_elapsed_node_timers(&mut self) -> Vec<(NodePos, NodeTimer)> {
        std::mem::take(&mut self.elapsed_timers)
    }

    fn process_lighting_queue(&mut self) {
        if self.lighting_queue.is_empty() {
            return;
        }
        let map_handle = self.map.clone();
        let map = map_handle.get();
        for _ in 0..LIGHTING_REPAIRS_PER_TICK {
            let Some(bp) = self.lighting_queue.pop_front() else {
                break;
            };
            repair_block_lighting(&map, bp);
        }
    }

    /// Stops the emerge workers and writes every modified block out.
    pub fn save_and_shutdown(&mut self) {
        self.emerge = None;
        let (saved, failed) = self.map.get_mut().save_modified_blocks();
        info!("shutdown: {saved} blocks saved, {failed} failed");
    }
}
