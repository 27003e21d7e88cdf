//! # Lighting Module
//!
//! Worklist light propagation over the 6-connected node graph. Each node
//! stores two 4-bit light banks: day (sunlight, level 15 travels downward
//! without attenuation) and night (artificial sources, at most 14). Light
//! loses one level per step otherwise.
//!
//! Two passes exist:
//! - **spread**: after a light increase (source placed, opaque node removed),
//!   push the brightest known values outward until no neighbor would improve.
//! - **unspread**: after a light decrease (source removed, opaque node
//!   placed), erase every light value that was derived from the removed
//!   light, collecting still-lit border nodes as re-propagation seeds, then
//!   spread those back into the vacated space.
//!
//! Propagation never crosses into a block that is not loaded: the missing
//! neighbor is treated as opaque and the loaded block keeps its
//! lighting-expired flag so the full re-light happens once the neighbor
//! arrives.

use std::collections::{HashMap, HashSet, VecDeque};

use bitvec::bitbox;
use bitvec::boxed::BitBox;
use cgmath::Vector3;

use crate::world_state::block::MapBlock;
use crate::world_state::content::ContentRegistry;
use crate::world_state::map::Map;
use crate::world_state::node::{LightBank, LIGHT_SUN};
use crate::world_state::position::{
    index_to_local, local_index, node_to_block_pos, node_to_local, BlockPos, NodePos, DIRS_6,
    MAP_BLOCKSIZE, MAP_BLOCK_NODES,
};

const DOWN: Vector3<i16> = Vector3::new(0, -1, 0);

/// Tracks which nodes are currently queued, one bit per node per touched
/// block, so the BFS never holds duplicate queue entries.
#[derive(Default)]
struct EnqueuedSet {
    blocks: HashMap<BlockPos, BitBox>,
}

impl EnqueuedSet {
    /// Marks a node queued. Returns `false` when it already was.
    fn insert(&mut self, p: NodePos) -> bool {
        let bits = self
            .blocks
            .entry(node_to_block_pos(p))
            .or_insert_with(|| bitbox![0; MAP_BLOCK_NODES]);
        let idx = local_index(node_to_local(p));
        let was = bits.replace(idx, true);
        !was
    }

    fn remove(&mut self, p: NodePos) {
        if let Some(bits) = self.blocks.get_mut(&node_to_block_pos(p)) {
            bits.set(local_index(node_to_local(p)), false);
        }
    }
}

/// The light propagation pass. Stateless between calls; construct one per
/// operation.
#[derive(Default)]
pub struct LightingEngine;

impl LightingEngine {
    /// Creates a lighting engine.
    pub fn new() -> Self {
        Self
    }

    /// Restores lighting invariants around the given changed node positions.
    ///
    /// With `removal = false` the pass assumes light may only have increased
    /// (a source appeared or an obstruction vanished) and spreads outward.
    /// With `removal = true` it assumes the nodes are about to lose their
    /// light contribution (they are called with the *old* content still in
    /// place) and erases derived light before re-spreading what remains.
    ///
    /// Returns every block whose stored nodes changed; all of them have been
    /// marked modified and lighting-expired.
    pub fn propagate_from(
        &self,
        map: &Map,
        changed: &[NodePos],
        removal: bool,
    ) -> HashSet<BlockPos> {
        let mut touched = HashSet::new();
        for bank in [LightBank::Day, LightBank::Night] {
            if removal {
                self.unspread(map, changed, bank, &mut touched);
            } else {
                self.spread_seeded(map, changed, bank, &mut touched);
            }
        }
        touched
    }

    /// Spread pass seeded with the changed nodes and their neighbors, so
    /// light flows both out of a new source and into newly vacated space.
    fn spread_seeded(
        &self,
        map: &Map,
        changed: &[NodePos],
        bank: LightBank,
        touched: &mut HashSet<BlockPos>,
    ) {
        let mut queue = VecDeque::new();
        let mut enqueued = EnqueuedSet::default();
        for &p in changed {
            if enqueued.insert(p) {
                queue.push_back(p);
            }
            for dir in DIRS_6 {
                let np = p + dir;
                if enqueued.insert(np) {
                    queue.push_back(np);
                }
            }
        }
        self.spread(map, queue, &mut enqueued, bank, touched);
    }

    fn spread(
        &self,
        map: &Map,
        mut queue: VecDeque<NodePos>,
        enqueued: &mut EnqueuedSet,
        bank: LightBank,
        touched: &mut HashSet<BlockPos>,
    ) {
        let registry = map.registry();
        while let Some(p) = queue.pop_front() {
            enqueued.remove(p);
            // Missing block: treated as opaque until it loads.
            let Some(node) = map.get_node_opt(p) else {
                continue;
            };
            let features = registry.get(node.content);

            let mut my_light = if features.param_has_light() {
                node.light(bank)
            } else {
                0
            };
            if features.light_source > my_light {
                my_light = features.light_source;
                set_light(map, p, bank, my_light, touched);
            }
            if my_light <= 1 {
                continue;
            }

            for dir in DIRS_6 {
                let np = p + dir;
                let Some(neighbor) = map.get_node_opt(np) else {
                    continue;
                };
                let nf = registry.get(neighbor.content);
                if !nf.light_propagates {
                    continue;
                }
                // Full sunlight columns keep level 15 going straight down.
                let candidate = if bank == LightBank::Day
                    && my_light == LIGHT_SUN
                    && dir == DOWN
                    && nf.sunlight_propagates
                {
                    LIGHT_SUN
                } else {
                    my_light - 1
                };
                if neighbor.light(bank) < candidate {
                    set_light(map, np, bank, candidate, touched);
                    if enqueued.insert(np) {
                        queue.push_back(np);
                    }
                }
            }
        }
    }

    /// Seeds a spread pass with exactly the given positions.
    pub(crate) fn spread_from(
        &self,
        map: &Map,
        positions: &[NodePos],
        bank: LightBank,
        touched: &mut HashSet<BlockPos>,
    ) {
        let mut queue = VecDeque::new();
        let mut enqueued = EnqueuedSet::default();
        for &p in positions {
            if enqueued.insert(p) {
                queue.push_back(p);
            }
        }
        self.spread(map, queue, &mut enqueued, bank, touched);
    }

    fn unspread(
        &self,
        map: &Map,
        changed: &[NodePos],
        bank: LightBank,
        touched: &mut HashSet<BlockPos>,
    ) {
        let relight = self.unspread_collect(map, changed, bank, touched);
        self.spread_from(map, &relight, bank, touched);
    }

    /// Erases all light derived from the changed nodes and returns the
    /// still-lit border nodes to re-propagate from. Kept separate from the
    /// re-spread so node placement can happen in between; re-lighting before
    /// the mutation would let light leak through the node being placed.
    pub(crate) fn unspread_collect(
        &self,
        map: &Map,
        changed: &[NodePos],
        bank: LightBank,
        touched: &mut HashSet<BlockPos>,
    ) -> Vec<NodePos> {
        let registry = map.registry();
        // (position, light the node held before it was darkened)
        let mut queue: VecDeque<(NodePos, u8)> = VecDeque::new();
        let mut relight: Vec<NodePos> = Vec::new();

        for &p in changed {
            let Some(node) = map.get_node_opt(p) else {
                continue;
            };
            if !registry.get(node.content).param_has_light() {
                continue;
            }
            let old = node.light(bank);
            if old == 0 {
                continue;
            }
            set_light(map, p, bank, 0, touched);
            queue.push_back((p, old));
        }

        while let Some((p, old_light)) = queue.pop_front() {
            for dir in DIRS_6 {
                let np = p + dir;
                let Some(neighbor) = map.get_node_opt(np) else {
                    continue;
                };
                let nf = registry.get(neighbor.content);
                if !nf.param_has_light() {
                    continue;
                }
                let nl = neighbor.light(bank);
                if nl == 0 {
                    continue;
                }
                // Sunlight below a removed sunlit node does not attenuate,
                // so equality still means "derived from us".
                let derived = nl < old_light
                    || (bank == LightBank::Day
                        && old_light == LIGHT_SUN
                        && nl == LIGHT_SUN
                        && dir == DOWN);
                if derived {
                    set_light(map, np, bank, 0, touched);
                    queue.push_back((np, nl));
                    // A darkened source re-lights itself in the next pass.
                    if nf.light_source > 0 {
                        relight.push(np);
                    }
                } else {
                    // Independently lit; it will refill the vacated space.
                    relight.push(np);
                }
            }
        }

        relight
    }
}

fn set_light(
    map: &Map,
    p: NodePos,
    bank: LightBank,
    level: u8,
    touched: &mut HashSet<BlockPos>,
) {
    let block_pos = node_to_block_pos(p);
    let Some(block) = map.get_block(block_pos) else {
        return;
    };
    let mut guard = block.get_mut();
    let local = node_to_local(p);
    let mut node = guard.node_at(local);
    if !map.registry().get(node.content).param_has_light() {
        return;
    }
    if node.light(bank) != level {
        node.set_light(bank, level);
        guard.set_node_at(local, node);
        guard.set_lighting_expired(true);
        touched.insert(block_pos);
    }
}

/// Seeds the day bank of a freshly generated block by walking each column
/// from the top, assuming open sky above. Columns stop at the first content
/// that does not pass sunlight. Cross-block correction happens later through
/// the regular propagation pass.
pub fn seed_sunlight(block: &mut MapBlock, registry: &ContentRegistry) {
    for z in 0..MAP_BLOCKSIZE {
        for x in 0..MAP_BLOCKSIZE {
            for y in (0..MAP_BLOCKSIZE).rev() {
                let local = cgmath::Point3::new(x, y, z);
                let mut node = block.node_at(local);
                if !registry.get(node.content).sunlight_propagates {
                    break;
                }
                if node.light(LightBank::Day) != LIGHT_SUN {
                    node.set_light(LightBank::Day, LIGHT_SUN);
                    block.set_node_at(local, node);
                }
            }
        }
    }
}

/// Recomputes both light banks of one loaded block from scratch.
///
/// Used when a block's stored light is wholly untrusted: after an emerge, or
/// after a liquid pass rewrote enough nodes that incremental repair is not
/// worth tracking. Every light value inside the block is erased, sunlight is
/// re-seeded from the block above (open sky is assumed when that block is not
/// loaded, matching how generation seeds fresh blocks), and light is then
/// spread back in from in-block sources, the sunlit columns, and the lit
/// nodes just outside the six faces. Clears the block's lighting-expired
/// flag. Returns every block whose stored nodes changed.
pub fn repair_block_lighting(map: &Map, block_pos: BlockPos) -> HashSet<BlockPos> {
    let mut touched = HashSet::new();
    let Some(block) = map.get_block(block_pos) else {
        return touched;
    };
    let registry = map.registry();
    let origin = crate::world_state::position::block_to_node_origin(block_pos);
    let to_world = |local: cgmath::Point3<i16>| {
        NodePos::new(origin.x + local.x, origin.y + local.y, origin.z + local.z)
    };

    let mut day_seeds: Vec<NodePos> = Vec::new();
    let mut night_seeds: Vec<NodePos> = Vec::new();
    {
        let mut guard = block.get_mut();
        let mut changed = false;
        for idx in 0..MAP_BLOCK_NODES {
            let mut node = guard.node(idx);
            let features = registry.get(node.content);
            if features.param_has_light()
                && (node.light(LightBank::Day) != 0 || node.light(LightBank::Night) != 0)
            {
                node.set_light(LightBank::Day, 0);
                node.set_light(LightBank::Night, 0);
                guard.set_node(idx, node);
                changed = true;
            }
            if features.light_source > 0 {
                night_seeds.push(to_world(index_to_local(idx)));
            }
        }

        // Sunlight columns, continuing whatever the block above ends with.
        for z in 0..MAP_BLOCKSIZE {
            for x in 0..MAP_BLOCKSIZE {
                let above = NodePos::new(origin.x + x, origin.y + MAP_BLOCKSIZE, origin.z + z);
                let sunlit = match map.get_node_opt(above) {
                    Some(n) => n.light(LightBank::Day) == LIGHT_SUN,
                    None => true,
                };
                if !sunlit {
                    continue;
                }
                for y in (0..MAP_BLOCKSIZE).rev() {
                    let local = cgmath::Point3::new(x, y, z);
                    let mut node = guard.node_at(local);
                    if !registry.get(node.content).sunlight_propagates {
                        break;
                    }
                    node.set_light(LightBank::Day, LIGHT_SUN);
                    guard.set_node_at(local, node);
                    changed = true;
                    day_seeds.push(to_world(local));
                }
            }
        }

        guard.set_lighting_expired(false);
        if changed {
            touched.insert(block_pos);
        }
    }

    // Lit nodes just outside the faces feed light back across the border.
    for a in 0..MAP_BLOCKSIZE {
        for b in 0..MAP_BLOCKSIZE {
            for p in [
                NodePos::new(origin.x - 1, origin.y + a, origin.z + b),
                NodePos::new(origin.x + MAP_BLOCKSIZE, origin.y + a, origin.z + b),
                NodePos::new(origin.x + a, origin.y - 1, origin.z + b),
                NodePos::new(origin.x + a, origin.y + MAP_BLOCKSIZE, origin.z + b),
                NodePos::new(origin.x + a, origin.y + b, origin.z - 1),
                NodePos::new(origin.x + a, origin.y + b, origin.z + MAP_BLOCKSIZE),
            ] {
                let Some(node) = map.get_node_opt(p) else {
                    continue;
                };
                if !registry.get(node.content).param_has_light() {
                    continue;
                }
                if node.light(LightBank::Day) > 1 {
                    day_seeds.push(p);
                }
                if node.light(LightBank::Night) > 1 {
                    night_seeds.push(p);
                }
            }
        }
    }

    let engine = LightingEngine::new();
    engine.spread_from(map, &day_seeds, LightBank::Day, &mut touched);
    engine.spread_from(map, &night_seeds, LightBank::Night, &mut touched);
    touched
}
