//! # Liquid Module
//!
//! Per-tick liquid settling over a deduplicated work queue. Positions are
//! enqueued whenever something near them changes (placement, removal, map
//! generation, a neighbor's flow) and the engine pops a bounded batch each
//! step, so one tick never stalls on an ocean draining.
//!
//! ## Flow model
//!
//! Sources hold a fixed maximal level and are never decremented. Flowing
//! nodes carry a 0-7 level in `param2`; a node's settled level is derived
//! from its neighbors: anything liquid directly above feeds the full level,
//! and a horizontal neighbor feeds its own level minus one, but only while
//! that neighbor cannot flow down itself (gravity first, sideways second). A
//! flowing node that loses all feeders reverts to air. Two horizontally
//! adjacent sources regenerate a renewable source between them.
//!
//! Every change re-enqueues the six neighbors, so partial progress is picked
//! up by later steps; the queue persists across calls and is never rebuilt
//! from scratch.

use std::collections::HashSet;
use std::time::Instant;

use cgmath::Vector3;
use log::trace;

use crate::core::UniqueQueue;
use crate::world_state::content::{ContentRegistry, LiquidType};
use crate::world_state::map::Map;
use crate::world_state::node::{MapNode, CONTENT_AIR, LIQUID_FLOW_DOWN_MASK, LIQUID_LEVEL_MAX};
use crate::world_state::position::{node_to_block_pos, BlockPos, NodePos, DIRS_6};

const UP: Vector3<i16> = Vector3::new(0, 1, 0);
const DOWN: Vector3<i16> = Vector3::new(0, -1, 0);
const SIDES: [Vector3<i16>; 4] = [
    Vector3::new(1, 0, 0),
    Vector3::new(-1, 0, 0),
    Vector3::new(0, 0, 1),
    Vector3::new(0, 0, -1),
];

/// The effective liquid level of a node: maximal for sources, the `param2`
/// level for flowing nodes, zero for everything else.
pub fn node_liquid_level(registry: &ContentRegistry, node: MapNode) -> u8 {
    match registry.get(node.content).liquid_type {
        LiquidType::Source => LIQUID_LEVEL_MAX,
        LiquidType::Flowing => node.liquid_level(),
        LiquidType::None => 0,
    }
}

/// Lowers a liquid node to the given level, converting a source into its
/// flowing alternative when necessary. Used by rules that drink from the
/// map (tree growth). No-op on non-liquids.
pub fn set_node_liquid_level(registry: &ContentRegistry, node: &mut MapNode, level: u8) {
    let features = registry.get(node.content);
    match features.liquid_type {
        LiquidType::Source if level < LIQUID_LEVEL_MAX => {
            if let Some(flowing) = registry.get_id(&features.liquid_alternative_flowing) {
                *node = MapNode::new(flowing);
                node.set_liquid_level(level);
            }
        }
        LiquidType::Flowing => node.set_liquid_level(level),
        _ => {}
    }
}

/// The per-tick liquid transform. See the module documentation.
pub struct LiquidEngine {
    queue: UniqueQueue<NodePos>,
}

impl LiquidEngine {
    /// Creates an engine with an empty queue.
    pub fn new() -> Self {
        Self {
            queue: UniqueQueue::new(),
        }
    }

    /// Queues a position for settling. Duplicates are ignored.
    pub fn enqueue(&mut self, pos: NodePos) {
        self.queue.push_back(pos);
    }

    /// Number of positions waiting to be processed.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Processes up to `max_nodes` queued positions within `max_cycle_ms`
    /// milliseconds. Remaining queue state persists for the next call.
    /// Returns the blocks whose stored nodes changed; each has been marked
    /// modified and lighting-expired.
    pub fn step(&mut self, map: &Map, max_nodes: usize, max_cycle_ms: u64) -> HashSet<BlockPos> {
        let start = Instant::now();
        let mut modified = HashSet::new();
        // Positions whose block was missing; retried on a later step.
        let mut deferred = Vec::new();

        let budget = max_nodes.min(self.queue.len());
        for _ in 0..budget {
            if start.elapsed().as_millis() as u64 >= max_cycle_ms {
                break;
            }
            let Some(p) = self.queue.pop_front() else { break };
            match self.transform(map, p, &mut modified) {
                TransformResult::Done => {}
                TransformResult::BlockMissing => deferred.push(p),
            }
        }

        for p in deferred {
            self.queue.push_back(p);
        }
        if !modified.is_empty() {
            trace!("liquid step modified {} blocks", modified.len());
        }
        modified
    }

    fn transform(
        &mut self,
        map: &Map,
        p: NodePos,
        modified: &mut HashSet<BlockPos>,
    ) -> TransformResult {
        let registry = map.registry();
        let Some(node) = map.get_node_opt(p) else {
            return TransformResult::BlockMissing;
        };
        let features = registry.get(node.content);

        match features.liquid_type {
            LiquidType::Source => {
                // Sources never change; they only wake their surroundings.
                for dir in [DOWN, SIDES[0], SIDES[1], SIDES[2], SIDES[3]] {
                    let np = p + dir;
                    if let Some(n) = map.get_node_opt(np) {
                        let nf = registry.get(n.content);
                        if nf.buildable_to || nf.liquid_type == LiquidType::Flowing {
                            self.queue.push_back(np);
                        }
                    }
                }
                TransformResult::Done
            }
            LiquidType::Flowing => {
                let settled = self.settle(map, p);
                let current = node.liquid_level();
                match settled {
                    Settled::Source(content) => {
                        self.write(map, p, MapNode::new(content), modified);
                    }
                    Settled::Level(level, flow_down) if level != current => {
                        let mut n = node;
                        n.set_liquid_level(level);
                        n.param2 = if flow_down {
                            n.param2 | LIQUID_FLOW_DOWN_MASK
                        } else {
                            n.param2 & !LIQUID_FLOW_DOWN_MASK
                        };
                        self.write(map, p, n, modified);
                    }
                    Settled::Level(..) => {}
                    Settled::Dry => {
                        self.write(map, p, MapNode::new(CONTENT_AIR), modified);
                    }
                }
                TransformResult::Done
            }
            LiquidType::None if features.buildable_to => {
                match self.settle(map, p) {
                    Settled::Source(content) => {
                        self.write(map, p, MapNode::new(content), modified);
                    }
                    Settled::Level(level, flow_down) => {
                        // A floodable node starts flowing once anything feeds it.
                        if let Some(flowing) = self.inflow_content(map, p) {
                            let mut n = MapNode::new(flowing);
                            n.set_liquid_level(level);
                            if flow_down {
                                n.param2 |= LIQUID_FLOW_DOWN_MASK;
                            }
                            self.write(map, p, n, modified);
                        }
                    }
                    Settled::Dry => {}
                }
                TransformResult::Done
            }
            LiquidType::None => TransformResult::Done,
        }
    }

    /// Computes the settled state of the node at `p` from its neighborhood.
    fn settle(&self, map: &Map, p: NodePos) -> Settled {
        let registry = map.registry();

        let mut best: i8 = -1;

        // Anything liquid directly above feeds the full level.
        if let Some(top) = map.get_node_opt(p + UP) {
            if registry.get(top.content).is_liquid() {
                best = LIQUID_LEVEL_MAX as i8;
            }
        }

        let mut horizontal_sources = 0u32;
        let mut renewable = false;
        for dir in SIDES {
            let Some(side) = map.get_node_opt(p + dir) else {
                continue;
            };
            let sf = registry.get(side.content);
            if !sf.is_liquid() {
                continue;
            }
            if sf.liquid_type == LiquidType::Source {
                horizontal_sources += 1;
                renewable = sf.liquid_renewable;
            }
            // Gravity first: a neighbor that can still fall feeds nothing
            // sideways.
            if self.can_flow_down(map, p + dir) {
                continue;
            }
            let contribution = match sf.liquid_type {
                LiquidType::Source => LIQUID_LEVEL_MAX as i8,
                LiquidType::Flowing => side.liquid_level() as i8 - 1,
                LiquidType::None => -1,
            };
            best = best.max(contribution);
        }

        if horizontal_sources >= 2 && renewable {
            if let Some(source) = self.source_content(map, p) {
                return Settled::Source(source);
            }
        }

        if best < 1 {
            return Settled::Dry;
        }
        Settled::Level(best as u8, self.can_flow_down(map, p))
    }

    /// Whether liquid standing at `p` would keep falling: the node below is
    /// floodable or an unfinished flowing column. Missing blocks count as
    /// solid ground so flow stalls at the loaded boundary instead of
    /// vanishing into it.
    fn can_flow_down(&self, map: &Map, p: NodePos) -> bool {
        let registry = map.registry();
        let Some(below) = map.get_node_opt(p + DOWN) else {
            return false;
        };
        let bf = registry.get(below.content);
        bf.buildable_to
            || (bf.liquid_type == LiquidType::Flowing
                && below.liquid_level() < LIQUID_LEVEL_MAX)
    }

    /// The flowing content of whatever liquid family touches `p`.
    fn inflow_content(&self, map: &Map, p: NodePos) -> Option<crate::world_state::content::ContentId> {
        let registry = map.registry();
        let mut dirs = vec![UP];
        dirs.extend(SIDES);
        for dir in dirs {
            let Some(n) = map.get_node_opt(p + dir) else {
                continue;
            };
            let nf = registry.get(n.content);
            if nf.is_liquid() {
                return registry.get_id(&nf.liquid_alternative_flowing);
            }
        }
        None
    }

    /// The source content of whatever liquid family touches `p` from the
    /// sides.
    fn source_content(&self, map: &Map, p: NodePos) -> Option<crate::world_state::content::ContentId> {
        let registry = map.registry();
        for dir in SIDES {
            let Some(n) = map.get_node_opt(p + dir) else {
                continue;
            };
            let nf = registry.get(n.content);
            if nf.liquid_type == LiquidType::Source {
                return registry.get_id(&nf.liquid_alternative_source);
            }
        }
        None
    }

    fn write(&mut self, map: &Map, p: NodePos, node: MapNode, modified: &mut HashSet<BlockPos>) {
        if map.set_node(p, node) {
            let block_pos = node_to_block_pos(p);
            modified.insert(block_pos);
            if let Some(block) = map.get_block(block_pos) {
                block.get_mut().set_lighting_expired(true);
            }
            for dir in DIRS_6 {
                self.queue.push_back(p + dir);
            }
        }
    }
}

impl Default for LiquidEngine {
    fn default() -> Self {
        Self::new()
    }
}

enum TransformResult {
    Done,
    BlockMissing,
}

enum Settled {
    /// Regenerated into a source between two sources.
    Source(crate::world_state::content::ContentId),
    /// A flowing node at this level; the flag is the falling-column bit.
    Level(u8, bool),
    /// Nothing feeds this node.
    Dry,
}

/// Scans a block for liquid nodes and queues them, used after generation or
/// load so settled state is re-checked under current surroundings.
pub fn queue_block_liquids(engine: &mut LiquidEngine, map: &Map, block_pos: BlockPos) {
    use crate::world_state::position::{block_to_node_origin, index_to_local, MAP_BLOCK_NODES};

    let Some(block) = map.get_block(block_pos) else {
        return;
    };
    let origin = block_to_node_origin(block_pos);
    let registry = map.registry();
    let guard = block.get();
    for idx in 0..MAP_BLOCK_NODES {
        let node = guard.node(idx);
        if registry.get(node.content).is_liquid() {
            let local = index_to_local(idx);
            engine.enqueue(NodePos::new(
                origin.x + local.x,
                origin.y + local.y,
                origin.z + local.z,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_state::content::{BuiltinContent, ContentRegistry};
    use cgmath::Point3;
    use std::sync::Arc;

    /// A map with one air-filled block at the origin.
    fn air_map() -> Map {
        let mut map = Map::new(Arc::new(ContentRegistry::with_builtin()), None, false);
        let block = map.create_blank_block(Point3::new(0, 0, 0));
        {
            let mut guard = block.get_mut();
            for node in guard.nodes_mut().iter_mut() {
                *node = MapNode::new(CONTENT_AIR);
            }
            guard.set_generated();
        }
        map
    }

    fn stone() -> MapNode {
        MapNode::new(BuiltinContent::Stone.id())
    }

    fn flowing(level: u8) -> MapNode {
        let mut n = MapNode::new(BuiltinContent::WaterFlowing.id());
        n.set_liquid_level(level);
        n
    }

    /// Builds a stone basin: floor at y=0, walls around x,z in 4..=8, open
    /// interior 5..=7.
    fn basin(map: &Map) {
        for x in 4..=8 {
            for z in 4..=8 {
                map.set_node(Point3::new(x, 0, z), stone());
                if x == 4 || x == 8 || z == 4 || z == 8 {
                    for y in 1..=4 {
                        map.set_node(Point3::new(x, y, z), stone());
                    }
                }
            }
        }
    }

    fn total_volume(map: &Map, registry: &ContentRegistry) -> u32 {
        let block = map.get_block(Point3::new(0, 0, 0)).unwrap();
        let guard = block.get();
        (0..crate::world_state::position::MAP_BLOCK_NODES)
            .map(|i| {
                let n = guard.node(i);
                if registry.get(n.content).liquid_type == LiquidType::Flowing {
                    node_liquid_level(registry, n) as u32
                } else {
                    0
                }
            })
            .sum()
    }

    #[test]
    fn source_floods_its_surroundings() {
        let map = air_map();
        basin(&map);
        let source_pos = Point3::new(6, 1, 6);
        map.set_node(source_pos, MapNode::new(BuiltinContent::WaterSource.id()));

        let mut engine = LiquidEngine::new();
        engine.enqueue(source_pos);
        for _ in 0..50 {
            if engine.step(&map, 10_000, 100).is_empty() && engine.queue_len() == 0 {
                break;
            }
        }

        // Horizontal neighbors of the source settle at the maximal flowing
        // level; their neighbors one lower.
        let n = map.get_node(Point3::new(7, 1, 6));
        assert_eq!(n.content, BuiltinContent::WaterFlowing.id());
        assert_eq!(n.liquid_level(), LIQUID_LEVEL_MAX);
        let n = map.get_node(Point3::new(7, 1, 7));
        assert_eq!(n.content, BuiltinContent::WaterFlowing.id());
        assert_eq!(n.liquid_level(), LIQUID_LEVEL_MAX - 1);
        // The source itself is untouched.
        assert_eq!(
            map.get_node(source_pos).content,
            BuiltinContent::WaterSource.id()
        );
    }

    #[test]
    fn closed_basin_conserves_and_converges() {
        let map = air_map();
        let registry = map.registry_arc();
        // Sealed 1x1 pit: flowing water stacked with nothing sustaining it.
        for y in 0..=4 {
            for dx in -1..=1i16 {
                for dz in -1..=1i16 {
                    if dx != 0 || dz != 0 {
                        map.set_node(Point3::new(6 + dx, y, 6 + dz), stone());
                    }
                }
            }
        }
        map.set_node(Point3::new(6, 0, 6), stone());
        let mut engine = LiquidEngine::new();
        for y in 1..=3 {
            map.set_node(Point3::new(6, y, 6), flowing(LIQUID_LEVEL_MAX));
            engine.enqueue(Point3::new(6, y, 6));
        }

        let mut volume = total_volume(&map, &registry);
        let mut steps = 0;
        loop {
            let modified = engine.step(&map, 10_000, 100);
            let new_volume = total_volume(&map, &registry);
            assert!(new_volume <= volume, "volume must never increase");
            volume = new_volume;
            if modified.is_empty() && engine.queue_len() == 0 {
                break;
            }
            steps += 1;
            assert!(steps < 100, "basin must converge in bounded steps");
        }
        // Unsustained flowing water dries up entirely.
        assert_eq!(total_volume(&map, &registry), 0);
    }

    #[test]
    fn budget_preserves_queue_across_calls() {
        let map = air_map();
        basin(&map);
        let source_pos = Point3::new(6, 1, 6);
        map.set_node(source_pos, MapNode::new(BuiltinContent::WaterSource.id()));

        let mut engine = LiquidEngine::new();
        engine.enqueue(source_pos);
        // One node of budget: the source only wakes its neighbors.
        engine.step(&map, 1, 100);
        assert!(engine.queue_len() > 0, "remaining work stays queued");

        for _ in 0..200 {
            engine.step(&map, 2, 100);
        }
        assert_eq!(
            map.get_node(Point3::new(7, 1, 6)).content,
            BuiltinContent::WaterFlowing.id()
        );
    }

    #[test]
    fn two_sources_renew_between_them() {
        let map = air_map();
        basin(&map);
        let a = Point3::new(5, 1, 6);
        let b = Point3::new(7, 1, 6);
        map.set_node(a, MapNode::new(BuiltinContent::WaterSource.id()));
        map.set_node(b, MapNode::new(BuiltinContent::WaterSource.id()));

        let mut engine = LiquidEngine::new();
        engine.enqueue(a);
        engine.enqueue(b);
        for _ in 0..50 {
            engine.step(&map, 10_000, 100);
        }

        assert_eq!(
            map.get_node(Point3::new(6, 1, 6)).content,
            BuiltinContent::WaterSource.id()
        );
    }

    #[test]
    fn water_prefers_falling_over_spreading() {
        let map = air_map();
        // A ledge at y=5 with a source on it; the neighbor over the edge at
        // y=5 gets a falling column, not a sideways puddle at y=5.
        map.set_node(Point3::new(5, 4, 5), stone());
        let source_pos = Point3::new(5, 5, 5);
        map.set_node(source_pos, MapNode::new(BuiltinContent::WaterSource.id()));

        let mut engine = LiquidEngine::new();
        engine.enqueue(source_pos);
        for _ in 0..100 {
            engine.step(&map, 10_000, 100);
        }

        // Next to the source: full flowing (spread allowed, its floor is the
        // void so it is also falling).
        let beside = map.get_node(Point3::new(6, 5, 5));
        assert_eq!(beside.content, BuiltinContent::WaterFlowing.id());
        assert!(beside.param2 & LIQUID_FLOW_DOWN_MASK != 0);
        // It does not feed its own horizontal neighbors while falling.
        assert_eq!(map.get_node(Point3::new(7, 5, 5)).content, CONTENT_AIR);
        // The column below it is full-level falling water.
        let below = map.get_node(Point3::new(6, 4, 5));
        assert_eq!(below.content, BuiltinContent::WaterFlowing.id());
        assert_eq!(below.liquid_level(), LIQUID_LEVEL_MAX);
    }
}
