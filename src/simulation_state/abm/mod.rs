//! # Active Block Modifier Module
//!
//! Registered rules that fire probabilistically on matching nodes inside
//! active blocks: growth, decay, and whatever else the game layer hangs off
//! the world. A rule declares the contents it triggers on (names or
//! `group:<name>` specifiers), an interval, a 1-in-N chance, an optional
//! required-neighbor filter and a Y range; the scheduler resolves the name
//! sets to content ids once at registration and walks the active blocks each
//! interval.
//!
//! Rules receive an [`AbmContext`] instead of reaching for globals: the map,
//! the climate fields and a seeded random source all arrive by reference, so
//! every rule is testable with a fixed seed and a hand-built map.

pub mod grow_tree;

use std::collections::HashSet;

use log::debug;

use crate::core::MtResource;
use crate::simulation_state::environment::Climate;
use crate::world_state::block::MapBlock;
use crate::world_state::content::{ContentId, ContentRegistry};
use crate::world_state::map::Map;
use crate::world_state::node::MapNode;
use crate::world_state::position::{
    block_to_node_origin, index_to_local, NodePos, DIRS_6, MAP_BLOCK_NODES,
    MAX_MAP_GENERATION_LIMIT,
};

/// Everything a rule callback may touch, passed by reference per trigger.
pub struct AbmContext<'a> {
    /// The block store. Node reads and writes go through here; the rule is
    /// responsible for its own consistency across them.
    pub map: &'a Map,
    /// Climate fields for heat/humidity sampling.
    pub climate: &'a Climate,
    /// Seeded random source; all rule randomness draws from this.
    pub rng: &'a mut fastrand::Rng,
    /// Elapsed simulation time, seconds.
    pub game_time: f64,
}

impl<'a> AbmContext<'a> {
    /// Surface temperature around `pos`, cached per block.
    pub fn block_heat(&self, pos: NodePos) -> f32 {
        self.climate.block_heat(self.map, pos, self.game_time)
    }

    /// Humidity around `pos`, cached per block.
    pub fn block_humidity(&self, pos: NodePos) -> f32 {
        self.climate.block_humidity(self.map, pos, self.game_time)
    }

    /// Inclusive uniform draw from `0..=n`; `true` when it lands on zero.
    /// `n <= 0` therefore always passes, which is how forced ("debug fast")
    /// chances are expressed.
    pub fn roll(&mut self, n: i32) -> bool {
        n <= 0 || self.rng.i32(0..=n) == 0
    }
}

/// The brighter light bank of a node, respecting whether its content stores
/// light in `param1` at all. Contents that keep rule state there read as
/// dark.
pub fn node_light(registry: &ContentRegistry, node: &MapNode) -> u8 {
    if registry.get(node.content).param_has_light() {
        node.light_max()
    } else {
        0
    }
}

/// A registered per-node rule.
///
/// One level of polymorphism, no deeper: implementations are plain structs
/// holding their resolved parameters.
pub trait ActiveBlockModifier: Send {
    /// Content specifiers this rule triggers on: exact names or
    /// `group:<name>`.
    fn trigger_contents(&self) -> Vec<String>;

    /// Content specifiers of which at least one must appear among the six
    /// neighbors, or empty for no filter. Evaluated before the callback as a
    /// cheap pre-filter.
    fn required_neighbors(&self, _activate: bool) -> Vec<String> {
        Vec::new()
    }

    /// Seconds of simulation time between trigger passes of this rule.
    fn trigger_interval(&self) -> f32;

    /// One-in-N chance per matching node per pass. Zero or one means always.
    fn trigger_chance(&self) -> u32;

    /// Whether the rule runs unconditionally on a block's first activation,
    /// standing in for the triggers it missed while the block was unloaded.
    fn simple_catch_up(&self) -> bool {
        false
    }

    /// Lowest node Y this rule applies to.
    fn min_y(&self) -> i16 {
        -MAX_MAP_GENERATION_LIMIT
    }

    /// Highest node Y this rule applies to.
    fn max_y(&self) -> i16 {
        MAX_MAP_GENERATION_LIMIT
    }

    /// The rule callback. May read and write any loaded node through the
    /// context; the scheduler guarantees single-threaded execution and
    /// nothing else.
    fn trigger(
        &self,
        ctx: &mut AbmContext<'_>,
        pos: NodePos,
        node: MapNode,
        active_object_count: u32,
        active_object_count_wider: u32,
        activate: bool,
    );
}

struct RegisteredAbm {
    abm: Box<dyn ActiveBlockModifier>,
    trigger_ids: HashSet<ContentId>,
    required_neighbors: HashSet<ContentId>,
    required_neighbors_activate: HashSet<ContentId>,
    timer: f32,
}

fn resolve_specifiers(registry: &ContentRegistry, specs: &[String]) -> HashSet<ContentId> {
    specs
        .iter()
        .flat_map(|spec| registry.resolve_specifier(spec))
        .collect()
}

/// Owns the registered rules and their interval timers, and applies due
/// rules to one block at a time.
#[derive(Default)]
pub struct AbmScheduler {
    rules: Vec<RegisteredAbm>,
}

impl AbmScheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// `true` when no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Registers a rule, resolving its content specifiers against the
    /// registry once.
    pub fn register(&mut self, abm: Box<dyn ActiveBlockModifier>, registry: &ContentRegistry) {
        let trigger_ids = resolve_specifiers(registry, &abm.trigger_contents());
        if trigger_ids.is_empty() {
            debug!("registered rule matches no known content; it will never fire");
        }
        let required_neighbors = resolve_specifiers(registry, &abm.required_neighbors(false));
        let required_neighbors_activate =
            resolve_specifiers(registry, &abm.required_neighbors(true));
        self.rules.push(RegisteredAbm {
            abm,
            trigger_ids,
            required_neighbors,
            required_neighbors_activate,
            timer: 0.0,
        });
    }

    /// Advances the interval timers by `dtime` and returns the indices of
    /// rules due for a pass. A due rule's timer is reset, so overlong ticks
    /// never bank multiple passes.
    pub fn advance(&mut self, dtime: f32) -> Vec<usize> {
        let mut due = Vec::new();
        for (i, rule) in self.rules.iter_mut().enumerate() {
            rule.timer += dtime;
            if rule.timer >= rule.abm.trigger_interval() {
                rule.timer = 0.0;
                due.push(i);
            }
        }
        due
    }

    /// Runs the due rules over every matching node of one block.
    ///
    /// With `activate` set (first activation after load), all rules run
    /// regardless of `due`, and rules requesting catch-up skip their chance
    /// draw. Candidates are collected under the block's read guard, then the
    /// guard is released and each candidate is re-fetched before its
    /// trigger, because earlier triggers this pass may have rewritten it.
    pub fn apply_block(
        &self,
        ctx: &mut AbmContext<'_>,
        block: &MtResource<MapBlock>,
        due: &[usize],
        active_object_count: u32,
        active_object_count_wider: u32,
        activate: bool,
    ) {
        let rule_indices: Vec<usize> = if activate {
            (0..self.rules.len()).collect()
        } else {
            due.to_vec()
        };
        if rule_indices.is_empty() {
            return;
        }

        let mut candidates: Vec<(usize, NodePos)> = Vec::new();
        {
            let guard = block.get();
            let origin = block_to_node_origin(guard.pos());
            for idx in 0..MAP_BLOCK_NODES {
                let node = guard.node(idx);
                for &ri in &rule_indices {
                    let rule = &self.rules[ri];
                    if !rule.trigger_ids.contains(&node.content) {
                        continue;
                    }
                    let local = index_to_local(idx);
                    let y = origin.y + local.y;
                    if y < rule.abm.min_y() || y > rule.abm.max_y() {
                        continue;
                    }
                    candidates.push((
                        ri,
                        NodePos::new(origin.x + local.x, y, origin.z + local.z),
                    ));
                }
            }
        }

        for (ri, pos) in candidates {
            let rule = &self.rules[ri];
            let catch_up = activate && rule.abm.simple_catch_up();
            let chance = rule.abm.trigger_chance();
            if !catch_up && chance > 1 && ctx.rng.u32(0..chance) != 0 {
                continue;
            }
            // Re-fetch: an earlier trigger may have changed this node.
            let Some(node) = ctx.map.get_node_opt(pos) else {
                continue;
            };
            if !rule.trigger_ids.contains(&node.content) {
                continue;
            }
            let required = if activate {
                &rule.required_neighbors_activate
            } else {
                &rule.required_neighbors
            };
            if !required.is_empty() {
                let found = DIRS_6.iter().any(|&dir| {
                    ctx.map
                        .get_node_opt(pos + dir)
                        .is_some_and(|n| required.contains(&n.content))
                });
                if !found {
                    continue;
                }
            }
            rule.abm.trigger(
                ctx,
                pos,
                node,
                active_object_count,
                active_object_count_wider,
                activate,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation_state::environment::Climate;
    use crate::world_state::content::BuiltinContent;
    use crate::world_state::node::CONTENT_AIR;
    use cgmath::Point3;
    use std::sync::Arc;

    /// Turns stone into dirt, unconditionally.
    struct Petrifier {
        chance: u32,
        neighbors: Vec<String>,
    }

    impl ActiveBlockModifier for Petrifier {
        fn trigger_contents(&self) -> Vec<String> {
            vec!["default:stone".to_owned()]
        }
        fn required_neighbors(&self, _activate: bool) -> Vec<String> {
            self.neighbors.clone()
        }
        fn trigger_interval(&self) -> f32 {
            1.0
        }
        fn trigger_chance(&self) -> u32 {
            self.chance
        }
        fn simple_catch_up(&self) -> bool {
            true
        }
        fn trigger(
            &self,
            ctx: &mut AbmContext<'_>,
            pos: NodePos,
            _node: MapNode,
            _aoc: u32,
            _aocw: u32,
            _activate: bool,
        ) {
            ctx.map
                .set_node(pos, MapNode::new(BuiltinContent::Dirt.id()));
        }
    }

    fn test_map() -> Map {
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

    fn ctx<'a>(map: &'a Map, climate: &'a Climate, rng: &'a mut fastrand::Rng) -> AbmContext<'a> {
        AbmContext {
            map,
            climate,
            rng,
            game_time: 0.0,
        }
    }

    #[test]
    fn forced_chance_triggers_every_matching_node_once() {
        let map = test_map();
        for x in 0..4 {
            map.set_node(Point3::new(x, 1, 1), MapNode::new(BuiltinContent::Stone.id()));
        }

        let mut scheduler = AbmScheduler::new();
        scheduler.register(
            Box::new(Petrifier {
                chance: 0,
                neighbors: Vec::new(),
            }),
            map.registry(),
        );

        // Not due before its interval elapses.
        assert!(scheduler.advance(0.5).is_empty());
        let due = scheduler.advance(0.5);
        assert_eq!(due, vec![0]);

        let climate = Climate::constant(20.0, 50.0);
        let mut rng = fastrand::Rng::with_seed(7);
        let block = map.get_block(Point3::new(0, 0, 0)).unwrap();
        scheduler.apply_block(&mut ctx(&map, &climate, &mut rng), &block, &due, 0, 0, false);

        for x in 0..4 {
            assert_eq!(
                map.get_node(Point3::new(x, 1, 1)).content,
                BuiltinContent::Dirt.id()
            );
        }
    }

    #[test]
    fn activation_bypasses_chance_for_catch_up_rules() {
        let map = test_map();
        map.set_node(Point3::new(8, 8, 8), MapNode::new(BuiltinContent::Stone.id()));

        let mut scheduler = AbmScheduler::new();
        scheduler.register(
            Box::new(Petrifier {
                chance: 1_000_000,
                neighbors: Vec::new(),
            }),
            map.registry(),
        );

        let climate = Climate::constant(20.0, 50.0);
        let mut rng = fastrand::Rng::with_seed(7);
        let block = map.get_block(Point3::new(0, 0, 0)).unwrap();
        // No rule is due, but activation runs them all.
        scheduler.apply_block(&mut ctx(&map, &climate, &mut rng), &block, &[], 0, 0, true);

        assert_eq!(
            map.get_node(Point3::new(8, 8, 8)).content,
            BuiltinContent::Dirt.id()
        );
    }

    #[test]
    fn required_neighbors_gate_the_trigger() {
        let map = test_map();
        map.set_node(Point3::new(2, 2, 2), MapNode::new(BuiltinContent::Stone.id()));
        map.set_node(Point3::new(10, 2, 2), MapNode::new(BuiltinContent::Stone.id()));
        // Only the second stone touches sand.
        map.set_node(Point3::new(10, 3, 2), MapNode::new(BuiltinContent::Sand.id()));

        let mut scheduler = AbmScheduler::new();
        scheduler.register(
            Box::new(Petrifier {
                chance: 0,
                neighbors: vec!["group:sand".to_owned()],
            }),
            map.registry(),
        );
        let due = scheduler.advance(1.0);

        let climate = Climate::constant(20.0, 50.0);
        let mut rng = fastrand::Rng::with_seed(7);
        let block = map.get_block(Point3::new(0, 0, 0)).unwrap();
        scheduler.apply_block(&mut ctx(&map, &climate, &mut rng), &block, &due, 0, 0, false);

        assert_eq!(
            map.get_node(Point3::new(2, 2, 2)).content,
            BuiltinContent::Stone.id()
        );
        assert_eq!(
            map.get_node(Point3::new(10, 2, 2)).content,
            BuiltinContent::Dirt.id()
        );
    }

    #[test]
    fn y_range_restricts_matches() {
        let map = test_map();
        map.set_node(Point3::new(1, 2, 1), MapNode::new(BuiltinContent::Stone.id()));
        map.set_node(Point3::new(1, 12, 1), MapNode::new(BuiltinContent::Stone.id()));

        struct LowOnly;
        impl ActiveBlockModifier for LowOnly {
            fn trigger_contents(&self) -> Vec<String> {
                vec!["default:stone".to_owned()]
            }
            fn trigger_interval(&self) -> f32 {
                1.0
            }
            fn trigger_chance(&self) -> u32 {
                0
            }
            fn max_y(&self) -> i16 {
                5
            }
            fn trigger(
                &self,
                ctx: &mut AbmContext<'_>,
                pos: NodePos,
                _node: MapNode,
                _aoc: u32,
                _aocw: u32,
                _activate: bool,
            ) {
                ctx.map
                    .set_node(pos, MapNode::new(BuiltinContent::Sand.id()));
            }
        }

        let mut scheduler = AbmScheduler::new();
        scheduler.register(Box::new(LowOnly), map.registry());
        let due = scheduler.advance(1.0);

        let climate = Climate::constant(20.0, 50.0);
        let mut rng = fastrand::Rng::with_seed(7);
        let block = map.get_block(Point3::new(0, 0, 0)).unwrap();
        scheduler.apply_block(&mut ctx(&map, &climate, &mut rng), &block, &due, 0, 0, false);

        assert_eq!(
            map.get_node(Point3::new(1, 2, 1)).content,
            BuiltinContent::Sand.id()
        );
        assert_eq!(
            map.get_node(Point3::new(1, 12, 1)).content,
            BuiltinContent::Stone.id()
        );
    }
}
