//! Tree and leaves growth rules.
//!
//! Trees pump an abstract 0-255 "water level" counter through their trunks
//! and canopy: trunks absorb it from adjacent liquid or from humid air over
//! soil, spend one level per node grown, push the surplus into neighboring
//! trunk and leaves nodes, and redistribute the rest vertically. Leaves
//! spread into buildable neighbors, ripen into fruit, and die when starved
//! of light, support or warmth.
//!
//! The counter lives in whichever parameter byte the content leaves free:
//! trees keep rotation in `param2`, so their counter is `param1`; leaves
//! carry light in `param1`, so theirs is `param2`. The growth chain is
//! declared through each content's `liquid_alternative_source` name
//! (tree -> leaves -> fruit).
//!
//! The redistribution arithmetic (the `floor(avg + 1)` / `ceil(avg - 1)`
//! asymmetry, bottom-first unless ringed by trunks) produces a particular
//! steady-state column shape and is reproduced as-is, not re-derived.

use std::collections::{HashMap, HashSet};

use cgmath::Vector3;

use crate::simulation_state::abm::{node_light, AbmContext, ActiveBlockModifier};
use crate::simulation_state::environment::ServerEnvironment;
use crate::world_state::content::{ContentFeatures, ContentId, ContentRegistry};
use crate::world_state::liquid::{node_liquid_level, set_node_liquid_level};
use crate::world_state::map::Map;
use crate::world_state::node::{
    MapNode, CONTENT_AIR, CONTENT_IGNORE, LIGHT_SUN, LIQUID_LEVEL_MAX,
};
use crate::world_state::position::{node_to_block_pos, NodePos};

/// Trees keep rotation in `param2`, so the counter is `param1`.
fn tree_water_level(n: &MapNode) -> u8 {
    n.param1
}

fn set_tree_water_level(n: &mut MapNode, level: u8) {
    n.param1 = level;
}

/// Leaves carry light in `param1`, so the counter is `param2`.
fn leaves_water_level(n: &MapNode) -> u8 {
    n.param2
}

fn set_leaves_water_level(n: &mut MapNode, level: u8) {
    n.param2 = level;
}

// Neighborhood order matters: growth walks top first, bottom last.
const D_SELF: usize = 0;
const D_TOP: usize = 1;
const D_BACK: usize = 2;
const D_FRONT: usize = 3;
const D_RIGHT: usize = 4;
const D_LEFT: usize = 5;
const D_BOTTOM: usize = 6;

const LOOK_DIRS: [Vector3<i16>; 7] = [
    Vector3::new(0, 0, 0),
    Vector3::new(0, 1, 0),
    Vector3::new(0, 0, 1),
    Vector3::new(0, 0, -1),
    Vector3::new(1, 0, 0),
    Vector3::new(-1, 0, 0),
    Vector3::new(0, -1, 0),
];

const GROW_DIRS: [Vector3<i16>; 6] = [
    Vector3::new(0, 1, 0),
    Vector3::new(0, 0, 1),
    Vector3::new(0, 0, -1),
    Vector3::new(1, 0, 0),
    Vector3::new(-1, 0, 0),
    Vector3::new(0, -1, 0),
];

/// Tuning of one content's growth behavior, built once at registration from
/// the content's group levels and passed by reference into every trigger.
#[derive(Clone, Debug)]
pub struct GrowParams {
    /// Cap on a trunk's stored water.
    pub tree_water_max: i32,
    /// Water a trunk needs before it grows at all.
    pub tree_grow_water_min: i32,
    /// Heat band for trunk growth, exclusive on both ends.
    pub tree_grow_heat_min: i32,
    /// Upper end of the trunk growth heat band.
    pub tree_grow_heat_max: i32,
    /// Above this light, grow more leaves around before growing the trunk up.
    pub tree_grow_light_max: i32,
    /// Humidity threshold above which trunks over soil pull water from air.
    pub tree_get_water_from_humidity: i32,
    /// Cap on the water a trunk can hold from air alone.
    pub tree_get_water_max_from_humidity: i32,
    /// 1-in-N chance per pass of trunk growth; zero means always.
    pub tree_grow_chance: i32,
    /// Cap on a leaves node's stored water.
    pub leaves_water_max: i32,
    /// Light a target needs for leaves to spread into it.
    pub leaves_grow_light_min: i32,
    /// Water needed to grow leaves upward.
    pub leaves_grow_water_min_top: i32,
    /// Water needed to grow leaves downward.
    pub leaves_grow_water_min_bottom: i32,
    /// Water needed to grow leaves sideways.
    pub leaves_grow_water_min_side: i32,
    /// Heat band for leaves growth, inclusive.
    pub leaves_grow_heat_max: i32,
    /// Lower end of the leaves growth heat band.
    pub leaves_grow_heat_min: i32,
    /// Nonzero makes canopies pump water straight up and stop (cypress).
    pub leaves_grow_prefer_top: i32,
    /// Below this light, leaves start dying.
    pub leaves_die_light_max: i32,
    /// Leaves die below this heat when nonzero.
    pub leaves_die_heat_max: i32,
    /// Leaves die above this heat when nonzero.
    pub leaves_die_heat_min: i32,
    /// 1-in-N chance per pass of dark leaves dying; zero means always.
    pub leaves_die_chance: i32,
    /// Nonzero kills leaves capped by a full liquid node.
    pub leaves_die_from_liquid: i32,
    /// Water a leaves node needs to ripen into fruit.
    pub leaves_to_fruit_water_min: i32,
    /// Heat a leaves node needs to ripen.
    pub leaves_to_fruit_heat_min: i32,
    /// Light a leaves node needs to ripen.
    pub leaves_to_fruit_light_min: i32,
    /// 1-in-N chance per pass of ripening.
    pub leaves_to_fruit_chance: i32,
}

impl Default for GrowParams {
    fn default() -> Self {
        Self {
            tree_water_max: 50,
            tree_grow_water_min: 20,
            tree_grow_heat_min: 7,
            tree_grow_heat_max: 40,
            tree_grow_light_max: 12,
            tree_get_water_from_humidity: 70,
            tree_get_water_max_from_humidity: 30,
            tree_grow_chance: 10,
            leaves_water_max: 20,
            leaves_grow_light_min: 8,
            leaves_grow_water_min_top: 3,
            leaves_grow_water_min_bottom: 4,
            leaves_grow_water_min_side: 2,
            leaves_grow_heat_max: 40,
            leaves_grow_heat_min: 3,
            leaves_grow_prefer_top: 0,
            leaves_die_light_max: 7,
            leaves_die_heat_max: -1,
            leaves_die_heat_min: 55,
            leaves_die_chance: 5,
            leaves_die_from_liquid: 1,
            leaves_to_fruit_water_min: 9,
            leaves_to_fruit_heat_min: 15,
            leaves_to_fruit_light_min: 10,
            leaves_to_fruit_chance: 10,
        }
    }
}

impl GrowParams {
    /// Builds parameters for one content, letting its group levels override
    /// the defaults. With `grow_debug_fast`, the chances are forced so every
    /// pass triggers.
    pub fn from_features(cf: &ContentFeatures, grow_debug_fast: bool) -> Self {
        let mut p = Self::default();
        let get = |name: &str, target: &mut i32| {
            if let Some(&v) = cf.groups.get(name) {
                *target = v;
            }
        };
        get("tree_water_max", &mut p.tree_water_max);
        get("tree_grow_water_min", &mut p.tree_grow_water_min);
        get("tree_grow_heat_min", &mut p.tree_grow_heat_min);
        get("tree_grow_heat_max", &mut p.tree_grow_heat_max);
        get("tree_grow_light_max", &mut p.tree_grow_light_max);
        get("tree_grow_chance", &mut p.tree_grow_chance);
        get("tree_get_water_from_humidity", &mut p.tree_get_water_from_humidity);
        get(
            "tree_get_water_max_from_humidity",
            &mut p.tree_get_water_max_from_humidity,
        );
        get("leaves_water_max", &mut p.leaves_water_max);
        get("leaves_grow_light_min", &mut p.leaves_grow_light_min);
        get("leaves_grow_water_min_top", &mut p.leaves_grow_water_min_top);
        get(
            "leaves_grow_water_min_bottom",
            &mut p.leaves_grow_water_min_bottom,
        );
        get("leaves_grow_water_min_side", &mut p.leaves_grow_water_min_side);
        get("leaves_grow_heat_max", &mut p.leaves_grow_heat_max);
        get("leaves_grow_prefer_top", &mut p.leaves_grow_prefer_top);
        get("leaves_grow_heat_min", &mut p.leaves_grow_heat_min);
        get("leaves_die_light_max", &mut p.leaves_die_light_max);
        get("leaves_die_heat_max", &mut p.leaves_die_heat_max);
        get("leaves_die_heat_min", &mut p.leaves_die_heat_min);
        get("leaves_die_chance", &mut p.leaves_die_chance);
        get("leaves_die_from_liquid", &mut p.leaves_die_from_liquid);
        get("leaves_to_fruit_water_min", &mut p.leaves_to_fruit_water_min);
        get("leaves_to_fruit_heat_min", &mut p.leaves_to_fruit_heat_min);
        get("leaves_to_fruit_light_min", &mut p.leaves_to_fruit_light_min);
        get("leaves_to_fruit_chance", &mut p.leaves_to_fruit_chance);
        if grow_debug_fast {
            p.tree_grow_chance = 0;
            p.leaves_die_chance = 0;
        }
        p
    }
}

fn decrease(level: &mut i16, amount: i16) -> bool {
    if *level <= amount {
        return false;
    }
    *level -= amount;
    true
}

/// One looked-up neighbor of the triggering trunk node.
#[derive(Clone)]
struct Neighbor {
    node: MapNode,
    content: ContentId,
    pos: NodePos,
    is_liquid: bool,
    is_my_leaves: bool,
    is_any_leaves: bool,
    is_fruit: bool,
    is_tree: bool,
    is_soil: bool,
    top: bool,
    bottom: bool,
    side: bool,
    light: u8,
    facedir: u8,
    allow_grow_by_rotation: bool,
    water_level: i16,
}

/// The trunk growth rule, triggering on `group:grow_tree` contents.
pub struct GrowTree {
    tree_to_leaves: HashMap<ContentId, ContentId>,
    tree_to_fruit: HashMap<ContentId, ContentId>,
    type_params: HashMap<ContentId, GrowParams>,
    grow_debug_fast: bool,
}

impl GrowTree {
    /// Resolves the growth chain of every `grow_tree` content: the tree's
    /// `liquid_alternative_source` names its leaves, whose own names the
    /// fruit.
    pub fn new(registry: &ContentRegistry, grow_debug_fast: bool) -> Self {
        let mut tree_to_leaves = HashMap::new();
        let mut tree_to_fruit = HashMap::new();
        let mut type_params = HashMap::new();
        for id_tree in registry.ids_in_group("grow_tree") {
            let cf_tree = registry.get(id_tree);
            type_params.insert(id_tree, GrowParams::from_features(cf_tree, grow_debug_fast));
            if cf_tree.liquid_alternative_source.is_empty() {
                continue;
            }
            if let Some(id_leaves) = registry.get_id(&cf_tree.liquid_alternative_source) {
                tree_to_leaves.insert(id_tree, id_leaves);
                let cf_leaves = registry.get(id_leaves);
                type_params.insert(id_leaves, GrowParams::from_features(cf_leaves, false));
                if !cf_leaves.liquid_alternative_source.is_empty() {
                    if let Some(id_fruit) = registry.get_id(&cf_leaves.liquid_alternative_source)
                    {
                        tree_to_fruit.insert(id_tree, id_fruit);
                    }
                }
            }
        }
        Self {
            tree_to_leaves,
            tree_to_fruit,
            type_params,
            grow_debug_fast,
        }
    }
}

// Splitting the averaged water between the trunk above and below. The
// preferred end rounds up through `floor(avg + 1)`, the other rounds down
// through `ceil(avg - 1)`; the difference is what keeps a column's water
// drifting toward the preferred end instead of oscillating.
fn redistribute(
    nb: &mut Neighbor,
    content: ContentId,
    tree_water_max: i32,
    prefer: bool,
    total_level: &mut i16,
    have_liquid: &mut i16,
    map: &Map,
) {
    if nb.content != content {
        return;
    }
    let float_avg = *total_level as f32 / *have_liquid as f32;
    let avg = if prefer {
        (float_avg + 1.0).floor()
    } else {
        (float_avg - 1.0).ceil()
    };
    let want = (avg as i16).clamp(0, tree_water_max as i16);
    *total_level -= want;
    *have_liquid -= 1;
    if nb.water_level != want {
        set_tree_water_level(&mut nb.node, want as u8);
        map.set_node(nb.pos, nb.node);
    }
}

impl ActiveBlockModifier for GrowTree {
    fn trigger_contents(&self) -> Vec<String> {
        vec!["group:grow_tree".to_owned()]
    }

    fn trigger_interval(&self) -> f32 {
        if self.grow_debug_fast {
            0.1
        } else {
            5.0
        }
    }

    fn trigger_chance(&self) -> u32 {
        if self.grow_debug_fast {
            1
        } else {
            5
        }
    }

    fn simple_catch_up(&self) -> bool {
        true
    }

    fn trigger(
        &self,
        ctx: &mut AbmContext<'_>,
        pos: NodePos,
        n_in: MapNode,
        _active_object_count: u32,
        _active_object_count_wider: u32,
        activate: bool,
    ) {
        let map = ctx.map;
        let registry = map.registry();
        let heat = ctx.block_heat(pos);

        let mut top_is_not_tree = false;
        let mut around_all_is_tree = true;
        let mut near_tree: i8 = 0;
        let mut near_soil: i8 = 0;
        let mut near_liquid: i8 = 0;
        let mut leaves_content: ContentId = CONTENT_IGNORE;
        let mut fruit_content: ContentId = CONTENT_IGNORE;

        let mut nbh: Vec<Neighbor> = Vec::with_capacity(LOOK_DIRS.len());
        for (i, dir) in LOOK_DIRS.iter().enumerate() {
            let is_self = i == D_SELF;
            let nb_pos = pos + dir;
            let node = if is_self {
                n_in
            } else {
                // A missing neighbor means the map is busy here; try later.
                match map.get_node_opt(nb_pos) {
                    Some(n) => n,
                    None => return,
                }
            };
            let content = node.content;
            let cf = registry.get(content);
            let light = node_light(registry, &node);
            let top = i == D_TOP;
            let bottom = i == D_BOTTOM;
            let side = !top && !bottom;
            let is_tree = is_self || nbh[D_SELF].content == content || cf.in_group("tree");

            if is_self {
                leaves_content = self.tree_to_leaves.get(&content).copied().unwrap_or(CONTENT_IGNORE);
                fruit_content = self.tree_to_fruit.get(&content).copied().unwrap_or(CONTENT_IGNORE);
            }

            let mut is_my_leaves = false;
            let mut is_any_leaves = false;
            let mut is_fruit = false;
            let mut is_soil = false;
            let mut is_liquid = false;
            if !is_self {
                if side && around_all_is_tree && !is_tree {
                    around_all_is_tree = false;
                }
                is_my_leaves = content == leaves_content;
                is_any_leaves = is_my_leaves || cf.in_group("leaves");
                is_fruit = content == fruit_content;
                is_liquid = cf.in_group("liquid");
                near_liquid += is_liquid as i8;
                if top && !is_tree {
                    top_is_not_tree = true;
                }
                is_soil = cf.in_group("soil");
                near_soil += is_soil as i8;
                if side && is_tree {
                    near_tree += 1;
                }
            }

            let water_level = if is_my_leaves {
                leaves_water_level(&node) as i16
            } else if is_tree {
                tree_water_level(&node) as i16
            } else {
                0
            };

            let facedir = node.facedir();
            let self_facedir = if is_self { facedir } else { nbh[D_SELF].facedir };
            let allow_grow_by_rotation = if is_self {
                // Upright or upside-down trunks grow along their axis.
                facedir <= 3 || (20..=23).contains(&facedir)
            } else if top || bottom {
                nbh[D_SELF].allow_grow_by_rotation
            } else if i == D_FRONT || i == D_BACK {
                self_facedir == 7 || self_facedir == 9
            } else {
                self_facedir == 18 || self_facedir == 12
            };

            nbh.push(Neighbor {
                node,
                content,
                pos: nb_pos,
                is_liquid,
                is_my_leaves,
                is_any_leaves,
                is_fruit,
                is_tree,
                is_soil,
                top,
                bottom,
                side,
                light,
                facedir,
                allow_grow_by_rotation,
                water_level,
            });
        }

        let Some(params) = self.type_params.get(&nbh[D_SELF].content) else {
            return;
        };
        let content = nbh[D_SELF].content;
        let self_allow = nbh[D_SELF].allow_grow_by_rotation;
        let mut self_water_level = nbh[D_SELF].water_level;
        let self_water_level_orig = self_water_level;
        let mut n = n_in;

        // Pull water out of humid air while rooted in soil and dry.
        if params.tree_get_water_from_humidity != 0
            && self_water_level < params.tree_get_water_max_from_humidity as i16
            && near_soil > 0
            && self_allow
            && near_liquid == 0
        {
            let humidity = ctx.block_humidity(pos);
            if humidity >= params.tree_get_water_from_humidity as f32 {
                if self.grow_debug_fast {
                    self_water_level = params.tree_get_water_max_from_humidity as i16;
                } else {
                    self_water_level += 1;
                }
            }
        }

        for i in D_TOP..=D_BOTTOM {
            let allow_grow_by_light =
                !nbh[i].top || nbh[i].light <= params.tree_grow_light_max as u8;
            let mut up_all_leaves = true;

            // Absorb from an adjacent liquid, leaving one level behind.
            if self_water_level < params.tree_water_max as i16
                && near_soil > 0
                && self_allow
                && nbh[i].is_liquid
            {
                let mut nb_node = nbh[i].node;
                let mut level = node_liquid_level(registry, nb_node) as i16;
                if level <= 1 {
                    return;
                }
                let mut amount = level - 1;
                if self_water_level + amount > params.tree_water_max as i16 {
                    amount = params.tree_water_max as i16 - self_water_level;
                }
                level -= amount;
                set_node_liquid_level(registry, &mut nb_node, level as u8);
                if !self.grow_debug_fast {
                    map.set_node(nbh[i].pos, nb_node);
                }
                self_water_level += amount;
                nbh[i].node = nb_node;
            }

            // Light recalc is sometimes too rare; an unbroken leaves roof
            // counts as shade even when the stored light says otherwise.
            if nbh[i].top && !allow_grow_by_light && leaves_content != CONTENT_IGNORE {
                for li in 1..=(LIGHT_SUN as i16 - params.tree_grow_light_max as i16) {
                    let p_up = pos + Vector3::new(0, li, 0);
                    let n_up = if li == 1 {
                        Some(nbh[D_TOP].node)
                    } else {
                        map.get_node_opt(p_up)
                    };
                    match n_up {
                        Some(nu) if nu.content != CONTENT_AIR => {}
                        _ => {
                            up_all_leaves = false;
                            break;
                        }
                    }
                }
            }

            let grew = 'grow: {
                let nb = &nbh[i];
                if content == nb.content {
                    break 'grow false;
                }
                if !((params.tree_grow_heat_min == 0 || heat > params.tree_grow_heat_min as f32)
                    && (params.tree_grow_heat_max == 0
                        || heat < params.tree_grow_heat_max as f32))
                {
                    break 'grow false;
                }
                if self_water_level < params.tree_grow_water_min as i16 {
                    break 'grow false;
                }
                if !nb.allow_grow_by_rotation {
                    break 'grow false;
                }
                let cf = registry.get(nb.content);
                if !(nb.is_any_leaves
                    || nb.is_fruit
                    || cf.buildable_to
                    || nb.is_liquid
                    || nb.is_soil
                    || cf.in_group("sand"))
                {
                    break 'grow false;
                }
                if nb.top && nb.content == CONTENT_AIR {
                    break 'grow false;
                }
                if nb.top && nb.is_any_leaves {
                    if nb.light < params.leaves_grow_light_min as u8 {
                        break 'grow false;
                    }
                    if !(allow_grow_by_light || up_all_leaves) {
                        break 'grow false;
                    }
                }
                // Don't grow too deep into liquid, and not down beside
                // another trunk.
                if nb.bottom {
                    if nb.is_liquid && nb.light == 0 {
                        break 'grow false;
                    }
                    if near_tree >= 1 {
                        break 'grow false;
                    }
                }
                if !(self.grow_debug_fast
                    || activate
                    || ctx.roll(params.tree_grow_chance * if nb.bottom { 3 } else { 1 }))
                {
                    break 'grow false;
                }
                if !decrease(&mut self_water_level, 1) {
                    break 'grow true;
                }
                map.set_node(
                    nb.pos,
                    MapNode::with_params(content, 1, nbh[D_SELF].node.param2),
                );
                true
            };
            if grew {
                break;
            }

            // Pump water into a neighboring trunk or into this tree's own
            // leaves.
            if (nbh[i].side && nbh[i].content == content && !around_all_is_tree)
                || nbh[i].is_my_leaves
            {
                let mut water_level = if nbh[i].content == leaves_content {
                    leaves_water_level(&nbh[i].node) as i16
                } else {
                    tree_water_level(&nbh[i].node) as i16
                };
                let pump_allowed = !nbh[i].is_my_leaves
                    || nbh[i].top
                    || !self_allow
                    || (!nbh[i].top && top_is_not_tree);
                if pump_allowed {
                    let cap = (if nbh[i].is_my_leaves {
                        params.leaves_water_max
                    } else {
                        params.tree_water_max
                    }) as i16;
                    if water_level < cap && self_water_level > water_level {
                        if nbh[i].side && nbh[i].is_tree && self_allow {
                            // Vertical trunks keep their water for growing
                            // up; sideways trunk pumping is for fallen logs.
                            continue;
                        }
                        if !decrease(&mut self_water_level, 1) {
                            break;
                        }
                        water_level += 1;
                        let mut nb_node = nbh[i].node;
                        if nbh[i].is_my_leaves {
                            set_leaves_water_level(&mut nb_node, water_level as u8);
                        } else {
                            set_tree_water_level(&mut nb_node, water_level as u8);
                        }
                        map.set_node(nbh[i].pos, nb_node);
                        nbh[i].node = nb_node;
                    }
                }
            }

            // Sprout leaves into a buildable neighbor.
            if nbh[i].allow_grow_by_rotation
                && nbh[D_TOP].content != content
                && leaves_content != CONTENT_IGNORE
                && heat >= params.leaves_grow_heat_min as f32
                && heat <= params.leaves_grow_heat_max as f32
                && self_water_level
                    >= (if nbh[i].top {
                        params.leaves_grow_water_min_top
                    } else {
                        params.leaves_grow_water_min_side
                    }) as i16
                && nbh[i].light >= params.leaves_grow_light_min as u8
            {
                let cf = registry.get(nbh[i].content);
                if cf.buildable_to && !nbh[i].is_liquid {
                    if !decrease(&mut self_water_level, 1) {
                        break;
                    }
                    map.set_node(
                        nbh[i].pos,
                        MapNode::with_params(leaves_content, nbh[i].node.param1, 1),
                    );
                    if let Some(block) = map.get_block(node_to_block_pos(nbh[i].pos)) {
                        block.get_mut().set_lighting_expired(true);
                    }
                }
            }
        }

        // Distribute what is left up and down the trunk column. A trunk
        // ringed by other trunks feeds its top first ("Yggdrasil mode"),
        // otherwise the bottom wins.
        if self_allow {
            let mut total_level = self_water_level;
            let mut have_liquid: i16 = 1;
            if nbh[D_BOTTOM].content == content {
                total_level += nbh[D_BOTTOM].water_level;
                have_liquid += 1;
            }
            if nbh[D_TOP].content == content {
                total_level += nbh[D_TOP].water_level;
                have_liquid += 1;
            }

            if near_tree >= 4 {
                let (top_slice, bottom_slice) = nbh.split_at_mut(D_BOTTOM);
                redistribute(
                    &mut top_slice[D_TOP],
                    content,
                    params.tree_water_max,
                    true,
                    &mut total_level,
                    &mut have_liquid,
                    map,
                );
                redistribute(
                    &mut bottom_slice[0],
                    content,
                    params.tree_water_max,
                    false,
                    &mut total_level,
                    &mut have_liquid,
                    map,
                );
            } else {
                let (top_slice, bottom_slice) = nbh.split_at_mut(D_BOTTOM);
                redistribute(
                    &mut bottom_slice[0],
                    content,
                    params.tree_water_max,
                    true,
                    &mut total_level,
                    &mut have_liquid,
                    map,
                );
                redistribute(
                    &mut top_slice[D_TOP],
                    content,
                    params.tree_water_max,
                    false,
                    &mut total_level,
                    &mut have_liquid,
                    map,
                );
            }
            self_water_level = total_level;
        }

        if self_water_level_orig != self_water_level {
            set_tree_water_level(&mut n, self_water_level as u8);
            map.set_node(pos, n);
        }
    }
}

/// The canopy rule, triggering on `group:grow_leaves` contents.
pub struct GrowLeaves {
    leaves_to_fruit: HashMap<ContentId, ContentId>,
    type_params: HashMap<ContentId, GrowParams>,
    grow_debug_fast: bool,
}

impl GrowLeaves {
    /// Resolves fruit contents for every `grow_leaves` content.
    pub fn new(registry: &ContentRegistry, grow_debug_fast: bool) -> Self {
        let mut leaves_to_fruit = HashMap::new();
        let mut type_params = HashMap::new();
        for id in registry.ids_in_group("grow_leaves") {
            let cf = registry.get(id);
            type_params.insert(id, GrowParams::from_features(cf, grow_debug_fast));
            if !cf.liquid_alternative_source.is_empty() {
                if let Some(id_fruit) = registry.get_id(&cf.liquid_alternative_source) {
                    leaves_to_fruit.insert(id, id_fruit);
                }
            }
        }
        Self {
            leaves_to_fruit,
            type_params,
            grow_debug_fast,
        }
    }

    fn can_grow_leaves(params: &GrowParams, level: i16, is_top: bool, is_bottom: bool) -> bool {
        if is_top {
            return level >= params.leaves_grow_water_min_top as i16;
        }
        if is_bottom {
            return level >= params.leaves_grow_water_min_bottom as i16;
        }
        level >= params.leaves_grow_water_min_side as i16
    }
}

impl ActiveBlockModifier for GrowLeaves {
    fn trigger_contents(&self) -> Vec<String> {
        vec!["group:grow_leaves".to_owned()]
    }

    fn trigger_interval(&self) -> f32 {
        if self.grow_debug_fast {
            0.1
        } else {
            10.0
        }
    }

    fn trigger_chance(&self) -> u32 {
        if self.grow_debug_fast {
            1
        } else {
            10
        }
    }

    fn simple_catch_up(&self) -> bool {
        true
    }

    fn trigger(
        &self,
        ctx: &mut AbmContext<'_>,
        pos: NodePos,
        n_in: MapNode,
        _active_object_count: u32,
        _active_object_count_wider: u32,
        activate: bool,
    ) {
        let map = ctx.map;
        let registry = map.registry();
        let heat = ctx.block_heat(pos);
        let c = n_in.content;
        let Some(params) = self.type_params.get(&c) else {
            return;
        };
        let mut n = n_in;
        let mut n_water_level = leaves_water_level(&n) as i16;
        let n_water_level_orig = n_water_level;
        let light = node_light(registry, &n);

        let mut top_is_full_liquid = false;
        let mut have_tree_or_soil = false;
        let mut have_air = false;
        let mut allow_grow_fruit = self.leaves_to_fruit.contains_key(&c);
        let c_fruit = self.leaves_to_fruit.get(&c).copied().unwrap_or(CONTENT_IGNORE);

        // The classification index deliberately does not advance past a
        // missing neighbor, lagging top/bottom for the rest of the walk;
        // long-standing behavior at unloaded boundaries that trees have
        // grown around, kept as-is.
        let mut i: usize = 0;
        for dir in GROW_DIRS.iter() {
            let p_dir = pos + dir;
            let Some(n_dir) = map.get_node_opt(p_dir) else {
                // Don't make removal decisions while the map is busy here.
                have_tree_or_soil = true;
                allow_grow_fruit = false;
                have_air = false;
                continue;
            };
            let light_dir = node_light(registry, &n_dir);
            let c_dir = n_dir.content;
            let cf = registry.get(c_dir);
            let is_tree = cf.in_group("tree");
            let is_leaves = cf.in_group("leaves");
            let is_liquid = cf.in_group("liquid");
            let top = i == 0;
            let bottom = i + 1 == GROW_DIRS.len();

            top_is_full_liquid =
                top && is_liquid && node_liquid_level(registry, n_dir) == LIQUID_LEVEL_MAX;

            // Fruit only ripens inside an intact canopy.
            if c_dir == c_fruit || (!top && !bottom && !is_leaves) {
                allow_grow_fruit = false;
            }
            if is_tree {
                allow_grow_fruit = false;
            }
            if !have_tree_or_soil {
                have_tree_or_soil = is_tree || is_leaves || cf.in_group("soil") || is_liquid;
            }
            if !have_air {
                have_air = c_dir == CONTENT_AIR;
            }

            if (params.leaves_grow_heat_min == 0 || heat >= params.leaves_grow_heat_min as f32)
                && (params.leaves_grow_heat_max == 0
                    || heat <= params.leaves_grow_heat_max as f32)
                && Self::can_grow_leaves(params, n_water_level, top, bottom)
                && light_dir >= params.leaves_grow_light_min as u8
                && cf.buildable_to
                && !is_liquid
            {
                map.set_node(p_dir, MapNode::with_params(c, n_dir.param1, 1));
                n_water_level -= 1;
                if ctx.roll(10) {
                    if let Some(block) = map.get_block(node_to_block_pos(p_dir)) {
                        block.get_mut().set_lighting_expired(true);
                    }
                }
            } else if c_dir == c {
                let l_dir = node_light(registry, &n_dir);
                let mut wl_dir = leaves_water_level(&n_dir) as i16;
                if n_water_level > 1
                    && wl_dir < params.leaves_water_max as i16
                    && l_dir >= light
                    && wl_dir < n_water_level - 1
                {
                    n_water_level -= 1;
                    wl_dir += 1;
                    let mut nd = n_dir;
                    set_leaves_water_level(&mut nd, wl_dir as u8);
                    map.set_node(p_dir, nd);

                    // Cypress-style canopies pump straight up and stop.
                    if top && params.leaves_grow_prefer_top != 0 {
                        break;
                    }
                }
            }

            i += 1;
        }

        if allow_grow_fruit
            && n_water_level >= params.leaves_to_fruit_water_min as i16
            && heat >= params.leaves_to_fruit_heat_min as f32
            && light >= params.leaves_to_fruit_light_min as u8
            && (self.grow_debug_fast || ctx.roll(params.leaves_to_fruit_chance))
        {
            map.set_node(pos, MapNode::new(c_fruit));
        } else if (n_water_level >= 1 // don't touch old static trees
            && have_air
            && ((light < params.leaves_die_light_max as u8
                && (light > 0 || activate || ctx.roll(params.leaves_die_chance)))
                || (params.leaves_die_heat_max != 0
                    && heat < params.leaves_die_heat_max as f32)
                || (params.leaves_die_heat_min != 0
                    && heat > params.leaves_die_heat_min as f32)))
            || ((!have_tree_or_soil
                || (params.leaves_die_from_liquid != 0 && top_is_full_liquid))
                && (activate || ctx.roll(10)))
        {
            let mut modified = HashSet::new();
            map.remove_node_and_update(pos, &mut modified);
        } else if n_water_level != n_water_level_orig {
            set_leaves_water_level(&mut n, n_water_level as u8);
            map.set_node(pos, n);
        }
    }
}

/// Registers the growth rules with an environment when its settings enable
/// them.
pub fn add_grow_rules(env: &mut ServerEnvironment) {
    if !env.settings().grow_tree {
        return;
    }
    let fast = env.settings().grow_debug_fast;
    let registry = env.registry_arc();
    env.add_abm(Box::new(GrowTree::new(&registry, fast)));
    env.add_abm(Box::new(GrowLeaves::new(&registry, fast)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation_state::environment::Climate;
    use crate::world_state::content::BuiltinContent;
    use crate::world_state::node::LightBank;
    use cgmath::Point3;
    use std::sync::Arc;

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

    fn trunk(water: u8) -> MapNode {
        // Rotation 1: an upright trunk that may grow along its axis.
        MapNode::with_params(BuiltinContent::Tree.id(), water, 1)
    }

    fn run_tree(
        map: &Map,
        rule: &GrowTree,
        climate: &Climate,
        pos: NodePos,
        activate: bool,
    ) {
        let mut rng = fastrand::Rng::with_seed(42);
        let mut ctx = AbmContext {
            map,
            climate,
            rng: &mut rng,
            game_time: 0.0,
        };
        let node = map.get_node(pos);
        rule.trigger(&mut ctx, pos, node, 0, 0, activate);
    }

    fn run_leaves(
        map: &Map,
        rule: &GrowLeaves,
        climate: &Climate,
        pos: NodePos,
        activate: bool,
    ) {
        let mut rng = fastrand::Rng::with_seed(42);
        let mut ctx = AbmContext {
            map,
            climate,
            rng: &mut rng,
            game_time: 0.0,
        };
        let node = map.get_node(pos);
        rule.trigger(&mut ctx, pos, node, 0, 0, activate);
    }

    #[test]
    fn debug_fast_trunk_grows_up_and_spends_one_water() {
        let map = air_map();
        let registry = map.registry_arc();
        let trunk_pos = Point3::new(8, 4, 8);
        map.set_node(Point3::new(8, 3, 8), MapNode::new(BuiltinContent::Dirt.id()));
        map.set_node(trunk_pos, trunk(30));
        // A lit leaves cap above is what the trunk grows through.
        let mut leaves = MapNode::new(BuiltinContent::Leaves.id());
        leaves.set_light(LightBank::Day, 10);
        map.set_node(Point3::new(8, 5, 8), leaves);

        let rule = GrowTree::new(&registry, true);
        let climate = Climate::constant(20.0, 50.0);
        run_tree(&map, &rule, &climate, trunk_pos, false);

        let grown = map.get_node(Point3::new(8, 5, 8));
        assert_eq!(grown.content, BuiltinContent::Tree.id());
        assert_eq!(grown.param1, 1, "a fresh trunk starts with one water");
        assert_eq!(grown.param2, 1, "rotation is inherited");
        assert_eq!(
            map.get_node(trunk_pos).param1,
            29,
            "growing spends exactly one water level"
        );
    }

    #[test]
    fn humid_air_over_soil_fills_the_trunk() {
        let map = air_map();
        let registry = map.registry_arc();
        let trunk_pos = Point3::new(8, 4, 8);
        map.set_node(Point3::new(8, 3, 8), MapNode::new(BuiltinContent::Dirt.id()));
        map.set_node(trunk_pos, trunk(0));

        let rule = GrowTree::new(&registry, true);
        // Too cold to grow anything, but humid enough to drink from the air.
        let climate = Climate::constant(5.0, 80.0);
        run_tree(&map, &rule, &climate, trunk_pos, false);

        assert_eq!(map.get_node(trunk_pos).param1, 30, "fast mode jumps to the cap");
        assert_eq!(
            map.get_node(Point3::new(8, 5, 8)).content,
            CONTENT_AIR,
            "no growth below the heat minimum"
        );
    }

    #[test]
    fn trunk_drinks_adjacent_water_down_to_one_level() {
        let map = air_map();
        let registry = map.registry_arc();
        let trunk_pos = Point3::new(8, 4, 8);
        map.set_node(Point3::new(8, 3, 8), MapNode::new(BuiltinContent::Dirt.id()));
        map.set_node(trunk_pos, trunk(0));
        let water_pos = Point3::new(9, 4, 8);
        map.set_node(water_pos, MapNode::new(BuiltinContent::WaterSource.id()));

        let rule = GrowTree::new(&registry, false);
        let climate = Climate::constant(5.0, 0.0);
        run_tree(&map, &rule, &climate, trunk_pos, false);

        assert_eq!(map.get_node(trunk_pos).param1, 6, "absorbed all but one level");
        let drained = map.get_node(water_pos);
        assert_eq!(drained.content, BuiltinContent::WaterFlowing.id());
        assert_eq!(drained.liquid_level(), 1);
    }

    #[test]
    fn trunk_pumps_water_into_its_leaves() {
        let map = air_map();
        let registry = map.registry_arc();
        let trunk_pos = Point3::new(8, 4, 8);
        map.set_node(trunk_pos, trunk(30));
        let mut leaves = MapNode::new(BuiltinContent::Leaves.id());
        // Dim canopy: bright enough to keep, too dim for the trunk to grow
        // through (light above tree_grow_light_max is needed for that).
        leaves.set_light(LightBank::Day, 7);
        map.set_node(Point3::new(8, 5, 8), leaves);

        let rule = GrowTree::new(&registry, false);
        let climate = Climate::constant(5.0, 0.0);
        run_tree(&map, &rule, &climate, trunk_pos, false);

        let cap = map.get_node(Point3::new(8, 5, 8));
        assert_eq!(cap.content, BuiltinContent::Leaves.id());
        assert_eq!(cap.param2, 1, "one level arrived in the canopy");
        assert_eq!(map.get_node(trunk_pos).param1, 29);
    }

    #[test]
    fn water_redistributes_toward_the_trunk_bottom() {
        let map = air_map();
        let registry = map.registry_arc();
        let bottom = Point3::new(8, 3, 8);
        let middle = Point3::new(8, 4, 8);
        let top = Point3::new(8, 5, 8);
        map.set_node(bottom, trunk(0));
        map.set_node(middle, trunk(9));
        map.set_node(top, trunk(0));

        let rule = GrowTree::new(&registry, false);
        let climate = Climate::constant(5.0, 0.0);
        run_tree(&map, &rule, &climate, middle, false);

        // total 9 over three nodes: bottom takes floor(3) + 1, the top
        // ceil(avg - 1) of the remainder, the middle keeps the rest.
        let b = map.get_node(bottom).param1 as i32;
        let m = map.get_node(middle).param1 as i32;
        let t = map.get_node(top).param1 as i32;
        assert_eq!(b + m + t, 9, "redistribution conserves water");
        assert_eq!(b, 4);
        assert_eq!(t, 2);
        assert_eq!(m, 3);
        assert!(b >= m && m >= t, "water drifts downward");
    }

    #[test]
    fn starved_leaves_die_on_activation() {
        let map = air_map();
        let registry = map.registry_arc();
        let pos = Point3::new(8, 8, 8);
        let mut leaves = MapNode::new(BuiltinContent::Leaves.id());
        set_leaves_water_level(&mut leaves, 3);
        map.set_node(pos, leaves);

        let rule = GrowLeaves::new(&registry, false);
        let climate = Climate::constant(20.0, 50.0);
        run_leaves(&map, &rule, &climate, pos, true);

        assert_eq!(
            map.get_node(pos).content,
            CONTENT_AIR,
            "dark unsupported leaves are removed"
        );
    }

    #[test]
    fn ripe_canopy_leaves_turn_into_fruit() {
        let map = air_map();
        let registry = map.registry_arc();
        let pos = Point3::new(8, 8, 8);
        let mut center = MapNode::new(BuiltinContent::Leaves.id());
        center.set_light(LightBank::Day, 12);
        set_leaves_water_level(&mut center, 10);
        map.set_node(pos, center);
        // Canopy ring: leaves on all four sides, air above and below.
        for dir in [
            Vector3::new(1, 0, 0),
            Vector3::new(-1, 0, 0),
            Vector3::new(0, 0, 1),
            Vector3::new(0, 0, -1),
        ] {
            map.set_node(pos + dir, MapNode::new(BuiltinContent::Leaves.id()));
        }

        let rule = GrowLeaves::new(&registry, true);
        let climate = Climate::constant(20.0, 50.0);
        run_leaves(&map, &rule, &climate, pos, false);

        assert_eq!(map.get_node(pos).content, BuiltinContent::Fruit.id());
    }

    #[test]
    fn leaves_pump_water_to_drier_leaves() {
        let map = air_map();
        let registry = map.registry_arc();
        let a = Point3::new(5, 5, 5);
        let b = Point3::new(6, 5, 5);
        let mut wet = MapNode::new(BuiltinContent::Leaves.id());
        set_leaves_water_level(&mut wet, 10);
        map.set_node(a, wet);
        let mut dry = MapNode::new(BuiltinContent::Leaves.id());
        set_leaves_water_level(&mut dry, 2);
        map.set_node(b, dry);
        // Seal the rest so no air neighbor tempts the death rules.
        for dir in GROW_DIRS {
            for p in [a + dir, b + dir] {
                if p != a && p != b && map.get_node(p).content == CONTENT_AIR {
                    map.set_node(p, MapNode::new(BuiltinContent::Stone.id()));
                }
            }
        }

        let rule = GrowLeaves::new(&registry, false);
        let climate = Climate::constant(20.0, 50.0);
        run_leaves(&map, &rule, &climate, a, false);

        assert_eq!(map.get_node(a).param2, 9);
        assert_eq!(map.get_node(b).param2, 3);
    }
}
