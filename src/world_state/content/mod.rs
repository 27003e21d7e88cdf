//! # Content Registry Module
//!
//! Maps content ids to content definitions: name, group memberships and the
//! static properties consumed read-only by the lighting, liquid and ABM
//! passes. The registry is built once at startup and shared immutably
//! afterwards, so lookups need no locking.
//!
//! Unresolved ids resolve to the "ignore" definition rather than failing;
//! a node whose content the server no longer knows is simply inert.

use std::collections::HashMap;

use log::warn;
use num_derive::FromPrimitive;

use crate::world_state::node::{CONTENT_AIR, CONTENT_IGNORE, CONTENT_UNKNOWN};

/// Identifier of a registered content (node type).
pub type ContentId = u16;

/// How a content participates in the liquid simulation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum LiquidType {
    /// Not a liquid.
    #[default]
    None,
    /// An infinite producer at maximum level; never decremented.
    Source,
    /// A spreading node carrying its level in `param2`.
    Flowing,
}

/// Static properties of one content.
///
/// This is the read-only contract the simulation passes consume; everything a
/// rule may ask about a node type lives here.
#[derive(Clone, Debug)]
pub struct ContentFeatures {
    /// Unique name, conventionally `<mod>:<name>`.
    pub name: String,
    /// Group memberships with per-group integer levels. Growth rules read
    /// their tuning overrides out of these as well.
    pub groups: HashMap<String, i32>,
    /// Whether artificial light passes through.
    pub light_propagates: bool,
    /// Whether full sunlight travels downward without attenuation.
    pub sunlight_propagates: bool,
    /// Emitted light level, 0 (none) to 14.
    pub light_source: u8,
    /// Whether objects collide with this content.
    pub walkable: bool,
    /// Whether a placed node may silently replace this one (air, grasses...).
    pub buildable_to: bool,
    /// Whether this content participates in liquid flow.
    pub liquid_type: LiquidType,
    /// Name of the source content of this liquid family, or of the
    /// "next stage" content for chained growth rules (tree -> leaves ->
    /// fruit), matching how the original data model reuses this field.
    pub liquid_alternative_source: String,
    /// Name of the flowing content of this liquid family.
    pub liquid_alternative_flowing: String,
    /// Flow resistance, 0 = water-like. Kept for rule queries.
    pub liquid_viscosity: u8,
    /// Whether two adjacent sources regenerate a source between them.
    pub liquid_renewable: bool,
}

impl ContentFeatures {
    /// A minimal opaque definition with the given name.
    pub fn opaque(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            groups: HashMap::new(),
            light_propagates: false,
            sunlight_propagates: false,
            light_source: 0,
            walkable: true,
            buildable_to: false,
            liquid_type: LiquidType::None,
            liquid_alternative_source: String::new(),
            liquid_alternative_flowing: String::new(),
            liquid_viscosity: 0,
            liquid_renewable: true,
        }
    }

    /// A minimal transparent, non-walkable definition.
    pub fn airlike(name: &str) -> Self {
        Self {
            walkable: false,
            buildable_to: true,
            light_propagates: true,
            sunlight_propagates: true,
            ..Self::opaque(name)
        }
    }

    /// Group level, 0 when absent.
    pub fn group(&self, name: &str) -> i32 {
        self.groups.get(name).copied().unwrap_or(0)
    }

    /// `true` when the content is in the group at any nonzero level.
    pub fn in_group(&self, name: &str) -> bool {
        self.group(name) != 0
    }

    /// `true` for sources and flowing liquids.
    pub fn is_liquid(&self) -> bool {
        self.liquid_type != LiquidType::None
    }

    /// Whether `param1` of nodes of this content stores the two light banks.
    /// Opaque non-emitting contents leave `param1` free for rule state (the
    /// tree growth counter lives there), so light passes must never read or
    /// write it for them.
    pub fn param_has_light(&self) -> bool {
        self.light_propagates || self.light_source > 0
    }
}

/// Well-known contents registered by [`ContentRegistry::with_builtin`],
/// at fixed ids so tests and the map generator can match on them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum BuiltinContent {
    /// `default:stone`
    Stone = 0,
    /// `default:dirt` (group `soil`)
    Dirt = 1,
    /// `default:sand` (group `sand`)
    Sand = 2,
    /// `default:tree` (groups `tree`, `grow_tree`)
    Tree = 3,
    /// `default:leaves` (groups `leaves`, `grow_leaves`)
    Leaves = 4,
    /// `default:apple`
    Fruit = 5,
    /// `default:water_source` (group `liquid`)
    WaterSource = 6,
    /// `default:water_flowing` (group `liquid`)
    WaterFlowing = 7,
    /// `default:torch`, light source 13
    Torch = 8,
}

impl BuiltinContent {
    /// Resolves an id back to a builtin variant, `None` for registry-assigned
    /// or reserved ids.
    pub fn from_id(id: ContentId) -> Option<Self> {
        num::FromPrimitive::from_u16(id)
    }

    /// The content id this builtin is registered at.
    pub fn id(self) -> ContentId {
        self as ContentId
    }
}

/// Group memberships of the builtin content set. Static so the table lives in
/// the binary and registration cannot misspell a group at runtime.
static BUILTIN_GROUPS: phf::Map<&'static str, &'static [(&'static str, i32)]> = phf::phf_map! {
    "default:stone" => &[],
    "default:dirt" => &[("soil", 1)],
    "default:sand" => &[("sand", 1)],
    "default:tree" => &[("tree", 1), ("grow_tree", 1)],
    "default:leaves" => &[("leaves", 1), ("grow_leaves", 1)],
    "default:apple" => &[("fruit", 1)],
    "default:water_source" => &[("liquid", 3)],
    "default:water_flowing" => &[("liquid", 3)],
    "default:torch" => &[],
};

fn builtin_groups(name: &str) -> HashMap<String, i32> {
    BUILTIN_GROUPS
        .get(name)
        .into_iter()
        .flat_map(|gs| gs.iter())
        .map(|(g, level)| ((*g).to_owned(), *level))
        .collect()
}

/// Id-keyed store of content definitions.
pub struct ContentRegistry {
    features: HashMap<ContentId, ContentFeatures>,
    name_to_id: HashMap<String, ContentId>,
    ignore: ContentFeatures,
    next_id: ContentId,
}

impl ContentRegistry {
    /// An empty registry containing only the reserved `air`, `ignore` and
    /// `unknown` definitions.
    pub fn new() -> Self {
        let mut registry = Self {
            features: HashMap::new(),
            name_to_id: HashMap::new(),
            ignore: ContentFeatures {
                // Ignore blocks neither light nor building; it stands for
                // "not loaded yet" and must stall algorithms, not feed them.
                buildable_to: false,
                walkable: false,
                light_propagates: false,
                sunlight_propagates: false,
                ..ContentFeatures::opaque("ignore")
            },
            next_id: 0,
        };
        registry.insert_at(CONTENT_AIR, ContentFeatures::airlike("air"));
        registry.insert_at(CONTENT_UNKNOWN, ContentFeatures::opaque("unknown"));
        registry
            .name_to_id
            .insert("ignore".to_owned(), CONTENT_IGNORE);
        registry
    }

    /// A registry pre-populated with the builtin content set used by the
    /// default map generator, the growth rules and the tests.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();

        let mut stone = ContentFeatures::opaque("default:stone");
        stone.groups = builtin_groups(&stone.name);
        registry.insert_at(BuiltinContent::Stone.id(), stone);

        let mut dirt = ContentFeatures::opaque("default:dirt");
        dirt.groups = builtin_groups(&dirt.name);
        registry.insert_at(BuiltinContent::Dirt.id(), dirt);

        let mut sand = ContentFeatures::opaque("default:sand");
        sand.groups = builtin_groups(&sand.name);
        registry.insert_at(BuiltinContent::Sand.id(), sand);

        let mut tree = ContentFeatures::opaque("default:tree");
        tree.groups = builtin_groups(&tree.name);
        // Growth chain: trunks grow this, leaves grow fruit.
        tree.liquid_alternative_source = "default:leaves".to_owned();
        registry.insert_at(BuiltinContent::Tree.id(), tree);

        let mut leaves = ContentFeatures::opaque("default:leaves");
        leaves.groups = builtin_groups(&leaves.name);
        leaves.light_propagates = true;
        leaves.liquid_alternative_source = "default:apple".to_owned();
        registry.insert_at(BuiltinContent::Leaves.id(), leaves);

        let mut fruit = ContentFeatures::opaque("default:apple");
        fruit.groups = builtin_groups(&fruit.name);
        fruit.walkable = false;
        fruit.light_propagates = true;
        registry.insert_at(BuiltinContent::Fruit.id(), fruit);

        let mut water_source = ContentFeatures::airlike("default:water_source");
        water_source.groups = builtin_groups(&water_source.name);
        water_source.buildable_to = false;
        water_source.sunlight_propagates = false;
        water_source.liquid_type = LiquidType::Source;
        water_source.liquid_alternative_source = "default:water_source".to_owned();
        water_source.liquid_alternative_flowing = "default:water_flowing".to_owned();
        registry.insert_at(BuiltinContent::WaterSource.id(), water_source);

        let mut water_flowing = ContentFeatures::airlike("default:water_flowing");
        water_flowing.groups = builtin_groups(&water_flowing.name);
        water_flowing.buildable_to = false;
        water_flowing.sunlight_propagates = false;
        water_flowing.liquid_type = LiquidType::Flowing;
        water_flowing.liquid_alternative_source = "default:water_source".to_owned();
        water_flowing.liquid_alternative_flowing = "default:water_flowing".to_owned();
        registry.insert_at(BuiltinContent::WaterFlowing.id(), water_flowing);

        let mut torch = ContentFeatures::airlike("default:torch");
        torch.groups = builtin_groups(&torch.name);
        torch.buildable_to = false;
        torch.light_source = 13;
        registry.insert_at(BuiltinContent::Torch.id(), torch);

        registry
    }

    fn insert_at(&mut self, id: ContentId, features: ContentFeatures) {
        self.name_to_id.insert(features.name.clone(), id);
        self.features.insert(id, features);
    }

    /// Registers a new content, assigning the next free id outside the
    /// reserved band. Re-registering a known name overwrites its definition
    /// in place.
    pub fn register(&mut self, features: ContentFeatures) -> ContentId {
        if let Some(&id) = self.name_to_id.get(&features.name) {
            warn!("content {:?} re-registered", features.name);
            self.features.insert(id, features);
            return id;
        }
        while self.features.contains_key(&self.next_id)
            || (CONTENT_UNKNOWN..=CONTENT_IGNORE).contains(&self.next_id)
        {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.insert_at(id, features);
        id
    }

    /// The definition for an id; the "ignore" definition when unknown.
    pub fn get(&self, id: ContentId) -> &ContentFeatures {
        self.features.get(&id).unwrap_or(&self.ignore)
    }

    /// Looks an id up by exact name.
    pub fn get_id(&self, name: &str) -> Option<ContentId> {
        self.name_to_id.get(name).copied()
    }

    /// All ids whose content is in the named group at a nonzero level.
    pub fn ids_in_group(&self, group: &str) -> Vec<ContentId> {
        let mut ids: Vec<ContentId> = self
            .features
            .iter()
            .filter(|(_, f)| f.in_group(group))
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Resolves a trigger specifier: either `group:<name>` or an exact
    /// content name. Unknown names resolve to nothing.
    pub fn resolve_specifier(&self, spec: &str) -> Vec<ContentId> {
        if let Some(group) = spec.strip_prefix("group:") {
            self.ids_in_group(group)
        } else {
            self.get_id(spec).into_iter().collect()
        }
    }
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
