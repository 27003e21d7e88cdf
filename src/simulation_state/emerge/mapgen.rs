//! Default terrain generator: 3D noise with an altitude falloff, a thin
//! layered surface, and water filling everything open below sea level.
//! Deterministic for a given seed, including across block boundaries, because
//! every decision is a pure function of world position.

use noise::{NoiseFn, Perlin};

use crate::world_state::block::MapBlock;
use crate::world_state::content::{BuiltinContent, ContentRegistry};
use crate::world_state::lighting::seed_sunlight;
use crate::world_state::node::{MapNode, CONTENT_AIR};
use crate::world_state::position::{
    block_to_node_origin, index_to_local, BlockPos, NodePos, MAP_BLOCK_NODES,
};

/// Scaling factor applied to world coordinates when sampling the noise.
const NOISE_SCALE: f64 = 0.02;
/// Density above which a node is solid.
const DENSITY_THRESHOLD: f64 = 0.2;
/// How quickly density drops with altitude; bounds terrain height.
const SURFACE_FALLOFF: f64 = 0.03;
/// A surface node at or below this depth relative to sea level is beach sand
/// rather than dirt.
const BEACH_HEIGHT: i16 = 1;

/// Static generator configuration, copied into each emerge worker.
#[derive(Copy, Clone, Debug)]
pub struct MapgenParams {
    /// World seed.
    pub seed: u32,
    /// Sea level in node coordinates.
    pub water_level: i16,
}

/// The terrain generator. Cheap to construct; each worker owns one.
pub struct MapGenerator {
    terrain: Perlin,
    water_level: i16,
}

impl MapGenerator {
    /// A generator for the given seed and sea level.
    pub fn new(params: MapgenParams) -> Self {
        Self {
            terrain: Perlin::new(params.seed),
            water_level: params.water_level,
        }
    }

    fn density(&self, p: NodePos) -> f64 {
        let sample = self.terrain.get([
            p.x as f64 * NOISE_SCALE,
            p.y as f64 * NOISE_SCALE,
            p.z as f64 * NOISE_SCALE,
        ]);
        sample - p.y as f64 * SURFACE_FALLOFF
    }

    fn is_solid(&self, p: NodePos) -> bool {
        self.density(p) > DENSITY_THRESHOLD
    }

    /// Generates one block: terrain, surface layer, water fill, seeded
    /// sunlight. The block comes back populated, lighting-expired and
    /// modified, ready for the map.
    pub fn generate(&self, registry: &ContentRegistry, pos: BlockPos) -> MapBlock {
        let mut block = MapBlock::new_blank(pos);
        let origin = block_to_node_origin(pos);
        for idx in 0..MAP_BLOCK_NODES {
            let local = index_to_local(idx);
            let p = NodePos::new(origin.x + local.x, origin.y + local.y, origin.z + local.z);
            let content = if self.is_solid(p) {
                if self.is_solid(NodePos::new(p.x, p.y + 1, p.z)) {
                    BuiltinContent::Stone.id()
                } else if p.y <= self.water_level + BEACH_HEIGHT {
                    BuiltinContent::Sand.id()
                } else {
                    BuiltinContent::Dirt.id()
                }
            } else if p.y < self.water_level {
                BuiltinContent::WaterSource.id()
            } else {
                CONTENT_AIR
            };
            block.set_node(idx, MapNode::new(content));
        }
        seed_sunlight(&mut block, registry);
        block.set_generated();
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_state::node::{LightBank, LIGHT_SUN};
    use cgmath::Point3;

    fn generator() -> MapGenerator {
        MapGenerator::new(MapgenParams {
            seed: 1234,
            water_level: 1,
        })
    }

    #[test]
    fn generation_is_deterministic() {
        let registry = ContentRegistry::with_builtin();
        let pos = Point3::new(0, 0, 0);
        let a = generator().generate(&registry, pos);
        let b = generator().generate(&registry, pos);
        assert_eq!(a.nodes()[..], b.nodes()[..]);
        assert!(a.is_generated());
        assert!(a.is_modified());
    }

    #[test]
    fn high_altitude_blocks_are_open_sky() {
        let registry = ContentRegistry::with_builtin();
        let block = generator().generate(&registry, Point3::new(0, 5, 0));
        for idx in 0..MAP_BLOCK_NODES {
            assert_eq!(block.node(idx).content, CONTENT_AIR);
        }
        // Open sky means full sunlight everywhere.
        assert_eq!(
            block.node_at(Point3::new(8, 0, 8)).light(LightBank::Day),
            LIGHT_SUN
        );
    }

    #[test]
    fn deep_blocks_are_solid_stone() {
        let registry = ContentRegistry::with_builtin();
        let block = generator().generate(&registry, Point3::new(0, -6, 0));
        for idx in 0..MAP_BLOCK_NODES {
            assert_eq!(block.node(idx).content, BuiltinContent::Stone.id());
        }
    }

    #[test]
    fn open_volume_below_sea_level_is_water() {
        let registry = ContentRegistry::with_builtin();
        let block = generator().generate(&registry, Point3::new(0, 0, 0));
        let mut water = 0;
        let mut wrong = 0;
        for idx in 0..MAP_BLOCK_NODES {
            let local = index_to_local(idx);
            let content = block.node(idx).content;
            if content == BuiltinContent::WaterSource.id() && local.y >= 1 {
                wrong += 1;
            }
            if content == BuiltinContent::WaterSource.id() {
                water += 1;
            }
        }
        assert_eq!(wrong, 0, "no water at or above sea level");
        // Seed 1234 has open volume below sea level in this block.
        assert!(water > 0);
    }

    #[test]
    fn surfaces_are_layered_not_bare_stone() {
        let registry = ContentRegistry::with_builtin();
        // Scan a few blocks for solid-below-open transitions; each must be
        // dirt or sand, never stone.
        for bx in -2..=2 {
            for bz in -2..=2 {
                let block = generator().generate(&registry, Point3::new(bx, 0, bz));
                for x in 0..16 {
                    for z in 0..16 {
                        for y in 0..15 {
                            let below = block.node_at(Point3::new(x, y, z)).content;
                            let above = block.node_at(Point3::new(x, y + 1, z)).content;
                            let above_open = above == CONTENT_AIR
                                || above == BuiltinContent::WaterSource.id();
                            if above_open && below == BuiltinContent::Stone.id() {
                                panic!("bare stone surface at ({x},{y},{z}) in block ({bx},0,{bz})");
                            }
                        }
                    }
                }
            }
        }
    }
}
