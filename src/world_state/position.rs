//! # Position Module
//!
//! Coordinate types and conversions for the voxel world. The world is
//! addressed at two granularities:
//!
//! - **node coordinates**: signed 16-bit positions of single voxels
//! - **block coordinates**: node coordinates divided by [`MAP_BLOCKSIZE`],
//!   identifying one 16x16x16 block
//!
//! Block coordinates double as persistence keys. Two encodings exist: a
//! legacy packed 64-bit integer (13-bit fields with a modulo transform that
//! must be reproduced exactly for old worlds to load) and the current text
//! form `a<x>,<y>,<z>`. Writers always emit the text form; readers accept
//! both, auto-detected by the leading `a`.

use cgmath::{Point3, Vector3};

/// Edge length of a map block in nodes.
pub const MAP_BLOCKSIZE: i16 = 16;
/// Number of nodes in one block (`MAP_BLOCKSIZE`^3).
pub const MAP_BLOCK_NODES: usize =
    (MAP_BLOCKSIZE as usize) * (MAP_BLOCKSIZE as usize) * (MAP_BLOCKSIZE as usize);
/// Furthest node coordinate the generator will ever produce, per axis.
pub const MAX_MAP_GENERATION_LIMIT: i16 = 31007;

/// Position of a single node in world space.
pub type NodePos = Point3<i16>;
/// Position of a map block (node position divided by [`MAP_BLOCKSIZE`]).
pub type BlockPos = Point3<i16>;

/// The six axis-aligned neighbor offsets, top first, bottom last.
pub const DIRS_6: [Vector3<i16>; 6] = [
    Vector3::new(0, 1, 0),
    Vector3::new(0, 0, 1),
    Vector3::new(0, 0, -1),
    Vector3::new(1, 0, 0),
    Vector3::new(-1, 0, 0),
    Vector3::new(0, -1, 0),
];

/// Floor division by the block size, correct for negative coordinates.
#[inline]
fn blockify(v: i16) -> i16 {
    v.div_euclid(MAP_BLOCKSIZE)
}

/// Returns the block containing the given node.
#[inline]
pub fn node_to_block_pos(p: NodePos) -> BlockPos {
    Point3::new(blockify(p.x), blockify(p.y), blockify(p.z))
}

/// Returns the world position of a block's lowest-coordinate node.
#[inline]
pub fn block_to_node_origin(bp: BlockPos) -> NodePos {
    Point3::new(
        bp.x * MAP_BLOCKSIZE,
        bp.y * MAP_BLOCKSIZE,
        bp.z * MAP_BLOCKSIZE,
    )
}

/// Returns the node position relative to its containing block, each axis in
/// `0..MAP_BLOCKSIZE`.
#[inline]
pub fn node_to_local(p: NodePos) -> Point3<i16> {
    Point3::new(
        p.x.rem_euclid(MAP_BLOCKSIZE),
        p.y.rem_euclid(MAP_BLOCKSIZE),
        p.z.rem_euclid(MAP_BLOCKSIZE),
    )
}

/// Flattens a block-local position into an index into the dense node array.
#[inline]
pub fn local_index(local: Point3<i16>) -> usize {
    debug_assert!(
        (0..MAP_BLOCKSIZE).contains(&local.x)
            && (0..MAP_BLOCKSIZE).contains(&local.y)
            && (0..MAP_BLOCKSIZE).contains(&local.z)
    );
    (local.z as usize * MAP_BLOCKSIZE as usize + local.y as usize) * MAP_BLOCKSIZE as usize
        + local.x as usize
}

/// Inverse of [`local_index`].
#[inline]
pub fn index_to_local(index: usize) -> Point3<i16> {
    let bs = MAP_BLOCKSIZE as usize;
    Point3::new(
        (index % bs) as i16,
        ((index / bs) % bs) as i16,
        (index / (bs * bs)) as i16,
    )
}

// The integer position hashing is a lot more complicated than it looks; the
// decode side is NOT a plain bit unpack. Old worlds depend on these exact
// transforms, so they are reproduced rather than simplified.

fn unsigned_to_signed(i: u16, max_positive: u16) -> i16 {
    if i < max_positive {
        i as i16
    } else {
        (i as i32 - max_positive as i32 * 2) as i16
    }
}

// Modulo that behaves like Python's for negative dividends, including the
// historical quirk of returning `mod` itself (not 0) when (-i) % mod == 0.
fn python_modulo(i: i64, modulus: i16) -> i64 {
    let modulus = modulus as i64;
    if i >= 0 {
        i % modulus
    } else {
        modulus - ((-i) % modulus)
    }
}

/// Packs a block position into the legacy 64-bit database key.
pub fn block_as_integer(bp: BlockPos) -> i64 {
    (bp.z as i64)
        .wrapping_mul(0x0100_0000)
        .wrapping_add((bp.y as i64).wrapping_mul(0x1000))
        .wrapping_add(bp.x as i64)
}

/// Unpacks a legacy 64-bit database key into a block position.
///
/// Inverse of [`block_as_integer`] for all block positions within the world
/// generation limit.
pub fn integer_as_block(i: i64) -> BlockPos {
    let mut i = i;
    let x = unsigned_to_signed(python_modulo(i, 4096) as u16, 2048);
    i = (i - x as i64) / 4096;
    let y = unsigned_to_signed(python_modulo(i, 4096) as u16, 2048);
    i = (i - y as i64) / 4096;
    let z = unsigned_to_signed(python_modulo(i, 4096) as u16, 2048);
    Point3::new(x, y, z)
}

/// Formats a block position as the current text database key, `a<x>,<y>,<z>`.
pub fn block_as_string(bp: BlockPos) -> String {
    format!("a{},{},{}", bp.x, bp.y, bp.z)
}

/// Parses a database key in either the text or the legacy integer form.
///
/// Returns `None` for malformed keys; the persistence layer treats those as
/// foreign files and skips them.
pub fn string_as_block(key: &str) -> Option<BlockPos> {
    if let Some(rest) = key.strip_prefix('a') {
        let mut it = rest.split(',');
        let x = it.next()?.parse::<i16>().ok()?;
        let y = it.next()?.parse::<i16>().ok()?;
        let z = it.next()?.parse::<i16>().ok()?;
        if it.next().is_some() {
            return None;
        }
        Some(Point3::new(x, y, z))
    } else {
        // old format
        key.parse::<i64>().ok().map(integer_as_block)
    }
}

/// `true` when any node of the block lies outside the generation limit.
pub fn blockpos_over_limit(bp: BlockPos) -> bool {
    let limit = MAX_MAP_GENERATION_LIMIT / MAP_BLOCKSIZE;
    bp.x.abs() > limit || bp.y.abs() > limit || bp.z.abs() > limit
}

/// `true` when a floating object position lies outside the world bound.
pub fn objectpos_over_limit(p: Point3<f32>) -> bool {
    let limit = MAX_MAP_GENERATION_LIMIT as f32 + 0.5;
    p.x.abs() > limit || p.y.abs() > limit || p.z.abs() > limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_block_conversions() {
        assert_eq!(node_to_block_pos(Point3::new(0, 0, 0)), Point3::new(0, 0, 0));
        assert_eq!(node_to_block_pos(Point3::new(15, 15, 15)), Point3::new(0, 0, 0));
        assert_eq!(node_to_block_pos(Point3::new(16, 0, -1)), Point3::new(1, 0, -1));
        assert_eq!(
            node_to_block_pos(Point3::new(-16, -17, 31)),
            Point3::new(-1, -2, 1)
        );

        let p = Point3::new(-3, 100, 17);
        let bp = node_to_block_pos(p);
        let local = node_to_local(p);
        assert_eq!(
            block_to_node_origin(bp) + Vector3::new(local.x, local.y, local.z),
            p
        );
    }

    #[test]
    fn local_index_round_trips() {
        for idx in 0..MAP_BLOCK_NODES {
            assert_eq!(local_index(index_to_local(idx)), idx);
        }
    }

    #[test]
    fn integer_encoding_is_a_bijection() {
        let samples = [
            Point3::new(0, 0, 0),
            Point3::new(1, 2, 3),
            Point3::new(-1, -2, -3),
            Point3::new(2047, -2048, 1937),
            Point3::new(-1937, 1937, -1937),
            Point3::new(-1, 0, 0),
            Point3::new(0, -1, 0),
            Point3::new(0, 0, -1),
        ];
        for bp in samples {
            assert_eq!(integer_as_block(block_as_integer(bp)), bp, "bp={:?}", bp);
        }
    }

    #[test]
    fn integer_encoding_exhaustive_x_axis() {
        for x in -1937..=1937 {
            let bp = Point3::new(x, -60, 3);
            assert_eq!(integer_as_block(block_as_integer(bp)), bp);
        }
    }

    #[test]
    fn text_encoding_round_trips() {
        let samples = [
            Point3::new(0, 0, 0),
            Point3::new(-1, 22, -333),
            Point3::new(1937, -1937, 4),
        ];
        for bp in samples {
            assert_eq!(string_as_block(&block_as_string(bp)), Some(bp));
        }
    }

    #[test]
    fn legacy_keys_are_detected_by_missing_marker() {
        let bp = Point3::new(-7, 12, 100);
        let legacy = block_as_integer(bp).to_string();
        assert_eq!(string_as_block(&legacy), Some(bp));
        assert_eq!(string_as_block("a1,2"), None);
        assert_eq!(string_as_block("garbage"), None);
    }

    #[test]
    fn limit_checks() {
        assert!(!blockpos_over_limit(Point3::new(0, 0, 0)));
        assert!(!blockpos_over_limit(Point3::new(1937, -1937, 1937)));
        assert!(blockpos_over_limit(Point3::new(1938, 0, 0)));
        assert!(objectpos_over_limit(Point3::new(0.0, 32000.0, 0.0)));
        assert!(!objectpos_over_limit(Point3::new(0.0, 31007.0, 0.0)));
    }
}
