//! # Map Block Module
//!
//! A `MapBlock` is the unit of loading, persistence and simulation: a dense
//! 16x16x16 array of nodes together with the sparse per-node extras (metadata,
//! timers), the bookkeeping flags that drive saving and lighting repair, and
//! the usage timer that drives eviction.
//!
//! ## Lifecycle
//!
//! Blocks are created blank on first reference, then populated either from
//! the persistence backend or by the generator. Simulation passes mutate
//! nodes through the owning map; any node, metadata or timer change marks the
//! block modified so the periodic save sweep picks it up. A block whose
//! handle count has dropped to the store's own reference and whose usage
//! timer has exceeded the unload timeout is saved (if dirty) and evicted.
//!
//! ## Serialization
//!
//! The on-disk form is a version byte, a flags byte, the raw node array, the
//! metadata list and the timer list. An unsupported version is an error and
//! the block is treated as not found by the loader.

pub mod metadata;
pub mod node_timer;

pub(crate) mod wire {
    //! Little-endian primitives shared by the block serializers.

    use anyhow::{ensure, Context, Result};
    use cgmath::Point3;

    pub fn write_u16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(out: &mut Vec<u8>, v: f32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_string(out: &mut Vec<u8>, s: &str) {
        write_u16(out, s.len() as u16);
        out.extend_from_slice(s.as_bytes());
    }

    /// Block-local positions fit one byte per axis.
    pub fn write_point(out: &mut Vec<u8>, p: Point3<i16>) {
        out.push(p.x as u8);
        out.push(p.y as u8);
        out.push(p.z as u8);
    }

    pub fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16> {
        ensure!(*offset + 2 <= data.len(), "truncated u16");
        let v = u16::from_le_bytes([data[*offset], data[*offset + 1]]);
        *offset += 2;
        Ok(v)
    }

    pub fn read_f32(data: &[u8], offset: &mut usize) -> Result<f32> {
        ensure!(*offset + 4 <= data.len(), "truncated f32");
        let v = f32::from_le_bytes(data[*offset..*offset + 4].try_into().unwrap());
        *offset += 4;
        Ok(v)
    }

    pub fn read_string(data: &[u8], offset: &mut usize) -> Result<String> {
        let len = read_u16(data, offset)? as usize;
        ensure!(*offset + len <= data.len(), "truncated string");
        let s = std::str::from_utf8(&data[*offset..*offset + len])
            .context("invalid utf-8 in serialized string")?
            .to_owned();
        *offset += len;
        Ok(s)
    }

    pub fn read_point(data: &[u8], offset: &mut usize) -> Result<Point3<i16>> {
        ensure!(*offset + 3 <= data.len(), "truncated position");
        let p = Point3::new(
            data[*offset] as i16,
            data[*offset + 1] as i16,
            data[*offset + 2] as i16,
        );
        *offset += 3;
        Ok(p)
    }
}

use anyhow::{bail, ensure, Result};
use cgmath::Point3;

use crate::world_state::node::MapNode;
use crate::world_state::position::{local_index, BlockPos, MAP_BLOCKSIZE, MAP_BLOCK_NODES};

use metadata::NodeMetadataList;
use node_timer::NodeTimerList;

/// Current block serialization version.
pub const BLOCK_SER_VERSION: u8 = 29;
/// Oldest version the loader still accepts.
pub const BLOCK_SER_VERSION_MIN: u8 = 29;

const FLAG_GENERATED: u8 = 1 << 0;
const FLAG_LIGHTING_EXPIRED: u8 = 1 << 1;

/// One 16x16x16 block of the world. See the module documentation.
pub struct MapBlock {
    pos: BlockPos,
    nodes: Box<[MapNode; MAP_BLOCK_NODES]>,
    modified: bool,
    lighting_expired: bool,
    generated: bool,
    usage_timer: f32,
    metadata: NodeMetadataList,
    node_timers: NodeTimerList,
    /// Cached surface temperature for growth rules, degrees.
    pub heat: f32,
    /// Cached humidity for growth rules, percent.
    pub humidity: f32,
    /// Game time at which the climate cache was last refreshed.
    pub weather_update: f64,
}

impl MapBlock {
    /// Creates a blank block: every node is the "ignore" sentinel, lighting
    /// is expired, nothing is generated yet.
    pub fn new_blank(pos: BlockPos) -> Self {
        Self {
            pos,
            nodes: Box::new([MapNode::ignore(); MAP_BLOCK_NODES]),
            modified: false,
            lighting_expired: true,
            generated: false,
            usage_timer: 0.0,
            metadata: NodeMetadataList::new(),
            node_timers: NodeTimerList::new(),
            heat: 0.0,
            humidity: 0.0,
            weather_update: f64::NEG_INFINITY,
        }
    }

    /// The block's position in block coordinates.
    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    #[inline]
    fn check_local(local: Point3<i16>) -> bool {
        (0..MAP_BLOCKSIZE).contains(&local.x)
            && (0..MAP_BLOCKSIZE).contains(&local.y)
            && (0..MAP_BLOCKSIZE).contains(&local.z)
    }

    /// The node at a block-local position.
    ///
    /// # Panics
    /// Panics if any axis is outside `0..16`.
    pub fn node_at(&self, local: Point3<i16>) -> MapNode {
        assert!(Self::check_local(local), "local position out of block: {local:?}");
        self.nodes[local_index(local)]
    }

    /// The node at a flat index, `0..4096`.
    pub fn node(&self, index: usize) -> MapNode {
        self.nodes[index]
    }

    /// Writes a node and marks the block modified.
    ///
    /// # Panics
    /// Panics if any axis is outside `0..16`.
    pub fn set_node_at(&mut self, local: Point3<i16>, node: MapNode) {
        assert!(Self::check_local(local), "local position out of block: {local:?}");
        self.nodes[local_index(local)] = node;
        self.modified = true;
    }

    /// Writes a node by flat index and marks the block modified.
    pub fn set_node(&mut self, index: usize, node: MapNode) {
        self.nodes[index] = node;
        self.modified = true;
    }

    /// Read-only view of the whole node array, for bulk passes.
    pub fn nodes(&self) -> &[MapNode; MAP_BLOCK_NODES] {
        &self.nodes
    }

    /// Mutable view of the whole node array for the generator; the caller is
    /// responsible for calling [`MapBlock::set_modified`] when appropriate.
    pub fn nodes_mut(&mut self) -> &mut [MapNode; MAP_BLOCK_NODES] {
        &mut self.nodes
    }

    /// Whether the block has unsaved changes.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Marks the block as having unsaved changes.
    pub fn set_modified(&mut self) {
        self.modified = true;
    }

    /// Clears the modified flag after a successful save.
    pub fn clear_modified(&mut self) {
        self.modified = false;
    }

    /// Whether stored light values may be stale and need repair.
    pub fn is_lighting_expired(&self) -> bool {
        self.lighting_expired
    }

    /// Sets the lighting-expired flag.
    pub fn set_lighting_expired(&mut self, expired: bool) {
        self.lighting_expired = expired;
    }

    /// Whether the block holds generated (or loaded) world data, as opposed
    /// to being a blank placeholder.
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// Marks the block as populated.
    pub fn set_generated(&mut self) {
        self.generated = true;
    }

    /// Seconds since the block was last accessed through the map.
    pub fn usage_timer(&self) -> f32 {
        self.usage_timer
    }

    /// Resets the usage timer; called on every map access.
    pub fn reset_usage_timer(&mut self) {
        self.usage_timer = 0.0;
    }

    /// Advances the usage timer; called by the eviction sweep.
    pub fn inc_usage_timer(&mut self, dtime: f32) {
        self.usage_timer += dtime;
    }

    /// The block's node metadata list.
    pub fn metadata(&self) -> &NodeMetadataList {
        &self.metadata
    }

    /// Mutable metadata access. Marks the block modified, as any metadata
    /// change must be persisted.
    pub fn metadata_mut(&mut self) -> &mut NodeMetadataList {
        self.modified = true;
        &mut self.metadata
    }

    /// The block's node timer list.
    pub fn node_timers(&self) -> &NodeTimerList {
        &self.node_timers
    }

    /// Mutable timer access. Marks the block modified.
    pub fn node_timers_mut(&mut self) -> &mut NodeTimerList {
        self.modified = true;
        &mut self.node_timers
    }

    /// Serializes the block to its on-disk byte form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + MAP_BLOCK_NODES * 4);
        out.push(BLOCK_SER_VERSION);
        let mut flags = 0u8;
        if self.generated {
            flags |= FLAG_GENERATED;
        }
        if self.lighting_expired {
            flags |= FLAG_LIGHTING_EXPIRED;
        }
        out.push(flags);
        out.extend_from_slice(bytemuck::cast_slice(&self.nodes[..]));
        self.metadata.serialize(&mut out);
        self.node_timers.serialize(&mut out);
        out
    }

    /// Reconstructs a block from its on-disk byte form.
    ///
    /// Fails on truncated data or an unsupported version; the loader treats
    /// either as "not found" after logging.
    pub fn deserialize(pos: BlockPos, data: &[u8]) -> Result<Self> {
        ensure!(data.len() >= 2, "block data too short");
        let version = data[0];
        if !(BLOCK_SER_VERSION_MIN..=BLOCK_SER_VERSION).contains(&version) {
            bail!("unsupported block serialization version {version}");
        }
        let flags = data[1];

        let node_bytes = MAP_BLOCK_NODES * std::mem::size_of::<MapNode>();
        ensure!(data.len() >= 2 + node_bytes, "truncated node array");

        let mut block = MapBlock::new_blank(pos);
        bytemuck::cast_slice_mut::<MapNode, u8>(&mut block.nodes[..])
            .copy_from_slice(&data[2..2 + node_bytes]);

        let mut offset = 2 + node_bytes;
        block.metadata = NodeMetadataList::deserialize(data, &mut offset)?;
        block.node_timers = NodeTimerList::deserialize(data, &mut offset)?;
        ensure!(offset == data.len(), "trailing bytes after block data");

        block.generated = flags & FLAG_GENERATED != 0;
        block.lighting_expired = flags & FLAG_LIGHTING_EXPIRED != 0;
        block.modified = false;
        Ok(block)
    }
}
