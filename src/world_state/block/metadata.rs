//! # Node Metadata Module
//!
//! Sparse per-node key/value storage for special nodes (chests, signs,
//! furnaces). Metadata lives inside its owning block, keyed by the node's
//! block-local position, and is serialized with the block. Individual fields
//! can be marked private so they are persisted but withheld from clients,
//! and a metadata entry may carry a simple item inventory.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{ensure, Result};
use cgmath::Point3;

use super::wire::{read_point, read_string, read_u16, write_point, write_string, write_u16};

/// A single stack of items inside a metadata inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemStack {
    /// Item name, conventionally `<mod>:<name>`.
    pub name: String,
    /// Stack size.
    pub count: u16,
}

/// Arbitrary string key/value store attached to one node.
#[derive(Clone, Debug, Default)]
pub struct NodeMetadata {
    vars: BTreeMap<String, String>,
    private_vars: HashSet<String>,
    inventory: Vec<ItemStack>,
}

impl NodeMetadata {
    /// An empty metadata entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Sets a field value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_owned(), value.to_owned());
    }

    /// `true` when the named field exists and is marked private.
    pub fn is_private(&self, name: &str) -> bool {
        self.private_vars.contains(name)
    }

    /// Marks or unmarks a field as private. Private fields are saved to disk
    /// but never included in client-bound serializations.
    pub fn mark_private(&mut self, name: &str, private: bool) {
        if private {
            self.private_vars.insert(name.to_owned());
        } else {
            self.private_vars.remove(name);
        }
    }

    /// The attached inventory.
    pub fn inventory(&self) -> &[ItemStack] {
        &self.inventory
    }

    /// Mutable access to the attached inventory.
    pub fn inventory_mut(&mut self) -> &mut Vec<ItemStack> {
        &mut self.inventory
    }

    /// `true` when there are no fields and no inventory items.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.inventory.is_empty()
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        write_u16(out, self.vars.len() as u16);
        for (key, value) in &self.vars {
            write_string(out, key);
            write_string(out, value);
            out.push(self.private_vars.contains(key) as u8);
        }
        write_u16(out, self.inventory.len() as u16);
        for stack in &self.inventory {
            write_string(out, &stack.name);
            write_u16(out, stack.count);
        }
    }

    fn deserialize(data: &[u8], offset: &mut usize) -> Result<Self> {
        let mut meta = NodeMetadata::new();
        let var_count = read_u16(data, offset)?;
        for _ in 0..var_count {
            let key = read_string(data, offset)?;
            let value = read_string(data, offset)?;
            ensure!(*offset < data.len(), "truncated metadata entry");
            let private = data[*offset] != 0;
            *offset += 1;
            if private {
                meta.private_vars.insert(key.clone());
            }
            meta.vars.insert(key, value);
        }
        let item_count = read_u16(data, offset)?;
        for _ in 0..item_count {
            let name = read_string(data, offset)?;
            let count = read_u16(data, offset)?;
            meta.inventory.push(ItemStack { name, count });
        }
        Ok(meta)
    }
}

/// Metadata of all nodes of one block, keyed by block-local node position.
#[derive(Clone, Debug, Default)]
pub struct NodeMetadataList {
    data: HashMap<Point3<i16>, NodeMetadata>,
}

impl NodeMetadataList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata at a block-local position.
    pub fn get(&self, local: Point3<i16>) -> Option<&NodeMetadata> {
        self.data.get(&local)
    }

    /// Mutable metadata at a block-local position.
    pub fn get_mut(&mut self, local: Point3<i16>) -> Option<&mut NodeMetadata> {
        self.data.get_mut(&local)
    }

    /// Replaces the metadata at a position.
    pub fn set(&mut self, local: Point3<i16>, meta: NodeMetadata) {
        self.data.insert(local, meta);
    }

    /// Deletes the metadata at a position. Returns `true` when an entry
    /// existed.
    pub fn remove(&mut self, local: Point3<i16>) -> bool {
        self.data.remove(&local).is_some()
    }

    /// All positions holding metadata.
    pub fn keys(&self) -> Vec<Point3<i16>> {
        self.data.keys().copied().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when no node of the block has metadata.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends the list to a block serialization. Empty entries are skipped.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mut entries: Vec<(&Point3<i16>, &NodeMetadata)> =
            self.data.iter().filter(|(_, m)| !m.is_empty()).collect();
        entries.sort_by_key(|(p, _)| (p.z, p.y, p.x));
        write_u16(out, entries.len() as u16);
        for (pos, meta) in entries {
            write_point(out, *pos);
            meta.serialize(out);
        }
    }

    /// Reads a list from a block serialization.
    pub fn deserialize(data: &[u8], offset: &mut usize) -> Result<Self> {
        let mut list = NodeMetadataList::new();
        let count = read_u16(data, offset)?;
        for _ in 0..count {
            let pos = read_point(data, offset)?;
            let meta = NodeMetadata::deserialize(data, offset)?;
            list.data.insert(pos, meta);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips() {
        let mut list = NodeMetadataList::new();
        let mut meta = NodeMetadata::new();
        meta.set("owner", "celeron");
        meta.set("secret", "hunter2");
        meta.mark_private("secret", true);
        meta.inventory_mut().push(ItemStack {
            name: "default:apple".to_owned(),
            count: 3,
        });
        list.set(Point3::new(1, 2, 3), meta);
        // Empty entries are dropped on serialization.
        list.set(Point3::new(4, 4, 4), NodeMetadata::new());

        let mut bytes = Vec::new();
        list.serialize(&mut bytes);
        let mut offset = 0;
        let restored = NodeMetadataList::deserialize(&bytes, &mut offset).unwrap();
        assert_eq!(offset, bytes.len());
        assert_eq!(restored.len(), 1);

        let meta = restored.get(Point3::new(1, 2, 3)).unwrap();
        assert_eq!(meta.get("owner"), Some("celeron"));
        assert!(meta.is_private("secret"));
        assert!(!meta.is_private("owner"));
        assert_eq!(meta.inventory().len(), 1);
        assert_eq!(meta.inventory()[0].count, 3);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut list = NodeMetadataList::new();
        let mut meta = NodeMetadata::new();
        meta.set("k", "v");
        list.set(Point3::new(0, 0, 0), meta);
        let mut bytes = Vec::new();
        list.serialize(&mut bytes);

        let mut offset = 0;
        assert!(NodeMetadataList::deserialize(&bytes[..bytes.len() - 2], &mut offset).is_err());
    }
}
