//! # Node Timer Module
//!
//! Sparse one-shot timers attached to nodes, used for delayed callbacks
//! (furnace completion, regrowth delays). Timers are stored per block, keyed
//! by block-local node position, stepped with the block while it is loaded
//! and serialized with it while it is not.

use std::collections::HashMap;

use anyhow::Result;
use cgmath::Point3;

use super::wire::{read_f32, read_point, read_u16, write_f32, write_point, write_u16};

/// A single pending timer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NodeTimer {
    /// Seconds until the timer fires, measured from when it was set.
    pub timeout: f32,
    /// Seconds already elapsed; persisted so a timer survives unload.
    pub elapsed: f32,
}

impl NodeTimer {
    /// A fresh timer that fires after `timeout` seconds.
    pub fn new(timeout: f32) -> Self {
        Self {
            timeout,
            elapsed: 0.0,
        }
    }
}

/// Timers of all nodes of one block.
#[derive(Clone, Debug, Default)]
pub struct NodeTimerList {
    timers: HashMap<Point3<i16>, NodeTimer>,
}

impl NodeTimerList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The timer at a block-local position.
    pub fn get(&self, local: Point3<i16>) -> Option<NodeTimer> {
        self.timers.get(&local).copied()
    }

    /// Sets (or replaces) the timer at a position.
    pub fn set(&mut self, local: Point3<i16>, timer: NodeTimer) {
        self.timers.insert(local, timer);
    }

    /// Removes the timer at a position. Returns `true` when one existed.
    pub fn remove(&mut self, local: Point3<i16>) -> bool {
        self.timers.remove(&local).is_some()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// `true` when no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Advances all timers by `dtime` seconds and removes the ones that
    /// fired, returning them with their positions so the environment can run
    /// the callbacks. Timers are one-shot; a callback re-arms explicitly.
    pub fn step(&mut self, dtime: f32) -> Vec<(Point3<i16>, NodeTimer)> {
        let mut elapsed = Vec::new();
        self.timers.retain(|pos, timer| {
            timer.elapsed += dtime;
            if timer.elapsed >= timer.timeout {
                elapsed.push((*pos, *timer));
                false
            } else {
                true
            }
        });
        elapsed.sort_by_key(|(p, _)| (p.z, p.y, p.x));
        elapsed
    }

    /// Appends the list to a block serialization.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mut entries: Vec<(&Point3<i16>, &NodeTimer)> = self.timers.iter().collect();
        entries.sort_by_key(|(p, _)| (p.z, p.y, p.x));
        write_u16(out, entries.len() as u16);
        for (pos, timer) in entries {
            write_point(out, *pos);
            write_f32(out, timer.timeout);
            write_f32(out, timer.elapsed);
        }
    }

    /// Reads a list from a block serialization.
    pub fn deserialize(data: &[u8], offset: &mut usize) -> Result<Self> {
        let mut list = NodeTimerList::new();
        let count = read_u16(data, offset)?;
        for _ in 0..count {
            let pos = read_point(data, offset)?;
            let timeout = read_f32(data, offset)?;
            let elapsed = read_f32(data, offset)?;
            list.timers.insert(pos, NodeTimer { timeout, elapsed });
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_once_and_are_removed() {
        let mut list = NodeTimerList::new();
        list.set(Point3::new(1, 1, 1), NodeTimer::new(1.0));
        list.set(Point3::new(2, 2, 2), NodeTimer::new(3.0));

        assert!(list.step(0.5).is_empty());
        let fired = list.step(0.6);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, Point3::new(1, 1, 1));
        assert_eq!(list.len(), 1);

        let fired = list.step(2.0);
        assert_eq!(fired.len(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn elapsed_time_survives_serialization() {
        let mut list = NodeTimerList::new();
        list.set(
            Point3::new(0, 5, 15),
            NodeTimer {
                timeout: 10.0,
                elapsed: 4.5,
            },
        );

        let mut bytes = Vec::new();
        list.serialize(&mut bytes);
        let mut offset = 0;
        let mut restored = NodeTimerList::deserialize(&bytes, &mut offset).unwrap();
        assert_eq!(offset, bytes.len());

        // 5.5 more seconds completes the original 10 second timeout.
        let fired = restored.step(5.5);
        assert_eq!(fired.len(), 1);
    }
}
