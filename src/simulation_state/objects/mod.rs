//! # Active Object Module
//!
//! The id-keyed registry of mobile entities (players, mobs) and its spatial
//! queries. Objects are stepped once per tick by the environment; network
//! relevancy asks the registry which objects became visible around a player
//! since the last send.
//!
//! ## Removal discipline
//!
//! Nothing is ever erased from the primary container while an iteration over
//! it may be live. [`ActiveObjectMgr::remove_object`] only marks the object
//! gone; [`ActiveObjectMgr::sweep_removed`] physically erases marked objects
//! at the environment's post-step synchronization point. Callbacks running
//! inside [`ActiveObjectMgr::step`] may therefore freely remove any object,
//! including the one currently visited.

pub mod player;

use std::collections::{HashMap, HashSet};

use cgmath::Point3;
use log::{debug, error, info, warn};

use crate::core::MtResource;
use crate::world_state::position::objectpos_over_limit;

/// Identifier of a registered active object. Zero is reserved and means
/// "not yet registered".
pub type ObjectId = u16;

/// Coarse classification of an active object, used by the relevancy queries
/// to apply the separate player visibility radius.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectType {
    /// A connected player's avatar.
    Player,
    /// Any non-player entity.
    Mob,
}

/// A mobile entity tracked by the registry.
pub trait ActiveObject: Send + Sync {
    /// The object's id; zero until registered.
    fn id(&self) -> ObjectId;
    /// Stores the id assigned at registration.
    fn set_id(&mut self, id: ObjectId);
    /// The object's classification.
    fn object_type(&self) -> ObjectType;
    /// Current position in node coordinates.
    fn base_position(&self) -> Point3<f32>;
    /// Whether the object is marked for removal and should be skipped.
    fn is_gone(&self) -> bool;
    /// Marks the object for removal at the next sweep.
    fn mark_for_removal(&mut self);
    /// Advances the object's behavior by `dtime` seconds.
    fn step(&mut self, dtime: f32);
}

/// Shared handle to a registered object.
pub type ObjectHandle = MtResource<Box<dyn ActiveObject>>;

/// The id-keyed object registry. See the module documentation.
#[derive(Default)]
pub struct ActiveObjectMgr {
    objects: HashMap<ObjectId, ObjectHandle>,
}

impl ActiveObjectMgr {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered objects, including ones marked for removal but
    /// not yet swept.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// `true` when no object is registered.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn is_free_id(&self, id: ObjectId) -> bool {
        id != 0 && !self.objects.contains_key(&id)
    }

    /// First unused id, scanning upward from 1 so freed low ids are reused.
    /// Zero when the id space is exhausted.
    fn free_id(&self) -> ObjectId {
        (1..=ObjectId::MAX).find(|&id| self.is_free_id(id)).unwrap_or(0)
    }

    /// Registers an object, assigning the first free id when the object
    /// carries id zero, or honoring its preset id otherwise.
    ///
    /// Fails (logging, returning `None`) when the id space is exhausted, the
    /// preset id is taken, or the object's position lies outside the world
    /// bound.
    pub fn register_object(&mut self, mut obj: Box<dyn ActiveObject>) -> Option<ObjectId> {
        if obj.id() == 0 {
            let new_id = self.free_id();
            if new_id == 0 {
                error!("register_object: no free id available");
                return None;
            }
            obj.set_id(new_id);
        } else if !self.is_free_id(obj.id()) {
            error!("register_object: id {} is not free", obj.id());
            return None;
        }

        let pos = obj.base_position();
        if objectpos_over_limit(pos) {
            warn!(
                "register_object: position ({}, {}, {}) outside maximum range",
                pos.x, pos.y, pos.z
            );
            return None;
        }

        let id = obj.id();
        self.objects.insert(id, MtResource::new(obj));
        debug!("registered active object {id}; {} now active", self.objects.len());
        Some(id)
    }

    /// The handle for an id, if registered.
    pub fn get(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.objects.get(&id).cloned()
    }

    /// Marks an object for removal. Physical erasure happens at the next
    /// [`ActiveObjectMgr::sweep_removed`], so in-flight iteration stays
    /// valid. Safe to call from inside a step callback.
    pub fn remove_object(&self, id: ObjectId) {
        match self.objects.get(&id) {
            Some(handle) => handle.get_mut().mark_for_removal(),
            None => info!("remove_object: id {id} not found"),
        }
    }

    /// Erases every object marked gone. Called once per tick, after the step
    /// pass has finished.
    pub fn sweep_removed(&mut self) {
        self.objects.retain(|_, handle| !handle.get().is_gone());
    }

    /// Calls `f` on every live object. The snapshot taken up front means `f`
    /// may remove any object, including the one it is visiting.
    pub fn step(&self, dtime: f32, mut f: impl FnMut(&ObjectHandle, f32)) {
        let handles: Vec<ObjectHandle> = self.objects.values().cloned().collect();
        for handle in &handles {
            if handle.get().is_gone() {
                continue;
            }
            f(handle, dtime);
        }
    }

    /// Positions of all live player objects.
    pub fn player_positions(&self) -> Vec<Point3<f32>> {
        self.objects
            .values()
            .filter_map(|handle| {
                let obj = handle.get();
                (obj.object_type() == ObjectType::Player && !obj.is_gone())
                    .then(|| obj.base_position())
            })
            .collect()
    }

    /// Live objects within `radius` of `pos` that pass `include`.
    pub fn objects_inside_radius(
        &self,
        pos: Point3<f32>,
        radius: f32,
        include: impl Fn(&dyn ActiveObject) -> bool,
    ) -> Vec<ObjectHandle> {
        let r2 = radius * radius;
        self.objects
            .values()
            .filter(|handle| {
                let obj = handle.get();
                if obj.is_gone() {
                    return false;
                }
                let d = obj.base_position() - pos;
                d.x * d.x + d.y * d.y + d.z * d.z <= r2 && include(obj.as_ref())
            })
            .cloned()
            .collect()
    }

    /// Live objects within the axis-aligned box `[min, max]` that pass
    /// `include`.
    pub fn objects_in_area(
        &self,
        min: Point3<f32>,
        max: Point3<f32>,
        include: impl Fn(&dyn ActiveObject) -> bool,
    ) -> Vec<ObjectHandle> {
        self.objects
            .values()
            .filter(|handle| {
                let obj = handle.get();
                if obj.is_gone() {
                    return false;
                }
                let p = obj.base_position();
                p.x >= min.x
                    && p.x <= max.x
                    && p.y >= min.y
                    && p.y <= max.y
                    && p.z >= min.z
                    && p.z <= max.z
                    && include(obj.as_ref())
            })
            .cloned()
            .collect()
    }

    /// Ids of objects near `player_pos` that the client does not know yet.
    ///
    /// Skips gone objects, objects beyond `radius` (players beyond
    /// `player_radius` instead, unless it is zero), and everything already in
    /// `current`. At most ten ids are appended per call so one send never
    /// floods a client; the rest follow on later calls.
    pub fn get_added_active_objects_around(
        &self,
        player_pos: Point3<f32>,
        radius: f32,
        player_radius: f32,
        current: &HashSet<ObjectId>,
        added: &mut Vec<ObjectId>,
    ) {
        for (&id, handle) in &self.objects {
            let obj = handle.get();
            if obj.is_gone() {
                continue;
            }
            let d = obj.base_position() - player_pos;
            let distance = (d.x * d.x + d.y * d.y + d.z * d.z).sqrt();
            if obj.object_type() == ObjectType::Player {
                if player_radius != 0.0 && distance > player_radius {
                    continue;
                }
            } else if distance > radius {
                continue;
            }
            if current.contains(&id) {
                continue;
            }
            added.push(id);
            if added.len() >= 10 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestObject {
        id: ObjectId,
        object_type: ObjectType,
        pos: Point3<f32>,
        gone: bool,
    }

    impl TestObject {
        fn at(pos: Point3<f32>) -> Box<Self> {
            Box::new(Self {
                id: 0,
                object_type: ObjectType::Mob,
                pos,
                gone: false,
            })
        }

        fn with_id(id: ObjectId) -> Box<Self> {
            let mut obj = Self::at(Point3::new(0.0, 0.0, 0.0));
            obj.id = id;
            obj
        }

        fn player_at(pos: Point3<f32>) -> Box<Self> {
            let mut obj = Self::at(pos);
            obj.object_type = ObjectType::Player;
            obj
        }
    }

    impl ActiveObject for TestObject {
        fn id(&self) -> ObjectId {
            self.id
        }
        fn set_id(&mut self, id: ObjectId) {
            self.id = id;
        }
        fn object_type(&self) -> ObjectType {
            self.object_type
        }
        fn base_position(&self) -> Point3<f32> {
            self.pos
        }
        fn is_gone(&self) -> bool {
            self.gone
        }
        fn mark_for_removal(&mut self) {
            self.gone = true;
        }
        fn step(&mut self, dtime: f32) {
            self.pos.x += dtime;
        }
    }

    #[test]
    fn ids_are_assigned_and_reused() {
        let mut mgr = ActiveObjectMgr::new();
        let a = mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0)));
        let b = mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0)));
        let c = mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0)));
        assert_eq!((a, b, c), (Some(1), Some(2), Some(3)));

        mgr.remove_object(2);
        mgr.sweep_removed();
        // The lowest free id comes back first.
        let d = mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0)));
        assert_eq!(d, Some(2));
    }

    #[test]
    fn preset_ids_are_honored_and_duplicates_rejected() {
        let mut mgr = ActiveObjectMgr::new();
        assert_eq!(mgr.register_object(TestObject::with_id(40)), Some(40));
        assert_eq!(mgr.register_object(TestObject::with_id(40)), None);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn out_of_range_positions_are_rejected() {
        let mut mgr = ActiveObjectMgr::new();
        assert_eq!(
            mgr.register_object(TestObject::at(Point3::new(0.0, 40000.0, 0.0))),
            None
        );
        assert!(mgr.is_empty());
    }

    #[test]
    fn exhausted_id_space_fails_cleanly() {
        let mut mgr = ActiveObjectMgr::new();
        for id in 1..=ObjectId::MAX {
            assert_eq!(mgr.register_object(TestObject::with_id(id)), Some(id));
        }
        assert_eq!(mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0))), None);
        assert_eq!(mgr.len(), ObjectId::MAX as usize);
    }

    #[test]
    fn removal_during_step_does_not_invalidate_iteration() {
        let mut mgr = ActiveObjectMgr::new();
        for _ in 0..5 {
            mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0)));
        }
        let mut visited = 0;
        mgr.step(0.1, |handle, dtime| {
            visited += 1;
            // Every callback removes the object it is visiting.
            mgr.remove_object(handle.get().id());
            handle.get_mut().step(dtime);
        });
        assert_eq!(visited, 5);
        assert_eq!(mgr.len(), 5, "erasure waits for the sweep");
        mgr.sweep_removed();
        assert!(mgr.is_empty());

        // Removing an arbitrary other object mid-step is equally safe; the
        // victim is skipped if its turn has not come yet.
        for _ in 0..5 {
            mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0)));
        }
        let mut stepped = 0;
        mgr.step(0.1, |handle, _| {
            stepped += 1;
            let id = handle.get().id();
            mgr.remove_object((id % 5) + 1);
        });
        assert!(stepped >= 1);
        mgr.sweep_removed();
        assert!(mgr.len() < 5);
    }

    #[test]
    fn spatial_queries() {
        let mut mgr = ActiveObjectMgr::new();
        mgr.register_object(TestObject::at(Point3::new(0.0, 0.0, 0.0)));
        mgr.register_object(TestObject::at(Point3::new(5.0, 0.0, 0.0)));
        mgr.register_object(TestObject::at(Point3::new(100.0, 0.0, 0.0)));

        let near = mgr.objects_inside_radius(Point3::new(0.0, 0.0, 0.0), 10.0, |_| true);
        assert_eq!(near.len(), 2);

        let filtered = mgr.objects_inside_radius(Point3::new(0.0, 0.0, 0.0), 10.0, |o| {
            o.base_position().x > 1.0
        });
        assert_eq!(filtered.len(), 1);

        let boxed = mgr.objects_in_area(
            Point3::new(-1.0, -1.0, -1.0),
            Point3::new(6.0, 1.0, 1.0),
            |_| true,
        );
        assert_eq!(boxed.len(), 2);
    }

    #[test]
    fn added_objects_diff_is_capped_at_ten() {
        let mut mgr = ActiveObjectMgr::new();
        for i in 0..15 {
            mgr.register_object(TestObject::at(Point3::new(i as f32, 0.0, 0.0)));
        }
        let mut added = Vec::new();
        mgr.get_added_active_objects_around(
            Point3::new(0.0, 0.0, 0.0),
            100.0,
            0.0,
            &HashSet::new(),
            &mut added,
        );
        assert_eq!(added.len(), 10);

        // Known ids are excluded from later diffs.
        let current: HashSet<ObjectId> = added.iter().copied().collect();
        let mut more = Vec::new();
        mgr.get_added_active_objects_around(
            Point3::new(0.0, 0.0, 0.0),
            100.0,
            0.0,
            &current,
            &mut more,
        );
        assert_eq!(more.len(), 5);
        assert!(more.iter().all(|id| !current.contains(id)));
    }

    #[test]
    fn distant_players_use_the_player_radius() {
        let mut mgr = ActiveObjectMgr::new();
        mgr.register_object(TestObject::player_at(Point3::new(50.0, 0.0, 0.0)));
        mgr.register_object(TestObject::at(Point3::new(50.0, 0.0, 0.0)));

        let mut added = Vec::new();
        // Mob radius excludes both by distance, but the player radius is
        // wider and zero player radius means unlimited.
        mgr.get_added_active_objects_around(
            Point3::new(0.0, 0.0, 0.0),
            10.0,
            100.0,
            &HashSet::new(),
            &mut added,
        );
        assert_eq!(added.len(), 1);
        let obj = mgr.get(added[0]).unwrap();
        assert_eq!(obj.get().object_type(), ObjectType::Player);
    }
}
