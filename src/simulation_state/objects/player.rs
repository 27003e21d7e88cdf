//! A minimal player avatar for the headless server: it has no input source,
//! so it wanders a slow circle around its spawn point, which keeps a moving
//! active-block window alive for the simulation to chew on.

use cgmath::Point3;

use super::{ActiveObject, ObjectId, ObjectType};

/// Radius of the wander circle, nodes.
const WANDER_RADIUS: f32 = 24.0;
/// Angular speed of the wander, radians per second.
const WANDER_SPEED: f32 = 0.05;

/// A wandering player object.
pub struct PlayerObject {
    id: ObjectId,
    center: Point3<f32>,
    angle: f32,
    gone: bool,
}

impl PlayerObject {
    /// A player circling around `spawn`.
    pub fn new(spawn: Point3<f32>) -> Self {
        Self {
            id: 0,
            center: spawn,
            angle: 0.0,
            gone: false,
        }
    }
}

impl ActiveObject for PlayerObject {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Player
    }

    fn base_position(&self) -> Point3<f32> {
        Point3::new(
            self.center.x + self.angle.cos() * WANDER_RADIUS,
            self.center.y,
            self.center.z + self.angle.sin() * WANDER_RADIUS,
        )
    }

    fn is_gone(&self) -> bool {
        self.gone
    }

    fn mark_for_removal(&mut self) {
        self.gone = true;
    }

    fn step(&mut self, dtime: f32) {
        self.angle = (self.angle + WANDER_SPEED * dtime) % std::f32::consts::TAU;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wanders_on_a_circle_around_spawn() {
        let mut player = PlayerObject::new(Point3::new(10.0, 5.0, -10.0));
        let start = player.base_position();
        for _ in 0..100 {
            player.step(0.5);
        }
        let end = player.base_position();
        assert_ne!(start, end);

        let d = end - Point3::new(10.0, 5.0, -10.0);
        let dist = (d.x * d.x + d.z * d.z).sqrt();
        assert!((dist - WANDER_RADIUS).abs() < 0.01);
        assert_eq!(end.y, 5.0);
    }
}
