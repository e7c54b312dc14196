//! Server-simulated world objects and their motion rules

use log::debug;
use sync_shared::{ObjectId, SyncedObjectData, Vec2, WORLD_HEIGHT, WORLD_WIDTH};
use std::collections::BTreeMap;

/// Horizontal platform bouncing between `MotionBounds::patrol_x`
pub const PATROL_PLATFORM: u32 = 0;
/// Object that drifts off the playfield and reappears at `MotionBounds::respawn`
pub const WRAPPING_FALLER: u32 = 1;
/// Vertical platform bouncing between `MotionBounds::patrol_y`
pub const VERTICAL_PATROL: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncedObject {
    pub object_id: ObjectId,
    /// Selects the motion rule, never changes after creation
    pub type_id: u32,
    pub position: Vec2,
    pub size: Vec2,
    pub velocity: Vec2,
    pub server_controlled: bool,
}

impl SyncedObject {
    pub fn new(object_id: ObjectId, type_id: u32, position: Vec2, size: Vec2, velocity: Vec2) -> Self {
        Self {
            object_id,
            type_id,
            position,
            size,
            velocity,
            server_controlled: true,
        }
    }

    pub fn data(&self) -> SyncedObjectData {
        SyncedObjectData {
            id: self.object_id,
            type_id: self.type_id,
            position: self.position,
        }
    }
}

/// Limits the motion rules bounce and wrap against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionBounds {
    pub playfield: Vec2,
    /// Left and right limits for the leading/trailing edge of patrol platforms
    pub patrol_x: (f32, f32),
    /// Top and bottom limits for vertical patrols
    pub patrol_y: (f32, f32),
    pub respawn: Vec2,
}

impl Default for MotionBounds {
    fn default() -> Self {
        Self {
            playfield: Vec2::new(WORLD_WIDTH, WORLD_HEIGHT),
            patrol_x: (1000.0, 1500.0),
            patrol_y: (100.0, 1000.0),
            respawn: Vec2::new(WORLD_WIDTH - 128.0, 0.0),
        }
    }
}

/// Authoritative store of every synced object
///
/// Objects are created once at startup and only ever repositioned.
#[derive(Debug, Clone)]
pub struct SyncedObjectStore {
    objects: BTreeMap<ObjectId, SyncedObject>,
    bounds: MotionBounds,
}

impl SyncedObjectStore {
    pub fn new(bounds: MotionBounds) -> Self {
        Self {
            objects: BTreeMap::new(),
            bounds,
        }
    }

    /// The starting layout: one patrol platform, one faller, one lift
    pub fn with_default_objects() -> Self {
        let mut store = Self::new(MotionBounds::default());
        let respawn = store.bounds.respawn;

        store.insert(SyncedObject::new(
            0,
            PATROL_PLATFORM,
            Vec2::new(1100.0, 700.0),
            Vec2::new(200.0, 32.0),
            Vec2::new(150.0, 0.0),
        ));
        store.insert(SyncedObject::new(
            1,
            WRAPPING_FALLER,
            respawn,
            Vec2::new(128.0, 128.0),
            Vec2::new(-400.0, 180.0),
        ));
        store.insert(SyncedObject::new(
            2,
            VERTICAL_PATROL,
            Vec2::new(100.0, 300.0),
            Vec2::new(200.0, 32.0),
            Vec2::new(0.0, 150.0),
        ));

        store
    }

    /// Adds an object. Ids are unique, so a duplicate is refused.
    pub fn insert(&mut self, object: SyncedObject) -> bool {
        if self.objects.contains_key(&object.object_id) {
            return false;
        }
        self.objects.insert(object.object_id, object);
        true
    }

    /// Advances every server-controlled object by one step of `dt` seconds
    pub fn advance(&mut self, dt: f32) {
        let bounds = self.bounds;
        for object in self.objects.values_mut() {
            if object.server_controlled {
                step_object(object, &bounds, dt);
            }
        }
    }

    pub fn snapshot_data(&self) -> Vec<SyncedObjectData> {
        self.objects.values().map(SyncedObject::data).collect()
    }

    pub fn get(&self, object_id: ObjectId) -> Option<&SyncedObject> {
        self.objects.get(&object_id)
    }

    pub fn get_mut(&mut self, object_id: ObjectId) -> Option<&mut SyncedObject> {
        self.objects.get_mut(&object_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn step_object(object: &mut SyncedObject, bounds: &MotionBounds, dt: f32) {
    let pos = &mut object.position;
    let vel = &mut object.velocity;

    match object.type_id {
        PATROL_PLATFORM => {
            pos.x += vel.x * dt;
            let (min_x, max_x) = bounds.patrol_x;
            if (pos.x <= min_x && vel.x < 0.0) || (pos.x + object.size.x >= max_x && vel.x > 0.0) {
                vel.x = -vel.x;
            }
        }
        WRAPPING_FALLER => {
            pos.x += vel.x * dt;
            pos.y += vel.y * dt;
            if pos.x + object.size.x < 0.0 || pos.y > bounds.playfield.y {
                *pos = bounds.respawn;
                debug!("Object {} wrapped to spawn", object.object_id);
            }
        }
        VERTICAL_PATROL => {
            pos.y += vel.y * dt;
            let (min_y, max_y) = bounds.patrol_y;
            if (pos.y <= min_y && vel.y < 0.0) || (pos.y + object.size.y >= max_y && vel.y > 0.0) {
                vel.y = -vel.y;
            }
        }
        // Unknown types hold still
        _ => {}
    }
}
