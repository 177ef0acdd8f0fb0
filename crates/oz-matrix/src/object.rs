// object.rs: Entities owned by the world: objects, structures and particles.
//
// Objects are a closed set of kinds (static or dynamic) dispatched by match.
// New object types are added by registering an `ObjectClass`, not by
// subtyping.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use oz_common::bsp::Bsp;
use oz_common::error::{OzError, OzResult};
use oz_common::math::{vector_ma, Aabb, Bounds, Rotation, Vec3, VEC3_ORIGIN};
use oz_common::stream::{InputStream, OutputStream};

use crate::matrix::TICK_TIME;
use crate::world::CellRef;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u32 {
        /// Has a `Dynamic` part and takes part in physics.
        const DYNAMIC   = 0x8000_0000;
        /// Kept in the table but not positioned in any cell.
        const CUT       = 0x0002_0000;
        /// Life dropped to zero; removed on the next tick.
        const DESTROYED = 0x0001_0000;
        /// At rest on a still surface; physics skipped until woken.
        const DISABLED  = 0x0000_8000;
        const HIT       = 0x0000_4000;
        const FRICTING  = 0x0000_2000;
        /// Another dynamic object rests on this one.
        const UPPER     = 0x0000_1000;
        /// On terrain, a structure or a static object.
        const ON_FLOOR  = 0x0000_0800;
        const ON_SLICK  = 0x0000_0400;
        const IN_WATER  = 0x0000_0200;
        const ON_LADDER = 0x0000_0100;
        /// Solid: other movers collide with it.
        const CLIP      = 0x0000_0080;
        /// Affected by ladder brushes.
        const CLIMBER   = 0x0000_0040;
        /// Pushes other objects sideways instead of sharing momentum.
        const PUSHER    = 0x0000_0020;
        /// Immune to gravity.
        const HOVER     = 0x0000_0010;

        const TICK_CLEAR_MASK = Self::HIT.bits() | Self::FRICTING.bits() | Self::UPPER.bits();
    }
}

// ============================================================
// Events
// ============================================================

pub const MOMENTUM_INTENSITY_COEF: f32 = -0.1;
pub const DAMAGE_INTENSITY_COEF: f32 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventId {
    Create = 0,
    Destroy = 1,
    Damage = 2,
    Hit = 3,
    Splash = 4,
    Fricting = 5,
    Use = 6,
}

impl EventId {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => EventId::Create,
            1 => EventId::Destroy,
            2 => EventId::Damage,
            3 => EventId::Hit,
            4 => EventId::Splash,
            5 => EventId::Fricting,
            6 => EventId::Use,
            _ => return None,
        })
    }
}

/// Something observers (audio, effects) may react to this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub intensity: f32,
}

fn write_events(os: &mut OutputStream, events: &[Event]) {
    os.write_count(events.len());
    for e in events {
        os.write_i32(e.id as i32);
        os.write_f32(e.intensity);
    }
}

fn read_events(is: &mut InputStream) -> OzResult<Vec<Event>> {
    let n = is.read_count()?;
    let mut events = Vec::with_capacity(n.min(64));
    for _ in 0..n {
        let raw = is.read_i32()?;
        let id = EventId::from_i32(raw)
            .ok_or_else(|| OzError::bad_asset("save", format!("unknown event id {}", raw)))?;
        events.push(Event {
            id,
            intensity: is.read_f32()?,
        });
    }
    Ok(events)
}

// ============================================================
// Object
// ============================================================

/// Physics state of a movable object.
#[derive(Debug, Clone, PartialEq)]
pub struct Dynamic {
    /// Displacement over the last tick divided by the tick time.
    pub velocity: Vec3,
    /// Velocity the integrator will try to apply next tick.
    pub momentum: Vec3,
    pub mass: f32,
    /// Buoyancy per unit of submersion.
    pub lift: f32,
    /// Dynamic object this one rests on.
    pub lower: Option<usize>,
    /// Normal of the floor while ON_FLOOR.
    pub floor: Vec3,
    /// Water depth at the bottom of the object.
    pub depth: f32,
}

impl Dynamic {
    pub fn new(mass: f32, lift: f32) -> Self {
        Self {
            velocity: VEC3_ORIGIN,
            momentum: VEC3_ORIGIN,
            mass,
            lift,
            lower: None,
            floor: [0.0, 0.0, 1.0],
            depth: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Static,
    Dynamic(Dynamic),
}

#[derive(Debug, Clone)]
pub struct Object {
    pub index: Option<usize>,
    pub class: String,
    pub aabb: Aabb,
    pub flags: ObjectFlags,
    pub old_flags: ObjectFlags,
    pub life: f32,
    pub damage_threshold: f32,
    pub cell: Option<CellRef>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub events: Vec<Event>,
    pub kind: ObjectKind,
}

impl Object {
    pub fn new_static(class: &str, aabb: Aabb, flags: ObjectFlags, life: f32) -> Self {
        Self {
            index: None,
            class: class.to_string(),
            aabb,
            flags: flags - ObjectFlags::DYNAMIC,
            old_flags: ObjectFlags::empty(),
            life,
            damage_threshold: 0.0,
            cell: None,
            prev: None,
            next: None,
            events: Vec::new(),
            kind: ObjectKind::Static,
        }
    }

    pub fn new_dynamic(class: &str, aabb: Aabb, flags: ObjectFlags, life: f32, mass: f32) -> Self {
        let mut obj = Self::new_static(class, aabb, flags, life);
        obj.flags |= ObjectFlags::DYNAMIC;
        obj.kind = ObjectKind::Dynamic(Dynamic::new(mass, 0.0));
        obj
    }

    #[inline]
    pub fn p(&self) -> &Vec3 {
        &self.aabb.p
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, ObjectKind::Dynamic(_))
    }

    pub fn dynamic(&self) -> Option<&Dynamic> {
        match &self.kind {
            ObjectKind::Dynamic(d) => Some(d),
            ObjectKind::Static => None,
        }
    }

    pub fn dynamic_mut(&mut self) -> Option<&mut Dynamic> {
        match &mut self.kind {
            ObjectKind::Dynamic(d) => Some(d),
            ObjectKind::Static => None,
        }
    }

    /// Static objects never move.
    pub fn velocity(&self) -> Vec3 {
        match &self.kind {
            ObjectKind::Dynamic(d) => d.velocity,
            ObjectKind::Static => VEC3_ORIGIN,
        }
    }

    pub fn add_event(&mut self, id: EventId, intensity: f32) {
        self.events.push(Event { id, intensity });
    }

    pub fn damage(&mut self, amount: f32) {
        let amount = amount - self.damage_threshold;
        if amount > 0.0 {
            self.life -= amount;
            self.add_event(EventId::Damage, amount * DAMAGE_INTENSITY_COEF);
        }
    }

    /// Tags the object; the world removes it one tick later.
    pub fn destroy(&mut self) {
        if !self.flags.contains(ObjectFlags::DESTROYED) {
            self.life = 0.0;
            self.flags |= ObjectFlags::DESTROYED;
            self.add_event(EventId::Destroy, 1.0);
        }
    }

    /// Called when the object collides; `momentum` is the (negative) momentum
    /// along the hit normal.
    pub fn hit(&mut self, momentum: f32) {
        self.flags |= ObjectFlags::HIT;
        self.add_event(EventId::Hit, momentum * MOMENTUM_INTENSITY_COEF);
        self.damage(momentum * momentum);
    }

    pub fn splash(&mut self, momentum: f32) {
        self.add_event(EventId::Splash, momentum * MOMENTUM_INTENSITY_COEF);
    }

    pub fn use_by(&mut self, class: Option<&ObjectClass>) {
        self.add_event(EventId::Use, 1.0);
        if let Some(on_use) = class.and_then(|c| c.on_use) {
            on_use(self);
        }
    }

    pub fn update(&mut self, class: Option<&ObjectClass>) {
        if let Some(on_update) = class.and_then(|c| c.on_update) {
            on_update(self);
        }
        self.old_flags = self.flags;
    }

    // ============================================================
    // Persistence
    // ============================================================

    pub fn write_full(&self, os: &mut OutputStream) {
        os.write_bool(self.is_dynamic());
        os.write_string(&self.class);
        os.write_vec3(&self.aabb.p);
        os.write_vec3(&self.aabb.dim);
        os.write_u32(self.flags.bits());
        os.write_u32(self.old_flags.bits());
        os.write_f32(self.life);
        os.write_f32(self.damage_threshold);
        write_events(os, &self.events);

        if let ObjectKind::Dynamic(d) = &self.kind {
            os.write_vec3(&d.velocity);
            os.write_vec3(&d.momentum);
            os.write_f32(d.mass);
            os.write_f32(d.lift);
            os.write_index(d.lower);
            os.write_vec3(&d.floor);
            os.write_f32(d.depth);
        }
    }

    pub fn read_full(is: &mut InputStream) -> OzResult<Self> {
        let dynamic = is.read_bool()?;
        let class = is.read_string()?;
        let p = is.read_vec3()?;
        let dim = is.read_vec3()?;
        let flags = ObjectFlags::from_bits_retain(is.read_u32()?);
        let old_flags = ObjectFlags::from_bits_retain(is.read_u32()?);
        let life = is.read_f32()?;
        let damage_threshold = is.read_f32()?;
        let events = read_events(is)?;

        let kind = if dynamic {
            ObjectKind::Dynamic(Dynamic {
                velocity: is.read_vec3()?,
                momentum: is.read_vec3()?,
                mass: is.read_f32()?,
                lift: is.read_f32()?,
                lower: is.read_index()?,
                floor: is.read_vec3()?,
                depth: is.read_f32()?,
            })
        } else {
            ObjectKind::Static
        };

        Ok(Self {
            index: None,
            class,
            aabb: Aabb { p, dim },
            flags,
            old_flags,
            life,
            damage_threshold,
            cell: None,
            prev: None,
            next: None,
            events,
            kind,
        })
    }

    /// Position, velocity and events only.
    pub fn write_update(&self, os: &mut OutputStream) {
        os.write_vec3(&self.aabb.p);
        os.write_vec3(&self.velocity());
        write_events(os, &self.events);
    }

    /// Returns the new position; the caller repositions the object.
    pub fn read_update(&mut self, is: &mut InputStream) -> OzResult<Vec3> {
        let p = is.read_vec3()?;
        let velocity = is.read_vec3()?;
        self.events = read_events(is)?;
        if let Some(d) = self.dynamic_mut() {
            d.velocity = velocity;
        }
        Ok(p)
    }
}

// ============================================================
// Object classes
// ============================================================

pub type ObjectHook = fn(&mut Object);

/// Template objects are created from.
#[derive(Debug, Clone)]
pub struct ObjectClass {
    pub name: String,
    pub dim: Vec3,
    pub flags: ObjectFlags,
    pub life: f32,
    pub damage_threshold: f32,
    /// Zero for static objects.
    pub mass: f32,
    pub lift: f32,
    pub on_update: Option<ObjectHook>,
    pub on_use: Option<ObjectHook>,
}

impl ObjectClass {
    pub fn create(&self, p: Vec3) -> Object {
        let aabb = Aabb::new(p, self.dim);
        let mut obj = if self.flags.contains(ObjectFlags::DYNAMIC) {
            let mut obj = Object::new_dynamic(&self.name, aabb, self.flags, self.life, self.mass);
            if let Some(d) = obj.dynamic_mut() {
                d.lift = self.lift;
            }
            obj
        } else {
            Object::new_static(&self.name, aabb, self.flags, self.life)
        };
        obj.damage_threshold = self.damage_threshold;
        obj.add_event(EventId::Create, 1.0);
        obj
    }
}

/// Registered-constructor table keyed by class name.
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ObjectClass>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A few stock classes used by the headless runner and tests.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        let dynamic = ObjectFlags::DYNAMIC | ObjectFlags::CLIP;
        reg.register(ObjectClass {
            name: "crate".into(),
            dim: [0.5, 0.5, 0.5],
            flags: dynamic,
            life: 100.0,
            damage_threshold: 4.0,
            mass: 50.0,
            lift: 15.0,
            on_update: None,
            on_use: None,
        });
        reg.register(ObjectClass {
            name: "barrel".into(),
            dim: [0.4, 0.4, 0.6],
            flags: dynamic,
            life: 60.0,
            damage_threshold: 2.0,
            mass: 80.0,
            lift: 20.0,
            on_update: None,
            on_use: None,
        });
        reg.register(ObjectClass {
            name: "climber".into(),
            dim: [0.3, 0.3, 0.9],
            flags: dynamic | ObjectFlags::CLIMBER | ObjectFlags::PUSHER,
            life: 100.0,
            damage_threshold: 6.0,
            mass: 70.0,
            lift: 14.0,
            on_update: None,
            on_use: None,
        });
        reg.register(ObjectClass {
            name: "rock".into(),
            dim: [1.0, 1.0, 1.0],
            flags: ObjectFlags::CLIP,
            life: 1000.0,
            damage_threshold: 50.0,
            mass: 0.0,
            lift: 0.0,
            on_update: None,
            on_use: None,
        });
        reg
    }

    pub fn register(&mut self, class: ObjectClass) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn get(&self, name: &str) -> Option<&ObjectClass> {
        self.classes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str, p: Vec3) -> Option<Object> {
        self.get(name).map(|c| c.create(p))
    }
}

// ============================================================
// Structure
// ============================================================

/// A placed, immovable instance of a BSP model.
#[derive(Debug, Clone)]
pub struct Structure {
    pub index: Option<usize>,
    /// Index into the world's model table.
    pub bsp_id: usize,
    pub bsp: Arc<Bsp>,
    pub p: Vec3,
    pub rotation: Rotation,
    pub life: f32,
    /// Damage below this is ignored.
    pub resistance: f32,
    /// World-space bounds, fixed at placement.
    pub bounds: Bounds,
}

impl Structure {
    pub fn new(bsp_id: usize, bsp: Arc<Bsp>, p: Vec3, rotation: Rotation) -> Self {
        let bounds = rotation.rotate_bounds(&bsp.mins, &bsp.maxs, &p);
        Self {
            index: None,
            bsp_id,
            life: bsp.life,
            resistance: bsp.resistance,
            bsp,
            p,
            rotation,
            bounds,
        }
    }

    pub fn damage(&mut self, amount: f32) {
        let amount = amount - self.resistance;
        if amount > 0.0 {
            self.life -= amount;
        }
    }

    pub fn write_full(&self, os: &mut OutputStream) {
        os.write_count(self.bsp_id);
        os.write_vec3(&self.p);
        os.write_i32(self.rotation as i32);
        os.write_f32(self.life);
        os.write_f32(self.resistance);
    }

    pub fn read_full(is: &mut InputStream, bsps: &[Arc<Bsp>]) -> OzResult<Self> {
        let bsp_id = is.read_count()?;
        let bsp = bsps
            .get(bsp_id)
            .cloned()
            .ok_or_else(|| OzError::bad_asset("save", format!("unknown bsp {}", bsp_id)))?;
        let p = is.read_vec3()?;
        let raw = is.read_i32()?;
        let rotation = Rotation::from_i32(raw)
            .ok_or_else(|| OzError::bad_asset("save", format!("bad rotation {}", raw)))?;
        let mut s = Structure::new(bsp_id, bsp, p, rotation);
        s.life = is.read_f32()?;
        s.resistance = is.read_f32()?;
        Ok(s)
    }

    pub fn write_update(&self, os: &mut OutputStream) {
        os.write_f32(self.life);
    }

    pub fn read_update(&mut self, is: &mut InputStream) -> OzResult<()> {
        self.life = is.read_f32()?;
        Ok(())
    }
}

// ============================================================
// Particle
// ============================================================

/// A point mass swept against terrain and structures only.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub index: Option<usize>,
    pub p: Vec3,
    pub velocity: Vec3,
    /// Fraction of the normal velocity removed by a bounce, 1 = no bounce, 2 = elastic.
    pub rejection: f32,
    pub mass: f32,
    /// Seconds left.
    pub lifetime: f32,
    pub rot: Vec3,
    pub rot_velocity: Vec3,
    pub colour: Vec3,
    pub cell: Option<CellRef>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl Particle {
    pub fn new(p: Vec3, velocity: Vec3, rejection: f32, mass: f32, lifetime: f32) -> Self {
        Self {
            index: None,
            p,
            velocity,
            rejection,
            mass,
            lifetime,
            rot: VEC3_ORIGIN,
            rot_velocity: VEC3_ORIGIN,
            colour: [1.0, 1.0, 1.0],
            cell: None,
            prev: None,
            next: None,
        }
    }

    pub fn update(&mut self) {
        self.rot = vector_ma(&self.rot, TICK_TIME, &self.rot_velocity);
        self.lifetime -= TICK_TIME;
    }

    pub fn write_full(&self, os: &mut OutputStream) {
        os.write_vec3(&self.p);
        os.write_vec3(&self.velocity);
        os.write_f32(self.rejection);
        os.write_f32(self.mass);
        os.write_f32(self.lifetime);
        os.write_vec3(&self.rot);
        os.write_vec3(&self.rot_velocity);
        os.write_vec3(&self.colour);
    }

    pub fn read_full(is: &mut InputStream) -> OzResult<Self> {
        let mut part = Particle::new(
            is.read_vec3()?,
            is.read_vec3()?,
            is.read_f32()?,
            is.read_f32()?,
            is.read_f32()?,
        );
        part.rot = is.read_vec3()?;
        part.rot_velocity = is.read_vec3()?;
        part.colour = is.read_vec3()?;
        Ok(part)
    }

    pub fn write_update(&self, os: &mut OutputStream) {
        os.write_vec3(&self.p);
        os.write_vec3(&self.velocity);
    }

    /// Returns the new position; the caller repositions the particle.
    pub fn read_update(&mut self, is: &mut InputStream) -> OzResult<Vec3> {
        let p = is.read_vec3()?;
        self.velocity = is.read_vec3()?;
        Ok(p)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use oz_common::bsp::Material;

    fn crate_obj() -> Object {
        ClassRegistry::with_defaults().create("crate", [1.0, 2.0, 3.0]).unwrap()
    }

    #[test]
    fn test_registry_creates_kinds() {
        let reg = ClassRegistry::with_defaults();
        let c = reg.create("crate", [0.0; 3]).unwrap();
        assert!(c.is_dynamic());
        assert!(c.flags.contains(ObjectFlags::DYNAMIC | ObjectFlags::CLIP));
        assert_eq!(c.events, vec![Event { id: EventId::Create, intensity: 1.0 }]);

        let r = reg.create("rock", [0.0; 3]).unwrap();
        assert!(!r.is_dynamic());
        assert!(!r.flags.contains(ObjectFlags::DYNAMIC));
        assert_eq!(r.velocity(), VEC3_ORIGIN);

        assert!(reg.create("unicorn", [0.0; 3]).is_none());
    }

    #[test]
    fn test_damage_respects_threshold() {
        let mut obj = crate_obj();
        obj.events.clear();
        obj.damage(3.0);
        assert_eq!(obj.life, 100.0, "below threshold");
        assert!(obj.events.is_empty());
        obj.damage(14.0);
        assert_eq!(obj.life, 90.0);
        assert_eq!(obj.events[0].id, EventId::Damage);
        assert_relative_eq!(obj.events[0].intensity, 10.0 * DAMAGE_INTENSITY_COEF);
    }

    #[test]
    fn test_destroy_once() {
        let mut obj = crate_obj();
        obj.events.clear();
        obj.destroy();
        obj.destroy();
        assert!(obj.flags.contains(ObjectFlags::DESTROYED));
        assert_eq!(obj.life, 0.0);
        assert_eq!(obj.events.len(), 1);
    }

    #[test]
    fn test_hit_sets_flag_and_damages() {
        let mut obj = crate_obj();
        obj.events.clear();
        obj.hit(-5.0);
        assert!(obj.flags.contains(ObjectFlags::HIT));
        assert_eq!(obj.events[0].id, EventId::Hit);
        assert_relative_eq!(obj.events[0].intensity, 0.5);
        assert_relative_eq!(obj.life, 100.0 - (25.0 - 4.0));
    }

    #[test]
    fn test_update_hook_and_old_flags() {
        fn spin(obj: &mut Object) {
            obj.life += 1.0;
        }
        let mut class = ClassRegistry::with_defaults().get("crate").unwrap().clone();
        class.on_update = Some(spin);
        let mut obj = class.create([0.0; 3]);
        obj.flags |= ObjectFlags::ON_FLOOR;
        obj.update(Some(&class));
        assert_eq!(obj.life, 101.0);
        assert!(obj.old_flags.contains(ObjectFlags::ON_FLOOR));
    }

    // ============================================================
    // Persistence
    // ============================================================

    #[test]
    fn test_dynamic_full_state_survives() {
        let mut obj = crate_obj();
        obj.flags |= ObjectFlags::ON_FLOOR;
        obj.life = 42.0;
        if let Some(d) = obj.dynamic_mut() {
            d.velocity = [1.0, 0.0, -2.0];
            d.lower = Some(7);
        }
        let mut os = OutputStream::new();
        obj.write_full(&mut os);
        let bytes = os.into_inner();
        let back = Object::read_full(&mut InputStream::new(&bytes, "save")).unwrap();

        assert_eq!(back.aabb, obj.aabb);
        assert_eq!(back.flags, obj.flags);
        assert_eq!(back.life, 42.0);
        assert_eq!(back.kind, obj.kind);
        assert_eq!(back.class, "crate");
    }

    #[test]
    fn test_update_stream_carries_position_and_velocity() {
        let mut obj = crate_obj();
        obj.aabb.p = [5.0, 5.0, 5.0];
        if let Some(d) = obj.dynamic_mut() {
            d.velocity = [0.0, 3.0, 0.0];
        }
        let mut os = OutputStream::new();
        obj.write_update(&mut os);
        let bytes = os.into_inner();

        let mut other = crate_obj();
        let p = other.read_update(&mut InputStream::new(&bytes, "update")).unwrap();
        assert_eq!(p, [5.0, 5.0, 5.0]);
        assert_eq!(other.velocity(), [0.0, 3.0, 0.0]);
        assert_eq!(other.events, obj.events);
    }

    #[test]
    fn test_structure_bounds_and_state() {
        let bsp = Arc::new(
            Bsp::single_brush([0.0; 3], [4.0, 1.0, 2.0], Material::STRUCT).with_resistance(5.0),
        );
        let mut s = Structure::new(0, bsp.clone(), [10.0, 0.0, 0.0], Rotation::R90);
        assert_eq!(s.bounds.mins, [9.0, 0.0, 0.0]);
        assert_eq!(s.bounds.maxs, [10.0, 4.0, 2.0]);
        assert_eq!(s.resistance, 5.0);
        s.damage(3.0);
        assert_eq!(s.life, 100.0);
        s.damage(25.0);
        assert_eq!(s.life, 80.0);

        let mut os = OutputStream::new();
        s.write_full(&mut os);
        let bytes = os.into_inner();
        let back = Structure::read_full(&mut InputStream::new(&bytes, "save"), &[bsp]).unwrap();
        assert_eq!(back.bounds, s.bounds);
        assert_eq!(back.life, 80.0);
        assert_eq!(back.resistance, 5.0);
        assert_eq!(back.rotation, Rotation::R90);
    }

    #[test]
    fn test_structure_unknown_model_fails() {
        let bsp = Arc::new(Bsp::single_brush([0.0; 3], [1.0; 3], Material::STRUCT));
        let s = Structure::new(3, bsp, [0.0; 3], Rotation::R0);
        let mut os = OutputStream::new();
        s.write_full(&mut os);
        let bytes = os.into_inner();
        assert!(Structure::read_full(&mut InputStream::new(&bytes, "save"), &[]).is_err());
    }

    #[test]
    fn test_particle_update_and_state() {
        let mut part = Particle::new([0.0; 3], [1.0, 0.0, 0.0], 1.5, 0.1, 1.0);
        part.rot_velocity = [60.0, 0.0, 0.0];
        part.update();
        assert_relative_eq!(part.rot[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(part.lifetime, 1.0 - TICK_TIME);

        let mut os = OutputStream::new();
        part.write_full(&mut os);
        let bytes = os.into_inner();
        let back = Particle::read_full(&mut InputStream::new(&bytes, "save")).unwrap();
        assert_eq!(back, part);
    }
}
