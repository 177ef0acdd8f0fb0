// world.rs: Uniform grid over a bounded cube, owning every entity by index.
//
// Cells hold structure index lists plus the heads of intrusive object and
// particle lists; the links themselves live in the entities as
// `Option<usize>`. Freed indices stay null for one full tick before reuse.

use std::path::Path;
use std::sync::Arc;

use log::{info, trace};

use oz_common::bsp::Bsp;
use oz_common::compression::{compress_save, decompress_save};
use oz_common::error::{OzError, OzResult};
use oz_common::math::{Bounds, Rotation, Vec3, EPSILON};
use oz_common::stream::{InputStream, OutputStream};
use oz_common::terra::Terra;

use crate::collider::MAX_DIM_XY;
use crate::object::{Object, ObjectFlags, Particle, Structure};

pub const CELL_SIZE: f32 = 16.0;
pub const MAX_CELLS: usize = 256;

pub const SAVE_MAGIC: &[u8; 7] = b"OZSAVE\x01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub x: usize,
    pub y: usize,
}

/// Inclusive rectangle of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub min_x: usize,
    pub min_y: usize,
    pub max_x: usize,
    pub max_y: usize,
}

impl Span {
    pub fn cells(self) -> impl Iterator<Item = CellRef> {
        (self.min_y..=self.max_y)
            .flat_map(move |y| (self.min_x..=self.max_x).map(move |x| CellRef { x, y }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub structures: Vec<usize>,
    pub first_object: Option<usize>,
    pub first_particle: Option<usize>,
}

// ============================================================
// Index pool
// ============================================================

/// Free-index bookkeeping for one entity table. Indices freed during a tick
/// go into `freed[freeing]`; at each tick boundary the other buffer (freed a
/// tick earlier) drains into `available` and the cursor flips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPool {
    available: Vec<usize>,
    freed: [Vec<usize>; 2],
    freeing: usize,
}

impl IndexPool {
    pub fn allocate(&mut self) -> Option<usize> {
        self.available.pop()
    }

    pub fn free(&mut self, index: usize) {
        self.freed[self.freeing].push(index);
    }

    pub fn rotate(&mut self) {
        let waiting = 1 - self.freeing;
        let ready = std::mem::take(&mut self.freed[waiting]);
        self.available.extend(ready);
        self.freeing = waiting;
    }

    pub fn is_reusable(&self, index: usize) -> bool {
        self.available.contains(&index)
    }

    fn write(&self, os: &mut OutputStream) {
        os.write_count(self.freeing);
        for list in [&self.available, &self.freed[0], &self.freed[1]] {
            os.write_count(list.len());
            for &i in list {
                os.write_count(i);
            }
        }
    }

    fn read(is: &mut InputStream, table_len: usize) -> OzResult<Self> {
        let freeing = is.read_count()?;
        if freeing > 1 {
            return Err(OzError::bad_asset("save", format!("bad freeing cursor {}", freeing)));
        }
        let mut lists: [Vec<usize>; 3] = Default::default();
        for list in &mut lists {
            let n = is.read_count()?;
            for _ in 0..n {
                let i = is.read_count()?;
                if i >= table_len {
                    return Err(OzError::bad_asset("save", format!("free index {} out of range", i)));
                }
                list.push(i);
            }
        }
        let [available, freed0, freed1] = lists;
        Ok(Self {
            available,
            freed: [freed0, freed1],
            freeing,
        })
    }
}

fn insert_slot<T>(table: &mut Vec<Option<T>>, pool: &mut IndexPool, value: T) -> usize {
    match pool.allocate() {
        Some(i) => {
            debug_assert!(table[i].is_none(), "reused slot {} is occupied", i);
            table[i] = Some(value);
            i
        }
        None => {
            table.push(Some(value));
            table.len() - 1
        }
    }
}

// ============================================================
// Cell links
// ============================================================

/// Entities kept in a cell's intrusive list.
trait Linked {
    fn links(&mut self) -> (&mut Option<CellRef>, &mut Option<usize>, &mut Option<usize>);
}

impl Linked for Object {
    fn links(&mut self) -> (&mut Option<CellRef>, &mut Option<usize>, &mut Option<usize>) {
        (&mut self.cell, &mut self.prev, &mut self.next)
    }
}

impl Linked for Particle {
    fn links(&mut self) -> (&mut Option<CellRef>, &mut Option<usize>, &mut Option<usize>) {
        (&mut self.cell, &mut self.prev, &mut self.next)
    }
}

fn link<T: Linked>(table: &mut [Option<T>], head: &mut Option<usize>, index: usize, cell: CellRef) {
    let old_head = head.replace(index);
    if let Some(h) = old_head.and_then(|h| table[h].as_mut()) {
        *h.links().1 = Some(index);
    }
    if let Some(e) = table[index].as_mut() {
        let (c, prev, next) = e.links();
        *c = Some(cell);
        *prev = None;
        *next = old_head;
    }
}

fn object_head(cell: &mut Cell) -> &mut Option<usize> {
    &mut cell.first_object
}

fn particle_head(cell: &mut Cell) -> &mut Option<usize> {
    &mut cell.first_particle
}

/// Returns the cell the entity was linked into, if any.
fn unlink<T: Linked>(
    table: &mut [Option<T>],
    cells: &mut [Cell],
    max: usize,
    head: fn(&mut Cell) -> &mut Option<usize>,
    index: usize,
) -> Option<CellRef> {
    let (cell, prev, next) = {
        let e = table[index].as_mut()?;
        let (c, p, n) = e.links();
        (c.take()?, p.take(), n.take())
    };
    match prev.and_then(|p| table[p].as_mut()) {
        Some(e) => *e.links().2 = next,
        None => *head(&mut cells[cell.y * max + cell.x]) = next,
    }
    if let Some(e) = next.and_then(|n| table[n].as_mut()) {
        *e.links().1 = prev;
    }
    Some(cell)
}

// ============================================================
// World
// ============================================================

pub struct World {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub cell_size: f32,
    /// Cells per side.
    pub max: usize,
    dim: f32,
    cells: Vec<Cell>,
    pub bsps: Vec<Arc<Bsp>>,
    pub terra: Terra,
    structures: Vec<Option<Structure>>,
    objects: Vec<Option<Object>>,
    particles: Vec<Option<Particle>>,
    str_pool: IndexPool,
    obj_pool: IndexPool,
    part_pool: IndexPool,
}

impl World {
    pub fn new(cell_size: f32, max: usize, terra: Terra) -> Self {
        debug_assert!(cell_size > 0.0 && max > 0);
        let dim = cell_size * max as f32 * 0.5;
        Self {
            mins: [-dim, -dim, -dim],
            maxs: [dim, dim, dim],
            cell_size,
            max,
            dim,
            cells: vec![Cell::default(); max * max],
            bsps: Vec::new(),
            terra,
            structures: Vec::new(),
            objects: Vec::new(),
            particles: Vec::new(),
            str_pool: IndexPool::default(),
            obj_pool: IndexPool::default(),
            part_pool: IndexPool::default(),
        }
    }

    pub fn dim(&self) -> f32 {
        self.dim
    }

    // ============================================================
    // Grid
    // ============================================================

    fn cell_coord(&self, v: f32) -> usize {
        let c = ((v + self.dim) / self.cell_size).floor();
        if c <= 0.0 {
            0
        } else {
            (c as usize).min(self.max - 1)
        }
    }

    /// Positions outside the world clamp to the nearest edge cell.
    pub fn cell_of(&self, p: &Vec3) -> CellRef {
        CellRef {
            x: self.cell_coord(p[0]),
            y: self.cell_coord(p[1]),
        }
    }

    pub fn cell_span(&self, bounds: &Bounds, eps: f32) -> Span {
        Span {
            min_x: self.cell_coord(bounds.mins[0] - eps),
            min_y: self.cell_coord(bounds.mins[1] - eps),
            max_x: self.cell_coord(bounds.maxs[0] + eps),
            max_y: self.cell_coord(bounds.maxs[1] + eps),
        }
    }

    #[inline]
    fn cell_index(&self, c: CellRef) -> usize {
        c.y * self.max + c.x
    }

    pub fn cell(&self, c: CellRef) -> &Cell {
        &self.cells[self.cell_index(c)]
    }

    pub fn cell_objects(&self, c: CellRef) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.cell(c).first_object, move |&i| {
            self.objects[i].as_ref().and_then(|o| o.next)
        })
    }

    pub fn cell_particles(&self, c: CellRef) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.cell(c).first_particle, move |&i| {
            self.particles[i].as_ref().and_then(|p| p.next)
        })
    }

    // ============================================================
    // Accessors
    // ============================================================

    pub fn structure(&self, i: usize) -> Option<&Structure> {
        self.structures.get(i).and_then(Option::as_ref)
    }

    pub fn structure_mut(&mut self, i: usize) -> Option<&mut Structure> {
        self.structures.get_mut(i).and_then(Option::as_mut)
    }

    pub fn object(&self, i: usize) -> Option<&Object> {
        self.objects.get(i).and_then(Option::as_ref)
    }

    pub fn object_mut(&mut self, i: usize) -> Option<&mut Object> {
        self.objects.get_mut(i).and_then(Option::as_mut)
    }

    /// Two distinct live objects at once.
    pub fn object_pair_mut(&mut self, a: usize, b: usize) -> Option<(&mut Object, &mut Object)> {
        if a == b || a >= self.objects.len() || b >= self.objects.len() {
            return None;
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let (left, right) = self.objects.split_at_mut(hi);
        let (lo_obj, hi_obj) = (left[lo].as_mut()?, right[0].as_mut()?);
        if a < b {
            Some((lo_obj, hi_obj))
        } else {
            Some((hi_obj, lo_obj))
        }
    }

    pub fn particle(&self, i: usize) -> Option<&Particle> {
        self.particles.get(i).and_then(Option::as_ref)
    }

    pub fn particle_mut(&mut self, i: usize) -> Option<&mut Particle> {
        self.particles.get_mut(i).and_then(Option::as_mut)
    }

    /// Table lengths including null slots.
    pub fn structure_slots(&self) -> usize {
        self.structures.len()
    }

    pub fn object_slots(&self) -> usize {
        self.objects.len()
    }

    pub fn particle_slots(&self) -> usize {
        self.particles.len()
    }

    pub fn structures(&self) -> impl Iterator<Item = (usize, &Structure)> {
        live(&self.structures)
    }

    pub fn objects(&self) -> impl Iterator<Item = (usize, &Object)> {
        live(&self.objects)
    }

    pub fn particles(&self) -> impl Iterator<Item = (usize, &Particle)> {
        live(&self.particles)
    }

    pub fn object_pool(&self) -> &IndexPool {
        &self.obj_pool
    }

    // ============================================================
    // Structures
    // ============================================================

    pub fn add_bsp(&mut self, bsp: Arc<Bsp>) -> usize {
        self.bsps.push(bsp);
        self.bsps.len() - 1
    }

    pub fn add_structure(&mut self, bsp_id: usize, p: Vec3, rotation: Rotation) -> usize {
        debug_assert!(bsp_id < self.bsps.len(), "unknown bsp {}", bsp_id);
        let s = Structure::new(bsp_id, self.bsps[bsp_id].clone(), p, rotation);
        self.insert_structure(s)
    }

    fn insert_structure(&mut self, s: Structure) -> usize {
        debug_assert!(s.index.is_none(), "structure already added");
        let i = insert_slot(&mut self.structures, &mut self.str_pool, s);
        if let Some(s) = self.structures[i].as_mut() {
            s.index = Some(i);
        }
        self.position_structure(i);
        trace!("added structure {}", i);
        i
    }

    fn position_structure(&mut self, i: usize) {
        let Some(bounds) = self.structure(i).map(|s| s.bounds) else {
            return;
        };
        for c in self.cell_span(&bounds, EPSILON).cells() {
            let k = self.cell_index(c);
            self.cells[k].structures.push(i);
        }
    }

    pub fn remove_structure(&mut self, i: usize) -> Option<Structure> {
        debug_assert!(self.structure(i).is_some(), "removing missing structure {}", i);
        let mut s = self.structures.get_mut(i)?.take()?;
        for c in self.cell_span(&s.bounds, EPSILON).cells() {
            let k = self.cell_index(c);
            self.cells[k].structures.retain(|&x| x != i);
        }
        self.str_pool.free(i);
        s.index = None;
        trace!("removed structure {}", i);
        Some(s)
    }

    // ============================================================
    // Objects
    // ============================================================

    pub fn add_object(&mut self, mut obj: Object) -> usize {
        debug_assert!(obj.index.is_none(), "object already added");
        debug_assert!(
            obj.aabb.dim[0] <= MAX_DIM_XY && obj.aabb.dim[1] <= MAX_DIM_XY,
            "object wider than the cell search margin"
        );
        obj.cell = None;
        let cut = obj.flags.contains(ObjectFlags::CUT);
        let i = insert_slot(&mut self.objects, &mut self.obj_pool, obj);
        if let Some(o) = self.objects[i].as_mut() {
            o.index = Some(i);
        }
        if !cut {
            self.position_object(i);
        }
        trace!("added object {}", i);
        i
    }

    fn position_object(&mut self, i: usize) {
        let Some(p) = self.object(i).map(|o| o.aabb.p) else {
            return;
        };
        let c = self.cell_of(&p);
        let k = self.cell_index(c);
        link(&mut self.objects, &mut self.cells[k].first_object, i, c);
    }

    fn unposition_object(&mut self, i: usize) -> Option<CellRef> {
        unlink(&mut self.objects, &mut self.cells, self.max, object_head, i)
    }

    pub fn remove_object(&mut self, i: usize) -> Option<Object> {
        debug_assert!(self.object(i).is_some(), "removing missing object {}", i);
        self.unposition_object(i);
        let mut obj = self.objects.get_mut(i)?.take()?;
        self.obj_pool.free(i);
        obj.index = None;
        trace!("removed object {}", i);
        Some(obj)
    }

    /// Moves the object to the cell of its current position if it changed.
    pub fn reposition_object(&mut self, i: usize) {
        let Some(obj) = self.object(i) else {
            return;
        };
        let Some(old) = obj.cell else {
            return;
        };
        if self.cell_of(&obj.aabb.p) != old {
            self.unposition_object(i);
            self.position_object(i);
        }
    }

    /// Takes the object out of the grid but keeps its slot.
    pub fn cut_object(&mut self, i: usize) {
        if let Some(obj) = self.object(i) {
            debug_assert!(!obj.flags.contains(ObjectFlags::CUT), "object {} already cut", i);
            self.unposition_object(i);
            if let Some(obj) = self.object_mut(i) {
                obj.flags |= ObjectFlags::CUT;
            }
        }
    }

    pub fn uncut_object(&mut self, i: usize) {
        if let Some(obj) = self.object_mut(i) {
            debug_assert!(obj.flags.contains(ObjectFlags::CUT), "object {} is not cut", i);
            obj.flags -= ObjectFlags::CUT;
            self.position_object(i);
        }
    }

    // ============================================================
    // Particles
    // ============================================================

    pub fn add_particle(&mut self, mut part: Particle) -> usize {
        debug_assert!(part.index.is_none(), "particle already added");
        part.cell = None;
        let i = insert_slot(&mut self.particles, &mut self.part_pool, part);
        if let Some(p) = self.particles[i].as_mut() {
            p.index = Some(i);
        }
        self.position_particle(i);
        i
    }

    fn position_particle(&mut self, i: usize) {
        let Some(p) = self.particle(i).map(|p| p.p) else {
            return;
        };
        let c = self.cell_of(&p);
        let k = self.cell_index(c);
        link(&mut self.particles, &mut self.cells[k].first_particle, i, c);
    }

    fn unposition_particle(&mut self, i: usize) -> Option<CellRef> {
        unlink(&mut self.particles, &mut self.cells, self.max, particle_head, i)
    }

    pub fn remove_particle(&mut self, i: usize) -> Option<Particle> {
        debug_assert!(self.particle(i).is_some(), "removing missing particle {}", i);
        self.unposition_particle(i);
        let mut part = self.particles.get_mut(i)?.take()?;
        self.part_pool.free(i);
        part.index = None;
        Some(part)
    }

    pub fn reposition_particle(&mut self, i: usize) {
        let Some(part) = self.particle(i) else {
            return;
        };
        let Some(old) = part.cell else {
            return;
        };
        if self.cell_of(&part.p) != old {
            self.unposition_particle(i);
            self.position_particle(i);
        }
    }

    /// Tick boundary: indices freed two ticks ago become reusable.
    pub fn update(&mut self) {
        self.str_pool.rotate();
        self.obj_pool.rotate();
        self.part_pool.rotate();
    }

    // ============================================================
    // Persistence
    // ============================================================

    pub fn write_full(&self, os: &mut OutputStream) {
        os.write_f32(self.cell_size);
        os.write_count(self.max);
        os.write_u32(self.terra.checksum as u32);
        os.write_count(self.bsps.len());
        for bsp in &self.bsps {
            os.write_u32(bsp.checksum as u32);
        }

        write_table(os, &self.structures, Structure::write_full);
        write_table(os, &self.objects, Object::write_full);
        write_table(os, &self.particles, Particle::write_full);

        self.str_pool.write(os);
        self.obj_pool.write(os);
        self.part_pool.write(os);
    }

    /// Rebuilds a world from `write_full` output. The terrain and models must
    /// be the ones the save was made with.
    pub fn read_full(is: &mut InputStream, terra: Terra, bsps: Vec<Arc<Bsp>>) -> OzResult<Self> {
        let cell_size = is.read_f32()?;
        let max = is.read_count()?;
        if !(cell_size > 0.0) || max == 0 {
            return Err(OzError::bad_asset("save", format!("bad grid {} x {}", max, cell_size)));
        }
        let terra_crc = is.read_u32()?;
        if terra_crc != terra.checksum as u32 {
            return Err(OzError::bad_asset("save", "terrain does not match the save"));
        }
        let num_bsps = is.read_count()?;
        if num_bsps != bsps.len() {
            return Err(OzError::SizeMismatch {
                what: "save models",
                expected: bsps.len(),
                found: num_bsps,
            });
        }
        for (i, bsp) in bsps.iter().enumerate() {
            if is.read_u32()? != bsp.checksum as u32 {
                return Err(OzError::bad_asset("save", format!("model {} does not match the save", i)));
            }
        }

        let mut world = World::new(cell_size, max, terra);
        world.bsps = bsps;

        world.structures = read_table(is, |is| Structure::read_full(is, &world.bsps))?;
        world.objects = read_table(is, Object::read_full)?;
        world.particles = read_table(is, Particle::read_full)?;

        world.str_pool = IndexPool::read(is, world.structures.len())?;
        world.obj_pool = IndexPool::read(is, world.objects.len())?;
        world.part_pool = IndexPool::read(is, world.particles.len())?;

        for i in 0..world.structures.len() {
            if let Some(s) = world.structures[i].as_mut() {
                s.index = Some(i);
                world.position_structure(i);
            }
        }
        for i in 0..world.objects.len() {
            if let Some(o) = world.objects[i].as_mut() {
                o.index = Some(i);
                if !o.flags.contains(ObjectFlags::CUT) {
                    world.position_object(i);
                }
            }
        }
        for i in 0..world.particles.len() {
            if let Some(p) = world.particles[i].as_mut() {
                p.index = Some(i);
                world.position_particle(i);
            }
        }
        Ok(world)
    }

    /// Incremental state of live entities only.
    pub fn write_update(&self, os: &mut OutputStream) {
        os.write_count(self.structures().count());
        for (i, s) in self.structures() {
            os.write_count(i);
            s.write_update(os);
        }
        os.write_count(self.objects().count());
        for (i, o) in self.objects() {
            os.write_count(i);
            o.write_update(os);
        }
        os.write_count(self.particles().count());
        for (i, p) in self.particles() {
            os.write_count(i);
            p.write_update(os);
        }
    }

    pub fn read_update(&mut self, is: &mut InputStream) -> OzResult<()> {
        let missing = |kind: &str, i: usize| OzError::bad_asset("update", format!("no {} at {}", kind, i));

        let n = is.read_count()?;
        for _ in 0..n {
            let i = is.read_count()?;
            self.structure_mut(i).ok_or_else(|| missing("structure", i))?.read_update(is)?;
        }
        let n = is.read_count()?;
        for _ in 0..n {
            let i = is.read_count()?;
            let obj = self.object_mut(i).ok_or_else(|| missing("object", i))?;
            obj.aabb.p = obj.read_update(is)?;
            self.reposition_object(i);
        }
        let n = is.read_count()?;
        for _ in 0..n {
            let i = is.read_count()?;
            let part = self.particle_mut(i).ok_or_else(|| missing("particle", i))?;
            part.p = part.read_update(is)?;
            self.reposition_particle(i);
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> OzResult<()> {
        let path = path.as_ref();
        let mut os = OutputStream::new();
        self.write_full(&mut os);
        let raw_len = os.len();
        let packed = compress_save(os.as_slice())?;

        let mut data = Vec::with_capacity(SAVE_MAGIC.len() + packed.len());
        data.extend_from_slice(SAVE_MAGIC);
        data.extend_from_slice(&packed);
        std::fs::write(path, &data)?;
        info!(
            "saved world to {} ({} bytes, {} packed)",
            path.display(),
            raw_len,
            data.len()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, terra: Terra, bsps: Vec<Arc<Bsp>>) -> OzResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mut header = InputStream::new(&data, "save");
        header.expect_magic(SAVE_MAGIC)?;
        let raw = decompress_save(&data[SAVE_MAGIC.len()..])?;
        let world = World::read_full(&mut InputStream::new(&raw, "save"), terra, bsps)?;
        info!(
            "loaded world {} ({} structures, {} objects, {} particles)",
            path.display(),
            world.structures().count(),
            world.objects().count(),
            world.particles().count()
        );
        Ok(world)
    }
}

fn live<T>(table: &[Option<T>]) -> impl Iterator<Item = (usize, &T)> {
    table.iter().enumerate().filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
}

fn write_table<T>(os: &mut OutputStream, table: &[Option<T>], write: fn(&T, &mut OutputStream)) {
    os.write_count(table.len());
    for slot in table {
        os.write_bool(slot.is_some());
        if let Some(e) = slot {
            write(e, os);
        }
    }
}

fn read_table<'a, T>(
    is: &mut InputStream<'a>,
    mut read: impl FnMut(&mut InputStream<'a>) -> OzResult<T>,
) -> OzResult<Vec<Option<T>>> {
    let n = is.read_count()?;
    let mut table = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        table.push(if is.read_bool()? { Some(read(is)?) } else { None });
    }
    Ok(table)
}

// ============================================================
// Tests
// ============================================================
