// bsp.rs: Static collision geometry: planes, BSP tree, leaves and brushes.
//
// A model is loaded once and shared read-only by every structure placed from
// it. Child links in the node array use negative values for leaves:
// `-(leaf + 1)`.

use std::path::Path;

use bitflags::bitflags;
use log::info;
use rayon::prelude::*;

use crate::crc::asset_checksum;
use crate::error::{OzError, OzResult};
use crate::math::{Bounds, Plane, Vec3};
use crate::stream::{read_f32_le, read_i32_le, read_vec3_le, InputStream, OutputStream};

pub const BSP_MAGIC: &[u8; 8] = b"OZBSP\0\0\x01";

/// Lumps with at least this many records are parsed on the rayon pool.
const PARALLEL_LUMP_THRESHOLD: usize = 64;

const PLANE_STRIDE: usize = 16;
const NODE_STRIDE: usize = 12;
const LEAF_STRIDE: usize = 12;
const BRUSH_STRIDE: usize = 12;
const VERTEX_STRIDE: usize = 12;

bitflags! {
    /// Surface and medium tags of brushes, terrain and objects.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Material: u32 {
        const TERRAIN = 0x0001;
        const STRUCT  = 0x0002;
        const SLICK   = 0x0004;
        const OBJECT  = 0x0008;
        const VOID    = 0x0080;
        const LADDER  = 0x0100;
        const AIR     = 0x0200;
        const WATER   = 0x0400;
    }
}

impl Material {
    /// Media are volumes the mover passes through.
    pub const MEDIUM: Material = Material::LADDER.union(Material::AIR).union(Material::WATER);

    pub fn is_solid(self) -> bool {
        !self.intersects(Material::MEDIUM) && !self.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BspNode {
    pub plane: usize,
    pub front: i32,
    pub back: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BspLeaf {
    pub cluster: i32,
    pub first_brush: usize,
    pub num_brushes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Brush {
    pub first_side: usize,
    pub num_sides: usize,
    pub material: Material,
}

/// Decoded child link of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BspChild {
    Node(usize),
    Leaf(usize),
}

impl BspChild {
    #[inline]
    pub fn from_raw(raw: i32) -> Self {
        if raw >= 0 {
            BspChild::Node(raw as usize)
        } else {
            BspChild::Leaf((-1 - raw) as usize)
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            BspChild::Node(n) => n as i32,
            BspChild::Leaf(l) => -1 - l as i32,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bsp {
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Initial life of structures placed from this model.
    pub life: f32,
    /// Damage absorbed from every hit before life is reduced.
    pub resistance: f32,
    pub planes: Vec<Plane>,
    pub nodes: Vec<BspNode>,
    pub leaves: Vec<BspLeaf>,
    pub leaf_brushes: Vec<u32>,
    pub brushes: Vec<Brush>,
    pub brush_sides: Vec<u32>,
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub checksum: u16,
}

fn parse_lump<T, F>(block: &[u8], count: usize, stride: usize, parse: F) -> Vec<T>
where
    T: Send,
    F: Fn(&[u8], usize) -> T + Sync + Send,
{
    if count >= PARALLEL_LUMP_THRESHOLD {
        (0..count)
            .into_par_iter()
            .map(|i| parse(block, i * stride))
            .collect()
    } else {
        (0..count).map(|i| parse(block, i * stride)).collect()
    }
}

impl Bsp {
    /// Entry point of the tree.
    pub fn root(&self) -> BspChild {
        if self.nodes.is_empty() {
            BspChild::Leaf(0)
        } else {
            BspChild::Node(0)
        }
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.mins, self.maxs)
    }

    pub fn leaf_brush_indices(&self, leaf: &BspLeaf) -> &[u32] {
        &self.leaf_brushes[leaf.first_brush..leaf.first_brush + leaf.num_brushes]
    }

    pub fn brush_planes<'a>(&'a self, brush: &Brush) -> impl Iterator<Item = &'a Plane> + 'a {
        self.brush_sides[brush.first_side..brush.first_side + brush.num_sides]
            .iter()
            .map(move |&p| &self.planes[p as usize])
    }

    // ============================================================
    // Loading
    // ============================================================

    pub fn load(path: impl AsRef<Path>) -> OzResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let bsp = Self::from_bytes(&data)?;
        info!(
            "loaded bsp {} ({} planes, {} nodes, {} leaves, {} brushes, crc {:04x})",
            path.display(),
            bsp.planes.len(),
            bsp.nodes.len(),
            bsp.leaves.len(),
            bsp.brushes.len(),
            bsp.checksum
        );
        Ok(bsp)
    }

    pub fn from_bytes(data: &[u8]) -> OzResult<Self> {
        let mut is = InputStream::new(data, "bsp");
        is.expect_magic(BSP_MAGIC)?;

        let mins = is.read_vec3()?;
        let maxs = is.read_vec3()?;
        let life = is.read_f32()?;
        let resistance = is.read_f32()?;

        let num_planes = is.read_count()?;
        let num_nodes = is.read_count()?;
        let num_leaves = is.read_count()?;
        let num_leaf_brushes = is.read_count()?;
        let num_brushes = is.read_count()?;
        let num_sides = is.read_count()?;
        let num_vertices = is.read_count()?;
        let num_indices = is.read_count()?;

        let block = is.read_block(num_planes, PLANE_STRIDE)?;
        let planes = parse_lump(block, num_planes, PLANE_STRIDE, |d, o| Plane {
            normal: read_vec3_le(d, o),
            dist: read_f32_le(d, o + 12),
        });

        let block = is.read_block(num_nodes, NODE_STRIDE)?;
        let raw_nodes = parse_lump(block, num_nodes, NODE_STRIDE, |d, o| {
            (read_i32_le(d, o), read_i32_le(d, o + 4), read_i32_le(d, o + 8))
        });

        let block = is.read_block(num_leaves, LEAF_STRIDE)?;
        let raw_leaves = parse_lump(block, num_leaves, LEAF_STRIDE, |d, o| {
            (read_i32_le(d, o), read_i32_le(d, o + 4), read_i32_le(d, o + 8))
        });

        let block = is.read_block(num_leaf_brushes, 4)?;
        let leaf_brushes = parse_lump(block, num_leaf_brushes, 4, read_i32_le);

        let block = is.read_block(num_brushes, BRUSH_STRIDE)?;
        let raw_brushes = parse_lump(block, num_brushes, BRUSH_STRIDE, |d, o| {
            (read_i32_le(d, o), read_i32_le(d, o + 4), read_i32_le(d, o + 8))
        });

        let block = is.read_block(num_sides, 4)?;
        let brush_sides = parse_lump(block, num_sides, 4, read_i32_le);

        let block = is.read_block(num_vertices, VERTEX_STRIDE)?;
        let vertices = parse_lump(block, num_vertices, VERTEX_STRIDE, read_vec3_le);

        let block = is.read_block(num_indices, 4)?;
        let indices = parse_lump(block, num_indices, 4, read_i32_le);

        let to_index = |v: i32, what: &str| -> OzResult<usize> {
            usize::try_from(v)
                .map_err(|_| OzError::bad_asset("bsp", format!("negative {} {}", what, v)))
        };

        let mut nodes = Vec::with_capacity(num_nodes);
        for (plane, front, back) in raw_nodes {
            nodes.push(BspNode {
                plane: to_index(plane, "node plane")?,
                front,
                back,
            });
        }
        let mut leaves = Vec::with_capacity(num_leaves);
        for (cluster, first, num) in raw_leaves {
            leaves.push(BspLeaf {
                cluster,
                first_brush: to_index(first, "leaf brush")?,
                num_brushes: to_index(num, "leaf brush count")?,
            });
        }
        let mut brushes = Vec::with_capacity(num_brushes);
        for (first, num, material) in raw_brushes {
            brushes.push(Brush {
                first_side: to_index(first, "brush side")?,
                num_sides: to_index(num, "brush side count")?,
                material: Material::from_bits_truncate(material as u32),
            });
        }

        let as_u32 = |v: Vec<i32>, what: &str| -> OzResult<Vec<u32>> {
            v.into_iter()
                .map(|i| u32::try_from(i).map_err(|_| OzError::bad_asset("bsp", format!("negative {} {}", what, i))))
                .collect()
        };

        let bsp = Bsp {
            mins,
            maxs,
            life,
            resistance,
            planes,
            nodes,
            leaves,
            leaf_brushes: as_u32(leaf_brushes, "leaf brush index")?,
            brushes,
            brush_sides: as_u32(brush_sides, "side plane index")?,
            vertices,
            indices: as_u32(indices, "vertex index")?,
            checksum: asset_checksum(data),
        };
        bsp.validate()?;
        Ok(bsp)
    }

    /// Checks ranges, unit normals, the tree shape and leaf reachability.
    pub fn validate(&self) -> OzResult<()> {
        let bad = |reason: String| Err(OzError::bad_asset("bsp", reason));

        if (0..3).any(|i| self.mins[i] > self.maxs[i]) {
            return bad(format!("malformed bounds {:?} .. {:?}", self.mins, self.maxs));
        }
        if self.resistance < 0.0 {
            return bad(format!("negative resistance {}", self.resistance));
        }
        if self.leaves.is_empty() {
            return bad("model has no leaves".into());
        }
        for (i, plane) in self.planes.iter().enumerate() {
            let len2 = plane.normal.iter().map(|c| c * c).sum::<f32>();
            if (len2.sqrt() - 1.0).abs() > 1e-3 {
                return bad(format!("plane {} normal is not unit length", i));
            }
        }
        for (i, leaf) in self.leaves.iter().enumerate() {
            if leaf.first_brush + leaf.num_brushes > self.leaf_brushes.len() {
                return bad(format!("leaf {} brush range out of bounds", i));
            }
        }
        if let Some(&b) = self.leaf_brushes.iter().find(|&&b| b as usize >= self.brushes.len()) {
            return bad(format!("leaf brush {} out of bounds", b));
        }
        for (i, brush) in self.brushes.iter().enumerate() {
            if brush.first_side + brush.num_sides > self.brush_sides.len() {
                return bad(format!("brush {} side range out of bounds", i));
            }
        }
        if let Some(&p) = self.brush_sides.iter().find(|&&p| p as usize >= self.planes.len()) {
            return bad(format!("side plane {} out of bounds", p));
        }
        if let Some(&v) = self.indices.iter().find(|&&v| v as usize >= self.vertices.len()) {
            return bad(format!("vertex index {} out of bounds", v));
        }

        // Children only point forward, which rules out cycles.
        let mut reached = vec![false; self.leaves.len()];
        if self.nodes.is_empty() {
            reached[0] = true;
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.plane >= self.planes.len() {
                return bad(format!("node {} plane out of bounds", i));
            }
            for raw in [node.front, node.back] {
                match BspChild::from_raw(raw) {
                    BspChild::Node(n) if n <= i || n >= self.nodes.len() => {
                        return bad(format!("node {} has bad child {}", i, n));
                    }
                    BspChild::Leaf(l) if l >= self.leaves.len() => {
                        return bad(format!("node {} references missing leaf {}", i, l));
                    }
                    BspChild::Leaf(l) => reached[l] = true,
                    BspChild::Node(_) => {}
                }
            }
        }
        if let Some(l) = reached.iter().position(|r| !r) {
            return bad(format!("leaf {} is unreachable", l));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut os = OutputStream::with_capacity(64 + self.planes.len() * PLANE_STRIDE);
        os.write_bytes(BSP_MAGIC);
        os.write_vec3(&self.mins);
        os.write_vec3(&self.maxs);
        os.write_f32(self.life);
        os.write_f32(self.resistance);

        for n in [
            self.planes.len(),
            self.nodes.len(),
            self.leaves.len(),
            self.leaf_brushes.len(),
            self.brushes.len(),
            self.brush_sides.len(),
            self.vertices.len(),
            self.indices.len(),
        ] {
            os.write_count(n);
        }
        for p in &self.planes {
            os.write_vec3(&p.normal);
            os.write_f32(p.dist);
        }
        for n in &self.nodes {
            os.write_count(n.plane);
            os.write_i32(n.front);
            os.write_i32(n.back);
        }
        for l in &self.leaves {
            os.write_i32(l.cluster);
            os.write_count(l.first_brush);
            os.write_count(l.num_brushes);
        }
        for &b in &self.leaf_brushes {
            os.write_u32(b);
        }
        for b in &self.brushes {
            os.write_count(b.first_side);
            os.write_count(b.num_sides);
            os.write_u32(b.material.bits());
        }
        for &s in &self.brush_sides {
            os.write_u32(s);
        }
        for v in &self.vertices {
            os.write_vec3(v);
        }
        for &i in &self.indices {
            os.write_u32(i);
        }
        os.into_inner()
    }

    // ============================================================
    // Box models
    // ============================================================

    pub fn with_resistance(mut self, resistance: f32) -> Self {
        self.resistance = resistance;
        self.checksum = asset_checksum(&self.to_bytes());
        self
    }

    /// A model made of one axis-aligned box brush.
    pub fn single_brush(mins: Vec3, maxs: Vec3, material: Material) -> Self {
        Self::from_boxes(&[(Bounds::new(mins, maxs), material)], 100.0)
    }

    /// Builds a model from box brushes, splitting them with axial node planes.
    pub fn from_boxes(boxes: &[(Bounds, Material)], life: f32) -> Self {
        let mut bsp = Bsp {
            life,
            ..Default::default()
        };
        if boxes.is_empty() {
            bsp.leaves.push(BspLeaf { cluster: 0, first_brush: 0, num_brushes: 0 });
            return bsp;
        }

        bsp.mins = boxes[0].0.mins;
        bsp.maxs = boxes[0].0.maxs;
        for (b, material) in boxes {
            for i in 0..3 {
                bsp.mins[i] = bsp.mins[i].min(b.mins[i]);
                bsp.maxs[i] = bsp.maxs[i].max(b.maxs[i]);
            }
            bsp.add_box_brush(b, *material);
        }

        let all: Vec<u32> = (0..boxes.len() as u32).collect();
        let root = bsp.build_tree(boxes, all, 0);
        debug_assert_eq!(root, bsp.root());
        bsp.checksum = asset_checksum(&bsp.to_bytes());
        bsp
    }

    fn add_box_brush(&mut self, b: &Bounds, material: Material) {
        let first_side = self.brush_sides.len();
        let sides = [
            ([1.0, 0.0, 0.0], b.maxs[0]),
            ([-1.0, 0.0, 0.0], -b.mins[0]),
            ([0.0, 1.0, 0.0], b.maxs[1]),
            ([0.0, -1.0, 0.0], -b.mins[1]),
            ([0.0, 0.0, 1.0], b.maxs[2]),
            ([0.0, 0.0, -1.0], -b.mins[2]),
        ];
        for (normal, dist) in sides {
            self.brush_sides.push(self.planes.len() as u32);
            self.planes.push(Plane::new(normal, dist));
        }
        self.brushes.push(Brush {
            first_side,
            num_sides: sides.len(),
            material,
        });

        let base = self.vertices.len() as u32;
        for i in 0..8 {
            self.vertices.push([
                if i & 1 != 0 { b.maxs[0] } else { b.mins[0] },
                if i & 2 != 0 { b.maxs[1] } else { b.mins[1] },
                if i & 4 != 0 { b.maxs[2] } else { b.mins[2] },
            ]);
        }
        const QUADS: [[u32; 4]; 6] = [
            [1, 3, 7, 5],
            [0, 4, 6, 2],
            [2, 6, 7, 3],
            [0, 1, 5, 4],
            [4, 5, 7, 6],
            [0, 2, 3, 1],
        ];
        for q in QUADS {
            self.indices
                .extend_from_slice(&[base + q[0], base + q[1], base + q[2], base + q[0], base + q[2], base + q[3]]);
        }
    }

    fn push_leaf(&mut self, brushes: &[u32]) -> BspChild {
        let first_brush = self.leaf_brushes.len();
        self.leaf_brushes.extend_from_slice(brushes);
        self.leaves.push(BspLeaf {
            cluster: self.leaves.len() as i32,
            first_brush,
            num_brushes: brushes.len(),
        });
        BspChild::Leaf(self.leaves.len() - 1)
    }

    fn build_tree(&mut self, boxes: &[(Bounds, Material)], set: Vec<u32>, depth: usize) -> BspChild {
        if set.len() <= 1 || depth >= 16 {
            return self.push_leaf(&set);
        }

        // Split on the axis with the widest spread of box centers.
        let centers: Vec<Vec3> = set.iter().map(|&i| boxes[i as usize].0.center()).collect();
        let mut axis = 0;
        let mut best_spread = -1.0;
        for a in 0..3 {
            let lo = centers.iter().map(|c| c[a]).fold(f32::INFINITY, f32::min);
            let hi = centers.iter().map(|c| c[a]).fold(f32::NEG_INFINITY, f32::max);
            if hi - lo > best_spread {
                best_spread = hi - lo;
                axis = a;
            }
        }
        let mut sorted: Vec<f32> = centers.iter().map(|c| c[axis]).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let split = (sorted[mid - 1] + sorted[mid]) * 0.5;

        let front: Vec<u32> = set
            .iter()
            .copied()
            .filter(|&i| boxes[i as usize].0.maxs[axis] > split)
            .collect();
        let back: Vec<u32> = set
            .iter()
            .copied()
            .filter(|&i| boxes[i as usize].0.mins[axis] < split)
            .collect();
        if front.len() == set.len() || back.len() == set.len() {
            return self.push_leaf(&set);
        }

        let mut normal = [0.0; 3];
        normal[axis] = 1.0;
        let plane = self.planes.len();
        self.planes.push(Plane::new(normal, split));
        let node = self.nodes.len();
        self.nodes.push(BspNode { plane, front: 0, back: 0 });

        let front = self.build_tree(boxes, front, depth + 1);
        let back = self.build_tree(boxes, back, depth + 1);
        self.nodes[node].front = front.to_raw();
        self.nodes[node].back = back.to_raw();
        BspChild::Node(node)
    }
}

// ============================================================
// Tests
// ============================================================
