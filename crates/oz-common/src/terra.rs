// terra.rs: Heightfield terrain.
//
// An N x N grid of square quads centered on the origin. Each quad is split
// along its (x,y) -> (x+1,y+1) diagonal into two triangles whose planes are
// computed once at load.

use std::path::Path;

use log::info;
use rayon::prelude::*;

use crate::crc::asset_checksum;
use crate::error::{OzError, OzResult};
use crate::math::{cross_product, dot_product, vector_normalize, vector_subtract, Bounds, Plane, Vec3};
use crate::stream::{read_f32_le, InputStream, OutputStream};

pub const TERRA_MAGIC: &[u8; 8] = b"OZTERRA\x01";

pub const QUADS: usize = 256;
pub const QUAD_SIZE: f32 = 16.0;

const PARALLEL_QUAD_THRESHOLD: usize = 4096;

/// Inclusive quad range `(min_x, min_y, max_x, max_y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadSpan {
    pub min_x: usize,
    pub min_y: usize,
    pub max_x: usize,
    pub max_y: usize,
}

#[derive(Debug, Clone)]
pub struct Terra {
    pub quads: usize,
    pub quad_size: f32,
    /// Half of the side length.
    pub dim: f32,
    /// `(quads+1)^2` vertices, row-major by y then x.
    pub vertices: Vec<Vec3>,
    /// Per quad: `[lower-right (lx >= ly), upper-left]` triangle planes.
    pub tri_planes: Vec<[Plane; 2]>,
    pub checksum: u16,
}

fn triangle_planes(a: &Vec3, b: &Vec3, c: &Vec3, d: &Vec3) -> [Plane; 2] {
    let mut n0 = cross_product(&vector_subtract(c, b), &vector_subtract(a, b));
    vector_normalize(&mut n0);
    let mut n1 = cross_product(&vector_subtract(a, d), &vector_subtract(c, d));
    vector_normalize(&mut n1);
    [
        Plane { normal: n0, dist: dot_product(&n0, a) },
        Plane { normal: n1, dist: dot_product(&n1, a) },
    ]
}

impl Terra {
    /// Level terrain at `height`.
    pub fn flat(quads: usize, quad_size: f32, height: f32) -> Self {
        let n = (quads + 1) * (quads + 1);
        Self::from_heights(quads, quad_size, &vec![height; n])
    }

    pub fn from_heights(quads: usize, quad_size: f32, heights: &[f32]) -> Self {
        debug_assert!(quads > 0 && quad_size > 0.0);
        debug_assert_eq!(heights.len(), (quads + 1) * (quads + 1));

        let dim = quads as f32 * quad_size * 0.5;
        let side = quads + 1;
        let vertices: Vec<Vec3> = (0..side * side)
            .map(|i| {
                let (x, y) = (i % side, i / side);
                [
                    x as f32 * quad_size - dim,
                    y as f32 * quad_size - dim,
                    heights[i],
                ]
            })
            .collect();

        let plane_of = |i: usize| {
            let (x, y) = (i % quads, i / quads);
            let a = &vertices[y * side + x];
            let b = &vertices[y * side + x + 1];
            let c = &vertices[(y + 1) * side + x + 1];
            let d = &vertices[(y + 1) * side + x];
            triangle_planes(a, b, c, d)
        };
        let count = quads * quads;
        let tri_planes = if count >= PARALLEL_QUAD_THRESHOLD {
            (0..count).into_par_iter().map(plane_of).collect()
        } else {
            (0..count).map(plane_of).collect()
        };

        let mut terra = Self {
            quads,
            quad_size,
            dim,
            vertices,
            tri_planes,
            checksum: 0,
        };
        terra.checksum = asset_checksum(&terra.to_bytes());
        terra
    }

    // ============================================================
    // Queries
    // ============================================================

    #[inline]
    pub fn vertex(&self, x: usize, y: usize) -> &Vec3 {
        &self.vertices[y * (self.quads + 1) + x]
    }

    #[inline]
    pub fn planes(&self, qx: usize, qy: usize) -> &[Plane; 2] {
        &self.tri_planes[qy * self.quads + qx]
    }

    fn quad_coord(&self, v: f32) -> usize {
        let q = ((v + self.dim) / self.quad_size).floor();
        if q <= 0.0 {
            0
        } else {
            (q as usize).min(self.quads - 1)
        }
    }

    /// Quad under a world position, clamped to the terrain.
    pub fn quad_of(&self, x: f32, y: f32) -> (usize, usize) {
        (self.quad_coord(x), self.quad_coord(y))
    }

    /// Quads touched by the xy projection of `bounds`, clamped.
    pub fn span(&self, bounds: &Bounds) -> QuadSpan {
        let (min_x, min_y) = self.quad_of(bounds.mins[0], bounds.mins[1]);
        let (max_x, max_y) = self.quad_of(bounds.maxs[0], bounds.maxs[1]);
        QuadSpan { min_x, min_y, max_x, max_y }
    }

    /// Which triangle of quad `(qx, qy)` covers the point.
    pub fn triangle_at(&self, qx: usize, qy: usize, x: f32, y: f32) -> usize {
        let lx = x - (qx as f32 * self.quad_size - self.dim);
        let ly = y - (qy as f32 * self.quad_size - self.dim);
        if lx >= ly {
            0
        } else {
            1
        }
    }

    /// Surface height at a world position, clamped to the terrain extent.
    pub fn height(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(-self.dim, self.dim);
        let y = y.clamp(-self.dim, self.dim);
        let (qx, qy) = self.quad_of(x, y);
        let plane = &self.planes(qx, qy)[self.triangle_at(qx, qy, x, y)];
        (plane.dist - plane.normal[0] * x - plane.normal[1] * y) / plane.normal[2]
    }

    // ============================================================
    // Binary format
    // ============================================================

    pub fn load(path: impl AsRef<Path>, expected_quads: Option<usize>) -> OzResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let terra = Self::from_bytes(&data, expected_quads)?;
        info!(
            "loaded terrain {} ({}x{} quads, crc {:04x})",
            path.display(),
            terra.quads,
            terra.quads,
            terra.checksum
        );
        Ok(terra)
    }

    pub fn from_bytes(data: &[u8], expected_quads: Option<usize>) -> OzResult<Self> {
        let mut is = InputStream::new(data, "terra");
        is.expect_magic(TERRA_MAGIC)?;
        let quads = is.read_count()?;
        if let Some(expected) = expected_quads {
            if quads != expected {
                return Err(OzError::SizeMismatch {
                    what: "terra",
                    expected,
                    found: quads,
                });
            }
        }
        if quads == 0 {
            return Err(OzError::bad_asset("terra", "terrain has no quads"));
        }
        let quad_size = is.read_f32()?;
        if !(quad_size > 0.0) {
            return Err(OzError::bad_asset("terra", format!("bad quad size {}", quad_size)));
        }

        let count = (quads + 1) * (quads + 1);
        let block = is.read_block(count, 4)?;
        let heights: Vec<f32> = (0..count).map(|i| read_f32_le(block, i * 4)).collect();
        if let Some(i) = heights.iter().position(|h| !h.is_finite()) {
            return Err(OzError::bad_asset("terra", format!("height {} is not finite", i)));
        }

        Ok(Self::from_heights(quads, quad_size, &heights))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut os = OutputStream::with_capacity(16 + self.vertices.len() * 4);
        os.write_bytes(TERRA_MAGIC);
        os.write_count(self.quads);
        os.write_f32(self.quad_size);
        for v in &self.vertices {
            os.write_f32(v[2]);
        }
        os.into_inner()
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// 4x4 quads of size 2, rising 1 unit per unit of x.
    fn ramp() -> Terra {
        let quads = 4;
        let quad_size = 2.0;
        let side = quads + 1;
        let heights: Vec<f32> = (0..side * side)
            .map(|i| (i % side) as f32 * quad_size)
            .collect();
        Terra::from_heights(quads, quad_size, &heights)
    }

    #[test]
    fn test_flat_planes_point_up() {
        let t = Terra::flat(4, 4.0, 3.0);
        for tri in &t.tri_planes {
            for p in tri {
                assert_abs_diff_eq!(p.normal[2], 1.0);
                assert_abs_diff_eq!(p.dist, 3.0);
            }
        }
        assert_abs_diff_eq!(t.height(1.3, -2.2), 3.0);
    }

    #[test]
    fn test_vertex_layout() {
        let t = Terra::flat(4, 4.0, 0.0);
        assert_eq!(t.dim, 8.0);
        assert_eq!(*t.vertex(0, 0), [-8.0, -8.0, 0.0]);
        assert_eq!(*t.vertex(4, 4), [8.0, 8.0, 0.0]);
        assert_eq!(*t.vertex(1, 0), [-4.0, -8.0, 0.0]);
    }

    #[test]
    fn test_ramp_height_follows_slope() {
        let t = ramp();
        // x = -4 sits at vertex column 0 (height 0); every unit of x adds 1.
        assert_abs_diff_eq!(t.height(-4.0, 0.5), 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(t.height(-1.5, 0.5), 2.5, epsilon = 1e-4);
        assert_abs_diff_eq!(t.height(3.0, -3.9), 7.0, epsilon = 1e-4);
    }

    #[test]
    fn test_height_clamps_outside() {
        let t = ramp();
        assert_abs_diff_eq!(t.height(100.0, 0.0), t.height(4.0, 0.0), epsilon = 1e-4);
        assert_abs_diff_eq!(t.height(-100.0, -100.0), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_triangle_split() {
        let t = Terra::flat(2, 1.0, 0.0);
        // quad (0,0) spans [-1,0] x [-1,0]
        assert_eq!(t.triangle_at(0, 0, -0.2, -0.8), 0);
        assert_eq!(t.triangle_at(0, 0, -0.8, -0.2), 1);
    }

    #[test]
    fn test_span_clamps() {
        let t = Terra::flat(8, 1.0, 0.0);
        let s = t.span(&Bounds::new([-100.0, -0.5, 0.0], [0.5, 100.0, 1.0]));
        assert_eq!(s, QuadSpan { min_x: 0, min_y: 3, max_x: 4, max_y: 7 });
    }

    #[test]
    fn test_bytes_load_back_and_size_check() {
        let t = ramp();
        let bytes = t.to_bytes();
        let loaded = Terra::from_bytes(&bytes, Some(4)).unwrap();
        assert_eq!(loaded.vertices, t.vertices);
        assert_eq!(loaded.checksum, t.checksum);

        match Terra::from_bytes(&bytes, Some(256)) {
            Err(OzError::SizeMismatch { expected, found, .. }) => {
                assert_eq!(expected, 256);
                assert_eq!(found, 4);
            }
            other => panic!("expected SizeMismatch, got {:?}", other.map(|t| t.quads)),
        }
    }

    #[test]
    fn test_truncated_heights() {
        let bytes = ramp().to_bytes();
        assert!(matches!(
            Terra::from_bytes(&bytes[..bytes.len() - 4], None),
            Err(OzError::Truncated { .. })
        ));
    }
}
