//! The truncated signed distance volume.

use nalgebra::Vector3;

/// One voxel: signed distance to the nearest observed surface (metres,
/// clamped to the truncation band) and the fusion weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voxel {
    pub tsdf: f32,
    pub weight: f32,
}

/// A dense axis-aligned voxel grid holding the fused reconstruction.
///
/// Voxels are laid out x-fastest: index `(z * height + y) * width + x`.
/// The grid covers the box `[origin, origin + dims * voxel_size]` in the
/// global frame. Unobserved voxels hold `+truncation` (free space) with
/// weight zero.
#[derive(Debug, Clone, PartialEq)]
pub struct TsdfVolume {
    width: usize,
    height: usize,
    depth: usize,
    voxel_size: f32,
    origin: Vector3<f32>,
    truncation: f32,
    voxels: Vec<Voxel>,
}

impl TsdfVolume {
    pub fn new(
        dims: (usize, usize, usize),
        voxel_size: f32,
        origin: Vector3<f32>,
        truncation: f32,
    ) -> Self {
        let (width, height, depth) = dims;
        Self {
            width,
            height,
            depth,
            voxel_size,
            origin,
            truncation,
            voxels: vec![
                Voxel {
                    tsdf: truncation,
                    weight: 0.0,
                };
                width * height * depth
            ],
        }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.width, self.height, self.depth)
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn origin(&self) -> Vector3<f32> {
        self.origin
    }

    pub fn truncation(&self) -> f32 {
        self.truncation
    }

    /// Physical extent of the grid along each axis.
    pub fn extent(&self) -> Vector3<f32> {
        Vector3::new(
            self.width as f32 * self.voxel_size,
            self.height as f32 * self.voxel_size,
            self.depth as f32 * self.voxel_size,
        )
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize, z: usize) -> &Voxel {
        &self.voxels[(z * self.height + y) * self.width + x]
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    pub fn voxels_mut(&mut self) -> &mut [Voxel] {
        &mut self.voxels
    }

    /// Global-frame centre of voxel `(x, y, z)`.
    #[inline]
    pub fn voxel_center(&self, x: usize, y: usize, z: usize) -> Vector3<f32> {
        self.origin
            + Vector3::new(
                (x as f32 + 0.5) * self.voxel_size,
                (y as f32 + 0.5) * self.voxel_size,
                (z as f32 + 0.5) * self.voxel_size,
            )
    }

    /// Whether a global-frame point lies inside the grid's box.
    pub fn contains(&self, p: &Vector3<f32>) -> bool {
        let rel = p - self.origin;
        let ext = self.extent();
        (0.0..ext.x).contains(&rel.x)
            && (0.0..ext.y).contains(&rel.y)
            && (0.0..ext.z).contains(&rel.z)
    }

    /// Trilinearly interpolated signed distance at a global-frame point.
    ///
    /// `None` when any of the eight surrounding voxel centres falls
    /// outside the grid.
    pub fn sample(&self, p: &Vector3<f32>) -> Option<f32> {
        // Continuous grid coordinates relative to voxel centres.
        let g = (p - self.origin) / self.voxel_size - Vector3::repeat(0.5);
        let x0 = g.x.floor();
        let y0 = g.y.floor();
        let z0 = g.z.floor();
        if x0 < 0.0 || y0 < 0.0 || z0 < 0.0 {
            return None;
        }
        let (xi, yi, zi) = (x0 as usize, y0 as usize, z0 as usize);
        if xi + 1 >= self.width || yi + 1 >= self.height || zi + 1 >= self.depth {
            return None;
        }

        let wx = [1.0 - (g.x - x0), g.x - x0];
        let wy = [1.0 - (g.y - y0), g.y - y0];
        let wz = [1.0 - (g.z - z0), g.z - z0];

        let mut value = 0.0f32;
        for dz in 0..2 {
            for dy in 0..2 {
                for dx in 0..2 {
                    let w = wx[dx] * wy[dy] * wz[dz];
                    value += w * self.at(xi + dx, yi + dy, zi + dz).tsdf;
                }
            }
        }
        Some(value)
    }

    /// Gradient of the signed distance field at a global-frame point, by
    /// central differences of trilinear samples one voxel apart.
    pub fn gradient(&self, p: &Vector3<f32>) -> Option<Vector3<f32>> {
        let h = self.voxel_size;
        let dx = self.sample(&(p + Vector3::new(h, 0.0, 0.0)))?
            - self.sample(&(p - Vector3::new(h, 0.0, 0.0)))?;
        let dy = self.sample(&(p + Vector3::new(0.0, h, 0.0)))?
            - self.sample(&(p - Vector3::new(0.0, h, 0.0)))?;
        let dz = self.sample(&(p + Vector3::new(0.0, 0.0, h)))?
            - self.sample(&(p - Vector3::new(0.0, 0.0, h)))?;
        Some(Vector3::new(dx, dy, dz) / (2.0 * h))
    }
}
