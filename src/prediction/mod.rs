//! Surface prediction stage: raycasts the fused volume into the current
//! camera, producing the global-frame map the next frame aligns against.

use std::sync::Arc;

use nalgebra::{Matrix3, Matrix4, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::compute::{BufferedValue, CommandQueue};
use crate::fusion::TsdfVolume;
use crate::geometry::{
    rotation_of, translation_of, InverseIntrinsics, Pixel, VertexNormalMap,
};

/// Gradients below this norm give no usable surface normal.
const MIN_GRADIENT_NORM: f32 = 1.0e-6;

/// Raycasts the reconstruction from a pose into a vertex/normal map.
pub trait SurfacePredictionStage {
    /// Predict the geometry visible from `pose`.
    ///
    /// The returned map is in the global frame. `prev` may be the map
    /// returned by the previous call, reused in place. Pixels whose ray
    /// misses the volume or exits it without a surface crossing are
    /// invalid (NaN).
    fn predict(
        &mut self,
        volume: &TsdfVolume,
        pose: &Matrix4<f32>,
        k: &Matrix3<f32>,
        prev: Option<BufferedValue<VertexNormalMap>>,
    ) -> BufferedValue<VertexNormalMap>;
}

/// Fixed-step ray marcher with interpolated zero-crossing refinement.
pub struct RaycastPrediction {
    queue: Arc<CommandQueue>,
    /// Truncation band half-width of the volume being raycast; the march
    /// step is half of it so a band crossing cannot be stepped over.
    truncation: f32,
    width: usize,
    height: usize,
    k_inv: InverseIntrinsics,
}

impl RaycastPrediction {
    pub fn new(queue: Arc<CommandQueue>, truncation: f32, width: usize, height: usize) -> Self {
        Self {
            queue,
            truncation,
            width,
            height,
            k_inv: InverseIntrinsics::new(),
        }
    }
}

impl SurfacePredictionStage for RaycastPrediction {
    fn predict(
        &mut self,
        volume: &TsdfVolume,
        pose: &Matrix4<f32>,
        k: &Matrix3<f32>,
        prev: Option<BufferedValue<VertexNormalMap>>,
    ) -> BufferedValue<VertexNormalMap> {
        let width = self.width;
        let height = self.height;

        let mut out = match prev {
            Some(mut buf) => {
                buf.get_mut(&self.queue).reset(width, height);
                buf
            }
            None => BufferedValue::new(&self.queue, VertexNormalMap::new(width, height)),
        };

        let k_inv = *self.k_inv.get(k);
        let step = self.truncation * 0.5;
        {
            let map = out.get_mut(&self.queue);
            self.queue.enqueue("raycast", || {
                raycast(volume, pose, &k_inv, step, map);
            });
        }
        debug!("surface predicted");

        out
    }
}

fn raycast(
    volume: &TsdfVolume,
    pose: &Matrix4<f32>,
    k_inv: &Matrix3<f32>,
    step: f32,
    map: &mut VertexNormalMap,
) {
    let rot = rotation_of(pose);
    let eye = translation_of(pose);
    let width = map.width();

    let box_min = volume.origin();
    let box_max = volume.origin() + volume.extent();
    // Skip the boundary sliver where trilinear sampling has no support.
    let skirt = volume.voxel_size();

    map.pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, pixel) in row.iter_mut().enumerate() {
                let dir_cam = k_inv * Vector3::new(x as f32, y as f32, 1.0);
                let dir = (rot * dir_cam).normalize();

                *pixel = march_ray(volume, &eye, &dir, &box_min, &box_max, skirt, step);
            }
        });
}

/// March one ray through the volume; the first positive-to-negative
/// crossing of the signed distance field is the surface.
fn march_ray(
    volume: &TsdfVolume,
    eye: &Vector3<f32>,
    dir: &Vector3<f32>,
    box_min: &Vector3<f32>,
    box_max: &Vector3<f32>,
    skirt: f32,
    step: f32,
) -> Pixel {
    let Some((enter, exit)) = intersect_box(eye, dir, box_min, box_max) else {
        return Pixel::invalid();
    };

    let mut t = enter.max(0.0) + skirt;
    let mut prev: Option<(f32, f32)> = None;
    while t < exit {
        let p = eye + dir * t;
        match volume.sample(&p) {
            None => prev = None,
            Some(sdf) => {
                if let Some((t_prev, sdf_prev)) = prev {
                    if sdf_prev > 0.0 && sdf <= 0.0 {
                        // Refine the crossing by linear interpolation.
                        let t_star = t_prev + (t - t_prev) * sdf_prev / (sdf_prev - sdf);
                        let p_star = eye + dir * t_star;
                        return surface_pixel(volume, &p_star);
                    }
                }
                prev = Some((t, sdf));
            }
        }
        t += step;
    }

    Pixel::invalid()
}

fn surface_pixel(volume: &TsdfVolume, p: &Vector3<f32>) -> Pixel {
    let Some(grad) = volume.gradient(p) else {
        return Pixel::invalid();
    };
    let norm = grad.norm();
    if norm < MIN_GRADIENT_NORM {
        return Pixel::invalid();
    }
    Pixel {
        vertex: *p,
        normal: grad / norm,
    }
}

/// Slab intersection of a ray with an axis-aligned box.
///
/// Returns the entry and exit distances along `dir`, or `None` when the
/// ray misses entirely. The entry distance may be negative when the eye
/// is inside the box.
fn intersect_box(
    eye: &Vector3<f32>,
    dir: &Vector3<f32>,
    box_min: &Vector3<f32>,
    box_max: &Vector3<f32>,
) -> Option<(f32, f32)> {
    let mut t_enter = f32::NEG_INFINITY;
    let mut t_exit = f32::INFINITY;

    for axis in 0..3 {
        if dir[axis].abs() < 1.0e-12 {
            if eye[axis] < box_min[axis] || eye[axis] > box_max[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / dir[axis];
        let mut t0 = (box_min[axis] - eye[axis]) * inv;
        let mut t1 = (box_max[axis] - eye[axis]) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_enter = t_enter.max(t0);
        t_exit = t_exit.min(t1);
        if t_enter > t_exit {
            return None;
        }
    }
    if t_exit < 0.0 {
        return None;
    }
    Some((t_enter, t_exit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::Voxel;
    use approx::assert_relative_eq;

    const WIDTH: usize = 64;
    const HEIGHT: usize = 48;
    const MU: f32 = 0.1;

    fn test_k() -> Matrix3<f32> {
        Matrix3::new(60.0, 0.0, 32.0, 0.0, 60.0, 24.0, 0.0, 0.0, 1.0)
    }

    /// An analytic wall at global z = `wall_z` inside a 3 m cube.
    fn wall_volume(wall_z: f32) -> TsdfVolume {
        let dims = (48, 48, 48);
        let mut volume = TsdfVolume::new(dims, 3.0 / 48.0, Vector3::zeros(), MU);
        for z in 0..dims.2 {
            for y in 0..dims.1 {
                for x in 0..dims.0 {
                    let center = volume.voxel_center(x, y, z);
                    let sdf = (wall_z - center.z).clamp(-MU, MU);
                    let idx = (z * dims.1 + y) * dims.0 + x;
                    volume.voxels_mut()[idx] = Voxel {
                        tsdf: sdf,
                        weight: 1.0,
                    };
                }
            }
        }
        volume
    }

    fn center_pose() -> Matrix4<f32> {
        let mut t = Matrix4::identity();
        t[(0, 3)] = 1.5;
        t[(1, 3)] = 1.5;
        t[(2, 3)] = 0.3;
        t
    }

    #[test]
    fn test_raycast_finds_the_wall() {
        let queue = Arc::new(CommandQueue::new());
        let mut stage = RaycastPrediction::new(queue.clone(), MU, WIDTH, HEIGHT);
        let volume = wall_volume(2.0);

        let map = stage.predict(&volume, &center_pose(), &test_k(), None);
        let map = map.read_back(&queue);

        assert!(map.valid_count() > 0);

        let center = map.at(WIDTH / 2, HEIGHT / 2);
        assert!(center.is_valid());
        assert_relative_eq!(center.vertex.z, 2.0, epsilon = 0.08);
        assert_relative_eq!(center.normal, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-3);
    }

    #[test]
    fn test_no_valid_pixel_has_a_zero_normal() {
        let queue = Arc::new(CommandQueue::new());
        let mut stage = RaycastPrediction::new(queue.clone(), MU, WIDTH, HEIGHT);
        let volume = wall_volume(2.0);

        let map = stage.predict(&volume, &center_pose(), &test_k(), None);
        let map = map.read_back(&queue);

        let zero = Vector3::zeros();
        for pixel in map.pixels() {
            if pixel.has_normal() {
                assert_ne!(pixel.normal, zero);
            }
        }
    }

    #[test]
    fn test_rays_looking_away_from_volume_are_invalid() {
        let queue = Arc::new(CommandQueue::new());
        let mut stage = RaycastPrediction::new(queue.clone(), MU, WIDTH, HEIGHT);
        let volume = wall_volume(2.0);

        // Behind the volume looking further away along -z.
        let mut pose = Matrix4::identity();
        pose[(0, 0)] = 1.0;
        pose[(1, 1)] = -1.0;
        pose[(2, 2)] = -1.0;
        pose[(0, 3)] = 1.5;
        pose[(1, 3)] = 1.5;
        pose[(2, 3)] = -0.5;

        let map = stage.predict(&volume, &pose, &test_k(), None);
        let map = map.read_back(&queue);
        assert_eq!(map.valid_count(), 0);
    }

    #[test]
    fn test_reused_map_yields_identical_prediction() {
        let queue = Arc::new(CommandQueue::new());
        let mut stage = RaycastPrediction::new(queue.clone(), MU, WIDTH, HEIGHT);
        let volume = wall_volume(2.0);
        let pose = center_pose();

        let fresh = stage.predict(&volume, &pose, &test_k(), None);
        let fresh = fresh.read_back(&queue);

        let scratch = stage.predict(&volume, &pose, &test_k(), None);
        let reused = stage.predict(&volume, &pose, &test_k(), Some(scratch));
        let reused = reused.read_back(&queue);

        assert_eq!(fresh.width(), reused.width());
        for (a, b) in fresh.pixels().iter().zip(reused.pixels()) {
            let same = |x: f32, y: f32| x == y || (x.is_nan() && y.is_nan());
            assert!(a.vertex.iter().zip(b.vertex.iter()).all(|(x, y)| same(*x, *y)));
            assert!(a.normal.iter().zip(b.normal.iter()).all(|(x, y)| same(*x, *y)));
        }
    }
}
