//! Update reconstruction stage: fuses each posed measurement into the
//! persistent signed-distance volume.

pub mod volume;

use std::sync::Arc;

use nalgebra::{Matrix3, Matrix4, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::compute::{BufferedValue, CommandQueue};
use crate::geometry::{rigid_inverse, rotation_of, translation_of, VertexNormalMap};

pub use volume::{TsdfVolume, Voxel};

/// Configuration for [`TsdfFusion`].
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Truncation band half-width μ, metres.
    pub truncation: f32,
    /// Voxel grid dimensions.
    pub dims: (usize, usize, usize),
    /// Physical edge length of the grid along x, metres. The voxel size
    /// is `extent / dims.0`; y and z extents follow from the dims.
    pub extent: f32,
    /// Global-frame position of the grid's minimum corner.
    pub origin: Vector3<f32>,
    /// Cap on the per-voxel fusion weight, so old observations can still
    /// be displaced by slow drift.
    pub max_weight: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            truncation: 0.10,
            dims: (256, 256, 256),
            extent: 3.0,
            origin: Vector3::zeros(),
            max_weight: 128.0,
        }
    }
}

/// Fuses posed camera-frame measurements into the volumetric model.
pub trait UpdateReconstructionStage {
    /// Fuse `live` (camera frame) into the reconstruction under `pose`.
    ///
    /// `prev` is the volume returned by the previous call; fusion
    /// accumulates into it. `None` starts a fresh reconstruction.
    fn integrate(
        &mut self,
        live: &VertexNormalMap,
        k: &Matrix3<f32>,
        pose: &Matrix4<f32>,
        prev: Option<BufferedValue<TsdfVolume>>,
    ) -> BufferedValue<TsdfVolume>;
}

/// Weighted-running-average TSDF fusion.
pub struct TsdfFusion {
    queue: Arc<CommandQueue>,
    config: FusionConfig,
}

impl TsdfFusion {
    pub fn new(queue: Arc<CommandQueue>, config: FusionConfig) -> Self {
        Self { queue, config }
    }

    fn fresh_volume(&self) -> TsdfVolume {
        let voxel_size = self.config.extent / self.config.dims.0 as f32;
        TsdfVolume::new(
            self.config.dims,
            voxel_size,
            self.config.origin,
            self.config.truncation,
        )
    }
}

impl UpdateReconstructionStage for TsdfFusion {
    fn integrate(
        &mut self,
        live: &VertexNormalMap,
        k: &Matrix3<f32>,
        pose: &Matrix4<f32>,
        prev: Option<BufferedValue<TsdfVolume>>,
    ) -> BufferedValue<TsdfVolume> {
        let mut out = match prev {
            Some(buf) => {
                assert_eq!(
                    buf.get(&self.queue).dims(),
                    self.config.dims,
                    "reused volume dimensions do not match the configured grid"
                );
                buf
            }
            None => BufferedValue::new(&self.queue, self.fresh_volume()),
        };

        let config = self.config;
        {
            let volume = out.get_mut(&self.queue);
            self.queue.enqueue("tsdf_integrate", || {
                integrate_frame(volume, live, k, pose, &config);
            });
        }
        debug!("frame fused into volume");

        out
    }
}

/// Sweep every voxel: project its centre into the camera, sample the
/// measured geometry at that pixel, and fold the observed signed
/// distance into the running average.
fn integrate_frame(
    volume: &mut TsdfVolume,
    live: &VertexNormalMap,
    k: &Matrix3<f32>,
    pose: &Matrix4<f32>,
    config: &FusionConfig,
) {
    let (vw, vh, _vd) = volume.dims();
    let voxel_size = volume.voxel_size();
    let origin = volume.origin();
    let mu = config.truncation;
    let max_weight = config.max_weight;

    let camera = rigid_inverse(pose);
    let cam_rot = rotation_of(&camera);
    let cam_trans = translation_of(&camera);
    let width = live.width();
    let height = live.height();

    volume
        .voxels_mut()
        .par_chunks_mut(vw * vh)
        .enumerate()
        .for_each(|(z, slice)| {
            for y in 0..vh {
                for x in 0..vw {
                    let center = origin
                        + Vector3::new(
                            (x as f32 + 0.5) * voxel_size,
                            (y as f32 + 0.5) * voxel_size,
                            (z as f32 + 0.5) * voxel_size,
                        );
                    let in_camera = cam_rot * center + cam_trans;
                    if in_camera.z <= 0.0 {
                        continue;
                    }

                    let projected = k * in_camera;
                    let u = (projected.x / projected.z).round();
                    let v = (projected.y / projected.z).round();
                    if u < 0.0 || v < 0.0 || u >= width as f32 || v >= height as f32 {
                        continue;
                    }
                    let measured = live.at(u as usize, v as usize);
                    if !measured.has_vertex() {
                        continue;
                    }

                    // Signed distance along the pixel's viewing ray:
                    // positive in front of the measured surface.
                    let eta = measured.vertex.norm() - in_camera.norm();
                    if eta < -mu {
                        // Occluded beyond the truncation band.
                        continue;
                    }
                    let observed = eta.min(mu);

                    let voxel = &mut slice[y * vw + x];
                    voxel.tsdf =
                        (voxel.tsdf * voxel.weight + observed) / (voxel.weight + 1.0);
                    voxel.weight = (voxel.weight + 1.0).min(max_weight);
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Pixel;
    use approx::assert_relative_eq;

    const WIDTH: usize = 64;
    const HEIGHT: usize = 48;

    fn test_k() -> Matrix3<f32> {
        Matrix3::new(60.0, 0.0, 32.0, 0.0, 60.0, 24.0, 0.0, 0.0, 1.0)
    }

    fn small_config() -> FusionConfig {
        FusionConfig {
            dims: (32, 32, 32),
            extent: 3.0,
            ..FusionConfig::default()
        }
    }

    /// A wall at constant camera depth, as measured geometry.
    fn wall_map(depth: f32) -> VertexNormalMap {
        let k_inv = test_k().try_inverse().unwrap();
        let mut map = VertexNormalMap::new(WIDTH, HEIGHT);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let dir = k_inv * Vector3::new(x as f32, y as f32, 1.0);
                *map.at_mut(x, y) = Pixel {
                    vertex: dir * depth,
                    normal: Vector3::new(0.0, 0.0, -1.0),
                };
            }
        }
        map
    }

    fn center_pose() -> Matrix4<f32> {
        let mut t = Matrix4::identity();
        t[(0, 3)] = 1.5;
        t[(1, 3)] = 1.5;
        t[(2, 3)] = 0.2;
        t
    }

    #[test]
    fn test_fused_values_stay_inside_truncation_band() {
        let queue = Arc::new(CommandQueue::new());
        let mut stage = TsdfFusion::new(queue.clone(), small_config());
        let live = wall_map(1.0);

        let volume = stage.integrate(&live, &test_k(), &center_pose(), None);
        let volume = volume.read_back(&queue);

        let mu = small_config().truncation;
        for voxel in volume.voxels() {
            assert!(voxel.tsdf >= -mu - 1e-6 && voxel.tsdf <= mu + 1e-6);
            assert!(voxel.weight >= 0.0);
        }
        // Something was actually observed.
        assert!(volume.voxels().iter().any(|v| v.weight > 0.0));
        // And the surface crossing exists: some fused voxel is negative.
        assert!(volume.voxels().iter().any(|v| v.weight > 0.0 && v.tsdf < 0.0));
    }

    #[test]
    fn test_weights_are_monotone_under_repeated_fusion() {
        let queue = Arc::new(CommandQueue::new());
        let mut stage = TsdfFusion::new(queue.clone(), small_config());
        let live = wall_map(1.0);
        let k = test_k();
        let pose = center_pose();

        let volume = stage.integrate(&live, &k, &pose, None);
        let weights_once: Vec<f32> =
            volume.get(&queue).voxels().iter().map(|v| v.weight).collect();

        let volume = stage.integrate(&live, &k, &pose, Some(volume));
        let volume = volume.read_back(&queue);

        for (after, before) in volume.voxels().iter().zip(&weights_once) {
            assert!(after.weight >= *before);
        }
    }

    #[test]
    fn test_refusing_identical_frame_leaves_tsdf_unchanged() {
        let queue = Arc::new(CommandQueue::new());
        let mut stage = TsdfFusion::new(queue.clone(), small_config());
        let live = wall_map(1.0);
        let k = test_k();
        let pose = center_pose();

        let volume = stage.integrate(&live, &k, &pose, None);
        let tsdf_once: Vec<f32> = volume.get(&queue).voxels().iter().map(|v| v.tsdf).collect();

        let volume = stage.integrate(&live, &k, &pose, Some(volume));
        let volume = volume.read_back(&queue);

        for (after, before) in volume.voxels().iter().zip(&tsdf_once) {
            assert_relative_eq!(after.tsdf, *before, epsilon = 1e-5);
        }
    }
}
