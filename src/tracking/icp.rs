//! Projective point-to-plane ICP pose refinement.

use std::sync::Arc;

use nalgebra::{Matrix3, Matrix4, Matrix6, Vector6};
use rayon::prelude::*;
use tracing::debug;

use crate::compute::{BufferedValue, CommandQueue};
use crate::geometry::{
    incremental_transform, rigid_inverse, rotation_of, translation_of, VertexNormalMap,
};
use crate::tracking::{ConfigError, PoseEstimationStage, TrackingLost};

/// Fraction of the frame that must hold surviving correspondences on the
/// final refinement iteration for tracking to be considered healthy.
const MIN_CORRESPONDENCE_RATIO: f64 = 0.10;

/// Configuration for [`IcpPoseEstimation`].
#[derive(Debug, Clone, Copy)]
pub struct IcpConfig {
    /// Maximum distance between a transformed live vertex and its
    /// predicted counterpart, in metres.
    pub distance_threshold: f32,
    /// Sine of the maximum angle between a transformed live normal and
    /// the predicted normal.
    pub normal_threshold: f32,
    /// Bootstrap pose: returned unchanged on the first invocation, and
    /// the seed for the reconstruction's global frame.
    pub initial_pose: Matrix4<f32>,
    /// Refinement iterations per frame. Run exactly; no early exit.
    pub iterations: usize,
    /// Work-group granularity of the correspondence reduction.
    pub group_size: usize,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 0.10,
            normal_threshold: (20.0f32).to_radians().sin(),
            initial_pose: Matrix4::identity(),
            iterations: 15,
            group_size: 16,
        }
    }
}

/// The accumulated normal-equations system for one refinement iteration.
type NormalEquations = (Matrix6<f64>, Vector6<f64>, usize);

/// Point-to-plane ICP against the raycast surface prediction.
///
/// Correspondences are found by projective data association: each live
/// vertex is transformed by the current pose estimate into the global
/// frame, then projected through K into the camera that rendered the
/// predicted map (the retained pose from the previous frame). On the
/// first iteration this degenerates to same-pixel-index correspondence,
/// which is why dense frame-aligned sensor data tracks without a spatial
/// nearest-neighbour search.
pub struct IcpPoseEstimation {
    queue: Arc<CommandQueue>,
    config: IcpConfig,
    width: usize,
    height: usize,
    /// The most recently produced T_gk.
    current_pose: Matrix4<f32>,
    last_matches: usize,
    min_correspondences: usize,
}

impl IcpPoseEstimation {
    /// Validates the configuration before any frame is processed.
    pub fn new(
        queue: Arc<CommandQueue>,
        config: IcpConfig,
        width: usize,
        height: usize,
    ) -> Result<Self, ConfigError> {
        let pixels = width * height;
        if config.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if config.group_size == 0 {
            return Err(ConfigError::ZeroGroupSize);
        }
        if config.group_size > pixels {
            return Err(ConfigError::GroupSizeTooLarge {
                group_size: config.group_size,
                pixels,
            });
        }
        if pixels % config.group_size != 0 {
            return Err(ConfigError::GroupSizeNotDividing {
                group_size: config.group_size,
                pixels,
            });
        }

        let min_correspondences = ((pixels as f64 * MIN_CORRESPONDENCE_RATIO) as usize).max(1);
        Ok(Self {
            queue,
            current_pose: config.initial_pose,
            config,
            width,
            height,
            last_matches: 0,
            min_correspondences,
        })
    }

    fn emit(
        &self,
        pose: Matrix4<f32>,
        prev: Option<BufferedValue<Matrix4<f32>>>,
    ) -> BufferedValue<Matrix4<f32>> {
        match prev {
            Some(mut buf) => {
                *buf.get_mut(&self.queue) = pose;
                buf
            }
            None => BufferedValue::new(&self.queue, pose),
        }
    }
}

impl PoseEstimationStage for IcpPoseEstimation {
    fn estimate(
        &mut self,
        live: &VertexNormalMap,
        predicted: Option<&VertexNormalMap>,
        k: &Matrix3<f32>,
        prev: Option<BufferedValue<Matrix4<f32>>>,
    ) -> Result<BufferedValue<Matrix4<f32>>, TrackingLost> {
        assert_eq!(
            (live.width(), live.height()),
            (self.width, self.height),
            "live map dimensions do not match the configured frame size"
        );

        let Some(predicted) = predicted else {
            // No prior estimate: seed the global frame.
            self.current_pose = self.config.initial_pose;
            self.last_matches = 0;
            return Ok(self.emit(self.current_pose, prev));
        };
        assert_eq!(
            (predicted.width(), predicted.height()),
            (self.width, self.height),
            "predicted map dimensions do not match the configured frame size"
        );

        // The predicted map was raycast from the retained pose.
        let prediction_camera = rigid_inverse(&self.current_pose);

        let mut pose = self.current_pose;
        let mut matched = 0usize;
        for iteration in 0..self.config.iterations {
            let mut system: NormalEquations = (Matrix6::zeros(), Vector6::zeros(), 0);
            {
                let system = &mut system;
                let config = &self.config;
                self.queue.enqueue("icp_normal_equations", || {
                    *system =
                        accumulate(live, predicted, k, &prediction_camera, &pose, config);
                });
            }
            let (jtj, jtr, count) = system;
            matched = count;

            if count == 0 {
                return Err(TrackingLost::TooFewCorrespondences {
                    matched: 0,
                    required: self.min_correspondences,
                });
            }
            let Some(chol) = jtj.cholesky() else {
                return Err(TrackingLost::DegenerateGeometry { iteration });
            };
            let xi = chol.solve(&jtr);
            pose = incremental_transform(&xi) * pose;
        }

        if matched < self.min_correspondences {
            return Err(TrackingLost::TooFewCorrespondences {
                matched,
                required: self.min_correspondences,
            });
        }

        debug!(matched, "pose refined");
        self.current_pose = pose;
        self.last_matches = matched;
        Ok(self.emit(pose, prev))
    }

    fn last_match_count(&self) -> usize {
        self.last_matches
    }
}

/// One pass over the live map: find correspondences, reject outliers,
/// accumulate the point-to-plane normal equations.
///
/// The reduction is two-stage: one partial system per work group of
/// `group_size` pixels computed in parallel, then a sequential sum in
/// group order. Summing in a fixed order keeps the result independent of
/// scheduling, so identical inputs give identical poses.
fn accumulate(
    live: &VertexNormalMap,
    predicted: &VertexNormalMap,
    k: &Matrix3<f32>,
    prediction_camera: &Matrix4<f32>,
    pose: &Matrix4<f32>,
    config: &IcpConfig,
) -> NormalEquations {
    let rot = rotation_of(pose);
    let trans = translation_of(pose);
    let cam_rot = rotation_of(prediction_camera);
    let cam_trans = translation_of(prediction_camera);
    let width = predicted.width();
    let height = predicted.height();

    live.pixels()
        .par_chunks(config.group_size)
        .map(|group| {
            let mut jtj = Matrix6::<f64>::zeros();
            let mut jtr = Vector6::<f64>::zeros();
            let mut count = 0usize;

            for pixel in group {
                if !pixel.is_valid() {
                    continue;
                }
                let v_g = rot * pixel.vertex + trans;
                let n_g = rot * pixel.normal;

                // Project into the camera the prediction was rendered from.
                let in_camera = cam_rot * v_g + cam_trans;
                if in_camera.z <= 0.0 {
                    continue;
                }
                let projected = k * in_camera;
                let u = (projected.x / projected.z).round();
                let v = (projected.y / projected.z).round();
                if u < 0.0 || v < 0.0 || u >= width as f32 || v >= height as f32 {
                    continue;
                }
                let target = predicted.at(u as usize, v as usize);
                if !target.is_valid() {
                    continue;
                }

                if (v_g - target.vertex).norm() > config.distance_threshold {
                    continue;
                }
                if n_g.cross(&target.normal).norm() > config.normal_threshold {
                    continue;
                }

                let s = v_g.cast::<f64>();
                let n = target.normal.cast::<f64>();
                let residual = n.dot(&(target.vertex.cast::<f64>() - s));
                let sxn = s.cross(&n);
                let a = Vector6::new(sxn.x, sxn.y, sxn.z, n.x, n.y, n.z);

                jtj += a * a.transpose();
                jtr += a * residual;
                count += 1;
            }

            (jtj, jtr, count)
        })
        .collect::<Vec<_>>()
        .into_iter()
        .fold(
            (Matrix6::zeros(), Vector6::zeros(), 0),
            |acc, partial| (acc.0 + partial.0, acc.1 + partial.1, acc.2 + partial.2),
        )
}
