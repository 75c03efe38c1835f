//! Per-frame pipeline driver.
//!
//! `FusionPipeline` is the top-level struct users interact with. It owns
//! the four stages behind their traits, threads single-owner buffers
//! between them, and applies the tracking-lost recovery policy: keep the
//! last good pose, skip fusion and prediction for the failed frame, and
//! report the state to the caller.

use std::sync::Arc;
use std::time::Instant;

use nalgebra::{Matrix3, Matrix4};
use tracing::{debug, warn};

use crate::compute::{BufferedValue, CommandQueue};
use crate::fusion::{FusionConfig, TsdfFusion, TsdfVolume, UpdateReconstructionStage};
use crate::geometry::{rotation_of, translation_of, VertexNormalMap};
use crate::io::DepthFrame;
use crate::measurement::{BilateralMeasurement, MeasurementStage};
use crate::prediction::{RaycastPrediction, SurfacePredictionStage};
use crate::tracking::{
    ConfigError, FrameMetrics, FrameResult, IcpConfig, IcpPoseEstimation, PoseEstimationStage,
    TimingStats, TrackingState,
};

/// Configuration for [`FusionPipeline::new`].
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub width: usize,
    pub height: usize,
    /// Camera intrinsics, handed to every stage each frame.
    pub k: Matrix3<f32>,
    /// Bilateral filter window size (pixels).
    pub bilateral_window: usize,
    /// Bilateral spatial smoothing coefficient.
    pub sigma_spatial: f32,
    /// Bilateral range smoothing coefficient.
    pub sigma_range: f32,
    pub icp: IcpConfig,
    pub fusion: FusionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut initial_pose = Matrix4::identity();
        initial_pose[(0, 3)] = 1.5;
        initial_pose[(1, 3)] = 1.5;
        initial_pose[(2, 3)] = 1.5;

        Self {
            width: 640,
            height: 480,
            k: Matrix3::new(585.0, 0.0, 320.0, 0.0, 585.0, 240.0, 0.0, 0.0, 1.0),
            bilateral_window: 16,
            sigma_spatial: 2.0,
            sigma_range: 1.0,
            icp: IcpConfig {
                initial_pose,
                ..IcpConfig::default()
            },
            fusion: FusionConfig::default(),
        }
    }
}

/// Drives measurement → pose estimation → update reconstruction →
/// surface prediction for each incoming depth frame.
pub struct FusionPipeline {
    queue: Arc<CommandQueue>,
    k: Matrix3<f32>,
    measurement: Box<dyn MeasurementStage>,
    pose_estimation: Box<dyn PoseEstimationStage>,
    reconstruction: Box<dyn UpdateReconstructionStage>,
    prediction: Box<dyn SurfacePredictionStage>,

    state: TrackingState,
    /// The last good T_gk; also the reported pose for skipped frames.
    last_pose: Matrix4<f32>,
    frame_count: usize,

    // Buffers owned between frames and handed back to their producers.
    measured: Option<BufferedValue<VertexNormalMap>>,
    predicted: Option<BufferedValue<VertexNormalMap>>,
    volume: Option<BufferedValue<TsdfVolume>>,
    pose_buf: Option<BufferedValue<Matrix4<f32>>>,
}

impl FusionPipeline {
    /// Build the pipeline with the CPU stage implementations.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        let queue = Arc::new(CommandQueue::new());

        let measurement = BilateralMeasurement::new(
            queue.clone(),
            config.bilateral_window,
            config.sigma_spatial,
            config.sigma_range,
        );
        let pose_estimation =
            IcpPoseEstimation::new(queue.clone(), config.icp, config.width, config.height)?;
        let reconstruction = TsdfFusion::new(queue.clone(), config.fusion);
        let prediction = RaycastPrediction::new(
            queue.clone(),
            config.fusion.truncation,
            config.width,
            config.height,
        );

        Ok(Self::with_stages(
            queue,
            config.k,
            config.icp.initial_pose,
            Box::new(measurement),
            Box::new(pose_estimation),
            Box::new(reconstruction),
            Box::new(prediction),
        ))
    }

    /// Build the pipeline from caller-supplied stage implementations.
    /// The driver only depends on the stage traits.
    #[allow(clippy::too_many_arguments)]
    pub fn with_stages(
        queue: Arc<CommandQueue>,
        k: Matrix3<f32>,
        initial_pose: Matrix4<f32>,
        measurement: Box<dyn MeasurementStage>,
        pose_estimation: Box<dyn PoseEstimationStage>,
        reconstruction: Box<dyn UpdateReconstructionStage>,
        prediction: Box<dyn SurfacePredictionStage>,
    ) -> Self {
        Self {
            queue,
            k,
            measurement,
            pose_estimation,
            reconstruction,
            prediction,
            state: TrackingState::default(),
            last_pose: initial_pose,
            frame_count: 0,
            measured: None,
            predicted: None,
            volume: None,
            pose_buf: None,
        }
    }

    /// Process one depth frame through all four stages.
    pub fn process_frame(&mut self, frame: &DepthFrame) -> FrameResult {
        let t_start = Instant::now();
        let prev_pose = self.last_pose;

        // Measurement.
        let measured = self
            .measurement
            .measure(frame, &self.k, self.measured.take());
        let measured_valid = measured.get(&self.queue).valid_count();
        let t_measured = t_start.elapsed();

        // Pose estimation against the previous frame's prediction.
        let estimate = self.pose_estimation.estimate(
            measured.get(&self.queue),
            self.predicted.as_ref().map(|b| b.get(&self.queue)),
            &self.k,
            self.pose_buf.take(),
        );
        let t_pose = t_start.elapsed();

        let pose_buf = match estimate {
            Ok(buf) => buf,
            Err(lost) => {
                warn!(%lost, frame = self.frame_count, "skipping frame");
                self.state = TrackingState::Lost;
                self.frame_count += 1;
                // Hand the map back for reuse; the retained prediction
                // still serves the next alignment attempt.
                self.measured = Some(measured);
                return FrameResult {
                    state: TrackingState::Lost,
                    pose: self.last_pose,
                    metrics: FrameMetrics {
                        measured_valid,
                        ..FrameMetrics::default()
                    },
                    timing: TimingStats {
                        total_ms: ms(t_start.elapsed()),
                        measurement_ms: ms(t_measured),
                        pose_ms: ms(t_pose - t_measured),
                        ..TimingStats::zero()
                    },
                };
            }
        };
        let t_gk = *pose_buf.get(&self.queue);

        // Update reconstruction.
        let volume = self.reconstruction.integrate(
            measured.get(&self.queue),
            &self.k,
            &t_gk,
            self.volume.take(),
        );
        let t_fusion = t_start.elapsed();

        // Surface prediction for the next frame's alignment.
        let predicted = self.prediction.predict(
            volume.get(&self.queue),
            &t_gk,
            &self.k,
            self.predicted.take(),
        );
        let predicted_valid = predicted.get(&self.queue).valid_count();
        let t_prediction = t_start.elapsed();

        let delta = delta_pose(&prev_pose, &t_gk);
        let result = FrameResult {
            state: TrackingState::Ok,
            pose: t_gk,
            metrics: FrameMetrics {
                measured_valid,
                predicted_valid,
                matched_correspondences: self.pose_estimation.last_match_count(),
                delta_translation_m: delta.0,
                delta_rotation_deg: delta.1,
            },
            timing: TimingStats {
                total_ms: ms(t_prediction),
                measurement_ms: ms(t_measured),
                pose_ms: ms(t_pose - t_measured),
                fusion_ms: ms(t_fusion - t_pose),
                prediction_ms: ms(t_prediction - t_fusion),
            },
        };
        debug!(
            frame = self.frame_count,
            matched = result.metrics.matched_correspondences,
            "frame processed"
        );

        self.state = TrackingState::Ok;
        self.last_pose = t_gk;
        self.frame_count += 1;
        self.measured = Some(measured);
        self.predicted = Some(predicted);
        self.volume = Some(volume);
        self.pose_buf = Some(pose_buf);

        result
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// The most recent good camera-to-global pose.
    pub fn current_pose(&self) -> Matrix4<f32> {
        self.last_pose
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Read-only view of the reconstruction, if any frame has been fused.
    pub fn volume(&self) -> Option<&TsdfVolume> {
        self.volume.as_ref().map(|b| b.get(&self.queue))
    }

    /// Read-only view of the latest surface prediction.
    pub fn prediction(&self) -> Option<&VertexNormalMap> {
        self.predicted.as_ref().map(|b| b.get(&self.queue))
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }
}

fn ms(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1.0e3
}

/// Translation and rotation magnitude between two poses.
fn delta_pose(a: &Matrix4<f32>, b: &Matrix4<f32>) -> (f32, f32) {
    let dt = (translation_of(b) - translation_of(a)).norm();
    let rel = rotation_of(a).transpose() * rotation_of(b);
    let cos = ((rel.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    (dt, cos.acos().to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DepthFrameSource, SyntheticDepthSource};

    fn small_pipeline(source: &SyntheticDepthSource) -> FusionPipeline {
        let config = PipelineConfig {
            width: source.width(),
            height: source.height(),
            k: source.k(),
            bilateral_window: 4,
            icp: IcpConfig {
                initial_pose: source.initial_pose(),
                group_size: 64,
                ..IcpConfig::default()
            },
            fusion: FusionConfig {
                dims: (64, 64, 64),
                ..FusionConfig::default()
            },
            ..PipelineConfig::default()
        };
        FusionPipeline::new(config).unwrap()
    }

    #[test]
    fn test_first_frame_initialises_at_bootstrap_pose() {
        let mut source = SyntheticDepthSource::new(64, 48, 2);
        let mut pipeline = small_pipeline(&source);
        assert_eq!(pipeline.state(), TrackingState::NotInitialized);

        let frame = source.next_frame(None).unwrap().unwrap();
        let result = pipeline.process_frame(&frame);

        assert_eq!(result.state, TrackingState::Ok);
        assert_eq!(result.pose, source.initial_pose());
        assert!(pipeline.volume().is_some());
        assert!(pipeline.prediction().is_some());
        assert!(result.metrics.predicted_valid > 0);
    }

    #[test]
    fn test_lost_frame_keeps_last_good_pose_and_skips_fusion() {
        // Violent motion: a large pitch per frame rotates every surface
        // normal past the ICP angle threshold and shifts the geometry
        // beyond the distance threshold.
        let mut source = SyntheticDepthSource::new(64, 48, 3).with_motion(
            nalgebra::Vector3::new(0.8, 0.0, 0.0),
            nalgebra::Vector3::x(),
            30.0,
        );
        let mut pipeline = small_pipeline(&source);

        let frame = source.next_frame(None).unwrap().unwrap();
        let first = pipeline.process_frame(&frame);
        assert_eq!(first.state, TrackingState::Ok);
        let weights_before: Vec<f32> = pipeline
            .volume()
            .unwrap()
            .voxels()
            .iter()
            .map(|v| v.weight)
            .collect();

        let frame = source.next_frame(Some(frame)).unwrap().unwrap();
        let second = pipeline.process_frame(&frame);

        assert_eq!(second.state, TrackingState::Lost);
        assert_eq!(second.pose, first.pose);
        assert_eq!(pipeline.state(), TrackingState::Lost);

        // The volume was not touched by the skipped frame.
        let weights_after: Vec<f32> = pipeline
            .volume()
            .unwrap()
            .voxels()
            .iter()
            .map(|v| v.weight)
            .collect();
        assert_eq!(weights_before, weights_after);
    }
}
