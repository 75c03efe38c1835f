//! Per-frame results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state (OK / LOST / etc.)
//! - the estimated camera-to-global pose
//! - correspondence counts
//! - timing information for profiling

use nalgebra::Matrix4;

use crate::tracking::TrackingState;

/// Summary of one processed frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub state: TrackingState,
    /// The authoritative T_gk for the frame. On a lost frame this is the
    /// last good pose.
    pub pose: Matrix4<f32>,
    pub metrics: FrameMetrics,
    pub timing: TimingStats,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMetrics {
    /// Valid pixels in the measured map.
    pub measured_valid: usize,
    /// Valid pixels in the surface prediction fed to the next frame.
    pub predicted_valid: usize,
    /// Correspondences surviving the final ICP iteration.
    pub matched_correspondences: usize,
    /// Translation delta against the previous frame's pose.
    pub delta_translation_m: f32,
    /// Rotation delta against the previous frame's pose.
    pub delta_rotation_deg: f32,
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Copy)]
pub struct TimingStats {
    pub total_ms: f64,
    pub measurement_ms: f64,
    pub pose_ms: f64,
    pub fusion_ms: f64,
    pub prediction_ms: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self {
            total_ms: 0.0,
            measurement_ms: 0.0,
            pose_ms: 0.0,
            fusion_ms: 0.0,
            prediction_ms: 0.0,
        }
    }
}
