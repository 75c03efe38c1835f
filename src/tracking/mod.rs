//! Pose estimation: aligns each frame's measured geometry against the
//! predicted geometry raycast from the reconstruction.
//!
//! This module implements the pose estimation stage of the fusion
//! pipeline:
//! - projective (same-pixel-index) correspondence search
//! - point-to-plane ICP refinement over a fixed iteration count
//! - distance and normal-angle outlier rejection
//! - tracking-lost detection when too few correspondences survive

pub mod icp;
pub mod result;
pub mod state;

use std::error::Error;
use std::fmt;

use nalgebra::{Matrix3, Matrix4};

use crate::compute::BufferedValue;
use crate::geometry::VertexNormalMap;

pub use icp::{IcpConfig, IcpPoseEstimation};
pub use result::{FrameMetrics, FrameResult, TimingStats};
pub use state::TrackingState;

/// Produces the camera-to-global pose for each frame.
pub trait PoseEstimationStage {
    /// Refine the retained pose against `predicted` using the live
    /// measurement.
    ///
    /// `predicted` is the previous frame's surface prediction in the
    /// global frame; `None` means no prior estimate exists and the
    /// bootstrap pose is returned unchanged, seeding the reconstruction's
    /// global frame. `prev` may be the pose buffer returned by the
    /// previous call, reused in place.
    ///
    /// On [`TrackingLost`] the stage's retained pose is left untouched,
    /// so the caller can skip the frame and try again.
    fn estimate(
        &mut self,
        live: &VertexNormalMap,
        predicted: Option<&VertexNormalMap>,
        k: &Matrix3<f32>,
        prev: Option<BufferedValue<Matrix4<f32>>>,
    ) -> Result<BufferedValue<Matrix4<f32>>, TrackingLost>;

    /// Correspondences surviving the final refinement iteration of the
    /// most recent successful `estimate` call.
    fn last_match_count(&self) -> usize;
}

/// Permanent construction-time configuration error. A stage that failed
/// construction does not exist; there is nothing to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Zero refinement iterations requested.
    ZeroIterations,
    /// Work-group granularity of zero.
    ZeroGroupSize,
    /// Group size does not evenly divide the frame's pixel count.
    GroupSizeNotDividing { group_size: usize, pixels: usize },
    /// Group size exceeds the frame's pixel count.
    GroupSizeTooLarge { group_size: usize, pixels: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroIterations => write!(f, "zero refinement iterations requested"),
            ConfigError::ZeroGroupSize => write!(f, "group size must be non-zero"),
            ConfigError::GroupSizeNotDividing { group_size, pixels } => write!(
                f,
                "group size {} does not evenly divide the frame size {}",
                group_size, pixels
            ),
            ConfigError::GroupSizeTooLarge { group_size, pixels } => write!(
                f,
                "group size {} exceeds the frame size {}",
                group_size, pixels
            ),
        }
    }
}

impl Error for ConfigError {}

/// Per-call, recoverable alignment failure: the camera moved too far
/// between frames (or the scene changed too much) to track reliably.
///
/// Distinct from [`ConfigError`] so callers can re-seed or skip the frame
/// instead of aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingLost {
    /// Too few correspondences survived outlier rejection.
    TooFewCorrespondences { matched: usize, required: usize },
    /// The normal-equations system was rank deficient (e.g. a single
    /// featureless plane seen head-on).
    DegenerateGeometry { iteration: usize },
}

impl fmt::Display for TrackingLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingLost::TooFewCorrespondences { matched, required } => write!(
                f,
                "tracking lost: {} correspondences survived, {} required",
                matched, required
            ),
            TrackingLost::DegenerateGeometry { iteration } => write!(
                f,
                "tracking lost: degenerate correspondence geometry at iteration {}",
                iteration
            ),
        }
    }
}

impl Error for TrackingLost {}
