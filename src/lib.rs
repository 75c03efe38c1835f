//! Dense rigid depth-camera fusion: a KinectFusion-style per-frame loop.
//!
//! Each depth frame flows through four cooperating stages:
//! measurement (vertex/normal map), pose estimation (point-to-plane ICP
//! against the previous prediction), update reconstruction (TSDF fusion)
//! and surface prediction (volume raycast), with single-owner buffers
//! passed by move between them.

pub mod compute;
pub mod fusion;
pub mod geometry;
pub mod io;
pub mod measurement;
pub mod prediction;
pub mod system;
pub mod tracking;
