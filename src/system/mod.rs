//! Pipeline orchestration.
//!
//! This module contains the top-level `FusionPipeline` that drives the
//! four compute stages per frame and carries their buffers across
//! frames.

mod pipeline;

pub use pipeline::{FusionPipeline, PipelineConfig};
