//! Depth frame ingestion: the external-collaborator seam of the pipeline.

pub mod depth;
pub mod synthetic;

pub use depth::{DepthFrame, DepthFrameSource, RawDepthDirectory};
pub use synthetic::SyntheticDepthSource;
