//! Geometry types shared by the pipeline stages: vertex/normal maps,
//! calibration handling, rigid-motion utilities.

pub mod intrinsics;
pub mod map;
pub mod transform;

pub use intrinsics::InverseIntrinsics;
pub use map::{Pixel, VertexNormalMap};
pub use transform::{
    exp_so3, incremental_transform, rigid_inverse, rotation_of, skew, transform_point,
    translation_of,
};
