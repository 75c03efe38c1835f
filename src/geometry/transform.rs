//! Rigid-motion utilities for pose refinement.
//!
//! Poses are 4×4 matrices (rotation + translation, bottom row
//! `[0, 0, 0, 1]`) mapping camera-frame coordinates into the global
//! reconstruction frame. The refinement loop solves for a 6-parameter
//! increment `ξ = (ω, t)` and composes `T ← exp(ξ) · T`.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector6};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map of SO(3): the rotation matrix for axis-angle `ω`.
///
/// ```text
/// exp(ω) = I + sin|ω|/|ω| [ω]× + (1 - cos|ω|)/|ω|² [ω]×²
/// ```
///
/// For small angles (|ω| < ε) the first-order form `I + [ω]×` is used.
/// Returning an exact rotation here keeps the composed pose rigid across
/// refinement iterations; composing the linearized `I + [ω]×` directly
/// would accumulate scale error.
pub fn exp_so3(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + skew(omega);
    }

    let skew_omega = skew(omega);
    let skew_omega_sq = skew_omega * skew_omega;

    Matrix3::identity()
        + (theta.sin() / theta) * skew_omega
        + ((1.0 - theta.cos()) / (theta * theta)) * skew_omega_sq
}

/// The rigid transform for an increment `ξ = (ω_x, ω_y, ω_z, t_x, t_y, t_z)`.
pub fn incremental_transform(xi: &Vector6<f64>) -> Matrix4<f32> {
    let omega = Vector3::new(xi[0], xi[1], xi[2]);
    let rot = exp_so3(&omega);

    let mut t = Matrix4::<f32>::identity();
    for r in 0..3 {
        for c in 0..3 {
            t[(r, c)] = rot[(r, c)] as f32;
        }
        t[(r, 3)] = xi[3 + r] as f32;
    }
    t
}

/// The upper-left 3×3 rotation block of a pose.
#[inline]
pub fn rotation_of(pose: &Matrix4<f32>) -> Matrix3<f32> {
    pose.fixed_view::<3, 3>(0, 0).into_owned()
}

/// The translation column of a pose.
#[inline]
pub fn translation_of(pose: &Matrix4<f32>) -> Vector3<f32> {
    pose.fixed_view::<3, 1>(0, 3).into_owned()
}

/// The inverse of a rigid transform, via `(R, t)⁻¹ = (Rᵀ, -Rᵀ t)`.
pub fn rigid_inverse(pose: &Matrix4<f32>) -> Matrix4<f32> {
    let rot_t = rotation_of(pose).transpose();
    let t = translation_of(pose);

    let mut inv = Matrix4::identity();
    inv.fixed_view_mut::<3, 3>(0, 0).copy_from(&rot_t);
    inv.fixed_view_mut::<3, 1>(0, 3).copy_from(&(-rot_t * t));
    inv
}

/// Apply a pose to a 3D point (rotation + translation).
#[inline]
pub fn transform_point(pose: &Matrix4<f32>, p: &Vector3<f32>) -> Vector3<f32> {
    rotation_of(pose) * p + translation_of(pose)
}
