//! Procedural depth source: an analytic scene rendered from a moving
//! camera.
//!
//! Stands in for a recorded dataset when none is available; the demo
//! binary and the pipeline integration tests both run against it. The
//! scene is two spheres above a floor plane, sized to sit inside the
//! default 3 m reconstruction volume, with the camera starting at the
//! volume centre looking along +z.

use nalgebra::{Matrix3, Matrix4, Vector3};

use anyhow::Result;

use crate::geometry::{exp_so3, rigid_inverse, rotation_of, translation_of};
use crate::io::{DepthFrame, DepthFrameSource};

/// Scene spheres: (centre, radius), global frame, metres.
const SPHERES: [(Vector3<f32>, f32); 2] = [
    (Vector3::new(1.5, 1.5, 2.45), 0.30),
    (Vector3::new(0.95, 1.3, 2.6), 0.25),
];

/// Floor plane through this point...
const PLANE_POINT: Vector3<f32> = Vector3::new(1.5, 2.0, 2.0);
/// ...with this (upward, toward the camera) normal.
const PLANE_NORMAL: Vector3<f32> = Vector3::new(0.0, -1.0, 0.0);

/// Closest rendered depth; hits nearer than this are discarded.
const NEAR_CLIP: f32 = 0.1;

/// Renders depth frames of the analytic scene along a synthetic camera
/// trajectory with a fixed per-frame motion step.
pub struct SyntheticDepthSource {
    width: usize,
    height: usize,
    k: Matrix3<f32>,
    frames: usize,
    cursor: usize,
    initial_pose: Matrix4<f32>,
    translation_step: Vector3<f32>,
    rotation_axis: Vector3<f32>,
    rotation_step_rad: f32,
}

impl SyntheticDepthSource {
    /// A source of `frames` frames with a gentle default motion
    /// (5 mm and 0.2° about y per frame).
    pub fn new(width: usize, height: usize, frames: usize) -> Self {
        let mut initial_pose = Matrix4::identity();
        initial_pose[(0, 3)] = 1.5;
        initial_pose[(1, 3)] = 1.5;
        initial_pose[(2, 3)] = 1.5;

        Self {
            width,
            height,
            k: Self::default_k(width, height),
            frames,
            cursor: 0,
            initial_pose,
            translation_step: Vector3::new(0.005, 0.0, 0.003),
            rotation_axis: Vector3::y(),
            rotation_step_rad: 0.2f32.to_radians(),
        }
    }

    /// Override the per-frame camera motion: a translation step plus a
    /// rotation step about `rotation_axis` (camera frame).
    pub fn with_motion(
        mut self,
        translation_step: Vector3<f32>,
        rotation_axis: Vector3<f32>,
        rotation_step_deg: f32,
    ) -> Self {
        self.translation_step = translation_step;
        self.rotation_axis = rotation_axis.normalize();
        self.rotation_step_rad = rotation_step_deg.to_radians();
        self
    }

    /// Intrinsics matching the rendered frames.
    pub fn k(&self) -> Matrix3<f32> {
        self.k
    }

    /// The pose frames are rendered from at trajectory index `i`.
    pub fn pose_of_frame(&self, i: usize) -> Matrix4<f32> {
        let angle = (self.rotation_step_rad * i as f32) as f64;
        let rot = exp_so3(&(self.rotation_axis.cast::<f64>() * angle)).cast::<f32>();

        let mut delta = Matrix4::identity();
        delta.fixed_view_mut::<3, 3>(0, 0).copy_from(&rot);
        delta
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&(self.translation_step * i as f32));

        self.initial_pose * delta
    }

    /// The pose the camera starts from; matches the pipeline's default
    /// bootstrap pose.
    pub fn initial_pose(&self) -> Matrix4<f32> {
        self.initial_pose
    }

    /// Unsigned distance from a global-frame point to the nearest scene
    /// surface. Lets consumers check reconstructed geometry against the
    /// analytic ground truth.
    pub fn scene_distance(p: &Vector3<f32>) -> f32 {
        let mut best = f32::INFINITY;
        for (center, radius) in &SPHERES {
            best = best.min(((p - center).norm() - radius).abs());
        }
        best.min(PLANE_NORMAL.dot(&(p - PLANE_POINT)).abs())
    }

    fn default_k(width: usize, height: usize) -> Matrix3<f32> {
        // 585 px focal length at 640x480, scaled with the frame.
        let f = 585.0 * width as f32 / 640.0;
        Matrix3::new(
            f,
            0.0,
            width as f32 / 2.0,
            0.0,
            f,
            height as f32 / 2.0,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Render the scene into `frame` from `pose`.
    pub fn render(&self, pose: &Matrix4<f32>, frame: &mut DepthFrame) {
        frame.reset(self.width, self.height);
        let k_inv = self
            .k
            .try_inverse()
            .expect("synthetic intrinsics are invertible");

        let camera = rigid_inverse(pose);
        let cam_rot = rotation_of(&camera);
        let cam_trans = translation_of(&camera);

        // Scene transformed into the camera frame once per frame.
        let spheres: Vec<(Vector3<f32>, f32)> = SPHERES
            .iter()
            .map(|(c, r)| (cam_rot * c + cam_trans, *r))
            .collect();
        let plane_point = cam_rot * PLANE_POINT + cam_trans;
        let plane_normal = cam_rot * PLANE_NORMAL;

        for y in 0..self.height {
            for x in 0..self.width {
                let dir = k_inv * Vector3::new(x as f32, y as f32, 1.0);
                let mut depth = f32::INFINITY;

                for (center, radius) in &spheres {
                    if let Some(s) = intersect_sphere(&dir, center, *radius) {
                        depth = depth.min(s);
                    }
                }
                if let Some(s) = intersect_plane(&dir, &plane_point, &plane_normal) {
                    depth = depth.min(s);
                }

                if depth.is_finite() && depth > NEAR_CLIP {
                    *frame.at_mut(x, y) = depth;
                }
            }
        }
    }
}

impl DepthFrameSource for SyntheticDepthSource {
    fn next_frame(&mut self, prev: Option<DepthFrame>) -> Result<Option<DepthFrame>> {
        if self.cursor >= self.frames {
            return Ok(None);
        }
        let pose = self.pose_of_frame(self.cursor);
        self.cursor += 1;

        let mut frame = prev.unwrap_or_else(|| DepthFrame::new(self.width, self.height));
        self.render(&pose, &mut frame);
        Ok(Some(frame))
    }

    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }
}

/// Camera-frame ray/sphere intersection. `dir` is the unnormalised pixel
/// ray with `dir.z == 1`, so the returned parameter is the hit's camera
/// z-depth.
fn intersect_sphere(dir: &Vector3<f32>, center: &Vector3<f32>, radius: f32) -> Option<f32> {
    let a = dir.dot(dir);
    let b = -2.0 * dir.dot(center);
    let c = center.dot(center) - radius * radius;
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return None;
    }
    let s = (-b - disc.sqrt()) / (2.0 * a);
    (s > 0.0).then_some(s)
}

/// Camera-frame ray/plane intersection; same parameterisation.
fn intersect_plane(
    dir: &Vector3<f32>,
    plane_point: &Vector3<f32>,
    plane_normal: &Vector3<f32>,
) -> Option<f32> {
    let denom = plane_normal.dot(dir);
    if denom.abs() < 1.0e-9 {
        return None;
    }
    let s = plane_normal.dot(plane_point) / denom;
    (s > 0.0).then_some(s)
}
