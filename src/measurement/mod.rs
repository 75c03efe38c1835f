//! Measurement stage: raw depth frame → smoothed vertex/normal map.
//!
//! Three kernels run per frame, in order: an edge-preserving bilateral
//! filter over the raw depth, back-projection of the filtered depth
//! through K⁻¹ into camera-frame vertices, and normal estimation from
//! cross products of neighbouring vertices. Missing depth propagates to
//! NaN vertices and normals.

use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use crate::compute::{BufferedValue, CommandQueue};
use crate::geometry::{InverseIntrinsics, Pixel, VertexNormalMap};
use crate::io::DepthFrame;

/// Degenerate cross products below this squared norm yield no normal.
const MIN_NORMAL_NORM_SQ: f32 = 1.0e-12;

/// Converts one raw depth frame into a camera-frame vertex/normal map.
pub trait MeasurementStage {
    /// Produce the map for `frame`.
    ///
    /// `prev` may be a map previously returned by this stage; its backing
    /// store is then overwritten in place instead of reallocated. Output
    /// values are identical either way.
    fn measure(
        &mut self,
        frame: &DepthFrame,
        k: &Matrix3<f32>,
        prev: Option<BufferedValue<VertexNormalMap>>,
    ) -> BufferedValue<VertexNormalMap>;
}

/// Bilateral-filtering CPU measurement stage.
pub struct BilateralMeasurement {
    queue: Arc<CommandQueue>,
    window: usize,
    inv_sigma_s_sq: f32,
    inv_sigma_r_sq: f32,
    k_inv: InverseIntrinsics,
    /// Filtered-depth scratch buffer, reused across frames.
    filtered: Vec<f32>,
}

impl BilateralMeasurement {
    /// `window` is the full filter window in pixels; `sigma_s` and
    /// `sigma_r` are the spatial and range smoothing coefficients.
    pub fn new(queue: Arc<CommandQueue>, window: usize, sigma_s: f32, sigma_r: f32) -> Self {
        Self {
            queue,
            window,
            inv_sigma_s_sq: 1.0 / (sigma_s * sigma_s),
            inv_sigma_r_sq: 1.0 / (sigma_r * sigma_r),
            k_inv: InverseIntrinsics::new(),
            filtered: Vec::new(),
        }
    }
}

impl MeasurementStage for BilateralMeasurement {
    fn measure(
        &mut self,
        frame: &DepthFrame,
        k: &Matrix3<f32>,
        prev: Option<BufferedValue<VertexNormalMap>>,
    ) -> BufferedValue<VertexNormalMap> {
        let width = frame.width();
        let height = frame.height();

        self.filtered.clear();
        self.filtered.resize(width * height, f32::NAN);

        let window = self.window;
        let inv_ss = self.inv_sigma_s_sq;
        let inv_sr = self.inv_sigma_r_sq;
        {
            let filtered = &mut self.filtered;
            self.queue.enqueue("bilateral_filter", || {
                bilateral_filter(frame, window, inv_ss, inv_sr, filtered);
            });
        }

        let mut out = match prev {
            Some(mut buf) => {
                buf.get_mut(&self.queue).reset(width, height);
                buf
            }
            None => BufferedValue::new(&self.queue, VertexNormalMap::new(width, height)),
        };

        // K⁻¹ is recomputed only when K differs from the last one seen.
        let k_inv = *self.k_inv.get(k);
        {
            let filtered = &self.filtered;
            let map = out.get_mut(&self.queue);
            self.queue.enqueue("vertex_map", || {
                vertex_map(filtered, width, &k_inv, map);
            });
        }
        {
            let map = out.get_mut(&self.queue);
            self.queue.enqueue("normal_map", || {
                normal_map(map);
            });
        }

        out
    }
}

fn bilateral_filter(
    frame: &DepthFrame,
    window: usize,
    inv_sigma_s_sq: f32,
    inv_sigma_r_sq: f32,
    out: &mut [f32],
) {
    let width = frame.width();
    let height = frame.height();
    let radius = (window / 2) as isize;

    out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, slot) in row.iter_mut().enumerate() {
            let center = frame.at(x, y);
            if !DepthFrame::is_valid_depth(center) {
                *slot = f32::NAN;
                continue;
            }

            let mut sum = 0.0f32;
            let mut weight_sum = 0.0f32;
            for dy in -radius..=radius {
                let ny = y as isize + dy;
                if ny < 0 || ny >= height as isize {
                    continue;
                }
                for dx in -radius..=radius {
                    let nx = x as isize + dx;
                    if nx < 0 || nx >= width as isize {
                        continue;
                    }
                    let d = frame.at(nx as usize, ny as usize);
                    if !DepthFrame::is_valid_depth(d) {
                        continue;
                    }
                    let spatial = (dx * dx + dy * dy) as f32;
                    let range = (d - center) * (d - center);
                    let w = (-spatial * inv_sigma_s_sq - range * inv_sigma_r_sq).exp();
                    sum += w * d;
                    weight_sum += w;
                }
            }
            // The centre sample always contributes weight 1.
            *slot = sum / weight_sum;
        }
    });
}

fn vertex_map(filtered: &[f32], width: usize, k_inv: &Matrix3<f32>, map: &mut VertexNormalMap) {
    map.pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, pixel) in row.iter_mut().enumerate() {
                let d = filtered[y * width + x];
                if !DepthFrame::is_valid_depth(d) {
                    *pixel = Pixel::invalid();
                    continue;
                }
                let dir = k_inv * Vector3::new(x as f32, y as f32, 1.0);
                pixel.vertex = dir * d;
            }
        });
}

fn normal_map(map: &mut VertexNormalMap) {
    let width = map.width();
    let height = map.height();
    let vertices: Vec<Vector3<f32>> = map.pixels().iter().map(|p| p.vertex).collect();

    map.pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, pixel) in row.iter_mut().enumerate() {
                if x + 1 >= width || y + 1 >= height {
                    pixel.normal = Vector3::repeat(f32::NAN);
                    continue;
                }
                let v = vertices[y * width + x];
                let right = vertices[y * width + x + 1];
                let below = vertices[(y + 1) * width + x];
                if !(v.iter().all(|c| c.is_finite())
                    && right.iter().all(|c| c.is_finite())
                    && below.iter().all(|c| c.is_finite()))
                {
                    pixel.normal = Vector3::repeat(f32::NAN);
                    continue;
                }

                let n = (right - v).cross(&(below - v));
                if n.norm_squared() < MIN_NORMAL_NORM_SQ {
                    pixel.normal = Vector3::repeat(f32::NAN);
                    continue;
                }
                let mut n = n.normalize();
                // Orient toward the camera at the origin.
                if n.dot(&v) > 0.0 {
                    n = -n;
                }
                pixel.normal = n;
            }
        });
}
