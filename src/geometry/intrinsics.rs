//! Calibration matrix handling.

use nalgebra::Matrix3;
use tracing::debug;

/// Lazily maintained K → K⁻¹ cache.
///
/// Stages receive the calibration matrix on every invocation but only
/// need its inverse. The inverse is recomputed exactly when the incoming
/// matrix differs from the last one seen, compared for bitwise float
/// equality rather than within a tolerance: a caller that re-sends the
/// same matrix pays nothing, a caller that changes any entry gets a fresh
/// inverse.
#[derive(Debug, Default)]
pub struct InverseIntrinsics {
    last_k: Option<Matrix3<f32>>,
    k_inv: Matrix3<f32>,
}

impl InverseIntrinsics {
    pub fn new() -> Self {
        Self {
            last_k: None,
            k_inv: Matrix3::identity(),
        }
    }

    /// The inverse of `k`, recomputed only when `k` changed.
    ///
    /// Panics if `k` is singular; a non-invertible calibration matrix is
    /// a caller bug.
    pub fn get(&mut self, k: &Matrix3<f32>) -> &Matrix3<f32> {
        if self.last_k.as_ref() != Some(k) {
            debug!("calibration matrix changed, recomputing inverse");
            self.k_inv = k
                .try_inverse()
                .expect("calibration matrix is not invertible");
            self.last_k = Some(*k);
        }
        &self.k_inv
    }

    #[cfg(test)]
    fn is_cached_for(&self, k: &Matrix3<f32>) -> bool {
        self.last_k.as_ref() == Some(k)
    }
}
