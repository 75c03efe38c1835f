//! Dense vertex/normal maps.
//!
//! A map is the unit of data flowing between the pipeline stages: one
//! [`Pixel`] per sensor pixel, row-major, length exactly `width * height`.
//! Measurement produces maps in the camera frame; surface prediction
//! produces them in the global frame. Invalid measurements are carried as
//! NaN so they propagate through any arithmetic that touches them.

use nalgebra::Vector3;

/// One map entry: a 3D position and its unit surface normal.
///
/// A pixel with no valid geometry holds NaN in both fields. A valid
/// pixel's normal is finite, non-zero and unit length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pixel {
    pub vertex: Vector3<f32>,
    pub normal: Vector3<f32>,
}

impl Pixel {
    /// The invalid-measurement marker.
    pub fn invalid() -> Self {
        Self {
            vertex: Vector3::repeat(f32::NAN),
            normal: Vector3::repeat(f32::NAN),
        }
    }

    pub fn has_vertex(&self) -> bool {
        self.vertex.iter().all(|c| c.is_finite())
    }

    pub fn has_normal(&self) -> bool {
        self.normal.iter().all(|c| c.is_finite())
    }

    /// Both vertex and normal are finite.
    pub fn is_valid(&self) -> bool {
        self.has_vertex() && self.has_normal()
    }
}

/// A dense `width * height` grid of [`Pixel`]s, indexed `y * width + x`.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexNormalMap {
    width: usize,
    height: usize,
    pixels: Vec<Pixel>,
}

impl VertexNormalMap {
    /// Allocate a map with every pixel marked invalid.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![Pixel::invalid(); width * height],
        }
    }

    /// Resize the backing store in place, invalidating every pixel.
    ///
    /// Producing stages call this on a reused map before overwriting it,
    /// so a buffer returned by the caller never leaks stale geometry.
    pub fn reset(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width * height, Pixel::invalid());
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> &Pixel {
        &self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn at_mut(&mut self, x: usize, y: usize) -> &mut Pixel {
        &mut self.pixels[y * self.width + x]
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Pixel] {
        &mut self.pixels
    }

    /// Number of pixels with both vertex and normal valid.
    pub fn valid_count(&self) -> usize {
        self.pixels.iter().filter(|p| p.is_valid()).count()
    }
}
