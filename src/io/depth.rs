//! Depth frame types and the frame-source seam.
//!
//! The pipeline core does not know where depth frames come from; it only
//! sees [`DepthFrame`]s handed in by the caller. Sources implement
//! [`DepthFrameSource`] and follow the same ownership-reuse convention as
//! the stages: the caller may pass the previously returned frame back so
//! its backing store is overwritten instead of reallocated.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// A rectangular array of depth samples in metres.
///
/// Missing measurements are NaN. Zero and negative samples are treated
/// as missing by consumers ([`DepthFrame::is_valid_depth`]).
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    width: usize,
    height: usize,
    depth: Vec<f32>,
}

impl DepthFrame {
    /// Allocate a frame with every sample missing.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            depth: vec![f32::NAN; width * height],
        }
    }

    /// Resize the backing store in place and mark every sample missing.
    pub fn reset(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.depth.clear();
        self.depth.resize(width * height, f32::NAN);
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.depth[y * self.width + x]
    }

    #[inline]
    pub fn at_mut(&mut self, x: usize, y: usize) -> &mut f32 {
        &mut self.depth[y * self.width + x]
    }

    pub fn samples(&self) -> &[f32] {
        &self.depth
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.depth
    }

    /// Whether a sample carries usable geometry.
    #[inline]
    pub fn is_valid_depth(d: f32) -> bool {
        d.is_finite() && d > 0.0
    }
}

/// External collaborator supplying raw depth frames.
pub trait DepthFrameSource {
    /// The next frame, or `None` at end of stream.
    ///
    /// `prev` may be the frame returned by the previous call; its storage
    /// is then reused in place.
    fn next_frame(&mut self, prev: Option<DepthFrame>) -> Result<Option<DepthFrame>>;

    fn width(&self) -> usize;

    fn height(&self) -> usize;
}

/// Reads a directory of raw binary depth frames, sorted by file name.
///
/// Each file holds exactly `width * height` little-endian `u16` samples
/// in millimetres, row-major; zero means missing. This matches the
/// fixed-layout dumps produced by common RGB-D dataset converters.
pub struct RawDepthDirectory {
    files: Vec<PathBuf>,
    cursor: usize,
    width: usize,
    height: usize,
}

impl RawDepthDirectory {
    pub fn new<P: AsRef<Path>>(root: P, width: usize, height: usize) -> Result<Self> {
        let root = root.as_ref();
        let mut files: Vec<PathBuf> = fs::read_dir(root)
            .with_context(|| format!("reading depth directory {}", root.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        if files.is_empty() {
            bail!("depth directory {} contains no frames", root.display());
        }
        debug!(frames = files.len(), "indexed depth directory");

        Ok(Self {
            files,
            cursor: 0,
            width,
            height,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl DepthFrameSource for RawDepthDirectory {
    fn next_frame(&mut self, prev: Option<DepthFrame>) -> Result<Option<DepthFrame>> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;

        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let expected = self.width * self.height * 2;
        if bytes.len() != expected {
            bail!(
                "{}: expected {} bytes for a {}x{} u16 frame, found {}",
                path.display(),
                expected,
                self.width,
                self.height,
                bytes.len()
            );
        }

        let mut frame = match prev {
            Some(mut f) => {
                f.reset(self.width, self.height);
                f
            }
            None => DepthFrame::new(self.width, self.height),
        };

        for (sample, raw) in frame.samples_mut().iter_mut().zip(bytes.chunks_exact(2)) {
            let mm = u16::from_le_bytes([raw[0], raw[1]]);
            *sample = if mm == 0 {
                f32::NAN
            } else {
                f32::from(mm) * 1.0e-3
            };
        }

        Ok(Some(frame))
    }

    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }
}
