//! Core types shared across the Lodestone framework.
//!
//! This module defines the data structures that flow through the
//! reconstruction pipeline: voxel grids, frequency-channel selections,
//! output images and the per-patch write cursors.

use std::collections::BTreeMap;

use ndarray::{s, Array5, ArrayView2};
use serde::{Deserialize, Serialize};

/// A regular voxel lattice.
///
/// The lattice is described by its voxel counts, its physical field of view
/// (metres) and the position of its centre. Voxel centres sit half a spacing
/// inside the field-of-view boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    /// Voxel counts along x, y, z.
    pub shape: [usize; 3],
    /// Field of view along x, y, z (metres).
    pub fov: [f64; 3],
    /// Centre of the field of view (metres).
    pub center: [f64; 3],
}

impl Grid {
    pub fn new(shape: [usize; 3], fov: [f64; 3], center: [f64; 3]) -> Self {
        Self { shape, fov, center }
    }

    /// Total number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Voxel spacing along each axis.
    pub fn spacing(&self) -> [f64; 3] {
        [
            self.fov[0] / self.shape[0] as f64,
            self.fov[1] / self.shape[1] as f64,
            self.fov[2] / self.shape[2] as f64,
        ]
    }

    /// Position of the centre of voxel (0, 0, 0).
    pub fn origin(&self) -> [f64; 3] {
        let spacing = self.spacing();
        [
            self.center[0] - self.fov[0] / 2.0 + spacing[0] / 2.0,
            self.center[1] - self.fov[1] / 2.0 + spacing[1] / 2.0,
            self.center[2] - self.fov[2] / 2.0 + spacing[2] / 2.0,
        ]
    }

    /// Voxel-centre coordinates along one axis (0 = x, 1 = y, 2 = z).
    pub fn axis_values(&self, axis: usize) -> Vec<f64> {
        let origin = self.origin()[axis];
        let spacing = self.spacing()[axis];
        (0..self.shape[axis])
            .map(|i| origin + spacing * i as f64)
            .collect()
    }

    /// Physical extent `[min, max]` of the field of view along each axis.
    pub fn extent(&self) -> [[f64; 2]; 3] {
        let mut extent = [[0.0; 2]; 3];
        for axis in 0..3 {
            extent[axis] = [
                self.center[axis] - self.fov[axis] / 2.0,
                self.center[axis] + self.fov[axis] / 2.0,
            ];
        }
        extent
    }

    /// Linear voxel index, x fastest.
    pub fn linear_index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        ix + self.shape[0] * (iy + self.shape[1] * iz)
    }

    /// Inverse of [`Grid::linear_index`].
    pub fn cartesian_index(&self, index: usize) -> [usize; 3] {
        let nx = self.shape[0];
        let ny = self.shape[1];
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    /// Structural comparison: equal shapes, and spacing and centre equal
    /// within a relative tolerance of 1e-12.
    pub fn same_lattice(&self, other: &Grid) -> bool {
        if self.shape != other.shape {
            return false;
        }
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1e-300);
        let (sa, sb) = (self.spacing(), other.spacing());
        (0..3).all(|i| close(sa[i], sb[i]) && close(self.center[i], other.center[i]))
    }

    /// The same lattice shifted by `offset`.
    pub fn translated(&self, offset: [f64; 3]) -> Grid {
        Grid {
            shape: self.shape,
            fov: self.fov,
            center: [
                self.center[0] + offset[0],
                self.center[1] + offset[1],
                self.center[2] + offset[2],
            ],
        }
    }
}

/// One frequency channel: a frequency bin recorded on a receive channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelIndex {
    /// Receive channel.
    pub receiver: usize,
    /// Frequency bin within the receive channel.
    pub bin: usize,
}

impl ChannelIndex {
    pub fn new(receiver: usize, bin: usize) -> Self {
        Self { receiver, bin }
    }

    /// Receiver-major linear index, `bin + bins * receiver`.
    pub fn linear(&self, bins: usize) -> usize {
        self.bin + bins * self.receiver
    }
}

/// An ordered, deduplicated set of frequency channels.
///
/// The derived ordering of [`ChannelIndex`] is receiver-major, which matches
/// the linear channel order used by the sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencySelection {
    channels: Vec<ChannelIndex>,
}

impl FrequencySelection {
    pub fn new(mut channels: Vec<ChannelIndex>) -> Self {
        channels.sort_unstable();
        channels.dedup();
        Self { channels }
    }

    pub fn channels(&self) -> &[ChannelIndex] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, channel: &ChannelIndex) -> bool {
        self.channels.binary_search(channel).is_ok()
    }

    /// Channels present in both selections.
    pub fn intersect(&self, other: &FrequencySelection) -> FrequencySelection {
        FrequencySelection {
            channels: self
                .channels
                .iter()
                .filter(|c| other.contains(c))
                .copied()
                .collect(),
        }
    }

    /// Keep only the channels satisfying `keep`.
    pub fn retain(&self, mut keep: impl FnMut(&ChannelIndex) -> bool) -> FrequencySelection {
        FrequencySelection {
            channels: self.channels.iter().filter(|c| keep(c)).copied().collect(),
        }
    }
}

/// Axis names of every [`OutputImage`], in storage order.
pub const AXIS_NAMES: [&str; 5] = ["color", "x", "y", "z", "time"];

/// A reconstructed image.
///
/// The voxel data is stored as a 5-D array indexed by
/// `(color, x, y, z, time)`. The shape is fixed at construction so the
/// frame loop never reallocates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputImage {
    /// Voxel intensities, shape `(colors, nx, ny, nz, frames)`.
    pub data: Array5<f64>,
    /// Lattice the voxels live on.
    pub grid: Grid,
    /// Time between consecutive frames (seconds).
    pub frame_duration: f64,
    /// Free-form provenance entries (resolved parameters, inputs, solver).
    pub provenance: BTreeMap<String, serde_json::Value>,
}

impl OutputImage {
    /// Allocate a zero image with its final shape.
    pub fn zeros(grid: Grid, colors: usize, frames: usize, frame_duration: f64) -> Self {
        let [nx, ny, nz] = grid.shape;
        Self {
            data: Array5::zeros((colors, nx, ny, nz, frames)),
            grid,
            frame_duration,
            provenance: BTreeMap::new(),
        }
    }

    pub fn axis_names(&self) -> [&'static str; 5] {
        AXIS_NAMES
    }

    pub fn colors(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn frames(&self) -> usize {
        self.data.shape()[4]
    }

    /// Axis coordinates: color index, voxel centres along x/y/z, or frame
    /// start times.
    pub fn axis_values(&self, name: &str) -> Option<Vec<f64>> {
        match name {
            "color" => Some((0..self.colors()).map(|c| c as f64).collect()),
            "x" => Some(self.grid.axis_values(0)),
            "y" => Some(self.grid.axis_values(1)),
            "z" => Some(self.grid.axis_values(2)),
            "time" => Some(
                (0..self.frames())
                    .map(|t| t as f64 * self.frame_duration)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Write solved voxel columns into one color plane starting at frame
    /// `start`. `columns` has shape `(voxels, n)`.
    pub(crate) fn write_columns(&mut self, color: usize, start: usize, columns: ArrayView2<f64>) {
        let grid = self.grid.clone();
        for (offset, column) in columns.columns().into_iter().enumerate() {
            let mut frame = self.data.slice_mut(s![color, .., .., .., start + offset]);
            for (voxel, value) in column.iter().enumerate() {
                let [ix, iy, iz] = grid.cartesian_index(voxel);
                frame[[ix, iy, iz]] = *value;
            }
        }
    }
}

/// Per-patch running write offset into an image's time axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchIndexCursor {
    position: usize,
}

impl PatchIndexCursor {
    pub fn new() -> Self {
        Self { position: 0 }
    }

    /// Next writable time slot.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn advance(&mut self, frames: usize) {
        self.position += frames;
    }
}

/// Result of a reconstruction: one image, or one image per patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecoOutput {
    Single(OutputImage),
    Patches(Vec<OutputImage>),
}

impl RecoOutput {
    /// All images, in patch order.
    pub fn images(&self) -> Vec<&OutputImage> {
        match self {
            RecoOutput::Single(image) => vec![image],
            RecoOutput::Patches(images) => images.iter().collect(),
        }
    }

    pub fn into_images(self) -> Vec<OutputImage> {
        match self {
            RecoOutput::Single(image) => vec![image],
            RecoOutput::Patches(images) => images,
        }
    }
}
