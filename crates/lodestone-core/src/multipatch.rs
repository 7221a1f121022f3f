//! Multi-patch assembly.
//!
//! A solved chunk is the concatenation of per-patch voxel blocks. The
//! assembler splits it back into blocks in concatenation order and writes
//! each into its own image at that image's cursor. The same machinery
//! stacks several calibrations of a single-period acquisition into the
//! color axis of one image.

use ndarray::{s, Array4, ArrayView2};

use crate::error::RecoError;
use crate::source::MeasurementSource;
use crate::streamer::FrameSink;
use crate::types::{Grid, OutputImage, PatchIndexCursor};

/// Destination of one contiguous voxel block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    image: usize,
    color: usize,
    len: usize,
}

/// Splits solved chunks into per-patch images.
#[derive(Debug, Clone)]
pub struct MultiPatchAssembler {
    images: Vec<OutputImage>,
    blocks: Vec<Block>,
    cursors: Vec<PatchIndexCursor>,
}

impl MultiPatchAssembler {
    /// One image per patch; patch `i` contributes the voxels of image `i`'s
    /// grid.
    pub fn patches(images: Vec<OutputImage>) -> Self {
        let blocks = images
            .iter()
            .enumerate()
            .map(|(image, img)| Block {
                image,
                color: 0,
                len: img.grid.voxel_count(),
            })
            .collect();
        let cursors = vec![PatchIndexCursor::new(); images.len()];
        Self { images, blocks, cursors }
    }

    /// One image per patch from a concatenated matrix with the given voxel
    /// counts, which must agree with the images' grids.
    pub fn from_voxel_counts(images: Vec<OutputImage>, voxel_counts: &[usize]) -> Result<Self, RecoError> {
        if images.len() != voxel_counts.len() {
            return Err(RecoError::Configuration(format!(
                "{} voxel counts given for {} patches",
                voxel_counts.len(),
                images.len()
            )));
        }
        for (image, &count) in images.iter().zip(voxel_counts) {
            if image.grid.voxel_count() != count {
                return Err(RecoError::ShapeMismatch {
                    context: "patch voxel count",
                    expected: image.grid.voxel_count(),
                    found: count,
                });
            }
        }
        Ok(Self::patches(images))
    }

    /// A single image whose color `k` receives the `k`-th stacked block.
    pub fn stacked(image: OutputImage) -> Self {
        let len = image.grid.voxel_count();
        let blocks = (0..image.colors())
            .map(|color| Block { image: 0, color, len })
            .collect();
        Self {
            images: vec![image],
            blocks,
            cursors: vec![PatchIndexCursor::new()],
        }
    }

    /// Total voxels a solved chunk must have.
    pub fn voxel_count(&self) -> usize {
        self.blocks.iter().map(|b| b.len).sum()
    }

    pub fn cursors(&self) -> &[PatchIndexCursor] {
        &self.cursors
    }

    pub fn images(&self) -> &[OutputImage] {
        &self.images
    }

    pub fn into_images(self) -> Vec<OutputImage> {
        self.images
    }
}

impl FrameSink for MultiPatchAssembler {
    fn write_chunk(&mut self, solved: ArrayView2<f64>) -> Result<(), RecoError> {
        let expected = self.voxel_count();
        if solved.nrows() != expected {
            return Err(RecoError::ShapeMismatch {
                context: "solved vector vs. summed patch voxels",
                expected,
                found: solved.nrows(),
            });
        }
        let frames = solved.ncols();
        for (image, cursor) in self.images.iter().zip(&self.cursors) {
            if cursor.position() + frames > image.frames() {
                return Err(RecoError::ShapeMismatch {
                    context: "output frames",
                    expected: image.frames(),
                    found: cursor.position() + frames,
                });
            }
        }

        let mut offset = 0;
        for block in &self.blocks {
            let start = self.cursors[block.image].position();
            let columns = solved.slice(s![offset..offset + block.len, ..]);
            self.images[block.image].write_columns(block.color, start, columns);
            offset += block.len;
        }
        // All patches share one frame schedule, so every cursor moves together.
        for cursor in &mut self.cursors {
            cursor.advance(frames);
        }
        Ok(())
    }
}

/// Calibration index per patch.
///
/// Without an explicit mapping: identity when there is one calibration per
/// period, all-zero for a single calibration.
pub fn resolve_mapping(mapping: Option<&[usize]>, calibrations: usize, periods: usize) -> Result<Vec<usize>, RecoError> {
    let mapping = match mapping {
        Some(m) => m.to_vec(),
        None if calibrations == periods => (0..periods).collect(),
        None if calibrations == 1 => vec![0; periods],
        None => {
            return Err(RecoError::Configuration(format!(
                "{} calibrations for {} patches need an explicit mapping",
                calibrations, periods
            )))
        }
    };
    if mapping.len() != periods {
        return Err(RecoError::Configuration(format!(
            "mapping has {} entries for {} patches",
            mapping.len(),
            periods
        )));
    }
    if let Some(bad) = mapping.iter().find(|&&m| m >= calibrations) {
        return Err(RecoError::Configuration(format!(
            "mapping refers to calibration {} but only {} are given",
            bad, calibrations
        )));
    }
    Ok(mapping)
}

/// Focus point per patch: overrides when given, else the measurement's.
pub fn focus_points(measurement: &dyn MeasurementSource, overrides: Option<&[[f64; 3]]>) -> Vec<[f64; 3]> {
    match overrides {
        Some(points) => points.to_vec(),
        None => (0..measurement.periods_per_frame())
            .map(|p| measurement.focus_point(p))
            .collect(),
    }
}

/// Merge patch images into one composite covering the union of their
/// extents, on the first patch's voxel spacing. Overlaps are averaged.
pub fn compose_patches(images: &[OutputImage]) -> Result<OutputImage, RecoError> {
    let first = images
        .first()
        .ok_or_else(|| RecoError::Configuration("no patch images to compose".into()))?;
    let spacing = first.grid.spacing();
    let (colors, frames) = (first.colors(), first.frames());

    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for image in images {
        if image.colors() != colors {
            return Err(RecoError::ShapeMismatch {
                context: "patch image colors",
                expected: colors,
                found: image.colors(),
            });
        }
        if image.frames() != frames {
            return Err(RecoError::ShapeMismatch {
                context: "patch image frames",
                expected: frames,
                found: image.frames(),
            });
        }
        for (axis, [min, max]) in image.grid.extent().into_iter().enumerate() {
            lo[axis] = lo[axis].min(min);
            hi[axis] = hi[axis].max(max);
        }
    }

    let mut shape = [1usize; 3];
    let mut fov = [0.0; 3];
    let mut center = [0.0; 3];
    for axis in 0..3 {
        shape[axis] = (((hi[axis] - lo[axis]) / spacing[axis]).round() as usize).max(1);
        fov[axis] = shape[axis] as f64 * spacing[axis];
        center[axis] = (lo[axis] + hi[axis]) / 2.0;
    }
    let grid = Grid::new(shape, fov, center);
    let origin = grid.origin();

    let mut composite = OutputImage::zeros(grid, colors, frames, first.frame_duration);
    let mut hits = Array4::<f64>::zeros((colors, shape[0], shape[1], shape[2]));
    for image in images {
        let coords = [
            image.grid.axis_values(0),
            image.grid.axis_values(1),
            image.grid.axis_values(2),
        ];
        let target = |axis: usize, value: f64| {
            let index = ((value - origin[axis]) / spacing[axis]).round().max(0.0) as usize;
            index.min(shape[axis] - 1)
        };
        let [nx, ny, nz] = image.grid.shape;
        for ix in 0..nx {
            let tx = target(0, coords[0][ix]);
            for iy in 0..ny {
                let ty = target(1, coords[1][iy]);
                for iz in 0..nz {
                    let tz = target(2, coords[2][iz]);
                    for color in 0..colors {
                        let mut dst = composite.data.slice_mut(s![color, tx, ty, tz, ..]);
                        dst += &image.data.slice(s![color, ix, iy, iz, ..]);
                        hits[[color, tx, ty, tz]] += 1.0;
                    }
                }
            }
        }
    }
    for ((color, x, y, z), &n) in hits.indexed_iter() {
        if n > 1.0 {
            composite.data.slice_mut(s![color, x, y, z, ..]).mapv_inplace(|v| v / n);
        }
    }

    composite.provenance = first.provenance.clone();
    composite
        .provenance
        .insert("patches".into(), serde_json::Value::from(images.len()));
    log::info!("Composed {} patches onto a {:?} grid", images.len(), shape);
    Ok(composite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn image(shape: [usize; 3], center: [f64; 3], frames: usize) -> OutputImage {
        let fov = [shape[0] as f64, shape[1] as f64, shape[2] as f64];
        OutputImage::zeros(Grid::new(shape, fov, center), 1, frames, 0.1)
    }

    #[test]
    fn test_patch_index_fills_each_image_uniformly() {
        let shapes = [[2, 1, 1], [3, 1, 1], [1, 2, 2]];
        let images: Vec<_> = shapes.iter().map(|&s| image(s, [0.0; 3], 3)).collect();
        let counts: Vec<usize> = shapes.iter().map(|s| s.iter().product()).collect();
        let mut assembler = MultiPatchAssembler::from_voxel_counts(images, &counts).unwrap();

        for chunk in [2usize, 1] {
            let column: Vec<f64> = counts
                .iter()
                .enumerate()
                .flat_map(|(i, &k)| std::iter::repeat(i as f64).take(k))
                .collect();
            let solved = Array2::from_shape_fn((column.len(), chunk), |(r, _)| column[r]);
            assembler.write_chunk(solved.view()).unwrap();
        }

        assert!(assembler.cursors().iter().all(|c| c.position() == 3));
        for (i, img) in assembler.into_images().iter().enumerate() {
            assert!(img.data.iter().all(|&v| v == i as f64));
        }
    }

    #[test]
    fn test_wrong_solved_length_is_shape_mismatch() {
        let mut assembler = MultiPatchAssembler::patches(vec![image([2, 1, 1], [0.0; 3], 1)]);
        let solved = Array2::<f64>::zeros((3, 1));
        assert!(matches!(
            assembler.write_chunk(solved.view()),
            Err(RecoError::ShapeMismatch { expected: 2, found: 3, .. })
        ));
    }

    #[test]
    fn test_overflowing_frames_is_shape_mismatch() {
        let mut assembler = MultiPatchAssembler::patches(vec![image([2, 1, 1], [0.0; 3], 1)]);
        let solved = Array2::<f64>::zeros((2, 2));
        assert!(assembler.write_chunk(solved.view()).is_err());
    }

    #[test]
    fn test_stacked_blocks_fill_colors() {
        let grid = Grid::new([2, 1, 1], [2.0, 1.0, 1.0], [0.0; 3]);
        let mut assembler = MultiPatchAssembler::stacked(OutputImage::zeros(grid, 2, 1, 0.1));
        let solved = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assembler.write_chunk(solved.view()).unwrap();
        let img = &assembler.images()[0];
        assert_eq!(img.data[[0, 1, 0, 0, 0]], 2.0);
        assert_eq!(img.data[[1, 0, 0, 0, 0]], 3.0);
    }

    #[test]
    fn test_default_mappings() {
        assert_eq!(resolve_mapping(None, 4, 4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(resolve_mapping(None, 1, 3).unwrap(), vec![0, 0, 0]);
        assert!(resolve_mapping(None, 2, 3).is_err());
        assert!(resolve_mapping(Some(&[0, 2]), 2, 2).is_err());
        assert_eq!(resolve_mapping(Some(&[1, 1, 0]), 2, 3).unwrap(), vec![1, 1, 0]);
    }

    #[test]
    fn test_compose_covers_union_and_averages_overlap() {
        let mut a = image([2, 1, 1], [-0.5, 0.0, 0.0], 1);
        let mut b = image([2, 1, 1], [0.5, 0.0, 0.0], 1);
        a.data.fill(1.0);
        b.data.fill(3.0);
        let composite = compose_patches(&[a, b]).unwrap();
        assert_eq!(composite.grid.shape, [3, 1, 1]);
        let extent = composite.grid.extent();
        assert_relative_eq!(extent[0][0], -1.5, epsilon = 1e-12);
        assert_relative_eq!(extent[0][1], 1.5, epsilon = 1e-12);
        let row: Vec<f64> = (0..3).map(|x| composite.data[[0, x, 0, 0, 0]]).collect();
        assert_eq!(row, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_compose_rejects_mismatched_colors_and_frames() {
        let grid = Grid::new([2, 1, 1], [2.0, 1.0, 1.0], [0.0; 3]);
        let two_colors = OutputImage::zeros(grid, 2, 1, 0.1);
        assert!(matches!(
            compose_patches(&[image([2, 1, 1], [0.0; 3], 1), two_colors]),
            Err(RecoError::ShapeMismatch { context: "patch image colors", expected: 1, found: 2 })
        ));
        assert!(matches!(
            compose_patches(&[image([2, 1, 1], [0.0; 3], 1), image([2, 1, 1], [0.0; 3], 3)]),
            Err(RecoError::ShapeMismatch { context: "patch image frames", expected: 1, found: 3 })
        ));
    }
}
