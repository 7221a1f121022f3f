//! # Lodestone Core
//!
//! The reconstruction backbone of the Lodestone framework. This crate turns
//! frequency-domain measurements and a measured system matrix into voxel
//! images by solving a regularised linear inverse problem.
//!
//! ## Architecture
//!
//! A reconstruction runs in four stages: the [`conditioner`] selects
//! frequency channels and prepares a solver-ready [`solver::SolverHandle`],
//! [`solver::create_solver`] applies the regularisation once, the
//! [`streamer::FrameStreamer`] solves the measurement chunk by chunk, and the
//! [`multipatch::MultiPatchAssembler`] writes solved blocks into one image
//! per patch. The [`reco`] entry points wire these stages together.
//!
//! Calibration and measurement data are consumed through the
//! [`source::CalibrationSource`] and [`source::MeasurementSource`] traits;
//! the `lodestone-io` crate provides implementations.
//!
//! ## Modules
//!
//! - [`types`] — Grids, frequency selections, output images, cursors.
//! - [`params`] — User options and their resolved, immutable form.
//! - [`source`] — Calibration/measurement collaborator traits.
//! - [`conditioner`] — Frequency filtering, dead pixels, interpolation, factorisation.
//! - [`solver`] — Solve contract, handles, transforms and reference solvers.
//! - [`streamer`] — Chunked frame loop.
//! - [`multipatch`] — Patch splitting, mapping and composition.
//! - [`reco`] — Reconstruction entry points.
//! - [`store`] — Lookup-or-compute storage of previous reconstructions.
//! - [`error`] — Error taxonomy.

pub mod conditioner;
pub mod error;
pub mod multipatch;
pub mod params;
pub mod reco;
pub mod solver;
pub mod source;
pub mod store;
pub mod streamer;
pub mod types;

pub use error::RecoError;
pub use params::{RecoOptions, RecoParams};
pub use reco::{
    reconstruct_arrays, reconstruct_handles, reconstruct_path, reconstruct_paths, reconstruct_request,
    reconstruct_with_selection, RecoRequest,
};
pub use types::{Grid, OutputImage, RecoOutput};
