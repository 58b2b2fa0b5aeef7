//! Windowed correction of long sequencing reads.
//!
//! A target read and the overlaps aligned against it are partitioned into
//! fixed-width windows; each window's multi-sequence-alignment features
//! either decode trivially or run through a neural backend in batches, and
//! the per-window consensus strings are stitched back into corrected
//! sequences. The stages run as parallel worker pools joined by bounded
//! queues; see [`pipeline::CorrectionPipeline`].

pub mod consensus;
pub mod features;
pub mod inference;
pub mod io;
pub mod model;
pub mod overlaps;
pub mod pipeline;
pub mod queue;
pub mod windows;

pub use consensus::CorrectedRead;
pub use model::{Device, InferenceBackend, InferenceBatch, ModelConfig, ModelDir};
pub use overlaps::{CigarOp, CorrectionAlignments, Overlap};
pub use pipeline::{CorrectionOptions, CorrectionPipeline, PipelineStats};
