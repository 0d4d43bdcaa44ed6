//! Core runtime for streaming intensity/weights pipelines
//!
//! This crate provides the runtime that drives a directed pipeline of
//! stages over time-ordered, frequency-channelized sample streams:
//!
//! - [`RingBuffer`]: a fixed-capacity wrap-around sample store with
//!   downsampled placement, paired `get`/`put` access windows, and
//!   on-demand mirroring so wrap-straddling windows appear contiguous.
//! - [`PipelineObject`]: the stage driver implementing the
//!   construct → bind → allocate → run (start, advance*, end) → deallocate
//!   lifecycle, with chunk-size and lag negotiation across composed stages.
//! - [`ChunkedStage`]: the harness converting the variable-granularity
//!   input stream into fixed-size chunk callbacks.
//! - [`Pipeline`]: the composite stage chaining children together.
//!
//! Concrete transforms live in the companion `rf-pipelines-transforms`
//! crate; this crate only defines the seams they implement.

#![warn(missing_docs)]

pub mod chunked;
pub mod container;
pub mod error;
pub mod outdir;
pub mod pipeline_object;
pub mod registry;
pub mod ring_buffer;
pub mod stage;
mod utils;

pub use chunked::{ChunkedKernel, ChunkedStage};
pub use container::Pipeline;
pub use error::{Error, Result};
pub use outdir::OutdirManager;
pub use pipeline_object::PipelineObject;
pub use ring_buffer::{AccessMode, AccessWindow, Pos, RingBuffer, RingBufferDict};
pub use stage::{AttrMap, Stage, StageCore};
