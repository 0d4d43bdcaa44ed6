//! Adapter for transforms operating on paired intensity/weights buffers
//!
//! Most concrete transforms in this crate share one shape: they consume the
//! `"INTENSITY"` and `"WEIGHTS"` ring buffers created by the stream source,
//! and process one chunk of both at a time. [`WiStage`] adapts a
//! [`WiKernel`] (the per-chunk hook over the two open windows) into a
//! [`ChunkedKernel`] for the core harness.

use std::sync::Arc;

use serde_json::Value;

use rf_pipelines_core::chunked::ChunkedKernel;
use rf_pipelines_core::ring_buffer::{AccessMode, AccessWindow, Pos, RingBuffer, RingBufferDict};
use rf_pipelines_core::stage::{AttrMap, StageCore};
use rf_pipelines_core::{ChunkedStage, Error, PipelineObject, Result};

/// Ring-buffer key of the intensity stream.
pub const INTENSITY: &str = "INTENSITY";

/// Ring-buffer key of the weights stream.
pub const WEIGHTS: &str = "WEIGHTS";

/// One chunk of the paired streams, presented as two open access windows.
pub struct WiChunk<'a> {
    /// Intensity window (read/write).
    pub intensity: &'a mut AccessWindow,
    /// Weights window (read/write).
    pub weights: &'a mut AccessWindow,
    /// Number of frequency channels.
    pub nfreq: i64,
    /// Stored samples per channel row in this chunk.
    pub nt: i64,
    /// First position of the chunk (undecimated).
    pub pos: Pos,
    /// Downsampling factor of both streams.
    pub nds: i64,
}

/// Per-chunk capability for intensity/weights transforms.
pub trait WiKernel: Send {
    /// Called at bind time with the stream's channel count.
    fn set_nfreq(&mut self, nfreq: i64) -> Result<()> {
        let _ = nfreq;
        Ok(())
    }

    /// Per-run initialization; attributes inserted by upstream stages are
    /// visible here.
    fn start_wi(&mut self, attrs: &mut AttrMap) -> Result<()> {
        let _ = attrs;
        Ok(())
    }

    /// Process one chunk. Returning `false` signals end-of-stream.
    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool>;

    /// Per-run teardown; merge results into the attribute document.
    fn end_wi(&mut self, attrs: &mut AttrMap) -> Result<()> {
        let _ = attrs;
        Ok(())
    }

    /// Emit the stage's configuration document.
    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        let _ = nt_chunk;
        Err(Error::Stage("jsonize() not implemented".into()))
    }
}

/// [`ChunkedKernel`] adapter binding the paired streams for a [`WiKernel`].
pub struct WiStage {
    kernel: Box<dyn WiKernel>,
    rb_intensity: Option<Arc<RingBuffer>>,
    rb_weights: Option<Arc<RingBuffer>>,
    nfreq: i64,
    nds: i64,
}

impl WiStage {
    /// Wrap a kernel; the buffers are looked up at bind time.
    pub fn new(kernel: Box<dyn WiKernel>) -> Self {
        Self {
            kernel,
            rb_intensity: None,
            rb_weights: None,
            nfreq: 0,
            nds: 0,
        }
    }
}

impl ChunkedKernel for WiStage {
    fn bind_chunked(
        &mut self,
        core: &mut StageCore,
        rb_dict: &mut RingBufferDict,
        _attrs: &mut AttrMap,
    ) -> Result<()> {
        let ri = core.get_buffer(rb_dict, INTENSITY)?;
        let rw = core.get_buffer(rb_dict, WEIGHTS)?;

        if ri.cdims() != rw.cdims() || ri.nds() != rw.nds() {
            return Err(core.error("intensity and weights ring buffers have mismatched shapes"));
        }
        if ri.cdims().len() != 1 {
            return Err(core.error("expected 2-d (nfreq, nt) intensity/weights streams"));
        }

        self.nfreq = ri.csize();
        self.nds = ri.nds();
        self.kernel.set_nfreq(self.nfreq)?;

        self.rb_intensity = Some(ri);
        self.rb_weights = Some(rw);
        Ok(())
    }

    fn start_chunked(&mut self, _core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        self.kernel.start_wi(attrs)
    }

    fn process_chunk(&mut self, _core: &mut StageCore, pos: Pos, nt_chunk: Pos) -> Result<bool> {
        let ri = self.rb_intensity.as_ref().expect("process_chunk() before bind()");
        let rw = self.rb_weights.as_ref().expect("process_chunk() before bind()");

        let mut iw = ri.get(pos, pos + nt_chunk, AccessMode::ReadWrite);
        let mut ww = rw.get(pos, pos + nt_chunk, AccessMode::ReadWrite);
        let nt = iw.nt();

        let mut chunk = WiChunk {
            intensity: &mut iw,
            weights: &mut ww,
            nfreq: self.nfreq,
            nt,
            pos,
            nds: self.nds,
        };
        let alive = self.kernel.process(&mut chunk)?;

        iw.put();
        ww.put();
        Ok(alive)
    }

    fn end_chunked(&mut self, _core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        self.kernel.end_wi(attrs)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        self.kernel.jsonize(nt_chunk)
    }
}

/// Wrap a [`WiKernel`] into a ready-to-compose stage.
pub fn wi_stage(class_name: &str, name: &str, kernel: Box<dyn WiKernel>, nt_chunk: Pos) -> PipelineObject {
    PipelineObject::new(
        class_name,
        name,
        Box::new(ChunkedStage::new(Box::new(WiStage::new(kernel)), nt_chunk, false)),
    )
}
