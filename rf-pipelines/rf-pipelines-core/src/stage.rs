//! Stage capability interface and shared per-stage state
//!
//! The driver type [`PipelineObject`](crate::pipeline_object::PipelineObject)
//! owns a [`StageCore`] (the state every stage carries: bound chunk
//! parameters, position counters, ring-buffer lists, output handles) plus a
//! boxed [`Stage`], the capability interface a concrete stage implements.
//! The non-virtual outer half of each lifecycle operation lives on the
//! driver; the `*_inner` hooks here are the customization points.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::outdir::OutdirManager;
use crate::ring_buffer::{Pos, RingBuffer, RingBufferDict};

/// Attribute document threaded through `start_pipeline`/`end_pipeline`.
pub type AttrMap = serde_json::Map<String, Value>;

/// Read a required unsigned integer attribute.
pub fn u64_attr(attrs: &AttrMap, key: &str) -> Result<u64> {
    attrs
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Stage(format!("expected unsigned integer attribute '{}'", key)))
}

/// Read a required signed integer attribute.
pub fn i64_attr(attrs: &AttrMap, key: &str) -> Result<i64> {
    attrs
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Stage(format!("expected integer attribute '{}'", key)))
}

/// Capability interface implemented by every concrete stage.
///
/// All hooks receive the stage's [`StageCore`]; the driver enforces the
/// pre- and postconditions around them.
pub trait Stage: Send {
    /// Chunk size used to seed a standalone bind. Greater than zero only
    /// for stages that can be first in a pipeline.
    fn preferred_chunk_size(&self) -> Result<Pos> {
        Ok(0)
    }

    /// Look up or create ring buffers and initialize `nt_chunk_out`,
    /// `nt_contig` and `nt_maxgap` on the core.
    fn bind_inner(
        &mut self,
        core: &mut StageCore,
        rb_dict: &mut RingBufferDict,
        attrs: &mut AttrMap,
    ) -> Result<()>;

    /// Revert any binding-time state; the driver clears the core itself.
    fn unbind_inner(&mut self, core: &mut StageCore) {
        let _ = core;
    }

    /// Allocate stage-private resources (ring buffers are handled by the
    /// driver).
    fn allocate_inner(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release stage-private resources.
    fn deallocate_inner(&mut self) {}

    /// Per-run initialization. Attributes inserted here are visible to all
    /// later stages in the same composition.
    fn start_inner(&mut self, core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        let _ = (core, attrs);
        Ok(())
    }

    /// Consume available input below `pos_hi`, advancing `pos_lo`. Returns
    /// the end-of-stream position, or `i64::MAX` while live.
    fn advance_inner(&mut self, core: &mut StageCore) -> Result<Pos>;

    /// Per-run teardown; merge results into the attribute document.
    fn end_inner(&mut self, core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        let _ = (core, attrs);
        Ok(())
    }

    /// Emit the stage's configuration document (shape matches the factory
    /// registered for its class name).
    fn jsonize(&self) -> Result<Value> {
        Err(Error::Stage("jsonize() not implemented".into()))
    }
}

/// One declared plot group: a sequence of contiguous plot files sharing a
/// time-per-pixel scale and height.
#[derive(Debug)]
pub(crate) struct PlotGroup {
    pub name: String,
    pub nt_per_pix: i64,
    pub ny: i64,
    pub is_empty: bool,
    pub curr_it0: i64,
    pub curr_it1: i64,
    pub files: Vec<Value>,
}

impl PlotGroup {
    pub(crate) fn attrs(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "nt_per_pix": self.nt_per_pix,
            "ny": self.ny,
            "it0": self.curr_it0,
            "it1": self.curr_it1,
            "files": self.files,
        })
    }
}

/// State shared by every stage: identity, bound chunk parameters, position
/// counters, ring-buffer references, and per-run output handles.
#[derive(Debug)]
pub struct StageCore {
    pub(crate) name: String,
    pub(crate) class_name: String,

    pub(crate) nt_chunk_in: Pos,
    pub(crate) nt_maxlag: Pos,
    pub(crate) nt_chunk_out: Pos,
    pub(crate) nt_contig: Pos,
    pub(crate) nt_maxgap: Pos,

    pub(crate) pos_lo: Pos,
    pub(crate) pos_hi: Pos,
    pub(crate) pos_max: Pos,

    pub(crate) all_ring_buffers: Vec<Arc<RingBuffer>>,
    pub(crate) new_ring_buffers: Vec<Arc<RingBuffer>>,

    pub(crate) out_mp: Option<Arc<OutdirManager>>,
    pub(crate) plot_groups: Vec<PlotGroup>,
    pub(crate) time_spent_in_transform: Duration,
}

impl StageCore {
    pub(crate) fn new(class_name: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            class_name: class_name.to_string(),
            nt_chunk_in: 0,
            nt_maxlag: 0,
            nt_chunk_out: 0,
            nt_contig: 0,
            nt_maxgap: -1,
            pos_lo: 0,
            pos_hi: 0,
            pos_max: 0,
            all_ring_buffers: Vec::new(),
            new_ring_buffers: Vec::new(),
            out_mp: None,
            plot_groups: Vec::new(),
            time_spent_in_transform: Duration::ZERO,
        }
    }

    /// Stage name (used as the prefix of fatal messages).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered class name of the stage.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Build a fatal error carrying the stage name.
    pub fn error(&self, msg: impl Into<String>) -> Error {
        let msg = msg.into();
        if self.name.is_empty() {
            Error::Stage(msg)
        } else {
            Error::Stage(format!("{}: {}", self.name, msg))
        }
    }

    /// Input granularity presented by the parent. Nonzero iff bound.
    pub fn nt_chunk_in(&self) -> Pos {
        self.nt_chunk_in
    }

    /// Max lag budget granted by the parent.
    pub fn nt_maxlag(&self) -> Pos {
        self.nt_maxlag
    }

    /// Granularity this stage emits.
    pub fn nt_chunk_out(&self) -> Pos {
        self.nt_chunk_out
    }

    /// Contiguous window this stage needs from its ring buffers.
    pub fn nt_contig(&self) -> Pos {
        self.nt_contig
    }

    /// Max `pos_hi - pos_lo` this stage permits after any advance.
    pub fn nt_maxgap(&self) -> Pos {
        self.nt_maxgap
    }

    /// Set the emitted granularity; called from `bind_inner`.
    pub fn set_nt_chunk_out(&mut self, n: Pos) {
        self.nt_chunk_out = n;
    }

    /// Set the contiguous-window requirement; called from `bind_inner`.
    pub fn set_nt_contig(&mut self, n: Pos) {
        self.nt_contig = n;
    }

    /// Set the max advance gap; called from `bind_inner`.
    pub fn set_nt_maxgap(&mut self, n: Pos) {
        self.nt_maxgap = n;
    }

    /// Completed frontier of the stage.
    pub fn pos_lo(&self) -> Pos {
        self.pos_lo
    }

    /// Frontier granted by the parent.
    pub fn pos_hi(&self) -> Pos {
        self.pos_hi
    }

    /// Look-ahead bound the parent guarantees the stage may address.
    pub fn pos_max(&self) -> Pos {
        self.pos_max
    }

    /// Advance the completed frontier by `n` positions; called from
    /// `advance_inner`.
    pub fn advance_pos_lo(&mut self, n: Pos) {
        self.pos_lo += n;
    }

    /// Set the completed frontier; called from `advance_inner`.
    pub fn set_pos_lo(&mut self, pos: Pos) {
        self.pos_lo = pos;
    }

    /// All ring buffers this stage touches.
    pub fn ring_buffers(&self) -> &[Arc<RingBuffer>] {
        &self.all_ring_buffers
    }

    /// Whether the stage is currently inside a `start_pipeline`/`end_pipeline`
    /// cycle.
    pub fn is_running(&self) -> bool {
        self.out_mp.is_some()
    }

    pub(crate) fn outdir_manager(&self) -> Result<Arc<OutdirManager>> {
        self.out_mp
            .clone()
            .ok_or_else(|| self.error("internal error: no outdir manager (stage not running)"))
    }

    /// Look up a named ring buffer created by an upstream stage, recording
    /// it as touched by this stage.
    pub fn get_buffer(&mut self, rb_dict: &RingBufferDict, key: &str) -> Result<Arc<RingBuffer>> {
        let rb = rb_dict
            .get(key)
            .cloned()
            .ok_or_else(|| self.error(format!("buffer '{}' does not exist in pipeline", key)))?;
        self.all_ring_buffers.push(Arc::clone(&rb));
        Ok(rb)
    }

    /// Create a named ring buffer, recording it as both touched and owned
    /// by this stage (owned buffers are allocated/started/deallocated by
    /// this stage's driver).
    pub fn create_buffer(
        &mut self,
        rb_dict: &mut RingBufferDict,
        key: &str,
        cdims: Vec<i64>,
        nds: i64,
    ) -> Result<Arc<RingBuffer>> {
        if rb_dict.contains_key(key) {
            return Err(self.error(format!("buffer '{}' already exists in pipeline", key)));
        }

        let rb = Arc::new(RingBuffer::new(cdims, nds)?);
        rb_dict.insert(key.to_string(), Arc::clone(&rb));
        self.all_ring_buffers.push(Arc::clone(&rb));
        self.new_ring_buffers.push(Arc::clone(&rb));
        Ok(rb)
    }

    /// Declare a plot group; returns its group id.
    pub fn add_plot_group(&mut self, name: &str, nt_per_pix: i64, ny: i64) -> Result<usize> {
        if nt_per_pix < 1 {
            return Err(self.error("add_plot_group(): nt_per_pix must be >= 1"));
        }
        if ny < 1 {
            return Err(self.error("add_plot_group(): ny must be >= 1"));
        }
        if self.plot_groups.iter().any(|g| g.name == name) {
            return Err(self.error(format!("add_plot_group(): duplicate plot_group name '{}'", name)));
        }

        self.plot_groups.push(PlotGroup {
            name: name.to_string(),
            nt_per_pix,
            ny,
            is_empty: true,
            curr_it0: 0,
            curr_it1: 0,
            files: Vec::new(),
        });
        Ok(self.plot_groups.len() - 1)
    }

    /// Append a plot to a group, validating scale, height, and contiguity.
    /// Returns the absolute output path for the plot file.
    pub fn add_plot(
        &mut self,
        basename: &str,
        it0: i64,
        nt: i64,
        nx: i64,
        ny: i64,
        group_id: usize,
    ) -> Result<std::path::PathBuf> {
        if self.plot_groups.is_empty() {
            return Err(self.error("add_plot() called but no plot_groups defined, maybe a call to add_plot_group() is missing"));
        }
        if group_id >= self.plot_groups.len() {
            return Err(self.error("add_plot(): bad group_id specified"));
        }

        {
            let g = &self.plot_groups[group_id];
            if nt != g.nt_per_pix * nx {
                return Err(self.error("add_plot(): requirement (nt == nx*nt_per_pix) failed"));
            }
            if ny != g.ny {
                return Err(self.error("add_plot(): ny doesn't match value specified in add_plot_group()"));
            }
            if !g.is_empty && it0 != g.curr_it1 {
                return Err(self.error("add_plot(): plot time ranges are not contiguous"));
            }
        }

        let filename = self.add_file(basename)?;

        let g = &mut self.plot_groups[group_id];
        if g.is_empty {
            g.is_empty = false;
            g.curr_it0 = it0;
        }
        g.curr_it1 = it0 + nt;
        g.files.push(serde_json::json!({
            "filename": basename,
            "it0": it0,
            "nx": nx,
        }));

        Ok(filename)
    }

    /// Register an output file with the run's output directory; returns its
    /// absolute path.
    pub fn add_file(&mut self, basename: &str) -> Result<std::path::PathBuf> {
        let mp = self.outdir_manager()?;
        if mp.outdir().is_none() {
            return Err(self.error("attempted to write output file, but no outdir was specified in run()"));
        }
        mp.add_file(basename)
    }
}
