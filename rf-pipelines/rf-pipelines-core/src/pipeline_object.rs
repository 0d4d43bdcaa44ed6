//! Pipeline stage driver: bind/allocate/run/advance/end lifecycle
//!
//! [`PipelineObject`] pairs the shared stage state ([`StageCore`]) with a
//! boxed [`Stage`] capability and implements the non-virtual outer half of
//! every lifecycle operation: precondition checks, ring-buffer sizing,
//! position-counter postconditions, error capture during the run loop, and
//! the end-of-run attribute document.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::outdir::{OutdirManager, RUN_ATTRS_BASENAME};
use crate::ring_buffer::{Pos, RingBufferDict};
use crate::stage::{AttrMap, Stage, StageCore};

/// A stage plus its driver state; the unit that binds, runs, and ends as
/// one.
pub struct PipelineObject {
    core: StageCore,
    stage: Box<dyn Stage>,
}

impl PipelineObject {
    /// Wrap a stage capability. `class_name` must match the stage's factory
    /// registration; `name` is the human-readable instance name used in
    /// fatal messages and run attributes.
    pub fn new(class_name: &str, name: &str, stage: Box<dyn Stage>) -> Self {
        Self {
            core: StageCore::new(class_name, name),
            stage,
        }
    }

    /// Stage instance name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Registered class name.
    pub fn class_name(&self) -> &str {
        self.core.class_name()
    }

    /// Shared stage state (chunk parameters, position counters).
    pub fn core(&self) -> &StageCore {
        &self.core
    }

    /// Whether the stage has been bound into a pipeline.
    pub fn is_bound(&self) -> bool {
        self.core.nt_chunk_in > 0
    }

    /// Granularity this stage emits; valid after bind.
    pub fn nt_chunk_out(&self) -> Pos {
        self.core.nt_chunk_out
    }

    /// Max advance gap; valid after bind.
    pub fn nt_maxgap(&self) -> Pos {
        self.core.nt_maxgap
    }

    /// Completed frontier of the stage.
    pub fn pos_lo(&self) -> Pos {
        self.core.pos_lo
    }

    /// Chunk size used to seed a standalone bind; zero for stages that
    /// cannot be first in a pipeline.
    pub fn preferred_chunk_size(&self) -> Result<Pos> {
        self.stage.preferred_chunk_size()
    }

    /// Bind the stage standalone, seeding `nt_chunk_in = nt_maxlag` from
    /// its preferred chunk size. No-op if already bound.
    pub fn bind_toplevel(&mut self) -> Result<()> {
        if self.is_bound() {
            return Ok(());
        }

        let n = self.stage.preferred_chunk_size()?;
        if n <= 0 {
            return Err(self.core.error("this object cannot be first in pipeline"));
        }

        let mut rb_dict = RingBufferDict::new();
        let mut attrs = AttrMap::new();
        self.bind(&mut rb_dict, n, n, &mut attrs)
    }

    /// Bind the stage into a composition: record the input granularity and
    /// lag budget, delegate to the stage's `bind_inner`, validate the
    /// bind-time outputs, and widen every touched ring buffer.
    pub fn bind(
        &mut self,
        rb_dict: &mut RingBufferDict,
        nt_chunk_in: Pos,
        nt_maxlag: Pos,
        attrs: &mut AttrMap,
    ) -> Result<()> {
        assert!(nt_chunk_in > 0);
        assert!(nt_maxlag > 0);

        if self.core.name.is_empty() {
            return Err(Error::Stage(
                "pipeline_object did not initialize its 'name' field".into(),
            ));
        }
        if self.is_bound() {
            return Err(self.core.error(
                "double call to bind(); this can happen if a pipeline_object is reused in a pipeline",
            ));
        }

        self.core.nt_chunk_in = nt_chunk_in;
        self.core.nt_maxlag = nt_maxlag;

        self.stage.bind_inner(&mut self.core, rb_dict, attrs)?;

        if self.core.nt_chunk_in != nt_chunk_in || self.core.nt_maxlag != nt_maxlag {
            return Err(self.core.error("internal error: bind_inner() modified nt_chunk_in or nt_maxlag"));
        }
        if self.core.nt_maxgap < 0 {
            return Err(self.core.error("bind_inner() failed to initialize nt_maxgap"));
        }
        if self.core.nt_chunk_out <= 0 {
            return Err(self.core.error("bind_inner() failed to initialize nt_chunk_out"));
        }
        if self.core.nt_contig <= 0 {
            return Err(self.core.error("bind_inner() failed to initialize nt_contig"));
        }

        for rb in &self.core.all_ring_buffers {
            rb.update_params(self.core.nt_contig, self.core.nt_maxlag + self.core.nt_maxgap);
        }

        Ok(())
    }

    /// Revert the stage to its unbound state so it can be rebound. Not
    /// permitted while running.
    pub fn unbind(&mut self) -> Result<()> {
        if !self.is_bound() {
            return Ok(());
        }
        if self.core.out_mp.is_some() {
            return Err(self.core.error("unbind() called while pipeline is running"));
        }

        self.stage.unbind_inner(&mut self.core);

        self.core.all_ring_buffers.clear();
        self.core.new_ring_buffers.clear();
        self.core.nt_chunk_in = 0;
        self.core.nt_maxlag = 0;
        self.core.nt_chunk_out = 0;
        self.core.nt_contig = 0;
        self.core.nt_maxgap = -1;

        Ok(())
    }

    /// Allocate the stage, binding it first if necessary. Ring buffers
    /// created by this stage are allocated here; buffers obtained through
    /// lookup are allocated by their creator.
    pub fn allocate(&mut self) -> Result<()> {
        if !self.is_bound() {
            self.bind_toplevel()?;
        }

        for rb in &self.core.new_ring_buffers {
            rb.allocate()?;
        }

        self.stage.allocate_inner()
    }

    /// Release the stage's resources and its created ring buffers.
    pub fn deallocate(&mut self) {
        self.stage.deallocate_inner();

        for rb in &self.core.new_ring_buffers {
            rb.deallocate();
        }
    }

    /// Publish the output handle, reset counters, start created ring
    /// buffers, and invoke the stage's `start_inner`.
    pub fn start_pipeline(&mut self, mp: &Arc<OutdirManager>, attrs: &mut AttrMap) -> Result<()> {
        if self.core.out_mp.is_some() {
            return Err(self.core.error(
                "either double call to start_pipeline() without end_pipeline(), or pipeline_object appears twice in pipeline",
            ));
        }

        self.core.out_mp = Some(Arc::clone(mp));
        self.core.plot_groups.clear();
        self.core.time_spent_in_transform = Duration::ZERO;

        self.core.pos_lo = 0;
        self.core.pos_hi = 0;
        self.core.pos_max = 0;

        for rb in &self.core.new_ring_buffers {
            rb.start();
        }

        self.stage.start_inner(&mut self.core, attrs)
    }

    /// Invoke the stage's `end_inner`, merge `name`/`cpu_time`/`plots` into
    /// the attribute document, and drop the output handle. Runs exactly
    /// once per `start_pipeline`.
    pub fn end_pipeline(&mut self, attrs: &mut AttrMap) -> Result<()> {
        let ret = self.stage.end_inner(&mut self.core, attrs);

        if !attrs.contains_key("name") {
            attrs.insert("name".into(), Value::from(self.core.name.clone()));
        }
        if !attrs.contains_key("cpu_time") {
            attrs.insert(
                "cpu_time".into(),
                Value::from(self.core.time_spent_in_transform.as_secs_f64()),
            );
        }
        if !attrs.contains_key("plots") && self.core.plot_groups.iter().any(|g| !g.is_empty) {
            let plots: Vec<Value> = self
                .core
                .plot_groups
                .iter()
                .filter(|g| !g.is_empty)
                .map(|g| g.attrs())
                .collect();
            attrs.insert("plots".into(), Value::from(plots));
        }

        self.core.out_mp = None;
        self.core.plot_groups.clear();

        ret
    }

    /// Grant the stage a new frontier. The outer call enforces the advance
    /// contract on both sides of the stage's `advance_inner`:
    /// monotonicity and alignment of `pos_hi`, the lag bound on `pos_max`,
    /// and afterwards the chunk alignment and gap bound on `pos_lo`.
    /// Returns the end-of-stream position, or `i64::MAX` while live.
    pub fn advance(&mut self, pos_hi: Pos, pos_max: Pos) -> Result<Pos> {
        let t0 = Instant::now();

        assert!(self.core.nt_chunk_in > 0, "advance() before bind()");
        assert!(self.core.nt_chunk_out > 0);
        assert!(self.core.pos_hi <= pos_hi);
        assert!(pos_hi <= pos_max);
        assert!(pos_max <= self.core.pos_hi + self.core.nt_maxlag);
        assert!(pos_hi % self.core.nt_chunk_in == 0);

        self.core.pos_hi = pos_hi;
        self.core.pos_max = pos_max;

        let ret = self.stage.advance_inner(&mut self.core)?;

        if self.core.pos_hi != pos_hi {
            return Err(self.core.error("internal error: value of pos_hi was modified in advance()"));
        }
        if self.core.pos_lo % self.core.nt_chunk_out != 0 {
            return Err(self.core.error("internal error: pos_lo is not a multiple of nt_chunk_out after advance()"));
        }
        if self.core.pos_lo > self.core.pos_hi {
            return Err(self.core.error("internal error: pos_lo > pos_hi after advance()"));
        }
        if self.core.pos_hi - self.core.pos_lo > self.core.nt_maxgap {
            return Err(self.core.error("internal error: (pos_hi - pos_lo) > nt_maxgap after advance()"));
        }

        self.core.time_spent_in_transform += t0.elapsed();

        Ok(ret)
    }

    /// Run the pipeline to completion.
    ///
    /// Allocates (binding first if needed), starts, and drives the advance
    /// loop one input chunk at a time until a stage reports end-of-stream.
    /// A failure inside the loop is captured so that `end_pipeline` still
    /// runs and the attribute document is still written; the failure is
    /// then re-raised. The document goes to `<outdir>/rf_pipeline_0.json`
    /// when an output directory is given.
    pub fn run(&mut self, outdir: Option<&Path>, verbosity: i32, clobber: bool) -> Result<Value> {
        if self.core.out_mp.is_some() {
            return Err(self.core.error(
                "output manager still set in run(), maybe the pipeline is being rerun after a failure?",
            ));
        }

        let mp = Arc::new(OutdirManager::new(outdir, clobber)?);
        let mut attrs_in = AttrMap::new();

        // allocate() binds if necessary
        self.allocate()?;
        self.start_pipeline(&mp, &mut attrs_in)?;

        let mut run_err: Option<Error> = None;
        let mut nt_end = i64::MAX;

        while self.core.pos_lo < nt_end {
            let m = self.core.pos_hi + self.core.nt_chunk_in;
            match self.advance(m, m) {
                Ok(n) => nt_end = nt_end.min(n),
                Err(e) => {
                    run_err = Some(e);
                    break;
                }
            }
        }

        // end_pipeline() clears the output handle and plot groups, and runs
        // even when the advance loop failed, so partial outputs are flushed.
        let mut attrs_out = AttrMap::new();
        self.end_pipeline(&mut attrs_out)?;

        if let Some(dir) = outdir {
            let path = dir.join(RUN_ATTRS_BASENAME);
            let doc = serde_json::to_string_pretty(&Value::Object(attrs_out.clone()))?;
            fs::write(&path, doc).map_err(|e| {
                self.core.error(format!("couldn't write output file {}: {}", path.display(), e))
            })?;

            if verbosity >= 2 {
                info!(file = %path.display(), "wrote run attribute document");
            }
        }

        if let Some(e) = run_err {
            return Err(Error::Runtime(e.to_string()));
        }

        Ok(Value::Object(attrs_out))
    }

    /// Emit the stage's configuration document.
    pub fn jsonize(&self) -> Result<Value> {
        self.stage.jsonize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::{ChunkedKernel, ChunkedStage};
    use crate::ring_buffer::{AccessMode, RingBuffer};
    use std::sync::Mutex;

    /// Self-contained source that appends a ramp, optionally fails at a
    /// given chunk index, and records its results in the attribute
    /// document.
    struct FlakySource {
        nt_tot: Pos,
        fail_at_chunk: Option<i64>,
        chunks_done: i64,
        rb: Option<Arc<RingBuffer>>,
    }

    impl ChunkedKernel for FlakySource {
        fn bind_chunked(
            &mut self,
            core: &mut StageCore,
            rb_dict: &mut RingBufferDict,
            _attrs: &mut AttrMap,
        ) -> Result<()> {
            self.rb = Some(core.create_buffer(rb_dict, "X", vec![1], 1)?);
            Ok(())
        }

        fn start_chunked(&mut self, _core: &mut StageCore, _attrs: &mut AttrMap) -> Result<()> {
            self.chunks_done = 0;
            Ok(())
        }

        fn process_chunk(&mut self, core: &mut StageCore, pos: Pos, nt_chunk: Pos) -> Result<bool> {
            if Some(self.chunks_done) == self.fail_at_chunk {
                return Err(core.error("synthetic transform failure"));
            }

            let rb = self.rb.as_ref().expect("process_chunk() before bind()");
            let mut w = rb.get(pos, pos + nt_chunk, AccessMode::Append);
            for (j, x) in w.row_mut(0).iter_mut().enumerate() {
                *x = (pos + j as i64) as f32;
            }
            w.put();

            self.chunks_done += 1;
            Ok(pos + nt_chunk < self.nt_tot)
        }

        fn end_chunked(&mut self, _core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
            attrs.insert("chunks_done".into(), Value::from(self.chunks_done));
            Ok(())
        }
    }

    fn make_flaky(nt_tot: Pos, nt_chunk: Pos, fail_at_chunk: Option<i64>) -> PipelineObject {
        let kernel = FlakySource {
            nt_tot,
            fail_at_chunk,
            chunks_done: 0,
            rb: None,
        };
        PipelineObject::new(
            "flaky_source",
            "flaky_source",
            Box::new(ChunkedStage::new(Box::new(kernel), nt_chunk, true)),
        )
    }

    #[test]
    fn test_run_writes_attribute_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut obj = make_flaky(256, 64, None);

        let out = obj.run(Some(dir.path()), 0, false).unwrap();
        assert_eq!(out.get("chunks_done").and_then(Value::as_i64), Some(4));
        assert!(!obj.core().is_running());

        let doc: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(RUN_ATTRS_BASENAME)).unwrap()).unwrap();
        assert_eq!(doc.get("name").and_then(Value::as_str), Some("flaky_source"));
        assert_eq!(doc.get("chunks_done").and_then(Value::as_i64), Some(4));
    }

    #[test]
    fn test_run_with_exception_flushes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut obj = make_flaky(1 << 30, 64, Some(3));

        let err = obj.run(Some(dir.path()), 0, false).unwrap_err();
        assert!(err.to_string().contains("synthetic transform failure"));

        // end_pipeline ran: the output handle is cleared and the document
        // on disk holds the first 3 chunks' results
        assert!(!obj.core().is_running());
        let doc: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(RUN_ATTRS_BASENAME)).unwrap()).unwrap();
        assert_eq!(doc.get("chunks_done").and_then(Value::as_i64), Some(3));
    }

    #[test]
    fn test_rerun_after_start_failure_rejected() {
        struct BadStart;
        impl ChunkedKernel for BadStart {
            fn bind_chunked(
                &mut self,
                _core: &mut StageCore,
                _rb_dict: &mut RingBufferDict,
                _attrs: &mut AttrMap,
            ) -> Result<()> {
                Ok(())
            }
            fn start_chunked(&mut self, core: &mut StageCore, _attrs: &mut AttrMap) -> Result<()> {
                Err(core.error("start failure"))
            }
            fn process_chunk(&mut self, _core: &mut StageCore, _pos: Pos, _nt: Pos) -> Result<bool> {
                Ok(true)
            }
        }

        let mut obj = PipelineObject::new(
            "bad_start",
            "bad_start",
            Box::new(ChunkedStage::new(Box::new(BadStart), 64, true)),
        );

        assert!(obj.run(None, 0, false).is_err());
        let err = obj.run(None, 0, false).unwrap_err();
        assert!(err.to_string().contains("rerun"));
    }

    #[test]
    fn test_plot_groups_in_attribute_document() {
        struct Plotter {
            group_id: usize,
            files: Mutex<Vec<std::path::PathBuf>>,
        }

        impl ChunkedKernel for Plotter {
            fn bind_chunked(
                &mut self,
                _core: &mut StageCore,
                _rb_dict: &mut RingBufferDict,
                _attrs: &mut AttrMap,
            ) -> Result<()> {
                Ok(())
            }

            fn start_chunked(&mut self, core: &mut StageCore, _attrs: &mut AttrMap) -> Result<()> {
                self.group_id = core.add_plot_group("waterfall", 16, 64)?;
                Ok(())
            }

            fn process_chunk(&mut self, core: &mut StageCore, pos: Pos, nt_chunk: Pos) -> Result<bool> {
                let basename = format!("waterfall_{}.png", pos / nt_chunk);
                let path = core.add_plot(&basename, pos, nt_chunk, nt_chunk / 16, 64, self.group_id)?;
                self.files.lock().unwrap().push(path);
                Ok(pos + nt_chunk < 192)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let kernel = Plotter {
            group_id: 0,
            files: Mutex::new(Vec::new()),
        };
        let mut obj = PipelineObject::new(
            "plotter",
            "plotter",
            Box::new(ChunkedStage::new(Box::new(kernel), 64, true)),
        );

        let out = obj.run(Some(dir.path()), 0, false).unwrap();

        let plots = out.get("plots").and_then(Value::as_array).unwrap();
        assert_eq!(plots.len(), 1);
        assert_eq!(plots[0].get("name").and_then(Value::as_str), Some("waterfall"));
        assert_eq!(plots[0].get("it0").and_then(Value::as_i64), Some(0));
        assert_eq!(plots[0].get("it1").and_then(Value::as_i64), Some(192));
        assert_eq!(plots[0].get("files").and_then(Value::as_array).unwrap().len(), 3);
    }

    #[test]
    fn test_add_plot_validation() {
        let mut core = StageCore::new("t", "t");
        core.out_mp = Some(Arc::new(OutdirManager::new(None, false).unwrap()));

        // ny mismatch is rejected before any file is registered
        let gid = core.add_plot_group("g", 16, 64).unwrap();
        assert!(core.add_plot("p0.png", 0, 256, 16, 32, gid).is_err());

        // duplicate group names are rejected
        assert!(core.add_plot_group("g", 16, 64).is_err());
    }
}
