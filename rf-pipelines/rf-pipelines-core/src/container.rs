//! Composite stage running a sequence of child stages
//!
//! A [`Pipeline`] forwards every lifecycle operation to its children. At
//! bind time the chunk size threads through the chain (each child consumes
//! the previous child's output granularity) and the lag budget grows by the
//! accumulated gap of the earlier children, which is exactly what makes the
//! parent's `pos_max <= pos_hi + nt_maxlag` guarantee imply each child's
//! own precondition. At advance time each child is handed the completed
//! frontier of the child before it.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::pipeline_object::PipelineObject;
use crate::registry;
use crate::ring_buffer::{Pos, RingBufferDict};
use crate::stage::{AttrMap, Stage, StageCore};

/// Composite stage: a chain of child stages driven as one unit.
pub struct Pipeline {
    elements: Vec<PipelineObject>,
}

impl Pipeline {
    /// Build a container stage from its children. At least one child is
    /// required.
    pub fn new(elements: Vec<PipelineObject>) -> Result<PipelineObject> {
        if elements.is_empty() {
            return Err(Error::Stage("pipeline: expected at least one element".into()));
        }

        Ok(PipelineObject::new(
            "pipeline",
            "pipeline",
            Box::new(Self { elements }),
        ))
    }
}

impl Stage for Pipeline {
    fn preferred_chunk_size(&self) -> Result<Pos> {
        self.elements[0].preferred_chunk_size()
    }

    fn bind_inner(
        &mut self,
        core: &mut StageCore,
        rb_dict: &mut RingBufferDict,
        attrs: &mut AttrMap,
    ) -> Result<()> {
        let mut nt_chunk = core.nt_chunk_in();
        let mut nt_delay = 0;

        for p in &mut self.elements {
            p.bind(rb_dict, nt_chunk, core.nt_maxlag() + nt_delay, attrs)?;
            nt_chunk = p.nt_chunk_out();
            nt_delay += p.nt_maxgap();
        }

        core.set_nt_chunk_out(nt_chunk);
        core.set_nt_contig(nt_chunk);
        core.set_nt_maxgap(nt_delay);

        Ok(())
    }

    fn unbind_inner(&mut self, _core: &mut StageCore) {
        for p in &mut self.elements {
            // children were bound by bind_inner, so unbinding them cannot
            // hit the still-running check
            let _ = p.unbind();
        }
    }

    fn allocate_inner(&mut self) -> Result<()> {
        for p in &mut self.elements {
            p.allocate()?;
        }
        Ok(())
    }

    fn deallocate_inner(&mut self) {
        for p in &mut self.elements {
            p.deallocate();
        }
    }

    fn start_inner(&mut self, core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        let mp = core.outdir_manager()?;
        for p in &mut self.elements {
            p.start_pipeline(&mp, attrs)?;
        }
        Ok(())
    }

    fn advance_inner(&mut self, core: &mut StageCore) -> Result<Pos> {
        let mut ret = i64::MAX;
        let mut phi = core.pos_hi();

        for p in &mut self.elements {
            ret = ret.min(p.advance(phi, core.pos_max())?);
            phi = p.pos_lo();
        }

        core.set_pos_lo(phi);
        Ok(ret)
    }

    fn end_inner(&mut self, _core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        // Every started child ends exactly once, even if one of them fails;
        // the first failure is re-raised after the loop.
        let mut children = Vec::with_capacity(self.elements.len());
        let mut first_err: Option<Error> = None;

        for p in &mut self.elements {
            let mut child_attrs = AttrMap::new();
            match p.end_pipeline(&mut child_attrs) {
                Ok(()) => children.push(Value::Object(child_attrs)),
                Err(e) => {
                    children.push(Value::Object(child_attrs));
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        attrs.insert("pipeline".into(), Value::from(children));

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn jsonize(&self) -> Result<Value> {
        let mut elements = Vec::with_capacity(self.elements.len());
        for p in &self.elements {
            elements.push(p.jsonize()?);
        }

        Ok(serde_json::json!({
            "class_name": "pipeline",
            "elements": elements,
        }))
    }
}

/// Factory for the built-in `"pipeline"` class.
pub(crate) fn pipeline_from_json(v: &Value) -> Result<PipelineObject> {
    let elements = v
        .get("elements")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Stage("pipeline: expected array field 'elements'".into()))?;

    let mut children = Vec::with_capacity(elements.len());
    for e in elements {
        children.push(registry::from_json(e)?);
    }

    Pipeline::new(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::{ChunkedKernel, ChunkedStage};
    use crate::ring_buffer::AccessMode;
    use std::sync::{Arc, Mutex};

    /// Appends a ramp into a created buffer until `nt_tot`.
    struct RampSource {
        nt_tot: Pos,
        rb: Option<Arc<crate::ring_buffer::RingBuffer>>,
    }

    impl ChunkedKernel for RampSource {
        fn bind_chunked(
            &mut self,
            core: &mut StageCore,
            rb_dict: &mut RingBufferDict,
            _attrs: &mut AttrMap,
        ) -> Result<()> {
            self.rb = Some(core.create_buffer(rb_dict, "X", vec![1], 1)?);
            Ok(())
        }

        fn start_chunked(&mut self, _core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
            attrs.insert("initial_fpga_count".into(), Value::from(4096u64));
            Ok(())
        }

        fn process_chunk(&mut self, _core: &mut StageCore, pos: Pos, nt_chunk: Pos) -> Result<bool> {
            let rb = self.rb.as_ref().expect("process_chunk() before bind()");
            let mut w = rb.get(pos, pos + nt_chunk, AccessMode::Append);
            for (j, x) in w.row_mut(0).iter_mut().enumerate() {
                *x = (pos + j as i64) as f32;
            }
            w.put();
            Ok(pos + nt_chunk < self.nt_tot)
        }
    }

    /// Reads the buffer back and records everything it sees.
    struct Recorder {
        rb: Option<Arc<crate::ring_buffer::RingBuffer>>,
        seen: Arc<Mutex<Vec<f32>>>,
        start_attr: Arc<Mutex<Option<u64>>>,
        ends: Arc<Mutex<usize>>,
    }

    impl ChunkedKernel for Recorder {
        fn bind_chunked(
            &mut self,
            core: &mut StageCore,
            rb_dict: &mut RingBufferDict,
            _attrs: &mut AttrMap,
        ) -> Result<()> {
            self.rb = Some(core.get_buffer(rb_dict, "X")?);
            Ok(())
        }

        fn start_chunked(&mut self, _core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
            *self.start_attr.lock().unwrap() = attrs.get("initial_fpga_count").and_then(Value::as_u64);
            Ok(())
        }

        fn process_chunk(&mut self, _core: &mut StageCore, pos: Pos, nt_chunk: Pos) -> Result<bool> {
            let rb = self.rb.as_ref().expect("process_chunk() before bind()");
            let w = rb.get(pos, pos + nt_chunk, AccessMode::Read);
            self.seen.lock().unwrap().extend_from_slice(w.row(0));
            w.put();
            Ok(true)
        }

        fn end_chunked(&mut self, _core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
            *self.ends.lock().unwrap() += 1;
            attrs.insert("nt_seen".into(), Value::from(self.seen.lock().unwrap().len()));
            Ok(())
        }
    }

    fn make_source(nt_tot: Pos, nt_chunk: Pos) -> PipelineObject {
        let stage = ChunkedStage::new(Box::new(RampSource { nt_tot, rb: None }), nt_chunk, true);
        PipelineObject::new("ramp_source", "ramp_source", Box::new(stage))
    }

    struct RecorderHandles {
        seen: Arc<Mutex<Vec<f32>>>,
        start_attr: Arc<Mutex<Option<u64>>>,
        ends: Arc<Mutex<usize>>,
    }

    fn make_recorder(nt_chunk: Pos) -> (PipelineObject, RecorderHandles) {
        let handles = RecorderHandles {
            seen: Arc::new(Mutex::new(Vec::new())),
            start_attr: Arc::new(Mutex::new(None)),
            ends: Arc::new(Mutex::new(0)),
        };
        let kernel = Recorder {
            rb: None,
            seen: Arc::clone(&handles.seen),
            start_attr: Arc::clone(&handles.start_attr),
            ends: Arc::clone(&handles.ends),
        };
        let stage = ChunkedStage::new(Box::new(kernel), nt_chunk, false);
        (
            PipelineObject::new("recorder", "recorder", Box::new(stage)),
            handles,
        )
    }

    #[test]
    fn test_chain_runs_to_completion() {
        let (recorder, handles) = make_recorder(32);
        let mut p = Pipeline::new(vec![make_source(256, 64), recorder]).unwrap();

        let out = p.run(None, 0, false).unwrap();

        let seen = handles.seen.lock().unwrap();
        assert_eq!(seen.len(), 256);
        for (j, &x) in seen.iter().enumerate() {
            assert_eq!(x, j as f32);
        }

        // the source's start attribute was visible downstream
        assert_eq!(*handles.start_attr.lock().unwrap(), Some(4096));
        assert_eq!(*handles.ends.lock().unwrap(), 1);

        // container document carries one entry per child
        let children = out.get("pipeline").and_then(Value::as_array).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].get("name").and_then(Value::as_str), Some("ramp_source"));
        assert_eq!(children[1].get("nt_seen").and_then(Value::as_u64), Some(256));
        assert!(out.get("cpu_time").is_some());
    }

    #[test]
    fn test_chain_with_mismatched_chunks() {
        // source chunk 48, recorder chunk 64: gcd/lcm arithmetic has to
        // keep every advance inside the gap bound
        let (recorder, handles) = make_recorder(64);
        let mut p = Pipeline::new(vec![make_source(480, 48), recorder]).unwrap();

        p.run(None, 0, false).unwrap();

        let seen = handles.seen.lock().unwrap();
        assert!(seen.len() >= 448);
        for (j, &x) in seen.iter().enumerate() {
            assert_eq!(x, j as f32);
        }
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(Pipeline::new(vec![]).is_err());
    }

    #[test]
    fn test_transform_only_pipeline_cannot_be_first() {
        let (recorder, _handles) = make_recorder(32);
        let mut p = Pipeline::new(vec![recorder]).unwrap();
        assert!(p.run(None, 0, false).is_err());
    }

    #[test]
    fn test_jsonize_shape() {
        struct JsonKernel;
        impl ChunkedKernel for JsonKernel {
            fn bind_chunked(
                &mut self,
                _core: &mut StageCore,
                _rb_dict: &mut RingBufferDict,
                _attrs: &mut AttrMap,
            ) -> Result<()> {
                Ok(())
            }
            fn process_chunk(&mut self, _core: &mut StageCore, _pos: Pos, _nt: Pos) -> Result<bool> {
                Ok(true)
            }
            fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
                Ok(serde_json::json!({ "class_name": "json_kernel", "nt_chunk": nt_chunk }))
            }
        }

        let stage = ChunkedStage::new(Box::new(JsonKernel), 512, true);
        let obj = PipelineObject::new("json_kernel", "json_kernel", Box::new(stage));
        let p = Pipeline::new(vec![obj]).unwrap();

        let doc = p.jsonize().unwrap();
        assert_eq!(doc.get("class_name").and_then(Value::as_str), Some("pipeline"));
        let elements = doc.get("elements").and_then(Value::as_array).unwrap();
        assert_eq!(elements[0].get("nt_chunk").and_then(Value::as_i64), Some(512));
    }
}
