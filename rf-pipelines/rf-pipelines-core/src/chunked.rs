//! Fixed-chunk stage harness
//!
//! Most transforms process the stream in fixed spans of `nt_chunk` input
//! positions. [`ChunkedStage`] adapts a [`ChunkedKernel`] (essentially a
//! `process_chunk(pos) -> alive` hook plus bind/start/end glue) into the
//! full [`Stage`] capability, converting the variable-granularity input
//! stream into whole-chunk callbacks with the right alignment and
//! downsampling constraints.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::ring_buffer::{Pos, RingBufferDict};
use crate::stage::{AttrMap, Stage, StageCore};
use crate::utils::{gcd, lcm};

/// Chunk-level capability implemented by fixed-chunk transforms.
pub trait ChunkedKernel: Send {
    /// Look up or create ring buffers. All `get_buffer`/`create_buffer`
    /// calls belong here.
    fn bind_chunked(
        &mut self,
        core: &mut StageCore,
        rb_dict: &mut RingBufferDict,
        attrs: &mut AttrMap,
    ) -> Result<()>;

    /// Revert binding-time state.
    fn unbind_chunked(&mut self) {}

    /// Allocate kernel-private resources.
    fn allocate_chunked(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release kernel-private resources.
    fn deallocate_chunked(&mut self) {}

    /// Per-run initialization.
    fn start_chunked(&mut self, core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        let _ = (core, attrs);
        Ok(())
    }

    /// Process one chunk of `nt_chunk` input positions starting at `pos`.
    /// Returning `false` signals end-of-stream at this position.
    fn process_chunk(&mut self, core: &mut StageCore, pos: Pos, nt_chunk: Pos) -> Result<bool>;

    /// Per-run teardown; merge results into the attribute document.
    fn end_chunked(&mut self, core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        let _ = (core, attrs);
        Ok(())
    }

    /// Emit the stage's configuration document. `nt_chunk` is the pre-bind
    /// chunk size (zero if autosized).
    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        let _ = nt_chunk;
        Err(Error::Stage("jsonize() not implemented".into()))
    }
}

/// Adapter implementing [`Stage`] for a [`ChunkedKernel`].
///
/// `nt_chunk` may be fixed at construction or left zero for autosizing
/// during bind. Stages marked `can_be_first` use `nt_chunk` as their
/// preferred chunk size and must therefore fix it up front.
pub struct ChunkedStage {
    kernel: Box<dyn ChunkedKernel>,
    can_be_first: bool,
    nt_chunk: Pos,
    prebind_nt_chunk: Pos,
}

impl ChunkedStage {
    /// Wrap a chunked kernel. `nt_chunk = 0` requests autosizing at bind.
    pub fn new(kernel: Box<dyn ChunkedKernel>, nt_chunk: Pos, can_be_first: bool) -> Self {
        assert!(nt_chunk >= 0);
        Self {
            kernel,
            can_be_first,
            nt_chunk,
            prebind_nt_chunk: nt_chunk,
        }
    }

    /// Current chunk size (post-bind: the finalized value).
    pub fn nt_chunk(&self) -> Pos {
        self.nt_chunk
    }

    /// Autosize `nt_chunk` if it was left zero, then validate that it is a
    /// multiple of every touched ring buffer's downsampling factor.
    fn finalize_nt_chunk(&mut self, core: &StageCore) -> Result<()> {
        if core.nt_chunk_in() <= 0 {
            return Err(core.error(
                "finalize_nt_chunk(): expected nt_chunk_in > 0; this is called during bind(), after ring buffers are looked up",
            ));
        }

        if self.nt_chunk > 0 {
            return self.check_nt_chunk(core);
        }

        let m = core.nt_chunk_in().max(512);
        let mut n = 1;
        for rb in core.ring_buffers() {
            n = lcm(n, rb.nds());
        }

        self.nt_chunk = n * (m / n).max(1);
        self.check_nt_chunk(core)
    }

    fn check_nt_chunk(&self, core: &StageCore) -> Result<()> {
        assert!(self.nt_chunk > 0);
        assert!(core.nt_chunk_in() > 0);

        for rb in core.ring_buffers() {
            if self.nt_chunk % rb.nds() != 0 {
                return Err(core.error(format!(
                    "nt_chunk (={}) must be a multiple of all ring buffer downsampling factors (found nds={})",
                    self.nt_chunk,
                    rb.nds()
                )));
            }
        }

        Ok(())
    }
}

impl Stage for ChunkedStage {
    fn preferred_chunk_size(&self) -> Result<Pos> {
        if !self.can_be_first {
            return Ok(0);
        }
        if self.nt_chunk == 0 {
            return Err(Error::Stage(
                "in chunked stages with can_be_first=true, nt_chunk must be initialized to a nonzero value before bind() is called".into(),
            ));
        }
        Ok(self.nt_chunk)
    }

    fn bind_inner(
        &mut self,
        core: &mut StageCore,
        rb_dict: &mut RingBufferDict,
        attrs: &mut AttrMap,
    ) -> Result<()> {
        self.prebind_nt_chunk = self.nt_chunk;

        self.kernel.bind_chunked(core, rb_dict, attrs)?;
        self.finalize_nt_chunk(core)?;

        let nt_chunk_in = core.nt_chunk_in();
        core.set_nt_chunk_out(if nt_chunk_in % self.nt_chunk != 0 {
            self.nt_chunk
        } else {
            nt_chunk_in
        });
        core.set_nt_maxgap(self.nt_chunk - gcd(nt_chunk_in, self.nt_chunk));
        core.set_nt_contig(self.nt_chunk);

        Ok(())
    }

    fn unbind_inner(&mut self, _core: &mut StageCore) {
        self.kernel.unbind_chunked();
        self.nt_chunk = self.prebind_nt_chunk;
    }

    fn allocate_inner(&mut self) -> Result<()> {
        self.kernel.allocate_chunked()
    }

    fn deallocate_inner(&mut self) {
        self.kernel.deallocate_chunked()
    }

    fn start_inner(&mut self, core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        self.kernel.start_chunked(core, attrs)
    }

    fn advance_inner(&mut self, core: &mut StageCore) -> Result<Pos> {
        let mut ret = i64::MAX;

        while core.pos_lo() + self.nt_chunk <= core.pos_hi() {
            let pos = core.pos_lo();
            let alive = self.kernel.process_chunk(core, pos, self.nt_chunk)?;
            if !alive {
                ret = ret.min(core.pos_hi());
            }
            core.advance_pos_lo(self.nt_chunk);
        }

        Ok(ret)
    }

    fn end_inner(&mut self, core: &mut StageCore, attrs: &mut AttrMap) -> Result<()> {
        self.kernel.end_chunked(core, attrs)
    }

    fn jsonize(&self) -> Result<Value> {
        self.kernel.jsonize(self.prebind_nt_chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_object::PipelineObject;

    /// Touches ring buffers with the given downsampling factors and does
    /// nothing else.
    struct MultiBufKernel {
        nds_list: Vec<i64>,
    }

    impl ChunkedKernel for MultiBufKernel {
        fn bind_chunked(
            &mut self,
            core: &mut StageCore,
            rb_dict: &mut RingBufferDict,
            _attrs: &mut AttrMap,
        ) -> Result<()> {
            for (i, &nds) in self.nds_list.iter().enumerate() {
                core.create_buffer(rb_dict, &format!("BUF{}", i), vec![1], nds)?;
            }
            Ok(())
        }

        fn process_chunk(&mut self, _core: &mut StageCore, _pos: Pos, _nt_chunk: Pos) -> Result<bool> {
            Ok(true)
        }
    }

    fn bind_multibuf(nds_list: Vec<i64>, nt_chunk: Pos, nt_chunk_in: Pos) -> Result<PipelineObject> {
        let stage = ChunkedStage::new(Box::new(MultiBufKernel { nds_list }), nt_chunk, false);
        let mut obj = PipelineObject::new("multibuf", "multibuf", Box::new(stage));
        let mut rb_dict = RingBufferDict::new();
        let mut attrs = AttrMap::new();
        obj.bind(&mut rb_dict, nt_chunk_in, 4096, &mut attrs)?;
        Ok(obj)
    }

    #[test]
    fn test_autosized_nt_chunk() {
        // lcm(1,2,5) = 10, m = max(100, 512) = 512, nt_chunk = 10*51 = 510
        let obj = bind_multibuf(vec![1, 2, 5], 0, 100).unwrap();
        assert_eq!(obj.core().nt_contig(), 510);
        assert_eq!(obj.nt_chunk_out(), 510);
        assert_eq!(obj.nt_maxgap(), 500);
    }

    #[test]
    fn test_autosized_no_buffers_floor() {
        let obj = bind_multibuf(vec![], 0, 100).unwrap();
        assert_eq!(obj.core().nt_contig(), 512);
    }

    #[test]
    fn test_user_nt_chunk_rejected_on_nds_mismatch() {
        assert!(bind_multibuf(vec![3], 100, 100).is_err());
    }

    #[test]
    fn test_aligned_chunk_has_zero_maxgap() {
        let obj = bind_multibuf(vec![1], 64, 64).unwrap();
        assert_eq!(obj.nt_maxgap(), 0);
        assert_eq!(obj.nt_chunk_out(), 64);
    }

    #[test]
    fn test_maxgap_formula() {
        // gcd(48, 64) = 16, nt_maxgap = 48
        let mut obj = bind_multibuf(vec![1], 64, 48).unwrap();
        assert_eq!(obj.nt_maxgap(), 48);
        assert_eq!(obj.nt_chunk_out(), 64);

        // first advance: not enough input for a chunk, gap hits nt_maxgap
        let ret = obj.advance(48, 48).unwrap();
        assert_eq!(ret, i64::MAX);
        assert_eq!(obj.pos_lo(), 0);

        // second advance: one whole chunk fits
        obj.advance(96, 96).unwrap();
        assert_eq!(obj.pos_lo(), 64);
    }

    #[test]
    fn test_preferred_chunk_size() {
        let stage = ChunkedStage::new(Box::new(MultiBufKernel { nds_list: vec![] }), 256, true);
        assert_eq!(stage.preferred_chunk_size().unwrap(), 256);

        let stage = ChunkedStage::new(Box::new(MultiBufKernel { nds_list: vec![] }), 256, false);
        assert_eq!(stage.preferred_chunk_size().unwrap(), 0);

        let stage = ChunkedStage::new(Box::new(MultiBufKernel { nds_list: vec![] }), 0, true);
        assert!(stage.preferred_chunk_size().is_err());
    }

    #[test]
    fn test_unbind_restores_nt_chunk() {
        let mut obj = bind_multibuf(vec![1, 2, 5], 0, 100).unwrap();
        assert!(obj.is_bound());

        obj.unbind().unwrap();
        assert!(!obj.is_bound());

        // rebinding autosizes again from scratch
        let mut rb_dict = RingBufferDict::new();
        let mut attrs = AttrMap::new();
        obj.bind(&mut rb_dict, 200, 4096, &mut attrs).unwrap();
        assert_eq!(obj.core().nt_contig(), 510);
    }

    #[test]
    fn test_double_bind_rejected() {
        let mut obj = bind_multibuf(vec![1], 64, 64).unwrap();
        let mut rb_dict = RingBufferDict::new();
        let mut attrs = AttrMap::new();
        assert!(obj.bind(&mut rb_dict, 64, 64, &mut attrs).is_err());
    }
}
