//! Bitmask kernel and saver: bit-per-sample export of the weights mask
//!
//! `make_bitmask` packs a (nfreq, nt) weights array into a (nfreq, nt/8)
//! byte array, one bit per sample, bit set = unmasked. The saver stage
//! writes each chunk's bitmask through an external chunk manager; the
//! get/put pairing on the manager is enforced by a scope guard so the
//! chunk is returned even when packing fails.

use std::sync::Arc;

use serde_json::Value;

use rf_pipelines_core::ring_buffer::Pos;
use rf_pipelines_core::{Error, PipelineObject, Result};

use crate::wi::{wi_stage, WiChunk, WiKernel};

/// Pack a strided weights array into a bit-per-sample mask.
///
/// `nt` must be a multiple of 8 and `in_stride >= nt`; the output holds
/// `nfreq * nt / 8` bytes. A set bit marks a sample with weight > 0.
pub fn make_bitmask(out_bitmask: &mut [u8], nfreq: usize, nt: usize, in_weights: &[f32], in_stride: usize) {
    assert!(nfreq > 0);
    assert!(nt > 0);
    assert!(nt % 8 == 0, "make_bitmask: nt must be a multiple of 8");
    assert!(in_stride >= nt);
    assert!(out_bitmask.len() >= nfreq * nt / 8);
    assert!(in_weights.len() >= (nfreq - 1) * in_stride + nt);

    for ifreq in 0..nfreq {
        for it in (0..nt).step_by(8) {
            let mut out: u8 = 0;
            for j in 0..8 {
                let w = in_weights[ifreq * in_stride + it + j];
                if w > 0.0 {
                    out |= 1 << j;
                }
            }
            out_bitmask[(ifreq * nt + it) / 8] = out;
        }
    }
}

/// External sink for per-chunk bitmasks. `get_chunk` hands out a zeroed
/// buffer of `nfreq * nt_chunk / 8` bytes; `put_chunk` takes it back once
/// filled.
pub trait BitmaskChunkManager: Send + Sync {
    /// Borrow the destination buffer for the chunk starting at `pos`.
    fn get_chunk(&self, pos: Pos, nfreq: i64, nt_chunk: i64) -> Result<Vec<u8>>;

    /// Return the (possibly partially) filled buffer.
    fn put_chunk(&self, pos: Pos, bitmask: Vec<u8>);
}

/// Keeps `get_chunk`/`put_chunk` correctly paired across failures.
struct ChunkGuard<'a> {
    mp: &'a dyn BitmaskChunkManager,
    pos: Pos,
    buf: Option<Vec<u8>>,
}

impl<'a> ChunkGuard<'a> {
    fn new(mp: &'a dyn BitmaskChunkManager, pos: Pos, nfreq: i64, nt_chunk: i64) -> Result<Self> {
        let buf = mp.get_chunk(pos, nfreq, nt_chunk)?;
        Ok(Self { mp, pos, buf: Some(buf) })
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("chunk already returned")
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.mp.put_chunk(self.pos, buf);
        }
    }
}

/// Stage writing each chunk's bitmask through a [`BitmaskChunkManager`].
pub struct BitmaskSaver {
    mp: Arc<dyn BitmaskChunkManager>,
}

impl WiKernel for BitmaskSaver {
    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        if chunk.nt % 8 != 0 {
            return Err(Error::Stage(format!(
                "bitmask_saver: chunk length nt={} must be a multiple of 8",
                chunk.nt
            )));
        }

        let mut guard = ChunkGuard::new(self.mp.as_ref(), chunk.pos, chunk.nfreq, chunk.nt)?;
        make_bitmask(
            guard.buf_mut(),
            chunk.nfreq as usize,
            chunk.nt as usize,
            chunk.weights.plane(),
            chunk.weights.stride(),
        );
        Ok(true)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({
            "class_name": "bitmask_saver",
            "nt_chunk": nt_chunk,
        }))
    }
}

/// Build a bitmask-saver stage. `nt_chunk` must be a multiple of 8.
pub fn make_bitmask_saver(mp: Arc<dyn BitmaskChunkManager>, nt_chunk: Pos) -> Result<PipelineObject> {
    if nt_chunk <= 0 || nt_chunk % 8 != 0 {
        return Err(Error::Stage(format!(
            "bitmask_saver: nt_chunk(={}) must be a positive multiple of 8",
            nt_chunk
        )));
    }

    let name = format!("bitmask_saver(nt_chunk={})", nt_chunk);
    Ok(wi_stage("bitmask_saver", &name, Box::new(BitmaskSaver { mp }), nt_chunk))
}
