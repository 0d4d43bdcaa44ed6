//! Saver/Reverter pair: snapshot a stream and restore it downstream
//!
//! A `saver` stage snapshots each chunk's intensity and weights; one or
//! more `reverter` stages later in the chain restore the snapshot,
//! undoing whatever the stages in between did to the stream. The two
//! stages share state through a handle, so the pair must be built
//! together. Snapshots are retained for a bounded number of recent chunks,
//! which covers any lag the scheduler can introduce between the two
//! stages.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use rf_pipelines_core::ring_buffer::Pos;
use rf_pipelines_core::{Error, PipelineObject, Result};

use crate::wi::{wi_stage, WiChunk, WiKernel};

/// Retained snapshots; bounds saver memory while covering scheduler lag.
const RETAIN_CHUNKS: usize = 64;

#[derive(Debug)]
struct SavedChunk {
    intensity: Vec<f32>,
    weights: Vec<f32>,
    nfreq: i64,
    nt: i64,
}

/// Snapshot store shared by one saver and its reverters.
#[derive(Debug, Default)]
pub struct SaverState {
    chunks: Mutex<BTreeMap<Pos, SavedChunk>>,
}

struct Saver {
    state: Arc<SaverState>,
}

impl WiKernel for Saver {
    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        let nfreq = chunk.nfreq as usize;
        let nt = chunk.nt as usize;

        let mut intensity = Vec::with_capacity(nfreq * nt);
        let mut weights = Vec::with_capacity(nfreq * nt);
        for f in 0..nfreq {
            intensity.extend_from_slice(chunk.intensity.row(f));
            weights.extend_from_slice(chunk.weights.row(f));
        }

        let mut chunks = self.state.chunks.lock().unwrap();
        chunks.insert(
            chunk.pos,
            SavedChunk {
                intensity,
                weights,
                nfreq: chunk.nfreq,
                nt: chunk.nt,
            },
        );
        while chunks.len() > RETAIN_CHUNKS {
            chunks.pop_first();
        }

        Ok(true)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({ "class_name": "saver", "nt_chunk": nt_chunk }))
    }
}

struct Reverter {
    state: Arc<SaverState>,
}

impl WiKernel for Reverter {
    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        let chunks = self.state.chunks.lock().unwrap();
        let saved = chunks.get(&chunk.pos).ok_or_else(|| {
            Error::Stage(format!("reverter: no saved chunk for position {}", chunk.pos))
        })?;

        if saved.nfreq != chunk.nfreq || saved.nt != chunk.nt {
            return Err(Error::Stage(
                "reverter: saved chunk shape does not match the stream".into(),
            ));
        }

        let nt = chunk.nt as usize;
        for f in 0..chunk.nfreq as usize {
            chunk.intensity.row_mut(f).copy_from_slice(&saved.intensity[f * nt..(f + 1) * nt]);
            chunk.weights.row_mut(f).copy_from_slice(&saved.weights[f * nt..(f + 1) * nt]);
        }

        Ok(true)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({ "class_name": "reverter", "nt_chunk": nt_chunk }))
    }
}

/// Build a saver stage, returning the snapshot store so reverters can be
/// attached to it.
pub fn make_saver(nt_chunk: Pos) -> Result<(PipelineObject, Arc<SaverState>)> {
    if nt_chunk <= 0 {
        return Err(Error::Stage("saver: expected nt_chunk > 0".into()));
    }

    let state = Arc::new(SaverState::default());
    let saver = wi_stage(
        "saver",
        &format!("saver(nt_chunk={})", nt_chunk),
        Box::new(Saver { state: Arc::clone(&state) }),
        nt_chunk,
    );
    Ok((saver, state))
}

/// Build a reverter attached to a saver's snapshot store. Several
/// reverters may share one saver.
pub fn make_reverter(state: Arc<SaverState>, nt_chunk: Pos) -> Result<PipelineObject> {
    if nt_chunk <= 0 {
        return Err(Error::Stage("reverter: expected nt_chunk > 0".into()));
    }
    Ok(wi_stage(
        "reverter",
        &format!("reverter(nt_chunk={})", nt_chunk),
        Box::new(Reverter { state }),
        nt_chunk,
    ))
}

/// Build a saver/reverter pair sharing one snapshot store. Both stages use
/// the same `nt_chunk` so their chunks line up position for position.
pub fn make_saver_reverter(nt_chunk: Pos) -> Result<(PipelineObject, PipelineObject)> {
    let (saver, state) = make_saver(nt_chunk)?;
    let reverter = make_reverter(state, nt_chunk)?;
    Ok((saver, reverter))
}
