//! Simulated stream source emitting Gaussian noise
//!
//! Creates the paired `"INTENSITY"`/`"WEIGHTS"` ring buffers and appends
//! Gaussian intensity with unit weights until a configured total length,
//! then signals end-of-stream. Useful as the first stage of test and
//! benchmark pipelines.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde_json::Value;

use rf_pipelines_core::chunked::ChunkedKernel;
use rf_pipelines_core::ring_buffer::{AccessMode, Pos, RingBuffer, RingBufferDict};
use rf_pipelines_core::stage::{AttrMap, StageCore};
use rf_pipelines_core::{ChunkedStage, Error, PipelineObject, Result};

use crate::wi::{INTENSITY, WEIGHTS};

/// Can-be-first chunked source producing Gaussian intensity samples.
pub struct GaussianNoiseSource {
    nfreq: i64,
    nt_tot: Pos,
    sample_rms: f32,
    seed: Option<u64>,
    rng: StdRng,
    rb_intensity: Option<Arc<RingBuffer>>,
    rb_weights: Option<Arc<RingBuffer>>,
}

impl ChunkedKernel for GaussianNoiseSource {
    fn bind_chunked(
        &mut self,
        core: &mut StageCore,
        rb_dict: &mut RingBufferDict,
        _attrs: &mut AttrMap,
    ) -> Result<()> {
        self.rb_intensity = Some(core.create_buffer(rb_dict, INTENSITY, vec![self.nfreq], 1)?);
        self.rb_weights = Some(core.create_buffer(rb_dict, WEIGHTS, vec![self.nfreq], 1)?);
        Ok(())
    }

    fn start_chunked(&mut self, _core: &mut StageCore, _attrs: &mut AttrMap) -> Result<()> {
        self.rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(())
    }

    fn process_chunk(&mut self, _core: &mut StageCore, pos: Pos, nt_chunk: Pos) -> Result<bool> {
        let ri = self.rb_intensity.as_ref().expect("process_chunk() before bind()");
        let rw = self.rb_weights.as_ref().expect("process_chunk() before bind()");

        let mut iw = ri.get(pos, pos + nt_chunk, AccessMode::Append);
        let mut ww = rw.get(pos, pos + nt_chunk, AccessMode::Append);

        for f in 0..self.nfreq as usize {
            for x in iw.row_mut(f).iter_mut() {
                let g: f32 = self.rng.sample(StandardNormal);
                *x = self.sample_rms * g;
            }
            for (t, w) in ww.row_mut(f).iter_mut().enumerate() {
                *w = if pos + (t as i64) < self.nt_tot { 1.0 } else { 0.0 };
            }
        }

        iw.put();
        ww.put();
        Ok(pos + nt_chunk < self.nt_tot)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({
            "class_name": "gaussian_noise_source",
            "nfreq": self.nfreq,
            "nt_tot": self.nt_tot,
            "sample_rms": self.sample_rms,
            "nt_chunk": nt_chunk,
        }))
    }
}

/// Build a Gaussian noise source stage. `seed = None` draws entropy at each
/// run; a fixed seed makes runs reproducible.
pub fn make_gaussian_noise_source(
    nfreq: i64,
    nt_tot: Pos,
    sample_rms: f32,
    nt_chunk: Pos,
    seed: Option<u64>,
) -> Result<PipelineObject> {
    if nfreq <= 0 {
        return Err(Error::Stage("gaussian_noise_source: expected nfreq > 0".into()));
    }
    if nt_tot <= 0 {
        return Err(Error::Stage("gaussian_noise_source: expected nt_tot > 0".into()));
    }
    if nt_chunk <= 0 {
        return Err(Error::Stage("gaussian_noise_source: expected nt_chunk > 0".into()));
    }
    if sample_rms <= 0.0 {
        return Err(Error::Stage("gaussian_noise_source: expected sample_rms > 0".into()));
    }

    let kernel = GaussianNoiseSource {
        nfreq,
        nt_tot,
        sample_rms,
        seed,
        rng: StdRng::seed_from_u64(0),
        rb_intensity: None,
        rb_weights: None,
    };

    let name = format!(
        "gaussian_noise_source(nfreq={}, nt_tot={}, nt_chunk={})",
        nfreq, nt_tot, nt_chunk
    );
    Ok(PipelineObject::new(
        "gaussian_noise_source",
        &name,
        Box::new(ChunkedStage::new(Box::new(kernel), nt_chunk, true)),
    ))
}

pub(crate) fn from_json(v: &Value) -> Result<PipelineObject> {
    let nfreq = v
        .get("nfreq")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Stage("gaussian_noise_source: expected integer field 'nfreq'".into()))?;
    let nt_tot = v
        .get("nt_tot")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Stage("gaussian_noise_source: expected integer field 'nt_tot'".into()))?;
    let nt_chunk = v
        .get("nt_chunk")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Stage("gaussian_noise_source: expected integer field 'nt_chunk'".into()))?;
    let sample_rms = v.get("sample_rms").and_then(Value::as_f64).unwrap_or(1.0);

    make_gaussian_noise_source(nfreq, nt_tot, sample_rms as f32, nt_chunk, None)
}
