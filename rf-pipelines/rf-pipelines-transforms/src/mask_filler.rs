//! Mask filler: replaces low-weight samples with synthetic noise
//!
//! Given a per-channel variance table measured over an earlier pass, the
//! filler replaces every sample whose weight is at or below a cutoff with
//! Gaussian noise scaled by the table entry, and normalizes the weights of
//! everything it touches. Channels whose table entry is zero were fully
//! masked during measurement and stay masked.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde_json::Value;

use rf_pipelines_core::ring_buffer::Pos;
use rf_pipelines_core::stage::AttrMap;
use rf_pipelines_core::{Error, PipelineObject, Result};

use crate::wi::{wi_stage, WiChunk, WiKernel};

/// Weight assigned to every filled or passed-through sample.
const FILLED_WEIGHT: f32 = 2.0;

/// Gaussian fill-in kernel driven by a (nfreq, nvar) variance table.
pub struct MaskFiller {
    var: Vec<f32>,
    nvar: i64,
    n_varsamples: i64,
    w_cutoff: f32,
    seed: Option<u64>,
    rng: StdRng,
}

impl WiKernel for MaskFiller {
    fn set_nfreq(&mut self, nfreq: i64) -> Result<()> {
        if self.var.len() as i64 != nfreq * self.nvar {
            return Err(Error::Stage(format!(
                "mask_filler: variance table has {} entries, expected nfreq*nvar = {}",
                self.var.len(),
                nfreq * self.nvar
            )));
        }
        Ok(())
    }

    fn start_wi(&mut self, _attrs: &mut AttrMap) -> Result<()> {
        self.rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(())
    }

    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        let nvar = self.nvar;

        for f in 0..chunk.nfreq as usize {
            // fill decisions read the weights row, then both rows are
            // rewritten, so the samples to touch are gathered first
            let to_fill: Vec<(usize, f32)> = {
                let wrow = chunk.weights.row(f);
                wrow.iter()
                    .enumerate()
                    .filter(|(_, &w)| w <= self.w_cutoff)
                    .map(|(t, _)| {
                        // bin boundaries fall every n_varsamples stored
                        // samples from the stream origin; positions past
                        // the table clamp to its last column
                        let ivar = ((chunk.pos / chunk.nds + t as i64) / self.n_varsamples).min(nvar - 1);
                        (t, self.var[f * nvar as usize + ivar as usize])
                    })
                    .collect()
            };

            {
                let irow = chunk.intensity.row_mut(f);
                for &(t, v) in &to_fill {
                    if v != 0.0 {
                        let g: f32 = self.rng.sample(StandardNormal);
                        irow[t] = v * v * g;
                    }
                }
            }

            let wrow = chunk.weights.row_mut(f);
            for w in wrow.iter_mut() {
                if *w > self.w_cutoff {
                    *w = FILLED_WEIGHT;
                }
            }
            for &(t, v) in &to_fill {
                wrow[t] = if v == 0.0 { 0.0 } else { FILLED_WEIGHT };
            }
        }

        Ok(true)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({
            "class_name": "mask_filler",
            "nt_chunk": nt_chunk,
            "nvar": self.nvar,
            "n_varsamples": self.n_varsamples,
            "w_cutoff": self.w_cutoff,
        }))
    }
}

/// Build a mask-filler stage from a flattened (nfreq, nvar) variance table.
///
/// `n_varsamples` is the number of input positions each table column
/// covers; `nt_chunk` must be a multiple of it.
pub fn make_mask_filler(
    var: Vec<f32>,
    nvar: i64,
    n_varsamples: i64,
    w_cutoff: f32,
    nt_chunk: Pos,
    seed: Option<u64>,
) -> Result<PipelineObject> {
    if nvar <= 0 {
        return Err(Error::Stage("mask_filler: expected nvar > 0".into()));
    }
    if var.len() as i64 % nvar != 0 {
        return Err(Error::Stage(
            "mask_filler: variance table length must be a multiple of nvar".into(),
        ));
    }
    if n_varsamples <= 0 {
        return Err(Error::Stage("mask_filler: expected n_varsamples > 0".into()));
    }
    if nt_chunk <= 0 || nt_chunk % n_varsamples != 0 {
        return Err(Error::Stage(format!(
            "mask_filler: nt_chunk(={}) must be a positive multiple of n_varsamples(={})",
            nt_chunk, n_varsamples
        )));
    }

    let kernel = MaskFiller {
        var,
        nvar,
        n_varsamples,
        w_cutoff,
        seed,
        rng: StdRng::seed_from_u64(0),
    };

    let name = format!(
        "mask_filler(w_cutoff={}, nt_chunk={})",
        w_cutoff, nt_chunk
    );
    Ok(wi_stage("mask_filler", &name, Box::new(kernel), nt_chunk))
}
