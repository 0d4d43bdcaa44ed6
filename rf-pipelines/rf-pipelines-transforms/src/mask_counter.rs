//! Mask counter: per-chunk statistics on zero-weight samples
//!
//! Counts masked (zero-weight) samples overall, per frequency channel and
//! per time sample, reports each chunk's measurements to registered
//! callbacks, and accumulates run totals into its end-of-run attributes.

use serde_json::Value;
use tracing::info;

use rf_pipelines_core::ring_buffer::Pos;
use rf_pipelines_core::stage::AttrMap;
use rf_pipelines_core::{Error, PipelineObject, Result};

use crate::wi::{wi_stage, WiChunk, WiKernel};

/// Per-chunk mask statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MaskCounterMeasurements {
    /// First position of the measured chunk.
    pub pos: Pos,
    /// Total samples in the chunk (`nf * nt`).
    pub nsamples: i64,
    /// Samples with zero weight.
    pub nsamples_masked: i64,
    /// Time samples per channel.
    pub nt: i64,
    /// Time samples masked across every channel.
    pub nt_masked: i64,
    /// Frequency channels.
    pub nf: i64,
    /// Channels masked across every time sample.
    pub nf_masked: i64,
    /// Masked-sample count per channel.
    pub freqs_masked: Vec<u16>,
    /// Masked-sample count per time sample.
    pub times_masked: Vec<u16>,
}

/// Observer notified once per measured chunk.
pub trait MaskCountCallback: Send {
    /// Called after each chunk's statistics are assembled.
    fn mask_count(&mut self, meas: &MaskCounterMeasurements);
}

/// Generic mask-counting kernel.
pub struct MaskCounter {
    where_: String,
    nfreq: i64,
    callbacks: Vec<Box<dyn MaskCountCallback>>,
    total_samples: i64,
    total_masked: i64,
}

impl MaskCounter {
    /// Create a counter; `where_` labels the counter's placement in the
    /// pipeline (it appears in logs and output attributes).
    pub fn new(where_: &str) -> Self {
        Self {
            where_: where_.to_string(),
            nfreq: 0,
            callbacks: Vec::new(),
            total_samples: 0,
            total_masked: 0,
        }
    }

    /// Placement label of this counter.
    pub fn where_label(&self) -> &str {
        &self.where_
    }

    /// Register a per-chunk observer.
    pub fn add_callback(&mut self, cb: Box<dyn MaskCountCallback>) {
        self.callbacks.push(cb);
    }

    /// Wrap the counter into a ready-to-compose stage.
    pub fn into_stage(self, nt_chunk: Pos) -> PipelineObject {
        let name = format!("mask_counter(nt_chunk={}, where={})", nt_chunk, self.where_);
        wi_stage("mask_counter", &name, Box::new(self), nt_chunk)
    }

    /// Assemble the chunk's statistics from the weights window.
    pub(crate) fn measure(&self, chunk: &WiChunk<'_>) -> MaskCounterMeasurements {
        debug_assert_eq!(chunk.nfreq, self.nfreq);

        let nf = chunk.nfreq;
        let nt = chunk.nt;

        let mut meas = MaskCounterMeasurements {
            pos: chunk.pos,
            nsamples: nf * nt,
            nsamples_masked: 0,
            nt,
            nt_masked: 0,
            nf,
            nf_masked: 0,
            freqs_masked: vec![0; nf as usize],
            times_masked: vec![0; nt as usize],
        };

        for i_f in 0..nf as usize {
            let row = chunk.weights.row(i_f);
            for (i_t, &w) in row.iter().enumerate() {
                if w == 0.0 {
                    meas.nsamples_masked += 1;
                    meas.freqs_masked[i_f] += 1;
                    meas.times_masked[i_t] += 1;
                }
            }
        }

        meas.nf_masked = meas.freqs_masked.iter().filter(|&&c| c as i64 == nt).count() as i64;
        meas.nt_masked = meas.times_masked.iter().filter(|&&c| c as i64 == nf).count() as i64;

        meas
    }

    /// Record a chunk's statistics: log, accumulate totals, notify
    /// callbacks.
    pub(crate) fn record(&mut self, meas: MaskCounterMeasurements) {
        info!(
            where_ = %self.where_,
            pos = meas.pos,
            "mask_counter: {}/{} samples masked, {}/{} times, {}/{} freqs",
            meas.nsamples_masked,
            meas.nsamples,
            meas.nt_masked,
            meas.nt,
            meas.nf_masked,
            meas.nf,
        );

        self.total_samples += meas.nsamples;
        self.total_masked += meas.nsamples_masked;

        for cb in &mut self.callbacks {
            cb.mask_count(&meas);
        }
    }

    pub(crate) fn write_attrs(&self, attrs: &mut AttrMap) {
        attrs.insert("where".into(), Value::from(self.where_.clone()));
        attrs.insert("nsamples_processed".into(), Value::from(self.total_samples));
        attrs.insert("nsamples_masked".into(), Value::from(self.total_masked));
    }

    pub(crate) fn reset_totals(&mut self) {
        self.total_samples = 0;
        self.total_masked = 0;
    }
}

impl WiKernel for MaskCounter {
    fn set_nfreq(&mut self, nfreq: i64) -> Result<()> {
        self.nfreq = nfreq;
        Ok(())
    }

    fn start_wi(&mut self, _attrs: &mut AttrMap) -> Result<()> {
        self.reset_totals();
        Ok(())
    }

    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        let meas = self.measure(chunk);
        self.record(meas);
        Ok(true)
    }

    fn end_wi(&mut self, attrs: &mut AttrMap) -> Result<()> {
        self.write_attrs(attrs);
        Ok(())
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({
            "class_name": "mask_counter",
            "nt_chunk": nt_chunk,
            "where": self.where_,
        }))
    }
}

/// Build a generic mask-counter stage.
pub fn make_mask_counter(nt_chunk: Pos, where_: &str) -> Result<PipelineObject> {
    if nt_chunk < 0 {
        return Err(Error::Stage("mask_counter: expected nt_chunk >= 0".into()));
    }
    Ok(MaskCounter::new(where_).into_stage(nt_chunk))
}

pub(crate) fn from_json(v: &Value) -> Result<PipelineObject> {
    let nt_chunk = v
        .get("nt_chunk")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Stage("mask_counter: expected integer field 'nt_chunk'".into()))?;
    let where_ = v
        .get("where")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Stage("mask_counter: expected string field 'where'".into()))?;

    make_mask_counter(nt_chunk, where_)
}
