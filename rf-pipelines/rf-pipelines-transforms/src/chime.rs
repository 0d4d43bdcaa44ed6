//! Telescope mask counter: fills bit-packed RFI masks in an external stream
//!
//! Decorates the generic mask counter with a bridge to an external
//! assembled-chunk stream. Each processed chunk is located in the stream by
//! FPGA count, its bit-packed RFI mask is filled from the weights (bit set
//! = unmasked), and the stream's output devices are notified. Any missing
//! or mismatched upstream state degrades to the generic counter with a
//! warning rather than failing the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{info, warn};

use rf_pipelines_core::ring_buffer::Pos;
use rf_pipelines_core::stage::{i64_attr, u64_attr, AttrMap};
use rf_pipelines_core::{Error, PipelineObject, Result};

use crate::mask_counter::{MaskCounter, MaskCountCallback};
use crate::wi::{wi_stage, WiChunk, WiKernel};

/// One assembled chunk held by the external stream, carrying an optional
/// bit-packed RFI mask of shape (`nrfifreq`, `nt/8`).
#[derive(Debug)]
pub struct AssembledChunk {
    nrfifreq: i64,
    rfi_mask: Option<Mutex<Vec<u8>>>,
    has_rfi_mask: AtomicBool,
}

impl AssembledChunk {
    /// Chunk with an allocated (zeroed) RFI mask for `nt` time samples.
    pub fn new(nrfifreq: i64, nt: i64) -> Self {
        assert!(nrfifreq > 0);
        assert!(nt > 0 && nt % 8 == 0);
        Self {
            nrfifreq,
            rfi_mask: Some(Mutex::new(vec![0u8; (nrfifreq * nt / 8) as usize])),
            has_rfi_mask: AtomicBool::new(false),
        }
    }

    /// Chunk without an RFI mask array (triggers the degraded pathway).
    pub fn without_mask(nrfifreq: i64) -> Self {
        Self {
            nrfifreq,
            rfi_mask: None,
            has_rfi_mask: AtomicBool::new(false),
        }
    }

    /// Number of RFI mask channels the chunk expects.
    pub fn nrfifreq(&self) -> i64 {
        self.nrfifreq
    }

    /// The bit-packed mask storage, if the chunk carries one.
    pub fn rfi_mask(&self) -> Option<&Mutex<Vec<u8>>> {
        self.rfi_mask.as_ref()
    }

    /// Whether the mask has been filled.
    pub fn has_rfi_mask(&self) -> bool {
        self.has_rfi_mask.load(Ordering::Acquire)
    }

    fn set_rfi_mask_filled(&self) {
        self.has_rfi_mask.store(true, Ordering::Release);
    }
}

/// Bridge to the external assembled-chunk stream.
pub trait MaskStreamBridge: Send + Sync {
    /// Locate the assembled chunk covering the given FPGA count for a beam.
    fn find_assembled_chunk(&self, beam: i32, fpga_counts: u64) -> Option<Arc<AssembledChunk>>;

    /// Notify the stream's output devices that a chunk's RFI mask has been
    /// filled.
    fn filled_rfi_mask(&self, chunk: &Arc<AssembledChunk>);
}

/// Mask counter that additionally fills RFI masks in an external stream.
pub struct ChimeMaskCounter {
    base: MaskCounter,
    stream: Option<Arc<dyn MaskStreamBridge>>,
    beam: i32,
    initial_fpga_count: u64,
    fpga_counts_per_sample: i64,
    fpga_counts_initialized: bool,
}

impl ChimeMaskCounter {
    /// Create a counter with no stream attached; without a stream every
    /// chunk takes the generic fallback pathway.
    pub fn new(where_: &str) -> Self {
        Self {
            base: MaskCounter::new(where_),
            stream: None,
            beam: 0,
            initial_fpga_count: 0,
            fpga_counts_per_sample: 0,
            fpga_counts_initialized: false,
        }
    }

    /// Attach the external stream and beam id.
    pub fn set_stream(&mut self, stream: Arc<dyn MaskStreamBridge>, beam: i32) {
        self.stream = Some(stream);
        self.beam = beam;
    }

    /// Register a per-chunk observer on the underlying counter.
    pub fn add_callback(&mut self, cb: Box<dyn MaskCountCallback>) {
        self.base.add_callback(cb);
    }

    /// Wrap the counter into a ready-to-compose stage.
    pub fn into_stage(self, nt_chunk: Pos) -> PipelineObject {
        let name = format!(
            "chime_mask_counter(nt_chunk={}, where={})",
            nt_chunk,
            self.base.where_label()
        );
        wi_stage("chime_mask_counter", &name, Box::new(self), nt_chunk)
    }

    /// Generic-counter pathway used when the stream chunk is unusable.
    fn fallback(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        let meas = self.base.measure(chunk);
        self.base.record(meas);
        Ok(true)
    }
}

impl WiKernel for ChimeMaskCounter {
    fn set_nfreq(&mut self, nfreq: i64) -> Result<()> {
        self.base.set_nfreq(nfreq)
    }

    fn start_wi(&mut self, attrs: &mut AttrMap) -> Result<()> {
        self.base.start_wi(attrs)?;
        self.initial_fpga_count = u64_attr(attrs, "initial_fpga_count")?;
        self.fpga_counts_per_sample = i64_attr(attrs, "fpga_counts_per_sample")?;
        self.fpga_counts_initialized = true;
        Ok(())
    }

    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        let nt = chunk.nt;

        let stream = match &self.stream {
            Some(s) => Arc::clone(s),
            None => {
                warn!("chime_mask_counter: processing chunk, but stream not set");
                return self.fallback(chunk);
            }
        };

        if !self.fpga_counts_initialized {
            return Err(Error::Stage(
                "chime_mask_counter: internal error: fpga count fields were not initialized as expected".into(),
            ));
        }

        info!(pos = chunk.pos, "chime_mask_counter: finding chunk");
        let fpga_counts = (chunk.pos as u64) * (self.fpga_counts_per_sample as u64) + self.initial_fpga_count;

        let assembled = stream.find_assembled_chunk(self.beam, fpga_counts);
        let assembled = match assembled {
            Some(c) => c,
            None => {
                warn!(
                    beam = self.beam,
                    fpga_counts, "chime_mask_counter: could not find an assembled chunk"
                );
                return self.fallback(chunk);
            }
        };

        if assembled.rfi_mask().is_none() {
            warn!("chime_mask_counter: found chunk, but it has no rfi_mask array");
            return self.fallback(chunk);
        }
        if assembled.nrfifreq() != chunk.nfreq {
            warn!(
                expected = assembled.nrfifreq(),
                actual = chunk.nfreq,
                "chime_mask_counter: chunk RFI channel count does not match the stream"
            );
            return self.fallback(chunk);
        }
        if nt % 8 != 0 {
            warn!(nt, "chime_mask_counter: chunk length is not a multiple of 8, cannot bit-pack");
            return self.fallback(chunk);
        }

        let nfreq = chunk.nfreq;
        let mut meas = crate::mask_counter::MaskCounterMeasurements {
            pos: chunk.pos,
            nsamples: nfreq * nt,
            nsamples_masked: 0,
            nt,
            nt_masked: 0,
            nf: nfreq,
            nf_masked: 0,
            freqs_masked: vec![0; nfreq as usize],
            times_masked: vec![0; nt as usize],
        };

        {
            let mut rfimask = assembled.rfi_mask().unwrap().lock().unwrap();
            for i_f in 0..nfreq as usize {
                let row = chunk.weights.row(i_f);
                for i_t in 0..(nt / 8) as usize {
                    let mut m_out: u8 = 0;
                    for j in 0..8 {
                        if row[8 * i_t + j] == 0.0 {
                            meas.nsamples_masked += 1;
                            meas.freqs_masked[i_f] += 1;
                            meas.times_masked[8 * i_t + j] += 1;
                        } else {
                            m_out |= 1 << j;
                        }
                    }
                    rfimask[i_f * (nt / 8) as usize + i_t] = m_out;
                }
            }
        }

        assembled.set_rfi_mask_filled();

        meas.nf_masked = meas.freqs_masked.iter().filter(|&&c| c as i64 == nt).count() as i64;
        meas.nt_masked = meas.times_masked.iter().filter(|&&c| c as i64 == nfreq).count() as i64;
        self.base.record(meas);

        stream.filled_rfi_mask(&assembled);
        Ok(true)
    }

    fn end_wi(&mut self, attrs: &mut AttrMap) -> Result<()> {
        self.base.end_wi(attrs)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({
            "class_name": "chime_mask_counter",
            "nt_chunk": nt_chunk,
            "where": self.base.where_label(),
        }))
    }
}

/// Build a telescope mask-counter stage. With `stream = None` the stage
/// runs entirely on the generic fallback pathway.
pub fn make_chime_mask_counter(
    nt_chunk: Pos,
    where_: &str,
    stream: Option<(Arc<dyn MaskStreamBridge>, i32)>,
) -> Result<PipelineObject> {
    let mut kernel = ChimeMaskCounter::new(where_);
    if let Some((s, beam)) = stream {
        kernel.set_stream(s, beam);
    }
    Ok(kernel.into_stage(nt_chunk))
}

pub(crate) fn from_json(v: &Value) -> Result<PipelineObject> {
    let nt_chunk = v
        .get("nt_chunk")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Stage("chime_mask_counter: expected integer field 'nt_chunk'".into()))?;
    let where_ = v
        .get("where")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Stage("chime_mask_counter: expected string field 'where'".into()))?;

    make_chime_mask_counter(nt_chunk, where_, None)
}
