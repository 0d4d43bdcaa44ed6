//! Std-dev clipper: masks lines whose weighted variance is an outlier
//!
//! For each line along the clip axis (a frequency channel for the time
//! axis, a time sample for the frequency axis), the clipper computes the
//! weighted variance of the intensity, optionally after downsampling by
//! (`Df`, `Dt`), and then masks every line whose variance deviates from the
//! ensemble mean by more than `sigma` standard deviations. Masking zeroes
//! the weights at full resolution.

use serde_json::Value;

use rf_pipelines_core::ring_buffer::Pos;
use rf_pipelines_core::{Error, PipelineObject, Result};

use crate::wi::{wi_stage, WiChunk, WiKernel};

/// Clip axis convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Along frequency; one variance per time sample.
    Freq,
    /// Along time; one variance per frequency channel.
    Time,
}

impl Axis {
    fn as_str(self) -> &'static str {
        match self {
            Axis::Freq => "freq",
            Axis::Time => "time",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "freq" => Ok(Axis::Freq),
            "time" => Ok(Axis::Time),
            _ => Err(Error::Stage(format!("std_dev_clipper: unknown axis '{}'", s))),
        }
    }
}

/// Mask entries of a 1-d variance array more than `sigma` standard
/// deviations from the (unweighted) mean of the valid entries. With fewer
/// than two valid entries, everything is masked.
pub fn clip_1d(sd: &[f32], valid: &mut [bool], sigma: f64) {
    assert_eq!(sd.len(), valid.len());

    let mut acc0 = 0.0f32;
    let mut acc1 = 0.0f32;

    for (i, &s) in sd.iter().enumerate() {
        if valid[i] {
            acc0 += 1.0;
            acc1 += s;
        }
    }

    if acc0 < 1.5 {
        valid.iter_mut().for_each(|v| *v = false);
        return;
    }

    let mean = acc1 / acc0;
    let mut acc2 = 0.0f32;

    for (i, &s) in sd.iter().enumerate() {
        if valid[i] {
            acc2 += (s - mean) * (s - mean);
        }
    }

    let stdv = (acc2 / acc0).sqrt();
    let thresh = (sigma as f32) * stdv;

    for (i, &s) in sd.iter().enumerate() {
        if (s - mean).abs() >= thresh {
            valid[i] = false;
        }
    }
}

fn is_power_of_two(n: i64) -> bool {
    n > 0 && (n & (n - 1)) == 0
}

/// Per-axis weighted-variance clipping kernel.
pub struct StdDevClipper {
    axis: Axis,
    sigma: f64,
    df: i64,
    dt: i64,
    nfreq: i64,

    // scratch, reused across chunks
    wsum: Vec<f32>,
    wisum: Vec<f32>,
    wiisum: Vec<f32>,
    tmp_sd: Vec<f32>,
    tmp_valid: Vec<bool>,
}

impl StdDevClipper {
    fn downsample(&mut self, chunk: &WiChunk<'_>, ds_nf: usize, ds_nt: usize) {
        let n = ds_nf * ds_nt;
        self.wsum.clear();
        self.wsum.resize(n, 0.0);
        self.wisum.clear();
        self.wisum.resize(n, 0.0);
        self.wiisum.clear();
        self.wiisum.resize(n, 0.0);

        for jf in 0..chunk.nfreq as usize {
            let irow = chunk.intensity.row(jf);
            let wrow = chunk.weights.row(jf);
            let fi = jf / self.df as usize;

            for jt in 0..chunk.nt as usize {
                let ti = jt / self.dt as usize;
                let k = fi * ds_nt + ti;
                let w = wrow[jt];
                let x = irow[jt];

                self.wsum[k] += w;
                self.wisum[k] += w * x;
                self.wiisum[k] += w * x * x;
            }
        }
    }
}

impl WiKernel for StdDevClipper {
    fn set_nfreq(&mut self, nfreq: i64) -> Result<()> {
        if nfreq % self.df != 0 {
            return Err(Error::Stage(format!(
                "std_dev_clipper: nfreq={} must be a multiple of the downsampling factor Df={}",
                nfreq, self.df
            )));
        }
        self.nfreq = nfreq;
        Ok(())
    }

    fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
        let nf = chunk.nfreq;
        let nt = chunk.nt;

        assert!(nf == self.nfreq, "std_dev_clipper: chunk channel count changed after bind");
        if nt % self.dt != 0 {
            return Err(Error::Stage(format!(
                "std_dev_clipper: chunk length nt={} must be a multiple of the downsampling factor Dt={}",
                nt, self.dt
            )));
        }

        let ds_nf = (nf / self.df) as usize;
        let ds_nt = (nt / self.dt) as usize;
        self.downsample(chunk, ds_nf, ds_nt);

        // one weighted variance per line along the clip axis
        let nlines = match self.axis {
            Axis::Time => ds_nf,
            Axis::Freq => ds_nt,
        };

        self.tmp_sd.clear();
        self.tmp_sd.resize(nlines, 0.0);
        self.tmp_valid.clear();
        self.tmp_valid.resize(nlines, false);

        for line in 0..nlines {
            let mut acc0 = 0.0f32;
            let mut acc1 = 0.0f32;
            let mut acc2 = 0.0f32;

            let (outer, inner_stride, base) = match self.axis {
                Axis::Time => (ds_nt, 1, line * ds_nt),
                Axis::Freq => (ds_nf, ds_nt, line),
            };

            for j in 0..outer {
                let k = base + j * inner_stride;
                acc0 += self.wsum[k];
                acc1 += self.wisum[k];
                acc2 += self.wiisum[k];
            }

            if acc0 > 0.0 {
                let mean = acc1 / acc0;
                // variance, not standard deviation: the clip statistic is
                // the second central moment of the line
                self.tmp_sd[line] = acc2 / acc0 - mean * mean;
                self.tmp_valid[line] = true;
            }
        }

        clip_1d(&self.tmp_sd, &mut self.tmp_valid, self.sigma);

        // zero the weights of clipped lines at full resolution
        match self.axis {
            Axis::Time => {
                for line in 0..nlines {
                    if self.tmp_valid[line] {
                        continue;
                    }
                    for jf in (line * self.df as usize)..((line + 1) * self.df as usize) {
                        chunk.weights.row_mut(jf).iter_mut().for_each(|w| *w = 0.0);
                    }
                }
            }
            Axis::Freq => {
                for jf in 0..nf as usize {
                    let wrow = chunk.weights.row_mut(jf);
                    for line in 0..nlines {
                        if self.tmp_valid[line] {
                            continue;
                        }
                        for jt in (line * self.dt as usize)..((line + 1) * self.dt as usize) {
                            wrow[jt] = 0.0;
                        }
                    }
                }
            }
        }

        Ok(true)
    }

    fn jsonize(&self, nt_chunk: Pos) -> Result<Value> {
        Ok(serde_json::json!({
            "class_name": "std_dev_clipper",
            "nt_chunk": nt_chunk,
            "axis": self.axis.as_str(),
            "sigma": self.sigma,
            "Df": self.df,
            "Dt": self.dt,
        }))
    }
}

/// Build a std-dev clipper stage.
///
/// `Df`/`Dt` are the frequency/time downsampling factors (powers of two);
/// `sigma` is the clip threshold in ensemble standard deviations.
pub fn make_std_dev_clipper(
    nt_chunk: Pos,
    axis: Axis,
    sigma: f64,
    df: i64,
    dt: i64,
) -> Result<PipelineObject> {
    if !is_power_of_two(df) {
        return Err(Error::Stage(format!("std_dev_clipper: Df={} must be a power of two", df)));
    }
    if !is_power_of_two(dt) {
        return Err(Error::Stage(format!("std_dev_clipper: Dt={} must be a power of two", dt)));
    }
    if sigma < 1.0 {
        return Err(Error::Stage(format!("std_dev_clipper: sigma={} must be >= 1.0", sigma)));
    }
    if nt_chunk <= 0 {
        return Err(Error::Stage("std_dev_clipper: expected nt_chunk > 0".into()));
    }
    if nt_chunk % dt != 0 {
        return Err(Error::Stage(format!(
            "std_dev_clipper: nt_chunk={} must be a multiple of the downsampling factor Dt={}",
            nt_chunk, dt
        )));
    }

    let kernel = StdDevClipper {
        axis,
        sigma,
        df,
        dt,
        nfreq: 0,
        wsum: Vec::new(),
        wisum: Vec::new(),
        wiisum: Vec::new(),
        tmp_sd: Vec::new(),
        tmp_valid: Vec::new(),
    };

    let name = format!(
        "std_dev_clipper(nt_chunk={}, axis={}, sigma={}, Df={}, Dt={})",
        nt_chunk,
        axis.as_str(),
        sigma,
        df,
        dt
    );
    Ok(wi_stage("std_dev_clipper", &name, Box::new(kernel), nt_chunk))
}

pub(crate) fn from_json(v: &Value) -> Result<PipelineObject> {
    let nt_chunk = v
        .get("nt_chunk")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Stage("std_dev_clipper: expected integer field 'nt_chunk'".into()))?;
    let axis = v
        .get("axis")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Stage("std_dev_clipper: expected string field 'axis'".into()))?;
    let sigma = v
        .get("sigma")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Stage("std_dev_clipper: expected number field 'sigma'".into()))?;
    let df = v.get("Df").and_then(Value::as_i64).unwrap_or(1);
    let dt = v.get("Dt").and_then(Value::as_i64).unwrap_or(1);

    make_std_dev_clipper(nt_chunk, Axis::from_str(axis)?, sigma, df, dt)
}
