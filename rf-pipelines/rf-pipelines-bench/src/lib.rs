//! Benchmarks for rf-pipelines components

use std::sync::Arc;
use std::time::{Duration, Instant};

use rf_pipelines_core::ring_buffer::{AccessMode, RingBuffer};
use rf_pipelines_core::{Pipeline, Result};
use rf_pipelines_transforms::{make_gaussian_noise_source, make_mask_counter, make_std_dev_clipper, Axis};

/// Benchmark configuration
pub struct BenchConfig {
    /// Number of measured iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Number of frequency channels
    pub nfreq: i64,

    /// Chunk size in samples
    pub nt_chunk: i64,

    /// Total stream length in samples
    pub nt_tot: i64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 3,
            nfreq: 1024,
            nt_chunk: 1024,
            nt_tot: 65536,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Throughput (samples/second)
    pub throughput: f64,
}

/// Run a benchmark
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, samples_per_iter: i64, mut func: F) -> Result<BenchResult>
where
    F: FnMut() -> Result<()>,
{
    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let start = Instant::now();

    for _ in 0..config.iterations {
        let t0 = Instant::now();
        func()?;
        times.push(t0.elapsed());
    }

    let total_time = start.elapsed();
    let avg_time = total_time / config.iterations as u32;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();

    let samples = (samples_per_iter * config.iterations as i64) as f64;
    let throughput = samples / total_time.as_secs_f64();

    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}

/// Append/read cycles through a ring buffer, including wrap-around
/// mirroring.
pub fn bench_ring_buffer(config: &BenchConfig) -> Result<BenchResult> {
    let rb = Arc::new(RingBuffer::new(vec![config.nfreq], 1)?);
    rb.update_params(config.nt_chunk, 4 * config.nt_chunk);
    rb.allocate()?;

    let nfreq = config.nfreq;
    let nt_chunk = config.nt_chunk;
    let nchunks = config.nt_tot / nt_chunk;

    run_benchmark("ring_buffer", config, config.nt_tot * nfreq, move || {
        rb.start();
        for c in 0..nchunks {
            let pos = c * nt_chunk;

            let mut w = rb.get(pos, pos + nt_chunk, AccessMode::Append);
            for f in 0..nfreq as usize {
                w.row_mut(f).iter_mut().for_each(|x| *x = pos as f32);
            }
            w.put();

            let r = rb.get(pos, pos + nt_chunk, AccessMode::Read);
            let mut acc = 0.0f32;
            for f in 0..nfreq as usize {
                acc += r.row(f)[0];
            }
            r.put();
            std::hint::black_box(acc);
        }
        Ok(())
    })
}

/// End-to-end noise → clipper → counter pipeline.
pub fn bench_pipeline(config: &BenchConfig) -> Result<BenchResult> {
    let nfreq = config.nfreq;
    let nt_chunk = config.nt_chunk;
    let nt_tot = config.nt_tot;

    run_benchmark("pipeline", config, nt_tot * nfreq, move || {
        let source = make_gaussian_noise_source(nfreq, nt_tot, 1.0, nt_chunk, Some(1))?;
        let clipper = make_std_dev_clipper(nt_chunk, Axis::Time, 2.0, 1, 1)?;
        let counter = make_mask_counter(nt_chunk, "bench")?;

        let mut p = Pipeline::new(vec![source, clipper, counter])?;
        p.run(None, 0, false)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bench_smoke() {
        let config = BenchConfig {
            iterations: 2,
            warmup_iterations: 1,
            nfreq: 16,
            nt_chunk: 128,
            nt_tot: 1024,
        };

        let r = bench_ring_buffer(&config).unwrap();
        assert!(r.throughput > 0.0);
        assert!(r.min_time <= r.max_time);

        let r = bench_pipeline(&config).unwrap();
        assert!(r.throughput > 0.0);
    }
}
