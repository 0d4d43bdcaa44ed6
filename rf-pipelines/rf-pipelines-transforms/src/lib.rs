//! Concrete stages for the rf-pipelines runtime
//!
//! Everything here plugs into the seams defined by `rf-pipelines-core`:
//! sources create the paired `"INTENSITY"`/`"WEIGHTS"` ring buffers,
//! transforms consume them through the [`wi::WiKernel`] adapter, and every
//! stage with a JSON-shaped configuration registers a factory under its
//! class name (see [`register_transforms`]).

#![warn(missing_docs)]

pub mod bitmask;
pub mod chime;
pub mod mask_counter;
pub mod mask_filler;
pub mod noise;
pub mod saver;
pub mod std_dev_clipper;
pub mod wi;

pub use chime::{make_chime_mask_counter, AssembledChunk, ChimeMaskCounter, MaskStreamBridge};
pub use mask_counter::{make_mask_counter, MaskCountCallback, MaskCounter, MaskCounterMeasurements};
pub use mask_filler::make_mask_filler;
pub use noise::make_gaussian_noise_source;
pub use saver::{make_reverter, make_saver, make_saver_reverter};
pub use std_dev_clipper::{clip_1d, make_std_dev_clipper, Axis};
pub use wi::{wi_stage, WiChunk, WiKernel, WiStage};

use std::sync::Once;

static REGISTER: Once = Once::new();

/// Register the JSON factories of every stage class in this crate.
/// Idempotent; call once at startup before using
/// `rf_pipelines_core::registry::from_json`.
pub fn register_transforms() {
    REGISTER.call_once(|| {
        use rf_pipelines_core::registry::register_json_factory;

        // The registry is write-once per key; the Once guard makes the
        // expects unreachable unless another crate claimed one of these
        // class names first.
        register_json_factory("gaussian_noise_source", noise::from_json)
            .expect("class name 'gaussian_noise_source' already registered");
        register_json_factory("std_dev_clipper", std_dev_clipper::from_json)
            .expect("class name 'std_dev_clipper' already registered");
        register_json_factory("mask_counter", mask_counter::from_json)
            .expect("class name 'mask_counter' already registered");
        register_json_factory("chime_mask_counter", chime::from_json)
            .expect("class name 'chime_mask_counter' already registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_pipelines_core::stage::AttrMap;
    use rf_pipelines_core::{Pipeline, PipelineObject, Result};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Pass-through kernel publishing the stream attributes an external
    /// telescope source would provide.
    struct FpgaHeader {
        initial_fpga_count: u64,
        fpga_counts_per_sample: i64,
    }

    impl WiKernel for FpgaHeader {
        fn start_wi(&mut self, attrs: &mut AttrMap) -> Result<()> {
            attrs.insert("initial_fpga_count".into(), Value::from(self.initial_fpga_count));
            attrs.insert("fpga_counts_per_sample".into(), Value::from(self.fpga_counts_per_sample));
            Ok(())
        }

        fn process(&mut self, _chunk: &mut WiChunk<'_>) -> Result<bool> {
            Ok(true)
        }
    }

    fn fpga_header(initial: u64, per_sample: i64) -> PipelineObject {
        wi_stage(
            "fpga_header",
            "fpga_header",
            Box::new(FpgaHeader {
                initial_fpga_count: initial,
                fpga_counts_per_sample: per_sample,
            }),
            0,
        )
    }

    #[derive(Default)]
    struct CollectingCallback {
        seen: Arc<Mutex<Vec<MaskCounterMeasurements>>>,
    }

    impl MaskCountCallback for CollectingCallback {
        fn mask_count(&mut self, meas: &MaskCounterMeasurements) {
            self.seen.lock().unwrap().push(meas.clone());
        }
    }

    #[test]
    fn test_noise_clipper_counter_pipeline() {
        let dir = tempfile::tempdir().unwrap();

        let source = make_gaussian_noise_source(16, 1024, 1.0, 256, Some(7)).unwrap();
        let clipper = make_std_dev_clipper(256, Axis::Time, 2.0, 2, 2).unwrap();
        let counter = make_mask_counter(256, "after_clipper").unwrap();

        let mut p = Pipeline::new(vec![source, clipper, counter]).unwrap();
        let out = p.run(Some(dir.path()), 0, false).unwrap();

        let children = out.get("pipeline").and_then(Value::as_array).unwrap();
        assert_eq!(children.len(), 3);

        let counter_doc = &children[2];
        assert_eq!(counter_doc.get("where").and_then(Value::as_str), Some("after_clipper"));

        let processed = counter_doc.get("nsamples_processed").and_then(Value::as_i64).unwrap();
        let masked = counter_doc.get("nsamples_masked").and_then(Value::as_i64).unwrap();
        assert!(processed >= 16 * 1024);
        assert!((0..=processed).contains(&masked));

        // the attribute document also lands on disk
        assert!(dir.path().join("rf_pipeline_0.json").exists());
    }

    #[test]
    fn test_mask_counter_callback_measurements() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut counter = MaskCounter::new("test");
        counter.add_callback(Box::new(CollectingCallback { seen: Arc::clone(&seen) }));

        let source = make_gaussian_noise_source(4, 256, 1.0, 64, Some(3)).unwrap();
        let mut p = Pipeline::new(vec![source, counter.into_stage(64)]).unwrap();
        p.run(None, 0, false).unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 4);
        // every sample inside nt_tot carries unit weight
        for meas in seen.iter().take(4) {
            assert_eq!(meas.nsamples, 4 * 64);
            assert_eq!(meas.nsamples_masked, 0);
            assert_eq!(meas.nf_masked, 0);
        }
    }

    /// In-memory assembled-chunk stream covering some positions and not
    /// others.
    struct StubStream {
        chunks: HashMap<u64, Arc<AssembledChunk>>,
        notified: Mutex<usize>,
    }

    impl MaskStreamBridge for StubStream {
        fn find_assembled_chunk(&self, _beam: i32, fpga_counts: u64) -> Option<Arc<AssembledChunk>> {
            self.chunks.get(&fpga_counts).cloned()
        }

        fn filled_rfi_mask(&self, _chunk: &Arc<AssembledChunk>) {
            *self.notified.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_chime_mask_counter_fills_rfi_masks() {
        let nfreq = 8;
        let nt_chunk = 64;
        let initial = 1000u64;
        let per_sample = 2i64;

        // assembled chunks exist for positions 0 and 64; position 128 is
        // missing and falls back to the generic counter
        let mut chunks = HashMap::new();
        for pos in [0i64, 64] {
            let fpga = (pos as u64) * (per_sample as u64) + initial;
            chunks.insert(fpga, Arc::new(AssembledChunk::new(nfreq, nt_chunk)));
        }
        let stream = Arc::new(StubStream {
            chunks,
            notified: Mutex::new(0),
        });

        let source = make_gaussian_noise_source(nfreq, 192, 1.0, nt_chunk, Some(11)).unwrap();
        let header = fpga_header(initial, per_sample);
        let counter =
            make_chime_mask_counter(nt_chunk, "chime", Some((Arc::clone(&stream) as Arc<dyn MaskStreamBridge>, 0))).unwrap();

        let mut p = Pipeline::new(vec![source, header, counter]).unwrap();
        p.run(None, 0, false).unwrap();

        assert_eq!(*stream.notified.lock().unwrap(), 2);

        for pos in [0i64, 64] {
            let fpga = (pos as u64) * (per_sample as u64) + initial;
            let chunk = stream.find_assembled_chunk(0, fpga).unwrap();
            assert!(chunk.has_rfi_mask());

            // unit weights everywhere inside nt_tot: every bit set
            let mask = chunk.rfi_mask().unwrap().lock().unwrap();
            assert!(mask.iter().all(|&b| b == 0xff));
        }
    }

    #[test]
    fn test_chime_mask_counter_degrades_without_mask_array() {
        let nfreq = 8;
        let nt_chunk = 64;

        // chunk exists but carries no rfi_mask array
        let mut chunks = HashMap::new();
        chunks.insert(500u64, Arc::new(AssembledChunk::without_mask(nfreq)));
        let stream = Arc::new(StubStream {
            chunks,
            notified: Mutex::new(0),
        });

        let source = make_gaussian_noise_source(nfreq, 64, 1.0, nt_chunk, Some(5)).unwrap();
        let header = fpga_header(500, 1);
        let counter =
            make_chime_mask_counter(nt_chunk, "chime", Some((Arc::clone(&stream) as Arc<dyn MaskStreamBridge>, 0))).unwrap();

        let mut p = Pipeline::new(vec![source, header, counter]).unwrap();
        let out = p.run(None, 0, false).unwrap();

        // the fallback pathway still produces counter totals
        let children = out.get("pipeline").and_then(Value::as_array).unwrap();
        let totals = children[2].get("nsamples_processed").and_then(Value::as_i64).unwrap();
        assert!(totals >= (nfreq * nt_chunk) as i64);
        assert_eq!(*stream.notified.lock().unwrap(), 0);
    }

    #[test]
    fn test_chime_mask_counter_requires_fpga_attrs() {
        let source = make_gaussian_noise_source(8, 64, 1.0, 64, None).unwrap();
        let counter = make_chime_mask_counter(64, "chime", None).unwrap();

        // no upstream stage published the fpga attributes
        let mut p = Pipeline::new(vec![source, counter]).unwrap();
        assert!(p.run(None, 0, false).is_err());
    }

    /// Destroys the stream so the reverter has something to undo.
    struct Zeroer;

    impl WiKernel for Zeroer {
        fn process(&mut self, chunk: &mut WiChunk<'_>) -> Result<bool> {
            for f in 0..chunk.nfreq as usize {
                chunk.intensity.row_mut(f).iter_mut().for_each(|x| *x = 0.0);
                chunk.weights.row_mut(f).iter_mut().for_each(|w| *w = 0.0);
            }
            Ok(true)
        }
    }

    #[test]
    fn test_saver_reverter_restores_stream() {
        let (saver, reverter) = make_saver_reverter(64).unwrap();
        let zeroer = wi_stage("zeroer", "zeroer", Box::new(Zeroer), 64);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut counter = MaskCounter::new("after_revert");
        counter.add_callback(Box::new(CollectingCallback { seen: Arc::clone(&seen) }));

        let source = make_gaussian_noise_source(4, 256, 1.0, 64, Some(9)).unwrap();
        let mut p = Pipeline::new(vec![source, saver, zeroer, reverter, counter.into_stage(64)]).unwrap();
        p.run(None, 0, false).unwrap();

        // without the reverter the zeroer would mask every sample
        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 4);
        for meas in seen.iter().take(4) {
            assert_eq!(meas.nsamples_masked, 0);
        }
    }

    #[test]
    fn test_registered_pipeline_roundtrip() {
        register_transforms();
        register_transforms(); // idempotent

        let source = make_gaussian_noise_source(16, 1024, 1.0, 256, None).unwrap();
        let clipper = make_std_dev_clipper(256, Axis::Time, 2.0, 1, 1).unwrap();
        let counter = make_mask_counter(256, "end").unwrap();
        let p = Pipeline::new(vec![source, clipper, counter]).unwrap();

        let doc = p.jsonize().unwrap();
        let rebuilt = rf_pipelines_core::registry::from_json(&doc).unwrap();
        assert_eq!(rebuilt.jsonize().unwrap(), doc);
    }
}
