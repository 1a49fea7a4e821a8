//! Prefetching loader: a worker thread runs the transform pipeline (boundary
//! synthesis included) and feeds finished sample groups through a bounded
//! channel. The training thread blocks only on `recv`, and the channel bound
//! gives backpressure so the producer can never run unboundedly ahead.

use crate::aug::SegTransformPipeline;
use crate::batch::{collate, SegBatch};
use crate::source::SampleSource;
use crate::types::{Normalizer, SegDatasetResult, SegSample};
use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,
    /// Drop a trailing partial batch (training stability for small batches).
    pub drop_last: bool,
    /// Number of prepared batches the channel may hold.
    pub prefetch: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            shuffle: true,
            seed: None,
            drop_last: false,
            prefetch: 2,
        }
    }
}

type Msg = Option<SegDatasetResult<Vec<SegSample>>>;

/// One epoch's worth of prefetched batches.
///
/// The transform pipeline is stateless and side-effect free, so samples
/// within a group are processed in parallel with rayon and re-emerge in
/// their original order.
pub struct PrefetchLoader {
    rx: Option<Receiver<Msg>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PrefetchLoader {
    pub fn spawn(
        source: Arc<dyn SampleSource>,
        pipeline: SegTransformPipeline,
        mut indices: Vec<usize>,
        cfg: LoaderConfig,
    ) -> Self {
        let batch_size = cfg.batch_size.max(1);
        if cfg.shuffle {
            let mut rng = match cfg.seed {
                Some(s) => rand::rngs::StdRng::seed_from_u64(s),
                None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
            };
            indices.shuffle(&mut rng);
        }
        let (tx, rx) = bounded::<Msg>(cfg.prefetch.max(1));
        let drop_last = cfg.drop_last;
        let handle = thread::spawn(move || {
            for chunk in indices.chunks(batch_size) {
                if drop_last && chunk.len() < batch_size {
                    break;
                }
                let result: SegDatasetResult<Vec<SegSample>> = chunk
                    .par_iter()
                    .map(|&i| {
                        let raw = source.load(i)?;
                        pipeline.apply(raw.id, raw.image, raw.labels)
                    })
                    .collect();
                let failed = result.is_err();
                if tx.send(Some(result)).is_err() {
                    // Receiver dropped; stop producing.
                    return;
                }
                if failed {
                    // Fail fast: corrupted supervision must not keep flowing.
                    break;
                }
            }
            let _ = tx.send(None);
        });
        Self {
            rx: Some(rx),
            handle: Some(handle),
        }
    }

    /// Blocks for the next prepared sample group; `None` once exhausted.
    pub fn next_samples(&self) -> SegDatasetResult<Option<Vec<SegSample>>> {
        let rx = match &self.rx {
            Some(rx) => rx,
            None => return Ok(None),
        };
        match rx.recv() {
            Ok(Some(Ok(samples))) => Ok(Some(samples)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) | Err(_) => Ok(None),
        }
    }

    /// Next group collated into device tensors on the calling thread.
    pub fn next_batch<B: burn::tensor::backend::Backend>(
        &self,
        normalizer: &Normalizer,
        device: &B::Device,
    ) -> SegDatasetResult<Option<SegBatch<B>>> {
        match self.next_samples()? {
            Some(samples) => Ok(Some(collate::<B>(&samples, normalizer, device)?)),
            None => Ok(None),
        }
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        // Close the consuming end first so a blocked producer unblocks.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
