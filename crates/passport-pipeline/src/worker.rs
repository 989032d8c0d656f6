use image::RgbImage;
use passport_core::{SegmentationError, SegmentationMask, Segmenter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A segmentation result tagged with the generation it was computed for.
pub(crate) struct SegmentationDone {
    pub generation: u64,
    pub result: Result<SegmentationMask, SegmentationError>,
}

struct SegmentRequest {
    generation: u64,
    source: Arc<RgbImage>,
}

/// Handle to the segmentation thread.
///
/// `current` holds the newest generation; queued requests for older ones are
/// skipped without running the model.
pub(crate) struct SegmentationWorker {
    tx: mpsc::UnboundedSender<SegmentRequest>,
    current: Arc<AtomicU64>,
}

impl SegmentationWorker {
    pub fn submit(&self, generation: u64, source: Arc<RgbImage>) {
        self.current.store(generation, Ordering::SeqCst);
        if self.tx.send(SegmentRequest { generation, source }).is_err() {
            tracing::error!(generation, "segmentation thread is gone; request dropped");
        }
    }

    /// Mark every generation below `generation` as cancelled.
    pub fn cancel_before(&self, generation: u64) {
        self.current.fetch_max(generation, Ordering::SeqCst);
    }
}

/// Spawn the segmenter on a dedicated OS thread.
///
/// Model inference is CPU-bound and can take seconds on large images, so it
/// stays off both the async runtime and its blocking pool.
pub(crate) fn spawn_segmentation_worker(
    mut segmenter: Box<dyn Segmenter>,
    done: mpsc::UnboundedSender<SegmentationDone>,
) -> std::io::Result<SegmentationWorker> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SegmentRequest>();
    let current = Arc::new(AtomicU64::new(0));
    let latest = Arc::clone(&current);

    std::thread::Builder::new()
        .name("passport-segmenter".into())
        .spawn(move || {
            tracing::info!("segmentation thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.generation < latest.load(Ordering::SeqCst) {
                    tracing::debug!(generation = req.generation, "skipping stale segmentation request");
                    continue;
                }
                let started = std::time::Instant::now();
                let result = segmenter.segment(&req.source);
                tracing::info!(
                    generation = req.generation,
                    ok = result.is_ok(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "segmentation finished"
                );
                if done
                    .send(SegmentationDone {
                        generation: req.generation,
                        result,
                    })
                    .is_err()
                {
                    break;
                }
            }
            tracing::info!("segmentation thread exiting");
        })?;

    Ok(SegmentationWorker { tx, current })
}
