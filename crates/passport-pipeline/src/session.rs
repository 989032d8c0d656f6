//! Session driver: executes orchestrator effects and serves commands.
//!
//! One tokio task owns the [`Orchestrator`]. Commands arrive over an mpsc
//! channel from [`SessionHandle`]s; background completions (analysis,
//! segmentation, composition) arrive on a second channel. After every input
//! a fresh [`Snapshot`] is published on a `watch` channel.

use crate::orchestrator::{
    CancelScope, CommandError, ComposeRequest, Effect, Orchestrator, Snapshot,
};
use crate::worker::{spawn_segmentation_worker, SegmentationDone, SegmentationWorker};
use image::RgbImage;
use passport_core::{
    compose, export_png, AnalysisError, AnalysisResult, Analyzer, CompositionWarning,
    ExportError, Field, Framing, OutputCanvas, ParamValue, ParameterDefaults, Segmenter,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use uuid::Uuid;

const COMMAND_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session task exited")]
    ChannelClosed,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("failed to start segmentation thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Settings the driver needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub framing: Framing,
    pub defaults: ParameterDefaults,
    pub thumbnail_max_side: u32,
    pub analysis_timeout: Duration,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests from the editing surface to the session task.
enum Command {
    LoadImage {
        image: RgbImage,
        reply: Reply<Uuid>,
    },
    SetParameters {
        values: Vec<ParamValue>,
        reply: Reply<()>,
    },
    ResetParameter {
        field: Field,
        reply: Reply<()>,
    },
    Reanalyze {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    Export {
        path: PathBuf,
        reply: Reply<Vec<CompositionWarning>>,
    },
}

/// Background work reporting back to the session task.
enum Completion {
    Analysis {
        generation: u64,
        attempt: u64,
        result: Result<AnalysisResult, AnalysisError>,
    },
    Segmentation(SegmentationDone),
    Composition {
        generation: u64,
        revision: u64,
        canvas: OutputCanvas,
    },
}

/// Clone-safe handle to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Start a new job. Returns the job id.
    pub async fn load_image(&self, image: RgbImage) -> Result<Uuid, SessionError> {
        self.request(|reply| Command::LoadImage { image, reply }).await
    }

    /// Override one parameter.
    pub async fn set_parameter(&self, value: ParamValue) -> Result<(), SessionError> {
        self.set_parameters(vec![value]).await
    }

    /// Override several parameters atomically.
    pub async fn set_parameters(&self, values: Vec<ParamValue>) -> Result<(), SessionError> {
        self.request(|reply| Command::SetParameters { values, reply })
            .await
    }

    pub async fn reset_parameter(&self, field: Field) -> Result<(), SessionError> {
        self.request(|reply| Command::ResetParameter { field, reply })
            .await
    }

    pub async fn reanalyze(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Reanalyze { reply }).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Render the current parameters and write them as PNG.
    pub async fn export(&self, path: PathBuf) -> Result<Vec<CompositionWarning>, SessionError> {
        self.request(|reply| Command::Export { path, reply }).await
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait for the first snapshot satisfying `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&Snapshot) -> bool,
    ) -> Result<Snapshot, SessionError> {
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        Ok(snapshot.clone())
    }
}

/// Spawn the session task and its segmentation thread.
///
/// Must be called from within a tokio runtime. `analyzer` is `None` when no
/// credential is configured; the pipeline then runs without suggestions.
pub fn spawn_session(
    options: SessionOptions,
    analyzer: Option<Arc<dyn Analyzer>>,
    segmenter: Box<dyn Segmenter>,
) -> Result<SessionHandle, SessionError> {
    let (completion_tx, completion_rx) = mpsc::unbounded_channel::<Completion>();
    let (seg_tx, mut seg_rx) = mpsc::unbounded_channel::<SegmentationDone>();

    let worker = spawn_segmentation_worker(segmenter, seg_tx).map_err(SessionError::Spawn)?;

    // Forward segmentation results into the common completion stream.
    let forward = completion_tx.clone();
    tokio::spawn(async move {
        while let Some(done) = seg_rx.recv().await {
            if forward.send(Completion::Segmentation(done)).is_err() {
                break;
            }
        }
    });

    let orchestrator = Orchestrator::new(
        options.framing,
        options.defaults,
        options.thumbnail_max_side,
        analyzer.is_some(),
    );
    let (snapshot_tx, snapshot_rx) = watch::channel(orchestrator.snapshot());
    let (tx, rx) = mpsc::channel::<Command>(COMMAND_QUEUE_DEPTH);

    let driver = Driver {
        orchestrator,
        analyzer,
        worker,
        analysis_timeout: options.analysis_timeout,
        analysis_task: None,
        compose_queue: ComposeQueue::default(),
        completion_tx,
        snapshot_tx,
    };
    tokio::spawn(driver.run(rx, completion_rx));

    tracing::info!("session started");
    Ok(SessionHandle {
        tx,
        snapshots: snapshot_rx,
    })
}

/// At most one composition runs at a time. Requests made meanwhile collapse
/// into a single queued one, the newest.
#[derive(Default)]
struct ComposeQueue {
    running: bool,
    queued: Option<ComposeRequest>,
}

impl ComposeQueue {
    /// Returns the request to start now, if the renderer is idle.
    fn offer(&mut self, request: ComposeRequest) -> Option<ComposeRequest> {
        if !self.running {
            self.running = true;
            return Some(request);
        }
        if let Some(superseded) = self.queued.replace(request) {
            tracing::debug!(revision = superseded.revision, "queued composition superseded");
        }
        None
    }

    /// The running composition finished; returns the next one to start.
    fn finished(&mut self) -> Option<ComposeRequest> {
        let next = self.queued.take();
        self.running = next.is_some();
        next
    }

    fn clear_queued(&mut self) {
        self.queued = None;
    }
}

struct Driver {
    orchestrator: Orchestrator,
    analyzer: Option<Arc<dyn Analyzer>>,
    worker: SegmentationWorker,
    analysis_timeout: Duration,
    analysis_task: Option<AbortHandle>,
    compose_queue: ComposeQueue,
    completion_tx: mpsc::UnboundedSender<Completion>,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = completions.recv() => {
                    self.handle_completion(completion);
                    self.publish();
                }
            }
        }
        if let Some(task) = self.analysis_task.take() {
            task.abort();
        }
        tracing::info!("session ended");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.orchestrator.snapshot());
    }

    /// Replies go out after the snapshot so callers observe their own change.
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::LoadImage { image, reply } => {
                let effects = self.orchestrator.load_image(image);
                self.execute(effects);
                let id = self
                    .orchestrator
                    .job()
                    .map(|job| job.id)
                    .ok_or(SessionError::Command(CommandError::NoImage));
                self.publish();
                let _ = reply.send(id);
            }
            Command::SetParameters { values, reply } => {
                let result = self.orchestrator.set_parameters(&values);
                let result = self.settle(result);
                let _ = reply.send(result);
            }
            Command::ResetParameter { field, reply } => {
                let result = self.orchestrator.reset_parameter(field);
                let result = self.settle(result);
                let _ = reply.send(result);
            }
            Command::Reanalyze { reply } => {
                let result = self.orchestrator.reanalyze();
                let result = self.settle(result);
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                let effects = self.orchestrator.close();
                self.execute(effects);
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::Export { path, reply } => match self.orchestrator.compose_request() {
                Some(request) => self.export(request, path, reply),
                None => {
                    let _ = reply.send(Err(SessionError::Export(ExportError::NoImage)));
                }
            },
        }
    }

    fn settle(&mut self, result: Result<Vec<Effect>, CommandError>) -> Result<(), SessionError> {
        let effects = result?;
        self.execute(effects);
        self.publish();
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) {
        let effects = match completion {
            Completion::Analysis {
                generation,
                attempt,
                result,
            } => self.orchestrator.analysis_completed(generation, attempt, result),
            Completion::Segmentation(SegmentationDone { generation, result }) => {
                self.orchestrator.segmentation_completed(generation, result)
            }
            Completion::Composition {
                generation,
                revision,
                canvas,
            } => {
                if let Some(next) = self.compose_queue.finished() {
                    self.spawn_compose(next);
                }
                self.orchestrator
                    .compose_completed(generation, revision, canvas)
            }
        };
        self.execute(effects);
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Analyze {
                    generation,
                    attempt,
                    thumbnail,
                } => self.spawn_analysis(generation, attempt, thumbnail),
                Effect::Segment { generation, source } => self.worker.submit(generation, source),
                Effect::Compose(request) => {
                    if let Some(request) = self.compose_queue.offer(request) {
                        self.spawn_compose(request);
                    }
                }
                Effect::Cancel { scope, generation } => {
                    if let Some(task) = self.analysis_task.take() {
                        task.abort();
                        tracing::debug!(generation, "in-flight analysis cancelled");
                    }
                    if scope == CancelScope::All {
                        self.compose_queue.clear_queued();
                        self.worker.cancel_before(generation);
                    }
                }
            }
        }
    }

    fn spawn_analysis(&mut self, generation: u64, attempt: u64, thumbnail: Arc<RgbImage>) {
        let tx = self.completion_tx.clone();
        let Some(analyzer) = self.analyzer.clone() else {
            let _ = tx.send(Completion::Analysis {
                generation,
                attempt,
                result: Err(AnalysisError::Unavailable("no analyzer configured".into())),
            });
            return;
        };
        let timeout = self.analysis_timeout;

        let task = tokio::spawn(async move {
            let call = tokio::task::spawn_blocking(move || analyzer.analyze(&thumbnail));
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(AnalysisError::MalformedResponse(format!(
                    "analysis task failed: {e}"
                ))),
                Err(_) => Err(AnalysisError::Timeout(timeout.as_secs())),
            };
            let _ = tx.send(Completion::Analysis {
                generation,
                attempt,
                result,
            });
        });
        if let Some(previous) = self.analysis_task.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    fn spawn_compose(&self, request: ComposeRequest) {
        let tx = self.completion_tx.clone();
        let framing = *self.orchestrator.framing();
        tokio::task::spawn_blocking(move || {
            let canvas = compose(
                &request.source,
                request.mask.as_deref(),
                &request.params,
                &framing,
            );
            let _ = tx.send(Completion::Composition {
                generation: request.generation,
                revision: request.revision,
                canvas,
            });
        });
    }

    fn export(&self, request: ComposeRequest, path: PathBuf, reply: Reply<Vec<CompositionWarning>>) {
        let framing = *self.orchestrator.framing();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let canvas = compose(
                    &request.source,
                    request.mask.as_deref(),
                    &request.params,
                    &framing,
                );
                export_png(&canvas, &path).map(|()| canvas.warnings)
            })
            .await;
            let result = match result {
                Ok(Ok(warnings)) => Ok(warnings),
                Ok(Err(e)) => Err(SessionError::Export(e)),
                Err(_) => Err(SessionError::ChannelClosed),
            };
            let _ = reply.send(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Notice, PipelineState};
    use image::{GrayImage, Luma, Rgb};
    use passport_core::params::defaults_for;
    use passport_core::types::NormalizedPoint;
    use passport_core::{
        BorderColor, Color, Provenance, SegmentationError, SegmentationMask, Tagged,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(10);

    struct FixedAnalyzer {
        delay: Duration,
        result: Result<AnalysisResult, AnalysisError>,
    }

    impl Analyzer for FixedAnalyzer {
        fn analyze(&self, _: &RgbImage) -> Result<AnalysisResult, AnalysisError> {
            std::thread::sleep(self.delay);
            self.result.clone()
        }
    }

    struct FakeSegmenter {
        calls: Arc<AtomicUsize>,
        missing: bool,
    }

    impl Segmenter for FakeSegmenter {
        fn segment(&mut self, image: &RgbImage) -> Result<SegmentationMask, SegmentationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.missing {
                return Err(SegmentationError::ModelMissing("u2net.onnx".into()));
            }
            Ok(SegmentationMask::new(GrayImage::from_pixel(
                image.width(),
                image.height(),
                Luma([255]),
            )))
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            framing: Framing::new(400, 0.10, 0.75).unwrap(),
            defaults: ParameterDefaults::default(),
            thumbnail_max_side: 64,
            analysis_timeout: Duration::from_secs(2),
        }
    }

    fn suggestion() -> AnalysisResult {
        AnalysisResult {
            background_color: Color::new(0xE8, 0xEE, 0xF2),
            head_top: NormalizedPoint { x: 0.5, y: 0.1 },
            chest: NormalizedPoint { x: 0.5, y: 0.6 },
        }
    }

    fn analyzer(result: Result<AnalysisResult, AnalysisError>) -> Option<Arc<dyn Analyzer>> {
        Some(Arc::new(FixedAnalyzer {
            delay: Duration::ZERO,
            result,
        }))
    }

    fn segmenter(missing: bool) -> (Box<dyn Segmenter>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(FakeSegmenter {
                calls: Arc::clone(&calls),
                missing,
            }),
            calls,
        )
    }

    fn portrait() -> RgbImage {
        RgbImage::from_pixel(300, 400, Rgb([180, 120, 90]))
    }

    async fn composed_at_least(handle: &SessionHandle, revision: u64) -> Snapshot {
        tokio::time::timeout(
            WAIT,
            handle.wait_for(|s| {
                s.state == PipelineState::Composed && s.canvas_revision >= Some(revision)
            }),
        )
        .await
        .expect("timed out waiting for composition")
        .unwrap()
    }

    fn request(revision: u64) -> ComposeRequest {
        let framing = Framing::new(400, 0.10, 0.75).unwrap();
        ComposeRequest {
            generation: 1,
            revision,
            source: Arc::new(RgbImage::new(30, 40)),
            mask: None,
            params: defaults_for(30, 40, &framing, &ParameterDefaults::default()),
        }
    }

    #[test]
    fn test_compose_queue_keeps_one_running_and_newest_queued() {
        let mut queue = ComposeQueue::default();
        assert_eq!(queue.offer(request(1)).map(|r| r.revision), Some(1));
        // A burst of edits while the first render runs.
        for revision in 2..=5 {
            assert!(queue.offer(request(revision)).is_none());
        }
        assert_eq!(queue.finished().map(|r| r.revision), Some(5));
        assert!(queue.offer(request(6)).is_none());
        assert_eq!(queue.finished().map(|r| r.revision), Some(6));
        assert!(queue.finished().is_none());
        // Idle again: the next request starts immediately.
        assert_eq!(queue.offer(request(7)).map(|r| r.revision), Some(7));
    }

    #[test]
    fn test_compose_queue_clear_drops_only_queued() {
        let mut queue = ComposeQueue::default();
        queue.offer(request(1));
        queue.offer(request(2));
        queue.clear_queued();
        assert!(queue.finished().is_none());
        assert!(queue.offer(request(3)).is_some());
    }

    #[tokio::test]
    async fn test_rapid_edits_end_on_latest_revision() {
        let (seg, _) = segmenter(false);
        let handle = spawn_session(options(), None, seg).unwrap();
        handle.load_image(portrait()).await.unwrap();
        composed_at_least(&handle, 0).await;

        for width in 1..=8 {
            handle
                .set_parameter(ParamValue::BorderWidth(width))
                .await
                .unwrap();
        }
        let latest = handle.snapshot().revision;
        let snap = composed_at_least(&handle, latest).await;
        assert_eq!(snap.canvas_revision, Some(latest));
        assert_eq!(snap.parameters.unwrap().border_width_px.value, 8);
        let canvas = snap.canvas.unwrap();
        assert_eq!(*canvas.image.get_pixel(7, 200), Rgb([0, 0, 0]));
    }

    #[tokio::test]
    async fn test_load_composes_with_ai_suggestion() {
        let (seg, calls) = segmenter(false);
        let handle = spawn_session(options(), analyzer(Ok(suggestion())), seg).unwrap();

        let id = handle.load_image(portrait()).await.unwrap();
        let snap = composed_at_least(&handle, 0).await;

        assert_eq!(snap.job_id, Some(id));
        let params = snap.parameters.unwrap();
        assert_eq!(params.background_color.value, Color::new(0xE8, 0xEE, 0xF2));
        assert_eq!(params.background_color.provenance, Provenance::AiSuggested);
        let canvas = snap.canvas.unwrap();
        assert_eq!(canvas.image.dimensions(), (300, 400));
        assert!(canvas.warnings.is_empty(), "{:?}", canvas.warnings);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_analyzer_uses_defaults_and_notifies() {
        let (seg, _) = segmenter(false);
        let handle = spawn_session(options(), None, seg).unwrap();

        handle.load_image(portrait()).await.unwrap();
        let snap = composed_at_least(&handle, 0).await;
        assert!(snap.notices.contains(&Notice::AiUnavailable));
        assert!(!snap.ai_available);
        let params = snap.parameters.unwrap();
        assert_eq!(
            params.background_color,
            Tagged::new(Color::WHITE, Provenance::Default)
        );
    }

    #[tokio::test]
    async fn test_unavailable_analysis_disables_ai() {
        let (seg, _) = segmenter(false);
        let handle = spawn_session(
            options(),
            analyzer(Err(AnalysisError::Unavailable("no key".into()))),
            seg,
        )
        .unwrap();

        handle.load_image(portrait()).await.unwrap();
        let snap = composed_at_least(&handle, 0).await;
        assert!(!snap.ai_available);
        assert!(snap.notices.contains(&Notice::AiUnavailable));
    }

    #[tokio::test]
    async fn test_model_missing_degrades_composition() {
        let (seg, _) = segmenter(true);
        let handle = spawn_session(options(), analyzer(Ok(suggestion())), seg).unwrap();

        handle.load_image(portrait()).await.unwrap();
        let snap = composed_at_least(&handle, 0).await;
        assert!(snap.notices.contains(&Notice::BackgroundRemovalUnavailable));
        assert!(snap
            .canvas
            .unwrap()
            .has_warning(CompositionWarning::DegradedNoMask));
    }

    #[tokio::test]
    async fn test_analysis_timeout_keeps_defaults() {
        let (seg, _) = segmenter(false);
        let mut opts = options();
        opts.analysis_timeout = Duration::from_millis(50);
        let slow: Option<Arc<dyn Analyzer>> = Some(Arc::new(FixedAnalyzer {
            delay: Duration::from_millis(500),
            result: Ok(suggestion()),
        }));
        let handle = spawn_session(opts, slow, seg).unwrap();

        handle.load_image(portrait()).await.unwrap();
        let snap = composed_at_least(&handle, 0).await;
        assert!(snap.notices.contains(&Notice::AiTimedOut));
        assert!(snap.ai_available);
        assert_eq!(
            snap.parameters.unwrap().crop_top_y.provenance,
            Provenance::Default
        );
    }

    #[tokio::test]
    async fn test_border_color_change_recomposes_without_resegmenting() {
        let (seg, calls) = segmenter(false);
        let handle = spawn_session(options(), analyzer(Ok(suggestion())), seg).unwrap();
        handle.load_image(portrait()).await.unwrap();
        let first = composed_at_least(&handle, 0).await;

        handle
            .set_parameter(ParamValue::BorderColor(BorderColor::White))
            .await
            .unwrap();
        let second = composed_at_least(&handle, first.revision + 1).await;

        assert_eq!(
            second.parameters.unwrap().border_color.value,
            BorderColor::White
        );
        let canvas = second.canvas.unwrap();
        assert_eq!(*canvas.image.get_pixel(0, 0), Rgb([255, 255, 255]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_parameter_is_reported() {
        let (seg, _) = segmenter(false);
        let handle = spawn_session(options(), None, seg).unwrap();
        assert!(matches!(
            handle.set_parameter(ParamValue::BorderWidth(2)).await,
            Err(SessionError::Command(CommandError::NoImage))
        ));

        handle.load_image(portrait()).await.unwrap();
        let result = handle.set_parameter(ParamValue::CropCenterX(-5.0)).await;
        assert!(matches!(result, Err(SessionError::Command(CommandError::Param(_)))));
    }

    #[tokio::test]
    async fn test_export_writes_png() {
        let (seg, _) = segmenter(false);
        let handle = spawn_session(options(), None, seg).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/passport.png");

        assert!(matches!(
            handle.export(path.clone()).await,
            Err(SessionError::Export(ExportError::NoImage))
        ));

        handle.load_image(portrait()).await.unwrap();
        composed_at_least(&handle, 0).await;
        let warnings = handle.export(path.clone()).await.unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (300, 400));
    }

    #[tokio::test]
    async fn test_close_returns_to_idle() {
        let (seg, _) = segmenter(false);
        let handle = spawn_session(options(), analyzer(Ok(suggestion())), seg).unwrap();
        handle.load_image(portrait()).await.unwrap();
        composed_at_least(&handle, 0).await;

        handle.close().await.unwrap();
        let snap = handle.snapshot();
        assert_eq!(snap.state, PipelineState::Idle);
        assert!(snap.canvas.is_none());
        assert!(snap.job_id.is_none());
    }

    #[tokio::test]
    async fn test_new_image_supersedes_old_job() {
        let (seg, _) = segmenter(false);
        let handle = spawn_session(options(), analyzer(Ok(suggestion())), seg).unwrap();
        let first = handle.load_image(portrait()).await.unwrap();
        let second = handle
            .load_image(RgbImage::from_pixel(400, 300, Rgb([10, 10, 10])))
            .await
            .unwrap();
        assert_ne!(first, second);

        let snap = composed_at_least(&handle, 0).await;
        assert_eq!(snap.job_id, Some(second));
        assert_eq!(snap.generation, 2);
    }
}
