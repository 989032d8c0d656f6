//! Pipeline state machine.
//!
//! Sans-IO: every input (a user command or a background completion) updates
//! the state and returns the [`Effect`]s the driver must execute. Results are
//! tagged with the generation (and analysis attempt or parameter revision)
//! they were requested for; anything older than the current values is
//! dropped without touching the store or the job.

use crate::job::{MaskState, PhotoJob};
use image::RgbImage;
use passport_core::{
    AnalysisError, AnalysisResult, Applied, Field, Framing, OutputCanvas, ParamError, ParamValue,
    ParameterDefaults, ParameterStore, Parameters, Provenance, SegmentationError,
    SegmentationMask, Stage,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    AnalysisPending,
    AnalysisDone,
    AnalysisFailed,
    SegmentationPending,
    Ready,
    Composing,
    Composed,
}

/// Non-blocking user notices. Degraded modes, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    AiUnavailable,
    AiTimedOut,
    AiMalformed,
    BackgroundRemovalUnavailable,
    SegmentationFailed,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Notice::AiUnavailable => "AI suggestion unavailable",
            Notice::AiTimedOut => "AI suggestion timed out",
            Notice::AiMalformed => "AI suggestion could not be used",
            Notice::BackgroundRemovalUnavailable => "background removal unavailable",
            Notice::SegmentationFailed => "background removal failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub analysis: TaskStatus,
    pub segmentation: TaskStatus,
    pub composition: TaskStatus,
}

/// Everything the compositor needs, pinned to a generation and revision.
#[derive(Debug, Clone)]
pub struct ComposeRequest {
    pub generation: u64,
    pub revision: u64,
    pub source: Arc<RgbImage>,
    pub mask: Option<Arc<SegmentationMask>>,
    pub params: Parameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Everything belonging to generations older than the one given.
    All,
    /// Only the in-flight analysis call.
    Analysis,
}

/// Work the driver must perform.
#[derive(Debug, Clone)]
pub enum Effect {
    Analyze {
        generation: u64,
        attempt: u64,
        thumbnail: Arc<RgbImage>,
    },
    Segment {
        generation: u64,
        source: Arc<RgbImage>,
    },
    Compose(ComposeRequest),
    Cancel {
        scope: CancelScope,
        generation: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("no image loaded")]
    NoImage,
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Observable pipeline state, published after every input.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub job_id: Option<Uuid>,
    pub state: PipelineState,
    pub parameters: Option<Parameters>,
    /// Parameter revision of the current store.
    pub revision: u64,
    pub canvas: Option<Arc<OutputCanvas>>,
    /// Revision the canvas was rendered from.
    pub canvas_revision: Option<u64>,
    pub status: StageStatus,
    pub notices: Vec<Notice>,
    pub ai_available: bool,
}

pub struct Orchestrator {
    framing: Framing,
    defaults: ParameterDefaults,
    thumbnail_max_side: u32,
    ai_available: bool,
    generation: u64,
    attempt: u64,
    state: PipelineState,
    job: Option<PhotoJob>,
    store: Option<ParameterStore>,
    canvas: Option<Arc<OutputCanvas>>,
    canvas_revision: Option<u64>,
    analysis_status: TaskStatus,
    notices: Vec<Notice>,
}

impl Orchestrator {
    pub fn new(
        framing: Framing,
        defaults: ParameterDefaults,
        thumbnail_max_side: u32,
        ai_available: bool,
    ) -> Self {
        Self {
            framing,
            defaults,
            thumbnail_max_side,
            ai_available,
            generation: 0,
            attempt: 0,
            state: PipelineState::Idle,
            job: None,
            store: None,
            canvas: None,
            canvas_revision: None,
            analysis_status: TaskStatus::Idle,
            notices: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn ai_available(&self) -> bool {
        self.ai_available
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn job(&self) -> Option<&PhotoJob> {
        self.job.as_ref()
    }

    pub fn store(&self) -> Option<&ParameterStore> {
        self.store.as_ref()
    }

    pub fn parameters(&self) -> Option<&Parameters> {
        self.store.as_ref().map(ParameterStore::get)
    }

    pub fn canvas(&self) -> Option<&Arc<OutputCanvas>> {
        self.canvas.as_ref()
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    /// Start a new job on `source`, superseding any current one.
    pub fn load_image(&mut self, source: RgbImage) -> Vec<Effect> {
        let mut effects = Vec::new();
        let had_job = self.job.is_some();

        self.generation += 1;
        if had_job {
            effects.push(Effect::Cancel {
                scope: CancelScope::All,
                generation: self.generation,
            });
        }

        let job = PhotoJob::new(self.generation, source, self.thumbnail_max_side);
        let (width, height) = job.source_size();
        tracing::info!(
            job_id = %job.id,
            generation = self.generation,
            width,
            height,
            "photo job created"
        );

        self.store = Some(ParameterStore::new(width, height, &self.framing, &self.defaults));
        self.canvas = None;
        self.canvas_revision = None;
        self.notices.clear();
        self.attempt = 0;
        self.analysis_status = TaskStatus::Idle;

        effects.push(Effect::Segment {
            generation: self.generation,
            source: Arc::clone(&job.source),
        });
        self.job = Some(job);

        if self.ai_available {
            effects.extend(self.start_analysis());
        } else {
            self.raise(Notice::AiUnavailable);
            self.analysis_status = TaskStatus::Failed;
            self.transition(PipelineState::AnalysisFailed);
            effects.extend(self.after_analysis());
        }
        effects
    }

    pub fn analysis_completed(
        &mut self,
        generation: u64,
        attempt: u64,
        result: Result<AnalysisResult, AnalysisError>,
    ) -> Vec<Effect> {
        if generation != self.generation
            || attempt != self.attempt
            || self.state != PipelineState::AnalysisPending
        {
            tracing::debug!(
                generation,
                attempt,
                current_generation = self.generation,
                current_attempt = self.attempt,
                "dropping stale analysis result"
            );
            return Vec::new();
        }
        let (Some(job), Some(store)) = (self.job.as_mut(), self.store.as_mut()) else {
            return Vec::new();
        };

        match result {
            Ok(analysis) => {
                let anchors = analysis.anchors(job.thumbnail_size(), job.source_size());
                let applied = store.apply_analysis(&anchors, analysis.background_color);
                store.mark_fresh(Stage::Analysis);
                job.analysis = Some(analysis);
                tracing::info!(
                    ?applied,
                    head_top_y = anchors.head_top_y,
                    chest_y = anchors.chest_y,
                    center_x = anchors.center_x,
                    revision = store.revision(),
                    "analysis applied"
                );
                self.analysis_status = TaskStatus::Done;
                self.transition(PipelineState::AnalysisDone);
            }
            Err(e) => {
                tracing::warn!(error = %e, "analysis failed; keeping current parameters");
                let notice = match e {
                    AnalysisError::Unavailable(_) => {
                        self.ai_available = false;
                        Notice::AiUnavailable
                    }
                    AnalysisError::Timeout(_) => Notice::AiTimedOut,
                    AnalysisError::MalformedResponse(_) => Notice::AiMalformed,
                };
                self.raise(notice);
                self.analysis_status = TaskStatus::Failed;
                self.transition(PipelineState::AnalysisFailed);
            }
        }
        self.after_analysis()
    }

    pub fn segmentation_completed(
        &mut self,
        generation: u64,
        result: Result<SegmentationMask, SegmentationError>,
    ) -> Vec<Effect> {
        if generation != self.generation {
            tracing::debug!(generation, current = self.generation, "dropping stale segmentation result");
            return Vec::new();
        }
        let Some(job) = self.job.as_mut() else {
            return Vec::new();
        };
        if job.mask.is_settled() {
            tracing::debug!(generation, "segmentation already settled for this job");
            return Vec::new();
        }

        let notice = match result {
            Ok(mask) => {
                tracing::info!(generation, coverage = mask.coverage(), "segmentation mask ready");
                job.mask = MaskState::Ready(Arc::new(mask));
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "segmentation unavailable; composing without mask");
                job.mask = MaskState::Unavailable;
                Some(match e {
                    SegmentationError::ModelMissing(_) => Notice::BackgroundRemovalUnavailable,
                    SegmentationError::InferenceFailure(_) => Notice::SegmentationFailed,
                })
            }
        };
        if let Some(store) = self.store.as_mut() {
            store.mark_fresh(Stage::Segmentation);
        }
        if let Some(notice) = notice {
            self.raise(notice);
        }

        if self.state == PipelineState::SegmentationPending {
            self.enter_ready()
        } else {
            Vec::new()
        }
    }

    /// Accept a rendered canvas if it is for the current generation and revision.
    pub fn compose_completed(
        &mut self,
        generation: u64,
        revision: u64,
        canvas: OutputCanvas,
    ) -> Vec<Effect> {
        if generation != self.generation {
            tracing::debug!(generation, current = self.generation, "dropping stale composition");
            return Vec::new();
        }
        let Some(store) = self.store.as_mut() else {
            return Vec::new();
        };
        if revision != store.revision() {
            tracing::debug!(revision, current = store.revision(), "dropping superseded composition");
            return Vec::new();
        }

        store.mark_fresh_at(Stage::Composition, revision);
        tracing::debug!(revision, warnings = ?canvas.warnings, "composition accepted");
        self.canvas = Some(Arc::new(canvas));
        self.canvas_revision = Some(revision);
        if self.state == PipelineState::Composing {
            self.transition(PipelineState::Composed);
        }
        Vec::new()
    }

    pub fn set_parameter(&mut self, value: ParamValue) -> Result<Vec<Effect>, CommandError> {
        self.set_parameters(&[value])
    }

    /// Apply user overrides atomically.
    pub fn set_parameters(&mut self, values: &[ParamValue]) -> Result<Vec<Effect>, CommandError> {
        let store = self.store.as_mut().ok_or(CommandError::NoImage)?;
        let written = store.set_many(values, Provenance::UserOverridden)?;
        if written.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(fields = ?written, revision = store.revision(), "parameters overridden");
        Ok(self.after_param_change())
    }

    pub fn reset_parameter(&mut self, field: Field) -> Result<Vec<Effect>, CommandError> {
        let store = self.store.as_mut().ok_or(CommandError::NoImage)?;
        match store.reset(field)? {
            Applied::Written => {
                tracing::info!(%field, revision = store.revision(), "parameter reset to default");
                Ok(self.after_param_change())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Request a fresh suggestion for the current job. Segmentation is untouched.
    pub fn reanalyze(&mut self) -> Result<Vec<Effect>, CommandError> {
        if self.job.is_none() {
            return Err(CommandError::NoImage);
        }
        if !self.ai_available {
            self.raise(Notice::AiUnavailable);
            return Ok(Vec::new());
        }
        self.notices
            .retain(|n| !matches!(n, Notice::AiTimedOut | Notice::AiMalformed));

        let mut effects = vec![Effect::Cancel {
            scope: CancelScope::Analysis,
            generation: self.generation,
        }];
        effects.extend(self.start_analysis());
        Ok(effects)
    }

    /// Drop the current job. Late results for it are ignored.
    pub fn close(&mut self) -> Vec<Effect> {
        let had_job = self.job.is_some();
        self.generation += 1;
        self.job = None;
        self.store = None;
        self.canvas = None;
        self.canvas_revision = None;
        self.notices.clear();
        self.analysis_status = TaskStatus::Idle;
        self.transition(PipelineState::Idle);

        if had_job {
            tracing::info!(generation = self.generation, "photo job closed");
            vec![Effect::Cancel {
                scope: CancelScope::All,
                generation: self.generation,
            }]
        } else {
            Vec::new()
        }
    }

    /// Inputs for rendering the current parameters, if a job is active.
    pub fn compose_request(&self) -> Option<ComposeRequest> {
        let job = self.job.as_ref()?;
        let store = self.store.as_ref()?;
        Some(ComposeRequest {
            generation: self.generation,
            revision: store.revision(),
            source: Arc::clone(&job.source),
            mask: job.mask.mask(),
            params: *store.get(),
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            generation: self.generation,
            job_id: self.job.as_ref().map(|j| j.id),
            state: self.state,
            parameters: self.parameters().copied(),
            revision: self.store.as_ref().map_or(0, ParameterStore::revision),
            canvas: self.canvas.clone(),
            canvas_revision: self.canvas_revision,
            status: self.status(),
            notices: self.notices.clone(),
            ai_available: self.ai_available,
        }
    }

    fn status(&self) -> StageStatus {
        let segmentation = match self.job.as_ref().map(|j| &j.mask) {
            None => TaskStatus::Idle,
            Some(MaskState::Pending) => TaskStatus::Pending,
            Some(MaskState::Ready(_)) => TaskStatus::Done,
            Some(MaskState::Unavailable) => TaskStatus::Failed,
        };
        let composition = if self.state == PipelineState::Composing {
            TaskStatus::Pending
        } else if self.canvas.is_some() {
            TaskStatus::Done
        } else {
            TaskStatus::Idle
        };
        StageStatus {
            analysis: self.analysis_status,
            segmentation,
            composition,
        }
    }

    fn start_analysis(&mut self) -> Option<Effect> {
        let thumbnail = Arc::clone(&self.job.as_ref()?.thumbnail);
        self.attempt += 1;
        self.analysis_status = TaskStatus::Pending;
        self.transition(PipelineState::AnalysisPending);
        tracing::info!(
            generation = self.generation,
            attempt = self.attempt,
            width = thumbnail.width(),
            height = thumbnail.height(),
            "analysis requested"
        );
        Some(Effect::Analyze {
            generation: self.generation,
            attempt: self.attempt,
            thumbnail,
        })
    }

    fn after_analysis(&mut self) -> Vec<Effect> {
        self.transition(PipelineState::SegmentationPending);
        if self.job.as_ref().is_some_and(|j| j.mask.is_settled()) {
            self.enter_ready()
        } else {
            Vec::new()
        }
    }

    fn enter_ready(&mut self) -> Vec<Effect> {
        self.transition(PipelineState::Ready);
        let stale = self
            .store
            .as_ref()
            .is_some_and(|s| s.is_stale(Stage::Composition));
        if stale {
            self.request_compose().into_iter().collect()
        } else {
            self.transition(PipelineState::Composed);
            Vec::new()
        }
    }

    fn after_param_change(&mut self) -> Vec<Effect> {
        match self.state {
            PipelineState::Ready | PipelineState::Composing | PipelineState::Composed => {
                self.request_compose().into_iter().collect()
            }
            // Re-analysis of a job that has already rendered: the mask is
            // settled, so edits render now and the state stays pending.
            PipelineState::AnalysisPending if self.rendered_with_settled_mask() => {
                self.compose_request()
                    .map(|request| {
                        tracing::debug!(revision = request.revision, "composition requested during re-analysis");
                        Effect::Compose(request)
                    })
                    .into_iter()
                    .collect()
            }
            // Stored; composed once upstream data is available.
            _ => Vec::new(),
        }
    }

    fn rendered_with_settled_mask(&self) -> bool {
        self.canvas.is_some() && self.job.as_ref().is_some_and(|j| j.mask.is_settled())
    }

    fn request_compose(&mut self) -> Option<Effect> {
        let request = self.compose_request()?;
        tracing::debug!(revision = request.revision, "composition requested");
        self.transition(PipelineState::Composing);
        Some(Effect::Compose(request))
    }

    fn raise(&mut self, notice: Notice) {
        if !self.notices.contains(&notice) {
            tracing::info!(%notice, "user notice");
            self.notices.push(notice);
        }
    }

    fn transition(&mut self, to: PipelineState) {
        if self.state != to {
            tracing::debug!(from = ?self.state, to = ?to, generation = self.generation, "state transition");
            self.state = to;
        }
    }
}
