use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use passport_core::{
    load_source, make_thumbnail, Analyzer, BorderColor, Color, EnsembleSegmenter, GeminiClient,
    ParamValue, Segmenter, UnavailableSegmenter,
};
use passport_pipeline::{spawn_session, Config, PipelineState, Snapshot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "passport", about = "Passport photo composition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compose a passport photo and write it as PNG
    Compose {
        /// Source photo (JPEG, PNG, WebP, BMP)
        input: PathBuf,
        /// Output PNG path
        #[arg(short, long, default_value = "passport.png")]
        output: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
        /// Skip the AI suggestion even when a key is configured
        #[arg(long)]
        no_ai: bool,
    },
    /// Print the AI framing suggestion for a photo
    Analyze {
        input: PathBuf,
    },
    /// Write the background-removal mask for a photo
    Segment {
        input: PathBuf,
        /// Output PNG path (8-bit grayscale alpha)
        #[arg(short, long, default_value = "mask.png")]
        output: PathBuf,
    },
    /// Show the effective configuration (API key masked)
    Config,
}

/// Manual parameter overrides. Each one outranks any AI suggestion.
#[derive(Args, Default)]
struct Overrides {
    /// Background color, #RRGGBB
    #[arg(long)]
    background: Option<Color>,
    /// Top of the head, source pixels
    #[arg(long)]
    crop_top: Option<f32>,
    /// Chest line, source pixels
    #[arg(long)]
    crop_bottom: Option<f32>,
    /// Horizontal center of the subject, source pixels
    #[arg(long)]
    center_x: Option<f32>,
    /// Border width in output pixels (0 disables)
    #[arg(long)]
    border_width: Option<u32>,
    /// Border color: white or black
    #[arg(long)]
    border_color: Option<BorderColor>,
}

impl Overrides {
    fn values(&self) -> Vec<ParamValue> {
        [
            self.background.map(ParamValue::BackgroundColor),
            self.crop_top.map(ParamValue::CropTopY),
            self.crop_bottom.map(ParamValue::CropBottomY),
            self.center_x.map(ParamValue::CropCenterX),
            self.border_width.map(ParamValue::BorderWidth),
            self.border_color.map(ParamValue::BorderColor),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Serialize)]
struct ComposeReport<'a> {
    job_id: Uuid,
    output: &'a Path,
    width: u32,
    height: u32,
    parameters: Option<passport_core::Parameters>,
    warnings: Vec<passport_core::CompositionWarning>,
    notices: &'a [passport_pipeline::Notice],
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Compose {
            input,
            output,
            overrides,
            no_ai,
        } => compose(&config, input, output, &overrides, no_ai).await?,
        Commands::Analyze { input } => analyze(&config, input).await?,
        Commands::Segment { input, output } => segment(&config, input, output).await?,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}

async fn compose(
    config: &Config,
    input: PathBuf,
    output: PathBuf,
    overrides: &Overrides,
    no_ai: bool,
) -> Result<()> {
    let source = load(input).await?;
    let analyzer = if no_ai { None } else { build_analyzer(config).await };
    let segmenter = build_segmenter(config).await?;

    let handle = spawn_session(config.session_options()?, analyzer, segmenter)?;
    let job_id = handle.load_image(source).await?;
    tracing::info!(%job_id, "image loaded");

    let values = overrides.values();
    if !values.is_empty() {
        handle.set_parameters(values).await?;
    }

    let snapshot: Snapshot = handle
        .wait_for(|s| s.state == PipelineState::Composed && s.canvas_revision == Some(s.revision))
        .await?;
    for notice in &snapshot.notices {
        eprintln!("note: {notice}");
    }

    let warnings = handle.export(output.clone()).await?;
    for warning in &warnings {
        eprintln!("warning: {warning}");
    }
    handle.close().await?;

    let (width, height) = config.framing()?.canvas_size();
    let report = ComposeReport {
        job_id,
        output: &output,
        width,
        height,
        parameters: snapshot.parameters,
        warnings,
        notices: &snapshot.notices,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn analyze(config: &Config, input: PathBuf) -> Result<()> {
    let source = load(input).await?;
    let client = match build_client(config).await {
        Some(Ok(client)) => client,
        Some(Err(e)) => return Err(e.into()),
        None => anyhow::bail!("no API key configured; set PASSPORT_API_KEY or GOOGLE_API_KEY"),
    };
    let max_side = config.thumbnail_max_side;

    let (suggestion, anchors) = tokio::task::spawn_blocking(move || {
        let thumbnail = make_thumbnail(&source, max_side);
        let suggestion = client.analyze(&thumbnail)?;
        let anchors = suggestion.anchors(thumbnail.dimensions(), source.dimensions());
        Ok::<_, passport_core::AnalysisError>((suggestion, anchors))
    })
    .await??;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "suggestion": suggestion,
            "anchors": anchors,
        }))?
    );
    Ok(())
}

async fn segment(config: &Config, input: PathBuf, output: PathBuf) -> Result<()> {
    let source = load(input).await?;
    let model_dir = config.model_dir.clone();
    let models = config.segmentation_models.clone();
    let recovery = config.recovery_model.clone();

    let coverage = tokio::task::spawn_blocking(move || -> Result<f32> {
        let mut segmenter = EnsembleSegmenter::load(&model_dir, &models, recovery.as_deref())?;
        let mask = segmenter.segment(&source)?;
        let coverage = mask.coverage();
        mask.alpha()
            .save(&output)
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(coverage)
    })
    .await??;

    println!("foreground coverage: {:.1}%", coverage * 100.0);
    Ok(())
}

async fn load(path: PathBuf) -> Result<image::RgbImage> {
    let image = tokio::task::spawn_blocking(move || load_source(&path)).await??;
    Ok(image)
}

/// The blocking HTTP client owns its own runtime, so it is built off the async threads.
async fn build_client(
    config: &Config,
) -> Option<Result<GeminiClient, passport_core::AnalysisError>> {
    let key = config.api_key.clone().filter(|_| config.ai_enabled())?;
    let base_url = config.api_base_url.clone();
    let models = config.analysis_models.clone();
    let timeout = config.analysis_timeout_secs;
    let built = tokio::task::spawn_blocking(move || {
        GeminiClient::new(&key, &base_url, models, timeout)
    })
    .await;
    match built {
        Ok(result) => Some(result),
        Err(e) => Some(Err(passport_core::AnalysisError::Unavailable(e.to_string()))),
    }
}

async fn build_analyzer(config: &Config) -> Option<Arc<dyn Analyzer>> {
    match build_client(config).await? {
        Ok(client) => {
            tracing::info!(models = ?client.models(), "analysis client ready");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!(error = %e, "analysis disabled");
            None
        }
    }
}

/// Load the ensemble; when no model is available the pipeline still runs,
/// composing without a mask.
async fn build_segmenter(config: &Config) -> Result<Box<dyn Segmenter>> {
    let model_dir = config.model_dir.clone();
    let models = config.segmentation_models.clone();
    let recovery = config.recovery_model.clone();
    let segmenter: Box<dyn Segmenter> = tokio::task::spawn_blocking(move || {
        match EnsembleSegmenter::load(&model_dir, &models, recovery.as_deref()) {
            Ok(ensemble) => Box::new(ensemble) as Box<dyn Segmenter>,
            Err(e) => {
                tracing::warn!(error = %e, "background removal disabled");
                Box::new(UnavailableSegmenter::new(e))
            }
        }
    })
    .await?;
    Ok(segmenter)
}
