use passport_core::analysis::{
    DEFAULT_ANALYSIS_MODELS, DEFAULT_ANALYSIS_TIMEOUT_SECS, DEFAULT_API_BASE_URL,
    DEFAULT_THUMBNAIL_MAX_SIDE,
};
use passport_core::compositor::{
    FramingError, DEFAULT_CANVAS_HEIGHT, DEFAULT_HEAD_TOP_FRACTION, DEFAULT_SPAN_FRACTION,
};
use passport_core::params::DEFAULT_BORDER_WIDTH_PX;
use passport_core::{BorderColor, Color, Framing, ParameterDefaults};
use crate::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Segmentation models that must agree on the subject (intersection).
const DEFAULT_SEGMENTATION_MODELS: &[&str] = &["u2net_human_seg.onnx", "u2net.onnx"];
const REDACTED: &str = "********";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid framing: {0}")]
    Framing(#[from] FramingError),
}

/// Pipeline configuration.
///
/// Built-in defaults, overlaid by an optional TOML file (`PASSPORT_CONFIG`),
/// overlaid by `PASSPORT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Credential for the analysis service; AI suggestions are disabled without it.
    pub api_key: Option<String>,
    pub api_base_url: String,
    /// Tried in order; a missing model falls through to the next.
    pub analysis_models: Vec<String>,
    pub analysis_timeout_secs: u64,
    pub thumbnail_max_side: u32,
    /// Directory containing the segmentation ONNX files.
    pub model_dir: PathBuf,
    pub segmentation_models: Vec<String>,
    /// Optional model whose mask is unioned with the consensus mask.
    pub recovery_model: Option<String>,
    /// Output height in pixels; width is 3/4 of it.
    pub canvas_height: u32,
    pub head_top_fraction: f32,
    pub span_fraction: f32,
    pub default_background: Color,
    pub default_border_width: u32,
    pub default_border_color: BorderColor,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            analysis_models: DEFAULT_ANALYSIS_MODELS.iter().map(|m| m.to_string()).collect(),
            analysis_timeout_secs: DEFAULT_ANALYSIS_TIMEOUT_SECS,
            thumbnail_max_side: DEFAULT_THUMBNAIL_MAX_SIDE,
            model_dir: passport_core::default_model_dir(),
            segmentation_models: DEFAULT_SEGMENTATION_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            recovery_model: None,
            canvas_height: DEFAULT_CANVAS_HEIGHT,
            head_top_fraction: DEFAULT_HEAD_TOP_FRACTION,
            span_fraction: DEFAULT_SPAN_FRACTION,
            default_background: Color::WHITE,
            default_border_width: DEFAULT_BORDER_WIDTH_PX,
            default_border_color: BorderColor::Black,
        }
    }
}

impl Config {
    /// Load from `PASSPORT_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PASSPORT_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.framing()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay `PASSPORT_*` variables. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("PASSPORT_API_KEY").or_else(|| var("GOOGLE_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(url) = var("PASSPORT_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(models) = var("PASSPORT_ANALYSIS_MODELS") {
            self.analysis_models = split_list(&models);
        }
        self.analysis_timeout_secs =
            env_parse(&var, "PASSPORT_ANALYSIS_TIMEOUT_SECS", self.analysis_timeout_secs);
        self.thumbnail_max_side =
            env_parse(&var, "PASSPORT_THUMBNAIL_MAX_SIDE", self.thumbnail_max_side);

        if let Some(dir) = var("PASSPORT_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(models) = var("PASSPORT_SEGMENTATION_MODELS") {
            self.segmentation_models = split_list(&models);
        }
        // Explicitly empty disables the recovery model.
        if let Some(model) = lookup("PASSPORT_RECOVERY_MODEL") {
            let model = model.trim();
            self.recovery_model = (!model.is_empty()).then(|| model.to_string());
        }

        self.canvas_height = env_parse(&var, "PASSPORT_CANVAS_HEIGHT", self.canvas_height);
        self.head_top_fraction =
            env_parse(&var, "PASSPORT_HEAD_TOP_FRACTION", self.head_top_fraction);
        self.span_fraction = env_parse(&var, "PASSPORT_SPAN_FRACTION", self.span_fraction);
        self.default_background =
            env_parse(&var, "PASSPORT_DEFAULT_BACKGROUND", self.default_background);
        self.default_border_width =
            env_parse(&var, "PASSPORT_DEFAULT_BORDER_WIDTH", self.default_border_width);
        self.default_border_color =
            env_parse(&var, "PASSPORT_DEFAULT_BORDER_COLOR", self.default_border_color);
    }

    pub fn framing(&self) -> Result<Framing, FramingError> {
        Framing::new(self.canvas_height, self.head_top_fraction, self.span_fraction)
    }

    pub fn parameter_defaults(&self) -> ParameterDefaults {
        ParameterDefaults {
            background_color: self.default_background,
            border_width_px: self.default_border_width,
            border_color: self.default_border_color,
        }
    }

    pub fn session_options(&self) -> Result<SessionOptions, FramingError> {
        Ok(SessionOptions {
            framing: self.framing()?,
            defaults: self.parameter_defaults(),
            thumbnail_max_side: self.thumbnail_max_side,
            analysis_timeout: Duration::from_secs(self.analysis_timeout_secs),
        })
    }

    pub fn ai_enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Copy safe to print: the API key is masked.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_ref().map(|_| REDACTED.to_string()),
            ..self.clone()
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
                current
            }
        },
        None => current,
    }
}
