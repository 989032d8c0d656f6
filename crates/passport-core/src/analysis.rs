//! AI framing suggestions via a Gemini-compatible `generateContent` endpoint.
//!
//! A downscaled thumbnail is sent as inline JPEG; the model answers with a
//! background color and two crop anchor points normalized to the thumbnail.

use crate::types::{AnalysisResult, Color, NormalizedPoint};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest thumbnail side sent to the service.
pub const DEFAULT_THUMBNAIL_MAX_SIDE: u32 = 512;
pub const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Tried in order; a 404 moves on to the next.
pub const DEFAULT_ANALYSIS_MODELS: &[&str] =
    &["gemini-2.5-flash", "gemini-2.0-flash", "gemini-1.5-flash"];
const THUMBNAIL_JPEG_QUALITY: u8 = 85;

const ANALYSIS_PROMPT: &str = "You are preparing a passport/ID photo from this portrait.\n\
1. Look at the person's skin tone and clothing and choose one solid, professional \
background color that flatters the face without clashing with or blending into the outfit.\n\
2. Locate the top of the head (including hair) and the chest line just below the shoulders.\n\
Return ONLY a JSON object, no explanation:\n\
{\"bg_color\": \"#RRGGBB\", \"crop_points\": {\"head_top\": [x, y], \"chest\": [x, y]}}\n\
Coordinates are fractions of the image width and height in [0, 1]; y grows downwards.";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// The service cannot be used this session (no key, unreachable, no model).
    #[error("AI analysis unavailable: {0}")]
    Unavailable(String),
    #[error("AI analysis timed out after {0}s")]
    Timeout(u64),
    /// This reply is unusable; the next call may still succeed.
    #[error("malformed AI response: {0}")]
    MalformedResponse(String),
}

/// Remote (or fake) source of framing suggestions.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, thumbnail: &RgbImage) -> Result<AnalysisResult, AnalysisError>;
}

/// Downscale so the longest side is at most `max_side`, preserving aspect.
/// Images already small enough are returned unchanged.
pub fn make_thumbnail(image: &RgbImage, max_side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let max_side = max_side.max(1);
    let longest = w.max(h);
    if longest <= max_side {
        return image.clone();
    }
    let scale = max_side as f32 / longest as f32;
    let tw = ((w as f32 * scale).round() as u32).clamp(1, max_side);
    let th = ((h as f32 * scale).round() as u32).clamp(1, max_side);
    imageops::resize(image, tw, th, FilterType::Lanczos3)
}

/// Strip a Markdown code fence (```` ```json ```` or bare ```` ``` ````) if present.
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let body = if let Some(start) = text.find("```json") {
        &text[start + "```json".len()..]
    } else if let Some(start) = text.find("```") {
        &text[start + "```".len()..]
    } else {
        return text;
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

#[derive(Deserialize)]
struct SuggestionWire {
    bg_color: String,
    crop_points: CropPointsWire,
}

#[derive(Deserialize)]
struct CropPointsWire {
    head_top: [f32; 2],
    chest: [f32; 2],
}

/// Parse and validate the model's JSON reply.
///
/// Out-of-range values are rejected, never clamped.
pub fn parse_suggestion(text: &str) -> Result<AnalysisResult, AnalysisError> {
    let wire: SuggestionWire = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| AnalysisError::MalformedResponse(e.to_string()))?;

    let background_color: Color = wire
        .bg_color
        .parse()
        .map_err(|e: crate::types::ColorParseError| AnalysisError::MalformedResponse(e.to_string()))?;

    let point = |name: &str, [x, y]: [f32; 2]| -> Result<NormalizedPoint, AnalysisError> {
        let valid = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        if valid(x) && valid(y) {
            Ok(NormalizedPoint { x, y })
        } else {
            Err(AnalysisError::MalformedResponse(format!(
                "{name} ({x}, {y}) outside [0, 1]"
            )))
        }
    };
    let head_top = point("head_top", wire.crop_points.head_top)?;
    let chest = point("chest", wire.crop_points.chest)?;

    if head_top.y >= chest.y {
        return Err(AnalysisError::MalformedResponse(format!(
            "head_top y {} is not above chest y {}",
            head_top.y, chest.y
        )));
    }

    Ok(AnalysisResult {
        background_color,
        head_top,
        chest,
    })
}

/// Request body for `models/{model}:generateContent`.
#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 2],
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Image { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'static str,
    data: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> Option<String> {
        let text: String = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

/// Blocking HTTP client for the Gemini REST API.
pub struct GeminiClient {
    base_url: String,
    api_key: String,
    models: Vec<String>,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl GeminiClient {
    /// Build a client. An empty key is `Unavailable`; there is nothing to retry.
    pub fn new(
        api_key: &str,
        base_url: &str,
        models: Vec<String>,
        timeout_secs: u64,
    ) -> Result<Self, AnalysisError> {
        if api_key.trim().is_empty() {
            return Err(AnalysisError::Unavailable("no API key configured".into()));
        }
        if models.is_empty() {
            return Err(AnalysisError::Unavailable("no analysis models configured".into()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AnalysisError::Unavailable(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            models,
            client,
            timeout_secs,
        })
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// One `generateContent` call. `Ok(None)` means the model does not exist.
    fn generate(&self, model: &str, body: &GenerateRequest<'_>) -> Result<Option<String>, AnalysisError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AnalysisError::Unavailable(format!("cannot reach {}", self.base_url))
                } else {
                    AnalysisError::MalformedResponse(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AnalysisError::Unavailable(format!(
                "API key rejected (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AnalysisError::MalformedResponse(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: GenerateResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout(self.timeout_secs)
            } else {
                AnalysisError::MalformedResponse(e.to_string())
            }
        })?;

        parsed
            .text()
            .map(Some)
            .ok_or_else(|| AnalysisError::MalformedResponse("response has no text".into()))
    }
}

fn encode_thumbnail(thumbnail: &RgbImage) -> Result<String, AnalysisError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, THUMBNAIL_JPEG_QUALITY)
        .encode_image(thumbnail)
        .map_err(|e| AnalysisError::MalformedResponse(format!("thumbnail encoding: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&jpeg))
}

impl Analyzer for GeminiClient {
    fn analyze(&self, thumbnail: &RgbImage) -> Result<AnalysisResult, AnalysisError> {
        let data = encode_thumbnail(thumbnail)?;
        let body = GenerateRequest {
            contents: [Content {
                parts: [
                    Part::Image {
                        inline_data: InlineData {
                            mime_type: "image/jpeg",
                            data: &data,
                        },
                    },
                    Part::Text {
                        text: ANALYSIS_PROMPT,
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
            },
        };

        for model in &self.models {
            tracing::debug!(model = %model, width = thumbnail.width(), height = thumbnail.height(), "requesting analysis");
            match self.generate(model, &body)? {
                Some(text) => {
                    let result = parse_suggestion(&text)?;
                    tracing::info!(
                        model = %model,
                        bg_color = %result.background_color,
                        head_top_y = result.head_top.y,
                        chest_y = result.chest.y,
                        "analysis suggestion received"
                    );
                    return Ok(result);
                }
                None => {
                    tracing::debug!(model = %model, "model not available, trying next");
                }
            }
        }

        Err(AnalysisError::Unavailable(format!(
            "none of the models {:?} are available",
            self.models
        )))
    }
}
