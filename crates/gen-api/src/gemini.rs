//! Gemini HTTP backend for the generation client.
//!
//! Image edits go through `generateContent` with an inline base64 image
//! part; video generation starts a long-running operation via
//! `predictLongRunning` and polls it until done.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use requests::{ArtifactRef, AspectRatio, UploadedImage};

use crate::{ClientConfig, GenerationClient, GenerationError, ProgressFn, Result};

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Progress annotations emitted while a video operation is polled. The last
/// entry repeats until the operation resolves.
const VIDEO_PROGRESS: [&str; 5] = [
    "Submitting video request...",
    "Request accepted, rendering...",
    "Still rendering, this can take a few minutes...",
    "Polishing frames...",
    "Almost there...",
];

/// Generation client backed by the Gemini API.
pub struct GeminiClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.api_key.is_empty(),
            "generation client requires an api_key"
        );
        Ok(Self {
            config,
            http: reqwest::Client::new(),
        })
    }
}

/// Races a fallible future against the cancellation token.
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(GenerationError::Cancelled),
        result = fut => result,
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn edit_image(
        &self,
        image: &UploadedImage,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<ArtifactRef> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.image_model
        );
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    Part::inline(&image.mime_type, &image.data),
                    Part::text(prompt),
                ],
            }],
        };

        debug!(model = %self.config.image_model, image = %image.name, "sending image edit request");
        let response = guarded(&cancel, async {
            Ok(self
                .http
                .post(&url)
                .header(API_KEY_HEADER, &self.config.api_key)
                .json(&request)
                .send()
                .await?)
        })
        .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = guarded(&cancel, async { Ok(response.text().await?) }).await?;
            return Err(error_from_response(status, &body));
        }

        let parsed: GenerateContentResponse =
            guarded(&cancel, async { Ok(response.json().await?) }).await?;

        // The edited image comes back as an inline part of the first
        // candidate.
        parsed
            .candidates
            .unwrap_or_default()
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts.unwrap_or_default())
            .find_map(|part| part.inline_data)
            .map(|inline| ArtifactRef(format!("data:{};base64,{}", inline.mime_type, inline.data)))
            .ok_or_else(|| {
                GenerationError::InvalidResponse("no image data in response candidates".to_string())
            })
    }

    async fn generate_video(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        cancel: CancellationToken,
        on_progress: ProgressFn,
        reference_image: Option<&UploadedImage>,
    ) -> Result<ArtifactRef> {
        on_progress(VIDEO_PROGRESS[0].to_string());

        let url = format!(
            "{}/models/{}:predictLongRunning",
            self.config.base_url, self.config.video_model
        );
        let request = VideoRequest {
            instances: vec![VideoInstance {
                prompt: prompt.to_string(),
                image: reference_image.map(|image| VideoImage {
                    bytes_base64_encoded: image.data.clone(),
                    mime_type: image.mime_type.clone(),
                }),
            }],
            parameters: VideoParameters {
                aspect_ratio: aspect_ratio.as_str().to_string(),
            },
        };

        debug!(model = %self.config.video_model, %aspect_ratio, "starting video generation");
        let response = guarded(&cancel, async {
            Ok(self
                .http
                .post(&url)
                .header(API_KEY_HEADER, &self.config.api_key)
                .json(&request)
                .send()
                .await?)
        })
        .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = guarded(&cancel, async { Ok(response.text().await?) }).await?;
            return Err(error_from_response(status, &body));
        }

        let operation: OperationHandle =
            guarded(&cancel, async { Ok(response.json().await?) }).await?;
        let poll_url = format!("{}/{}", self.config.base_url, operation.name);

        let mut tick = 0usize;
        loop {
            guarded(&cancel, async {
                tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
                Ok(())
            })
            .await?;

            tick += 1;
            on_progress(VIDEO_PROGRESS[tick.min(VIDEO_PROGRESS.len() - 1)].to_string());

            let response = guarded(&cancel, async {
                Ok(self
                    .http
                    .get(&poll_url)
                    .header(API_KEY_HEADER, &self.config.api_key)
                    .send()
                    .await?)
            })
            .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = guarded(&cancel, async { Ok(response.text().await?) }).await?;
                return Err(error_from_response(status, &body));
            }

            let status: OperationStatus =
                guarded(&cancel, async { Ok(response.json().await?) }).await?;

            if let Some(error) = status.error {
                let message = error.message.unwrap_or_else(|| "operation failed".to_string());
                return Err(if auth_like(error.status.as_deref(), &message) {
                    GenerationError::Auth(message)
                } else {
                    GenerationError::Api(message)
                });
            }

            if status.done {
                let uri = status
                    .response
                    .as_ref()
                    .and_then(video_uri)
                    .ok_or_else(|| {
                        GenerationError::InvalidResponse(
                            "operation finished without a video uri".to_string(),
                        )
                    })?;
                debug!("video generation finished");
                return Ok(ArtifactRef(uri.to_string()));
            }
        }
    }
}

/// Pulls the generated video URI out of a finished operation response.
fn video_uri(response: &serde_json::Value) -> Option<&str> {
    response
        .pointer("/generateVideoResponse/generatedSamples/0/video/uri")
        .and_then(|value| value.as_str())
}

fn auth_like(status: Option<&str>, message: &str) -> bool {
    matches!(status, Some("UNAUTHENTICATED") | Some("PERMISSION_DENIED"))
        || message.contains("API key")
        || message.contains("API Key")
}

/// Maps a non-success HTTP response to the typed error contract.
fn error_from_response(status: StatusCode, body: &str) -> GenerationError {
    let error = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|body| body.error);
    let message = error
        .as_ref()
        .and_then(|error| error.message.clone())
        .unwrap_or_else(|| format!("HTTP {status}"));
    let category = error.as_ref().and_then(|error| error.status.as_deref());

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || auth_like(category, &message)
    {
        GenerationError::Auth(message)
    } else {
        GenerationError::Api(message)
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,

    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl Part {
    fn inline(mime_type: &str, data: &str) -> Self {
        Self {
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            }),
            text: None,
        }
    }

    fn text(text: &str) -> Self {
        Self {
            inline_data: None,
            text: Some(text.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(rename = "inlineData")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
struct VideoRequest {
    instances: Vec<VideoInstance>,
    parameters: VideoParameters,
}

#[derive(Debug, Serialize)]
struct VideoInstance {
    prompt: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<VideoImage>,
}

#[derive(Debug, Serialize)]
struct VideoImage {
    #[serde(rename = "bytesBase64Encoded")]
    bytes_base64_encoded: String,

    #[serde(rename = "mimeType")]
    mime_type: String,
}

#[derive(Debug, Serialize)]
struct VideoParameters {
    #[serde(rename = "aspectRatio")]
    aspect_ratio: String,
}

#[derive(Debug, Deserialize)]
struct OperationHandle {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    done: bool,
    error: Option<ApiError>,
    response: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    status: Option<String>,
}
