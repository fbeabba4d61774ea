//! Generation API client.
//!
//! Exposes the two cancelable async operations the scheduler dispatches to
//! — image editing and video generation — behind a trait with a typed error
//! contract, plus the Gemini HTTP backend implementing them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use requests::{ArtifactRef, AspectRatio, UploadedImage};

mod gemini;
pub use gemini::GeminiClient;

/// Typed failure contract of the generation operations.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Credential problem; the caller should signal re-authorization.
    #[error("authorization error: {0}")]
    Auth(String),

    /// The shared cancellation token fired while the call was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The API accepted the request but reported a failure.
    #[error("generation api error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Whether this failure is the recognized authorization category.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;

/// Callback invoked with free-text progress updates during video generation.
pub type ProgressFn = Arc<dyn Fn(String) + Send + Sync>;

/// The two cancelable async operations the scheduler treats as opaque.
///
/// Cancelling the passed token must cause an in-flight call to reject
/// promptly with [`GenerationError::Cancelled`].
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;

    /// Edits the given image according to the prompt, returning an artifact
    /// handle for the produced image.
    async fn edit_image(
        &self,
        image: &UploadedImage,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<ArtifactRef>;

    /// Generates a video from the prompt, optionally seeded with a reference
    /// image. `on_progress` may be invoked zero or more times before
    /// resolution.
    async fn generate_video(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        cancel: CancellationToken,
        on_progress: ProgressFn,
        reference_image: Option<&UploadedImage>,
    ) -> Result<ArtifactRef>;
}

/// Shared "has valid credentials" flag at the system boundary.
///
/// The scheduler clears it when an operation fails with the authorization
/// category; whoever manages credentials restores it after re-authorization.
#[derive(Debug, Clone)]
pub struct CredentialGate {
    valid: Arc<AtomicBool>,
}

impl CredentialGate {
    pub fn new() -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn revoke(&self) {
        self.valid.store(false, Ordering::Relaxed);
    }

    pub fn restore(&self) {
        self.valid.store(true, Ordering::Relaxed);
    }
}

impl Default for CredentialGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API key sent with every request.
    pub api_key: String,

    /// API endpoint base URL.
    pub base_url: String,

    /// Model used for image edits.
    pub image_model: String,

    /// Model used for video generation.
    pub video_model: String,

    /// Seconds between polls of a long-running video operation.
    pub poll_interval_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            image_model: "gemini-2.5-flash-image-preview".to_string(),
            video_model: "veo-2.0-generate-001".to_string(),
            poll_interval_secs: 8,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    pub fn with_video_model(mut self, model: impl Into<String>) -> Self {
        self.video_model = model.into();
        self
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}
