use serde::{Deserialize, Serialize};

/// Kind of generation work a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Edit an uploaded image according to the prompt.
    Image,
    /// Generate a video from the prompt and an optional reference image.
    Video,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Lifecycle state of a request item.
///
/// `Pending` and `InProgress` are the only non-terminal states; `Complete`
/// and `Failed` are terminal until an explicit retry resets the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Output aspect ratio for video generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
        }
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::Landscape
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque handle to a produced artifact.
///
/// Holds a data URL for edited images and a remote URI for generated videos;
/// consumers only pass it through or render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Batch submission contract produced by the builder.
///
/// Descriptors are validated at build time; the scheduler assumes validity
/// and never re-checks business rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub kind: RequestKind,
    pub source_image_id: Option<u64>,
    pub prompt: String,
    pub aspect_ratio: Option<AspectRatio>,
}

impl RequestDescriptor {
    /// Descriptor for one image edit against an uploaded image.
    pub fn image_edit(source_image_id: u64, prompt: String) -> Self {
        Self {
            kind: RequestKind::Image,
            source_image_id: Some(source_image_id),
            prompt,
            aspect_ratio: None,
        }
    }

    /// Descriptor for one video generation, optionally seeded with an image.
    pub fn video(prompt: String, aspect_ratio: AspectRatio, source_image_id: Option<u64>) -> Self {
        Self {
            kind: RequestKind::Video,
            source_image_id,
            prompt,
            aspect_ratio: Some(aspect_ratio),
        }
    }
}

/// One unit of scheduled generation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestItem {
    /// Unique, monotonically assigned, never reused within a session.
    pub id: u64,

    pub kind: RequestKind,

    /// Reference into the image library; the item never owns image bytes.
    pub source_image_id: Option<u64>,

    /// Fully-resolved instruction string; never mutated after creation.
    pub prompt: String,

    /// Only meaningful for video requests.
    pub aspect_ratio: Option<AspectRatio>,

    pub status: RequestStatus,

    /// Present only when `status` is `Complete`.
    pub result: Option<ArtifactRef>,

    /// Present only when `status` is `Failed`.
    pub error: Option<String>,

    /// Free-text progress annotation for video items while in progress.
    pub progress_message: Option<String>,
}

impl RequestItem {
    pub fn new(id: u64, descriptor: RequestDescriptor) -> Self {
        Self {
            id,
            kind: descriptor.kind,
            source_image_id: descriptor.source_image_id,
            prompt: descriptor.prompt,
            aspect_ratio: descriptor.aspect_ratio,
            status: RequestStatus::Pending,
            result: None,
            error: None,
            progress_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial field update applied to one item.
///
/// Only the populated fields are written; last writer wins per field. No two
/// in-flight operations ever target the same id, so this is sufficient.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub status: Option<RequestStatus>,
    pub result: Option<ArtifactRef>,
    pub error: Option<String>,
    pub progress_message: Option<String>,
}

impl ItemPatch {
    /// Transition to `InProgress` at dispatch time.
    pub fn started() -> Self {
        Self {
            status: Some(RequestStatus::InProgress),
            ..Self::default()
        }
    }

    /// Successful resolution with the produced artifact.
    pub fn completed(result: ArtifactRef) -> Self {
        Self {
            status: Some(RequestStatus::Complete),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Failed resolution with a human-readable reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(RequestStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Progress annotation update, status untouched.
    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            progress_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub(crate) fn apply(self, item: &mut RequestItem) {
        if let Some(status) = self.status {
            item.status = status;
        }
        if let Some(result) = self.result {
            item.result = Some(result);
        }
        if let Some(error) = self.error {
            item.error = Some(error);
        }
        if let Some(message) = self.progress_message {
            item.progress_message = Some(message);
        }
    }
}
