use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use gen_api::{ClientConfig, GeminiClient, GenerationClient};
use requests::{builder, ArtifactRef, AspectRatio, ImageLibrary, RequestDescriptor, RequestKind};
use scheduler::{Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle};

#[derive(Parser)]
#[command(name = "genbatch-cli")]
#[command(about = "Batch AI image edits and video generation from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// API key; falls back to the GEMINI_API_KEY environment variable
    #[arg(long, global = true, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Client configuration JSON (overrides the built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Concurrent image requests
    #[arg(long, global = true, default_value_t = 2)]
    concurrency: usize,

    /// Directory for produced artifacts
    #[arg(short, long, global = true, default_value = "out")]
    output: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply one prompt to every image
    Edit {
        /// Image files to edit
        files: Vec<PathBuf>,

        /// Edit instructions applied to every image
        #[arg(short, long)]
        prompt: String,
    },

    /// Apply a different prompt to each image
    Multi {
        /// file=prompt pairs
        pairs: Vec<String>,
    },

    /// Compose a character, an action and a style into per-image edits
    Character {
        /// Image files showing the character
        files: Vec<PathBuf>,

        /// Who the character is
        #[arg(long)]
        character: String,

        /// What the character is doing
        #[arg(long)]
        action: String,

        /// Overall style (e.g. Fairy Tale, Cyberpunk, Retro)
        #[arg(long)]
        style: String,
    },

    /// Generate a single video from a prompt and an optional image
    Video {
        /// Video prompt
        #[arg(short, long)]
        prompt: String,

        /// Output aspect ratio
        #[arg(long, value_enum, default_value_t = AspectArg::Wide)]
        aspect: AspectArg,

        /// Optional reference image
        #[arg(long)]
        image: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AspectArg {
    /// 16:9 landscape
    #[value(name = "16:9")]
    Wide,

    /// 9:16 portrait
    #[value(name = "9:16")]
    Tall,
}

impl From<AspectArg> for AspectRatio {
    fn from(aspect: AspectArg) -> Self {
        match aspect {
            AspectArg::Wide => AspectRatio::Landscape,
            AspectArg::Tall => AspectRatio::Portrait,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = client_config(&cli)?;
    let client: Arc<dyn GenerationClient> = Arc::new(GeminiClient::new(config)?);

    let library = Arc::new(ImageLibrary::new());
    let batch = build_batch(&cli.command, &library)?;
    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("create output directory {:?}", cli.output))?;

    let (handle, events) = Scheduler::start(
        client,
        library,
        SchedulerConfig::default().with_image_concurrency(cli.concurrency),
    );
    handle.submit(batch)?;

    // Ctrl-C cancels the batch cooperatively.
    let cancel_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling batch");
            let _ = cancel_handle.cancel();
        }
    });

    watch_batch(events, &handle, &cli.output).await
}

fn client_config(cli: &Cli) -> Result<ClientConfig> {
    if let Some(path) = &cli.config {
        let mut config = ClientConfig::load(path)
            .with_context(|| format!("load client config from {:?}", path))?;
        if let Some(key) = &cli.api_key {
            config.api_key = key.clone();
        }
        Ok(config)
    } else {
        let key = cli
            .api_key
            .clone()
            .context("an API key is required: pass --api-key or set GEMINI_API_KEY")?;
        Ok(ClientConfig::new(key))
    }
}

fn build_batch(command: &Commands, library: &ImageLibrary) -> Result<Vec<RequestDescriptor>> {
    let batch = match command {
        Commands::Edit { files, prompt } => {
            upload_files(library, files)?;
            builder::image_edit_batch(library, prompt)?
        }
        Commands::Multi { pairs } => {
            let mut resolved = Vec::new();
            for pair in pairs {
                let (path, prompt) = pair
                    .split_once('=')
                    .with_context(|| format!("expected file=prompt, got {pair:?}"))?;
                let id = upload_file(library, Path::new(path))?;
                resolved.push((id, prompt.to_string()));
            }
            builder::per_image_batch(&resolved)?
        }
        Commands::Character {
            files,
            character,
            action,
            style,
        } => {
            upload_files(library, files)?;
            builder::character_batch(library, character, action, style)?
        }
        Commands::Video {
            prompt,
            aspect,
            image,
        } => {
            let source = image
                .as_ref()
                .map(|path| upload_file(library, path))
                .transpose()?;
            builder::video_batch(prompt, (*aspect).into(), source)?
        }
    };
    Ok(batch)
}

fn upload_files(library: &ImageLibrary, files: &[PathBuf]) -> Result<()> {
    for file in files {
        upload_file(library, file)?;
    }
    Ok(())
}

fn upload_file(library: &ImageLibrary, path: &Path) -> Result<u64> {
    let bytes = std::fs::read(path).with_context(|| format!("read image {:?}", path))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(library.add(name, mime_for(path), data))
}

fn mime_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

async fn watch_batch(
    mut events: UnboundedReceiver<SchedulerEvent>,
    handle: &SchedulerHandle,
    output: &Path,
) -> Result<()> {
    let store = handle.store();
    while let Some(event) = events.recv().await {
        match event {
            SchedulerEvent::BatchStarted { total } => {
                info!("Generating {} request(s)", total);
            }
            SchedulerEvent::ItemStarted { id } => {
                info!("Request {} started", id);
            }
            SchedulerEvent::ItemProgress { id, message } => {
                info!("Request {}: {}", id, message);
            }
            SchedulerEvent::ItemCompleted { id } => {
                let artifact = store
                    .get(id)
                    .and_then(|item| item.result.clone().map(|result| (item.kind, result)));
                if let Some((kind, result)) = artifact {
                    match save_artifact(output, id, kind, &result) {
                        Ok(Some(path)) => info!("Request {} complete: {:?}", id, path),
                        Ok(None) => info!("Request {} complete: {}", id, result),
                        Err(error) => warn!("Request {} complete but not saved: {}", id, error),
                    }
                }
            }
            SchedulerEvent::ItemFailed { id, error } => {
                warn!("Request {} failed: {}", id, error);
            }
            SchedulerEvent::AuthRequired => {
                error!("The API rejected the credentials; re-select your API key and retry");
            }
            SchedulerEvent::BatchCancelled => {
                info!("Batch cancelled");
                break;
            }
            SchedulerEvent::BatchFinished => break,
        }
    }

    let counts = store.counts();
    info!(
        "Done: {} complete, {} failed of {}",
        counts.complete,
        counts.failed,
        counts.total()
    );
    if counts.failed > 0 {
        bail!("{} request(s) failed", counts.failed);
    }
    Ok(())
}

/// Writes a data-URL artifact into the output directory; remote URIs are
/// reported as-is and not downloaded.
fn save_artifact(
    output: &Path,
    id: u64,
    kind: RequestKind,
    artifact: &ArtifactRef,
) -> Result<Option<PathBuf>> {
    let Some(rest) = artifact.as_str().strip_prefix("data:") else {
        return Ok(None);
    };
    let (mime, payload) = rest
        .split_once(";base64,")
        .context("unsupported artifact encoding")?;
    let extension = match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    };
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = output.join(format!("{kind}-{id}-{stamp}.{extension}"));
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    std::fs::write(&path, bytes).with_context(|| format!("write artifact {:?}", path))?;
    Ok(Some(path))
}
