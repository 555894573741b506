//! kwp-ai - Photo keywording tool
//!
//! `tag` runs a folder of photos through the tag synthesis pipeline,
//! `models` lists model presets, `init-config` writes a starter config file
//! and `serve` exposes the pipeline over HTTP.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kwp_ai::metadata::LittleExifReader;
use kwp_ai::model::{ModelPreset, OllamaClient, VisionModel, PRESETS};
use kwp_ai::run_record::{write_run_record, RunRecord};
use kwp_ai::scanner::{load_photo_input, PhotoScanner};
use kwp_ai::sink::{per_model_path, JsonLinesSink, MemorySink, TagSink};
use kwp_ai::types::{BatchRequest, MergePolicy, PhotoInput};
use kwp_ai::{AppState, PipelineConfig, TaggingPipeline};
use kwp_common::config::{self, TomlConfig};
use kwp_common::events::{EventBus, TaggingEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kwp-ai", version, about = "Photo keyword synthesis")]
struct Cli {
    /// Config file (overrides KWP_CONFIG and default locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tag every photo in a folder
    Tag {
        /// Folder containing JPEG/PNG photos
        folder: PathBuf,

        /// How new tags combine with existing ones (`<photo>.keywords`
        /// sidecars): merge, ignore, replace
        #[arg(long, default_value = "merge")]
        policy: MergePolicy,

        /// Context applied to the whole batch, e.g. "Trip to Rouen"
        #[arg(long)]
        hint: Option<String>,

        /// Keep at most this many tags per photo
        #[arg(long)]
        max_tags: Option<usize>,

        /// Model preset (see `kwp-ai models`)
        #[arg(long, env = "KWP_MODEL")]
        model: Option<String>,

        /// Run the batch once per installed preset
        #[arg(long, conflicts_with = "model")]
        compare: bool,

        /// Directory receiving run records
        #[arg(long)]
        results_dir: Option<PathBuf>,

        /// Append per-photo outcomes to this JSON Lines file (one file per
        /// model with --compare)
        #[arg(long)]
        sink: Option<PathBuf>,

        /// Descend into subfolders
        #[arg(long)]
        recursive: bool,

        /// Concurrent model requests
        #[arg(long)]
        workers: Option<usize>,
    },

    /// List model presets and whether the backend has them installed
    Models,

    /// Write the effective configuration to a TOML file
    InitConfig {
        /// Target file (defaults to the per-user config location)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Serve the pipeline over HTTP
    Serve {
        /// Bind address (overrides [server].bind)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut toml_config =
        config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kwp_ai={0},kwp_common={0}", toml_config.logging.level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("kwp-ai {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Tag {
            folder,
            policy,
            hint,
            max_tags,
            model,
            compare,
            results_dir,
            sink,
            recursive,
            workers,
        } => {
            if let Some(model) = model {
                toml_config.model.preset = model;
            }
            if let Some(workers) = workers {
                toml_config.engine.worker_limit = workers;
            }
            if let Some(dir) = results_dir {
                toml_config.results_dir = Some(dir);
            }
            let options = TagOptions {
                policy,
                hint,
                max_tags,
                compare,
                sink,
                recursive,
            };
            run_tag(&toml_config, &folder, options).await
        }
        Command::Models => list_models(&toml_config).await,
        Command::InitConfig { path, force } => init_config(&toml_config, path, force),
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                toml_config.server.bind = bind;
            }
            serve(&toml_config).await
        }
    }
}

struct TagOptions {
    policy: MergePolicy,
    hint: Option<String>,
    max_tags: Option<usize>,
    compare: bool,
    sink: Option<PathBuf>,
    recursive: bool,
}

async fn run_tag(toml_config: &TomlConfig, folder: &Path, options: TagOptions) -> Result<()> {
    let base_config = PipelineConfig::from_toml(toml_config)?;
    let client = OllamaClient::new(
        &toml_config.model.endpoint,
        toml_config.model.requests_per_second,
    )?;

    let presets: Vec<ModelPreset> = if options.compare {
        installed_presets(&client).await?
    } else {
        vec![base_config.preset]
    };

    let inputs = load_inputs(folder, options.recursive).await?;
    if inputs.is_empty() {
        bail!("No JPEG/PNG photos found in {}", folder.display());
    }
    info!(folder = %folder.display(), photos = inputs.len(), "Photos loaded");

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight requests");
            ctrl_c_token.cancel();
        }
    });

    let event_bus = EventBus::new(256);
    spawn_event_logger(&event_bus);

    let model: Arc<dyn VisionModel> = Arc::new(client);
    let results_dir = toml_config.results_dir();

    for preset in presets {
        if cancel.is_cancelled() {
            break;
        }

        let sink: Box<dyn TagSink> = match &options.sink {
            Some(path) if options.compare => {
                Box::new(JsonLinesSink::open(&per_model_path(path, preset.name)).await?)
            }
            Some(path) => Box::new(JsonLinesSink::open(path).await?),
            None => Box::new(MemorySink::new()),
        };

        let config = base_config.clone().with_preset(preset.key)?;
        let pipeline = TaggingPipeline::new(model.clone(), config, event_bus.clone());

        let mut request = BatchRequest::new(inputs.clone(), options.policy);
        request.hint = options.hint.clone();
        request.max_tags = options.max_tags;

        info!(model = preset.name, photos = inputs.len(), "Tagging with {}", preset.name);
        let report = pipeline
            .run_batch(request, sink.as_ref(), &cancel)
            .await
            .with_context(|| format!("Batch failed for model {}", preset.name))?;

        for (outcome, trace) in report.outcomes.iter().zip(&report.photos) {
            println!(
                "{} [{}] {}",
                trace.path.display(),
                outcome.status,
                outcome.tags.names().join(", ")
            );
        }

        let record = RunRecord::from_report(&report, &preset, options.policy, options.hint.as_deref());
        match write_run_record(&results_dir, &record).await {
            Ok(path) => println!("Run record: {}", path.display()),
            Err(e) => warn!(error = %e, "Run record not written"),
        }
    }

    Ok(())
}

async fn load_inputs(folder: &Path, recursive: bool) -> Result<Vec<PhotoInput>> {
    let paths = PhotoScanner::new(recursive)
        .scan(folder)
        .with_context(|| format!("Failed to scan {}", folder.display()))?;

    let reader = LittleExifReader::new();
    let mut inputs = Vec::with_capacity(paths.len());
    for path in &paths {
        match load_photo_input(path, &reader).await {
            Ok(input) => inputs.push(input),
            Err(e) => warn!(error = %e, "Skipping unreadable photo"),
        }
    }
    Ok(inputs)
}

/// Presets whose model the backend reports as installed
async fn installed_presets(client: &OllamaClient) -> Result<Vec<ModelPreset>> {
    let installed = client
        .list_models()
        .await
        .with_context(|| format!("Failed to list models at {}", client.base_url()))?;

    let mut presets = Vec::new();
    for preset in PRESETS {
        if is_installed(preset, &installed) {
            presets.push(*preset);
        } else {
            warn!(model = preset.name, "Model not installed, skipping (ollama pull {})", preset.name);
        }
    }
    if presets.is_empty() {
        bail!("None of the preset models are installed at {}", client.base_url());
    }
    Ok(presets)
}

fn is_installed(preset: &ModelPreset, installed: &[String]) -> bool {
    installed
        .iter()
        .any(|m| m == preset.name || m.trim_end_matches(":latest") == preset.name)
}

async fn list_models(toml_config: &TomlConfig) -> Result<()> {
    let client = OllamaClient::new(&toml_config.model.endpoint, None)?;
    let installed = match client.list_models().await {
        Ok(models) => Some(models),
        Err(e) => {
            warn!(error = %e, "Backend unreachable at {}", client.base_url());
            None
        }
    };

    for preset in PRESETS {
        let state = match &installed {
            Some(models) if is_installed(preset, models) => "installed",
            Some(_) => "missing",
            None => "unknown",
        };
        println!(
            "{:<14} {:<16} {:<10} {}",
            preset.key, preset.name, state, preset.description
        );
    }
    Ok(())
}

fn init_config(toml_config: &TomlConfig, path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path.or_else(config::user_config_path) {
        Some(path) => path,
        None => bail!("No per-user config directory on this platform, pass a path"),
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    config::write_toml_config(toml_config, &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

async fn serve(toml_config: &TomlConfig) -> Result<()> {
    let config = PipelineConfig::from_toml(toml_config)?;
    let client = OllamaClient::new(
        &toml_config.model.endpoint,
        toml_config.model.requests_per_second,
    )?;

    let event_bus = EventBus::new(256);
    spawn_event_logger(&event_bus);

    let pipeline = Arc::new(TaggingPipeline::new(Arc::new(client), config, event_bus));
    let app = kwp_ai::build_router(AppState::new(pipeline));

    let bind = &toml_config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Log pipeline progress events until the bus closes
fn spawn_event_logger(event_bus: &EventBus) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(TaggingEvent::RequestDegraded {
                    target, kind, reason, ..
                }) => {
                    warn!(subject = %target, kind = %kind, "Request degraded: {}", reason);
                }
                Ok(TaggingEvent::PhotoFinalized {
                    photo_id,
                    status,
                    tag_count,
                    ..
                }) => {
                    info!(photo_id = %photo_id, status = %status, tags = tag_count, "Photo finalized");
                }
                Ok(event) => tracing::debug!(?event, "Pipeline event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
