//! Storefront background removal CLI
//!
//! Processes each source as an independent consumer of one shared pipeline
//! and writes successful results to the output directory. Sources that fall
//! back are reported and make the command exit with an error.

use crate::config::{OutputFormat, PipelineConfig};
use crate::engine::{OnnxSegmentationModel, PreprocessingConfig, SegmentationEngine};
use crate::pipeline::{Pipeline, PipelineController, ProcessOutcome};
use crate::progress::LogProgressReporter;
use crate::source::SourceReference;
use crate::tracing_config::init_cli_tracing;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use reqwest::Url;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Storefront logo background removal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "storefront-bgremove")]
pub struct Cli {
    /// Image sources: http(s) URLs, file:// or data: URIs, or local paths
    #[arg(value_name = "SOURCE", required = true)]
    pub sources: Vec<String>,

    /// Path to an ONNX segmentation model
    #[arg(short, long, value_name = "MODEL")]
    pub model: PathBuf,

    /// Directory for processed images
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Output format (overrides the config file)
    #[arg(short, long, value_enum)]
    pub format: Option<CliOutputFormat>,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Square input size expected by the model
    #[arg(long, default_value_t = 1024)]
    pub target_size: u32,

    /// Number of inference threads (0 = let ONNX Runtime decide)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Process duplicate sources independently
    #[arg(long)]
    pub no_dedupe: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliOutputFormat {
    Png,
    Webp,
}

impl From<CliOutputFormat> for OutputFormat {
    fn from(format: CliOutputFormat) -> Self {
        match format {
            CliOutputFormat::Png => OutputFormat::Png,
            CliOutputFormat::Webp => OutputFormat::WebP,
        }
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    let config = build_config(&cli)?;
    let sources = cli
        .sources
        .iter()
        .map(|arg| to_source(arg))
        .collect::<Result<Vec<_>>>()?;

    tokio::fs::create_dir_all(&cli.output_dir)
        .await
        .with_context(|| format!("Failed to create {}", cli.output_dir.display()))?;

    let preprocessing = PreprocessingConfig {
        target_size: cli.target_size,
        ..PreprocessingConfig::default()
    };
    let model = OnnxSegmentationModel::from_file(&cli.model, preprocessing, cli.threads)
        .with_context(|| format!("Failed to load model {}", cli.model.display()))?;
    let engine = Arc::new(SegmentationEngine::new(model, config.output_format));
    let pipeline = Pipeline::builder(engine)
        .config(config.clone())
        .reporter(Arc::new(LogProgressReporter::new(cli.verbose > 0)))
        .build()
        .context("Failed to build pipeline")?;

    info!("Processing {} source(s)", sources.len());
    let progress = ProgressBar::new(sources.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let outcomes = futures::future::join_all(sources.iter().map(|source| {
        let controller = PipelineController::new(pipeline.clone());
        let progress = progress.clone();
        async move {
            let outcome = controller
                .process_detailed(source, &CancellationToken::new())
                .await;
            progress.set_message(source.short_name().to_string());
            progress.inc(1);
            // Keep the controller alive until the result has been written
            (controller, outcome)
        }
    }))
    .await;
    progress.finish_and_clear();

    let mut used_names = HashSet::new();
    let mut fallbacks = 0usize;
    for (source, (controller, outcome)) in sources.iter().zip(outcomes) {
        match outcome {
            ProcessOutcome::Succeeded(reference) => {
                let resource = pipeline
                    .table()
                    .resolve(reference.as_str())
                    .with_context(|| format!("{} was released before it was written", reference))?;
                let path = cli.output_dir.join(output_name(
                    source,
                    config.output_format,
                    &mut used_names,
                ));
                tokio::fs::write(&path, &*resource.data)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("{} -> {}", source, path.display());
            },
            ProcessOutcome::FellBack { kind, .. } => {
                fallbacks += 1;
                warn!("{} fell back to the original image ({})", source, kind);
                println!("{} -> unchanged ({})", source, kind);
            },
            ProcessOutcome::Cancelled(_) => {
                fallbacks += 1;
                warn!("{} was cancelled", source);
            },
        }
        controller.release();
    }

    if fallbacks > 0 {
        anyhow::bail!("{} of {} source(s) fell back", fallbacks, sources.len());
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides()
    .context("Invalid environment override")?;

    if let Some(format) = cli.format {
        config.output_format = format.into();
    }
    if cli.no_dedupe {
        config.deduplicate = false;
    }
    // Local paths are passed as file:// sources by the operator
    if !config.allows_scheme("file") {
        config.allowed_schemes.push("file".to_string());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Accept URLs as-is and turn local paths into `file://` URLs
fn to_source(arg: &str) -> Result<SourceReference> {
    let source = SourceReference::new(arg);
    let is_url = arg.starts_with("data:") || arg.contains("://");
    if is_url && source.scheme().is_some() {
        return Ok(source);
    }

    let path = std::fs::canonicalize(arg).with_context(|| format!("No such file: {}", arg))?;
    let url = Url::from_file_path(&path)
        .map_err(|()| anyhow::anyhow!("Cannot express {} as a file URL", path.display()))?;
    Ok(SourceReference::new(url.as_str()))
}

/// File name for a processed source, unique within one run
fn output_name(
    source: &SourceReference,
    format: OutputFormat,
    used: &mut HashSet<String>,
) -> String {
    let short_name = source.short_name();
    let stem = Path::new(short_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(short_name);
    let stem: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if stem.is_empty() { "image".to_string() } else { stem };

    let mut name = format!("{}-nobg.{}", stem, format.extension());
    let mut counter = 2;
    while !used.insert(name.clone()) {
        name = format!("{}-nobg-{}.{}", stem, counter, format.extension());
        counter += 1;
    }
    name
}
