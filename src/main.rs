//! Icon Conversion Worker
//!
//! Converts SVG/PNG files into ICO, ICNS or PNG through the bounded job
//! queue and worker pool. At most `QUEUE_CAPACITY` files are in flight at
//! once; a submission the queue still rejects is retried with backoff.
//!
//! ## Configuration
//!
//! Environment variables (each also available as a flag):
//! - `QUEUE_CAPACITY`: Maximum pending jobs (default: 64)
//! - `WORKER_CONCURRENCY`: Number of workers (default: CPU count)
//! - `DEFAULT_TIMEOUT_MS` / `MAX_TIMEOUT_MS`: Per-job timeouts
//! - `MAX_INPUT_BYTES`: Largest accepted input
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` / `OTEL_SERVICE_NAME`: OTLP span export
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_convert::{
    config::ServiceConfig,
    converter::IconConverter,
    error::ConversionError,
    job::ConversionArtifact,
    format::{BitDepth, ColorSpace, ConversionOptions, IconFormat, PngOptions},
    service::ConversionService,
    telemetry::{self, TelemetryCollector},
};

/// Submissions per file before a full queue counts as a failure.
const SUBMIT_ATTEMPTS: u32 = 5;

/// Base delay between submissions, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Convert SVG/PNG files into ICO, ICNS or PNG icons.
#[derive(Debug, Parser)]
#[command(name = "worker-convert", version)]
struct Cli {
    /// Input files (.svg or .png)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output format
    #[arg(long, default_value = "ico")]
    to: IconFormat,

    /// Directory for converted files (default: next to each input)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Largest output edge in pixels
    #[arg(long)]
    size: Option<u32>,

    /// Content scale inside the canvas, in (0, 1]
    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    /// Corner rounding as a fraction of the edge, in [0, 0.5]
    #[arg(long, default_value_t = 0.0)]
    corner_radius: f32,

    /// Make the background colour transparent
    #[arg(long)]
    remove_background: bool,

    /// PNG only: DPI metadata
    #[arg(long)]
    dpi: Option<u32>,

    /// PNG only: rgba, rgb, grayscale or grayscale-alpha
    #[arg(long, default_value = "rgba")]
    color_space: ColorSpace,

    /// PNG only: 8 or 16 bits per sample
    #[arg(long, default_value_t = 8)]
    bit_depth: u8,

    /// Full options as JSON; overrides the individual option flags
    #[arg(long)]
    options_json: Option<String>,

    /// Per-file timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 64)]
    queue_capacity: usize,

    #[arg(long, env = "WORKER_CONCURRENCY")]
    workers: Option<usize>,

    #[arg(long, env = "DEFAULT_TIMEOUT_MS", default_value_t = 30_000)]
    default_timeout_ms: u64,

    #[arg(long, env = "MAX_TIMEOUT_MS", default_value_t = 120_000)]
    max_timeout_ms: u64,

    #[arg(long, env = "MAX_INPUT_BYTES", default_value_t = 10 * 1024 * 1024)]
    max_input_bytes: usize,

    /// OTLP collector; spans are only exported when set
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = telemetry::TRACER_NAME)]
    service_name: String,
}

impl Cli {
    fn service_config(&self) -> ServiceConfig {
        let defaults = ServiceConfig::default();
        ServiceConfig {
            queue_capacity: self.queue_capacity,
            worker_count: self.workers.unwrap_or(defaults.worker_count),
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            max_input_bytes: self.max_input_bytes,
        }
    }

    fn options(&self) -> Result<ConversionOptions> {
        if let Some(raw) = &self.options_json {
            return serde_json::from_str(raw).context("Invalid --options-json");
        }
        let bit_depth = BitDepth::try_from(self.bit_depth).map_err(anyhow::Error::msg)?;
        Ok(ConversionOptions {
            scale: self.scale,
            corner_radius: self.corner_radius,
            remove_background: self.remove_background,
            output_size: self.size,
            png: PngOptions {
                dpi: self.dpi,
                color_space: self.color_space,
                bit_depth,
            },
        })
    }

    fn output_path(&self, input: &Path) -> PathBuf {
        let file_name = input.with_extension(self.to.extension());
        match (&self.out_dir, file_name.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => file_name,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Some(endpoint) = &cli.otlp_endpoint {
        if let Err(e) = telemetry::init_telemetry(endpoint, &cli.service_name) {
            warn!("Failed to initialize telemetry: {}", e);
        }
    }
    let options = cli.options()?;
    let config = cli.service_config();
    info!(
        "Configuration: workers={}, queue_capacity={}, output={}",
        config.worker_count, config.queue_capacity, cli.to
    );

    let in_flight = Arc::new(Semaphore::new(config.queue_capacity));
    let service = Arc::new(
        ConversionService::new(
            config,
            Arc::new(IconConverter::new()),
            Arc::new(TelemetryCollector),
        )
        .context("Invalid service configuration")?,
    );

    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let tasks: Vec<_> = cli
        .inputs
        .iter()
        .map(|input| {
            let service = service.clone();
            let in_flight = in_flight.clone();
            let options = options.clone();
            let input = input.clone();
            let output = cli.output_path(&input);
            let to = cli.to;
            tokio::spawn(async move {
                let result = match in_flight.acquire_owned().await {
                    Ok(_permit) => {
                        convert_file(&service, &input, &output, to, options, timeout).await
                    }
                    Err(e) => Err(e.into()),
                };
                (input, output, result)
            })
        })
        .collect();

    let mut failures = 0;
    let stdout = std::io::stdout();
    for task in tasks {
        let (input, output, result) = task.await.context("Conversion task panicked")?;
        let line = match result {
            Ok(bytes) => json!({
                "input": input,
                "output": output,
                "bytes": bytes,
                "status": "ok",
            }),
            Err(e) => {
                failures += 1;
                error!("Conversion failed: input={}, error={:#}", input.display(), e);
                json!({
                    "input": input,
                    "status": "error",
                    "error": format!("{e:#}"),
                })
            }
        };
        writeln!(stdout.lock(), "{line}").context("Failed to write summary")?;
    }

    service.shutdown().await;
    telemetry::shutdown_telemetry();

    if failures > 0 {
        bail!("{} of {} conversions failed", failures, cli.inputs.len());
    }
    Ok(())
}

/// Converts one file and writes the output atomically.
async fn convert_file(
    service: &ConversionService,
    input: &Path,
    output: &Path,
    to: IconFormat,
    options: ConversionOptions,
    timeout: Option<Duration>,
) -> Result<usize> {
    let from = IconFormat::from_path(input)
        .with_context(|| format!("Cannot infer input format of {}", input.display()))?;
    let data = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let artifact = convert_with_retry(service, input, Bytes::from(data), from, to, options, timeout).await?;

    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let output = output.to_path_buf();
    let len = artifact.len();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&artifact.data)?;
        tmp.persist(&output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        Ok(())
    })
    .await
    .context("Write task panicked")??;

    Ok(len)
}

/// Converts `data`, resubmitting while the queue reports it is full.
async fn convert_with_retry(
    service: &ConversionService,
    input: &Path,
    data: Bytes,
    from: IconFormat,
    to: IconFormat,
    options: ConversionOptions,
    timeout: Option<Duration>,
) -> Result<ConversionArtifact, ConversionError> {
    let mut attempt = 1;
    loop {
        match service
            .convert(data.clone(), from, to, options.clone(), timeout)
            .await
        {
            Err(ConversionError::QueueFull { .. }) if attempt < SUBMIT_ATTEMPTS => {
                warn!(
                    "Conversion queue full, retrying: input={}, attempt={}",
                    input.display(),
                    attempt
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
