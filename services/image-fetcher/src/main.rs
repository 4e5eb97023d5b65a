use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use image_fetcher::api::{create_router, ApiState};
use image_fetcher::input::{load_keys, parse_dimensions, DEFAULT_COLUMN};
use shared::batch::{BatchFetcher, BatchOptions};
use shared::config::StorageConfig;
use shared::local_write::WriteRetryPolicy;
use shared::storage::scratch::release_all_live;
use shared::storage::StorageClient;
use shared::telemetry::{self, TelemetryConfig};
use shared::transcode::{TranscodeTarget, DEFAULT_QUALITY};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "image-fetcher")]
#[command(about = "Fetch sharded originals from S3-compatible storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every image listed in a CSV column
    Fetch(FetchArgs),
    /// Serve originals and presigned URLs over HTTP
    Serve,
}

#[derive(Args)]
struct FetchArgs {
    /// CSV file with a header row
    #[arg(long)]
    csv: PathBuf,

    /// Collection the originals belong to
    #[arg(long)]
    collection: String,

    /// Column holding the filenames
    #[arg(long, default_value = DEFAULT_COLUMN)]
    column: String,

    #[arg(long, default_value = "utm_trs_images")]
    output: PathBuf,

    /// Size budget for each output file, in KB
    #[arg(long)]
    max_size_kb: Option<u64>,

    /// Starting JPEG quality
    #[arg(long, default_value_t = DEFAULT_QUALITY, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Resize to WIDTHxHEIGHT
    #[arg(long, value_parser = parse_dimensions)]
    resize: Option<(u32, u32)>,

    /// Refetch files that already exist in the output directory
    #[arg(long)]
    overwrite: bool,
}

fn get_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} environment variable not set", name))
}

fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding storage calls");
            // Scratch is released by main after the command unwinds
            cancel.cancel();
        }
    });
}

async fn fetch(args: FetchArgs, client: &StorageClient) -> Result<ExitCode> {
    let write_policy = WriteRetryPolicy::from_env().context("Invalid write retry configuration")?;

    let keys = load_keys(&args.csv, &args.column);
    if keys.is_empty() {
        error!(csv = %args.csv.display(), column = %args.column, "no keys to fetch");
        return Ok(ExitCode::FAILURE);
    }

    let options = BatchOptions {
        collection: args.collection,
        output_dir: args.output,
        target: TranscodeTarget {
            max_size_kb: args.max_size_kb,
            quality: args.quality,
            resize_to: args.resize,
        },
        overwrite: args.overwrite,
        write_policy,
    };

    let report = BatchFetcher::new(client, options).run(&keys).await;
    info!(saved = report.saved_paths().len(), total = keys.len(), "fetch complete");
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize batch report")?
    );

    Ok(if report.cancelled {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn serve(client: StorageClient, cancel: CancellationToken) -> Result<()> {
    let port = get_env("PORT")?
        .parse::<u16>()
        .context("PORT must be a valid number")?;

    let client = Arc::new(client);
    let reclaimer = client.spawn_scratch_reclaimer(client.config().url_expiry);

    let app = create_router(ApiState {
        client: Arc::clone(&client),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    reclaimer.abort();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();

    let telemetry_config = TelemetryConfig::from_env("image-fetcher");
    telemetry::init_telemetry(telemetry_config)?;

    let cli = Cli::parse();

    let config = StorageConfig::from_env().context("Invalid storage configuration")?;
    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(cancel.clone());

    let client = StorageClient::new(config, cancel.clone())
        .context("Failed to initialize storage client")?;

    let result = match cli.command {
        Commands::Fetch(args) => fetch(args, &client).await,
        Commands::Serve => {
            info!("Starting image fetcher server");
            serve(client, cancel).await.map(|_| ExitCode::SUCCESS)
        }
    };

    release_all_live();
    result
}
