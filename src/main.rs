//! PVC Migrator
//!
//! Moves a PersistentVolumeClaim to another StorageClass, one confirmed
//! step at a time.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pvc_migrator::migration::{TerminalGate, TerminalProgress};
use pvc_migrator::{
    Discovery, KubeResourceClient, MigrationConfig, MigrationPlan, ResourceClient,
    StepSequencer,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Migrate a PersistentVolumeClaim to another StorageClass
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubeconfig context to connect with
    #[arg(long, env = "KUBE_CONTEXT")]
    context: String,

    /// Namespace of the claim
    #[arg(short, long, env = "NAMESPACE")]
    namespace: String,

    /// StorageClass to migrate the claim to
    #[arg(short = 's', long = "storage-class", env = "TARGET_STORAGE_CLASS")]
    storage_class: String,

    /// Name of the PersistentVolumeClaim to migrate
    claim: String,

    /// Seconds between checks while waiting
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "1")]
    poll_interval_secs: u64,

    /// Give up waiting after this many seconds (waits indefinitely if unset)
    #[arg(long, env = "POLL_TIMEOUT_SECS")]
    poll_timeout_secs: Option<u64>,

    /// Image for the copy job (needs sh and cp)
    #[arg(long, env = "COPY_IMAGE", default_value = pvc_migrator::config::DEFAULT_COPY_IMAGE)]
    copy_image: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args);

    let code = match run(args).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // stdin reads cannot be cancelled; exit instead of waiting on runtime shutdown
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let config = MigrationConfig::from_secs(
        args.poll_interval_secs,
        args.poll_timeout_secs,
        &args.copy_image,
    )?;

    info!("Starting PVC migrator {}", pvc_migrator::VERSION);
    info!("  Context: {}", args.context);
    info!("  Claim: {}/{}", args.namespace, args.claim);
    info!("  Target storage class: {}", args.storage_class);

    let client: Arc<dyn ResourceClient> = Arc::new(
        KubeResourceClient::for_context(&args.context)
            .await
            .with_context(|| format!("connecting with context {}", args.context))?,
    );

    let ctx = Discovery::new(client.as_ref())
        .discover(&args.namespace, &args.claim, &args.storage_class)
        .await
        .context("cannot plan migration")?;

    let plan = MigrationPlan::standard(&ctx);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let mut sequencer = StepSequencer::new(
        client,
        Arc::new(TerminalGate::new()),
        Arc::new(TerminalProgress::new()),
        config,
    )
    .with_cancellation(cancel);

    let report = sequencer.run(&ctx, &plan).await;

    println!();
    for line in report.summary() {
        println!("{}", line);
    }
    info!(
        "Run {} finished in {}s",
        report.run_id,
        (report.finished_at - report.started_at).num_seconds()
    );

    Ok(report.is_success())
}

/// First Ctrl-C stops at the next prompt or poll tick; the second exits
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, stopping after the current operation");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
    });
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=warn", "tower=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}
