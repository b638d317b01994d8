//! booktran coordinator
//!
//! Translates one text document on the configured SSH workers and writes
//! the stitched result.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bt_core::config;
use bt_core::{Event, EventBus, SessionFilter};
use bt_orchestrator::{ws, JobError, JobSpec, Orchestrator};
use bt_worker::{SshConnector, SshSettings};

#[derive(Parser)]
#[command(name = "bt-orchestrator")]
#[command(about = "Translate a document on remote SSH workers")]
#[command(version)]
struct Args {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, env = "BT_CONFIG")]
    config: PathBuf,

    /// UTF-8 text document to translate
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the translation (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Source language
    #[arg(long)]
    from: String,

    /// Target language
    #[arg(long)]
    to: String,

    /// Model identifier passed to the worker program
    #[arg(long)]
    model: String,

    /// Session identifier events are published under
    #[arg(long, default_value = "cli")]
    session: String,

    /// Serve events to websocket clients on this address
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Keep source text for segments that fail instead of failing the job
    #[arg(long)]
    lenient: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config::load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    tracing::info!("Loaded configuration with {} workers", config.workers.len());

    let bus = EventBus::new(config.subscriber_buffer);
    let connector = Arc::new(SshConnector::new(SshSettings::from_config(&config)));
    let probe_interval = config.health_probe_interval();
    let subscriber_buffer = config.subscriber_buffer;
    let orchestrator = Orchestrator::from_config(config, connector, bus.clone())
        .context("Invalid configuration")?;

    let cancel = CancellationToken::new();
    let monitor = orchestrator
        .pool()
        .spawn_health_monitor(probe_interval, cancel.clone());

    if let Some(bind) = args.ws_bind {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind websocket adapter to {}", bind))?;
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = ws::serve(listener, bus, subscriber_buffer, cancel).await {
                tracing::error!("Websocket adapter failed: {}", e);
            }
        });
    }

    let mut events = bus.subscribe(SessionFilter::All, subscriber_buffer);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, cancelling job...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, cancelling job...");
            }
        }

        cancel_clone.cancel();
    });

    let document = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("Failed to read {:?}", args.input))?;

    let mut spec = JobSpec::new(document, args.from, args.to, args.model).with_session(args.session);
    if args.lenient {
        spec = spec.with_strict(false);
    }

    let handle = orchestrator.submit(spec).context("Failed to submit job")?;
    let job_id = handle.id();
    tracing::info!("Job {} submitted", job_id);

    let result = {
        let wait = handle.wait();
        tokio::pin!(wait);
        tokio::select! {
            result = &mut wait => result,
            _ = cancel.cancelled() => {
                orchestrator.cancel(&job_id)?;
                wait.await
            }
        }
    };

    cancel.cancel();
    orchestrator.shutdown().await;
    let _ = monitor.await;

    let output = match result {
        Ok(output) => output,
        Err(JobError::Cancelled) => anyhow::bail!("Job {} cancelled", job_id),
        Err(e) => {
            let category = e.category();
            return Err(e).context(format!("Job {} failed ({})", job_id, category));
        }
    };

    for warning in output.warnings() {
        tracing::warn!(
            "Segment {} kept its source text: {}",
            warning.index,
            warning.error.as_deref().unwrap_or("unknown error")
        );
    }
    for (worker, count) in &output.per_worker {
        tracing::info!("{} translated {} segments", worker, count);
    }

    match &args.output {
        Some(path) => tokio::fs::write(path, &output.document)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&output.document).await?;
            stdout.flush().await?;
        }
    }

    tracing::info!("Translated {} segments in {:?}", output.segments.len(), output.elapsed);
    Ok(())
}

fn log_event(event: &Event) {
    let kind = event.kind.as_str();
    match (&event.error, event.progress) {
        (Some(error), _) => tracing::warn!(
            session = %event.session_id.as_str(),
            step = event.step.as_deref().unwrap_or("-"),
            "{}: {}",
            kind,
            error
        ),
        (None, Some(progress)) => tracing::info!(
            session = %event.session_id.as_str(),
            step = event.step.as_deref().unwrap_or("-"),
            "{} ({:.1}%)",
            kind,
            progress * 100.0
        ),
        (None, None) => tracing::info!(
            session = %event.session_id.as_str(),
            "{} {}",
            kind,
            event.message.as_deref().unwrap_or("")
        ),
    }
}
