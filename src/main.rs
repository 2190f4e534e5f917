use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ::time::{format_description::well_known, OffsetDateTime};

use mtproxy_checker::mtproto::{MtProxyProber, DEFAULT_DC};
use mtproxy_checker::parser::{self, ParsedInput};
use mtproxy_checker::probe::{BoundaryClient, ProbeExecutor, Prober};
use mtproxy_checker::scheduler::{self, RunConfig, RunEvent, RunReport, DEFAULT_WINDOW};
use mtproxy_checker::server;

/// Extra time allowed on top of the probe deadline when a remote boundary does the probing.
const BOUNDARY_GRACE: Duration = Duration::from_secs(2);

/// Bulk MTProxy liveness checker with a tiny HTTP boundary service.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mtproxy-checker",
    version,
    about = "Bulk MTProxy liveness checker: parses messy link lists, probes every proxy and ranks the working ones by latency.",
    long_about = None
)]
struct Cli {
    /// File with one proxy link per line. Reads stdin when omitted.
    input: Option<PathBuf>,

    /// Write the ranked working list to this path instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write a JSON report to this path (optional).
    #[arg(long)]
    json: Option<PathBuf>,

    /// Probes dispatched concurrently per window.
    #[arg(long, default_value_t = DEFAULT_WINDOW)]
    window: usize,

    /// Per-probe deadline in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 8000)]
    timeout_ms: u64,

    /// Telegram DC the proxies are asked to relay to.
    #[arg(long, default_value_t = DEFAULT_DC, allow_negative_numbers = true)]
    dc: i16,

    /// Delegate probes to a running boundary service at this base URL.
    #[arg(long)]
    boundary: Option<String>,

    /// Drop repeated server/port/secret entries before probing.
    #[arg(long, default_value_t = false)]
    dedup: bool,

    /// Serve the HTTP boundary service instead of running a check.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Address the boundary service listens on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Static UI directory served next to the API when it exists.
    #[arg(long = "ui-dir", default_value = "public")]
    ui_dir: PathBuf,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    started_at: String,
    finished_at: String,
    malformed: usize,
    duplicates: usize,
    #[serde(flatten)]
    run: &'a RunReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = RunConfig::new()
        .with_window(cli.window)
        .with_deadline(Duration::from_millis(cli.timeout_ms));

    if cli.serve {
        let prober = MtProxyProber::new().with_dc(cli.dc);
        let executor = ProbeExecutor::new(Arc::new(prober)).with_deadline(config.deadline);
        let state = server::AppState::new(executor, config.window);
        let ui_dir = cli.ui_dir.is_dir().then(|| cli.ui_dir.clone());
        println!("Serving on http://{} (Ctrl+C to stop)", cli.bind);
        tokio::select! {
            res = server::spawn_server(&cli.bind, state, ui_dir) => res?,
            _ = tokio::signal::ctrl_c() => {}
        }
        return Ok(());
    }

    let mut parsed = read_input(cli.input.as_deref())?;
    if cli.dedup {
        parsed = parsed.dedup();
    }
    if parsed.is_empty() {
        bail!(
            "No valid links found! ({} malformed, {} skipped)",
            parsed.malformed,
            parsed.skipped
        );
    }
    println!(
        "Parsed {} valid links. Skipped {} bad links.",
        parsed.descriptors.len(),
        parsed.skipped
    );
    if parsed.duplicates > 0 {
        println!("Dropped {} duplicate links.", parsed.duplicates);
    }

    let (prober, deadline): (Arc<dyn Prober>, Duration) = match cli.boundary.as_deref() {
        Some(url) => {
            let deadline = config.deadline + BOUNDARY_GRACE;
            (Arc::new(BoundaryClient::with_timeout(url, deadline)?), deadline)
        }
        None => (
            Arc::new(MtProxyProber::new().with_dc(cli.dc)),
            config.deadline,
        ),
    };
    let executor = ProbeExecutor::new(prober).with_deadline(deadline);

    // Ctrl-C cancels the run; whatever was found so far is still reported.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let started_at = now_rfc3339();
    let (malformed, duplicates) = (parsed.malformed, parsed.duplicates);
    let report = scheduler::run_batch(
        parsed.descriptors,
        parsed.skipped,
        &executor,
        config.window,
        cancel,
        |event| {
            if let RunEvent::ProbeFinished { progress, .. } = event {
                info!("{progress}");
            }
        },
    )
    .await;

    let text = report.render();
    match cli.output.as_deref() {
        Some(path) => {
            fs::write(path, &text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "Wrote {} working proxies to {}",
                report.entries.len(),
                path.display()
            );
        }
        None if !text.is_empty() => println!("\n{text}\n"),
        None => {}
    }

    if let Some(path) = cli.json.as_deref() {
        let json = JsonReport {
            started_at,
            finished_at: now_rfc3339(),
            malformed,
            duplicates,
            run: &report,
        };
        if let Err(e) = write_report_json(path, &json) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON report to {}", path.display());
        }
    }

    println!("{}", report.summary());
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn read_input(path: Option<&Path>) -> Result<ParsedInput> {
    match path {
        Some(p) => parser::load_input_from_path(p),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read stdin")?;
            Ok(parser::parse_input(&text))
        }
    }
}

fn write_report_json(path: &Path, report: &JsonReport<'_>) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
