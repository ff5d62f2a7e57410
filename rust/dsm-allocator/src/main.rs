//! dsm-allocator: the central process of a shared-memory run.
//!
//! Listens for `--nodes` workers, arbitrates page ownership, barriers and
//! broadcasts until every worker has exited, then prints a run report.
//!
//! # Usage
//!
//! ```bash
//! dsm-allocator -n 4 -l ops.log
//! RUST_LOG=dsm_session=debug dsm-allocator -n 2 --report json
//! ```

use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dsm_session::{
    AllocatorConfig, Coordinator, DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE, DEFAULT_PORT, DsmError,
    OPS_TARGET, SessionStats,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "dsm-allocator")]
#[command(about = "Central allocator for distributed shared memory workers")]
#[command(version)]
struct Args {
    /// Number of worker nodes that must register
    #[arg(short = 'n', long, env = "DSM_NODES", default_value_t = 1)]
    nodes: usize,

    /// Port to listen on
    #[arg(short, long, env = "DSM_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "DSM_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Bytes per shared page
    #[arg(long, env = "DSM_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Number of pages in the shared region
    #[arg(long, env = "DSM_MAX_PAGES", default_value_t = DEFAULT_MAX_PAGES)]
    max_pages: u32,

    /// Give up on a barrier, broadcast or fault after this many milliseconds
    #[arg(long, env = "DSM_WAIT_DEADLINE_MS")]
    wait_deadline_ms: Option<u64>,

    /// Write allocation and fault events to this file
    #[arg(short, long, env = "DSM_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Run report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

impl Args {
    fn config(&self) -> AllocatorConfig {
        AllocatorConfig {
            total_nodes: self.nodes,
            listen: SocketAddr::new(self.bind, self.port),
            page_size: self.page_size,
            max_pages: self.max_pages,
            wait_deadline: self.wait_deadline_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    listen: String,
    page_size: u32,
    max_pages: u32,
    #[serde(flatten)]
    stats: &'a SessionStats,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.log_file.as_deref()) {
        eprintln!("error: cannot open log file: {}", e);
        return ExitCode::FAILURE;
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = args.config();
    match rt.block_on(run(config.clone())) {
        Ok(stats) => {
            print_report(args.report, &config, &stats);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "allocator failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AllocatorConfig) -> Result<SessionStats, DsmError> {
    let coordinator = Coordinator::new(config)?;
    let listener = TcpListener::bind(coordinator.config().listen).await?;
    coordinator.run(listener).await
}

/// Stderr gets everything the env filter allows (default `info`), without
/// timestamps. The optional log file gets only the operations trace, one
/// plain line per event.
fn init_tracing(log_file: Option<&Path>) -> std::io::Result<()> {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let ops = match log_file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(File::create(path)?))
                .with_ansi(false)
                .without_time()
                .with_level(false)
                .with_target(false)
                .with_filter(Targets::new().with_target(OPS_TARGET, Level::INFO)),
        ),
        None => None,
    };

    tracing_subscriber::registry().with(stderr).with(ops).init();
    Ok(())
}

fn print_report(format: ReportFormat, config: &AllocatorConfig, stats: &SessionStats) {
    match format {
        ReportFormat::Json => {
            let report = Report {
                listen: config.listen.to_string(),
                page_size: config.page_size,
                max_pages: config.max_pages,
                stats,
            };
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("error: failed to encode report: {}", e),
            }
        }
        ReportFormat::Text => {
            println!("nodes served:      {}", stats.nodes_served);
            println!(
                "allocations:       {} ({} bytes)",
                stats.allocations, stats.bytes_allocated
            );
            println!(
                "pages in use:      {} of {} ({} bytes each)",
                stats.pages_in_use, config.max_pages, config.page_size
            );
            println!("barriers:          {}", stats.barriers);
            println!("broadcasts:        {}", stats.broadcasts);
            println!(
                "faults:            {} read, {} write",
                stats.read_faults, stats.write_faults
            );
            println!("invalidations:     {}", stats.invalidations);
            println!("failed requests:   {}", stats.failed_requests);
            println!("dropped messages:  {}", stats.dropped_messages);
        }
    }
}
