use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use portsweep::config::ScanConfig;
use portsweep::error::ScanError;
use portsweep::probe::TcpConnectProbe;
use portsweep::record::ScanLog;
use portsweep::scanner::Scanner;
use portsweep::store::{load_results, ResultMap, ResultStore, ScanSink};
use portsweep::types::{ScanSummary, Target};
use portsweep::{ports, targets};

/// portsweep — polite, resumable TCP connect scanner.
#[derive(Debug, Parser)]
#[command(
    name = "portsweep",
    version,
    about = "Polite, resumable TCP connect scanner with batched checkpoints.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log verbosity: -v info, -vv debug, -vvv trace. RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe every target on every port, logging one row per attempt.
    Sweep {
        /// Hosts: IPv4, hostname, CIDR, octet sweep (82.148.64-79.0-255), or a file of them.
        #[arg(long)]
        targets: String,

        /// Ports: list/ranges such as "1-1024,8080", or a file of them.
        #[arg(long, default_value = "1-1024")]
        ports: String,

        /// Full-scan log, appended to.
        #[arg(long, default_value = "scan_results.csv")]
        log: PathBuf,

        /// Also checkpoint a host → open ports map to this file.
        #[arg(long)]
        open: Option<PathBuf>,

        #[command(flatten)]
        tuning: Tuning,
    },
    /// Re-probe hosts already known to be up over more ports, checkpointing each batch.
    Resume {
        /// Prior results: a full-scan log (Y rows are used) or a checkpoint file.
        #[arg(long, default_value = "scan_results.csv")]
        seed: PathBuf,

        #[arg(long, default_value = "1025-65535")]
        ports: String,

        /// Checkpoint file; rewritten after every batch and merged in on restart.
        #[arg(long, default_value = "open.csv")]
        out: PathBuf,

        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Debug, Clone, Args)]
struct Tuning {
    /// JSON config file; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ports per batch (one checkpoint per batch).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Connect timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// DNS lookup timeout in milliseconds.
    #[arg(long = "resolve-timeout-ms")]
    resolve_timeout_ms: Option<u64>,

    /// Pause after each port sweep, in milliseconds.
    #[arg(long = "port-delay-ms")]
    port_delay_ms: Option<u64>,

    /// Random extra pause up to this many milliseconds.
    #[arg(long = "jitter-ms")]
    jitter_ms: Option<u64>,

    /// Max concurrent TCP connect attempts.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Global probe rate ceiling, probes per second.
    #[arg(long)]
    rate: Option<u32>,

    /// Retries when local sockets are exhausted before giving up.
    #[arg(long)]
    resource_retries: Option<u32>,

    /// Skip this many batches (continue an interrupted run).
    #[arg(long)]
    skip_batches: Option<usize>,

    /// Seed for the shuffle order.
    #[arg(long)]
    shuffle_seed: Option<u64>,

    /// Stop after this many seconds; partial results are checkpointed.
    #[arg(long)]
    max_duration_secs: Option<u64>,

    /// Write the scan summary as pretty JSON to this path.
    #[arg(long)]
    summary: Option<PathBuf>,
}

impl Tuning {
    fn to_config(&self) -> Result<ScanConfig> {
        let mut c = match &self.config {
            Some(path) => ScanConfig::from_path(path)?,
            None => ScanConfig::default(),
        };
        if let Some(v) = self.batch_size {
            c.batch_size = v;
        }
        if let Some(v) = self.timeout_ms {
            c.timeout_ms = v;
        }
        if let Some(v) = self.resolve_timeout_ms {
            c.resolve_timeout_ms = v;
        }
        if let Some(v) = self.port_delay_ms {
            c.port_delay_ms = v;
        }
        if let Some(v) = self.jitter_ms {
            c.jitter_ms = v;
        }
        if let Some(v) = self.concurrency {
            c.concurrency = v;
        }
        if self.rate.is_some() {
            c.rate_per_sec = self.rate;
        }
        if let Some(v) = self.resource_retries {
            c.resource_retries = v;
        }
        if let Some(v) = self.skip_batches {
            c.skip_batches = v;
        }
        if self.shuffle_seed.is_some() {
            c.shuffle_seed = self.shuffle_seed;
        }
        if self.max_duration_secs.is_some() {
            c.max_duration_secs = self.max_duration_secs;
        }
        c.validate()?;
        Ok(c)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight probes");
            cancel_ctrlc.cancel();
        }
    });

    match cli.command {
        Command::Sweep {
            targets,
            ports,
            log,
            open,
            tuning,
        } => sweep(&targets, &ports, &log, open.as_deref(), &tuning, &cancel).await,
        Command::Resume {
            seed,
            ports,
            out,
            tuning,
        } => resume(&seed, &ports, &out, &tuning, &cancel).await,
    }
}

async fn sweep(
    target_spec: &str,
    port_spec: &str,
    log_path: &Path,
    open_path: Option<&Path>,
    tuning: &Tuning,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = tuning.to_config()?;
    let hosts = targets::resolve_targets(target_spec)?;
    let port_list = ports::resolve_ports(port_spec)?;
    print_plan("sweep", &config, hosts.len(), port_list.len());

    let mut log = ScanLog::append(log_path)?;
    let mut store = open_path.map(ResultStore::new);
    let mut map = match &store {
        Some(s) => s.load()?,
        None => ResultMap::new(),
    };

    let scanner = Scanner::new(TcpConnectProbe::new(config.resolve_timeout()), config)?;
    let mut sinks: Vec<&mut dyn ScanSink> = vec![&mut log];
    if let Some(s) = store.as_mut() {
        sinks.push(s);
    }
    let res = scanner
        .run(&hosts, &port_list, &mut map, &mut sinks, cancel)
        .await;
    drop(sinks);
    info!(rows = log.rows(), path = %log_path.display(), "full-scan log written");
    finish(res, &map, tuning.summary.as_deref())
}

async fn resume(
    seed_path: &Path,
    port_spec: &str,
    out_path: &Path,
    tuning: &Tuning,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = tuning.to_config()?;
    let mut store = ResultStore::new(out_path);
    let mut map = load_results(seed_path)?;
    map.merge(store.load()?);
    let hosts: Vec<Target> = targets::targets_from_map(&map);
    if hosts.is_empty() {
        bail!(
            "no responsive hosts in {} or {}; run a sweep first",
            seed_path.display(),
            out_path.display()
        );
    }
    let port_list = ports::resolve_ports(port_spec)?;
    print_plan("resume", &config, hosts.len(), port_list.len());

    let scanner = Scanner::new(TcpConnectProbe::new(config.resolve_timeout()), config)?;
    let res = scanner
        .run(&hosts, &port_list, &mut map, &mut [&mut store], cancel)
        .await;
    finish(res, &map, tuning.summary.as_deref())
}

fn finish(res: Result<ScanSummary, ScanError>, map: &ResultMap, summary_path: Option<&Path>) -> Result<()> {
    match res {
        Ok(summary) => {
            print_results_table(map);
            println!(
                "\nstate: {:?}  batches: {}/{}  probes: {}  open: {}  closed: {}  errors: {}  elapsed: {} ms",
                summary.state,
                summary.batches_completed,
                summary.batches_total,
                summary.probes,
                summary.open,
                summary.closed,
                summary.errors,
                summary.elapsed_ms
            );
            if let Some(path) = summary_path {
                write_summary_json(path, &summary)
                    .with_context(|| format!("failed to write summary to {}", path.display()))?;
                println!("Wrote summary to {}", path.display());
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "scan halted");
            if matches!(e, ScanError::Persistence { .. }) {
                // The checkpoint could not be written; hand the in-memory results over.
                eprintln!("Unsaved results follow on stdout as JSON.");
                println!("{}", serde_json::to_string_pretty(map)?);
            }
            Err(e.into())
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_plan(mode: &str, config: &ScanConfig, hosts: usize, ports: usize) {
    println!("portsweep {mode}:");
    println!("  targets      : {hosts}");
    println!("  ports        : {ports}");
    println!("  batch_size   : {}", config.batch_size);
    println!("  concurrency  : {}", config.concurrency);
    println!("  timeout_ms   : {}", config.timeout_ms);
    println!(
        "  pacing       : {} ms + up to {} ms jitter per port",
        config.port_delay_ms, config.jitter_ms
    );
    println!(
        "  rate         : {}",
        config
            .rate_per_sec
            .map(|r| format!("{r}/s"))
            .unwrap_or_else(|| "<unlimited>".to_string())
    );
}

fn print_results_table(map: &ResultMap) {
    let host_w = map
        .targets()
        .map(|t| t.as_str().len())
        .max()
        .unwrap_or(0)
        .max("host".len());

    println!("\nHosts with open ports: {}", map.iter().filter(|(_, p)| !p.is_empty()).count());
    println!("{:<host_w$}  open ports", "host", host_w = host_w);
    println!("{:-<host_w$}  {:-<10}", "", "", host_w = host_w);
    for (target, ports) in map.iter().filter(|(_, p)| !p.is_empty()) {
        let list = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("{:<host_w$}  {}", target, list, host_w = host_w);
    }
}

fn write_summary_json(path: &Path, summary: &ScanSummary) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
