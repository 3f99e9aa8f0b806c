use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use ackq::core::{Clock, Registry};
use ackq::QueueConfig;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser)]
#[command(name = "ackq-cli", version, about = "ackq work queue tooling")]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the stores and topics file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Visibility timeout for popped entries, in milliseconds
    #[arg(long, global = true)]
    visibility_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a payload onto a topic
    Push { topic: String, payload: String },
    /// Pop the oldest ready entry of a topic
    Pop {
        topic: String,
        /// Acknowledge immediately after printing
        #[arg(long)]
        ack: bool,
    },
    /// Acknowledge an in-flight entry
    Ack { topic: String, id: u64 },
    /// Ready and in-flight counts of a topic
    Stats { topic: String },
    /// Where a single entry currently is: ready, in flight or gone
    Inspect { topic: String, id: u64 },
    /// Delete all ready and in-flight entries of a topic
    Purge { topic: String },
    /// Delete a topic entirely
    Drop { topic: String },
    /// List known topics with their counts
    Topics,
    /// Requeue every expired in-flight entry now
    Recover,
    /// Measure push/pop/ack throughput on a scratch directory
    Bench {
        #[arg(long = "messages", default_value_t = 10_000)]
        messages: u64,
        #[arg(long = "payload-bytes", default_value_t = 256)]
        payload_bytes: usize,
        #[arg(long = "keep")]
        keep: bool,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let mut out = io::BufWriter::new(io::stdout());

    if let Commands::Bench {
        messages,
        payload_bytes,
        keep,
    } = cli.command
    {
        return cmd_bench(config, messages, payload_bytes, keep, &mut out);
    }

    let registry = Registry::open(config).context("failed to open registry")?;
    match cli.command {
        Commands::Push { topic, payload } => {
            let id = registry.push(&topic, payload.as_bytes())?;
            writeln!(out, "id={id}")?;
        }
        Commands::Pop { topic, ack } => match registry.pop(&topic) {
            Ok(delivery) => {
                writeln!(
                    out,
                    "id={} deadline_ns={} payload={}",
                    delivery.id,
                    delivery.deadline_ns,
                    String::from_utf8_lossy(&delivery.payload)
                )?;
                if ack {
                    registry.ack(&topic, delivery.id)?;
                    writeln!(out, "acked=true")?;
                }
            }
            Err(err) if err.is_empty_queue() => writeln!(out, "empty")?,
            Err(err) => return Err(err.into()),
        },
        Commands::Ack { topic, id } => {
            let acked = registry.ack(&topic, id)?;
            writeln!(out, "acked={acked}")?;
        }
        Commands::Stats { topic } => {
            let stats = registry.stats(&topic)?;
            writeln!(out, "{}", serde_json::to_string(&stats)?)?;
        }
        Commands::Inspect { topic, id } => {
            let Some(handle) = registry.topic(&topic) else {
                bail!("unknown topic {topic:?}");
            };
            if handle.is_ready(id)? {
                writeln!(out, "id={id} state=ready")?;
            } else if let Some(deadline_ns) = handle.peek_in_flight(id)? {
                let now_ns = registry.clock().now();
                writeln!(
                    out,
                    "id={id} state=in_flight deadline_ns={deadline_ns} expires_in_ms={}",
                    deadline_ns.saturating_sub(now_ns) / 1_000_000
                )?;
            } else {
                writeln!(out, "id={id} state=absent")?;
            }
        }
        Commands::Purge { topic } => {
            let removed = registry.remove_all(&topic)?;
            writeln!(out, "removed={removed}")?;
        }
        Commands::Drop { topic } => {
            let existed = registry.remove_topic(&topic)?;
            writeln!(out, "dropped={existed}")?;
        }
        Commands::Topics => {
            for name in registry.topic_names() {
                let stats = registry.stats(&name)?;
                writeln!(
                    out,
                    "{name} ready={} in_flight={}",
                    stats.ready, stats.in_flight
                )?;
            }
        }
        Commands::Recover => {
            let dirty = registry.scan_all();
            writeln!(out, "dirty_topics={dirty}")?;
        }
        Commands::Bench { .. } => unreachable!("handled above"),
    }
    out.flush()?;
    registry.exit();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<QueueConfig> {
    let mut config = match &cli.config {
        Some(path) => QueueConfig::load(path)?,
        None => QueueConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(timeout) = cli.visibility_timeout_ms {
        config.visibility_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn cmd_bench(
    mut config: QueueConfig,
    messages: u64,
    payload_bytes: usize,
    keep: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let unique = format!("ackq_bench_{}_{}", std::process::id(), rand_suffix());
    let data_dir = std::env::temp_dir().join(unique);
    if data_dir.exists() {
        bail!("bench directory {} already exists", data_dir.display());
    }
    config.data_dir = data_dir.clone();
    writeln!(out, "data_dir={}", data_dir.display())?;
    info!("bench: {messages} messages of {payload_bytes} bytes");

    let registry = Registry::open(config)?;
    let payload = vec![0u8; payload_bytes];

    let start = Instant::now();
    for _ in 0..messages {
        registry.push("bench", &payload)?;
    }
    let push = start.elapsed();

    let start = Instant::now();
    for _ in 0..messages {
        let delivery = registry.pop("bench")?;
        registry.ack("bench", delivery.id)?;
    }
    let pop_ack = start.elapsed();

    for (phase, elapsed) in [("push", push), ("pop_ack", pop_ack)] {
        writeln!(out, "{}", PhaseReport::new(phase, messages, elapsed))?;
    }
    let stats = registry.stats("bench")?;
    writeln!(out, "left_ready={} left_in_flight={}", stats.ready, stats.in_flight)?;

    registry.exit();
    drop(registry);
    if keep {
        writeln!(out, "cleanup=kept")?;
    } else {
        fs::remove_dir_all(&data_dir)?;
        writeln!(out, "cleanup=removed")?;
    }
    out.flush()?;
    Ok(())
}

/// Throughput of one bench phase, one line per phase.
struct PhaseReport {
    phase: &'static str,
    ops: u64,
    elapsed: Duration,
}

impl PhaseReport {
    fn new(phase: &'static str, ops: u64, elapsed: Duration) -> Self {
        Self {
            phase,
            ops,
            elapsed,
        }
    }
}

impl std::fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.elapsed.as_secs_f64().max(1e-9);
        let per_op_us = if self.ops == 0 {
            0.0
        } else {
            self.elapsed.as_secs_f64() * 1e6 / self.ops as f64
        };
        write!(
            f,
            "phase={} ops={} elapsed_ms={} ops_per_sec={:.0} us_per_op={:.2}",
            self.phase,
            self.ops,
            self.elapsed.as_millis(),
            self.ops as f64 / secs,
            per_op_us
        )
    }
}

fn rand_suffix() -> u32 {
    rand::random()
}
