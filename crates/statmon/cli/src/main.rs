// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! StatMon CLI Tool
//!
//! Command-line interface for sizing, exercising and inspecting a shared
//! statistics region.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use statmon_core::memory::RegionLayout;
use statmon_core::statistics::CmdType;
use statmon_core::{ErrorReport, ExecutionStats, MonitorConfig, StatMonitor, StatementEvent, StoreKind, required_shared_memory};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "statmon")]
#[command(about = "StatMon - shared query statistics CLI")]
#[command(version = "0.1.0")]
struct Cli {
    /// JSON configuration file, defaults apply to missing fields
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the shared memory a region needs
    Size,
    /// Create a region file and drive a synthetic workload into it
    Simulate {
        /// Region file to create
        #[arg(long)]
        region: PathBuf,
        /// Worker threads, each attaching independently
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Statements per worker
        #[arg(long, default_value_t = 10_000)]
        statements: usize,
        /// Distinct query ids in the workload
        #[arg(long, default_value_t = 200)]
        queries: u64,
    },
    /// Print every live entry of a region as JSON
    Dump {
        /// Region file to attach to
        #[arg(long)]
        region: PathBuf,
    },
    /// Clear statistics in a region
    Reset {
        /// Region file to attach to
        #[arg(long)]
        region: PathBuf,
        /// Only clear this bucket
        #[arg(long)]
        bucket: Option<u64>,
    },
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Size => handle_size(&config),
        Commands::Simulate { region, workers, statements, queries } => handle_simulate(&config, &region, workers, statements, queries),
        Commands::Dump { region } => handle_dump(&config, &region),
        Commands::Reset { region, bucket } => handle_reset(&config, &region, bucket),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MonitorConfig> {
    let config = match path {
        Some(path) => MonitorConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn handle_size(config: &MonitorConfig) -> anyhow::Result<()> {
    let layout = RegionLayout::for_config(config);
    println!("max entries:      {}", config.max_entries);
    println!("buckets:          {}", config.max_buckets);
    println!("entry slots:      {} bytes", layout.text_offset - layout.slots_offset);
    println!("query text:       {} bytes", layout.text_capacity());
    println!("total:            {} bytes", required_shared_memory(config));
    Ok(())
}

fn synthetic_event(rng: &mut impl Rng, queries: u64) -> StatementEvent {
    let query_id = rng.gen_range(0..queries.max(1));
    let text = format!("SELECT * FROM t{} WHERE id = $1 /* worker:sim */", query_id % 16);
    let user = rng.gen_range(1..4u64);

    if rng.gen_ratio(1, 50) {
        let report = ErrorReport {
            elevel: 21,
            sqlcode: "57014".to_string(),
            message: "canceling statement due to statement timeout".to_string(),
        };
        return StatementEvent::failed(query_id, text, report).with_user(user).with_cmd_type(CmdType::Select);
    }

    let exec = ExecutionStats {
        total_time_ms: rng.gen_range(0.05..250.0),
        rows: rng.gen_range(0..100),
        ..Default::default()
    };
    StatementEvent::new(StoreKind::Finished, query_id, text)
        .with_user(user)
        .with_application("statmon-sim")
        .with_cmd_type(CmdType::Select)
        .with_relations([format!("public.t{}", query_id % 16)])
        .with_exec(exec)
}

fn handle_simulate(config: &MonitorConfig, region: &Path, workers: usize, statements: usize, queries: u64) -> anyhow::Result<()> {
    let creator = StatMonitor::create_file(config.clone(), region).with_context(|| format!("creating region {}", region.display()))?;
    info!("Created region {} ({} bytes)", region.display(), creator.stats().region_bytes);

    let started = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let config = config.clone();
            let region = region.to_path_buf();
            thread::spawn(move || -> anyhow::Result<()> {
                let monitor = StatMonitor::attach_file(config, &region)?;
                let mut rng = rand::thread_rng();
                for _ in 0..statements {
                    let event = synthetic_event(&mut rng, queries);
                    monitor.record(&StatementEvent { kind: StoreKind::Parse, ..event.clone() });
                    monitor.record(&event);
                }
                info!("Worker {} recorded {} statements", worker, statements);
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("worker thread panicked"),
        }
    }

    let elapsed = started.elapsed();
    let stats = creator.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("{} statements in {:.2?}", workers * statements * 2, elapsed);
    Ok(())
}

fn handle_dump(config: &MonitorConfig, region: &Path) -> anyhow::Result<()> {
    let monitor = StatMonitor::attach_file(config.clone(), region).with_context(|| format!("attaching to {}", region.display()))?;
    let entries = monitor.entries();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    info!("Dumped {} entries", entries.len());
    Ok(())
}

fn handle_reset(config: &MonitorConfig, region: &Path, bucket: Option<u64>) -> anyhow::Result<()> {
    let monitor = StatMonitor::attach_file(config.clone(), region).with_context(|| format!("attaching to {}", region.display()))?;
    let removed = match bucket {
        Some(bucket) => monitor.reset_bucket(bucket),
        None => monitor.reset_all(),
    };
    println!("Removed {removed} entries");
    info!("Reset removed {} entries", removed);
    Ok(())
}
