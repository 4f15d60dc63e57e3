//! Binary entry point for the `tsengine-cli` administrative tool.

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tsengine::config::EngineConfig;
use tsengine::engine::Engine;
use tsengine::types::{MetricId, Tier};

#[derive(Parser, Debug)]
#[command(
    name = "tsengine-cli",
    version,
    about = "Administrative CLI for the tsengine storage core",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, default_value = "./tsengine-data", help = "Engine data directory")]
    data_dir: PathBuf,

    #[arg(long, global = true, default_value = "info", help = "tracing filter, e.g. tsengine=debug")]
    log: String,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text, help = "Output format")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Open the engine and print its configuration")]
    Open,

    #[command(about = "Ingest a single sample for a metric")]
    Store {
        #[arg(long, help = "Metric UUID; a random one is generated if omitted")]
        metric: Option<uuid::Uuid>,

        #[arg(long, default_value_t = 1, help = "Retention tier to store into")]
        tier: Tier,

        #[arg(long, default_value_t = 1, help = "Expected seconds between samples")]
        update_every: u32,

        #[arg(long, help = "Sample timestamp in microseconds since epoch")]
        time: u64,

        #[arg(long, help = "Sample value")]
        value: f64,
    },

    #[command(about = "Read one sample nearest a timestamp for a metric")]
    Query {
        #[arg(long, help = "Metric UUID")]
        metric: uuid::Uuid,

        #[arg(long, default_value_t = 1, help = "Retention tier to query")]
        tier: Tier,

        #[arg(long, default_value_t = 0, help = "Range start, microseconds")]
        start: u64,

        #[arg(long, help = "Range end, microseconds")]
        end: u64,

        #[arg(long, help = "Timestamp to resolve, microseconds")]
        time: u64,
    },

    #[command(about = "Force a flush and eviction pass on the given tier")]
    Compact {
        #[arg(long, default_value_t = 1, help = "Retention tier to compact")]
        tier: Tier,
    },

    #[command(about = "Print engine and cache statistics")]
    Stats,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    tsengine::logging::init_logging(&cli.log).ok();

    let mut config = EngineConfig::default();
    config.data_dir = cli.data_dir.clone();
    let engine = Engine::open(config)?;

    match cli.command {
        Command::Open => {
            print_kv(cli.format, &[("data_dir", cli.data_dir.display().to_string())]);
        }
        Command::Store {
            metric,
            tier,
            update_every,
            time,
            value,
        } => {
            let metric_id = metric.map(MetricId).unwrap_or_else(MetricId::new_random);
            let handle = engine.store_init(metric_id, tier, update_every)?;
            engine.store_next(handle, time, value)?;
            engine.store_finalize(handle)?;
            print_kv(
                cli.format,
                &[
                    ("metric", metric_id.to_string()),
                    ("tier", tier.to_string()),
                    ("time", time.to_string()),
                    ("value", value.to_string()),
                ],
            );
        }
        Command::Query {
            metric,
            tier,
            start,
            end,
            time,
        } => {
            let metric_id = MetricId(metric);
            let handle = engine.load_init(metric_id, tier, start, end)?;
            let value = engine.load_next(handle, time)?;
            engine.load_finalize(handle);
            match value {
                Some(v) => print_kv(cli.format, &[("time", time.to_string()), ("value", v.to_string())]),
                None => print_kv(cli.format, &[("time", time.to_string()), ("value", "no_data".to_string())]),
            }
        }
        Command::Compact { tier } => {
            let evicted = engine.evict_once()?;
            engine.maybe_rotate(tier).await?;
            print_kv(cli.format, &[("evicted_pages", evicted.to_string())]);
        }
        Command::Stats => {
            let stats = engine.stats();
            let cache = engine.cache_stats();
            print_kv(
                cli.format,
                &[
                    ("pages_added", stats.pages_added.to_string()),
                    ("pages_evicted", stats.pages_evicted.to_string()),
                    ("extents_written", stats.extents_written.to_string()),
                    ("extents_read", stats.extents_read.to_string()),
                    ("extent_read_errors", stats.extent_read_errors.to_string()),
                    ("flush_cycles", stats.flush_cycles.to_string()),
                    ("datafile_rotations", stats.datafile_rotations.to_string()),
                    ("cache_hot", cache.hot.to_string()),
                    ("cache_dirty", cache.dirty.to_string()),
                    ("cache_clean", cache.clean.to_string()),
                    ("cache_pressure_permille", cache.pressure_permille.to_string()),
                ],
            );
        }
    }
    Ok(())
}

fn print_kv(format: OutputFormat, pairs: &[(&str, String)]) {
    match format {
        OutputFormat::Text => {
            for (k, v) in pairs {
                println!("{k}: {v}");
            }
        }
        OutputFormat::Json => {
            let body = pairs
                .iter()
                .map(|(k, v)| format!("\"{k}\":\"{}\"", v.replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(",");
            println!("{{{body}}}");
        }
    }
}
