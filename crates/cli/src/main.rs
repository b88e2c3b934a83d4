use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_config::{effective_state_with_default, DirProfiles, EngineSettings};
use keel_core::DesiredState;
use keel_merge::{diff_summary, merge_overrides, parse_document};
use keel_persist::{SqliteStore, Store};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective resource: profiles layered under the given resource
    Effective {
        /// Desired-state resource (YAML or JSON)
        cr: PathBuf,
        /// Profile directory (default: KEEL_PROFILE_DIR or ./profiles)
        #[arg(long = "profiles")]
        profiles: Option<PathBuf>,
    },
    /// Merge a baseline with previously-applied values and override documents
    Merge {
        /// Baseline document
        base: PathBuf,
        /// Previously-applied (live) values
        #[arg(long = "live")]
        live: Option<PathBuf>,
        /// Override documents, lowest precedence first
        overrides: Vec<PathBuf>,
    },
    /// Show recorded applied values for a component, newest first
    History {
        component: String,
        #[arg(long = "limit", default_value_t = keel_persist::HISTORY_DEPTH)]
        limit: usize,
        /// Print the values of each row, not only the summary
        #[arg(long = "values")]
        values: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(settings: &EngineSettings) {
    let Some(addr) = settings.metrics_addr.as_deref() else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port"),
    }
}

fn read_doc(path: &Path) -> Result<Json> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_document(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn print_doc<T: Serialize>(output: Output, v: &T) -> Result<()> {
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(v)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(v)?),
    }
    Ok(())
}

fn render_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let settings = EngineSettings::from_env();
    init_metrics(&settings);
    let cli = Cli::parse();

    match cli.command {
        Commands::Effective { cr, profiles } => {
            let t0 = Instant::now();
            let desired: DesiredState = serde_json::from_value(read_doc(&cr)?)
                .with_context(|| format!("decoding resource {}", cr.display()))?;
            let store = DirProfiles::new(profiles.unwrap_or_else(|| settings.profile_dir.clone()));
            info!(resource = %desired.metadata.name, profile_dir = %store.dir().display(), "effective invoked");
            let effective = effective_state_with_default(&desired, &store, &settings.merge_options(), &settings.default_profile)?;
            info!(took_ms = %t0.elapsed().as_millis(), "effective state computed");
            print_doc(cli.output, effective.resource())?;
        }
        Commands::Merge { base, live, overrides } => {
            let baseline = read_doc(&base)?;
            let live = live.as_deref().map(read_doc).transpose()?;
            let docs = overrides.iter().map(|p| read_doc(p)).collect::<Result<Vec<_>>>()?;
            info!(overrides = docs.len(), live = live.is_some(), "merge invoked");
            let merged = merge_overrides(&baseline, live.as_ref(), &docs, &settings.merge_options())?;
            let diff = diff_summary(&merged, live.as_ref().unwrap_or(&baseline));
            match cli.output {
                Output::Human => {
                    print!("{}", serde_yaml::to_string(&merged)?);
                    eprintln!("changes: +{} ~{} -{}", diff.adds, diff.updates, diff.removes);
                }
                Output::Json => {
                    #[derive(Serialize)]
                    struct Merged<'a> { merged: &'a Json, diff: &'a keel_merge::DiffSummary }
                    println!("{}", serde_json::to_string_pretty(&Merged { merged: &merged, diff: &diff })?);
                }
            }
        }
        Commands::History { component, limit, values } => {
            let store = match settings.db_path.as_deref() {
                Some(path) => SqliteStore::open(path)?,
                None => SqliteStore::open_default()?,
            };
            let rows = store.get_last(&component, Some(limit))?;
            info!(component = %component, rows = rows.len(), "history invoked");
            match cli.output {
                Output::Human => {
                    if rows.is_empty() {
                        eprintln!("no applied values recorded for {}", component);
                    }
                    println!("GENERATION  APPLIED                 SIZE");
                    for row in &rows {
                        println!("{:<11} {:<23} {}", row.generation, render_ts(row.ts), row.values_zstd.len());
                        if values {
                            print!("{}", serde_yaml::to_string(&row.values()?)?);
                        }
                    }
                }
                Output::Json => {
                    #[derive(Serialize)]
                    struct Row { generation: i64, ts: i64, values: Json }
                    let out = rows
                        .iter()
                        .map(|r| Ok(Row { generation: r.generation, ts: r.ts, values: r.values()? }))
                        .collect::<Result<Vec<_>>>()?;
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
    }
    Ok(())
}
