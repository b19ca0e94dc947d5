//! `temdb-integrity` operator binary

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use temdb_integrity::logging::{init_tracing, LogFormat};
use temdb_integrity::simulation::{run_allocation_simulation, run_scenario, SimulationConfig};
use temdb_integrity::{IntegrityConfig, IntegrityEngine};
use temdb_store::MemoryStore;

fn cli() -> Command {
    Command::new("temdb-integrity")
        .version(temdb_integrity::VERSION)
        .about("Reference-integrity engine for TEM imaging records")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Race concurrent writers allocating under one scope")
                .arg(
                    Arg::new("writers")
                        .long("writers")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Number of concurrent writers"),
                )
                .arg(
                    Arg::new("allocations")
                        .long("allocations")
                        .default_value("100")
                        .value_parser(value_parser!(usize))
                        .help("Allocations per writer"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("scenario")
                .about("Run the end-to-end pipeline scenario")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Load and validate a configuration file")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<IntegrityConfig> {
    match path {
        Some(path) => IntegrityConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(IntegrityConfig::default()),
    }
}

fn memory_engine(config: IntegrityConfig) -> anyhow::Result<IntegrityEngine> {
    IntegrityEngine::new(Arc::new(MemoryStore::new()), config).context("building engine")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let format = if matches.get_flag("log-json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format, "info").context("installing tracing subscriber")?;

    let config = load_config(matches.get_one::<PathBuf>("config"))?;

    let passed = match matches.subcommand() {
        Some(("simulate", args)) => {
            let sim = SimulationConfig {
                writers: args.get_one::<usize>("writers").copied().unwrap_or(8),
                allocations: args.get_one::<usize>("allocations").copied().unwrap_or(100),
            };
            let engine = memory_engine(config)?;
            let report = run_allocation_simulation(&engine, sim).await?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }
            report.passed()
        }
        Some(("scenario", args)) => {
            let engine = memory_engine(config)?;
            let report = run_scenario(&engine).await?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }
            report.passed()
        }
        Some(("check-config", args)) => {
            let path = args
                .get_one::<PathBuf>("path")
                .context("missing configuration path")?;
            let loaded = IntegrityConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            println!("{}", loaded.to_toml_string()?);
            true
        }
        _ => unreachable!("subcommand_required"),
    };

    std::process::exit(if passed { 0 } else { 1 });
}
