use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use marionette_client::config::{ConfigLoadError, MarionetteConfig};
use marionette_conditions::persist;
use marionette_conditions::script::Compiler;
use marionette_conditions::NamedCondition;
use marionette_events::EventBus;
use marionette_runner::logging::init_logging;
use marionette_runner::{replay, run_consumer, run_simulation, LoggingConsumer, SimulationOptions};

#[derive(Parser)]
#[command(name = "marionette", version = env!("VERSION_STRING"), about = "Condition automation for game clients")]
pub struct Cli {
    /// Enables debug output; repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Config file to use instead of the default location
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile condition files or directories and report errors
    Check {
        paths: Vec<PathBuf>,
    },
    /// List the conditions of a directory with their control numbers
    List {
        dir: PathBuf,
    },
    /// Replay a packet log through an agent's conditions against a simulated client
    Run {
        /// Agent whose configuration and conditions to use
        #[arg(short, long, default_value = "default")]
        agent: String,

        /// Condition directory, overriding the agent's
        #[arg(long)]
        conditions: Option<PathBuf>,

        /// Packet log with `recv`, `send` and `wait` lines
        replay: PathBuf,

        /// Milliseconds conditions may keep running after the last step
        #[arg(long, default_value = "1000")]
        settle_ms: u64,
    },
    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the config file location
    Path,
    /// Print the effective configuration
    Show,
    /// Write an example config file if none exists
    Init,
}

const EXAMPLE_CONFIG: &str = r#"# Marionette Configuration

[engine]
supervisor_tick_ms = 100
periodic_interval_scale = 0.02

[walk]
stride = 4
waypoint_timeout_ms = 3000
proximity = 2.0

[logging]
file = false

[agents.default]
# conditions_dir = "/path/to/conditions"
# leader_id = 12345
# subgroup_index = 1
"#;

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(MarionetteConfig::config_path)
}

fn load_config(path: &Path) -> Result<MarionetteConfig> {
    match MarionetteConfig::load_from(path) {
        Ok(config) => Ok(config),
        Err(ConfigLoadError::NotFound) => Ok(MarionetteConfig::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn read_conditions(path: &Path) -> Result<Vec<(PathBuf, Result<NamedCondition, String>)>> {
    if path.is_dir() {
        let files = persist::read_dir(path)?;
        return Ok(files
            .into_iter()
            .map(|file| match file {
                Ok(named) => (path.join(format!("{}.{}", named.name, persist::CONDITION_EXTENSION)), Ok(named)),
                Err(e) => (path.to_path_buf(), Err(e.to_string())),
            })
            .collect());
    }
    let named = persist::read_file(path).map_err(|e| e.to_string());
    Ok(vec![(path.to_path_buf(), named)])
}

fn check(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        bail!("nothing to check");
    }
    let compiler = Compiler::new();
    let mut failures = 0;
    for path in paths {
        for (file, named) in read_conditions(path)? {
            let result = named.and_then(|named| {
                compiler
                    .compile(&named.file.source, named.file.kind.into())
                    .map(|unit| (named, unit.suspension_points()))
                    .map_err(|e| e.to_string())
            });
            match result {
                Ok((named, suspensions)) => println!(
                    "ok    {} ({}, {} suspension point(s))",
                    named.name, named.file.kind, suspensions
                ),
                Err(message) => {
                    failures += 1;
                    println!("error {}: {}", file.display(), message);
                }
            }
        }
    }
    if failures > 0 {
        bail!("{} condition file(s) failed", failures);
    }
    Ok(())
}

fn list(dir: &Path) -> Result<()> {
    let mut number = 0;
    for file in persist::read_dir(dir)? {
        match file {
            Ok(named) => {
                number += 1;
                println!(
                    "{:>3}  [{}] {:<12} {}",
                    number,
                    if named.file.active { "x" } else { " " },
                    named.file.kind.tag(),
                    named.name
                );
            }
            Err(e) => eprintln!("skipped: {}", e),
        }
    }
    Ok(())
}

async fn run(config: MarionetteConfig, agent: String, conditions: Option<PathBuf>, replay_path: &Path, settle_ms: u64) -> Result<()> {
    let steps = replay::load(replay_path)?;
    let (bus, rx) = EventBus::new(256);
    let consumer = tokio::spawn(run_consumer(rx, Box::new(LoggingConsumer::new())));

    let report = run_simulation(
        SimulationOptions {
            agent,
            config,
            conditions_dir: conditions,
            replay: steps,
            settle: Duration::from_millis(settle_ms),
        },
        bus.create_sender(1),
    )
    .await?;

    drop(bus);
    let _ = tokio::time::timeout(Duration::from_secs(1), consumer).await;

    println!("loaded {} condition(s), {} remaining", report.loaded, report.remaining);
    for action in &report.actions {
        println!("{:?}", action);
    }
    Ok(())
}

fn config_command(path: &Path, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Show => {
            let config = load_config(path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Init => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, EXAMPLE_CONFIG)?;
            info!("Created example config at {}", path.display());
            eprintln!("Config file created at: {}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config_path(&cli);
    let config = load_config(&path)?;

    let filter = match cli.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _guard = init_logging("cli", config.logging.file, filter)?;

    match &cli.command {
        Command::Check { paths } => check(paths),
        Command::List { dir } => list(dir),
        Command::Run {
            agent,
            conditions,
            replay,
            settle_ms,
        } => run(config, agent.clone(), conditions.clone(), replay, *settle_ms).await,
        Command::Config { action } => config_command(&path, action),
    }
}
