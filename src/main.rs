use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use polyvox::app::run_stream_command;
use polyvox::cli::{Cli, Commands, ConfigAction};
use polyvox::config::Config;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);
    tracing::debug!(version = %polyvox::version_string(), "starting");

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config.as_deref())?;
            if let Err(e) = run_stream_command(config, args, cli.quiet).await {
                eprintln!("{}", format!("Error: {e}").red());
                std::process::exit(1);
            }
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "polyvox",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Install the log subscriber.
///
/// `POLYVOX_LOG` wins over `RUST_LOG`; without either the level follows
/// the verbosity flags (`-q`: errors, default: warnings, `-v`: debug,
/// `-vv`: trace).
fn init_tracing(quiet: bool, verbosity: u8) {
    let level = match (quiet, verbosity) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "polyvox=debug,warn",
        (false, _) => "polyvox=trace,info",
    };
    let filter = EnvFilter::try_from_env("POLYVOX_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/polyvox/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        },
    };

    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Dump => {
            print!("{}", Config::default().to_toml()?);
        }
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(Path::to_path_buf)
                .or_else(Config::default_path)
                .context("no configuration directory on this platform")?;
            let note = if path.exists() { "" } else { " (not found)" };
            println!("{}{}", path.display(), note.dimmed());
        }
    }
    Ok(())
}
