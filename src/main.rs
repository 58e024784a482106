use anyhow::{Context, Result};
use clap::Parser;
use dfstream::app::{run_config_command, run_denoise};
use dfstream::cli::{Cli, Commands};
use dfstream::config::Config;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);
    tracing::debug!(version = %dfstream::version_string(), "dfstream starting");

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Denoise(args) => {
            let report = run_denoise(config, &args)
                .with_context(|| format!("denoising {}", args.input.display()))?;
            if !cli.quiet {
                let stats = report.stats;
                eprintln!(
                    "{} → {}: {} frames ({} padded, {} dropped), {:.1}x realtime",
                    args.input.display(),
                    args.output.display(),
                    stats.frames_processed,
                    stats.frames_padded,
                    stats.frames_dropped,
                    report.realtime_factor(),
                );
                if stats.listener_errors > 0 {
                    eprintln!("{} listener errors, output may be incomplete", stats.listener_errors);
                }
                if !report.drained {
                    eprintln!("Drain timed out, output may be truncated");
                }
            }
        }
        Commands::Config { path } => {
            println!("{}", run_config_command(&config, path)?);
        }
    }

    Ok(())
}

/// Route `tracing` to stderr.
///
/// `RUST_LOG` wins when set; otherwise `-q`/`-v` pick the level.
fn init_tracing(quiet: bool, verbose: u8) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dfstream={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/dfstream/config.toml)
/// 3. Built-in defaults
///
/// Environment variable overrides apply on top of all three.
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config.with_env_overrides())
}
