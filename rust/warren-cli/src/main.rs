//! Warren node launcher.
//!
//! Reads a TOML configuration, installs the built-in service modules,
//! and runs the node until the last service retires.

mod echo;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use warren_runtime::{run, Config, LoggerModule, ModuleRegistry};

#[derive(Parser)]
#[command(
    name = "warren",
    version,
    about = "A lightweight concurrent service runtime",
    long_about = "Warren hosts thousands of message-driven services in one process.\n\
                  Point it at a TOML config naming a bootstrap service to run."
)]
struct Args {
    /// Path to the TOML configuration file. Without one, a default node
    /// (stdout logger, no bootstrap) is started.
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, String> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("can't read {}: {}", path.display(), e))?;
            toml::from_str(&text).map_err(|e| format!("bad config {}: {}", path.display(), e))
        }
        None => Ok(Config::default()),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("warren: {err}");
            return ExitCode::FAILURE;
        }
    };

    let modules = ModuleRegistry::new();
    modules.install("logger", Arc::new(LoggerModule));
    modules.install("echo", Arc::new(echo::EchoModule));

    match run(config, modules) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("warren: {err}");
            ExitCode::FAILURE
        }
    }
}
