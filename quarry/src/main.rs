//! Quarry CLI.
//!
//! Embedding glue around the interpreter: load a script, build a client
//! from an optional TOML settings file, run, print the final value.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quarry_client::{Client, Settings, SettingsOverlay};
use quarry_script::{Env, Interpreter, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// HTTP fetch-and-extract pipelines with an English-like DSL
#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline script
    Run {
        /// Path to the script file
        script: PathBuf,

        /// TOML file overlaying the default client settings
        #[arg(long)]
        settings: Option<PathBuf>,

        /// KEY=VALUE pairs exposed to the script as global string values
        #[arg(long = "define", value_name = "KEY=VALUE")]
        defines: Vec<String>,
    },

    /// Parse a script and report errors without running it
    Check {
        /// Path to the script file
        script: PathBuf,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    match cli.command {
        Commands::Run {
            script,
            settings,
            defines,
        } => {
            let source = read_script(&script)?;
            let settings = load_settings(settings.as_deref())?;
            let mut global = Env::new();
            for define in &defines {
                let (key, value) = define
                    .split_once('=')
                    .with_context(|| format!("malformed define '{define}', expected KEY=VALUE"))?;
                global.insert(key.to_string(), Value::Str(value.to_string()));
            }

            let interpreter = Interpreter::new(Client::new(settings));
            let result = interpreter.run(&source, global, Env::new()).await;
            interpreter.close().await;
            match result {
                Ok(value) => {
                    println!("{value}");
                    Ok(())
                }
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Check { script } => {
            let source = read_script(&script)?;
            match quarry_script::parse(&source) {
                Ok(program) => {
                    println!("ok: {} statement(s)", program.statements.len());
                    Ok(())
                }
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("quarry {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("cannot read script {}", path.display()))
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read settings {}", path.display()))?;
    let overlay: SettingsOverlay = toml::from_str(&text)
        .with_context(|| format!("invalid settings {}", path.display()))?;
    Ok(Settings::default().overlay(overlay))
}
