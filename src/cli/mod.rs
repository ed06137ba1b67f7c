//! Command-line interface for mongo-s3-export
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and overrides
//! - Subcommand dispatch (server, one-shot export, configuration)

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, LogLevel};
use crate::connection::ConnectionManager;
use crate::error::{ConfigError, ExportError, Result};
use crate::export::{
    ExportCoordinator, ExportOutcome, ExportRequest, ExportSettings, ProgressTracker,
    event_channel,
};
use crate::server::{self, AppState};

/// Stream MongoDB exports and GridFS binaries into S3
#[derive(Parser, Debug)]
#[command(
    name = "mongo-s3-export",
    version,
    about = "Stream MongoDB exports and GridFS binaries into S3",
    long_about = "Exports the result of a MongoDB query or aggregation as JSON Lines into an
S3 bucket, relaying the GridFS files referenced by each record alongside it."
)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Quiet mode (errors only, no summary)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Very verbose mode (debug logging)
    #[arg(long = "vv", global = true)]
    pub very_verbose: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for mongo-s3-export
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to listen on, overrides server.bind
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Run one export from a request file
    Run {
        /// Export request as JSON
        #[arg(short = 'r', long, value_name = "FILE")]
        request: PathBuf,

        /// Disable the progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Validate configuration file
        #[arg(long)]
        validate: bool,
    },

    /// Show version information
    Version,
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded configuration
    config: Config,
}

impl CliInterface {
    /// Create a new CLI interface from the process arguments
    pub fn new() -> Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    /// Create a CLI interface from already parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let mut config = Config::load(args.config_file.as_deref())?;
        Self::apply_args_to_config(&mut config, &args);
        Ok(Self { args, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    /// Apply CLI arguments to configuration
    fn apply_args_to_config(config: &mut Config, args: &CliArgs) {
        config.logging.level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else if args.quiet {
            LogLevel::Error
        } else {
            config.logging.level
        };

        if let Commands::Serve {
            bind: Some(bind), ..
        } = &args.command
        {
            config.server.bind = bind.clone();
        }
    }

    /// Dispatch the selected subcommand
    pub async fn execute(&self) -> Result<()> {
        match &self.args.command {
            Commands::Serve { .. } => {
                self.config.validate()?;
                self.serve().await
            }
            Commands::Run {
                request,
                no_progress,
            } => {
                self.config.validate()?;
                self.run_export(request, !no_progress && !self.args.quiet)
                    .await
            }
            Commands::Config { show, validate } => self.handle_config_command(*show, *validate),
            Commands::Version => {
                println!("mongo-s3-export version {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }

    /// Connect to both stores and serve until shutdown
    async fn serve(&self) -> Result<()> {
        let mut manager = ConnectionManager::new(self.config.clone());
        manager.connect().await?;

        let coordinator = ExportCoordinator::new(
            manager.resources(),
            ExportSettings::from_config(&self.config)?,
        );
        let state = AppState::new(
            coordinator,
            Duration::from_secs(self.config.server.keep_alive_secs),
        );
        server::serve(&self.config.server, state).await
    }

    /// Run one export with console progress
    ///
    /// Ctrl+C cancels the export between records. A fatal outcome is
    /// returned as an error so the process exits non-zero.
    async fn run_export(&self, request_path: &Path, show_progress: bool) -> Result<()> {
        let request = load_request(request_path)?;

        let mut manager = ConnectionManager::new(self.config.clone());
        manager.connect().await?;
        let coordinator = ExportCoordinator::new(
            manager.resources(),
            ExportSettings::from_config(&self.config)?,
        );

        let cancel_token = CancellationToken::new();
        let prepared = coordinator
            .prepare(request)
            .await?
            .with_cancellation(cancel_token.clone());

        let ctrl_c_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => cancel_token.cancel(),
                Err(err) => warn!(error = %err, "Failed to listen for Ctrl+C"),
            }
        });

        let (tx, rx) = event_channel();
        let tracker = tokio::spawn(ProgressTracker::new(show_progress).consume(rx));
        let outcome = prepared.execute(tx).await;
        ctrl_c_handle.abort();

        match tracker.await {
            Ok(summary) => debug!(
                records = summary.records,
                binaries = summary.binaries,
                failures = summary.failures,
                "Progress tracker finished"
            ),
            Err(e) => warn!(error = %e, "Progress tracker failed"),
        }

        if !self.args.quiet {
            print_outcome(&outcome);
        }

        match outcome.fatal {
            Some(reason) => Err(ExportError::Generic(format!("export aborted: {reason}"))),
            None => Ok(()),
        }
    }

    /// Handle config subcommand
    fn handle_config_command(&self, show: bool, validate: bool) -> Result<()> {
        if validate {
            let path = self.get_config_path();
            println!("Validating configuration file: {}", path.display());
            match self.config.validate() {
                Ok(()) => println!("Configuration is valid"),
                Err(e) => println!("Configuration validation failed: {}", e),
            }
        }

        if show {
            println!("Configuration file: {}", self.get_config_path().display());
            println!();
            println!("{}", self.config.to_toml()?);
        }

        Ok(())
    }

    /// Get configuration file path (from args or default)
    fn get_config_path(&self) -> PathBuf {
        self.args
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path)
    }
}

/// Read and validate an export request file
pub fn load_request(path: &Path) -> Result<ExportRequest> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
    let request = ExportRequest::from_json(&text)?;
    request.validate()?;
    Ok(request)
}

fn print_outcome(outcome: &ExportOutcome) {
    if let Some(key) = &outcome.record_key {
        println!(
            "Exported {} records to {} ({} bytes)",
            outcome.records, key, outcome.record_bytes
        );
    }
    if outcome.binaries > 0 || outcome.failure_events() > 0 {
        println!("Relayed {} binaries", outcome.binaries);
    }
    for key in &outcome.not_found {
        println!("  not found: {}", key);
    }
    for failure in &outcome.failures {
        println!("  failed: {} ({})", failure.key, failure.reason);
    }
    println!("Finished in {:.1}s", outcome.elapsed_ms as f64 / 1000.0);
}
