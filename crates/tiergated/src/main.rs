//! tiergated — SSH gateway in front of the Nomad tiers.
//!
//! Operators connect with their SSH key and run one command per
//! connection; there is no interactive shell.
//!
//! # Usage
//!
//! ```text
//! tiergated serve --config /etc/tiergate/tiergate.toml
//! tiergated check --config /etc/tiergate/tiergate.toml
//! ```

mod check;
mod reload;
mod serve;
mod ssh;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tiergated", about = "SSH gateway for Nomad tiers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept SSH connections and dispatch their commands.
    Serve {
        /// Configuration file.
        #[arg(long, default_value = "/etc/tiergate/tiergate.toml")]
        config: PathBuf,

        /// Log line format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Validate the configuration and print what it grants.
    Check {
        /// Configuration file.
        #[arg(long, default_value = "/etc/tiergate/tiergate.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tiergated=debug,tiergate=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_format } => {
            init_tracing(log_format);
            serve::run(config).await
        }
        Command::Check { config } => {
            let summary = check::summarize(&config)?;
            print!("{summary}");
            Ok(())
        }
    }
}
