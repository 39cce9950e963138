//! wardend — the dbwarden daemon.
//!
//! Serves the session dashboard API. Every dashboard user logs in with their
//! own database role; the daemon keeps one pool per role and closes it when
//! the user's session ends.
//!
//! # Usage
//!
//! ```text
//! wardend serve --config /etc/dbwarden/warden.toml --port 3000
//! wardend check-config --config warden.toml
//! ```

mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use warden_core::WardenConfig;

#[derive(Parser)]
#[command(name = "wardend", about = "dbwarden daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server.
    Serve {
        /// Path to warden.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (overrides the config file).
        #[arg(long)]
        listen: Option<String>,

        /// Default connection target, `host[:port][/database]` or a URL.
        #[arg(long)]
        target: Option<String>,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Print the effective configuration and exit.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wardend=debug,warden=debug"));
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
        Command::Serve {
            config,
            port,
            listen,
            target,
            log_format,
        } => {
            init_tracing(log_format);
            let mut config = WardenConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if target.is_some() {
                config.database.default_target = target;
            }
            config.validate()?;
            server::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = WardenConfig::load(config.as_deref())?;
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
