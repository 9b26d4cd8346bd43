mod backend;
mod config;
mod convert;
mod error;
mod protocol;
mod proxy;
mod search;
mod server_tools;
mod stream;
mod tokens;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

/// Serve the Anthropic Messages API on top of an OpenAI-compatible backend.
#[derive(Parser, Debug)]
#[command(name = "messages-bridge", version, about)]
struct Cli {
    /// Config file (default: <config dir>/messages-bridge/config.toml)
    #[arg(short, long, env = "MESSAGES_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Chat-completions base URL, e.g. http://localhost:8000/v1
    #[arg(long)]
    backend_url: Option<String>,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "messages_bridge=trace")
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = self.backend_url {
            settings.backend.base_url = url;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);
    settings.validate()?;

    init_tracing(&settings.logging.level);
    proxy::start_server(&settings).await
}
