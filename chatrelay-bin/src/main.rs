mod logger;

use std::path::PathBuf;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chatrelay_core::{
    config::Config,
    emitter::ChunkSink,
    error::{CoreResult, RelayError},
    handler, normalizer, server,
    model::StreamOutcome,
    upstream::UpstreamClient,
};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about = "Streaming chat relay for OpenAI-compatible APIs", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "chatrelay_core=debug,info". Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Listen address, overriding `server.bind`.
    #[arg(long, global = true)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP relay (default)
    Serve,
    /// Stream one prompt through the upstream and print fragments as they arrive
    Probe {
        #[arg(short, long, help = "Prompt text")]
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logger::init(cli.log_level.as_deref())?;

    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        cfg.server.bind = bind;
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if let Err(e) = cfg.upstream.resolve() {
                // Requests will get a diagnostic until this is fixed.
                warn!(error = %e, "upstream credentials not available yet");
            }
            server::serve(cfg, shutdown).await?;
        }
        Commands::Probe { prompt } => {
            let prompt = normalizer::clean_prompt(&prompt);
            if prompt.is_empty() {
                return Err(RelayError::EmptyPrompt.into());
            }
            let upstream = UpstreamClient::from_config(&cfg)?;
            let request_id = uuid::Uuid::new_v4().to_string();
            let mut sink = StdoutSink(tokio::io::stdout());
            let outcome =
                handler::relay(&upstream, &cfg, &prompt, &mut sink, shutdown, &request_id).await;
            sink.write(b"\n").await?;
            sink.flush().await?;
            if outcome != StreamOutcome::Delivered {
                bail!("stream ended: {}", outcome.as_str());
            }
        }
    }
    Ok(())
}

/// Writes fragments straight to the terminal.
struct StdoutSink(tokio::io::Stdout);

#[async_trait]
impl ChunkSink for StdoutSink {
    async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.0.write_all(bytes).await.map_err(RelayError::from)
    }

    async fn flush(&mut self) -> CoreResult<()> {
        self.0.flush().await.map_err(RelayError::from)
    }
}
