use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use nova_agents::{
    AnthropicProvider, DeliverReport, LlmProvider, MemoryRecall, OpenAiProvider, SqliteMemory,
    SqlitePersistence, TurnOutcome, TurnPipeline,
};
use nova_common::{InboundTurn, TurnHints};
use nova_config::{AppConfig, ConfigLoader, LlmProviderConfig};
use nova_gateway::GatewayServer;
use nova_security::{RedactingWriter, redact_secrets};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nova", version, about = "Nova - personal assistant turn pipeline")]
struct Cli {
    /// Config directory (defaults to ~/.nova).
    #[arg(long, global = true, env = "NOVA_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP / WebSocket gateway.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one message through the pipeline and print the reply.
    Ask {
        text: String,
        #[arg(long, default_value = "cli")]
        conversation: String,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long, default_value = "local")]
        user: String,
        /// Stream the reply from the provider.
        #[arg(long)]
        stream: bool,
        /// Print the full run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Store a user preference that is merged into every system prompt.
    Pref {
        key: String,
        value: String,
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Print the resolved configuration with secrets redacted.
    Config,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("failed to load configuration")?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let pipeline = Arc::new(build_pipeline(&config)?);
            log_provider_health(&pipeline).await;
            GatewayServer::new(config, pipeline)
                .run()
                .await
                .context("gateway failed")?;
        }
        Commands::Ask {
            text,
            conversation,
            session,
            user,
            stream,
            json,
        } => {
            let pipeline = build_pipeline(&config)?;
            let hints = TurnHints {
                stream: stream.then_some(true),
                ..TurnHints::default()
            };
            let inbound =
                InboundTurn::text(user.as_str(), conversation.as_str(), session.as_str(), text)
                    .with_hints(hints);
            match pipeline.process_turn(inbound).await? {
                TurnOutcome::Replied(summary) if json => {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                TurnOutcome::Replied(summary) => println!("{}", summary.reply),
                TurnOutcome::Duplicate { .. } => bail!("duplicate turn suppressed"),
            }
        }
        Commands::Pref { key, value, user } => {
            let memory = SqliteMemory::open(&transcript_db(&config)?)?;
            memory.set_preference(&user, &key, &value).await?;
            println!("{key} saved for {user}");
        }
        Commands::Config => {
            let rendered = serde_yaml::to_string(&redacted(config))?;
            print!("{rendered}");
        }
    }

    Ok(())
}

fn build_pipeline(config: &AppConfig) -> anyhow::Result<TurnPipeline> {
    let mut pipeline = TurnPipeline::new(config);

    let mut names: Vec<&String> = config.llm.keys().collect();
    names.sort();
    for name in names {
        let entry = &config.llm[name];
        match build_provider(name, entry) {
            Some(provider) => pipeline.register_provider(provider),
            None => warn!("skipping LLM provider '{}': no API key", name),
        }
    }
    if let Some(default) = &config.agent.default_provider
        && !pipeline.set_default_provider_id(default)
    {
        warn!("default provider '{}' is not configured", default);
    }

    let db_path = transcript_db(config)?;
    let persistence = Arc::new(
        SqlitePersistence::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?,
    );
    let memory = Arc::new(SqliteMemory::open(&db_path)?);
    info!("transcripts stored in {}", db_path.display());

    pipeline.register_tool(Arc::new(DeliverReport::new(
        pipeline.ledger(),
        persistence.clone(),
    )));
    pipeline.set_persistence(persistence);
    pipeline.set_memory(memory);

    Ok(pipeline)
}

/// Transcript database path, with its directory created.
fn transcript_db(config: &AppConfig) -> anyhow::Result<PathBuf> {
    let db_path = config.storage.transcript_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(db_path)
}

fn build_provider(name: &str, entry: &LlmProviderConfig) -> Option<Arc<dyn LlmProvider>> {
    let key = entry.resolve_api_key()?;
    let timeout = entry.timeout_secs.map(Duration::from_secs);

    let provider: Arc<dyn LlmProvider> = match entry.provider.as_str() {
        "anthropic" => {
            let mut p = AnthropicProvider::new(key).with_id(name);
            if let Some(model) = &entry.model {
                p = p.with_model(model);
            }
            if let Some(url) = &entry.base_url {
                p = p.with_base_url(url);
            }
            if let Some(t) = timeout {
                p = p.with_timeout(t);
            }
            Arc::new(p)
        }
        "openai" => {
            let mut p = OpenAiProvider::new(key, entry.base_url.clone()).with_id(name);
            if let Some(model) = &entry.model {
                p = p.with_model(model);
            }
            if let Some(t) = timeout {
                p = p.with_timeout(t);
            }
            Arc::new(p)
        }
        other => {
            warn!("unknown provider kind '{}' for '{}'", other, name);
            return None;
        }
    };
    Some(provider)
}

async fn log_provider_health(pipeline: &TurnPipeline) {
    for (id, healthy) in pipeline.health_check_all().await {
        if healthy {
            info!("provider {} healthy", id);
        } else {
            warn!("provider {} failed its health check", id);
        }
    }
}

fn redacted(mut config: AppConfig) -> AppConfig {
    for entry in config.llm.values_mut() {
        if let Some(key) = entry.api_key.as_mut() {
            *key = "[REDACTED]".to_string();
        }
        if let Some(url) = entry.base_url.as_mut() {
            *url = redact_secrets(url);
        }
    }
    config
}
