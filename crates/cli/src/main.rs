mod bot_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "botlink", about = "botlink: chat bot worker relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (botlink.toml / .yaml / .json). Discovered when omitted.
    #[arg(long, global = true, env = "BOTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Serve {
        #[arg(long, env = "BOTLINK_BIND")]
        bind: Option<String>,
        #[arg(long, env = "BOTLINK_PORT")]
        port: Option<u16>,
    },
    /// Bot identity management.
    Bots {
        #[command(subcommand)]
        action: bot_commands::BotAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Write a default config file.
    Init {
        /// Target path; defaults to ~/.config/botlink/botlink.toml.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = botlink_config::discover_and_load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind, port } => {
            info!(version = env!("CARGO_PKG_VERSION"), "botlink starting");
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            botlink_gateway::start_gateway(config).await
        },
        Commands::Bots { action } => bot_commands::handle_bots(action, &config.storage).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                if config.server.admin_token.is_some() {
                    config.server.admin_token = Some("[REDACTED]".into());
                }
                print!("{}", botlink_config::render_config(&config)?);
                Ok(())
            },
            ConfigAction::Init { path } => {
                let written = botlink_config::write_default_config(
                    &botlink_config::BotlinkConfig::default(),
                    path.as_deref(),
                )?;
                println!("Wrote {}", written.display());
                Ok(())
            },
        },
    }
}
