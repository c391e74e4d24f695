mod auth_commands;
mod sessions_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "wagate", about = "wagate: multi-tenant WhatsApp session gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding `wagate.toml` (overrides discovery).
    #[arg(long, global = true, env = "WAGATE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Address to bind (overrides `server.bind`).
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect persisted sessions.
    Sessions {
        #[command(subcommand)]
        action: sessions_commands::SessionAction,
    },
    /// Credential helpers for the control plane.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
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

    if let Some(dir) = &cli.config_dir {
        wagate_config::set_config_dir(dir.clone());
    }

    match cli.command {
        Commands::Gateway { bind, port } => {
            info!(version = env!("CARGO_PKG_VERSION"), "wagate starting");
            let mut config = wagate_config::discover_and_load();
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            wagate_gateway::start_gateway(config).await
        },
        Commands::Sessions { action } => sessions_commands::handle_sessions(action).await,
        Commands::Auth { action } => auth_commands::handle_auth(action),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn gateway_overrides_parse() {
        let cli = Cli::parse_from(["wagate", "--json-logs", "gateway", "--port", "8080"]);
        assert!(cli.json_logs);
        match cli.command {
            Commands::Gateway { bind, port } => {
                assert_eq!(bind, None);
                assert_eq!(port, Some(8080));
            },
            _ => panic!("expected gateway command"),
        }
    }
}
