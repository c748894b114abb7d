use anyhow::Result;
use clap::{Parser, Subcommand};
use feishu_taskbot::bridge::GatewayBridge;
use feishu_taskbot::config::Config;
use feishu_taskbot::gateway;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Feishu webhook bot routing chat tasks to an AI backend or an agent gateway.
#[derive(Parser, Debug)]
#[command(name = "feishu-taskbot", version, about)]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(long, global = true, env = "FEISHU_BOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the webhook server (default).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Start even when required settings are missing.
        #[arg(long)]
        allow_incomplete: bool,
    },
    /// Validate configuration and exit non-zero on problems.
    CheckConfig,
    /// Run the agent gateway health check and print the result.
    ProbeGateway,
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_ascii_lowercase()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, load_warnings) = Config::load(cli.config.as_deref())?;
    init_tracing(&config.server.log_level);
    for warning in &load_warnings {
        tracing::warn!("{warning}");
    }

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
        allow_incomplete: false,
    }) {
        Command::Serve {
            host,
            port,
            allow_incomplete,
        } => {
            let problems = config.validate();
            for problem in &problems {
                tracing::warn!("Config: {problem}");
            }
            if !problems.is_empty() && !allow_incomplete {
                anyhow::bail!(
                    "configuration incomplete ({} problem(s)); fix them or pass --allow-incomplete",
                    problems.len()
                );
            }
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            gateway::run_gateway(&host, port, config).await
        }
        Command::CheckConfig => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("✅ Configuration OK");
                return Ok(());
            }
            println!("❌ Configuration has {} problem(s):", problems.len());
            for problem in &problems {
                println!("  - {problem}");
            }
            std::process::exit(1);
        }
        Command::ProbeGateway => {
            let bridge = GatewayBridge::new(&config.agent_gateway);
            let report = bridge.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
