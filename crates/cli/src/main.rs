use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use relay_config::RelayConfig;

#[derive(Parser)]
#[command(name = "relay", about = "relay: WebSocket tool-call broker for AI providers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides BIND_HOST).
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on (overrides BIND_PORT).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Health snapshot file path (overrides HEALTH_FILE_PATH).
    #[arg(long, global = true)]
    health_file: Option<std::path::PathBuf>,

    /// Disable the Prometheus metrics endpoint.
    #[arg(long, global = true, default_value_t = false)]
    no_metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default when no subcommand is provided).
    Serve,
    /// Validate configuration and exit non-zero on errors.
    Doctor,
    /// Print the version.
    Version,
}

fn init_tracing(log_level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("relay={log_level},relay_gateway={log_level}")));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        let _ = registry.with(fmt::layer().json()).try_init();
    } else {
        let _ = registry.with(fmt::layer()).try_init();
    }
}

fn apply_overrides(config: &mut RelayConfig, cli: &Cli) {
    if let Some(bind) = &cli.bind {
        config.bind_host = bind.clone();
    }
    if let Some(port) = cli.port {
        config.bind_port = port;
    }
    if let Some(path) = &cli.health_file {
        config.health_file_path = Some(path.clone());
    }
}

fn doctor(config: &RelayConfig) -> i32 {
    let result = relay_config::validate(config);
    for d in &result.diagnostics {
        println!("{}: [{}] {}: {}", d.severity, d.category, d.path, d.message);
    }
    if result.has_errors() {
        eprintln!(
            "{} error(s), {} warning(s)",
            result.count(relay_config::Severity::Error),
            result.count(relay_config::Severity::Warning),
        );
        1
    } else {
        println!("configuration ok");
        0
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = RelayConfig::from_env();
    apply_overrides(&mut config, &cli);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Version => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        },
        Commands::Doctor => {
            std::process::exit(doctor(&config));
        },
        Commands::Serve => {
            let metrics = if cli.no_metrics {
                None
            } else {
                Some(relay_metrics::init_metrics(
                    relay_metrics::MetricsRecorderConfig {
                        enabled: true,
                        global_labels: Vec::new(),
                    },
                )?)
            };
            info!(
                bind = %format!("{}:{}", config.bind_host, config.bind_port),
                "starting relay daemon"
            );
            relay_gateway::serve(config, metrics).await
        },
    }
}
