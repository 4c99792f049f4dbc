mod channel_commands;

use std::path::PathBuf;

use {
    clap::Parser,
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use channel_commands::ChannelAction;

#[derive(Parser)]
#[command(name = "napgate", about = "napgate: QQ channel over NapCat (OneBot v11)")]
struct Cli {
    #[command(subcommand)]
    command: ChannelAction,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (defaults to ./napgate.* or ~/.config/napgate/napgate.*).
    #[arg(long, global = true, env = "NAPGATE_CONFIG")]
    config: Option<PathBuf>,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
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

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(napgate_config::find_or_default_config_path);
    debug!(path = %config_path.display(), "using config file");

    channel_commands::handle_channels(cli.command, &config_path).await
}
