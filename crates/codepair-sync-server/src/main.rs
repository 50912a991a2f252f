use clap::Parser;
use codepair_common::telemetry::{self, TelemetryConfig};
use codepair_sync_server::{AppState, Config, Relay};
use dotenvy::dotenv;
use miette::miette;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "CODEPAIR_SYNC_CONFIG",
        default_value = "codepair-sync.toml"
    )]
    config: String,

    /// Override the listen address from the config file.
    #[arg(short, long, env = "CODEPAIR_SYNC_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let config = initialize()?;
    let state = AppState::new(Relay::new(), &config.server);
    codepair_sync_server::run(state, &config.server).await?;
    Ok(())
}

fn initialize() -> miette::Result<Config> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))
    .map_err(|e| miette!("Failed to set miette hook: {}", e))?;
    miette::set_panic_hook();
    dotenv().ok();
    telemetry::init(TelemetryConfig::from_env("codepair-sync-server"));

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    Ok(config)
}
