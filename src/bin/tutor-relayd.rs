use clap::Parser;
use tutor_relay::config::{Config, ServerConfig};
use tutor_relay::daemon;
use tutor_relay::error::Result;

#[derive(Parser, Debug)]
#[command(name = "tutor-relayd")]
#[command(about = "Role-aware chat streaming relay")]
struct Cli {
    /// Overrides `server.host` from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Overrides `server.port` from the config file.
    #[arg(long)]
    port: Option<u16>,

    #[arg(
        long,
        env = "TUTOR_RELAY_CONFIG",
        default_value_t = tutor_relay::runtime_paths::default_config_path()
    )]
    config: String,

    /// Write the default config to `--config` and exit.
    #[arg(long, default_value_t = false)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tutor_relay::logging::init_tracing("tutor_relayd");
    let cli = Cli::parse();

    if cli.init_config {
        Config::convention_defaults().save(&cli.config)?;
        println!("Wrote default config to {}", cli.config);
        return Ok(());
    }

    let mut config = Config::load_or_default(&cli.config)?.resolve_env();
    if cli.host.is_some() || cli.port.is_some() {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        if let Some(host) = cli.host {
            server.host = Some(host);
        }
        if let Some(port) = cli.port {
            server.port = Some(port);
        }
    }

    daemon::run(config).await
}
