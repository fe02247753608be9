use clap::Parser;
use log::{error, info};
use server::config::{ServerSettings, DEFAULT_CONFIG_PATH};
use server::network::RelayServer;
use shared::transport::udp::UdpTransport;
use shared::transport::TransportConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Baby Steps multiplayer relay server")]
struct Args {
    /// Settings file, created with defaults if missing
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// UDP port, overrides the settings file
    #[arg(short, long)]
    port: Option<u16>,

    /// Server ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut settings = match ServerSettings::load_or_create(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        settings.port = port;
    }

    let address = format!("{}:{}", args.host, settings.port);
    let transport = UdpTransport::bind(&address, TransportConfig::default()).await?;

    if settings.has_password() {
        info!("Server started on UDP {} with a password", transport.local_addr());
    } else {
        info!("Server started on UDP {} with no password", transport.local_addr());
    }
    if !settings.voice_chat_enabled {
        info!("Voice chat is disabled");
    }

    let mut relay = RelayServer::new(transport, settings, args.tick_rate);
    relay
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
