use clap::Parser;
use client::bot::{parse_color, Bot, BotConfig};
use log::info;
use shared::protocol::Rgb;
use shared::DEFAULT_PASSWORD;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:7777")]
    server: SocketAddr,

    /// Server password
    #[arg(short = 'P', long, default_value = DEFAULT_PASSWORD)]
    password: String,

    /// Display name
    #[arg(short = 'n', long, default_value = "Nate")]
    name: String,

    /// Avatar colour as r,g,b
    #[arg(short = 'c', long, default_value = "255,255,255", value_parser = parse_color)]
    color: Rgb,

    /// Chat line sent after joining
    #[arg(long)]
    chat: Option<String>,

    /// Seconds to stay connected, forever if omitted
    #[arg(short = 'd', long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("Connecting to {} as {} {}", args.server, args.name, args.color);

    let mut config = BotConfig::new(args.server);
    config.password = args.password;
    config.name = args.name;
    config.color = args.color;
    config.chat = args.chat;
    config.duration = args.duration.map(Duration::from_secs);

    let summary = Bot::connect(config).await?.run().await?;
    info!(
        "Sent {} poses, received {} messages, saw {} players",
        summary.poses_sent, summary.messages_received, summary.peers_seen
    );

    Ok(())
}
