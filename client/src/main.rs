use clap::Parser;
use client::host::ClientHost;
use client::input::HELP;
use client::network::ClientTransport;
use log::info;
use session::SessionConfig;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Master address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:9530")]
    server: String,

    /// Player name shown to the others
    #[arg(short, long, default_value = "Player")]
    name: String,

    /// Craft model to race with
    #[arg(short, long, default_value = "0")]
    craft: u8,

    /// Id of a previous session slot, to reclaim it after a disconnect
    #[arg(long)]
    rejoin: Option<u32>,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = SessionConfig::client();
    config.player_name = args.name;
    config.craft_model = args.craft;
    config.minor_id = args.rejoin;

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    info!("Commands: {}", HELP);

    let tick_duration = Duration::from_millis(1000 / u64::from(args.tick_rate.max(1)));
    let transport = ClientTransport::connect(&args.server).await?;
    let mut client = ClientHost::new(config, transport, tick_duration)?;

    client.run().await?;

    Ok(())
}
