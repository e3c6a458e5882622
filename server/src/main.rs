use clap::Parser;
use log::info;
use rand::Rng;
use server::host::MasterHost;
use server::network::UdpTransport;
use session::{GameOptions, RaceRules, SessionConfig};
use shared::{DEFAULT_LAPS, DEFAULT_PORT, MAX_CLIENTS};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of remote players
    #[arg(short = 'c', long, default_value_t = MAX_CLIENTS)]
    max_clients: usize,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Laps per race
    #[arg(short, long, default_value_t = DEFAULT_LAPS)]
    laps: u8,

    /// Track to race on
    #[arg(long, default_value = "ClassicH")]
    track: String,

    /// Name of the master's own player
    #[arg(short, long, default_value = "Host")]
    name: String,

    /// Minimum milliseconds between two state updates of one vehicle
    #[arg(long, default_value = "100")]
    state_interval: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut rng = rand::thread_rng();
    let mut config = SessionConfig::master(rng.gen(), rng.gen());
    config.player_name = args.name;
    config.max_clients = args.max_clients;
    config.state_min_interval_ms = args.state_interval;
    config.rules = RaceRules::new(&args.track, args.laps, GameOptions::all());

    let tick_duration = Duration::from_millis(1000 / u64::from(args.tick_rate.max(1)));
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting master on {}", address);
    info!("Race: {}", config.rules.describe());

    let transport = UdpTransport::bind(&address).await?;
    let mut host = MasterHost::new(config, transport, tick_duration)?;
    host.run().await?;

    Ok(())
}
