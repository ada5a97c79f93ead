use clap::Parser;
use log::info;
use server::config::SyncConfig;
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Tick rate (sync passes per second)
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// JSON file with sync tuning; defaults are used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Random score changes per tick, for demos without a game attached
    #[arg(long, default_value = "0")]
    churn: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            info!("Loading sync configuration from {}", path);
            SyncConfig::load(path)?
        }
        None => SyncConfig::default(),
    };

    let tick_rate = args.tick_rate.max(1);
    let tick_duration = Duration::from_secs_f64(1.0 / tick_rate as f64);
    let address = format!("{}:{}", args.host, args.port);

    info!(
        "Starting server on {} at {}Hz (max {} clients)",
        address, tick_rate, args.max_clients
    );

    let mut server = Server::new(&address, tick_duration, args.max_clients, config)
        .await?
        .with_churn(args.churn);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
