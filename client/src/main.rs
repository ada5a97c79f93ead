use clap::Parser;
use client::network;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Leaderboard to display in the sidebar
    #[arg(short = 'b', long, default_value = "playerKillCount")]
    leaderboard: String,

    /// Stop after this many seconds instead of running until Ctrl-C
    #[arg(short = 'd', long)]
    duration: Option<u64>,

    /// Only log, do not print the sidebar
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    info!("Displaying leaderboard: {}", args.leaderboard);

    let mut client = network::Client::new(&args.server, &args.leaderboard)
        .await?
        .with_sidebar_output(!args.quiet);

    client.run(args.duration.map(Duration::from_secs)).await?;

    Ok(())
}
