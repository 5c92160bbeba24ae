use clap::Parser;
use clap_derive::Parser;
use syncwire::relay::relay_config::RelayConfig;
use syncwire::relay::run_relay;
use tracing::Level;

#[derive(Parser)]
struct Args {
    bind_address: String,

    /// degrees around a participant that a `nearby` request covers
    #[clap(long)]
    nearby_range: Option<f64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = RelayConfig::new(args.bind_address.parse()?);
    if let Some(nearby_range) = args.nearby_range {
        config.nearby_range = nearby_range;
    }
    run_relay(config).await
}
