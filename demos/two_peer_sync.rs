use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use serde_json::json;
use syncwire::channel::websocket::WebSocketConnector;
use syncwire::messaging::envelope::{Envelope, Op};
use syncwire::messaging::identity::{IdAllocator, Identity};
use syncwire::relay::relay_config::RelayConfig;
use syncwire::session::geolocation::FixedGeolocation;
use syncwire::session::location::Coordinates;
use syncwire::session::observers::SessionObserver;
use syncwire::session::session_config::SessionConfig;
use syncwire::session::Session;
use tokio::time::sleep;
use tracing::{info, Level};

/// connects to a relay as `id`, waits for `peer` to do the same, and then exchanges a greeting
#[derive(Parser)]
struct Args {
    relay_address: String,
    id: String,
    peer: String,

    #[clap(long, default_value_t = 1.0)]
    latitude: f64,
    #[clap(long, default_value_t = 1.0)]
    longitude: f64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct FixedId(Identity);
impl IdAllocator for FixedId {
    fn next_id(&self) -> Identity {
        self.0.clone()
    }
}

struct PrintingObserver {}

#[async_trait]
impl SessionObserver for PrintingObserver {
    async fn handle_msg(&self, envelope: &Envelope) -> anyhow::Result<()> {
        match envelope.op {
            Op::Joined => info!("{:?} joined", envelope.from),
            Op::Left => info!("{:?} left", envelope.from),
            _ => info!("message from {:?}: {}", envelope.from, envelope.content),
        }
        Ok(())
    }

    async fn handle_loc(&self, envelope: &Envelope) -> anyhow::Result<()> {
        info!("{:?} from {:?}: {}", envelope.op, envelope.from, envelope.content);
        Ok(())
    }
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

    let relay_addr: SocketAddr = args.relay_address.parse()?;
    let relay_config = RelayConfig::new(relay_addr);
    let config = SessionConfig::new(relay_config.message_url(relay_addr), relay_config.location_url(relay_addr));

    let observer: Arc<dyn SessionObserver> = Arc::new(PrintingObserver {});
    let session = Session::connect_with_observers(
        config,
        Arc::new(WebSocketConnector {}),
        Arc::new(FixedGeolocation(Coordinates::new(args.latitude, args.longitude))),
        &FixedId(args.id.as_str().into()),
        vec![observer.clone()],
        vec![observer],
    ).await;

    let peer = Identity::from(args.peer);
    let handshake = session.sync(peer.clone(), || info!("in sync")).await;
    if !handshake.wait().await {
        return Ok(());
    }

    session.send_message(peer, &json!({"greeting": format!("hello from {}", session.my_id())})).await?;
    session.request_nearby().await?;

    // leave time for the greeting to be acked, and for the peer's greeting to arrive
    sleep(Duration::from_secs(3)).await;
    session.close().await;
    Ok(())
}
