//! A minimal relay: the server side of the socket protocol. It registers identities, acks
//!  application messages and routes them to their recipient, and fans location reports out to
//!  all other participants.
//!
//! This is what sessions connect to in the demos and in end-to-end tests. The relay remembers
//!  each participant's last reported position and answers a `nearby` request with the
//!  participants within [RelayConfig::nearby_range] of the requester.

pub mod hub;
pub mod relay_config;
pub mod view;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, warn};

use crate::channel::socket::{FrameSink, FrameSource};
use crate::channel::websocket;
use crate::relay::hub::RelayHub;
use crate::relay::relay_config::RelayConfig;


pub async fn run_relay(config: RelayConfig) -> anyhow::Result<()> {
    Relay::bind(config).await?
        .run().await
}

pub struct Relay {
    config: RelayConfig,
    listener: TcpListener,
    message_hub: Arc<RelayHub>,
    location_hub: Arc<RelayHub>,
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Relay> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Relay {
            message_hub: Arc::new(RelayHub::new("relay/message", config.nearby_range)),
            location_hub: Arc::new(RelayHub::new("relay/location", config.nearby_range)),
            config,
            listener,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("relay listening on {} (messages at {}, locations at {})", self.local_addr()?, self.config.message_path, self.config.location_path);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = ?e, "error accepting connection");
                    return Err(e.into());
                }
            };
            debug!("accepted TCP connection from {}", peer);

            tokio::spawn(handle_connection(
                stream,
                peer,
                self.config.clone(),
                self.message_hub.clone(),
                self.location_hub.clone(),
            ));
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, config: RelayConfig, message_hub: Arc<RelayHub>, location_hub: Arc<RelayHub>) {
    let mut path = String::new();
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_owned();
        Ok(response)
    }).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("websocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let hub = if path == config.location_path {
        location_hub
    }
    else if path == config.message_path {
        message_hub
    }
    else {
        warn!("{} connected to unknown path {} - closing", peer, path);
        return;
    };

    let (mut sink, mut source) = websocket::split(ws_stream);
    let (outbound_sender, mut outbound) = mpsc::unbounded_channel::<String>();
    let connection = hub.connect(outbound_sender);
    debug!("{} connected to {} as {:?}", peer, path, connection);

    let pump = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sink.send_frame(frame).await {
                debug!("sending to {} failed: {}", peer, e);
                break;
            }
        }
        sink.close().await;
    });

    while let Some(frame) = source.next_frame().await {
        match frame {
            Ok(frame) => hub.on_frame(connection, &frame),
            Err(e) => {
                debug!("error reading from {}: {}", peer, e);
                break;
            }
        }
    }

    debug!("{} disconnected", peer);
    hub.disconnect(connection);
    pump.abort();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::{self, sleep};

    use super::*;
    use crate::session::geolocation::FixedGeolocation;
    use crate::session::location::Coordinates;
    use crate::session::session_config::SessionConfig;
    use crate::session::Session;
    use crate::test_util::observer::RecordingObserver;

    #[tokio::test]
    async fn test_sessions_over_websockets() {
        let config = RelayConfig::new("127.0.0.1:0".parse().unwrap());
        let relay = Relay::bind(config.clone()).await.unwrap();
        let addr = relay.local_addr().unwrap();
        let relay_task = tokio::spawn(relay.run());

        let session_config = SessionConfig::new(config.message_url(addr), config.location_url(addr));
        let p1 = Session::connect_websocket(session_config.clone(), Arc::new(FixedGeolocation(Coordinates::new(10.0, 20.0)))).await;
        let p2 = Session::connect_websocket(session_config, Arc::new(FixedGeolocation(Coordinates::new(30.0, 40.0)))).await;

        let messages = RecordingObserver::new();
        p2.add_message_observer(messages.clone()).await;

        let h1 = p1.sync(p2.my_id().clone(), || {}).await;
        let h2 = p2.sync(p1.my_id().clone(), || {}).await;
        let both_done = time::timeout(Duration::from_secs(10), async {
            h1.wait().await && h2.wait().await
        }).await.unwrap();
        assert!(both_done);

        let id = p1.send_message(p2.my_id().clone(), &json!({"hello": "world"})).await.unwrap();
        time::timeout(Duration::from_secs(10), async {
            loop {
                let is_acked = !p1.message_channel().unacknowledged().await.contains(&id);
                let is_delivered = messages.messages().iter()
                    .any(|e| e.from.as_ref() == Some(p1.my_id()) && e.content == json!({"hello": "world"}));
                if is_acked && is_delivered {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        p1.close().await;
        p2.close().await;
        relay_task.abort();
    }
}
