use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::messaging::envelope::{Envelope, Op};
use crate::messaging::identity::Identity;
use crate::relay::view::View;
use crate::session::location::Coordinates;


#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub u64);

struct Connection {
    identity: Option<Identity>,
    /// last reported position
    position: Option<Coordinates>,
    outbound: mpsc::UnboundedSender<String>,
}

struct HubInner {
    nearby_range: f64,
    next_connection_id: u64,
    connections: FxHashMap<ConnectionId, Connection>,
    by_identity: FxHashMap<Identity, ConnectionId>,
}

/// Routing core of the relay, independent of how connections are accepted. There is one hub per
///  endpoint (message traffic and location traffic are routed separately).
///
/// Each connection is represented by the sending half of its outbound queue; the hub pushes
///  frames into it and never blocks on a slow peer.
pub struct RelayHub {
    name: String,
    inner: Mutex<HubInner>,
}

impl RelayHub {
    pub fn new(name: impl Into<String>, nearby_range: f64) -> RelayHub {
        RelayHub {
            name: name.into(),
            inner: Mutex::new(HubInner {
                nearby_range,
                next_connection_id: 1,
                connections: Default::default(),
                by_identity: Default::default(),
            }),
        }
    }

    pub fn connect(&self, outbound: mpsc::UnboundedSender<String>) -> ConnectionId {
        let mut inner = self.inner.lock().unwrap();
        let id = ConnectionId(inner.next_connection_id);
        inner.next_connection_id += 1;
        inner.connections.insert(id, Connection { identity: None, position: None, outbound });
        debug!("{}: connection {:?} attached", self.name, id);
        id
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(removed) = inner.connections.remove(&connection) else {
            return;
        };
        debug!("{}: connection {:?} detached", self.name, connection);

        if let Some(identity) = removed.identity {
            if inner.by_identity.get(&identity) == Some(&connection) {
                inner.by_identity.remove(&identity);
            }
            info!("{}: {} left", self.name, identity);
            let notice = roster_notice(Op::Left, &identity);
            inner.broadcast(&self.name, connection, &notice);
        }
    }

    /// identities of all registered connections, sorted
    pub fn registered(&self) -> Vec<Identity> {
        let inner = self.inner.lock().unwrap();
        let mut result = inner.by_identity.keys().cloned().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn on_frame(&self, connection: ConnectionId, frame: &str) {
        trace!("{}: {:?} sent {}", self.name, connection, frame);

        let envelope = match Envelope::try_from_frame(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{}: {:?} sent a frame that is not a valid envelope - discarding: {}", self.name, connection, e);
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        if !inner.connections.contains_key(&connection) {
            debug!("{}: frame from detached connection {:?} - ignoring", self.name, connection);
            return;
        }

        match envelope.op {
            Op::Registration => inner.on_registration(&self.name, connection, envelope),
            Op::Msg | Op::Resend => inner.on_message(&self.name, connection, envelope),
            Op::InitLocation | Op::Location => inner.on_location(&self.name, connection, envelope),
            Op::Nearby => inner.on_nearby(&self.name, connection),
            Op::Ack | Op::Joined | Op::Left => {
                debug!("{}: {:?} sent {:?}, which is not handled by the relay - ignoring", self.name, connection, envelope.op);
            }
        }
    }
}

impl HubInner {
    fn identity_of(&self, connection: ConnectionId) -> Option<Identity> {
        self.connections.get(&connection)
            .and_then(|c| c.identity.clone())
    }

    fn send_to(&self, hub_name: &str, connection: ConnectionId, envelope: &Envelope) {
        let Some(target) = self.connections.get(&connection) else {
            return;
        };
        match envelope.to_frame() {
            Ok(frame) => {
                if target.outbound.send(frame).is_err() {
                    debug!("{}: outbound queue of {:?} is closed - dropping frame", hub_name, connection);
                }
            }
            Err(e) => warn!("{}: could not encode {:?} for {:?}: {}", hub_name, envelope.op, connection, e),
        }
    }

    /// sends to every registered connection except `except`
    fn broadcast(&self, hub_name: &str, except: ConnectionId, envelope: &Envelope) {
        for (&id, connection) in &self.connections {
            if id != except && connection.identity.is_some() {
                self.send_to(hub_name, id, envelope);
            }
        }
    }

    fn on_registration(&mut self, hub_name: &str, connection: ConnectionId, envelope: Envelope) {
        let Some(identity) = envelope.from else {
            warn!("{}: registration without identity from {:?} - ignoring", hub_name, connection);
            return;
        };
        if let Some(existing) = self.identity_of(connection) {
            debug!("{}: {:?} is already registered as {} - ignoring registration as {}", hub_name, connection, existing, identity);
            return;
        }

        if let Some(c) = self.connections.get_mut(&connection) {
            c.identity = Some(identity.clone());
        }
        if let Some(previous) = self.by_identity.insert(identity.clone(), connection) {
            debug!("{}: {} re-registered, replacing {:?} with {:?}", hub_name, identity, previous, connection);
        }
        info!("{}: {} joined", hub_name, identity);

        self.broadcast(hub_name, connection, &roster_notice(Op::Joined, &identity));
    }

    fn on_message(&mut self, hub_name: &str, connection: ConnectionId, envelope: Envelope) {
        let id = envelope.id;
        let mut envelope = match envelope.unwrap_resend() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{}: invalid retransmission from {:?} - discarding: {}", hub_name, connection, e);
                return;
            }
        };

        self.send_to(hub_name, connection, &Envelope::ack(id));

        if envelope.from.is_none() {
            envelope.from = self.identity_of(connection);
        }

        let target = envelope.to.as_ref()
            .and_then(|to| self.by_identity.get(to))
            .cloned();
        match target {
            Some(target) => self.send_to(hub_name, target, &envelope),
            None => debug!("{}: {:?} from {:?} is addressed to unknown recipient {:?} - dropping", hub_name, id, envelope.from, envelope.to),
        }
    }

    fn on_location(&mut self, hub_name: &str, connection: ConnectionId, mut envelope: Envelope) {
        let Some(identity) = self.identity_of(connection) else {
            debug!("{}: location report from unregistered {:?} - dropping", hub_name, connection);
            return;
        };

        match envelope.content_as::<Coordinates>() {
            Some(position) => {
                if let Some(c) = self.connections.get_mut(&connection) {
                    trace!("{}: {} moved from {:?} to {:?}", hub_name, identity, c.position, position);
                    c.position = Some(position);
                }
            }
            None => debug!("{}: {:?} from {} carries no coordinates - forwarding without tracking", hub_name, envelope.op, identity),
        }

        envelope.from = Some(identity);
        self.broadcast(hub_name, connection, &envelope);
    }

    /// Reports every registered participant within range of the requester's last position as a
    ///  `joined` notice carrying that participant's position.
    fn on_nearby(&self, hub_name: &str, connection: ConnectionId) {
        let Some(center) = self.connections.get(&connection).and_then(|c| c.position) else {
            debug!("{}: nearby request from {:?}, which has not reported a position yet - ignoring", hub_name, connection);
            return;
        };
        let view = View::around(center, self.nearby_range);

        for (&id, other) in &self.connections {
            if id == connection {
                continue;
            }
            let (Some(identity), Some(position)) = (&other.identity, other.position) else {
                continue;
            };
            if !view.contains(position) {
                continue;
            }

            let mut notice = roster_notice(Op::Joined, identity);
            match serde_json::to_value(position) {
                Ok(content) => notice.content = content,
                Err(e) => warn!("{}: could not encode position of {}: {}", hub_name, identity, e),
            }
            self.send_to(hub_name, connection, &notice);
        }
    }
}

fn roster_notice(op: Op, identity: &Identity) -> Envelope {
    let mut result = Envelope::new(op, None, Value::Null);
    result.from = Some(identity.clone());
    result
}
