//! A [Session] is one participant's connection: a single identity spanning two reliable channels,
//!  one for application messages and one for location reports. Inbound traffic is fanned out to
//!  registered [SessionObserver]s.
//!
//! Connecting a session never waits: both channels start out connecting, the registration
//!  envelope announcing the session's identity is queued as the first frame of each channel, and
//!  the initial location report follows whenever geolocation is done (or has given up).

pub mod geolocation;
pub mod location;
pub mod observers;
pub mod session_config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::socket::Connector;
use crate::channel::websocket::WebSocketConnector;
use crate::channel::{ChannelError, ChannelHandler, ReliableChannel};
use crate::messaging::envelope::{Envelope, MessageId, Op};
use crate::messaging::identity::{IdAllocator, Identity, UuidIdAllocator};
use crate::rendezvous::{RendezvousHandshake, WeakHandshake};
use crate::session::geolocation::{current_position_or_fallback, GeolocationProvider};
use crate::session::location::Coordinates;
use crate::session::observers::{ObservedTraffic, ObserverRegistry, SessionObserver};
use crate::session::session_config::SessionConfig;


/// Per-call delivery guarantee of an outgoing message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// retransmitted until acknowledged
    Reliable,
    /// sent once; for traffic that is superseded by the next message anyway
    BestEffort,
}

impl Delivery {
    fn requires_ack(self) -> bool {
        self == Delivery::Reliable
    }
}


struct SessionInner {
    myself: Identity,
    config: SessionConfig,
    message_channel: ReliableChannel,
    location_channel: ReliableChannel,
    observers: Arc<ObserverRegistry>,
    handshakes: Mutex<Vec<WeakHandshake>>,
    geolocation_task: Mutex<Option<JoinHandle<()>>>,
    is_closed: AtomicBool,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// connects with WebSocket channels and a random (uuid) identity
    pub async fn connect_websocket(config: SessionConfig, geolocation: Arc<dyn GeolocationProvider>) -> Session {
        Self::connect(config, Arc::new(WebSocketConnector {}), geolocation, &UuidIdAllocator {}).await
    }

    pub async fn connect(config: SessionConfig, connector: Arc<dyn Connector>, geolocation: Arc<dyn GeolocationProvider>, id_allocator: &dyn IdAllocator) -> Session {
        Self::connect_with_observers(config, connector, geolocation, id_allocator, Vec::new(), Vec::new()).await
    }

    pub async fn connect_with_observers(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        geolocation: Arc<dyn GeolocationProvider>,
        id_allocator: &dyn IdAllocator,
        message_observers: Vec<Arc<dyn SessionObserver>>,
        location_observers: Vec<Arc<dyn SessionObserver>>,
    ) -> Session {
        let myself = id_allocator.next_id();
        info!("starting session {}", myself);

        let observers = Arc::new(ObserverRegistry::new(message_observers, location_observers));

        let message_channel = ReliableChannel::connect(
            config.message_channel_config(),
            connector.clone(),
            Arc::new(SessionChannelHandler { traffic: ObservedTraffic::Message, observers: observers.clone() }),
        ).await;
        let location_channel = ReliableChannel::connect(
            config.location_channel_config(),
            connector,
            Arc::new(SessionChannelHandler { traffic: ObservedTraffic::Location, observers: observers.clone() }),
        ).await;

        for channel in [&message_channel, &location_channel] {
            if let Err(e) = channel.send(Envelope::registration(myself.clone()), false).await {
                warn!("{}: could not register on {} channel: {}", myself, channel.name(), e);
            }
        }

        let session = Session {
            inner: Arc::new(SessionInner {
                myself,
                config,
                message_channel,
                location_channel,
                observers,
                handshakes: Default::default(),
                geolocation_task: Default::default(),
                is_closed: AtomicBool::new(false),
            }),
        };

        let geolocation_task = tokio::spawn(session.clone().send_initial_location(geolocation));
        *session.inner.geolocation_task.lock().unwrap() = Some(geolocation_task);

        session
    }

    async fn send_initial_location(self, geolocation: Arc<dyn GeolocationProvider>) {
        let position = current_position_or_fallback(
            geolocation.as_ref(),
            self.inner.config.geolocation_timeout,
            self.inner.config.fallback_location,
        ).await;

        if let Err(e) = self.send_location_report(Op::InitLocation, position).await {
            warn!("{}: could not send initial location: {}", self.inner.myself, e);
        }
    }

    pub fn my_id(&self) -> &Identity {
        &self.inner.myself
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn message_channel(&self) -> &ReliableChannel {
        &self.inner.message_channel
    }

    pub fn location_channel(&self) -> &ReliableChannel {
        &self.inner.location_channel
    }

    /// sends `content` to `to` with [Delivery::Reliable]
    pub async fn send_message<T: Serialize + ?Sized>(&self, to: Identity, content: &T) -> Result<MessageId, ChannelError> {
        self.send_message_with(to, content, Delivery::Reliable).await
    }

    pub async fn send_message_with<T: Serialize + ?Sized>(&self, to: Identity, content: &T, delivery: Delivery) -> Result<MessageId, ChannelError> {
        let mut envelope = Envelope::message(to, serde_json::to_value(content)?);
        envelope.from = Some(self.inner.myself.clone());
        self.inner.message_channel.send(envelope, delivery.requires_ack()).await
    }

    /// Location reports are best effort: the next report supersedes a lost one.
    pub async fn send_location(&self, position: Coordinates) -> Result<MessageId, ChannelError> {
        self.send_location_report(Op::Location, position).await
    }

    async fn send_location_report(&self, op: Op, position: Coordinates) -> Result<MessageId, ChannelError> {
        let mut envelope = Envelope::new(op, None, serde_json::to_value(position)?);
        envelope.from = Some(self.inner.myself.clone());
        self.inner.location_channel.send(envelope, false).await
    }

    /// asks the relay for the participants near this session's last reported position; they are
    ///  reported as `joined` notices, carrying their position, to the location observers
    pub async fn request_nearby(&self) -> Result<MessageId, ChannelError> {
        let mut envelope = Envelope::new(Op::Nearby, None, Value::Null);
        envelope.from = Some(self.inner.myself.clone());
        self.inner.location_channel.send(envelope, false).await
    }

    pub async fn add_message_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner.observers.messages.add(observer).await;
    }

    pub async fn remove_message_observer(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        self.inner.observers.messages.remove(observer).await
    }

    pub async fn add_location_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner.observers.locations.add(observer).await;
    }

    pub async fn remove_location_observer(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        self.inner.observers.locations.remove(observer).await
    }

    /// Starts a rendezvous handshake with `you`, see [RendezvousHandshake].
    pub async fn sync(&self, you: Identity, on_done: impl FnOnce() + Send + 'static) -> RendezvousHandshake {
        self.sync_as(self.inner.myself.clone(), you, on_done).await
    }

    /// Like [Session::sync], with an explicit local identity. Sync traffic always carries the
    ///  session's own identity as sender, so `me` should be [Session::my_id].
    pub async fn sync_as(&self, me: Identity, you: Identity, on_done: impl FnOnce() + Send + 'static) -> RendezvousHandshake {
        if me != self.inner.myself {
            warn!("{}: starting sync as {}, but peers will see this session's own identity", self.inner.myself, me);
        }

        let handshake = RendezvousHandshake::start(self.clone(), me, you, self.inner.config.sync_retry_interval, on_done).await;

        let was_closed = {
            let mut handshakes = self.inner.handshakes.lock().unwrap();
            handshakes.retain(|h| h.is_alive());
            handshakes.push(handshake.downgrade());
            self.is_closed()
        };
        if was_closed {
            debug!("{}: session is closed - cancelling new sync with {}", self.inner.myself, handshake.peer());
            handshake.cancel().await;
        }

        handshake
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    /// Closes both channels and cancels all running handshakes. Observers stay registered, but
    ///  they receive nothing after this. Closing a closed session is a no-op.
    pub async fn close(&self) {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing session {}", self.inner.myself);

        let handshakes = std::mem::take(&mut *self.inner.handshakes.lock().unwrap());
        for handshake in handshakes.iter().filter_map(|h| h.upgrade()) {
            handshake.cancel().await;
        }

        let geolocation_task = self.inner.geolocation_task.lock().unwrap().take();
        if let Some(task) = geolocation_task {
            task.abort();
        }

        self.inner.message_channel.close().await;
        self.inner.location_channel.close().await;
    }
}


struct SessionChannelHandler {
    traffic: ObservedTraffic,
    observers: Arc<ObserverRegistry>,
}

#[async_trait]
impl ChannelHandler for SessionChannelHandler {
    async fn on_message(&self, envelope: Envelope) {
        self.observers.list(self.traffic)
            .dispatch(self.traffic, &envelope).await;
    }

    async fn on_close(&self) {
        debug!("{:?} channel of session closed", self.traffic);
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::{self, sleep};

    use super::*;
    use crate::channel::ChannelState;
    use crate::messaging::identity::MockIdAllocator;
    use crate::session::geolocation::{GeolocationError, MockGeolocationProvider};
    use crate::test_util::memory::{MemoryConnector, MemoryRelay, MemoryRemote};
    use crate::test_util::observer::{PanickingObserver, RecordingObserver};

    const MESSAGE_URL: &str = "mem://message";
    const LOCATION_URL: &str = "mem://location";

    fn id_allocator(id: &str) -> MockIdAllocator {
        let mut result = MockIdAllocator::new();
        result.expect_next_id()
            .return_const(Identity::from(id));
        result
    }

    fn geolocation(position: Result<Coordinates, GeolocationError>) -> Arc<MockGeolocationProvider> {
        let mut result = MockGeolocationProvider::new();
        result.expect_current_position()
            .return_once(move || position);
        Arc::new(result)
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    struct Fixture {
        session: Session,
        message_remote: Arc<MemoryRemote>,
        location_remote: Arc<MemoryRemote>,
    }

    async fn connected_session(message_observers: Vec<Arc<dyn SessionObserver>>, location_observers: Vec<Arc<dyn SessionObserver>>) -> Fixture {
        let connector = MemoryConnector::auto_accept();
        let message_remote = connector.remote(MESSAGE_URL);
        let location_remote = connector.remote(LOCATION_URL);

        let session = Session::connect_with_observers(
            SessionConfig::new(MESSAGE_URL, LOCATION_URL),
            connector,
            geolocation(Ok(Coordinates::new(52.5, 13.4))),
            &id_allocator("p1"),
            message_observers,
            location_observers,
        ).await;
        settle().await;

        message_remote.take_sent();
        location_remote.take_sent();
        Fixture { session, message_remote, location_remote }
    }

    fn message_from(from: &str, content: Value) -> Envelope {
        let mut result = Envelope::message("p1".into(), content);
        result.from = Some(from.into());
        result.id = MessageId(11);
        result
    }

    #[tokio::test]
    async fn test_registration_is_first_frame_and_initial_location_follows() {
        time::pause();

        let connector = MemoryConnector::new();
        let message_remote = connector.remote(MESSAGE_URL);
        let location_remote = connector.remote(LOCATION_URL);

        let session = Session::connect(
            SessionConfig::new(MESSAGE_URL, LOCATION_URL),
            connector.clone(),
            geolocation(Ok(Coordinates::new(52.5, 13.4))),
            &id_allocator("p1"),
        ).await;
        assert_eq!(session.my_id(), &Identity::from("p1"));

        sleep(Duration::from_millis(50)).await;
        message_remote.accept();
        location_remote.accept();
        settle().await;

        assert_eq!(message_remote.take_sent(), vec![Envelope {
            id: MessageId(1),
            ..Envelope::registration("p1".into())
        }]);

        let location_frames = location_remote.take_sent();
        assert_eq!(location_frames.len(), 2);
        assert_eq!(location_frames[0].op, Op::Registration);
        assert_eq!(location_frames[0].from, Some("p1".into()));
        assert_eq!(location_frames[1].op, Op::InitLocation);
        assert_eq!(location_frames[1].from, Some("p1".into()));
        assert_eq!(location_frames[1].content, json!({"latitude": 52.5, "longitude": 13.4}));

        assert!(session.location_channel().unacknowledged().await.is_empty());
    }

    #[tokio::test]
    async fn test_initial_location_falls_back_on_geolocation_error() {
        time::pause();

        let connector = MemoryConnector::auto_accept();
        let location_remote = connector.remote(LOCATION_URL);

        let _session = Session::connect(
            SessionConfig::new(MESSAGE_URL, LOCATION_URL),
            connector.clone(),
            geolocation(Err(GeolocationError::Unavailable("permission denied".to_string()))),
            &id_allocator("p1"),
        ).await;
        settle().await;

        let location_frames = location_remote.take_sent();
        assert_eq!(location_frames.len(), 2);
        assert_eq!(location_frames[1].op, Op::InitLocation);
        assert_eq!(location_frames[1].content, json!({"latitude": 1.0, "longitude": 1.0}));
    }

    #[tokio::test]
    async fn test_send_message_delivery_modes() {
        time::pause();

        let f = connected_session(vec![], vec![]).await;

        let reliable = f.session.send_message("p2".into(), &json!({"hp": 3})).await.unwrap();
        f.session.send_message_with("p2".into(), &"ping", Delivery::BestEffort).await.unwrap();

        let sent = f.message_remote.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].from, Some("p1".into()));
        assert_eq!(sent[0].to, Some("p2".into()));
        assert_eq!(sent[0].content, json!({"hp": 3}));
        assert_eq!(sent[1].content, json!("ping"));

        assert_eq!(f.session.message_channel().unacknowledged().await, vec![reliable]);
    }

    #[tokio::test]
    async fn test_send_location_and_nearby_are_best_effort() {
        time::pause();

        let f = connected_session(vec![], vec![]).await;

        f.session.send_location(Coordinates::new(2.0, 3.0)).await.unwrap();
        f.session.request_nearby().await.unwrap();

        let sent = f.location_remote.take_sent();
        assert_eq!(sent.iter().map(|e| e.op).collect::<Vec<_>>(), vec![Op::Location, Op::Nearby]);
        assert_eq!(sent[0].content, json!({"latitude": 2.0, "longitude": 3.0}));
        assert!(f.session.location_channel().unacknowledged().await.is_empty());
        assert!(f.message_remote.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_traffic_reaches_observers() {
        time::pause();

        let message_observer = RecordingObserver::new();
        let location_observer = RecordingObserver::new();
        let f = connected_session(vec![message_observer.clone() as Arc<dyn SessionObserver>], vec![location_observer.clone()]).await;

        f.message_remote.inject(&message_from("p2", json!("{\"shot\":true}")));
        let mut location = Envelope::new(Op::Location, None, json!({"latitude": 1.5, "longitude": 2.5}));
        location.from = Some("p2".into());
        f.location_remote.inject(&location);
        settle().await;

        let messages = message_observer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, json!("{\"shot\":true}"));
        assert!(message_observer.locations().is_empty());

        assert_eq!(location_observer.locations(), vec![location]);
        assert!(location_observer.messages().is_empty());
    }

    #[tokio::test]
    async fn test_json_looking_string_content_arrives_unchanged() {
        time::pause();

        let relay = MemoryRelay::new();
        let config = SessionConfig::new(MESSAGE_URL, LOCATION_URL);
        let p1 = Session::connect(config.clone(), relay.clone(), geolocation(Ok(Coordinates::new(1.0, 2.0))), &id_allocator("p1")).await;
        let p2 = Session::connect(config, relay.clone(), geolocation(Ok(Coordinates::new(3.0, 4.0))), &id_allocator("p2")).await;
        let observer = RecordingObserver::new();
        p2.add_message_observer(observer.clone()).await;
        settle().await;

        p1.send_message("p2".into(), &"[1,2]").await.unwrap();
        p1.send_message("p2".into(), &"{\"a\":1}").await.unwrap();
        p1.send_message("p2".into(), &json!({"a": 1})).await.unwrap();
        settle().await;

        let contents = observer.messages().into_iter()
            .map(|e| e.content)
            .collect::<Vec<_>>();
        assert_eq!(contents, vec![json!("[1,2]"), json!("{\"a\":1}"), json!({"a": 1})]);
        assert!(p1.message_channel().unacknowledged().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_observer_does_not_stop_dispatch() {
        time::pause();

        let failing = RecordingObserver::failing();
        let recording = RecordingObserver::new();
        let f = connected_session(vec![failing.clone() as Arc<dyn SessionObserver>, recording.clone()], vec![]).await;

        f.message_remote.inject(&message_from("p2", json!(1)));
        f.message_remote.inject(&message_from("p2", json!(2)));
        settle().await;

        assert_eq!(failing.messages().len(), 2);
        assert_eq!(recording.messages().iter().map(|e| e.content.clone()).collect::<Vec<_>>(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_the_channel() {
        time::pause();

        let recording = RecordingObserver::new();
        let f = connected_session(vec![PanickingObserver::new(json!(1)) as Arc<dyn SessionObserver>, recording.clone()], vec![]).await;

        f.message_remote.inject(&message_from("p2", json!(1)));
        f.message_remote.inject(&message_from("p2", json!(2)));
        settle().await;

        assert_eq!(recording.messages().iter().map(|e| e.content.clone()).collect::<Vec<_>>(), vec![json!(1), json!(2)]);
        assert_eq!(f.session.message_channel().state().await, ChannelState::Open);
    }

    #[tokio::test]
    async fn test_observers_can_be_added_and_removed() {
        time::pause();

        let f = connected_session(vec![], vec![]).await;
        let observer = RecordingObserver::new();
        let observer_dyn: Arc<dyn SessionObserver> = observer.clone();

        f.session.add_message_observer(observer_dyn.clone()).await;
        f.message_remote.inject(&message_from("p2", json!(1)));
        settle().await;

        assert!(f.session.remove_message_observer(&observer_dyn).await);
        assert!(!f.session.remove_location_observer(&observer_dyn).await);
        f.message_remote.inject(&message_from("p2", json!(2)));
        settle().await;

        assert_eq!(observer.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_close() {
        time::pause();

        let f = connected_session(vec![], vec![]).await;
        let handshake = f.session.sync("p2".into(), || {}).await;

        f.session.close().await;
        f.session.close().await;

        assert!(f.session.is_closed());
        assert_eq!(f.session.message_channel().state().await, ChannelState::Closed);
        assert_eq!(f.session.location_channel().state().await, ChannelState::Closed);
        assert!(f.message_remote.is_closed());
        assert!(f.location_remote.is_closed());
        assert!(!handshake.wait().await);
        assert!(matches!(
            f.session.send_message("p2".into(), &1).await,
            Err(ChannelError::ChannelClosed { .. })
        ));
    }
}
