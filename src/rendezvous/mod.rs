//! Rendezvous ("sync") between two peers that connected independently, so neither knows whether
//!  the other is listening yet.
//!
//! Each side starts a [RendezvousHandshake] targeting the other. A handshake re-sends a sync
//!  request to its peer on a fixed interval. When it sees a request from the peer, it answers with
//!  a response and is done; when it sees a response from the peer, it is done without answering.
//!  If both requests cross, both sides complete through the request branch: a request from the
//!  peer proves that the peer is listening, so no response is needed to converge.
//!
//! There is no built-in timeout. A handshake whose peer never shows up keeps retrying until it is
//!  cancelled or its session is closed.

pub mod sync_messages;

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelError;
use crate::messaging::envelope::Envelope;
use crate::messaging::identity::Identity;
use crate::rendezvous::sync_messages::{SyncKind, SyncMessage};
use crate::session::observers::SessionObserver;
use crate::session::{Delivery, Session};


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    Idle,
    AwaitingPeer,
    Done,
    Cancelled,
}

type OnDone = Box<dyn FnOnce() + Send>;

struct HandshakeInner {
    myself: Weak<HandshakeInner>,
    me: Identity,
    peer: Identity,
    session: Session,
    retry_interval: Duration,
    state: watch::Sender<HandshakeState>,
    on_done: Mutex<Option<OnDone>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl HandshakeInner {
    /// atomically moves from `AwaitingPeer` (or `Idle`) to `to`, returning `false` if the
    ///  handshake had already ended
    fn try_finish(&self, to: HandshakeState) -> bool {
        self.state.send_if_modified(|state| {
            match state {
                HandshakeState::Idle | HandshakeState::AwaitingPeer => {
                    *state = to;
                    true
                }
                HandshakeState::Done | HandshakeState::Cancelled => false,
            }
        })
    }

    /// stops the retry timer and deregisters the handshake's observer
    async fn stop(&self) {
        let retry_task = self.retry_task.lock().unwrap().take();
        if let Some(retry_task) = retry_task {
            retry_task.abort();
        }

        if let Some(myself) = self.myself.upgrade() {
            let observer: Arc<dyn SessionObserver> = myself;
            self.session.remove_message_observer(&observer).await;
        }
    }

    async fn retry_loop(self: Arc<Self>) {
        let mut ticks = time::interval(self.retry_interval);
        loop {
            ticks.tick().await;

            trace!("{}: sending sync request to {}", self.me, self.peer);
            match self.session.send_message_with(self.peer.clone(), &SyncMessage::REQUEST, Delivery::BestEffort).await {
                Ok(_) => {}
                Err(ChannelError::ChannelClosed { .. }) => {
                    debug!("{}: channel closed - no more sync requests to {}", self.me, self.peer);
                    return;
                }
                Err(e) => warn!("{}: could not send sync request to {}: {}", self.me, self.peer, e),
            }
        }
    }
}

#[async_trait]
impl SessionObserver for HandshakeInner {
    async fn handle_msg(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(message) = envelope.content_as::<SyncMessage>() else {
            return Ok(());
        };

        if envelope.from.as_ref() != Some(&self.peer) {
            warn!("{}: received sync {:?} from unexpected {:?} while waiting for {} - ignoring", self.me, message.sync, envelope.from, self.peer);
            return Ok(());
        }

        if !self.try_finish(HandshakeState::Done) {
            trace!("{}: late sync {:?} from {} - ignoring", self.me, message.sync, self.peer);
            return Ok(());
        }
        self.stop().await;

        if message.sync == SyncKind::Request {
            if let Err(e) = self.session.send_message_with(self.peer.clone(), &SyncMessage::RESPONSE, Delivery::Reliable).await {
                warn!("{}: could not send sync response to {}: {}", self.me, self.peer, e);
            }
        }

        info!("{}: in sync with {} (via {:?})", self.me, self.peer, message.sync);
        let on_done = self.on_done.lock().unwrap().take();
        if let Some(on_done) = on_done {
            on_done();
        }
        Ok(())
    }
}


/// A running (or finished) rendezvous with one peer, see the module documentation.
///
/// `on_done` is called exactly once when the handshake completes, and never if it is cancelled.
#[derive(Clone)]
pub struct RendezvousHandshake {
    inner: Arc<HandshakeInner>,
}

impl Debug for RendezvousHandshake {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RendezvousHandshake({} -> {}: {:?})", self.inner.me, self.inner.peer, self.state())
    }
}

impl RendezvousHandshake {
    pub(crate) async fn start(session: Session, me: Identity, peer: Identity, retry_interval: Duration, on_done: impl FnOnce() + Send + 'static) -> RendezvousHandshake {
        let inner = Arc::new_cyclic(|myself| HandshakeInner {
            myself: myself.clone(),
            me,
            peer,
            session,
            retry_interval,
            state: watch::Sender::new(HandshakeState::Idle),
            on_done: Mutex::new(Some(Box::new(on_done))),
            retry_task: Default::default(),
        });

        debug!("{}: starting sync with {}", inner.me, inner.peer);
        inner.state.send_replace(HandshakeState::AwaitingPeer);
        inner.session.add_message_observer(inner.clone()).await;

        {
            // the peer's request may have completed the handshake already
            let mut retry_task = inner.retry_task.lock().unwrap();
            if *inner.state.borrow() == HandshakeState::AwaitingPeer {
                *retry_task = Some(tokio::spawn(inner.clone().retry_loop()));
            }
        }

        RendezvousHandshake { inner }
    }

    pub fn me(&self) -> &Identity {
        &self.inner.me
    }

    pub fn peer(&self) -> &Identity {
        &self.inner.peer
    }

    pub fn state(&self) -> HandshakeState {
        *self.inner.state.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.state() == HandshakeState::Done
    }

    /// Stops the handshake without calling `on_done`. Cancelling a finished handshake is a no-op.
    pub async fn cancel(&self) {
        if self.inner.try_finish(HandshakeState::Cancelled) {
            debug!("{}: sync with {} cancelled", self.inner.me, self.inner.peer);
            self.inner.stop().await;
        }
    }

    /// waits for the handshake to end, returning `true` if it completed and `false` if it was
    ///  cancelled
    pub async fn wait(&self) -> bool {
        let mut state = self.inner.state.subscribe();
        let is_done = match state.wait_for(|s| matches!(s, HandshakeState::Done | HandshakeState::Cancelled)).await {
            Ok(s) => *s == HandshakeState::Done,
            Err(_) => false,
        };
        is_done
    }

    pub(crate) fn downgrade(&self) -> WeakHandshake {
        WeakHandshake(Arc::downgrade(&self.inner))
    }
}

/// reference from a session to its handshakes, which must not keep them alive
pub(crate) struct WeakHandshake(Weak<HandshakeInner>);

impl WeakHandshake {
    pub fn upgrade(&self) -> Option<RendezvousHandshake> {
        self.0.upgrade()
            .map(|inner| RendezvousHandshake { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}
