//! In-memory sockets.
//!
//! [MemoryConnector] hands out connections to scripted [MemoryRemote]s: the test decides when a
//!  connection attempt succeeds or fails, inspects what was sent, and injects frames. [MemoryRelay]
//!  connects sessions to each other through a [RelayHub], optionally dropping frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::channel::socket::{Connector, FrameSink, FrameSource};
use crate::messaging::envelope::Envelope;
use crate::relay::hub::{ConnectionId, RelayHub};
use crate::relay::relay_config::DEFAULT_NEARBY_RANGE;


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Gate {
    Pending,
    Accept,
    Refuse,
}

/// The far end of an in-memory connection.
pub struct MemoryRemote {
    url: String,
    gate: watch::Sender<Gate>,
    sent: Mutex<Vec<String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryRemote {
    fn new(url: &str, gate: Gate) -> MemoryRemote {
        MemoryRemote {
            url: url.to_string(),
            gate: watch::Sender::new(gate),
            sent: Default::default(),
            inbound: Default::default(),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// lets pending and future connection attempts succeed
    pub fn accept(&self) {
        self.gate.send_replace(Gate::Accept);
    }

    /// lets pending and future connection attempts fail
    pub fn refuse(&self) {
        self.gate.send_replace(Gate::Refuse);
    }

    /// while failing, every attempt to send a frame returns an error and nothing is recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// returns sent frames, clearing the internal buffer
    pub fn take_sent_frames(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// returns sent envelopes, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<Envelope> {
        self.take_sent_frames().iter()
            .map(|frame| Envelope::try_from_frame(frame).expect("sent frame is not a valid envelope"))
            .collect()
    }

    pub fn inject(&self, envelope: &Envelope) {
        self.inject_raw(&envelope.to_frame().expect("envelope can not be serialized"));
    }

    pub fn inject_raw(&self, frame: &str) {
        match self.inbound.lock().unwrap().as_ref() {
            Some(inbound) => {
                let _ = inbound.send(frame.to_string());
            }
            None => panic!("{} is not connected", self.url),
        }
    }

    /// simulates the peer going away: the connection's frame source ends
    pub fn disconnect(&self) {
        self.inbound.lock().unwrap().take();
    }
}

struct MemorySink {
    remote: Arc<MemoryRemote>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: String) -> anyhow::Result<()> {
        if self.remote.is_closed() {
            return Err(anyhow!("{} is closed", self.remote.url));
        }
        if self.remote.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated send failure on {}", self.remote.url));
        }
        self.remote.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        self.remote.closed.store(true, Ordering::SeqCst);
        self.remote.disconnect();
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<anyhow::Result<String>> {
        self.inbound.recv().await
            .map(Ok)
    }
}


pub struct MemoryConnector {
    default_gate: Gate,
    remotes: Mutex<FxHashMap<String, Arc<MemoryRemote>>>,
}

impl MemoryConnector {
    /// connection attempts wait until the test calls [MemoryRemote::accept] or [MemoryRemote::refuse]
    pub fn new() -> Arc<MemoryConnector> {
        Self::with_gate(Gate::Pending)
    }

    /// connection attempts succeed immediately
    pub fn auto_accept() -> Arc<MemoryConnector> {
        Self::with_gate(Gate::Accept)
    }

    fn with_gate(default_gate: Gate) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            default_gate,
            remotes: Default::default(),
        })
    }

    pub fn remote(&self, url: &str) -> Arc<MemoryRemote> {
        self.remotes.lock().unwrap()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemoryRemote::new(url, self.default_gate)))
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let remote = self.remote(url);

        let mut gate = remote.gate.subscribe();
        let gate = *gate.wait_for(|g| *g != Gate::Pending).await?;
        if gate == Gate::Refuse {
            return Err(anyhow!("connection to {} refused", url));
        }

        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        *remote.inbound.lock().unwrap() = Some(inbound_sender);
        remote.closed.store(false, Ordering::SeqCst);

        Ok((Box::new(MemorySink { remote }), Box::new(MemorySource { inbound })))
    }
}


type DropFilter = dyn Fn(&Envelope) -> bool + Send + Sync;

/// Connects sessions through one in-process [RelayHub] per url.
pub struct MemoryRelay {
    hubs: Mutex<FxHashMap<String, Arc<RelayHub>>>,
    drop_filter: Arc<Mutex<Option<Box<DropFilter>>>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<MemoryRelay> {
        Arc::new(MemoryRelay {
            hubs: Default::default(),
            drop_filter: Default::default(),
        })
    }

    pub fn hub(&self, url: &str) -> Arc<RelayHub> {
        self.hubs.lock().unwrap()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(RelayHub::new(url, DEFAULT_NEARBY_RANGE)))
            .clone()
    }

    /// frames sent by a client to the relay are silently lost while the filter returns `true`
    ///  for them
    pub fn set_drop_filter(&self, filter: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
        *self.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.drop_filter.lock().unwrap().take();
    }
}

#[async_trait]
impl Connector for MemoryRelay {
    async fn connect(&self, url: &str) -> anyhow::Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let hub = self.hub(url);
        let (outbound_sender, inbound) = mpsc::unbounded_channel();
        let connection = hub.connect(outbound_sender);

        let sink = RelaySink {
            hub,
            connection,
            drop_filter: self.drop_filter.clone(),
        };
        Ok((Box::new(sink), Box::new(MemorySource { inbound })))
    }
}

struct RelaySink {
    hub: Arc<RelayHub>,
    connection: ConnectionId,
    drop_filter: Arc<Mutex<Option<Box<DropFilter>>>>,
}

#[async_trait]
impl FrameSink for RelaySink {
    async fn send_frame(&mut self, frame: String) -> anyhow::Result<()> {
        let is_dropped = match (self.drop_filter.lock().unwrap().as_ref(), Envelope::try_from_frame(&frame)) {
            (Some(filter), Ok(envelope)) => filter(&envelope),
            _ => false,
        };
        if is_dropped {
            trace!("simulated loss of {}", frame);
        }
        else {
            self.hub.on_frame(self.connection, &frame);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.hub.disconnect(self.connection);
    }
}
