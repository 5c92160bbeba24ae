//! A [ReliableChannel] moves envelopes across one socket connection, masking two things from its
//!  callers:
//! * the connection not being open yet: envelopes sent while connecting are queued and
//!   transmitted in order as soon as the connection opens
//! * packet loss: envelopes sent with `requires_ack` are kept until the peer acknowledges them,
//!   and retransmitted periodically until then
//!
//! Delivery is at-least-once. A retransmission can arrive after the original was already
//!  applied (e.g. if the ack was lost), so receivers must handle re-delivery idempotently.
//!
//! All of a channel's mutable state lives behind a single lock, and the background tasks
//!  (connecting, reading, the resend sweep) are owned by the channel and aborted when it closes.

pub mod channel_config;
pub mod socket;
pub mod unacked;
pub mod websocket;

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::channel::channel_config::ChannelConfig;
use crate::channel::socket::{Connector, FrameSink, FrameSource};
use crate::channel::unacked::UnackedSet;
use crate::messaging::envelope::{Envelope, MessageId, Op};


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// terminal
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel '{channel}' is closed")]
    ChannelClosed { channel: String },
    #[error("payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Callbacks of a channel's lifecycle.
///
/// `on_message` is called from the channel's reader task, one envelope at a time and in the
///  order they were received. It is never called while the channel's own lock is held, so it
///  is fine to send through the channel from a handler.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn on_open(&self) {}

    async fn on_message(&self, envelope: Envelope);

    async fn on_close(&self) {}
}


struct ChannelInner {
    config: Arc<ChannelConfig>,
    state: ChannelState,
    sink: Option<Box<dyn FrameSink>>,
    next_id: MessageId,
    early_messages: VecDeque<(Envelope, bool)>,
    unacked: UnackedSet,

    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl ChannelInner {
    fn new(config: Arc<ChannelConfig>) -> ChannelInner {
        ChannelInner {
            config,
            state: ChannelState::Connecting,
            sink: None,
            next_id: MessageId::FIRST,
            early_messages: Default::default(),
            unacked: Default::default(),
            connect_task: None,
            reader_task: None,
            sweep_task: None,
        }
    }

    fn assign_id(&mut self, envelope: &mut Envelope) -> MessageId {
        let id = self.next_id;
        self.next_id = id.next();
        envelope.id = id;
        id
    }

    fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        [self.connect_task.take(), self.reader_task.take(), self.sweep_task.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    async fn write_frame(&mut self, frame: String) -> anyhow::Result<()> {
        let timeout = self.config.transmit_timeout;
        let sink = self.sink.as_mut()
            .ok_or_else(|| anyhow!("no open connection"))?;

        time::timeout(timeout, sink.send_frame(frame)).await
            .map_err(|_| anyhow!("timed out after {:?}", timeout))?
    }

    /// NB: A failed transmission is not an error for the caller. If the envelope requires an
    ///      ack, it goes into the unacknowledged set regardless, and the resend sweep takes
    ///      care of it.
    async fn transmit(&mut self, envelope: Envelope, requires_ack: bool) {
        match envelope.to_frame() {
            Ok(frame) => {
                trace!("{}: sending {}", self.config.name, frame);
                if let Err(e) = self.write_frame(frame).await {
                    warn!("{}: transmitting {:?} failed: {}", self.config.name, envelope.id, e);
                }
            }
            Err(e) => {
                error!("{}: could not encode {:?} - dropping it: {}", self.config.name, envelope.id, e);
                return;
            }
        }

        if requires_ack {
            self.unacked.insert(envelope, Instant::now());
        }
    }

    async fn resend_due(&mut self) {
        let now = Instant::now();
        for pending in self.unacked.due_for_resend(now, self.config.resend_threshold) {
            let envelope = pending.envelope;
            let frame = match envelope.resend_wrapper().and_then(|w| w.to_frame().map_err(Into::into)) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("{}: could not encode retransmission of {:?}: {}", self.config.name, envelope.id, e);
                    continue;
                }
            };

            debug!("{}: no ack for {:?} after {:?} - resending", self.config.name, envelope.id, now.saturating_duration_since(pending.first_sent_at));
            match self.write_frame(frame).await {
                Ok(()) => self.unacked.mark_resent(envelope.id, now),
                Err(e) => warn!("{}: retransmitting {:?} failed, retrying on next sweep: {}", self.config.name, envelope.id, e),
            }
        }
    }
}


#[derive(Clone)]
pub struct ReliableChannel {
    config: Arc<ChannelConfig>,
    handler: Arc<dyn ChannelHandler>,
    inner: Arc<Mutex<ChannelInner>>,
}

impl ReliableChannel {
    /// Starts connecting in the background and returns immediately, with the channel in
    ///  [ChannelState::Connecting].
    pub async fn connect(config: ChannelConfig, connector: Arc<dyn Connector>, handler: Arc<dyn ChannelHandler>) -> ReliableChannel {
        let config = Arc::new(config);
        let channel = ReliableChannel {
            config: config.clone(),
            handler,
            inner: Arc::new(Mutex::new(ChannelInner::new(config.clone()))),
        };

        debug!("{}: connecting to {}", config.name, config.url);
        let connect_task = tokio::spawn(channel.clone().do_connect(connector));
        channel.inner.lock().await
            .connect_task = Some(connect_task);

        channel
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    /// ids of messages that were sent but not acknowledged yet, in ascending order
    pub async fn unacknowledged(&self) -> Vec<MessageId> {
        self.inner.lock().await.unacked.ids()
    }

    pub async fn early_queue_len(&self) -> usize {
        self.inner.lock().await.early_messages.len()
    }

    /// Sends an envelope, assigning it the channel's next message id.
    ///
    /// While the channel is connecting, the envelope is queued and this returns successfully
    ///  without waiting. Once the channel is closed, this fails with
    ///  [ChannelError::ChannelClosed].
    pub async fn send(&self, mut envelope: Envelope, requires_ack: bool) -> Result<MessageId, ChannelError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ChannelState::Closed => {
                Err(ChannelError::ChannelClosed { channel: self.config.name.clone() })
            }
            ChannelState::Connecting => {
                let id = inner.assign_id(&mut envelope);
                trace!("{}: early message {:?} stored until the connection is open", self.config.name, id);
                inner.early_messages.push_back((envelope, requires_ack));
                Ok(id)
            }
            ChannelState::Open => {
                let id = inner.assign_id(&mut envelope);
                inner.transmit(envelope, requires_ack).await;
                Ok(id)
            }
        }
    }

    /// Closes the channel, discarding early and unacknowledged messages. Closing a closed
    ///  channel is a no-op.
    pub async fn close(&self) {
        let (sink, tasks) = {
            let mut inner = self.inner.lock().await;
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Closed;

            if !inner.early_messages.is_empty() || !inner.unacked.is_empty() {
                debug!("{}: discarding {} early and {} unacknowledged messages", self.config.name, inner.early_messages.len(), inner.unacked.len());
            }
            inner.early_messages.clear();
            inner.unacked.clear();

            (inner.sink.take(), inner.take_tasks())
        };

        info!("{}: channel closed", self.config.name);
        if let Some(mut sink) = sink {
            sink.close().await;
        }
        self.handler.on_close().await;

        // NB: close() may be running on one of these tasks (e.g. the reader after the peer went
        //      away), so they are aborted only after everything else is done
        for task in tasks {
            task.abort();
        }
    }

    async fn do_connect(self, connector: Arc<dyn Connector>) {
        match connector.connect(&self.config.url).await {
            Ok((sink, source)) => {
                self.on_open(sink, source).await;
            }
            Err(e) => {
                warn!("{}: connecting to {} failed: {}", self.config.name, self.config.url, e);
                self.close().await;
            }
        }
    }

    async fn on_open(&self, mut sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ChannelState::Connecting {
                debug!("{}: connection was established after the channel was closed - discarding it", self.config.name);
                drop(inner);
                sink.close().await;
                return;
            }

            inner.state = ChannelState::Open;
            inner.sink = Some(sink);
            info!("{}: connection to {} open", self.config.name, self.config.url);

            let early_messages = std::mem::take(&mut inner.early_messages);
            if !early_messages.is_empty() {
                debug!("{}: sending {} early messages", self.config.name, early_messages.len());
            }
            for (envelope, requires_ack) in early_messages {
                inner.transmit(envelope, requires_ack).await;
            }

            inner.reader_task = Some(tokio::spawn(self.clone().read_loop(source)));
            inner.sweep_task = Some(tokio::spawn(self.clone().sweep_loop()));
        }

        self.handler.on_open().await;
    }

    async fn read_loop(self, mut source: Box<dyn FrameSource>) {
        while let Some(frame) = source.next_frame().await {
            match frame {
                Ok(frame) => self.on_frame(&frame).await,
                Err(e) => {
                    warn!("{}: error reading from socket: {}", self.config.name, e);
                    break;
                }
            }
        }

        debug!("{}: connection closed by peer", self.config.name);
        self.close().await;
    }

    async fn on_frame(&self, frame: &str) {
        trace!("{}: received {}", self.config.name, frame);

        let envelope = match Envelope::try_from_frame(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{}: received a frame that is not a valid envelope - discarding: {}", self.config.name, e);
                return;
            }
        };

        if envelope.op == Op::Ack {
            if self.inner.lock().await.unacked.ack(envelope.id) {
                trace!("{}: {:?} was acknowledged", self.config.name, envelope.id);
            }
            else {
                trace!("{}: ack for unknown or already acknowledged {:?} - ignoring", self.config.name, envelope.id);
            }
            return;
        }

        let is_resend = envelope.is_resend();
        let envelope = match envelope.unwrap_resend() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{}: received an invalid retransmission - discarding: {}", self.config.name, e);
                return;
            }
        };
        if is_resend {
            debug!("{}: received retransmission of {:?} from {:?}", self.config.name, envelope.id, envelope.from);
        }

        self.handler.on_message(envelope).await;
    }

    async fn sweep_loop(self) {
        let mut ticks = time::interval(self.config.resend_sweep_interval);
        loop {
            ticks.tick().await;
            self.inner.lock().await
                .resend_due().await;
        }
    }
}
