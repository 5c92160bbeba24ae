use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;

use crate::channel::ChannelHandler;
use crate::messaging::envelope::Envelope;
use crate::session::observers::SessionObserver;


/// records a channel's lifecycle callbacks and received envelopes
#[derive(Default)]
pub struct RecordingChannelHandler {
    opened: AtomicUsize,
    closed: AtomicUsize,
    messages: Mutex<Vec<Envelope>>,
}

impl RecordingChannelHandler {
    pub fn new() -> Arc<RecordingChannelHandler> {
        Default::default()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<Envelope> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelHandler for RecordingChannelHandler {
    async fn on_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, envelope: Envelope) {
        self.messages.lock().unwrap().push(envelope);
    }

    async fn on_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}


/// records everything it observes; optionally fails every callback after recording
#[derive(Default)]
pub struct RecordingObserver {
    fail: bool,
    messages: Mutex<Vec<Envelope>>,
    locations: Mutex<Vec<Envelope>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<RecordingObserver> {
        Default::default()
    }

    pub fn failing() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver {
            fail: true,
            ..Default::default()
        })
    }

    pub fn messages(&self) -> Vec<Envelope> {
        self.messages.lock().unwrap().clone()
    }

    pub fn locations(&self) -> Vec<Envelope> {
        self.locations.lock().unwrap().clone()
    }

    fn result(&self) -> anyhow::Result<()> {
        if self.fail {
            Err(anyhow!("simulated observer failure"))
        }
        else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn handle_msg(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(envelope.clone());
        self.result()
    }

    async fn handle_loc(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.locations.lock().unwrap().push(envelope.clone());
        self.result()
    }
}


/// panics when it observes a message with the given content, and ignores everything else
pub struct PanickingObserver {
    trigger: Value,
}

impl PanickingObserver {
    pub fn new(trigger: Value) -> Arc<PanickingObserver> {
        Arc::new(PanickingObserver { trigger })
    }
}

#[async_trait]
impl SessionObserver for PanickingObserver {
    async fn handle_msg(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if envelope.content == self.trigger {
            panic!("observer panics on {}", self.trigger);
        }
        Ok(())
    }
}
