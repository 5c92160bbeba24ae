use async_trait::async_trait;

/// Writing half of a connected socket. Frames are JSON text.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> anyhow::Result<()>;

    /// closes the connection; errors are not interesting at this point and are swallowed
    async fn close(&mut self);
}

/// Reading half of a connected socket. `None` means the connection was closed by the peer.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<anyhow::Result<String>>;
}

/// This trait decouples establishing a connection (WebSocket in production, in-memory for tests)
///  from the channel logic that uses it.
///
/// It is passed around as an `Arc<dyn ...>`, and connecting may take arbitrarily long - the
///  channel is in 'connecting' state while it does.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> anyhow::Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}
