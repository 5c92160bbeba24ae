use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::channel::socket::{Connector, FrameSink, FrameSource};


/// Connects to `ws://` endpoints with tokio-tungstenite.
pub struct WebSocketConnector {}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url).await?;
        debug!("websocket connection to {} established: {}", url, response.status());

        let (sink, source) = split(ws_stream);
        Ok((Box::new(sink), Box::new(source)))
    }
}

/// splits a WebSocket stream into frame-level halves - used both for client connections and
///  for connections accepted by the relay
pub fn split<S>(ws_stream: WebSocketStream<S>) -> (WebSocketSink<S>, WebSocketSource<S>)
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let (sink, source) = ws_stream.split();
    (WebSocketSink { sink }, WebSocketSource { source })
}

pub struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl <S> FrameSink for WebSocketSink<S>
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    async fn send_frame(&mut self, frame: String) -> anyhow::Result<()> {
        self.sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            trace!("error closing websocket (ignored): {}", e);
        }
    }
}

pub struct WebSocketSource<S> {
    source: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl <S> FrameSource for WebSocketSource<S>
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    async fn next_frame(&mut self) -> Option<anyhow::Result<String>> {
        loop {
            match self.source.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Binary(_)) => {
                    warn!("received binary websocket frame - only text frames are supported, skipping");
                }
                Ok(_) => {
                    // ping / pong are answered by tungstenite itself
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
