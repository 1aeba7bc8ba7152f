//! The seam between the reactor and an actual socket.
//!
//! A [`Connector`] produces a fresh [`Link`] per connection attempt: a sink of
//! outbound text frames and a stream of inbound ones. The reactor never sees
//! the socket type, so tests can drive it with in-memory channels.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{ConnectionError, LinkError};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = LinkError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, LinkError>> + Send>>;

/// One live connection, split into halves.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Link, ConnectionError>;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

/// WebSocket connector for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, ConnectionError> {
        let (ws, _response) =
            connect_async(self.endpoint.as_str())
                .await
                .map_err(|e| ConnectionError::Refused {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                })?;
        debug!("WebSocket connected to {}", self.endpoint);

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| LinkError::transport(e))
            .with(|text: String| futures::future::ok::<_, LinkError>(Message::Text(text.into())));

        let stream = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        warn!("Dropping non-UTF-8 binary frame ({} bytes)", bytes.len());
                        None
                    }
                },
                // Ping/pong are answered by tungstenite; close ends the stream
                Ok(_) => None,
                Err(e) => Some(Err(LinkError::transport(e))),
            }
        });

        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}
