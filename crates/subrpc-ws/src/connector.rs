//! Socket boundary: anything that can be opened, written to, read from and
//! closed as a stream of text frames.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use subrpc_core::TransportError;

/// Outbound half of a connection.
pub type WsSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a connection. The stream ends when the socket closes.
pub type WsStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open duplex connection.
pub struct Connection {
    pub sink: WsSink,
    pub stream: WsStream,
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(
        &self,
        endpoint: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Connection, TransportError>;
}

/// Parse configured headers into typed pairs.
pub(crate) fn header_pairs(
    headers: &HashMap<String, String>,
) -> Result<Vec<(HeaderName, HeaderValue)>, TransportError> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Config(format!("header value for {name}: {e}")))?;
            Ok((name, value))
        })
        .collect()
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(
        &self,
        endpoint: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Connection, TransportError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::Config(format!("{endpoint}: {e}")))?;
        for (name, value) in header_pairs(headers)? {
            request.headers_mut().insert(name, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));

        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(String::from_utf8(bytes).map_err(|e| {
                    TransportError::Protocol(format!("binary frame is not UTF-8: {e}"))
                })),
                // ping/pong are answered by tungstenite; close ends the stream
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
