//! Persistent command channel to the remote connection service.
//!
//! One authenticated websocket per broker. Outbound traffic is
//! fire-and-forget: frames are queued to a writer task and written in call
//! order, with no acknowledgment, retry, or backpressure. Inbound frames are
//! parsed into [`InboundMessage`] and handed to an [`InboundHandler`].
//! [`RemoteChannel::close`] flushes the queue before the socket goes away;
//! dropping the channel without it discards unwritten frames.
//!
//! ```text
//! caller ── send() ──► mpsc (unbounded) ──► writer task ──► websocket
//! websocket ──► reader task ──► InboundMessage ──► InboundHandler
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound frame: a command addressed to one remote connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub client_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: serde_json::Value,
}

impl CommandFrame {
    pub fn new(client_id: impl Into<String>, kind: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            client_id: client_id.into(),
            kind: kind.into(),
            content,
        }
    }
}

/// Everything the channel can deliver to its handler.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A JSON frame from the service, optionally about one connection.
    Event {
        client_id: Option<String>,
        kind: Option<String>,
        content: serde_json::Value,
    },
    /// A text or binary frame that is not a JSON object.
    Unrecognized(String),
    /// Transport error after the channel was open.
    Error(String),
    /// The service closed the channel, or the stream ended.
    Closed,
}

impl InboundMessage {
    /// Classify a text frame.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Object(mut obj)) => {
                let client_id = obj
                    .remove("client_id")
                    .and_then(|v| v.as_str().map(str::to_string));
                let kind = obj.remove("type").and_then(|v| v.as_str().map(str::to_string));
                let content = obj
                    .remove("content")
                    .unwrap_or(serde_json::Value::Object(obj));
                InboundMessage::Event {
                    client_id,
                    kind,
                    content,
                }
            }
            _ => InboundMessage::Unrecognized(text.to_string()),
        }
    }
}

/// Receives inbound channel traffic. Runs on the channel's reader task, so
/// implementations should not block.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_message(&self, message: InboundMessage);
}

/// Default handler: logs every inbound message and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl InboundHandler for LogHandler {
    fn on_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::Event {
                client_id,
                kind,
                content,
            } => {
                tracing::debug!(
                    client_id = client_id.as_deref().unwrap_or("-"),
                    kind = kind.as_deref().unwrap_or("-"),
                    %content,
                    "Got message"
                );
            }
            InboundMessage::Unrecognized(raw) => tracing::debug!(%raw, "Got unrecognized frame"),
            InboundMessage::Error(error) => tracing::error!(%error, "Remote channel error"),
            InboundMessage::Closed => tracing::warn!("Remote channel closed"),
        }
    }
}

pub struct RemoteChannel {
    /// Taken by `close()`; the writer drains the queue once it is gone.
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteChannel {
    /// Connect the websocket. Resolves on the first successful open and
    /// fails on the first error before it; later errors go to `handler`.
    pub async fn open(config: &RemoteConfig, handler: Arc<dyn InboundHandler>) -> Result<Self> {
        let url = config.channel_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(RemoteError::ChannelOpen)?;
        let mut auth = HeaderValue::from_str(&config.bearer())
            .map_err(|_| RemoteError::InvalidConfig("access token is not a valid header value".into()))?;
        auth.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws, _response) = connect_async(request)
            .await
            .map_err(RemoteError::ChannelOpen)?;
        tracing::info!(%url, "Connected to remote channel");

        Ok(Self::from_stream(ws, handler))
    }

    fn from_stream(ws: WsStream, handler: Arc<dyn InboundHandler>) -> Self {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(writer_loop(sink, rx));
        let reader = tokio::spawn(reader_loop(stream, handler, open.clone()));

        Self {
            tx: Mutex::new(Some(tx)),
            open,
            reader,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Queue one frame. Returns once the frame is queued, not once written.
    ///
    /// Fails with `ChannelClosed` once the service closed the connection or
    /// `close()` was called.
    pub fn send(&self, frame: &CommandFrame) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RemoteError::ChannelClosed);
        }
        let text = serde_json::to_string(frame)?;
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(RemoteError::ChannelClosed)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| RemoteError::ChannelClosed)
    }

    /// Whether the reader still sees an open connection.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Write every queued frame, send a close frame, and stop both tasks.
    pub async fn close(&self) {
        self.open.store(false, Ordering::Release);
        drop(self.tx.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!(error = %e, "Remote channel writer did not finish cleanly");
            }
        }
        self.reader.abort();
        tracing::info!("Remote channel closed");
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
    }
}

async fn writer_loop(
    mut sink: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            tracing::error!(error = %e, "Remote channel write failed, dropping outbound frames");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn reader_loop(
    mut stream: futures::stream::SplitStream<WsStream>,
    handler: Arc<dyn InboundHandler>,
    open: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handler.on_message(InboundMessage::parse(text.as_str())),
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                handler.on_message(InboundMessage::parse(&text));
            }
            Ok(Message::Close(_)) => break,
            // Ping/Pong/Frame: tungstenite answers pings itself
            Ok(_) => {}
            Err(e) => {
                handler.on_message(InboundMessage::Error(e.to_string()));
                break;
            }
        }
    }
    open.store(false, Ordering::Release);
    handler.on_message(InboundMessage::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wire_shape() {
        let frame = CommandFrame::new(
            "c1",
            "joinchannel",
            serde_json::json!({"channel": "#rust", "key": null}),
        );
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "client_id": "c1",
                "type": "joinchannel",
                "content": {"channel": "#rust", "key": null},
            })
        );
    }

    #[test]
    fn parse_event_frame() {
        let msg = InboundMessage::parse(r##"{"client_id":"c1","type":"join","content":{"channel":"#a"}}"##);
        assert_eq!(
            msg,
            InboundMessage::Event {
                client_id: Some("c1".into()),
                kind: Some("join".into()),
                content: serde_json::json!({"channel": "#a"}),
            }
        );
    }

    #[test]
    fn parse_frame_without_content_keeps_remaining_fields() {
        let msg = InboundMessage::parse(r#"{"type":"pong","ts":5}"#);
        assert_eq!(
            msg,
            InboundMessage::Event {
                client_id: None,
                kind: Some("pong".into()),
                content: serde_json::json!({"ts": 5}),
            }
        );
    }

    #[test]
    fn parse_non_object() {
        assert_eq!(InboundMessage::parse("hello"), InboundMessage::Unrecognized("hello".into()));
        assert_eq!(InboundMessage::parse("[1,2]"), InboundMessage::Unrecognized("[1,2]".into()));
    }
}
