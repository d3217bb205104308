//! Authenticated WebSocket session shared by the market-data and order
//! connections: connect/disconnect, outbound sends, and the listener task
//! that dispatches inbound frames to a message processor.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::connection::processor::MessageProcessor;
use crate::errors::{Error, Result};

/// Consecutive listener errors tolerated before the session gives up
const MAX_LISTENER_ERRORS: u32 = 100;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A single long-lived WebSocket session
pub struct WsSession {
    name: String,
    connected: AtomicBool,
    last_message_ms: AtomicI64,
    writer: Mutex<Option<WsSink>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl WsSession {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            connected: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(0),
            writer: Mutex::new(None),
            listener: StdMutex::new(None),
        })
    }

    /// Open the socket and start the listener task. Blocks until the
    /// connection is established; the first failure is surfaced.
    pub async fn connect(self: &Arc<Self>, url: &str, processor: Arc<MessageProcessor>) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            info!("Session '{}' already connected", self.name);
            return Ok(());
        }

        info!("Session '{}' connecting to {}", self.name, url);
        let (stream, _response) = connect_async(url).await?;
        let (sink, source) = stream.split();

        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        let session = self.clone();
        let handle = tokio::spawn(async move {
            session.listen(source, processor).await;
        });
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("Session '{}' connected", self.name);
        Ok(())
    }

    async fn listen(self: Arc<Self>, mut source: WsSource, processor: Arc<MessageProcessor>) {
        let mut errors = 0u32;

        while self.connected.load(Ordering::SeqCst) {
            match source.next().await {
                Some(Ok(message)) => {
                    self.touch();
                    errors = 0;
                    match message {
                        Message::Ping(payload) => {
                            debug!("Session '{}' received PING", self.name);
                            // Payload bytes must be echoed back exactly
                            if let Err(e) = self.send_message(Message::Pong(payload)).await {
                                warn!("Session '{}' failed to send PONG: {}", self.name, e);
                            }
                        }
                        Message::Pong(_) => {
                            debug!("Session '{}' received PONG: ignored", self.name);
                        }
                        Message::Close(_) => {
                            error!("Session '{}': socket closed at source", self.name);
                            let _ = self.send_message(Message::Close(None)).await;
                            self.connected.store(false, Ordering::SeqCst);
                            break;
                        }
                        Message::Text(text) => self.dispatch(text.as_bytes(), &processor).await,
                        Message::Binary(bytes) => self.dispatch(&bytes, &processor).await,
                        Message::Frame(_) => {}
                    }
                }
                Some(Err(e)) => {
                    error!("Session '{}' read error: {}", self.name, e);
                    errors += 1;
                    if errors > MAX_LISTENER_ERRORS {
                        error!(
                            "Session '{}': too many listener errors ({}), giving up",
                            self.name, errors
                        );
                        break;
                    }
                }
                None => break,
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("Listener for session '{}' has stopped", self.name);
    }

    async fn dispatch(&self, payload: &[u8], processor: &MessageProcessor) {
        match serde_json::from_slice(payload) {
            Ok(value) => {
                if let Err(e) = processor.process(value).await {
                    error!(
                        "Session '{}' message processor error: {} [payload='{}']",
                        self.name,
                        e,
                        String::from_utf8_lossy(payload)
                    );
                }
            }
            Err(e) => {
                error!(
                    "Session '{}' dropped malformed message: {} [payload='{}']",
                    self.name,
                    e,
                    String::from_utf8_lossy(payload)
                );
            }
        }
    }

    /// Send a text frame
    pub async fn send_text(&self, payload: String) -> Result<()> {
        debug!("Session '{}' sending: {}", self.name, payload);
        self.send_message(Message::Text(payload)).await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => {
                sink.send(message).await?;
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    /// Close the socket and stop the listener task
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }

        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        info!("Session '{}' has disconnected", self.name);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Timestamp of the most recently received frame
    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_message_ms.load(Ordering::SeqCst);
        if ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(ms).single()
        }
    }

    fn touch(&self) {
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let session = WsSession::new("test");
        assert!(!session.is_connected());
        assert!(session.last_message_time().is_none());

        let result = session.send_text("{}".to_string()).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let session = WsSession::new("test");
        session.disconnect().await;
        session.disconnect().await;
        assert!(!session.is_connected());
    }
}
