use crate::config::TransportConfig;
use crate::{TransportError, ABNORMAL_CLOSE};

use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;

/// A frame handed to the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Send a close frame with this code and stop writing.
    Close(u16),
}

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame from the manager.
    Text(String),
    /// The link is gone. `code` is the peer's close code, or
    /// [`ABNORMAL_CLOSE`] if the socket dropped without one.
    Closed { code: u16 },
}

/// Write half of a link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Frame>,
    max_message_size: usize,
}

impl LinkSender {
    /// Queue a text frame, waiting for buffer space.
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.check_size(&text)?;
        self.tx
            .send(Frame::Text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a text frame without waiting. Fails if the writer is gone or
    /// its buffer is full.
    pub fn try_send_text(&self, text: String) -> Result<(), TransportError> {
        self.check_size(&text)?;
        self.tx.try_send(Frame::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Send(anyhow::anyhow!("outbound buffer full"))
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Ask the writer to send a close frame and stop.
    pub fn try_close(&self, code: u16) -> Result<(), TransportError> {
        self.tx
            .try_send(Frame::Close(code))
            .map_err(|_| TransportError::Closed)
    }

    /// Whether the writer task is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn check_size(&self, text: &str) -> Result<(), TransportError> {
        if text.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: text.len(),
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

/// An established link: write half plus the inbound event stream.
#[derive(Debug)]
pub struct Link {
    pub sender: LinkSender,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// The far side of an in-process link created by [`Link::channel`].
#[derive(Debug)]
pub struct RemoteEnd {
    /// Frames the local side sent.
    pub frames: mpsc::Receiver<Frame>,
    /// Feed events to the local side.
    pub events: mpsc::Sender<TransportEvent>,
}

impl Link {
    /// Create an in-process link backed by channels only.
    ///
    /// Used for simulated managers and tests: whatever the local side sends
    /// shows up on `RemoteEnd::frames`, whatever is pushed into
    /// `RemoteEnd::events` is received locally.
    pub fn channel(buffer: usize, max_message_size: usize) -> (Link, RemoteEnd) {
        let (frame_tx, frame_rx) = mpsc::channel(buffer);
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let link = Link {
            sender: LinkSender {
                tx: frame_tx,
                max_message_size,
            },
            events: event_rx,
        };
        let remote = RemoteEnd {
            frames: frame_rx,
            events: event_tx,
        };
        (link, remote)
    }
}

/// Open a WebSocket link to the manager.
///
/// Performs the handshake (bounded by the configured connect timeout), then
/// spawns one writer task and one reader task. Dropping every
/// [`LinkSender`] clone closes the socket.
pub async fn connect(config: &TransportConfig) -> Result<Link, TransportError> {
    let endpoint = config.endpoint()?;
    let connect_err = |source: anyhow::Error| TransportError::Connect {
        endpoint: endpoint.to_string(),
        source,
    };

    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| connect_err(e.into()))?;
    let auth = HeaderValue::from_str(&config.authorization())
        .map_err(|e| TransportError::Config(format!("credentials not header-safe: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, auth);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);

    let handshake = tokio_tungstenite::connect_async_with_config(request, Some(ws_config), true);
    let (stream, _response) = tokio::time::timeout(config.connect_timeout, handshake)
        .await
        .map_err(|_| connect_err(anyhow::anyhow!("handshake timed out")))?
        .map_err(|e| connect_err(e.into()))?;

    tracing::debug!("websocket handshake with {endpoint} complete");

    let (mut sink, mut stream) = stream.split();
    let (frame_tx, mut frame_rx) = mpsc::channel(config.outbound_buffer);
    let (events_tx, events_rx) = mpsc::channel(config.inbound_buffer);

    // Writer: drain frames into the socket until a close frame or error.
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match frame {
                Frame::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!("websocket write failed: {e}");
                        break;
                    }
                }
                Frame::Close(code) => {
                    let close = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Borrowed(""),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(close))).await {
                        tracing::debug!("websocket close failed: {e}");
                    }
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    // Reader: forward text frames, report the close code once.
    tokio::spawn(async move {
        let code = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if events_tx.send(TransportEvent::Text(text)).await.is_err() {
                        break ABNORMAL_CLOSE;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if events_tx.send(TransportEvent::Text(text)).await.is_err() {
                            break ABNORMAL_CLOSE;
                        }
                    }
                    Err(_) => tracing::warn!("dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|f| u16::from(f.code)).unwrap_or(ABNORMAL_CLOSE);
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    tracing::debug!("websocket read failed: {e}");
                    break ABNORMAL_CLOSE;
                }
                None => break ABNORMAL_CLOSE,
            }
        };
        let _ = events_tx.send(TransportEvent::Closed { code }).await;
    });

    Ok(Link {
        sender: LinkSender {
            tx: frame_tx,
            max_message_size: config.max_message_size,
        },
        events: events_rx,
    })
}
