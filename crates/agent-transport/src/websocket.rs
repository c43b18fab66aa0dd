//! A single-shot WebSocket [`Transport`] (spec §4.A): dials once, moves
//! bytes, and never reconnects internally — reconnect policy lives one layer
//! up, in a Connection Manager.

use std::sync::Mutex as StdMutex;

use agent_core::error::TransportError;
use agent_core::transport::{CloseReason, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Extra request metadata the Connection Manager attaches before dialing —
/// every WebSocket hub connect in this system carries a bearer token plus
/// `message`/`signature` query parameters (spec §6).
#[derive(Debug, Clone, Default)]
pub struct WsDialOptions {
    pub bearer_token: Option<String>,
}

/// A single WebSocket connection, split into independently lockable
/// send/receive halves.
pub struct WsTransport {
    tx: Mutex<WsSink>,
    rx: Mutex<WsSource>,
    done: CancellationToken,
    close_reason: StdMutex<Option<CloseReason>>,
}

impl WsTransport {
    /// Dials `url` once. Does not retry; a failed dial is a terminal error
    /// for this transport instance.
    pub async fn dial(url: &str, options: WsDialOptions) -> Result<Self, TransportError> {
        let mut request = url.into_client_request().map_err(|e| TransportError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(token) = options.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| TransportError::ConnectionFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            request.headers_mut().insert("Authorization", value);
        }

        info!(url, "dialing websocket transport");
        let (stream, _response) = connect_async(request).await.map_err(|e| TransportError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = stream.split();
        Ok(Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            done: CancellationToken::new(),
            close_reason: StdMutex::new(None),
        })
    }

    fn mark_done(&self, reason: CloseReason) {
        *self.close_reason.lock().expect("close_reason mutex poisoned") = Some(reason);
        self.done.cancel();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.done.is_cancelled() {
            return Err(TransportError::Closed("websocket transport already closed".into()));
        }
        let message = Message::Binary(data.to_vec().into());
        let mut tx = self.tx.lock().await;
        tx.send(message).await.map_err(|e| {
            let reason = e.to_string();
            self.mark_done(CloseReason::Error(reason.clone()));
            TransportError::Io(reason)
        })
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        if self.done.is_cancelled() {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Ok(None),
            next = rx.next() => match next {
                Some(Ok(Message::Binary(data))) => Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => Ok(Some(Bytes::from(text.as_bytes().to_vec()))),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(Some(Bytes::new())),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    warn!(reason, "websocket closed by peer");
                    self.mark_done(CloseReason::PeerClosed);
                    Ok(None)
                }
                Some(Err(e)) => {
                    let reason = e.to_string();
                    self.mark_done(CloseReason::Error(reason.clone()));
                    Err(TransportError::Io(reason))
                }
                None => {
                    self.mark_done(CloseReason::PeerClosed);
                    Ok(None)
                }
            },
        }
    }

    fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().expect("close_reason mutex poisoned").clone()
    }

    async fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        let mut tx = self.tx.lock().await;
        let _ = tx.close().await;
        self.mark_done(CloseReason::LocalClosed);
    }
}
