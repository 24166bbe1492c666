//! WebSocket client for the relay.
//!
//! One connection per client carries every joined file. Outgoing envelopes
//! go through a bounded queue drained by a writer task; emission never
//! blocks, so a full or closed queue degrades the caller to local-only
//! editing. There is no offline queue: edits made while disconnected stay
//! local until the file is reloaded.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Envelope, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered to the application.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    Message(Envelope),
}

/// Non-blocking outlet for envelopes bound for the relay.
pub trait RelaySink: Send + Sync {
    fn emit(&self, envelope: Envelope) -> Result<(), ProtocolError>;
}

impl<T: RelaySink + ?Sized> RelaySink for Arc<T> {
    fn emit(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        (**self).emit(envelope)
    }
}

/// In-process sink, for embedding a session without a socket.
impl RelaySink for mpsc::UnboundedSender<Envelope> {
    fn emit(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.send(envelope).map_err(|_| ProtocolError::ConnectionClosed)
    }
}

pub struct RelayClient {
    user_id: Uuid,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Feeds the writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
    event_tx: mpsc::Sender<RelayEvent>,
    queue_capacity: usize,
}

impl RelayClient {
    pub fn new(user_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::with_capacity(user_id, server_url, 1024)
    }

    pub fn with_capacity(user_id: Uuid, server_url: impl Into<String>, queue_capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            user_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            queue_capacity,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Relay connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.queue_capacity);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;
        log::info!("Connected to relay {} as {}", self.server_url, self.user_id);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Envelope::decode(&data) {
                        Ok(envelope) => {
                            if event_tx.send(RelayEvent::Message(envelope)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
            log::info!("Relay connection closed");
        });

        Ok(())
    }

    /// Close the socket once queued frames are written.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl RelaySink for RelayClient {
    fn emit(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.try_send(envelope.encode()?).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProtocolError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }
}
