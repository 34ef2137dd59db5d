//! Browser stand-ins.
//!
//! `HubClient` connects a control socket, plays the impolite side of the
//! memory peer connection the hub created for it, and opens the
//! `pointers` data channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerpoint_core::transport::memory::MemoryPeer;
use peerpoint_core::{
    ChannelEvent, ClientId, ControlFrame, DataChannel, Negotiator, PeerConnection, PeerEvent, Role,
    SignalMessage, SignalSink, Subscription, TransportError,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::TestServer;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Write half of a test control socket.
pub type WsWrite = SplitSink<Ws, Message>;
/// Read half of a test control socket.
pub type WsRead = SplitStream<Ws>;

/// Receive and parse one JSON text frame, with a timeout.
pub async fn recv_json(stream: &mut WsRead) -> Option<Value> {
    let msg = timeout(Duration::from_secs(5), stream.next())
        .await
        .ok()??
        .ok()?;

    match msg {
        Message::Text(text) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

/// Send one JSON text frame.
pub async fn send_json(sink: &mut WsWrite, value: &Value) {
    sink.send(Message::Text(value.to_string()))
        .await
        .expect("send failed");
}

/// Next text message on a data channel, skipping open notifications.
pub async fn next_data_message(events: &mut Subscription<ChannelEvent>) -> Option<String> {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv()).await.ok()??;
        match event {
            ChannelEvent::Message(text) => return Some(text),
            ChannelEvent::Open => continue,
            ChannelEvent::Close | ChannelEvent::Error(_) => return None,
        }
    }
}

struct WsSink {
    tx: mpsc::UnboundedSender<String>,
}

impl SignalSink for WsSink {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, message: &SignalMessage) -> Result<(), TransportError> {
        let text = message
            .encode()
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

/// A connected hub-mode client with an open data channel.
pub struct HubClient {
    /// Id assigned by the relay.
    pub id: ClientId,
    /// Browser-side peer connection.
    pub peer: Arc<MemoryPeer>,
    /// Browser-side data channel.
    pub channel: Arc<dyn DataChannel>,
    /// Events of `channel`.
    pub messages: Subscription<ChannelEvent>,
    /// Task driving negotiation; ends when the control socket closes.
    pub driver: JoinHandle<()>,
}

impl HubClient {
    /// Connect, negotiate and wait for the data channel to open.
    pub async fn connect(server: &TestServer) -> Self {
        let (ws, _) = connect_async(server.ws_url()).await.expect("Failed to connect");
        let (mut write, mut read) = ws.split();

        let welcome = recv_json(&mut read).await.expect("No welcome message");
        let id = ClientId::new(
            welcome["welcome"]["clientId"]
                .as_str()
                .expect("welcome carries a client id"),
        );
        let peer = server.client_peer(&id).await;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let mut peer_events = peer.events();
        let channel = peer
            .create_data_channel("pointers")
            .await
            .expect("data channel");
        let mut messages = channel.events();

        let driver_peer: Arc<dyn PeerConnection> = Arc::clone(&peer) as _;
        let sink = Arc::new(WsSink { tx: out_tx });
        let driver = tokio::spawn(async move {
            let mut negotiator = Negotiator::new(driver_peer, sink, Role::Impolite);
            loop {
                tokio::select! {
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(ControlFrame::Signal(envelope)) = ControlFrame::decode(&text) {
                                negotiator.handle_signal(envelope.message).await;
                            }
                        }
                        Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    Some(event) = peer_events.recv() => match event {
                        PeerEvent::NegotiationNeeded => {
                            let _ = negotiator.negotiation_needed().await;
                        }
                        PeerEvent::IceCandidate(candidate) => {
                            let _ = negotiator.local_candidate(candidate);
                        }
                        _ => {}
                    },
                }
            }
            writer.abort();
        });

        let opened = timeout(Duration::from_secs(5), messages.recv())
            .await
            .expect("timed out waiting for the data channel");
        assert_eq!(opened, Some(ChannelEvent::Open));

        Self {
            id,
            peer,
            channel,
            messages,
            driver,
        }
    }

    /// Send a text message on the data channel.
    pub async fn send(&self, text: &str) {
        self.channel.send_text(text).await.expect("data channel send");
    }
}
