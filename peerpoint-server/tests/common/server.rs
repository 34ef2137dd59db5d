//! Test server harness.
//!
//! Spins up the real relay router on a random port, in either mode. Hub
//! mode uses the in-memory peer factory so tests can play the browser side
//! of each peer connection.

use std::net::SocketAddr;
use std::sync::Arc;

use peerpoint_core::transport::memory::{MemoryPeer, MemoryPeerFactory};
use peerpoint_core::ClientId;
use peerpoint_server::{routes, AppState, RelayLimits, RelayState};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

type Remotes = mpsc::UnboundedReceiver<(ClientId, Arc<MemoryPeer>)>;

/// A running relay with control handles.
pub struct TestServer {
    addr: SocketAddr,
    relay: RelayState,
    factory: Option<Arc<MemoryPeerFactory>>,
    remotes: Mutex<(Option<Remotes>, Vec<(ClientId, Arc<MemoryPeer>)>)>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start a forward-mode relay.
    pub async fn start_forward() -> Self {
        Self::start_forward_with(RelayLimits::default()).await
    }

    /// Start a forward-mode relay with custom limits.
    pub async fn start_forward_with(limits: RelayLimits) -> Self {
        Self::start(RelayState::forward(limits), None).await
    }

    /// Start a hub-mode relay backed by memory peers.
    pub async fn start_hub() -> Self {
        let factory = Arc::new(MemoryPeerFactory::new());
        let relay = RelayState::hub(Arc::clone(&factory) as _, RelayLimits::default());
        Self::start(relay, Some(factory)).await
    }

    async fn start(relay: RelayState, factory: Option<Arc<MemoryPeerFactory>>) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let app = routes::router(AppState::new(relay.clone()));

        let listener = TcpListener::bind(addr).await.expect("failed to bind");
        let actual_addr = listener.local_addr().expect("failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        let remotes = factory.as_ref().and_then(|f| f.take_remotes());
        Self {
            addr: actual_addr,
            relay,
            factory,
            remotes: Mutex::new((remotes, Vec::new())),
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Control socket URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Plain HTTP URL for `path`.
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Relay state, for assertions.
    pub fn relay(&self) -> &RelayState {
        &self.relay
    }

    /// Memory peer factory (hub mode only).
    pub fn factory(&self) -> &MemoryPeerFactory {
        self.factory.as_deref().expect("not a hub-mode server")
    }

    /// The browser-side memory peer created for `client`.
    pub async fn client_peer(&self, client: &ClientId) -> Arc<MemoryPeer> {
        let mut guard = self.remotes.lock().await;
        let (remotes, stash) = &mut *guard;
        if let Some(pos) = stash.iter().position(|(id, _)| id == client) {
            return stash.swap_remove(pos).1;
        }
        let remotes = remotes.as_mut().expect("not a hub-mode server");
        loop {
            let (id, peer) = tokio::time::timeout(std::time::Duration::from_secs(5), remotes.recv())
                .await
                .expect("timed out waiting for client peer")
                .expect("factory dropped");
            if &id == client {
                return peer;
            }
            stash.push((id, peer));
        }
    }

    /// Gracefully shut down the server.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.relay.registry().shutdown().await;
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), self.handle).await;
    }
}
