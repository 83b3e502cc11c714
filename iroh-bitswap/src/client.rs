use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use cid::Cid;
use libp2p_identity::PeerId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    metrics::Metrics,
    network::{MessageNetwork, PeerTagger, ProviderFinder},
};

pub mod message_queue;
pub mod peer_manager;
pub mod session_peer_manager;
pub mod want_manager;
pub mod wantlist;

pub use self::message_queue::MessageQueue;
pub use self::peer_manager::{PeerHandler, PeerManager, PeerQueue, PeerQueueFactory};
pub use self::session_peer_manager::SessionPeerManager;
pub use self::want_manager::WantManager;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub want_manager: want_manager::Config,
    pub peer_manager: peer_manager::Config,
    pub message_queue: message_queue::Config,
    pub session_peer_manager: session_peer_manager::Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub wantlist: Vec<Cid>,
    pub peers: Vec<PeerId>,
}

/// The want side of bitswap.
///
/// Owns the global wantlist and a message queue per connected peer, and hands out
/// the per-session peer rankings.
#[derive(Debug)]
pub struct Client {
    config: Config,
    want_manager: WantManager,
    peer_manager: PeerManager,
    session_counter: AtomicU64,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Client {
    pub fn new(network: Arc<dyn MessageNetwork>, config: Config) -> Self {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Metrics::default());

        let queue_config = config.message_queue.clone();
        let queue_metrics = metrics.clone();
        let peer_manager = PeerManager::new(
            &cancel,
            config.peer_manager.clone(),
            move |cancel: &CancellationToken, peer: PeerId| {
                Box::new(MessageQueue::new(
                    cancel,
                    peer,
                    network.clone(),
                    queue_config.clone(),
                    queue_metrics.clone(),
                )) as Box<dyn PeerQueue>
            },
        );
        let want_manager = WantManager::new(
            &cancel,
            Arc::new(peer_manager.clone()),
            config.want_manager.clone(),
            metrics.clone(),
        );

        Client {
            config,
            want_manager,
            peer_manager,
            session_counter: AtomicU64::new(0),
            cancel,
            metrics,
        }
    }

    pub fn want_manager(&self) -> &WantManager {
        &self.want_manager
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Called by the network when a new peer connects.
    pub async fn peer_connected(&self, peer: PeerId) {
        debug!(%peer, "peer connected");
        self.want_manager.connected(peer).await;
    }

    /// Called by the network when a peer disconnects.
    pub async fn peer_disconnected(&self, peer: PeerId) {
        debug!(%peer, "peer disconnected");
        self.want_manager.disconnected(peer).await;
    }

    /// Allocates a new session id.
    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Creates the peer ranking for a new session.
    ///
    /// It stops when [`SessionPeerManager::stop`] is called, or when the client shuts down.
    pub fn new_session_peer_manager(
        &self,
        provider_finder: Arc<dyn ProviderFinder>,
        tagger: Arc<dyn PeerTagger>,
    ) -> SessionPeerManager {
        let id = self.next_session_id();
        debug!(session = id, "new session");
        SessionPeerManager::new(
            &self.cancel,
            id,
            provider_finder,
            tagger,
            self.config.session_peer_manager.clone(),
            self.metrics.clone(),
        )
    }

    pub async fn stat(&self) -> Stat {
        let wantlist = self
            .want_manager
            .current_wants()
            .await
            .into_iter()
            .map(|e| e.cid)
            .collect();
        let peers = self.peer_manager.connected_peers().await;
        Stat { wantlist, peers }
    }

    /// Stops all components.
    ///
    /// Open message senders are reset, use [`Client::peer_disconnected`] to close them
    /// gracefully.
    pub fn shutdown(&self) {
        debug!("shutting down client");
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}
