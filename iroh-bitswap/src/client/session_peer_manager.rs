use std::{collections::VecDeque, sync::Arc};

use ahash::AHashMap;
use anyhow::{Context, Result};
use cid::Cid;
use futures::StreamExt;
use libp2p_identity::PeerId;
use rand::seq::SliceRandom;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, Instrument};

use crate::{
    metrics::Metrics,
    network::{PeerTagger, ProviderFinder},
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Depth of the request queue, callers block once it is full.
    pub queue_depth: usize,
    /// Upper bound for the number of peers returned by
    /// [`SessionPeerManager::get_optimized_peers`].
    pub max_optimized_peers: usize,
    /// Slots kept free for unoptimized peers, the optimized list holds at most
    /// `max_optimized_peers - reserve_peers` entries.
    pub reserve_peers: usize,
    /// Weight of the connection manager tag applied to session peers.
    pub tag_value: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_depth: 16,
            max_optimized_peers: 32,
            reserve_peers: 2,
            tag_value: 10,
        }
    }
}

/// Tracks the peers of a single session and ranks them by how useful they were.
///
/// Peers that responded to a want are "optimized", most recent responders first.
/// Peers found through provider lookups, and responders pushed out of the capped
/// optimized list, are kept as unoptimized candidates.
#[derive(Debug)]
pub struct SessionPeerManager {
    id: u64,
    tag: String,
    sender: mpsc::Sender<PeerMessage>,
    provider_finder: Arc<dyn ProviderFinder>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    metrics: Arc<Metrics>,
}

#[derive(Debug)]
enum PeerMessage {
    PeerFound(PeerId),
    PeerResponse(PeerId),
    GetOptimizedPeers(oneshot::Sender<Vec<PeerId>>),
    #[cfg(test)]
    GetState(oneshot::Sender<State>),
}

#[cfg(test)]
#[derive(Debug)]
struct State {
    optimized: Vec<PeerId>,
    unoptimized: Vec<PeerId>,
    active: AHashMap<PeerId, bool>,
}

impl SessionPeerManager {
    pub fn new(
        cancel: &CancellationToken,
        id: u64,
        provider_finder: Arc<dyn ProviderFinder>,
        tagger: Arc<dyn PeerTagger>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cancel = cancel.child_token();
        let tag = format!("bs-ses-{id}");
        let (sender, receiver) = mpsc::channel(config.queue_depth);
        let optimized_cap = config
            .max_optimized_peers
            .saturating_sub(config.reserve_peers)
            .max(1);

        let actor = SessionPeerManagerActor {
            tag: tag.clone(),
            optimized_cap,
            config,
            tagger,
            active_peers: Default::default(),
            unoptimized_peers: Default::default(),
            optimized_peers: Default::default(),
            receiver,
            cancel: cancel.clone(),
            metrics: metrics.clone(),
        };
        let worker =
            tokio::task::spawn(actor.run().instrument(debug_span!("session_peer_manager", session = id)));

        SessionPeerManager {
            id,
            tag,
            sender,
            provider_finder,
            cancel,
            worker,
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection manager tag applied to the peers of this session.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Records that `peer` sent us blocks we wanted, promoting it to the head of the
    /// optimized peers.
    pub async fn record_peer_response(&self, peer: PeerId, cids: &[Cid]) {
        trace!(session = self.id, %peer, "peer responded with {} blocks", cids.len());
        self.send(PeerMessage::PeerResponse(peer)).await;
    }

    /// Records that wants were sent to `peers`.
    ///
    /// Requests do not change the ranking, only responses do.
    pub fn record_peer_requests(&self, _peers: &[PeerId], _cids: &[Cid]) {}

    /// Returns the optimized peers, best first, followed by a random sample of the
    /// unoptimized ones.
    pub async fn get_optimized_peers(&self) -> Vec<PeerId> {
        let (s, r) = oneshot::channel();
        if !self.send(PeerMessage::GetOptimizedPeers(s)).await {
            return Vec::new();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Vec::new(),
            res = r => res.unwrap_or_default(),
        }
    }

    /// Starts a provider lookup for `cid`, feeding every found provider into the
    /// session.
    ///
    /// The lookup stops when it is exhausted, when `cancel` is cancelled, or when the
    /// session stops.
    pub fn find_more_peers(&self, cancel: &CancellationToken, cid: Cid) {
        let mut providers = self.provider_finder.find_providers_async(cid);
        let sender = self.sender.clone();
        let session_cancel = self.cancel.clone();
        let cancel = cancel.clone();
        let metrics = self.metrics.clone();

        tokio::task::spawn(
            async move {
                loop {
                    let peer = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = session_cancel.cancelled() => break,
                        peer = providers.next() => match peer {
                            Some(peer) => peer,
                            None => break,
                        },
                    };
                    metrics.providers_found.inc();
                    trace!(%peer, "found provider");

                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        _ = session_cancel.cancelled() => false,
                        res = sender.send(PeerMessage::PeerFound(peer)) => res.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                }
                debug!("provider lookup finished");
            }
            .instrument(debug_span!("find_more_peers", session = self.id, %cid)),
        );
    }

    /// Stops the session, untagging all of its peers.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.worker
            .await
            .with_context(|| format!("session peer manager {} failed", self.id))?;
        Ok(())
    }

    async fn send(&self, message: PeerMessage) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.sender.send(message) => res.is_ok(),
        }
    }

    #[cfg(test)]
    async fn state(&self) -> State {
        let (s, r) = oneshot::channel();
        assert!(self.send(PeerMessage::GetState(s)).await);
        r.await.unwrap()
    }
}

#[derive(Debug)]
struct SessionPeerManagerActor {
    tag: String,
    optimized_cap: usize,
    config: Config,
    tagger: Arc<dyn PeerTagger>,
    /// All peers of the session, mapped to whether they are optimized.
    active_peers: AHashMap<PeerId, bool>,
    unoptimized_peers: Vec<PeerId>,
    /// Most recent responder first.
    optimized_peers: VecDeque<PeerId>,
    receiver: mpsc::Receiver<PeerMessage>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl SessionPeerManagerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                }
            }
        }
        self.shutdown();
    }

    fn handle_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::PeerFound(peer) => self.peer_found(peer),
            PeerMessage::PeerResponse(peer) => self.peer_response(peer),
            PeerMessage::GetOptimizedPeers(response) => {
                let _ = response.send(self.optimized_peers());
            }
            #[cfg(test)]
            PeerMessage::GetState(response) => {
                let _ = response.send(State {
                    optimized: self.optimized_peers.iter().copied().collect(),
                    unoptimized: self.unoptimized_peers.clone(),
                    active: self.active_peers.clone(),
                });
            }
        }
    }

    fn peer_found(&mut self, peer: PeerId) {
        if self.active_peers.contains_key(&peer) {
            return;
        }
        self.active_peers.insert(peer, false);
        self.unoptimized_peers.push(peer);
        self.tag_peer(&peer);
    }

    fn peer_response(&mut self, peer: PeerId) {
        match self.active_peers.get(&peer).copied() {
            Some(true) => {
                if let Some(pos) = self.optimized_peers.iter().position(|p| *p == peer) {
                    self.optimized_peers.remove(pos);
                }
            }
            Some(false) => {
                if let Some(pos) = self.unoptimized_peers.iter().position(|p| *p == peer) {
                    self.unoptimized_peers.swap_remove(pos);
                }
                self.active_peers.insert(peer, true);
            }
            None => {
                self.active_peers.insert(peer, true);
                self.tag_peer(&peer);
            }
        }

        if self.optimized_peers.len() >= self.optimized_cap {
            if let Some(tail) = self.optimized_peers.pop_back() {
                trace!(peer = %tail, "demoting peer");
                self.unoptimized_peers.push(tail);
                self.active_peers.insert(tail, false);
            }
        }
        self.optimized_peers.push_front(peer);
        self.metrics.session_peers_promoted.inc();
    }

    fn optimized_peers(&self) -> Vec<PeerId> {
        let extra = self
            .config
            .max_optimized_peers
            .saturating_sub(self.optimized_peers.len())
            .min(self.unoptimized_peers.len());

        let mut peers = Vec::with_capacity(self.optimized_peers.len() + extra);
        peers.extend(self.optimized_peers.iter().copied());
        peers.extend(
            self.unoptimized_peers
                .choose_multiple(&mut rand::thread_rng(), extra)
                .copied(),
        );
        peers
    }

    fn tag_peer(&self, peer: &PeerId) {
        self.tagger.tag_peer(peer, &self.tag, self.config.tag_value);
        self.metrics.session_peers_tagged.inc();
    }

    fn shutdown(&mut self) {
        debug!("untagging {} peers", self.active_peers.len());
        for peer in self.active_peers.keys() {
            self.tagger.untag_peer(peer, &self.tag);
        }
    }
}
