//! In-memory implementations of the network capabilities, for tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use async_trait::async_trait;
use cid::{multihash::Multihash, Cid};
use futures::{stream::BoxStream, StreamExt};
use libp2p_identity::PeerId;

use crate::{
    error::Error,
    message::BitswapMessage,
    network::{MessageNetwork, MessageSender, PeerTagger, ProviderFinder},
};

/// Generates `n` random raw cids.
pub fn gen_cids(n: usize) -> Vec<Cid> {
    (0..n)
        .map(|_| {
            let digest: [u8; 32] = rand::random();
            let hash = Multihash::<64>::wrap(0x12, &digest).expect("digest fits");
            Cid::new_v1(0x55, hash)
        })
        .collect()
}

/// An in-memory network, connecting every registered peer to every other one.
#[derive(Debug, Default, Clone)]
pub struct VirtualNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    /// Registered peers, mapped to whether they are reachable.
    peers: AHashMap<PeerId, bool>,
    providers: AHashMap<Cid, Vec<PeerId>>,
    /// Messages received by each peer, with their sender.
    inboxes: AHashMap<PeerId, Vec<(PeerId, BitswapMessage)>>,
    connections: AHashSet<(PeerId, PeerId)>,
    senders_opened: usize,
    senders_closed: usize,
    senders_reset: usize,
}

impl VirtualNetwork {
    /// Registers `peer` and returns its view of the network.
    pub fn adapter(&self, peer: PeerId) -> Arc<NetworkClient> {
        self.add_peer(peer);
        Arc::new(NetworkClient {
            local: peer,
            network: self.clone(),
        })
    }

    /// Registers a peer that does not need its own adapter.
    pub fn add_peer(&self, peer: PeerId) {
        self.state().peers.insert(peer, true);
    }

    /// Changes whether dials and sends to `peer` succeed.
    pub fn set_reachable(&self, peer: PeerId, reachable: bool) {
        self.state().peers.insert(peer, reachable);
    }

    /// Announces `peer` as a provider of `cid`.
    pub fn provide(&self, cid: Cid, peer: PeerId) {
        self.state().providers.entry(cid).or_default().push(peer);
    }

    /// Messages delivered to `peer` so far, with their sender.
    pub fn received(&self, peer: &PeerId) -> Vec<(PeerId, BitswapMessage)> {
        self.state()
            .inboxes
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        let state = self.state();
        state.connections.contains(&(*a, *b)) || state.connections.contains(&(*b, *a))
    }

    pub fn senders_opened(&self) -> usize {
        self.state().senders_opened
    }

    pub fn senders_closed(&self) -> usize {
        self.state().senders_closed
    }

    pub fn senders_reset(&self) -> usize {
        self.state().senders_reset
    }

    fn check_reachable(&self, peer: &PeerId) -> Result<()> {
        match self.state().peers.get(peer) {
            Some(true) => Ok(()),
            Some(false) => Err(Error::Unreachable(*peer).into()),
            None => Err(Error::UnknownPeer(*peer).into()),
        }
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A single peer's view of a [`VirtualNetwork`].
#[derive(Debug)]
pub struct NetworkClient {
    local: PeerId,
    network: VirtualNetwork,
}

impl NetworkClient {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl MessageNetwork for NetworkClient {
    async fn connect_to(&self, peer: PeerId) -> Result<()> {
        self.network.check_reachable(&peer)?;
        self.network
            .state()
            .connections
            .insert((self.local, peer));
        Ok(())
    }

    async fn new_message_sender(&self, peer: PeerId) -> Result<Box<dyn MessageSender>> {
        self.network.check_reachable(&peer)?;
        self.network.state().senders_opened += 1;
        Ok(Box::new(VirtualSender {
            local: self.local,
            remote: peer,
            network: self.network.clone(),
        }))
    }
}

impl ProviderFinder for NetworkClient {
    fn find_providers_async(&self, cid: Cid) -> BoxStream<'static, PeerId> {
        let providers = self
            .network
            .state()
            .providers
            .get(&cid)
            .cloned()
            .unwrap_or_default();
        futures::stream::iter(providers).boxed()
    }
}

#[derive(Debug)]
struct VirtualSender {
    local: PeerId,
    remote: PeerId,
    network: VirtualNetwork,
}

#[async_trait]
impl MessageSender for VirtualSender {
    async fn send_msg(&mut self, message: &BitswapMessage) -> Result<()> {
        self.network.check_reachable(&self.remote)?;
        self.network
            .state()
            .inboxes
            .entry(self.remote)
            .or_default()
            .push((self.local, message.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.network.state().senders_closed += 1;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.network.state().senders_reset += 1;
        Ok(())
    }
}

/// Records connection manager tags.
#[derive(Debug, Default)]
pub struct TestTagger {
    tags: Mutex<AHashMap<(PeerId, String), usize>>,
}

impl TestTagger {
    pub fn is_tagged(&self, peer: &PeerId, tag: &str) -> bool {
        self.tags().contains_key(&(*peer, tag.to_string()))
    }

    /// All peers currently carrying `tag`.
    pub fn tagged_peers(&self, tag: &str) -> Vec<PeerId> {
        self.tags()
            .keys()
            .filter(|(_, t)| t == tag)
            .map(|(peer, _)| *peer)
            .collect()
    }

    fn tags(&self) -> MutexGuard<'_, AHashMap<(PeerId, String), usize>> {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerTagger for TestTagger {
    fn tag_peer(&self, peer: &PeerId, tag: &str, weight: usize) {
        self.tags().insert((*peer, tag.to_string()), weight);
    }

    fn untag_peer(&self, peer: &PeerId, tag: &str) {
        self.tags().remove(&(*peer, tag.to_string()));
    }
}
