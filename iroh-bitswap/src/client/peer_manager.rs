use std::{fmt::Debug, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

use crate::message::Entry;

use super::wantlist::SessionTrackedWantlist;

/// Sends changes out to the network as they get added to the wantlist
/// managed by the [`WantManager`](super::WantManager).
#[async_trait]
pub trait PeerHandler: Debug + Send + Sync + 'static {
    async fn connected(&self, peer: PeerId, initial_wants: SessionTrackedWantlist);
    async fn disconnected(&self, peer: PeerId);
    /// Delivers `entries` to `targets`, or to every connected peer if `targets` is empty.
    async fn send_message(&self, entries: Vec<Entry>, targets: Vec<PeerId>, from: u64);
}

/// Outgoing message queue for a single peer.
#[async_trait]
pub trait PeerQueue: Debug + Send + Sync + 'static {
    async fn add_message(&self, entries: Vec<Entry>, from: u64);
    async fn add_wantlist(&self, initial_wants: &SessionTrackedWantlist);
    fn startup(&mut self);
    fn shutdown(&self);
}

/// Creates the queue for a newly seen peer, bound to the given cancellation token.
pub trait PeerQueueFactory:
    Fn(&CancellationToken, PeerId) -> Box<dyn PeerQueue> + 'static + Sync + Send
{
}

impl<F: Fn(&CancellationToken, PeerId) -> Box<dyn PeerQueue> + 'static + Sync + Send>
    PeerQueueFactory for F
{
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Depth of the request queue, callers block once it is full.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config { queue_depth: 16 }
    }
}

/// Manages the set of connected peers and their message queues.
///
/// Queues are reference counted by the number of times a peer was reported connected,
/// and shut down once it has been reported disconnected as often.
#[derive(Debug, Clone)]
pub struct PeerManager {
    sender: mpsc::Sender<PeerMessage>,
    cancel: CancellationToken,
}

#[derive(Debug)]
enum PeerMessage {
    Connected {
        peer: PeerId,
        initial_wants: SessionTrackedWantlist,
    },
    Disconnected(PeerId),
    SendMessage {
        entries: Vec<Entry>,
        targets: Vec<PeerId>,
        from: u64,
    },
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
}

impl PeerManager {
    pub fn new<F>(cancel: &CancellationToken, config: Config, create_peer_queue: F) -> Self
    where
        F: PeerQueueFactory,
    {
        let cancel = cancel.child_token();
        let (sender, receiver) = mpsc::channel(config.queue_depth);
        let actor = PeerManagerActor {
            receiver,
            peer_queues: Default::default(),
            create_peer_queue: Arc::new(create_peer_queue),
            cancel: cancel.clone(),
        };
        tokio::task::spawn(actor.run().instrument(debug_span!("peer_manager")));

        PeerManager { sender, cancel }
    }

    /// Returns a list of peers this peer manager is managing.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (s, r) = oneshot::channel();
        if !self.send(PeerMessage::ConnectedPeers(s)).await {
            return Vec::new();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Vec::new(),
            peers = r => peers.unwrap_or_default(),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, message: PeerMessage) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.sender.send(message) => res.is_ok(),
        }
    }
}

#[async_trait]
impl PeerHandler for PeerManager {
    async fn connected(&self, peer: PeerId, initial_wants: SessionTrackedWantlist) {
        self.send(PeerMessage::Connected {
            peer,
            initial_wants,
        })
        .await;
    }

    async fn disconnected(&self, peer: PeerId) {
        self.send(PeerMessage::Disconnected(peer)).await;
    }

    async fn send_message(&self, entries: Vec<Entry>, targets: Vec<PeerId>, from: u64) {
        self.send(PeerMessage::SendMessage {
            entries,
            targets,
            from,
        })
        .await;
    }
}

#[derive(Debug)]
struct PeerQueueInstance {
    refcnt: usize,
    queue: Box<dyn PeerQueue>,
}

struct PeerManagerActor {
    receiver: mpsc::Receiver<PeerMessage>,
    peer_queues: AHashMap<PeerId, PeerQueueInstance>,
    create_peer_queue: Arc<dyn PeerQueueFactory>,
    cancel: CancellationToken,
}

impl PeerManagerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }
        }

        debug!("peer manager shutting down");
        for (_, instance) in self.peer_queues.drain() {
            instance.queue.shutdown();
        }
    }

    async fn handle_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::Connected {
                peer,
                initial_wants,
            } => {
                let instance = self.get_or_create(peer);
                if instance.refcnt == 0 {
                    instance.queue.add_wantlist(&initial_wants).await;
                }
                instance.refcnt += 1;
            }
            PeerMessage::Disconnected(peer) => {
                let Some(instance) = self.peer_queues.get_mut(&peer) else {
                    return;
                };
                instance.refcnt = instance.refcnt.saturating_sub(1);
                if instance.refcnt > 0 {
                    return;
                }
                if let Some(instance) = self.peer_queues.remove(&peer) {
                    debug!(%peer, "removing peer queue");
                    instance.queue.shutdown();
                }
            }
            PeerMessage::SendMessage {
                entries,
                targets,
                from,
            } => {
                if targets.is_empty() {
                    for instance in self.peer_queues.values() {
                        instance.queue.add_message(entries.clone(), from).await;
                    }
                } else {
                    for target in targets {
                        let instance = self.get_or_create(target);
                        instance.queue.add_message(entries.clone(), from).await;
                    }
                }
            }
            PeerMessage::ConnectedPeers(response) => {
                let _ = response.send(self.peer_queues.keys().copied().collect());
            }
        }
    }

    fn get_or_create(&mut self, peer: PeerId) -> &mut PeerQueueInstance {
        let create_peer_queue = &self.create_peer_queue;
        let cancel = &self.cancel;
        self.peer_queues.entry(peer).or_insert_with(|| {
            debug!(%peer, "creating peer queue");
            let mut queue = create_peer_queue(cancel, peer);
            queue.startup();
            PeerQueueInstance { refcnt: 0, queue }
        })
    }
}
