use std::sync::Arc;

use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, Instrument};

use crate::{
    message::{Entry, Priority},
    metrics::Metrics,
};

use super::{
    peer_manager::PeerHandler,
    wantlist::{self, SessionTrackedWantlist},
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Depth of the request queue, callers block once it is full.
    pub queue_depth: usize,
    /// Priority of the first entry in a batch, following entries count down from here.
    pub max_priority: Priority,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_depth: 16,
            max_priority: i32::MAX,
        }
    }
}

/// Manages the global wantlist.
///
/// Tracks two lists, one with all wants, and one with the wants that are broadcast
/// to every connected peer. Changes are forwarded to a [`PeerHandler`].
///
/// All requests are processed serially, in the order they arrive, by a single actor task.
#[derive(Debug, Clone)]
pub struct WantManager {
    sender: mpsc::Sender<WantMessage>,
    cancel: CancellationToken,
    max_priority: Priority,
}

#[derive(Debug)]
enum WantMessage {
    WantSet {
        entries: Vec<Entry>,
        targets: Vec<PeerId>,
        from: u64,
    },
    IsWanted {
        cid: Cid,
        response: oneshot::Sender<bool>,
    },
    CurrentWants {
        response: oneshot::Sender<Vec<wantlist::Entry>>,
    },
    CurrentBroadcastWants {
        response: oneshot::Sender<Vec<wantlist::Entry>>,
    },
    WantCount {
        response: oneshot::Sender<usize>,
    },
    Connected(PeerId),
    Disconnected(PeerId),
}

impl WantManager {
    /// Starts a want manager, which stops once `cancel` is cancelled.
    pub fn new(
        cancel: &CancellationToken,
        peer_handler: Arc<dyn PeerHandler>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cancel = cancel.child_token();
        let (sender, receiver) = mpsc::channel(config.queue_depth);
        let actor = WantManagerActor {
            receiver,
            wantlist: Default::default(),
            broadcast_wantlist: Default::default(),
            peer_handler,
            metrics,
            cancel: cancel.clone(),
        };
        tokio::task::spawn(actor.run().instrument(debug_span!("want_manager")));

        WantManager {
            sender,
            cancel,
            max_priority: config.max_priority,
        }
    }

    /// Adds the given cids to the wantlist, tracked by the given session.
    ///
    /// An empty `peers` list broadcasts the wants to all connected peers.
    pub async fn want_blocks(&self, cids: &[Cid], peers: &[PeerId], session: u64) {
        debug!(session, "want blocks: {}", cids.len());
        self.add_entries(cids, peers, false, session).await;
    }

    /// Removes the given cids from the wantlist, tracked by the given session.
    pub async fn cancel_wants(&self, cids: &[Cid], peers: &[PeerId], session: u64) {
        debug!(session, "cancel wants: {}", cids.len());
        self.add_entries(cids, peers, true, session).await;
    }

    /// Returns whether the cid is currently wanted by any session.
    pub async fn is_wanted(&self, cid: &Cid) -> bool {
        let cid = *cid;
        self.request(|response| WantMessage::IsWanted { cid, response })
            .await
            .unwrap_or_default()
    }

    /// Returns the list of current wants.
    pub async fn current_wants(&self) -> Vec<wantlist::Entry> {
        self.request(|response| WantMessage::CurrentWants { response })
            .await
            .unwrap_or_default()
    }

    /// Returns the current list of wants that are broadcast to all peers.
    pub async fn current_broadcast_wants(&self) -> Vec<wantlist::Entry> {
        self.request(|response| WantMessage::CurrentBroadcastWants { response })
            .await
            .unwrap_or_default()
    }

    /// Returns the total number of wanted cids.
    pub async fn want_count(&self) -> usize {
        self.request(|response| WantMessage::WantCount { response })
            .await
            .unwrap_or_default()
    }

    /// Called when a new peer connects, it gets sent the broadcast wantlist.
    pub async fn connected(&self, peer: PeerId) {
        self.send(WantMessage::Connected(peer)).await;
    }

    /// Called when a peer disconnects.
    pub async fn disconnected(&self, peer: PeerId) {
        self.send(WantMessage::Disconnected(peer)).await;
    }

    /// Stops processing requests.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sender.is_closed()
    }

    async fn add_entries(&self, cids: &[Cid], targets: &[PeerId], cancel: bool, from: u64) {
        let entries = cids
            .iter()
            .enumerate()
            .map(|(i, cid)| Entry {
                cid: *cid,
                priority: self
                    .max_priority
                    .saturating_sub(i32::try_from(i).unwrap_or(i32::MAX)),
                cancel,
            })
            .collect();
        self.send(WantMessage::WantSet {
            entries,
            targets: targets.to_vec(),
            from,
        })
        .await;
    }

    /// Enqueues a message, giving up if the manager is shut down.
    async fn send(&self, message: WantMessage) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.sender.send(message) => res.is_ok(),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> WantMessage) -> Option<T> {
        let (s, r) = oneshot::channel();
        if !self.send(make(s)).await {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            res = r => res.ok(),
        }
    }
}

struct WantManagerActor {
    receiver: mpsc::Receiver<WantMessage>,
    wantlist: SessionTrackedWantlist,
    broadcast_wantlist: SessionTrackedWantlist,
    peer_handler: Arc<dyn PeerHandler>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl WantManagerActor {
    async fn run(mut self) {
        // NOTE: Do not open any streams or connections from this loop.
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
        debug!("want manager shutting down");
    }

    async fn handle_message(&mut self, message: WantMessage) {
        match message {
            WantMessage::WantSet {
                entries,
                targets,
                from,
            } => {
                self.handle_want_set(&entries, targets.is_empty(), from);
                self.metrics.want_batches.inc();
                self.peer_handler
                    .send_message(entries, targets, from)
                    .await;
            }
            WantMessage::IsWanted { cid, response } => {
                let _ = response.send(self.wantlist.contains(&cid).is_some());
            }
            WantMessage::CurrentWants { response } => {
                let _ = response.send(self.wantlist.entries());
            }
            WantMessage::CurrentBroadcastWants { response } => {
                let _ = response.send(self.broadcast_wantlist.entries());
            }
            WantMessage::WantCount { response } => {
                let _ = response.send(self.wantlist.len());
            }
            WantMessage::Connected(peer) => {
                trace!(%peer, "connected, sending {} broadcast wants", self.broadcast_wantlist.len());
                self.peer_handler
                    .connected(peer, self.broadcast_wantlist.clone())
                    .await;
            }
            WantMessage::Disconnected(peer) => {
                self.peer_handler.disconnected(peer).await;
            }
        }
    }

    fn handle_want_set(&mut self, entries: &[Entry], broadcast: bool, from: u64) {
        for entry in entries {
            if entry.cancel {
                if broadcast {
                    self.broadcast_wantlist.remove(&entry.cid, from);
                }
                if self.wantlist.remove(&entry.cid, from) {
                    self.metrics.wantlist_total.dec();
                }
            } else {
                if broadcast {
                    self.broadcast_wantlist
                        .add(entry.cid, entry.priority, from);
                }
                if self.wantlist.add(entry.cid, entry.priority, from) {
                    self.metrics.wantlist_total.inc();
                }
            }
        }
    }
}
