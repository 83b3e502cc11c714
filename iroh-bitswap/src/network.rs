//! Capabilities the bitswap client consumes from the surrounding node.
//!
//! The client never talks to a transport directly. Dialing, stream handling, content
//! routing and connection management are provided through these traits.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use futures::stream::BoxStream;
use libp2p_identity::PeerId;

use crate::message::BitswapMessage;

/// Any network that can connect peers and open message senders to them.
#[async_trait]
pub trait MessageNetwork: Debug + Send + Sync + 'static {
    /// Ensures there is a connection to `peer`, dialing it if needed.
    async fn connect_to(&self, peer: PeerId) -> Result<()>;

    /// Opens a new outbound stream to `peer`.
    async fn new_message_sender(&self, peer: PeerId) -> Result<Box<dyn MessageSender>>;
}

/// A single outbound stream to a peer.
#[async_trait]
pub trait MessageSender: Debug + Send + Sync + 'static {
    async fn send_msg(&mut self, message: &BitswapMessage) -> Result<()>;

    /// Closes the stream cleanly.
    async fn close(&mut self) -> Result<()>;

    /// Aborts the stream.
    async fn reset(&mut self) -> Result<()>;
}

/// Content routing, finding peers that provide a given cid.
pub trait ProviderFinder: Debug + Send + Sync + 'static {
    /// Starts a provider lookup for `cid`.
    ///
    /// The stream ends when the lookup is exhausted, each call starts a new lookup.
    fn find_providers_async(&self, cid: Cid) -> BoxStream<'static, PeerId>;
}

/// Connection manager tagging, used to protect useful connections from being pruned.
pub trait PeerTagger: Debug + Send + Sync + 'static {
    fn tag_peer(&self, peer: &PeerId, tag: &str, weight: usize);
    fn untag_peer(&self, peer: &PeerId, tag: &str);
}
