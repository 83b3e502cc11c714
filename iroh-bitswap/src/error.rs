use std::time::Duration;

use libp2p_identity::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out after {timeout:?} connecting to peer {peer}")]
    ConnectTimeout { peer: PeerId, timeout: Duration },
    #[error("timed out after {timeout:?} writing message to peer {peer}")]
    SendTimeout { peer: PeerId, timeout: Duration },
    #[error("peer {0} is not known to the network")]
    UnknownPeer(PeerId),
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("unsupported message for peer {peer}: {reason}")]
    UnsupportedMessage { peer: PeerId, reason: String },
    #[error("operation cancelled")]
    Cancelled,
}
