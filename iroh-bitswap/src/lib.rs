//! Client side control plane of the [bitswap protocol](https://github.com/ipfs/specs/blob/master/BITSWAP.md). Based on go-bitswap.
//!
//! Tracks what the local node wants, fans wants and cancels out to per peer message
//! queues, and ranks the peers of each request session by how useful they were.
//!
//! The transport is not part of this crate, it is plugged in through the traits in
//! [`network`].
#![cfg_attr(iroh_docsrs, feature(doc_cfg))]

pub mod client;
mod error;
pub mod message;
pub mod metrics;
pub mod network;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(iroh_docsrs, doc(cfg(feature = "test-utils")))]
pub mod test_utils;

pub use self::client::{Client, Config, Stat};
pub use self::error::Error;
pub use self::message::{BitswapMessage, Priority};
