use std::fmt::{self, Debug};

use ahash::AHashMap;
use cid::Cid;

/// Priority of a wanted block.
pub type Priority = i32;

/// A wantlist change, either adding a want for `cid` or cancelling it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub cancel: bool,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("cid", &self.cid.to_string())
            .field("priority", &self.priority)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl Entry {
    pub fn want(cid: Cid, priority: Priority) -> Self {
        Entry {
            cid,
            priority,
            cancel: false,
        }
    }

    pub fn cancel(cid: Cid) -> Self {
        Entry {
            cid,
            priority: 0,
            cancel: true,
        }
    }
}

/// An outgoing bitswap message, accumulating wants and cancels for a single peer
/// until it is handed to a [`MessageSender`](crate::network::MessageSender).
///
/// Serializing the message is left to the sender.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct BitswapMessage {
    full: bool,
    wantlist: AHashMap<Cid, Entry>,
}

struct Fmt<F>(pub F)
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result;

impl<F> fmt::Debug for Fmt<F>
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self.0)(f)
    }
}

impl Debug for BitswapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitswapMessage")
            .field("full", &self.full)
            .field(
                "wantlist",
                &Fmt(|f| {
                    let mut wantlist = f.debug_map();
                    for (cid, entry) in &self.wantlist {
                        wantlist.entry(&cid.to_string(), entry);
                    }
                    wantlist.finish()
                }),
            )
            .finish()
    }
}

impl BitswapMessage {
    /// Creates an empty message. A `full` message replaces the receivers view of
    /// our wantlist instead of updating it.
    pub fn new(full: bool) -> Self {
        BitswapMessage {
            full,
            ..Default::default()
        }
    }

    pub fn full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty()
    }

    pub fn len(&self) -> usize {
        self.wantlist.len()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.values()
    }

    /// Entries sorted descending by priority, cancels last.
    pub fn sorted_wantlist(&self) -> Vec<Entry> {
        let mut entries: Vec<_> = self.wantlist.values().copied().collect();
        entries.sort_by(|a, b| {
            a.cancel
                .cmp(&b.cancel)
                .then_with(|| b.priority.cmp(&a.priority))
        });
        entries
    }

    pub fn get(&self, cid: &Cid) -> Option<&Entry> {
        self.wantlist.get(cid)
    }

    pub fn remove(&mut self, cid: &Cid) {
        self.wantlist.remove(cid);
    }

    /// Adds a cancel for `cid`, replacing any pending want for it.
    pub fn cancel(&mut self, cid: Cid) {
        self.wantlist.insert(cid, Entry::cancel(cid));
    }

    /// Adds a want for `cid`, replacing any pending cancel for it.
    pub fn add_entry(&mut self, cid: Cid, priority: Priority) {
        self.wantlist.insert(cid, Entry::want(cid, priority));
    }
}
