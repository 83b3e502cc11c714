use ahash::{AHashMap, AHashSet};
use cid::Cid;

use crate::message::Priority;

/// An entry in a wantlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
}

impl Entry {
    pub fn new(cid: Cid, priority: Priority) -> Self {
        Entry { cid, priority }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionTrackedEntry {
    entry: Entry,
    sessions: AHashSet<u64>,
}

/// A wantlist that reference counts its entries by the sessions wanting them.
///
/// An entry is present iff at least one session wants it.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct SessionTrackedWantlist {
    set: AHashMap<Cid, SessionTrackedEntry>,
}

impl SessionTrackedWantlist {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Records that `session` wants `cid`.
    /// Returns true if the cid was not wanted by any session before.
    pub fn add(&mut self, cid: Cid, priority: Priority, session: u64) -> bool {
        self.add_entry(Entry::new(cid, priority), session)
    }

    pub fn add_entry(&mut self, entry: Entry, session: u64) -> bool {
        match self.set.entry(entry.cid) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().sessions.insert(session);
                false
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                let mut sessions = AHashSet::default();
                sessions.insert(session);
                e.insert(SessionTrackedEntry { entry, sessions });
                true
            }
        }
    }

    /// Removes `session` from the sessions wanting `cid`.
    /// Returns true if this was the last session and the entry got dropped.
    pub fn remove(&mut self, cid: &Cid, session: u64) -> bool {
        let Some(tracked) = self.set.get_mut(cid) else {
            return false;
        };
        tracked.sessions.remove(&session);
        if tracked.sessions.is_empty() {
            self.set.remove(cid);
            return true;
        }
        false
    }

    pub fn contains(&self, cid: &Cid) -> Option<Entry> {
        self.set.get(cid).map(|tracked| tracked.entry)
    }

    /// The sessions currently wanting `cid`.
    pub fn sessions(&self, cid: &Cid) -> Option<&AHashSet<u64>> {
        self.set.get(cid).map(|tracked| &tracked.sessions)
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.set.values().map(|tracked| tracked.entry).collect()
    }

    /// Returns a list of the entries, sorted descending by priority.
    pub fn sorted_entries(&self) -> Vec<Entry> {
        sort_by_priority(self.entries())
    }

    /// Merges all entries and their sessions into `other`.
    pub fn copy_wants(&self, other: &mut SessionTrackedWantlist) {
        for tracked in self.set.values() {
            for session in &tracked.sessions {
                other.add_entry(tracked.entry, *session);
            }
        }
    }
}

fn sort_by_priority(mut entries: Vec<Entry>) -> Vec<Entry> {
    entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    entries
}
