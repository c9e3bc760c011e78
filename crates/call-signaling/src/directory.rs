//! Read-only view of who can be called.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::protocol::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Online,
    Offline,
    InCall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub identity: Identity,
    pub display_name: String,
    pub reachability: Reachability,
}

pub trait Directory: Send + Sync {
    fn lookup(&self, identity: &Identity) -> Option<DirectoryEntry>;
}

/// In-memory directory, typically mirrored from the profile service.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: RwLock<HashMap<Identity, DirectoryEntry>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_online<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Identity>,
    {
        let directory = Self::new();
        for identity in identities {
            let identity = identity.into();
            directory.upsert(DirectoryEntry {
                display_name: identity.to_string(),
                identity,
                reachability: Reachability::Online,
            });
        }
        directory
    }

    pub fn upsert(&self, entry: DirectoryEntry) {
        self.entries.write().insert(entry.identity.clone(), entry);
    }

    pub fn remove(&self, identity: &Identity) {
        self.entries.write().remove(identity);
    }
}

impl Directory for StaticDirectory {
    fn lookup(&self, identity: &Identity) -> Option<DirectoryEntry> {
        self.entries.read().get(identity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_known_entries_only() {
        let directory = StaticDirectory::with_online(["alice", "bob"]);
        let bob = directory.lookup(&Identity::new("bob")).expect("bob listed");
        assert_eq!(bob.reachability, Reachability::Online);
        assert!(directory.lookup(&Identity::new("mallory")).is_none());

        directory.remove(&Identity::new("bob"));
        assert!(directory.lookup(&Identity::new("bob")).is_none());
    }
}
