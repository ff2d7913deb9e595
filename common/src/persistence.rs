use std::collections::BTreeMap;

use tracing::info;

use crate::types::RoomId;

/// Valve positions frozen while the boiler is shutting down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValvePersistenceStore {
    snapshot: BTreeMap<RoomId, u8>,
}

impl ValvePersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn capture<I>(&mut self, valves: I)
    where
        I: IntoIterator<Item = (RoomId, u8)>,
    {
        self.snapshot = valves.into_iter().collect();
        info!(valves = ?self.snapshot, "valve positions persisted");
    }

    pub(crate) fn release(&mut self) {
        if !self.snapshot.is_empty() {
            info!("persisted valve positions released");
        }
        self.snapshot.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    pub fn get(&self, room_id: &str) -> Option<u8> {
        self.snapshot.get(room_id).copied()
    }

    pub fn snapshot(&self) -> &BTreeMap<RoomId, u8> {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_replaces_and_release_clears() {
        let mut store = ValvePersistenceStore::new();
        store.capture([("a".to_string(), 100), ("b".to_string(), 0)]);

        assert_eq!(store.get("a"), Some(100));
        assert_eq!(store.get("b"), Some(0));
        assert_eq!(store.get("c"), None);

        store.release();
        assert!(store.is_empty());
        assert_eq!(store.get("a"), None);
    }
}
