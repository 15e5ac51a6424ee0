//! Session registry: the single source of truth mapping session ids to live
//! transports.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::error;

use super::transport::SessionTransport;

/// Registry of sessions keyed by opaque id.
///
/// Generic over the entry type so the map semantics can be exercised without
/// spinning up real transports; the server uses [`TransportRegistry`].
pub struct SessionRegistry<T> {
    sessions: RwLock<HashMap<String, T>>,
}

/// The registry as used by the HTTP surface.
pub type TransportRegistry = SessionRegistry<Arc<SessionTransport>>;

impl<T: Clone> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new session. Ids come from a uuid generator, so a collision
    /// here is a bug in the caller, not a user-facing condition; it is logged
    /// and the newer entry wins.
    pub async fn register(&self, id: impl Into<String>, entry: T) {
        let id = id.into();
        let mut sessions = self.sessions.write().await;
        if sessions.insert(id.clone(), entry).is_some() {
            error!(session_id = %id, "Duplicate session id registered; replacing entry");
        }
    }

    /// Look up a session. `None` means the id is stale or was never issued,
    /// which is a normal outcome for the router to classify.
    pub async fn lookup(&self, id: &str) -> Option<T> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session if present. Idempotent: close handlers can race and
    /// both call this for the same id.
    pub async fn remove(&self, id: &str) -> Option<T> {
        self.sessions.write().await.remove(id)
    }

    /// Point-in-time copy of all entries. Callers iterate the copy, so
    /// entries removed concurrently (e.g. by their own close handlers) do
    /// not invalidate the iteration.
    pub async fn snapshot(&self) -> Vec<(String, T)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl<T: Clone> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_reflects_register_and_remove() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        assert!(registry.lookup("s1").await.is_none());

        registry.register("s1", 1).await;
        assert_eq!(registry.lookup("s1").await, Some(1));

        registry.remove("s1").await;
        assert!(registry.lookup("s1").await.is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.register("s1", 1).await;

        assert_eq!(registry.remove("s1").await, Some(1));
        assert_eq!(registry.remove("s1").await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn ids_are_distinct_entries() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.register("s1", 1).await;
        registry.register("s2", 2).await;

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.lookup("s1").await, Some(1));
        assert_eq!(registry.lookup("s2").await, Some(2));
    }

    #[tokio::test]
    async fn snapshot_tolerates_concurrent_removal() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.register("s1", 1).await;
        registry.register("s2", 2).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        // Entries vanishing under the snapshot must not affect iteration.
        registry.remove("s1").await;
        registry.remove("s2").await;
        for (id, value) in snapshot {
            assert!(!id.is_empty());
            assert!(value == 1 || value == 2);
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_register_replaces() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.register("s1", 1).await;
        registry.register("s1", 2).await;
        assert_eq!(registry.lookup("s1").await, Some(2));
        assert_eq!(registry.len().await, 1);
    }
}
