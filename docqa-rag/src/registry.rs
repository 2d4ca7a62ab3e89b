//! The single point of access from a user id to that user's index.
//!
//! Each user id maps to one `OnceCell` holding the user's [`UserIndex`]. The
//! map lock is held only long enough to find or insert the cell; loading the
//! index from the backing store happens inside the cell's initialiser, so
//! concurrent first accesses for one user produce exactly one index and never
//! block other users.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::document::UserId;
use crate::embedding::EmbeddingSignature;
use crate::error::{RagError, Result};
use crate::index::UserIndex;
use crate::store::IndexStore;

type Slot = Arc<OnceCell<Arc<UserIndex>>>;

/// Maps every user to exactly one [`UserIndex`].
pub struct IsolationRegistry {
    signature: EmbeddingSignature,
    store: Option<Arc<dyn IndexStore>>,
    slots: RwLock<HashMap<UserId, Slot>>,
}

impl IsolationRegistry {
    /// New indexes are created for embeddings described by `signature`.
    pub fn new(signature: EmbeddingSignature) -> Self {
        Self { signature, store: None, slots: RwLock::new(HashMap::new()) }
    }

    /// Load indexes from, and delete them in, `store`.
    pub fn with_store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn signature(&self) -> &EmbeddingSignature {
        &self.signature
    }

    /// Return the user's index, loading it from the store or creating an
    /// empty one on first access.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Store`] or [`RagError::IndexCorruption`] if a
    /// stored snapshot cannot be loaded. A later call retries.
    pub async fn get_or_create(&self, user_id: &UserId) -> Result<Arc<UserIndex>> {
        let existing = self.slots.read().await.get(user_id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => self.slots.write().await.entry(user_id.clone()).or_default().clone(),
        };

        let index = slot.get_or_try_init(|| self.load_or_create(user_id)).await?;
        Ok(index.clone())
    }

    /// Return the user's index only if it is already loaded.
    pub async fn get(&self, user_id: &UserId) -> Option<Arc<UserIndex>> {
        self.slots.read().await.get(user_id).and_then(|slot| slot.get().cloned())
    }

    /// Destroy the user's index and everything stored for it.
    ///
    /// Waits for an in-flight commit on the current index, so a save that
    /// already started cannot land after the store is wiped. Callers still
    /// holding the old index see it empty. The next
    /// [`get_or_create`](Self::get_or_create) starts from scratch.
    pub async fn delete(&self, user_id: &UserId) -> Result<()> {
        loop {
            let current = self.get(user_id).await;
            let _commit = match &current {
                Some(index) => Some(index.lock_commits().await),
                None => None,
            };

            let removed = {
                let mut slots = self.slots.write().await;
                let now = slots.get(user_id).and_then(|slot| slot.get().cloned());
                if !same_index(now.as_ref(), current.as_ref()) {
                    continue;
                }
                slots.remove(user_id)
            };

            if let Some(index) = removed.as_ref().and_then(|slot| slot.get()) {
                index.delete_all().await;
            }
            if let Some(store) = &self.store {
                store.delete(user_id).await?;
            }
            info!(user_id = %user_id, "user index deleted");
            return Ok(());
        }
    }

    /// Swap in a rebuilt index for the user.
    ///
    /// Callers hold the commit lock of the index being replaced.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidInput`] if `index` belongs to another user.
    pub async fn replace(&self, user_id: &UserId, index: Arc<UserIndex>) -> Result<()> {
        if index.user_id() != user_id {
            return Err(RagError::InvalidInput(format!(
                "index of user '{}' cannot replace the index of user '{user_id}'",
                index.user_id()
            )));
        }
        debug!(user_id = %user_id, epoch = index.epoch(), "user index replaced");
        let slot = Arc::new(OnceCell::new_with(Some(index)));
        self.slots.write().await.insert(user_id.clone(), slot);
        Ok(())
    }

    /// Write the index to the backing store, if one is configured.
    ///
    /// Callers hold the index's commit lock, so snapshots reach the store in
    /// the order the mutations happened. An index that has since been deleted
    /// or replaced is not written, so a late save can never resurrect cleared
    /// data.
    pub async fn persist(&self, index: &Arc<UserIndex>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if !self.is_current(index).await {
            warn!(user_id = %index.user_id(), "skipping save of a detached index");
            return Ok(());
        }
        store.save(&index.snapshot().await).await
    }

    /// Number of users with a slot in the registry.
    pub async fn user_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Whether `index` is the one currently registered for its user.
    pub async fn is_current(&self, index: &Arc<UserIndex>) -> bool {
        self.get(index.user_id()).await.is_some_and(|current| Arc::ptr_eq(&current, index))
    }

    async fn load_or_create(&self, user_id: &UserId) -> Result<Arc<UserIndex>> {
        if let Some(store) = &self.store {
            if let Some(snapshot) = store.load(user_id).await? {
                let index = UserIndex::from_snapshot(snapshot)?;
                if index.signature() != &self.signature {
                    warn!(
                        user_id = %user_id,
                        stored = %index.signature(),
                        current = %self.signature,
                        "stored index was built with a different embedding model"
                    );
                }
                debug!(user_id = %user_id, "user index loaded from store");
                return Ok(Arc::new(index));
            }
        }
        debug!(user_id = %user_id, "user index created");
        Ok(Arc::new(UserIndex::new(user_id.clone(), self.signature.clone())))
    }
}

fn same_index(a: Option<&Arc<UserIndex>>, b: Option<&Arc<UserIndex>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl fmt::Debug for IsolationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationRegistry")
            .field("signature", &self.signature)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use super::*;
    use crate::document::Chunk;
    use crate::store::InMemoryIndexStore;

    fn signature() -> EmbeddingSignature {
        EmbeddingSignature { model: "test".into(), dimensions: 2 }
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn chunk(id: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "d".into(),
            index: 0,
            text: id.to_string(),
            start: 0,
            end: 0,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn same_user_gets_the_same_index() {
        let registry = IsolationRegistry::new(signature());
        let a = registry.get_or_create(&user("alice")).await.unwrap();
        let b = registry.get_or_create(&user("alice")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.user_id(), &user("alice"));
    }

    #[tokio::test]
    async fn different_users_get_different_indexes() {
        let registry = IsolationRegistry::new(signature());
        let alice = registry.get_or_create(&user("alice")).await.unwrap();
        let bob = registry.get_or_create(&user("bob")).await.unwrap();
        alice.insert(chunk("a"), vec![1.0, 0.0]).await.unwrap();
        assert!(!Arc::ptr_eq(&alice, &bob));
        assert!(bob.is_empty().await);
        assert_eq!(registry.user_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_one_index() {
        let registry = Arc::new(IsolationRegistry::new(signature()));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(&user("carol")).await.unwrap() })
            })
            .collect();

        let mut indexes = Vec::new();
        for handle in handles {
            indexes.push(handle.await.unwrap());
        }
        assert!(indexes.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn delete_starts_fresh_and_empties_stale_handles() {
        let store = Arc::new(InMemoryIndexStore::new());
        let registry = IsolationRegistry::new(signature()).with_store(store.clone());
        let alice = user("alice");

        let old = registry.get_or_create(&alice).await.unwrap();
        old.insert(chunk("a"), vec![1.0, 0.0]).await.unwrap();
        registry.persist(&old).await.unwrap();
        assert_eq!(store.len().await, 1);

        registry.delete(&alice).await.unwrap();
        assert!(old.is_empty().await);
        assert!(store.is_empty().await);

        let fresh = registry.get_or_create(&alice).await.unwrap();
        assert!(fresh.is_empty().await);
        assert_ne!(fresh.epoch(), old.epoch());
    }

    #[tokio::test]
    async fn indexes_are_loaded_from_the_store() {
        let store = Arc::new(InMemoryIndexStore::new());
        let first = IsolationRegistry::new(signature()).with_store(store.clone());
        let index = first.get_or_create(&user("dave")).await.unwrap();
        index.insert(chunk("a"), vec![0.0, 1.0]).await.unwrap();
        first.persist(&index).await.unwrap();

        let second = IsolationRegistry::new(signature()).with_store(store);
        let loaded = second.get_or_create(&user("dave")).await.unwrap();
        assert_eq!(loaded.size().await, 1);
    }

    #[tokio::test]
    async fn detached_index_is_not_persisted() {
        let store = Arc::new(InMemoryIndexStore::new());
        let registry = IsolationRegistry::new(signature()).with_store(store.clone());
        let alice = user("alice");
        let old = registry.get_or_create(&alice).await.unwrap();
        registry.delete(&alice).await.unwrap();

        old.insert(chunk("late"), vec![1.0, 0.0]).await.unwrap();
        registry.persist(&old).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn replace_rejects_foreign_index() {
        let registry = IsolationRegistry::new(signature());
        let foreign = Arc::new(UserIndex::new(user("mallory"), signature()));
        assert!(registry.replace(&user("alice"), foreign).await.is_err());

        let own = Arc::new(UserIndex::new(user("alice"), signature()));
        registry.replace(&user("alice"), own.clone()).await.unwrap();
        let current = registry.get_or_create(&user("alice")).await.unwrap();
        assert!(Arc::ptr_eq(&current, &own));
        assert!(registry.is_current(&own).await);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_for_an_in_flight_commit() {
        let store = Arc::new(InMemoryIndexStore::new());
        let registry = Arc::new(IsolationRegistry::new(signature()).with_store(store.clone()));
        let alice = user("alice");
        let index = registry.get_or_create(&alice).await.unwrap();

        let commit = index.lock_commits().await;
        let deleting = tokio::spawn({
            let registry = registry.clone();
            let alice = alice.clone();
            async move { registry.delete(&alice).await }
        });
        tokio::task::yield_now().await;
        assert!(!deleting.is_finished());

        index.insert(chunk("a"), vec![1.0, 0.0]).await.unwrap();
        registry.persist(&index).await.unwrap();
        drop(commit);

        deleting.await.unwrap().unwrap();
        assert!(store.is_empty().await);
        assert!(index.is_empty().await);
    }
}
