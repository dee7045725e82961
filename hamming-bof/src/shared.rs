//! Thread-safe handle for serving queries while an index is rebuilt.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::index::IndexState;
use crate::store::IndexStore;

/// Shared, swappable index.
///
/// Readers take an `Arc` snapshot and query it without holding any lock;
/// a rebuilt state replaces the current one as a whole.
#[derive(Debug)]
pub struct SharedIndex {
    state: RwLock<Arc<IndexState>>,
}

impl SharedIndex {
    pub fn new(state: IndexState) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
        }
    }

    /// Load the stored index into a new handle.
    pub fn open(store: &IndexStore) -> Result<Self> {
        Ok(Self::new(store.load()?))
    }

    /// Current state. In-flight queries keep their snapshot across swaps.
    pub fn snapshot(&self) -> Arc<IndexState> {
        Arc::clone(&self.state.read())
    }

    /// Swap in a new state, returning the previous one.
    pub fn replace(&self, state: IndexState) -> Arc<IndexState> {
        let mut guard = self.state.write();
        std::mem::replace(&mut *guard, Arc::new(state))
    }

    /// Reload from `store` and swap the result in.
    ///
    /// On failure the current state is kept.
    pub fn reload(&self, store: &IndexStore) -> Result<()> {
        let state = store.load()?;
        self.replace(state);
        tracing::info!(path = %store.path().display(), "Index reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexConfig;
    use crate::projection::ProjectionMatrix;
    use ndarray::{array, Array2};
    use tempfile::TempDir;

    fn state(ids: &[&str]) -> IndexState {
        let descriptors: Vec<Array2<f32>> = ids
            .iter()
            .enumerate()
            .map(|(i, _)| array![[i as f32, 1.0]])
            .collect();
        IndexState::from_vocabulary(
            ids.iter().map(|s| s.to_string()).collect(),
            &descriptors,
            array![[0.0f32, 1.0]],
            ProjectionMatrix::new(Array2::eye(2)).unwrap(),
            &IndexConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let shared = SharedIndex::new(state(&["a"]));
        let before = shared.snapshot();

        let previous = shared.replace(state(&["x", "y"]));

        assert_eq!(before.image_ids(), ["a".to_string()]);
        assert_eq!(previous.image_ids(), ["a".to_string()]);
        assert_eq!(shared.snapshot().num_images(), 2);
    }

    #[test]
    fn test_reload_keeps_state_on_failure() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("index"));
        let shared = SharedIndex::new(state(&["a"]));

        assert!(shared.reload(&store).is_err());
        assert_eq!(shared.snapshot().num_images(), 1);

        store.save(&state(&["p", "q", "r"])).unwrap();
        shared.reload(&store).unwrap();
        assert_eq!(shared.snapshot().num_images(), 3);
    }
}
