//! Volatile, single-process metadata store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::MetadataStore;
use crate::error::StoreError;
use crate::types::Volume;

#[derive(Default)]
struct Catalog {
    volumes: BTreeMap<String, Volume>,
    /// name -> id
    names: HashMap<String, String>,
}

/// In-memory [`MetadataStore`].
///
/// One [`RwLock`] guards both maps so every check-and-write runs under a
/// single exclusive lock.
#[derive(Default)]
pub struct MemoryStore {
    catalog: RwLock<Catalog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let mut catalog = self.catalog.write().await;
        if catalog.names.contains_key(&volume.name) {
            return Err(StoreError::AlreadyExists(volume.name.clone()));
        }
        if catalog.volumes.contains_key(&volume.id) {
            return Err(StoreError::AlreadyExists(volume.id.clone()));
        }
        catalog
            .names
            .insert(volume.name.clone(), volume.id.clone());
        catalog.volumes.insert(volume.id.clone(), volume.clone());
        debug!(id = %volume.id, name = %volume.name, "volume recorded");
        Ok(())
    }

    async fn get_volume(&self, id: &str) -> Result<Volume, StoreError> {
        self.catalog
            .read()
            .await
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))
    }

    async fn get_volume_by_name(&self, name: &str) -> Result<Volume, StoreError> {
        let catalog = self.catalog.read().await;
        catalog
            .names
            .get(name)
            .and_then(|id| catalog.volumes.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, StoreError> {
        Ok(self.catalog.read().await.volumes.values().cloned().collect())
    }

    async fn update_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let mut catalog = self.catalog.write().await;
        match catalog.volumes.get_mut(&volume.id) {
            Some(stored) => {
                *stored = volume.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(volume.id.clone())),
        }
    }

    async fn compare_and_update(&self, current: &Volume, next: &Volume) -> Result<(), StoreError> {
        let mut catalog = self.catalog.write().await;
        match catalog.volumes.get_mut(&current.id) {
            Some(stored) if stored == current => {
                *stored = next.clone();
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict(current.id.clone())),
            None => Err(StoreError::NotFound(current.id.clone())),
        }
    }

    async fn delete_volume(&self, id: &str) -> Result<(), StoreError> {
        let mut catalog = self.catalog.write().await;
        let volume = catalog
            .volumes
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        catalog.names.remove(&volume.name);
        debug!(%id, name = %volume.name, "volume removed");
        Ok(())
    }

    async fn compare_and_delete(&self, current: &Volume) -> Result<(), StoreError> {
        let mut catalog = self.catalog.write().await;
        match catalog.volumes.get(&current.id) {
            Some(stored) if stored == current => {}
            Some(_) => return Err(StoreError::Conflict(current.id.clone())),
            None => return Err(StoreError::NotFound(current.id.clone())),
        }
        catalog.volumes.remove(&current.id);
        catalog.names.remove(&current.name);
        debug!(id = %current.id, name = %current.name, "volume removed");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{Parameters, VolumeStatus};

    fn volume(name: &str) -> Volume {
        Volume::new(
            name,
            "local",
            Parameters::from([("path".into(), format!("/data/{name}"))]),
        )
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryStore::new();
        let vol = volume("demo");
        store.create_volume(&vol).await.unwrap();

        let by_id = store.get_volume(&vol.id).await.unwrap();
        assert_eq!(by_id, vol);
        assert_eq!(by_id.status, VolumeStatus::Created);

        let by_name = store.get_volume_by_name("demo").await.unwrap();
        assert_eq!(by_name.id, vol.id);
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let store = MemoryStore::new();
        store.create_volume(&volume("demo")).await.unwrap();
        let err = store.create_volume(&volume("demo")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.list_volumes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.create_volume(&volume("shared")).await
            }));
        }

        let mut ok = 0;
        let mut exists = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(StoreError::AlreadyExists(_)) => exists += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(exists, 15);
    }

    #[tokio::test]
    async fn update_and_delete_missing() {
        let store = MemoryStore::new();
        let vol = volume("ghost");
        assert!(matches!(
            store.update_volume(&vol).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_volume(&vol.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_frees_name() {
        let store = MemoryStore::new();
        let vol = volume("demo");
        store.create_volume(&vol).await.unwrap();
        store.delete_volume(&vol.id).await.unwrap();

        assert!(matches!(
            store.get_volume_by_name("demo").await,
            Err(StoreError::NotFound(_))
        ));
        store.create_volume(&volume("demo")).await.unwrap();
    }

    #[tokio::test]
    async fn compare_and_update_detects_stale_reads() {
        let store = MemoryStore::new();
        let vol = volume("demo");
        store.create_volume(&vol).await.unwrap();

        let mut first = vol.clone();
        first.staged_on.insert("n1".into());
        store.compare_and_update(&vol, &first).await.unwrap();

        let mut stale = vol.clone();
        stale.staged_on.insert("n2".into());
        let err = store.compare_and_update(&vol, &stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let stored = store.get_volume(&vol.id).await.unwrap();
        assert!(stored.staged_on.contains("n1"));
        assert!(!stored.staged_on.contains("n2"));
    }

    #[tokio::test]
    async fn compare_and_delete_keeps_changed_record() {
        let store = MemoryStore::new();
        let vol = volume("demo");
        store.create_volume(&vol).await.unwrap();

        let mut published = vol.clone();
        published.published_on.insert("n2".into());
        published.refresh_status();
        store.compare_and_update(&vol, &published).await.unwrap();

        let err = store.compare_and_delete(&vol).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get_volume(&vol.id).await.unwrap(), published);

        store.compare_and_delete(&published).await.unwrap();
        assert!(matches!(
            store.get_volume_by_name("demo").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.compare_and_delete(&published).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
