use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;

use crate::{OrdError, OrdResult};

/// Blob storage addressed by `/`-separated relative paths.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, body: Vec<u8>) -> OrdResult<()>;

    /// Fails with [`OrdError::DocumentNotFound`] for a missing object.
    async fn get(&self, path: &str) -> OrdResult<Vec<u8>>;

    /// Removing a missing object is not an error.
    async fn delete(&self, path: &str) -> OrdResult<()>;
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn paths(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, body: Vec<u8>) -> OrdResult<()> {
        self.objects.write().insert(path.to_string(), body);
        Ok(())
    }

    async fn get(&self, path: &str) -> OrdResult<Vec<u8>> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| OrdError::DocumentNotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> OrdResult<()> {
        self.objects.write().remove(path);
        Ok(())
    }
}

/// Objects stored as files below a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> OrdResult<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(OrdError::DocumentNotFound(format!("invalid path {path}")));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, body: Vec<u8>) -> OrdResult<()> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(file, body).await?;

        Ok(())
    }

    async fn get(&self, path: &str) -> OrdResult<Vec<u8>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(body) => Ok(body),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(OrdError::DocumentNotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, path: &str) -> OrdResult<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ObjectStore) {
        let path = "address/tb1p/inscriptions/abc/transaction.json";

        assert!(matches!(
            store.get(path).await,
            Err(OrdError::DocumentNotFound(_))
        ));

        store.put(path, b"{}".to_vec()).await.unwrap();
        assert_eq!(store.get(path).await.unwrap(), b"{}".to_vec());

        store.put(path, b"[]".to_vec()).await.unwrap();
        assert_eq!(store.get(path).await.unwrap(), b"[]".to_vec());

        store.delete(path).await.unwrap();
        store.delete(path).await.unwrap();
        assert!(store.get(path).await.is_err());
    }

    #[tokio::test]
    async fn memory_store() {
        exercise(&MemoryObjectStore::default()).await;
    }

    #[tokio::test]
    async fn fs_store() {
        let root = std::env::temp_dir().join(format!("ord-funder-{}", rand::random::<u64>()));
        let store = FsObjectStore::new(&root);

        exercise(&store).await;
        assert!(store.get("../escape").await.is_err());
        assert!(store.put("/abs", vec![]).await.is_err());

        let _ = std::fs::remove_dir_all(root);
    }
}
