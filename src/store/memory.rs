//! In-memory tile store for tests and short sessions

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::types::{BoxFuture, Result};
use crate::store::TileStore;

#[derive(Default)]
pub struct MemoryTileStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().unwrap().is_empty()
    }
}

impl TileStore for MemoryTileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.blobs.lock().unwrap().get(key).cloned()) })
    }

    fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.blobs.lock().unwrap().insert(key.to_string(), bytes.to_vec());
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.blobs.lock().unwrap().clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_put_clear() {
        let store = MemoryTileStore::new();
        assert_eq!(store.get("tile-1.bin").await.unwrap(), None);

        store.put("tile-1.bin", b"payload").await.unwrap();
        assert_eq!(
            store.get("tile-1.bin").await.unwrap().as_deref(),
            Some("payload".as_bytes())
        );

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }
}
