//! File-backed tile store
//!
//! One LZ4-framed file per key under a base directory. Keys are
//! sanitized into file names; the original key length-prefixes the
//! frame so distinct keys never alias after sanitization.

use std::path::{Path, PathBuf};

use crate::core::types::{BoxFuture, Result};
use crate::store::TileStore;

/// Tile blobs as compressed files under one directory
pub struct FileTileStore {
    base_dir: PathBuf,
}

impl FileTileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// File path for a key. Anything outside `[A-Za-z0-9._-]` maps to
    /// `_` so keys can never escape the base directory.
    fn blob_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(format!("{safe}.lz4"))
    }

    fn frame(key: &str, bytes: &[u8]) -> Vec<u8> {
        let mut plain = Vec::with_capacity(4 + key.len() + bytes.len());
        plain.extend_from_slice(&(key.len() as u32).to_le_bytes());
        plain.extend_from_slice(key.as_bytes());
        plain.extend_from_slice(bytes);
        lz4_flex::compress_prepend_size(&plain)
    }

    /// Returns the payload if the frame belongs to `key`
    fn unframe(key: &str, compressed: &[u8]) -> Result<Option<Vec<u8>>> {
        let plain = lz4_flex::decompress_size_prepended(compressed).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("LZ4: {e}"))
        })?;
        if plain.len() < 4 {
            return Ok(None);
        }
        let key_len = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize;
        if plain.len() < 4 + key_len || &plain[4..4 + key_len] != key.as_bytes() {
            // Sanitization collision with another key
            return Ok(None);
        }
        Ok(Some(plain[4 + key_len..].to_vec()))
    }
}

impl TileStore for FileTileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let path = self.blob_path(key);
            if !path.exists() {
                return Ok(None);
            }
            let compressed = tokio::fs::read(&path).await?;
            Self::unframe(key, &compressed)
        })
    }

    fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.base_dir).await?;
            tokio::fs::write(self.blob_path(key), Self::frame(key, bytes)).await?;
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match tokio::fs::remove_dir_all(&self.base_dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
