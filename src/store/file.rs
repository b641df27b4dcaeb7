//! Directory-backed key-value store: one file per key, hex-encoded file names.
//!
//! Keys too long for a hex file name are stored under their SHA-256 digest,
//! with the original key kept in a `.key` companion file.

use super::KvStore;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

const EXTENSION: &str = "json";
const KEY_EXTENSION: &str = "key";
const HASHED_PREFIX: &str = "h-";
/// Longest key whose hex name plus extension stays within 255 bytes.
const MAX_HEX_KEY_BYTES: usize = 120;

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(key), EXTENSION))
    }
}

fn file_stem(key: &str) -> String {
    if key.len() <= MAX_HEX_KEY_BYTES {
        hex::encode(key.as_bytes())
    } else {
        format!("{}{}", HASHED_PREFIX, hex::encode(Sha256::digest(key.as_bytes())))
    }
}

fn is_hashed(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.starts_with(HASHED_PREFIX))
}

async fn key_from_path(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with(HASHED_PREFIX) {
        return fs::read_to_string(path.with_extension(KEY_EXTENSION)).await.ok();
    }
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

#[async_trait::async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read key {}", key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create store dir {:?}", self.dir))?;

        // Write then rename so readers never see a partial file.
        let path = self.path_for(key);
        if is_hashed(&path) {
            fs::write(path.with_extension(KEY_EXTENSION), key)
                .await
                .with_context(|| format!("Failed to write key file for {}", key))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)
            .await
            .with_context(|| format!("Failed to write key {}", key))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to commit key {}", key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        remove_if_present(&path)
            .await
            .with_context(|| format!("Failed to delete key {}", key))?;
        if is_hashed(&path) {
            remove_if_present(&path.with_extension(KEY_EXTENSION))
                .await
                .with_context(|| format!("Failed to delete key file for {}", key))?;
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", self.dir)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = key_from_path(&entry.path()).await.filter(|k| k.starts_with(prefix)) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("learned"));
        store.set("learned:1月_预算收入", b"{\"f\":1}").await.unwrap();
        store.set("learned:cost", b"{}").await.unwrap();
        store.set("other:x", b"{}").await.unwrap();

        let reopened = FileStore::new(dir.path().join("learned"));
        assert_eq!(
            reopened.get("learned:1月_预算收入").await.unwrap().as_deref(),
            Some(&b"{\"f\":1}"[..])
        );
        assert_eq!(
            reopened.list_keys("learned:").await.unwrap(),
            vec!["learned:1月_预算收入", "learned:cost"]
        );
    }

    #[tokio::test]
    async fn test_long_keys_use_hashed_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let key = format!("learned:{}", "本期营业收入合计".repeat(10));
        store.set(&key, b"{}").await.unwrap();
        store.set("learned:cost", b"{}").await.unwrap();

        assert!(store.path_for(&key).file_name().unwrap().len() <= 255);
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(&b"{}"[..]));
        assert_eq!(
            store.list_keys("learned:").await.unwrap(),
            vec!["learned:cost".to_string(), key.clone()]
        );

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(store.list_keys("").await.unwrap(), vec!["learned:cost"]);
    }

    #[tokio::test]
    async fn test_missing_dir_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("absent"));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.list_keys("").await.unwrap().is_empty());
        store.delete("k").await.unwrap();
    }
}
