//! Persistent key-value stores backing the learned-mapping store.
//!
//! Values are opaque bytes; callers serialize. Three backends: process memory,
//! a directory on disk and a Supabase REST table.

mod file;
mod memory;
mod supabase;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Pick a backend from the environment.
///
/// `SHEET_INFERENCE_STORE` is `memory` (default), `file` (directory from
/// `SHEET_INFERENCE_STORE_DIR`, default `data/learned`) or `supabase`.
pub fn from_env() -> Result<Arc<dyn KvStore>> {
    let kind = std::env::var("SHEET_INFERENCE_STORE").unwrap_or_else(|_| "memory".to_string());
    let store: Arc<dyn KvStore> = match kind.as_str() {
        "file" => {
            let dir = std::env::var("SHEET_INFERENCE_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/learned"));
            Arc::new(FileStore::new(dir))
        }
        "supabase" => Arc::new(SupabaseStore::from_env()?),
        "memory" => Arc::new(MemoryStore::new()),
        other => anyhow::bail!("unknown store backend: {}", other),
    };
    info!("Using {} key-value store", kind);
    Ok(store)
}
