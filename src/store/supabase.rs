//! Supabase (PostgREST) key-value store.
//!
//! Expects a table with `key text primary key, value text, updated_at timestamptz`.
//! Values are stored base64-encoded.

use super::KvStore;
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const DEFAULT_TABLE: &str = "schema_inference_kv";
const DEFAULT_SCHEMA: &str = "public";

#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
    table: String,
    schema: String,
}

#[derive(Debug, Deserialize)]
struct ValueRow {
    value: String,
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    key: String,
}

impl SupabaseStore {
    /// Create a store from `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`.
    /// `SUPABASE_KV_TABLE` and `SUPABASE_KV_SCHEMA` override the table location.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("SUPABASE_URL").map_err(|_| anyhow!("SUPABASE_URL not set"))?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| anyhow!("SUPABASE_SERVICE_ROLE_KEY not set"))?;

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
            table: std::env::var("SUPABASE_KV_TABLE").unwrap_or_else(|_| DEFAULT_TABLE.to_string()),
            schema: std::env::var("SUPABASE_KV_SCHEMA")
                .unwrap_or_else(|_| DEFAULT_SCHEMA.to_string()),
        })
    }

    fn url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Accept-Profile", &self.schema)
            .header("Content-Profile", &self.schema)
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase {} failed: {} - {}", what, status, text));
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl KvStore for SupabaseStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .authorized(self.client.get(self.url()))
            .query(&[("key", format!("eq.{}", key)), ("select", "value".to_string())])
            .send()
            .await?;
        let rows: Vec<ValueRow> = Self::check(resp, "GET").await?.json().await?;

        match rows.into_iter().next() {
            Some(row) => Ok(Some(BASE64.decode(row.value)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let body = json!({
            "key": key,
            "value": BASE64.encode(value),
            "updated_at": chrono::Utc::now(),
        });
        let resp = self
            .authorized(self.client.post(self.url()))
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;
        Self::check(resp, "upsert").await?;
        debug!("Supabase: stored '{}' ({} bytes)", key, value.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .authorized(self.client.delete(self.url()))
            .query(&[("key", format!("eq.{}", key))])
            .send()
            .await?;
        Self::check(resp, "DELETE").await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let resp = self
            .authorized(self.client.get(self.url()))
            .query(&[
                ("key", format!("like.{}*", prefix)),
                ("select", "key".to_string()),
                ("order", "key.asc".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<KeyRow> = Self::check(resp, "list").await?.json().await?;
        Ok(rows.into_iter().map(|r| r.key).collect())
    }
}
