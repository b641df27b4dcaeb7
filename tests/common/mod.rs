//! Shared fixtures for integration tests: a scripted completion client and
//! service builders. No network access.

#![allow(dead_code)]

use anyhow::anyhow;
use parking_lot::Mutex;
use sheet_inference::{
    CompletionClient, CompletionRequest, InferenceConfig, LearnedStore, SchemaInference,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Budget report with a title and a unit line above the column names.
pub const BUDGET_REPORT: &str = "总表,,\n单位: 元,,\n项目,预算,实际\n收入,100,110\n成本,80,95\n";

pub enum Reply {
    Text(String),
    Fail,
    Hang,
}

/// Completion client that answers from a queue and records every request.
#[derive(Default)]
pub struct ScriptedClient {
    queue: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn texts(texts: &[&str]) -> Arc<Self> {
        Self::new(texts.iter().map(|t| Reply::Text(t.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn models(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.model.clone()).collect()
    }
}

#[async_trait::async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        self.requests.lock().push(request);
        let next = self.queue.lock().pop_front();
        match next {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail) | None => Err(anyhow!("503 Service Unavailable")),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(String::new())
            }
        }
    }
}

/// Config with no retries, so each scripted reply maps to one ladder step.
pub fn quiet_config() -> InferenceConfig {
    InferenceConfig {
        llm_max_retries: 0,
        llm_timeout_seconds: 1,
        ..InferenceConfig::default()
    }
}

pub fn service(client: Arc<ScriptedClient>, config: InferenceConfig) -> SchemaInference {
    SchemaInference::new(client, Arc::new(LearnedStore::in_memory()), config)
}

pub fn names(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}
