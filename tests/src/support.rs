use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tempfile::TempDir;
use toolbridge::completion::{CompletionBackend, CompletionOutput, CompletionRequest};
use toolbridge::query::QueryBuilder;
use toolbridge::tools::{ToolRegistry, TracingSink};
use toolbridge::Dispatcher;

pub fn temp_workspace() -> anyhow::Result<TempDir> {
    Ok(TempDir::new()?)
}

pub struct CannedCompletion;

#[async_trait]
impl CompletionBackend for CannedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> toolbridge::Result<CompletionOutput> {
        Ok(CompletionOutput {
            text: format!("echo: {}", request.prompt),
            model_used: "canned-model".to_string(),
            usage: json!({ "total_tokens": 1 }),
        })
    }

    fn model(&self) -> &str {
        "canned-model"
    }
}

/// Dispatcher over a lazily connected pool; only tools that never touch the
/// database can be exercised against it.
pub fn offline_dispatcher() -> Dispatcher {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://toolbridge@localhost/toolbridge")
        .expect("lazy pool");
    let queries = QueryBuilder::new(vec!["users".to_string()]).expect("builder");
    let registry = ToolRegistry::new(
        pool,
        queries,
        Arc::new(CannedCompletion),
        Arc::new(TracingSink),
    );
    Dispatcher::new(registry)
}
