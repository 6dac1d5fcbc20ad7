//! Pluggable per-item business logic and its lookup by job type.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use forgebatch_jobs::{ITEMS_METADATA_KEY, Job};

/// Turns one input item into one output value.
///
/// Errors are opaque; the orchestrator records their message on a failed result.
#[async_trait::async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, ctx: &CancellationToken, item: &Value) -> anyhow::Result<Value>;
}

/// Adapts an async closure into an [`ItemProcessor`].
pub struct FnProcessor<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProcessor<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f, _fut: PhantomData }
    }
}

#[async_trait::async_trait]
impl<F, Fut> ItemProcessor for FnProcessor<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn process(&self, _ctx: &CancellationToken, item: &Value) -> anyhow::Result<Value> {
        (self.f)(item.clone()).await
    }
}

/// Processors keyed by job-type pattern.
///
/// Lookup order: exact tag, then `category.*`, then `*`.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn ItemProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a job-type pattern.
    pub fn register(&mut self, pattern: impl Into<String>, processor: Arc<dyn ItemProcessor>) {
        self.processors.insert(pattern.into(), processor);
    }

    pub fn with(mut self, pattern: impl Into<String>, processor: Arc<dyn ItemProcessor>) -> Self {
        self.register(pattern, processor);
        self
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(pattern, Arc::new(FnProcessor::new(f)));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn ItemProcessor>> {
        if let Some(p) = self.processors.get(job_type) {
            return Some(Arc::clone(p));
        }

        // Longest matching category wins ("report.pdf.*" over "report.*")
        let category = self
            .processors
            .iter()
            .filter_map(|(pattern, p)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), p))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, p)| Arc::clone(p));
        if category.is_some() {
            return category;
        }

        self.processors.get("*").map(Arc::clone)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.get(job_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// Processor error that records the item as skipped rather than failed.
///
/// Return it through `anyhow`: `Err(anyhow::Error::new(SkipItem("duplicate".into())))`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SkipItem(pub String);

/// Item source error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot resolve items: {0}")]
pub struct ItemSourceError(pub String);

/// Produces the ordered input items of a job.
///
/// The result may be shorter than `total_items`; missing indices are
/// recorded as failed placeholders.
#[async_trait::async_trait]
pub trait ItemSource: Send + Sync {
    async fn resolve(&self, job: &Job) -> Result<Vec<Value>, ItemSourceError>;
}

/// Reads items from the `items` array in job metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataItemSource;

#[async_trait::async_trait]
impl ItemSource for MetadataItemSource {
    async fn resolve(&self, job: &Job) -> Result<Vec<Value>, ItemSourceError> {
        match job.metadata.get(ITEMS_METADATA_KEY) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(other) => Err(ItemSourceError(format!(
                "`{ITEMS_METADATA_KEY}` must be an array, found {}",
                json_kind(other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_core::{TenantId, UserId};
    use serde_json::json;

    fn tagged(tag: &'static str) -> Arc<dyn ItemProcessor> {
        Arc::new(FnProcessor::new(move |_item| async move { Ok(json!(tag)) }))
    }

    async fn resolve_tag(registry: &ProcessorRegistry, job_type: &str) -> Option<Value> {
        let p = registry.get(job_type)?;
        Some(p.process(&CancellationToken::new(), &Value::Null).await.unwrap())
    }

    #[tokio::test]
    async fn lookup_prefers_exact_then_category_then_wildcard() {
        let registry = ProcessorRegistry::new()
            .with("report.pdf", tagged("exact"))
            .with("report.*", tagged("category"))
            .with("*", tagged("wildcard"));

        assert_eq!(resolve_tag(&registry, "report.pdf").await, Some(json!("exact")));
        assert_eq!(resolve_tag(&registry, "report.csv").await, Some(json!("category")));
        assert_eq!(resolve_tag(&registry, "reporting").await, Some(json!("wildcard")));
        assert_eq!(resolve_tag(&registry, "email").await, Some(json!("wildcard")));
    }

    #[tokio::test]
    async fn longest_category_wins() {
        let registry = ProcessorRegistry::new()
            .with("report.*", tagged("short"))
            .with("report.pdf.*", tagged("long"));

        assert_eq!(resolve_tag(&registry, "report.pdf.a4").await, Some(json!("long")));
        assert_eq!(resolve_tag(&registry, "report.csv").await, Some(json!("short")));
    }

    #[test]
    fn unknown_type_without_wildcard() {
        let mut registry = ProcessorRegistry::new();
        registry.register_fn("assessment", |v| async move { Ok(v) });
        assert!(registry.contains("assessment"));
        assert!(!registry.contains("export"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn metadata_source_reads_items() {
        let job = Job::new(TenantId::new(), "a", 0, UserId::new())
            .with_items(vec![json!(1), json!(2)]);
        assert_eq!(
            MetadataItemSource.resolve(&job).await.unwrap(),
            vec![json!(1), json!(2)]
        );

        let bare = Job::new(TenantId::new(), "a", 3, UserId::new());
        assert!(MetadataItemSource.resolve(&bare).await.unwrap().is_empty());

        let bad = bare.with_metadata(ITEMS_METADATA_KEY, json!("nope"));
        let err = MetadataItemSource.resolve(&bad).await.unwrap_err();
        assert!(err.to_string().contains("found string"));
    }
}
