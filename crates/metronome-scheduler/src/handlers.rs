//! Handler registry — maps a definition's `handler_ref` string to an
//! invokable unit of work. Populated once at process startup, before
//! recovery runs; resolved again at every fire.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metronome_core::{MetronomeError, Result};

use crate::definition::RunTrigger;

/// Context handed to a handler for one fire.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub name: String,
    pub group: String,
    pub fired_at: DateTime<Utc>,
    pub trigger: RunTrigger,
}

/// One schedulable unit of work. Implementations are registered under a
/// string identifier and must tolerate being invoked concurrently when
/// the job's policy is AllowOverlap.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

impl std::fmt::Debug for dyn JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<JobHandler>")
    }
}

/// Wrap a plain async closure as a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// String-keyed registry of handlers. Shared behind an `Arc`; the host
/// registers everything at startup, before recovery runs.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Last registration for a ref wins.
    pub fn register(&self, handler_ref: &str, handler: Arc<dyn JobHandler>) {
        tracing::debug!("Handler registered: {handler_ref}");
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .insert(handler_ref.to_string(), handler);
    }

    /// Convenience: register an async closure.
    pub fn register_fn<F, Fut>(&self, handler_ref: &str, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register(handler_ref, Arc::new(FnHandler(f)));
    }

    /// Look up a handler, failing fast for unknown refs.
    pub fn resolve(&self, handler_ref: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .get(handler_ref)
            .cloned()
            .ok_or_else(|| MetronomeError::HandlerNotFound(handler_ref.to_string()))
    }

    /// All registered refs, for diagnostics.
    pub fn refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .handlers
            .read()
            .expect("handler registry poisoned")
            .keys()
            .cloned()
            .collect();
        refs.sort();
        refs
    }
}
