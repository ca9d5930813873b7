use std::{future::Future, sync::Arc};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::session::Client;

/// One inbound call handler. Errors are returned to the caller as the
/// `error` field of the reply.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, args: Value, client: Client) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Value, client: Client) -> Result<Value> {
        (self.0)(args, client).await
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handle_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value, Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Call name → handler table shared by every session it is handed to.
///
/// Cloning is cheap and clones see the same entries, so handlers added after a
/// server starts are visible to sessions that are already open.
#[derive(Clone, Default)]
pub struct HandleMap {
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous entry.
    pub fn insert(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Builder form of [`HandleMap::insert`] for closures.
    pub fn with<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(name.into(), handle_fn(f));
        self
    }

    pub fn remove(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Looks up `name` and runs it. The map lock is released before the
    /// handler is awaited.
    pub async fn invoke(&self, name: &str, args: Value, client: Client) -> Result<Value> {
        let handler = self
            .get(name)
            .ok_or_else(|| anyhow!("unknown method `{name}`"))?;
        handler.call(args, client).await
    }
}

impl std::fmt::Debug for HandleMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_shared_between_clones() {
        let handles = HandleMap::new().with("echo", |args, _client| async move { Ok(args) });
        let clone = handles.clone();
        clone.insert("ping", handle_fn(|_, _| async { Ok(Value::from("pong")) }));

        assert!(handles.contains("ping"));
        assert_eq!(handles.names(), vec!["echo".to_string(), "ping".to_string()]);
        assert!(handles.remove("echo"));
        assert!(!clone.contains("echo"));
    }
}
