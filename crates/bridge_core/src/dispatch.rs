//! Event dispatch pipeline.
//!
//! One [`UnifiedEvent`] travels through four stages, each walking its
//! callbacks by descending priority (ties in registration order):
//!
//! 1. **hook**: observes and may mutate the context, never stops the pass
//! 2. **middleware**: the first callback returning `true` ends the pass
//! 3. **event**: callbacks matched by [`EventFilter`], same contract
//! 4. **command**: message events whose text parses as a command
//!
//! Callback sets are copy-on-write: a dispatch works on the snapshot taken
//! when its stage started, so (un)registering from inside a callback never
//! affects the pass in progress.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use tracing::{trace, warn};

use crate::{
    converter::Converter,
    message::{EventKind, Scene, UnifiedEvent},
    session::Client,
};

// -----------------------------------------------------------------------------
// Context
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub name: String,
    pub args: Vec<String>,
    pub raw: String,        // the full message text
}

/// Per-dispatch bundle handed to every callback of one pass.
#[derive(Debug)]
pub struct BaseContext {
    pub event: UnifiedEvent,
    pub client: Client,
    /// Scratch space shared by the callbacks of this pass.
    pub state: HashMap<String, Value>,
    /// Set before the command stage runs.
    pub command: Option<CommandInvocation>,
}

impl BaseContext {
    pub fn new(event: UnifiedEvent, client: Client) -> Self {
        Self {
            event,
            client,
            state: HashMap::new(),
            command: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Callbacks & registration
// -----------------------------------------------------------------------------

/// A pipeline callback. `Ok(true)` means "consumed"; errors are logged and
/// count as not consumed.
#[async_trait]
pub trait Callback: Send + Sync + 'static {
    async fn call(&self, ctx: &mut BaseContext) -> Result<bool>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F> Callback for FnCallback<F>
where
    F: for<'a> Fn(&'a mut BaseContext) -> BoxFuture<'a, Result<bool>> + Send + Sync + 'static,
{
    async fn call(&self, ctx: &mut BaseContext) -> Result<bool> {
        (self.0)(ctx).await
    }
}

/// Wraps a closure returning a boxed future as a [`Callback`]:
///
/// ```ignore
/// let cb = handler_fn(|ctx| Box::pin(async move {
///     ctx.client.notify("reply", json!(ctx.event.plain_text()))?;
///     Ok(true)
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Callback>
where
    F: for<'a> Fn(&'a mut BaseContext) -> BoxFuture<'a, Result<bool>> + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

pub type Predicate = Arc<dyn Fn(&BaseContext) -> bool + Send + Sync>;

pub struct Registration {
    pub handler: Arc<dyn Callback>,
    pub priority: i32,
    pub predicate: Option<Predicate>,
}

impl Registration {
    pub fn new(handler: Arc<dyn Callback>) -> Self {
        Self {
            handler,
            priority: 0,
            predicate: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Extra guard evaluated against the context before the handler runs.
    pub fn when(mut self, predicate: impl Fn(&BaseContext) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

impl From<Arc<dyn Callback>> for Registration {
    fn from(handler: Arc<dyn Callback>) -> Self {
        Registration::new(handler)
    }
}

/// Selects events for the event stage; `None` fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(rename = "type")]
    pub kind: Option<EventKind>,
    pub scene: Option<Scene>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn kind(kind: EventKind) -> Self {
        Self { kind: Some(kind), scene: None }
    }

    pub fn in_scene(mut self, scene: Scene) -> Self {
        self.scene = Some(scene);
        self
    }

    pub fn matches(&self, event: &UnifiedEvent) -> bool {
        self.kind.is_none_or(|kind| kind == event.kind) && self.scene.is_none_or(|scene| scene == event.scene)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Hook,
    Middleware,
    Event,
    Command,
}

enum Matcher {
    Always,
    Event(EventFilter),
    Command(Vec<String>),
}

struct Entry {
    id: CallbackId,
    priority: i32,
    seq: u64,
    predicate: Option<Predicate>,
    matcher: Matcher,
    handler: Arc<dyn Callback>,
}

impl Entry {
    fn accepts(&self, ctx: &BaseContext) -> bool {
        let matched = match &self.matcher {
            Matcher::Always => true,
            Matcher::Event(filter) => filter.matches(&ctx.event),
            Matcher::Command(names) => ctx
                .command
                .as_ref()
                .is_some_and(|cmd| names.iter().any(|n| *n == cmd.name)),
        };
        matched && self.predicate.as_ref().is_none_or(|p| p(ctx))
    }
}

type Snapshot = Arc<Vec<Arc<Entry>>>;

// -----------------------------------------------------------------------------
// Command parsing
// -----------------------------------------------------------------------------

/// How message text is turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub prefix: String,
    /// Argument separator; empty means any whitespace.
    pub split: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            prefix: "/".into(),
            split: " ".into(),
        }
    }
}

impl CommandConfig {
    /// `None` when `text` does not start with the prefix or names nothing.
    pub fn parse(&self, text: &str) -> Option<CommandInvocation> {
        let rest = text.trim_start().strip_prefix(self.prefix.as_str())?;
        let mut pieces: Vec<String> = if self.split.is_empty() {
            rest.split_whitespace().map(str::to_string).collect()
        } else {
            rest.split(self.split.as_str())
                .filter(|piece| !piece.is_empty())
                .map(str::to_string)
                .collect()
        };
        if pieces.is_empty() {
            return None;
        }
        let name = pieces.remove(0);
        Some(CommandInvocation {
            name,
            args: pieces,
            raw: text.to_string(),
        })
    }
}

// -----------------------------------------------------------------------------
// Dispatcher
// -----------------------------------------------------------------------------

struct Stages {
    hook: Mutex<Snapshot>,
    middleware: Mutex<Snapshot>,
    event: Mutex<Snapshot>,
    command: Mutex<Snapshot>,
}

impl Stages {
    fn get(&self, stage: Stage) -> &Mutex<Snapshot> {
        match stage {
            Stage::Hook => &self.hook,
            Stage::Middleware => &self.middleware,
            Stage::Event => &self.event,
            Stage::Command => &self.command,
        }
    }
}

struct DispatcherInner {
    config: CommandConfig,
    stages: Stages,
    next_id: AtomicU64,
}

/// The pipeline. Clones share callbacks.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(CommandConfig::default())
    }
}

impl Dispatcher {
    pub fn new(config: CommandConfig) -> Self {
        let empty = || Mutex::new(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                stages: Stages {
                    hook: empty(),
                    middleware: empty(),
                    event: empty(),
                    command: empty(),
                },
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CommandConfig {
        &self.inner.config
    }

    pub fn hook(&self, registration: impl Into<Registration>) -> CallbackId {
        self.register(Stage::Hook, Matcher::Always, registration.into())
    }

    pub fn middleware(&self, registration: impl Into<Registration>) -> CallbackId {
        self.register(Stage::Middleware, Matcher::Always, registration.into())
    }

    pub fn on_event(&self, filter: EventFilter, registration: impl Into<Registration>) -> CallbackId {
        self.register(Stage::Event, Matcher::Event(filter), registration.into())
    }

    pub fn command<I, S>(&self, names: I, registration: impl Into<Registration>) -> CallbackId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        self.register(Stage::Command, Matcher::Command(names), registration.into())
    }

    fn register(&self, stage: Stage, matcher: Matcher, registration: Registration) -> CallbackId {
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = CallbackId(seq);
        let entry = Arc::new(Entry {
            id,
            priority: registration.priority,
            seq,
            predicate: registration.predicate,
            matcher,
            handler: registration.handler,
        });

        let mut slot = lock(self.inner.stages.get(stage));
        let mut next: Vec<Arc<Entry>> = slot.as_ref().clone();
        next.push(entry);
        next.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        *slot = Arc::new(next);
        trace!(%stage, callback = %id, "callback registered");
        id
    }

    /// Removes a callback from whichever stage holds it.
    pub fn unregister(&self, id: CallbackId) -> bool {
        for stage in [Stage::Hook, Stage::Middleware, Stage::Event, Stage::Command] {
            let mut slot = lock(self.inner.stages.get(stage));
            if slot.iter().any(|entry| entry.id == id) {
                let next: Vec<Arc<Entry>> = slot.iter().filter(|e| e.id != id).cloned().collect();
                *slot = Arc::new(next);
                trace!(%stage, callback = %id, "callback removed");
                return true;
            }
        }
        false
    }

    /// Registered callbacks in `stage`.
    pub fn len(&self, stage: Stage) -> usize {
        lock(self.inner.stages.get(stage)).len()
    }

    /// Groups registrations so they can be removed together.
    pub fn scope(&self, name: impl Into<String>) -> PluginScope {
        PluginScope {
            name: name.into(),
            dispatcher: self.clone(),
            ids: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self, stage: Stage) -> Snapshot {
        lock(self.inner.stages.get(stage)).clone()
    }

    /// Runs one pass for `event`. Returns whether any stage consumed it.
    pub async fn handle(&self, event: UnifiedEvent, client: &Client) -> bool {
        let mut ctx = BaseContext::new(event, client.clone());
        self.run(&mut ctx).await
    }

    /// Like [`Dispatcher::handle`] for a context the caller keeps.
    pub async fn run(&self, ctx: &mut BaseContext) -> bool {
        for entry in self.snapshot(Stage::Hook).iter() {
            if entry.accepts(ctx) {
                invoke(Stage::Hook, entry, ctx).await;
            }
        }
        if self.run_stage(Stage::Middleware, ctx).await {
            return true;
        }
        if self.run_stage(Stage::Event, ctx).await {
            return true;
        }
        if ctx.event.kind != EventKind::Message {
            return false;
        }
        let Some(command) = self.inner.config.parse(&ctx.event.plain_text()) else {
            return false;
        };
        ctx.command = Some(command);
        self.run_stage(Stage::Command, ctx).await
    }

    async fn run_stage(&self, stage: Stage, ctx: &mut BaseContext) -> bool {
        for entry in self.snapshot(stage).iter() {
            if entry.accepts(ctx) && invoke(stage, entry, ctx).await {
                trace!(%stage, callback = %entry.id, event = %ctx.event.id, "event consumed");
                return true;
            }
        }
        false
    }

    /// Converts `native` and runs a pass. Conversion errors are logged and
    /// count as not consumed.
    pub async fn dispatch_native<C>(&self, converter: &C, native: C::Native, client: &Client) -> bool
    where
        C: Converter + ?Sized,
    {
        match converter.convert(native).await {
            Ok(event) => self.handle(event, client).await,
            Err(err) => {
                warn!(platform = converter.platform(), session = %client.id(), error = %err, "event conversion failed");
                false
            }
        }
    }
}

async fn invoke(stage: Stage, entry: &Entry, ctx: &mut BaseContext) -> bool {
    match entry.handler.call(ctx).await {
        Ok(consumed) => consumed,
        Err(err) => {
            warn!(%stage, callback = %entry.id, event = %ctx.event.id, error = %err, "dispatch callback failed");
            false
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("hook", &self.len(Stage::Hook))
            .field("middleware", &self.len(Stage::Middleware))
            .field("event", &self.len(Stage::Event))
            .field("command", &self.len(Stage::Command))
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Plugin scope
// -----------------------------------------------------------------------------

/// Registrations made on behalf of one plugin. [`PluginScope::unload`]
/// removes all of them.
pub struct PluginScope {
    name: String,
    dispatcher: Dispatcher,
    ids: Mutex<Vec<CallbackId>>,
}

impl PluginScope {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn track(&self, id: CallbackId) -> CallbackId {
        lock(&self.ids).push(id);
        id
    }

    pub fn hook(&self, registration: impl Into<Registration>) -> CallbackId {
        self.track(self.dispatcher.hook(registration))
    }

    pub fn middleware(&self, registration: impl Into<Registration>) -> CallbackId {
        self.track(self.dispatcher.middleware(registration))
    }

    pub fn on_event(&self, filter: EventFilter, registration: impl Into<Registration>) -> CallbackId {
        self.track(self.dispatcher.on_event(filter, registration))
    }

    pub fn command<I, S>(&self, names: I, registration: impl Into<Registration>) -> CallbackId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.track(self.dispatcher.command(names, registration))
    }

    /// Unregisters everything this scope registered; returns how many were
    /// still present.
    pub fn unload(&self) -> usize {
        let ids = std::mem::take(&mut *lock(&self.ids));
        let removed = ids.into_iter().filter(|id| self.dispatcher.unregister(*id)).count();
        trace!(plugin = %self.name, removed, "plugin unloaded");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing() {
        let config = CommandConfig::default();
        let cmd = config.parse("/ping a b").unwrap();
        assert_eq!(cmd.name, "ping");
        assert_eq!(cmd.args, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cmd.raw, "/ping a b");

        assert!(config.parse("ping a b").is_none());
        assert!(config.parse("/").is_none());
        assert_eq!(config.parse("/echo  x   y").unwrap().args, vec!["x", "y"]);
    }

    #[test]
    fn custom_prefix_and_whitespace_split() {
        let config = CommandConfig { prefix: "!!".into(), split: String::new() };
        let cmd = config.parse("  !!roll\t2d6  now").unwrap();
        assert_eq!(cmd.name, "roll");
        assert_eq!(cmd.args, vec!["2d6", "now"]);
        assert!(config.parse("!roll").is_none());
    }

    #[test]
    fn filters_match_kind_and_scene() {
        let event = UnifiedEvent::text_message(Scene::Group, "onebot11", "hi");
        assert!(EventFilter::any().matches(&event));
        assert!(EventFilter::kind(EventKind::Message).matches(&event));
        assert!(EventFilter::kind(EventKind::Message).in_scene(Scene::Group).matches(&event));
        assert!(!EventFilter::kind(EventKind::Notice).matches(&event));
        assert!(!EventFilter::any().in_scene(Scene::User).matches(&event));
    }
}
