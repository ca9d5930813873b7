use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use bridge_core::Client;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber, debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Severity used by the log hub and the manager API. `critical` has no
/// tracing counterpart and is only ever requested, never produced.
#[derive(
    Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd,
    Ord, Hash, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl LogLevel {
    pub fn filter(&self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,   // daily rolling `botbridge.log` when set
    pub json: bool,                 // json lines instead of the pretty stderr format
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self { log_level, log_dir, json: false }
    }
}

/// One captured log record, as returned by `getLog` and pushed to followers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LoggerEvent {
    pub level: LogLevel,
    pub time: DateTime<Utc>,
    pub target: String,
    pub message: String,
}

impl LoggerEvent {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            time: Utc::now(),
            target: target.into(),
            message: message.into(),
        }
    }
}

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

thread_local! {
    // set while fanning out, so log lines produced by the fan-out itself are dropped
    static FANNING_OUT: Cell<bool> = const { Cell::new(false) };
}

struct Follower {
    level: LogLevel,
    client: Client,
}

/// Recent log history plus live followers.
///
/// The hub keeps the last `capacity` records in memory. Sessions that
/// follow the log get every later record at or above their level as a `log`
/// notification; a follower is dropped as soon as its session closes, a
/// push to it fails or its write queue reaches the high-water mark.
pub struct LogHub {
    capacity: usize,
    ring: Mutex<VecDeque<LoggerEvent>>,
    followers: DashMap<String, Follower>,
    // sessions that already carry a close hook
    hooked: DashMap<String, ()>,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl std::fmt::Debug for LogHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHub")
            .field("capacity", &self.capacity)
            .field("followers", &self.followers.len())
            .finish()
    }
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, DEFAULT_LOG_CAPACITY))),
            followers: DashMap::new(),
            hooked: DashMap::new(),
        }
    }

    /// Records `event` and forwards it to matching followers.
    pub fn push(&self, event: LoggerEvent) {
        if FANNING_OUT.with(Cell::get) {
            return;
        }
        {
            let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        if self.followers.is_empty() {
            return;
        }

        FANNING_OUT.with(|flag| flag.set(true));
        let payload = serde_json::to_value(&event).unwrap_or_default();
        let mut gone = Vec::new();
        let mut lagging = Vec::new();
        for follower in self.followers.iter() {
            if event.level < follower.level {
                continue;
            }
            match follower.client.notify("log", payload.clone()) {
                Ok(true) => {}
                Ok(false) => lagging.push(follower.key().clone()),
                Err(_) => gone.push(follower.key().clone()),
            }
        }
        FANNING_OUT.with(|flag| flag.set(false));

        for id in gone {
            self.followers.remove(&id);
        }
        for id in lagging {
            if self.followers.remove(&id).is_some() {
                warn!(session = %id, "log follower is not reading, dropped");
            }
        }
    }

    /// Records at or above `level`, newer than `since` when given, keeping
    /// only the last `lines` when given. Oldest first.
    pub fn recent(
        &self,
        level: LogLevel,
        since: Option<DateTime<Utc>>,
        lines: Option<usize>,
    ) -> Vec<LoggerEvent> {
        let ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<LoggerEvent> = ring
            .iter()
            .filter(|e| e.level >= level)
            .filter(|e| since.is_none_or(|t| e.time > t))
            .cloned()
            .collect();
        if let Some(n) = lines {
            let skip = out.len().saturating_sub(n);
            out.drain(..skip);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts (or re-levels) streaming to `client`.
    pub fn follow(self: &Arc<Self>, client: &Client, level: LogLevel) {
        let id = client.id().to_string();
        self.followers
            .insert(id.clone(), Follower { level, client: client.clone() });
        if self.hooked.insert(id.clone(), ()).is_none() {
            let hub: Weak<LogHub> = Arc::downgrade(self);
            client.on_close(move |_| {
                if let Some(hub) = hub.upgrade() {
                    hub.followers.remove(&id);
                    hub.hooked.remove(&id);
                }
            });
        }
        debug!(session = %client.id(), level = %level, "log follower added");
    }

    pub fn unfollow(&self, session_id: &str) -> bool {
        self.followers.remove(session_id).is_some()
    }

    pub fn is_following(&self, session_id: &str) -> bool {
        self.followers.contains_key(session_id)
    }

    pub fn followers(&self) -> usize {
        self.followers.len()
    }

    pub fn layer(self: &Arc<Self>) -> LogHubLayer {
        LogHubLayer { hub: self.clone() }
    }
}

/// `tracing` layer feeding every event that passes the global filter into a
/// [`LogHub`].
pub struct LogHubLayer {
    hub: Arc<LogHub>,
}

impl<S: Subscriber> Layer<S> for LogHubLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.hub.push(LoggerEvent::new(
            LogLevel::from(meta.level()),
            meta.target(),
            visitor.finish(),
        ));
    }
}

/// Flattens an event into `message key=value ...`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.field(field.name(), format_args!("{value:?}"));
        }
    }
}

/// Installs the global subscriber: an `EnvFilter` (`RUST_LOG` wins over the
/// configured level), a stderr formatter, an optional daily rolling file and
/// the hub capture layer.
///
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init_tracing(config: &LogConfig, hub: &Arc<LogHub>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level.filter().into())
        .from_env_lossy();

    let (stderr_pretty, stderr_json) = if config.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_target(true).with_writer(std::io::stderr)), None)
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "botbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stderr_pretty)
        .with(stderr_json)
        .with(file_layer)
        .with(hub.layer())
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{HandleMap, SessionOptions};
    use chrono::Duration;
    use serde_json::Value;
    use std::time::Duration as StdDuration;
    use tokio::{sync::mpsc, time::timeout};

    fn event(level: LogLevel, message: &str) -> LoggerEvent {
        LoggerEvent::new(level, "test", message)
    }

    #[test]
    fn levels_order_and_parse() {
        assert!(LogLevel::Trace < LogLevel::Critical);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Critical.to_string(), "critical");
        assert_eq!(serde_json::to_string(&LogLevel::Debug).unwrap(), "\"debug\"");
    }

    #[test]
    fn ring_keeps_only_the_newest() {
        let hub = LogHub::new(3);
        for i in 0..5 {
            hub.push(event(LogLevel::Info, &i.to_string()));
        }
        let messages: Vec<_> = hub.recent(LogLevel::Trace, None, None).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["2", "3", "4"]);
    }

    #[test]
    fn recent_filters_by_level_time_and_count() {
        let hub = LogHub::new(10);
        let mut old = event(LogLevel::Error, "old");
        old.time = Utc::now() - Duration::minutes(10);
        hub.push(old);
        hub.push(event(LogLevel::Debug, "noise"));
        hub.push(event(LogLevel::Warn, "a"));
        hub.push(event(LogLevel::Error, "b"));

        let warn: Vec<_> = hub.recent(LogLevel::Warn, None, None).into_iter().map(|e| e.message).collect();
        assert_eq!(warn, vec!["old", "a", "b"]);

        let since = Some(Utc::now() - Duration::minutes(1));
        let fresh: Vec<_> = hub.recent(LogLevel::Warn, since, None).into_iter().map(|e| e.message).collect();
        assert_eq!(fresh, vec!["a", "b"]);

        let last: Vec<_> = hub.recent(LogLevel::Trace, None, Some(1)).into_iter().map(|e| e.message).collect();
        assert_eq!(last, vec!["b"]);
        assert!(hub.recent(LogLevel::Critical, None, None).is_empty());
    }

    async fn session_pair(hub_side: SessionOptions) -> (Client, Client, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handles = HandleMap::new().with("log", move |args, _client| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(args);
                Ok(Value::Null)
            }
        });
        let (follower, hub_end) = Client::pair(
            (SessionOptions::named("impl"), handles),
            (hub_side, HandleMap::new()),
        )
        .await
        .unwrap();
        (follower, hub_end, rx)
    }

    #[tokio::test]
    async fn refollowing_registers_one_close_hook() {
        let hub = Arc::new(LogHub::new(10));
        let (follower, hub_end, _rx) = session_pair(SessionOptions::named("manager")).await;

        for level in [LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            hub.follow(&hub_end, level);
            assert!(hub.unfollow(hub_end.id()));
        }
        hub.follow(&hub_end, LogLevel::Trace);
        // every close hook holds one weak reference to the hub
        assert_eq!(Arc::weak_count(&hub), 1);
        assert!(hub.is_following(hub_end.id()));

        follower.close().await;
        hub_end.closed().await;
        assert_eq!(hub.followers(), 0);
        assert!(hub.hooked.is_empty());
        assert_eq!(Arc::weak_count(&hub), 0);
    }

    #[tokio::test]
    async fn followers_that_fall_behind_are_dropped() {
        let hub = Arc::new(LogHub::new(100));
        let (_follower, hub_end, mut rx) = session_pair(SessionOptions {
            high_water: 4,
            ..SessionOptions::named("manager")
        })
        .await;
        hub.follow(&hub_end, LogLevel::Trace);

        // nothing yields between pushes, so the writer never gets to drain
        for i in 0..20 {
            hub.push(event(LogLevel::Info, &i.to_string()));
        }
        assert_eq!(hub.followers(), 0);
        assert_eq!(hub_end.queued(), 4);
        assert_eq!(hub.len(), 20);
        assert!(hub_end.is_open());

        let first = timeout(StdDuration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first["message"], "0");
    }

    #[test]
    fn visitor_joins_message_and_fields() {
        let mut visitor = MessageVisitor::default();
        visitor.message = "listening".into();
        visitor.field("addr", format_args!("{}", "127.0.0.1:7700"));
        visitor.field("max", format_args!("{:?}", Some(4)));
        assert_eq!(visitor.finish(), "listening addr=127.0.0.1:7700 max=Some(4)");
    }
}
