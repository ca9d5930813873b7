//! The manager's remote surface: call names, their argument shapes and a
//! typed client over [`Client::request`].

use anyhow::{Context, Result};
use bridge_core::{Client, Endpoint, HandleMap, SessionOptions, UnifiedEvent};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tokio::sync::mpsc;
use tracing::warn;

use crate::logger::{LogLevel, LoggerEvent};
use crate::notice::Notice;

/// Call names served by a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase")]
pub enum ManagerMethod {
    Stop,
    GetLog,
    FollowLog,
    UnfollowLog,
    ListNotice,
    HandleNotice,
    /// A unified event pushed by an implementation for dispatch.
    Event,
}

/// Notification a manager pushes to log followers.
pub const LOG_NOTIFICATION: &str = "log";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GetLogParams {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,      // only records newer than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,             // at most this many, newest kept
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FollowLogParams {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HandleNoticeParams {
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct EventAck {
    pub consumed: bool,
}

/// Decodes call arguments, treating a missing payload as `{}`.
pub fn params<T: DeserializeOwned>(method: ManagerMethod, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).with_context(|| format!("invalid arguments for `{method}`"))
}

/// Typed calls against a connected manager.
#[derive(Clone, Debug)]
pub struct ManagerApi {
    client: Client,
}

impl ManagerApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects with `handles` serving calls the manager makes back.
    pub async fn connect(endpoint: &Endpoint, options: SessionOptions, handles: HandleMap) -> Result<Self> {
        let client = Client::connect(endpoint, options, handles)
            .await
            .with_context(|| format!("cannot reach manager at {endpoint}"))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: ManagerMethod, args: &P) -> Result<R> {
        let args = serde_json::to_value(args)?;
        let reply = self.client.request(method.as_ref(), args).await?;
        serde_json::from_value(reply).with_context(|| format!("unexpected reply to `{method}`"))
    }

    pub async fn stop(&self) -> Result<()> {
        self.call::<_, Value>(ManagerMethod::Stop, &Value::Null).await?;
        Ok(())
    }

    pub async fn get_log(&self, params: &GetLogParams) -> Result<Vec<LoggerEvent>> {
        self.call(ManagerMethod::GetLog, params).await
    }

    pub async fn follow_log(&self, level: LogLevel) -> Result<()> {
        self.call::<_, Value>(ManagerMethod::FollowLog, &FollowLogParams { level }).await?;
        Ok(())
    }

    /// `false` when this session was not following.
    pub async fn unfollow_log(&self) -> Result<bool> {
        self.call(ManagerMethod::UnfollowLog, &Value::Null).await
    }

    pub async fn list_notice(&self) -> Result<Vec<Notice>> {
        self.call(ManagerMethod::ListNotice, &Value::Null).await
    }

    pub async fn handle_notice(&self, id: &str, data: Value) -> Result<()> {
        let params = HandleNoticeParams { id: id.to_string(), data };
        self.call::<_, Value>(ManagerMethod::HandleNotice, &params).await?;
        Ok(())
    }

    /// Pushes `event` through the manager's dispatch pipeline.
    pub async fn send_event(&self, event: &UnifiedEvent) -> Result<bool> {
        let ack: EventAck = self.call(ManagerMethod::Event, event).await?;
        Ok(ack.consumed)
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

/// Handles that forward `log` notifications into `tx`.
pub fn log_receiver(tx: mpsc::UnboundedSender<LoggerEvent>) -> HandleMap {
    HandleMap::new().with(LOG_NOTIFICATION, move |args, _client| {
        let tx = tx.clone();
        async move {
            match serde_json::from_value::<LoggerEvent>(args) {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => warn!(error = %err, "malformed log notification"),
            }
            Ok(Value::Null)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn method_names_are_camel_case() {
        let names: Vec<String> = ManagerMethod::iter().map(|m| m.to_string()).collect();
        assert_eq!(
            names,
            vec!["stop", "getLog", "followLog", "unfollowLog", "listNotice", "handleNotice", "event"]
        );
        assert_eq!("handleNotice".parse::<ManagerMethod>().unwrap(), ManagerMethod::HandleNotice);
    }

    #[test]
    fn missing_arguments_use_defaults() {
        let p: GetLogParams = params(ManagerMethod::GetLog, Value::Null).unwrap();
        assert_eq!(p, GetLogParams::default());

        let p: GetLogParams = params(ManagerMethod::GetLog, json!({"level": "warn", "lines": 5})).unwrap();
        assert_eq!(p.level, LogLevel::Warn);
        assert_eq!(p.lines, Some(5));

        let err = params::<HandleNoticeParams>(ManagerMethod::HandleNotice, json!({})).unwrap_err();
        assert!(err.to_string().contains("handleNotice"));
    }
}
