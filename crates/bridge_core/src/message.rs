use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Transport-agnostic event produced by a protocol converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnifiedEvent {
    pub id: String,                      // converter-provided or a fresh UUID
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub scene: Scene,
    pub platform: String,                // "onebot11", "console", ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_id: Option<String>,         // the bot account the event arrived on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Participant>,     // group, channel or peer user
    #[serde(default)]
    pub message: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,          // sub type, e.g. "friend_add" for notices
    #[serde(default)]
    pub payload: Value,                  // the native event, untouched
    pub time: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Message,
    Notice,
    Request,
    Meta,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Scene {
    User,
    Group,
    Channel,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self { id: id.into(), name }
    }
}

/// One piece of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Segment {
    Text { text: String },
    At { target: String },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Reply { id: String },
    /// Anything a converter has no dedicated segment for.
    Other { kind: String, data: Value },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text { text: text.into() }
    }
}

impl UnifiedEvent {
    pub fn new(kind: EventKind, scene: Scene, platform: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            scene,
            platform: platform.into(),
            self_id: None,
            sender: None,
            target: None,
            message: Vec::new(),
            detail: None,
            payload: Value::Null,
            time: Utc::now(),
        }
    }

    /// Shorthand for a message event whose body is plain text.
    pub fn text_message(scene: Scene, platform: impl Into<String>, text: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::Message, scene, platform);
        event.message.push(Segment::text(text));
        event
    }

    pub fn with_sender(mut self, sender: Participant) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_target(mut self, target: Participant) -> Self {
        self.target = Some(target);
        self
    }

    /// Concatenation of every text segment, in order.
    pub fn plain_text(&self) -> String {
        self.message
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}
