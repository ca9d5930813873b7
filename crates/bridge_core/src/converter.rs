use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::message::UnifiedEvent;

/// Turns a platform-native event into a [`UnifiedEvent`].
///
/// Implementations may look things up but must not change session state.
#[async_trait]
pub trait Converter: Send + Sync {
    type Native: Send;

    /// Platform tag written into converted events, e.g. `"onebot11"`.
    fn platform(&self) -> &str;

    async fn convert(&self, native: Self::Native) -> Result<UnifiedEvent>;
}

/// For peers that already speak the unified model as JSON.
#[derive(Debug, Clone)]
pub struct UnifiedConverter {
    platform: String,
}

impl UnifiedConverter {
    pub fn new(platform: impl Into<String>) -> Self {
        Self { platform: platform.into() }
    }
}

#[async_trait]
impl Converter for UnifiedConverter {
    type Native = Value;

    fn platform(&self) -> &str {
        &self.platform
    }

    async fn convert(&self, native: Value) -> Result<UnifiedEvent> {
        let mut event: UnifiedEvent =
            serde_json::from_value(native).context("payload is not a unified event")?;
        if event.platform.is_empty() {
            event.platform = self.platform.clone();
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fills_in_missing_platform() {
        let converter = UnifiedConverter::new("console");
        let event = converter
            .convert(json!({
                "id": "1",
                "type": "message",
                "scene": "user",
                "platform": "",
                "message": [{"type": "text", "text": "hello"}],
                "time": "2024-05-01T10:00:00Z"
            }))
            .await
            .unwrap();
        assert_eq!(event.platform, "console");
        assert_eq!(event.plain_text(), "hello");
    }

    #[tokio::test]
    async fn rejects_foreign_payloads() {
        let converter = UnifiedConverter::new("console");
        assert!(converter.convert(json!({"post_type": "message"})).await.is_err());
    }
}
