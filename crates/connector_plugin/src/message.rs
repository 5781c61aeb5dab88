use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Render hint for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

impl MessageFormat {
    /// Parses a format name; anything unknown falls back to plain text.
    pub fn from_name(name: &str) -> Self {
        match name {
            "markdown" => MessageFormat::Markdown,
            "html" => MessageFormat::Html,
            _ => MessageFormat::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Text => "text",
            MessageFormat::Markdown => "markdown",
            MessageFormat::Html => "html",
        }
    }
}

/// One message handed to a platform connector for delivery.
///
/// Reply buttons and the contact-share request are rendered as the
/// platform's keyboard; connectors without keyboard support may ignore
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutboundMessage {
    pub text: String,
    pub buttons: Option<Vec<String>>,
    pub format: MessageFormat,
    pub request_contact: bool,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: None,
            format: MessageFormat::Text,
            request_contact: false,
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<String>) -> Self {
        self.buttons = if buttons.is_empty() { None } else { Some(buttons) };
        self
    }

    pub fn with_format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_request_contact(mut self, request_contact: bool) -> Self {
        self.request_contact = request_contact;
        self
    }
}

/// One message received from a platform, as handed to the engine.
///
/// `user_data` carries platform-supplied attributes of the sender
/// (display name, locale, shared contact, ...); the key `username` is
/// treated as the display name.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InboundMessage {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub user_data: HashMap<String, Value>,
}

impl InboundMessage {
    pub fn new(user_id: impl Into<String>, platform: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            platform: platform.into(),
            text: text.into(),
            timestamp: Utc::now(),
            user_data: HashMap::new(),
        }
    }

    pub fn with_user_data(mut self, user_data: HashMap<String, Value>) -> Self {
        self.user_data = user_data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_from_name() {
        assert_eq!(MessageFormat::from_name("markdown"), MessageFormat::Markdown);
        assert_eq!(MessageFormat::from_name("html"), MessageFormat::Html);
        assert_eq!(MessageFormat::from_name("text"), MessageFormat::Text);
        assert_eq!(MessageFormat::from_name("whatever"), MessageFormat::Text);
    }

    #[test]
    fn test_outbound_builders() {
        let msg = OutboundMessage::text("hi")
            .with_buttons(vec!["A".into(), "B".into()])
            .with_format(MessageFormat::Markdown)
            .with_request_contact(true);

        assert_eq!(msg.text, "hi");
        assert_eq!(msg.buttons, Some(vec!["A".to_string(), "B".to_string()]));
        assert_eq!(msg.format, MessageFormat::Markdown);
        assert!(msg.request_contact);
    }

    #[test]
    fn test_empty_buttons_normalize_to_none() {
        let msg = OutboundMessage::text("hi").with_buttons(vec![]);
        assert_eq!(msg.buttons, None);
    }

    #[test]
    fn test_inbound_message_round_trip() {
        let mut data = HashMap::new();
        data.insert("username".to_string(), json!("alice"));

        let msg = InboundMessage::new("42", "telegram", "hello").with_user_data(data);
        let text = serde_json::to_string(&msg).unwrap();
        let back: InboundMessage = serde_json::from_str(&text).unwrap();

        assert_eq!(back.user_id, "42");
        assert_eq!(back.platform, "telegram");
        assert_eq!(back.user_data.get("username"), Some(&json!("alice")));
    }
}
