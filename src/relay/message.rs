use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::{StorageAction, StorageScope};

/// Every message that crosses the relay, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum RelayMessage {
    TogglePicker {
        enabled: bool,
    },
    ToggleSnipper {
        enabled: bool,
    },
    ElementPicked {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },
    /// `data` is a `data:image/...;base64,` URL
    ScreenshotCaptured {
        data: String,
    },
    StorageRequest {
        scope: StorageScope,
    },
    StorageUpdate {
        scope: StorageScope,
        action: StorageAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    StorageData {
        scope: StorageScope,
        data: BTreeMap<String, String>,
    },
    ToggleInternalDevTools {
        #[serde(alias = "chiiUrl")]
        url: String,
        #[serde(rename = "autoOpen", default, skip_serializing_if = "Option::is_none")]
        auto_open: Option<bool>,
    },
    UpdateChiiUrl {
        #[serde(alias = "chiiUrl")]
        url: String,
    },
    PickerEligibility {
        eligible: bool,
    },
    OpenDevTools,
    LoadUrl {
        url: String,
    },
    UpdateUrl {
        url: String,
    },
    DevToolsStatus {
        error: String,
    },
}

impl RelayMessage {
    /// Parse a raw JSON frame. Malformed input and unknown commands yield `None`.
    pub fn parse(raw: &str) -> Option<RelayMessage> {
        match serde_json::from_str(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::debug!("Dropping relay message: {} ({})", e, truncate(raw, 120));
                None
            }
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            RelayMessage::TogglePicker { .. } => "togglePicker",
            RelayMessage::ToggleSnipper { .. } => "toggleSnipper",
            RelayMessage::ElementPicked { .. } => "elementPicked",
            RelayMessage::ScreenshotCaptured { .. } => "screenshotCaptured",
            RelayMessage::StorageRequest { .. } => "storageRequest",
            RelayMessage::StorageUpdate { .. } => "storageUpdate",
            RelayMessage::StorageData { .. } => "storageData",
            RelayMessage::ToggleInternalDevTools { .. } => "toggleInternalDevTools",
            RelayMessage::UpdateChiiUrl { .. } => "updateChiiUrl",
            RelayMessage::PickerEligibility { .. } => "pickerEligibility",
            RelayMessage::OpenDevTools => "openDevTools",
            RelayMessage::LoadUrl { .. } => "loadUrl",
            RelayMessage::UpdateUrl { .. } => "updateUrl",
            RelayMessage::DevToolsStatus { .. } => "devToolsStatus",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_commands_by_tag() {
        assert_eq!(
            RelayMessage::parse(r#"{"command":"togglePicker","enabled":true}"#),
            Some(RelayMessage::TogglePicker { enabled: true })
        );
        assert_eq!(
            RelayMessage::parse(r#"{"command":"openDevTools","extra":1}"#),
            Some(RelayMessage::OpenDevTools)
        );
        assert_eq!(
            RelayMessage::parse(r#"{"command":"storageUpdate","scope":"local","action":"clear"}"#),
            Some(RelayMessage::StorageUpdate {
                scope: StorageScope::Local,
                action: StorageAction::Clear,
                key: None,
                value: None,
            })
        );
    }

    #[test]
    fn chii_url_is_accepted_as_url() {
        let msg = RelayMessage::parse(r#"{"command":"updateChiiUrl","chiiUrl":"http://x/"}"#).unwrap();
        assert_eq!(msg, RelayMessage::UpdateChiiUrl { url: "http://x/".into() });

        let msg = RelayMessage::parse(
            r#"{"command":"toggleInternalDevTools","chiiUrl":"http://x/","autoOpen":false}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            RelayMessage::ToggleInternalDevTools {
                url: "http://x/".into(),
                auto_open: Some(false)
            }
        );
    }

    #[test]
    fn malformed_and_unknown_are_dropped() {
        assert!(RelayMessage::parse("not json").is_none());
        assert!(RelayMessage::parse(r#"{"command":"getBookmarks"}"#).is_none());
        assert!(RelayMessage::parse(r#"{"command":"togglePicker"}"#).is_none());
        assert!(RelayMessage::parse(r#"{"enabled":true}"#).is_none());
        assert!(RelayMessage::parse(r#"{"command":"storageRequest","scope":"cookies"}"#).is_none());
    }

    #[test]
    fn serializes_with_command_tag() {
        let value = serde_json::to_value(RelayMessage::StorageData {
            scope: StorageScope::Session,
            data: BTreeMap::from([("a".to_string(), "1".to_string())]),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "command": "storageData", "scope": "session", "data": { "a": "1" } })
        );

        let value = serde_json::to_value(RelayMessage::OpenDevTools).unwrap();
        assert_eq!(value, json!({ "command": "openDevTools" }));
    }

    #[test]
    fn command_matches_serialized_tag() {
        let samples = [
            RelayMessage::PickerEligibility { eligible: true },
            RelayMessage::DevToolsStatus { error: "e".into() },
            RelayMessage::ToggleInternalDevTools { url: "u".into(), auto_open: None },
            RelayMessage::LoadUrl { url: "u".into() },
        ];
        for msg in samples {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["command"], msg.command());
        }
    }
}
