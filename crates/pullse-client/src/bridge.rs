//! Cross-frame control protocol between the embedding host page and the
//! widget iframe.
//!
//! Frames are JSON objects shaped `{type, ...payload}` delivered over a
//! generic cross-document messaging primitive.  Receivers validate the
//! message origin against an allow-list first; anything from an unlisted
//! origin is discarded silently (never surfaced, by contract).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Host -> widget: merge options into the widget configuration.
pub const FRAME_CHAT_OPTIONS: &str = "PULLSE_CHAT_OPTIONS";

/// Widget -> host: hide/unmount the iframe.
pub const FRAME_CLOSE_WIDGET: &str = "PULLSE_CLOSE_WIDGET";

/// Widget configuration pushed from the host page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl WidgetOptions {
    /// Field-wise merge: present fields overwrite, absent fields keep their
    /// current values; labels merge per key.
    pub fn merge(&mut self, incoming: WidgetOptions) {
        if incoming.primary_color.is_some() {
            self.primary_color = incoming.primary_color;
        }
        if incoming.workspace_id.is_some() {
            self.workspace_id = incoming.workspace_id;
        }
        if incoming.position.is_some() {
            self.position = incoming.position;
        }
        self.labels.extend(incoming.labels);
    }
}

/// What a received frame asks the receiver to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Widget side: configuration changed; re-render with these options.
    OptionsUpdated(WidgetOptions),
    /// Host side: hide/unmount the widget iframe.
    CloseWidget,
}

pub struct HostBridge {
    allowed_origins: Vec<String>,
    options: Mutex<WidgetOptions>,
}

impl HostBridge {
    pub fn new(allowed_origins: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_origins: allowed_origins.into_iter().collect(),
            options: Mutex::new(WidgetOptions::default()),
        }
    }

    /// Current widget options snapshot.
    pub fn options(&self) -> WidgetOptions {
        self.options.lock().unwrap().clone()
    }

    /// Process one incoming frame.
    ///
    /// Returns `None` for anything that requires no action: untrusted
    /// origins (dropped silently), unknown frame types, and malformed
    /// payloads.
    pub fn handle_frame(&self, origin: &str, frame: &Value) -> Option<BridgeAction> {
        if !self.allowed_origins.iter().any(|o| o == origin) {
            debug!(origin, "discarding cross-frame message from untrusted origin");
            return None;
        }

        let frame_type = frame.get("type").and_then(Value::as_str)?;

        match frame_type {
            FRAME_CHAT_OPTIONS => {
                let incoming: WidgetOptions =
                    serde_json::from_value(frame.get("options")?.clone()).ok()?;

                let merged = {
                    let mut options = self.options.lock().unwrap();
                    options.merge(incoming);
                    options.clone()
                };

                info!("widget options updated from host");
                Some(BridgeAction::OptionsUpdated(merged))
            }
            FRAME_CLOSE_WIDGET => Some(BridgeAction::CloseWidget),
            other => {
                debug!(frame_type = other, "ignoring unknown cross-frame message");
                None
            }
        }
    }

    /// Build the widget -> host close frame.
    pub fn close_widget_frame() -> Value {
        serde_json::json!({ "type": FRAME_CLOSE_WIDGET })
    }

    /// Build the host -> widget options frame.
    pub fn options_frame(options: &WidgetOptions) -> Value {
        serde_json::json!({ "type": FRAME_CHAT_OPTIONS, "options": options })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGET_ORIGIN: &str = "https://widget.pullse.io";

    fn bridge() -> HostBridge {
        HostBridge::new([WIDGET_ORIGIN.to_string()])
    }

    #[test]
    fn test_untrusted_origin_is_dropped_silently() {
        let bridge = bridge();
        let frame = HostBridge::close_widget_frame();

        let action = bridge.handle_frame("https://evil.example", &frame);

        assert!(action.is_none());
        // No state change either.
        assert_eq!(bridge.options(), WidgetOptions::default());
    }

    #[test]
    fn test_close_widget_from_trusted_origin() {
        let bridge = bridge();
        let frame = HostBridge::close_widget_frame();

        assert_eq!(
            bridge.handle_frame(WIDGET_ORIGIN, &frame),
            Some(BridgeAction::CloseWidget)
        );
    }

    #[test]
    fn test_options_merge_field_wise() {
        let bridge = bridge();

        let first = serde_json::json!({
            "type": FRAME_CHAT_OPTIONS,
            "options": {"primaryColor": "#6334eb", "workspaceId": "ws-a"}
        });
        bridge.handle_frame(WIDGET_ORIGIN, &first).unwrap();

        let second = serde_json::json!({
            "type": FRAME_CHAT_OPTIONS,
            "options": {"position": "bottom-left", "labels": {"title": "Need help?"}}
        });
        let action = bridge.handle_frame(WIDGET_ORIGIN, &second).unwrap();

        let BridgeAction::OptionsUpdated(options) = action else {
            panic!("expected options update");
        };
        // Earlier fields survive, new fields land.
        assert_eq!(options.primary_color.as_deref(), Some("#6334eb"));
        assert_eq!(options.workspace_id.as_deref(), Some("ws-a"));
        assert_eq!(options.position.as_deref(), Some("bottom-left"));
        assert_eq!(options.labels.get("title").map(String::as_str), Some("Need help?"));
    }

    #[test]
    fn test_unknown_frame_type_ignored() {
        let bridge = bridge();
        let frame = serde_json::json!({"type": "PULLSE_SOMETHING_ELSE"});

        assert!(bridge.handle_frame(WIDGET_ORIGIN, &frame).is_none());
    }

    #[test]
    fn test_malformed_options_ignored() {
        let bridge = bridge();
        let frame = serde_json::json!({"type": FRAME_CHAT_OPTIONS, "options": 42});

        assert!(bridge.handle_frame(WIDGET_ORIGIN, &frame).is_none());
        assert_eq!(bridge.options(), WidgetOptions::default());
    }

    #[test]
    fn test_options_frame_shape() {
        let mut options = WidgetOptions::default();
        options.primary_color = Some("#6334eb".to_string());

        let frame = HostBridge::options_frame(&options);
        assert_eq!(frame["type"], FRAME_CHAT_OPTIONS);
        assert_eq!(frame["options"]["primaryColor"], "#6334eb");
    }
}
