use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ChannelId, LinkId};

/// Service name reported by the listener's probe endpoint.
pub const SERVICE_NAME: &str = "tabmesh";

/// Routing metadata that travels next to the positional call arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<i64>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

impl ExtraArgs {
    pub fn for_tab(tab_id: i64) -> Self {
        Self {
            tab_id: Some(tab_id),
            ..Default::default()
        }
    }

    pub fn for_window(window_id: Option<i64>) -> Self {
        Self {
            window_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tab_id.is_none() && self.window_id.is_none() && self.other.is_empty()
    }
}

/// One in-flight call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferMessage {
    pub id: String,
    /// Dot-path of the procedure, e.g. `dom.clickOnCoordinates`.
    pub procedure: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "ExtraArgs::is_empty")]
    pub extra_args: ExtraArgs,
}

/// Outcome of exactly one [`DeferMessage`], matched by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveMessage {
    pub id: String,
    pub is_ok: bool,
    #[serde(default)]
    pub result: Value,
}

impl ResolveMessage {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            is_ok: true,
            result,
        }
    }

    pub fn err(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            is_ok: false,
            result,
        }
    }
}

/// Frames pushed from the listener to a dialer over the announce link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AnnounceFrame {
    #[serde(rename_all = "camelCase")]
    Hello { link_id: LinkId },
    #[serde(rename_all = "camelCase")]
    Defer {
        channel_id: ChannelId,
        message: DeferMessage,
    },
    #[serde(rename_all = "camelCase")]
    Closed { channel_id: ChannelId },
}

/// Body of the open-channel mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChannelRequest {
    pub link_id: String,
    pub channel_id: String,
}

/// Body returned by the probe endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    pub service: String,
    pub version: String,
}

/// Body of an administrative call routed to a peer by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCallRequest {
    pub procedure: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub extra_args: ExtraArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defer_wire_shape() {
        let msg = DeferMessage {
            id: "1-abc-dom.clickOnCoordinates".to_string(),
            procedure: "dom.clickOnCoordinates".to_string(),
            args: vec![json!(10), json!(20)],
            extra_args: ExtraArgs::for_tab(7),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "1-abc-dom.clickOnCoordinates",
                "procedure": "dom.clickOnCoordinates",
                "args": [10, 20],
                "extraArgs": { "tabId": 7 }
            })
        );
    }

    #[test]
    fn test_defer_without_extra_args() {
        let msg: DeferMessage =
            serde_json::from_value(json!({"id": "x", "procedure": "peer.getInfo", "args": []})).unwrap();
        assert!(msg.extra_args.is_empty());
        let back = serde_json::to_value(&msg).unwrap();
        assert!(back.get("extraArgs").is_none());
    }

    #[test]
    fn test_extra_args_keeps_unknown_fields() {
        let extra: ExtraArgs = serde_json::from_value(json!({"tabId": 1, "frameId": 4})).unwrap();
        assert_eq!(extra.tab_id, Some(1));
        assert_eq!(extra.other.get("frameId"), Some(&json!(4)));
    }

    #[test]
    fn test_resolve_wire_shape() {
        let value = serde_json::to_value(ResolveMessage::err("9", json!({"message": "boom"}))).unwrap();
        assert_eq!(value, json!({"id": "9", "isOk": false, "result": {"message": "boom"}}));
    }

    #[test]
    fn test_announce_frame_tagging() {
        let channel_id = ChannelId::generate();
        let frame = AnnounceFrame::Closed {
            channel_id: channel_id.clone(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "closed", "channelId": channel_id.as_str()}));

        let link_id = LinkId::generate();
        let hello: AnnounceFrame =
            serde_json::from_value(json!({"type": "hello", "linkId": link_id.as_str()})).unwrap();
        assert_eq!(hello, AnnounceFrame::Hello { link_id });
    }
}
