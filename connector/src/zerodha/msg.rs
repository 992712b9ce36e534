//! Control-plane messages for the equity venue's WebSocket: client-to-server
//! subscription management and server-to-client text postbacks. The market
//! data itself arrives as binary frames handled by [`super::wire`].

use serde::{Deserialize, Serialize};

/// `{"a": "...", "v": ...}` control messages.
#[derive(Debug, Serialize)]
pub struct ControlMessage {
    pub a: &'static str,
    pub v: serde_json::Value,
}

impl ControlMessage {
    pub fn subscribe(tokens: &[u32]) -> Self {
        Self {
            a: "subscribe",
            v: serde_json::json!(tokens),
        }
    }

    pub fn unsubscribe(tokens: &[u32]) -> Self {
        Self {
            a: "unsubscribe",
            v: serde_json::json!(tokens),
        }
    }

    pub fn mode(mode: &str, tokens: &[u32]) -> Self {
        Self {
            a: "mode",
            v: serde_json::json!([mode, tokens]),
        }
    }
}

/// Text frames from the server: order postbacks, errors and notices.
#[derive(Debug, Deserialize)]
pub struct Postback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_serialize_to_wire_shape() {
        let msg = serde_json::to_string(&ControlMessage::subscribe(&[738_561, 5633])).unwrap();
        assert_eq!(msg, r#"{"a":"subscribe","v":[738561,5633]}"#);

        let msg = serde_json::to_string(&ControlMessage::mode("full", &[738_561])).unwrap();
        assert_eq!(msg, r#"{"a":"mode","v":["full",[738561]]}"#);

        let msg = serde_json::to_string(&ControlMessage::unsubscribe(&[5633])).unwrap();
        assert_eq!(msg, r#"{"a":"unsubscribe","v":[5633]}"#);
    }

    #[test]
    fn postback_parses() {
        let postback: Postback =
            serde_json::from_str(r#"{"type":"error","data":"invalid token"}"#).unwrap();
        assert_eq!(postback.kind, "error");
        assert_eq!(postback.data.as_str(), Some("invalid token"));
    }
}
