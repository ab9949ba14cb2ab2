use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request sent to the comparison assistant.
pub const COMPARE_REQUEST: &str = "compare_request";
/// Streamed answer from the comparison assistant.
pub const COMPARE_RESPONSE: &str = "compare_response";
/// Server-side error report.
pub const ERROR: &str = "error";

/// Normal closure; never followed by a reconnect.
pub const CLOSE_NORMAL: u16 = 1000;

/// Tagged stream message, `{"type": ..., "data": ...}` on the wire.
///
/// `kind` is an opaque dispatch key; `data` is not validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Builds a message from any serializable payload.
    pub fn with_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn is_error(&self) -> bool {
        self.kind == ERROR
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encodes the wire form. Cannot fail: `data` is already a JSON value.
    pub fn to_text(&self) -> String {
        serde_json::json!({"type": self.kind, "data": self.data}).to_string()
    }
}

/// How a close frame, or its absence, affects the connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseKind {
    /// Normal closure. Stay closed.
    Normal,
    /// Server rejected the credentials. Stay closed, ask for a new login.
    AuthRejected,
    /// Anything else. Eligible for reconnect.
    Abnormal,
}

/// Classifies a close code; `None` means the socket went away without one.
pub fn classify_close(code: Option<u16>, auth_close_codes: &[u16]) -> CloseKind {
    match code {
        Some(CLOSE_NORMAL) => CloseKind::Normal,
        Some(code) if auth_close_codes.contains(&code) => CloseKind::AuthRejected,
        _ => CloseKind::Abnormal,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const AUTH_CODES: [u16; 3] = [1008, 4001, 4003];

    #[test]
    fn message_uses_type_on_the_wire() {
        let msg = Message::new(COMPARE_REQUEST, json!({"query": "usb-c hubs under $40"}));
        let value: Value = serde_json::from_str(&msg.to_text()).expect("json");
        assert_eq!(value["type"], "compare_request");
        assert_eq!(value["data"]["query"], "usb-c hubs under $40");
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let msg = Message::from_text(r#"{"type":"A"}"#).expect("decode");
        assert_eq!(msg, Message::new("A", Value::Null));
    }

    #[test]
    fn unknown_kinds_are_accepted() {
        let msg = Message::from_text(r#"{"type":"price_drop","data":[1,2,3]}"#).expect("decode");
        assert_eq!(msg.kind, "price_drop");
        assert_eq!(msg.data, json!([1, 2, 3]));
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(Message::from_text(r#"{"data":{}}"#).is_err());
        assert!(Message::from_text("not json").is_err());
    }

    #[test]
    fn payload_constructor_serializes_structs() {
        #[derive(serde::Serialize)]
        struct Ask<'a> {
            query: &'a str,
            product_ids: Vec<u32>,
        }

        let msg = Message::with_payload(
            COMPARE_REQUEST,
            &Ask {
                query: "best espresso grinder",
                product_ids: vec![7, 9],
            },
        )
        .expect("payload");
        assert_eq!(msg.data, json!({"query": "best espresso grinder", "product_ids": [7, 9]}));
    }

    #[test]
    fn error_kind_is_detected() {
        assert!(Message::new(ERROR, json!({"detail": "boom"})).is_error());
        assert!(!Message::new(COMPARE_RESPONSE, Value::Null).is_error());
    }

    #[test]
    fn close_codes_are_classified() {
        assert_eq!(classify_close(Some(1000), &AUTH_CODES), CloseKind::Normal);
        assert_eq!(classify_close(Some(4001), &AUTH_CODES), CloseKind::AuthRejected);
        assert_eq!(classify_close(Some(1008), &AUTH_CODES), CloseKind::AuthRejected);
        assert_eq!(classify_close(Some(1006), &AUTH_CODES), CloseKind::Abnormal);
        assert_eq!(classify_close(Some(1011), &AUTH_CODES), CloseKind::Abnormal);
        assert_eq!(classify_close(None, &AUTH_CODES), CloseKind::Abnormal);
    }
}
