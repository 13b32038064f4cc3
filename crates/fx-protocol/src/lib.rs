//! fx-protocol: wire types for the FX rate streaming RPC channel.
//!
//! Every command and response travels as a JSON object shaped
//! `{ "action": <string>, "message": <object> }`. Unlike a tagged-enum
//! wire format, `message` is validated by hand rather than derived,
//! because the server must be able to report *which* field failed and
//! *why* in a shape a non-Rust client can render without knowing Serde's
//! error vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Command envelope (client -> server)
// ---------------------------------------------------------------------------

/// A decoded, validated client command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub action: String,
    pub message: Map<String, Value>,
}

/// One entry in a validation-error list.
///
/// `loc` and `input` are omitted from the wire form when absent, so a
/// hand-authored single-error response (e.g. "Unknown action") serializes
/// to exactly `{"msg": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<Value>,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl ErrorEntry {
    pub fn simple(msg: impl Into<String>) -> Self {
        Self { loc: None, msg: msg.into(), input: None }
    }

    fn field_required(field: &str, whole_input: &Value) -> Self {
        Self {
            loc: Some(Value::String(field.to_owned())),
            msg: "Field required".to_owned(),
            input: Some(whole_input.clone()),
        }
    }

    fn wrong_type(field: &str, expected: &str, actual: &Value) -> Self {
        Self {
            loc: Some(Value::String(field.to_owned())),
            msg: format!("Input should be a valid {expected}"),
            input: Some(actual.clone()),
        }
    }
}

/// `{"errors": [...]}` with no `action`/`message` wrapper — the shape sent
/// when a frame fails envelope-level validation, before any `action` could
/// be determined well enough to echo back.
pub fn bare_errors(errors: Vec<ErrorEntry>) -> Value {
    json!({ "errors": errors })
}

/// A human-readable JSON type name, for the "decoded value is not an
/// object" error message.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Top-level decode outcome for a single inbound text frame.
pub enum FrameDecode {
    /// The frame was not valid JSON at all.
    NotJson,
    /// The frame decoded to JSON but the top-level value isn't an object.
    NotAnObject(Value),
    /// The value was an object but failed envelope validation.
    Invalid(Vec<ErrorEntry>),
    /// A fully valid command.
    Command(Command),
}

/// Decode one inbound text frame into a [`Command`], or describe why it
/// couldn't be decoded. This mirrors the three-tier triage the connection
/// service's receive loop performs: malformed JSON, non-object JSON, and
/// an object that fails field validation are all distinct, independently
/// reported outcomes.
pub fn decode_frame(text: &str) -> FrameDecode {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return FrameDecode::NotJson,
    };
    let Some(obj) = value.as_object() else {
        return FrameDecode::NotAnObject(value);
    };
    match validate_command_object(obj, &value) {
        Ok(cmd) => FrameDecode::Command(cmd),
        Err(errors) => FrameDecode::Invalid(errors),
    }
}

fn validate_command_object(
    obj: &Map<String, Value>,
    whole: &Value,
) -> Result<Command, Vec<ErrorEntry>> {
    let mut errors = Vec::new();

    let action = match obj.get("action") {
        None => {
            errors.push(ErrorEntry::field_required("action", whole));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            errors.push(ErrorEntry::wrong_type("action", "string", other));
            None
        }
    };

    let message = match obj.get("message") {
        None => {
            errors.push(ErrorEntry::field_required("message", whole));
            None
        }
        Some(Value::Object(m)) => Some(m.clone()),
        Some(other) => {
            errors.push(ErrorEntry::wrong_type("message", "object", other));
            None
        }
    };

    match (action, message, errors.is_empty()) {
        (Some(action), Some(message), true) => Ok(Command { action, message }),
        _ => Err(errors),
    }
}

// ---------------------------------------------------------------------------
// Subscribe request (nested decode of the `subscribe` action's `message`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub asset_id: i64,
}

/// Decode `{"assetId": <int>}` out of a `subscribe` command's `message`.
pub fn parse_subscribe_request(
    message: &Map<String, Value>,
) -> Result<SubscribeRequest, Vec<ErrorEntry>> {
    let whole = Value::Object(message.clone());
    match message.get("assetId") {
        None => Err(vec![ErrorEntry::field_required("assetId", &whole)]),
        Some(Value::Number(n)) if n.as_i64().is_some() => {
            Ok(SubscribeRequest { asset_id: n.as_i64().expect("checked above") })
        }
        Some(other) => Err(vec![ErrorEntry::wrong_type("assetId", "integer", other)]),
    }
}

// ---------------------------------------------------------------------------
// Response envelope (server -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    #[serde(rename = "assetName")]
    pub asset_name: String,
    #[serde(rename = "assetId")]
    pub asset_id: i32,
    pub time: i64,
    pub value: f64,
}

/// A server -> client response, always `{action, message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    pub message: Value,
}

impl Envelope {
    pub fn assets(assets: Vec<AssetInfo>) -> Self {
        Self { action: "assets".to_owned(), message: json!({ "assets": assets }) }
    }

    pub fn asset_history(points: Vec<PointPayload>) -> Self {
        Self { action: "asset_history".to_owned(), message: json!({ "points": points }) }
    }

    pub fn point(point: PointPayload) -> Self {
        Self { action: "point".to_owned(), message: json!(point) }
    }

    /// A multi-entry validation-error envelope, echoing the given action.
    pub fn errors(action: impl Into<String>, errors: Vec<ErrorEntry>) -> Self {
        Self { action: action.into(), message: json!({ "errors": errors }) }
    }

    /// A one-error envelope, for cases with no field-level detail to report
    /// (unknown action, asset not found, empty history window).
    pub fn single_error(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::errors(action, vec![ErrorEntry::simple(msg)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_well_formed_command() {
        match decode_frame(r#"{"action":"assets","message":{}}"#) {
            FrameDecode::Command(cmd) => {
                assert_eq!(cmd.action, "assets");
                assert!(cmd.message.is_empty());
            }
            _ => panic!("expected a valid command"),
        }
    }

    #[test]
    fn rejects_non_json_text() {
        assert!(matches!(decode_frame("not json"), FrameDecode::NotJson));
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(matches!(decode_frame("42"), FrameDecode::NotAnObject(_)));
        assert!(matches!(decode_frame("[1,2,3]"), FrameDecode::NotAnObject(_)));
    }

    #[test]
    fn empty_object_reports_both_missing_fields() {
        let FrameDecode::Invalid(errors) = decode_frame("{}") else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].loc, Some(Value::String("action".to_owned())));
        assert_eq!(errors[0].msg, "Field required");
        assert_eq!(errors[0].input, Some(json!({})));
        assert_eq!(errors[1].loc, Some(Value::String("message".to_owned())));
        assert_eq!(errors[1].input, Some(json!({})));
    }

    #[test]
    fn wrong_type_action_is_reported() {
        let FrameDecode::Invalid(errors) = decode_frame(r#"{"action":1,"message":{}}"#) else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].msg, "Input should be a valid string");
        assert_eq!(errors[0].input, Some(json!(1)));
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        let decoded = decode_frame(r#"{"action":"assets","message":{},"extra":true}"#);
        assert!(matches!(decoded, FrameDecode::Command(_)));
    }

    #[test]
    fn subscribe_request_requires_integer_asset_id() {
        let mut msg = Map::new();
        assert!(parse_subscribe_request(&msg).is_err());

        msg.insert("assetId".to_owned(), json!("not-an-int"));
        assert!(parse_subscribe_request(&msg).is_err());

        msg.insert("assetId".to_owned(), json!(3));
        let parsed = parse_subscribe_request(&msg).expect("valid");
        assert_eq!(parsed.asset_id, 3);
    }

    #[test]
    fn single_error_envelope_omits_loc_and_input() {
        let envelope = Envelope::single_error("foo", "Unknown action");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"action": "foo", "message": {"errors": [{"msg": "Unknown action"}]}})
        );
    }

    #[test]
    fn asset_history_envelope_shape() {
        let envelope = Envelope::asset_history(vec![PointPayload {
            asset_name: "EURUSD".to_owned(),
            asset_id: 1,
            time: 100,
            value: 1.1,
        }]);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "asset_history",
                "message": {"points": [{"assetName":"EURUSD","assetId":1,"time":100,"value":1.1}]}
            })
        );
    }

    #[test]
    fn bare_errors_has_no_action_or_message_wrapper() {
        let value = bare_errors(vec![ErrorEntry::field_required("action", &json!({}))]);
        assert_eq!(
            value,
            json!({"errors": [{"loc": "action", "msg": "Field required", "input": {}}]})
        );
    }

    #[test]
    fn json_type_name_covers_every_variant() {
        assert_eq!(json_type_name(&Value::Null), "null");
        assert_eq!(json_type_name(&json!(true)), "bool");
        assert_eq!(json_type_name(&json!(1)), "number");
        assert_eq!(json_type_name(&json!("s")), "string");
        assert_eq!(json_type_name(&json!([1])), "array");
        assert_eq!(json_type_name(&json!({})), "object");
    }

    #[test]
    fn command_envelope_round_trips() {
        let mut message = Map::new();
        message.insert("assetId".to_owned(), json!(5));
        let cmd = Command { action: "subscribe".to_owned(), message };
        let encoded = serde_json::to_string(&cmd).unwrap();
        let decoded: Command = serde_json::from_str(&encoded).unwrap();
        assert_eq!(cmd, decoded);
    }
}
