//! JSON frame helpers for the extension and CDP wire protocols.
//!
//! CDP evolves, so inbound frames are treated as open objects: known fields
//! are extracted by name and unknown fields pass through untouched when a
//! frame is forwarded. Nothing here validates against a schema.

use serde_json::{json, Value};

/// A frame received from the extension socket.
#[derive(Debug, Clone)]
pub enum ExtensionFrame {
    /// `{method, params?}` -- an event pushed by the extension.
    Event { method: String, params: Value },
    /// `{id, result}` or `{id, error}` -- a reply to a relay-issued call.
    Reply {
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
    },
}

/// Classify a decoded extension frame.
///
/// Frames with a numeric `id` are replies; frames with a `method` and no
/// `id` are events. Anything else is unrecognized and should be dropped by
/// the caller.
pub fn parse_extension_frame(value: &Value) -> Option<ExtensionFrame> {
    if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
        return Some(ExtensionFrame::Reply {
            id,
            result: value.get("result").cloned(),
            error: value.get("error").cloned(),
        });
    }
    let method = value.get("method")?.as_str()?.to_string();
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    Some(ExtensionFrame::Event { method, params })
}

/// A command frame received from a CDP client.
#[derive(Debug, Clone)]
pub struct ClientCommand {
    /// The client-assigned id, echoed back verbatim in the response.
    pub id: Value,
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Extract the known fields of a CDP client command.
///
/// Returns `None` when the frame has no string `method`.
pub fn parse_client_command(value: &Value) -> Option<ClientCommand> {
    let method = value.get("method")?.as_str()?.to_string();
    Some(ClientCommand {
        id: value.get("id").cloned().unwrap_or(Value::Null),
        method,
        params: value.get("params").cloned().unwrap_or(Value::Null),
        session_id: value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

/// Build a CDP success response frame.
pub fn rpc_result(id: &Value, result: Value, session_id: Option<&str>) -> Value {
    let mut frame = json!({ "id": id, "result": result });
    if let Some(sid) = session_id {
        frame["sessionId"] = json!(sid);
    }
    frame
}

/// Build a CDP error response frame in JSON-RPC shape.
pub fn rpc_error(id: &Value, code: i64, message: &str, session_id: Option<&str>) -> Value {
    let mut frame = json!({
        "id": id,
        "error": { "code": code, "message": message },
    });
    if let Some(sid) = session_id {
        frame["sessionId"] = json!(sid);
    }
    frame
}

/// Build a CDP event frame.
pub fn event_frame(method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut frame = json!({ "method": method, "params": params });
    if let Some(sid) = session_id {
        frame["sessionId"] = json!(sid);
    }
    frame
}

/// Build a relay-to-extension call frame.
pub fn extension_call(id: u64, method: &str, params: Value) -> Value {
    json!({ "id": id, "method": method, "params": params })
}
