//! CDP client frame router.
//!
//! Handles a small synthetic `Target.*` subset locally so CDP clients
//! behave as if talking to a real browser; every other command is forwarded
//! to the extension as `forwardCDPCommand` with a relay-assigned id and the
//! reply is mapped back to the client's original id. A failure while
//! handling one frame answers that client with `-32000` and never affects
//! other clients.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::extension::CallReply;
use crate::instance::RelayInstance;
use crate::protocol::{parse_client_command, rpc_error, rpc_result, ClientCommand};
use crate::registry::{attached_event, target_info_json};

/// Dispatch one text frame from a CDP client.
///
/// Synthetic commands are answered inline; forwards are spawned so a slow
/// extension never blocks this client's read loop.
pub fn handle_client_frame(instance: &Arc<RelayInstance>, client_id: Uuid, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(client_id = %client_id, error = %e, "malformed CDP frame");
            instance
                .hub()
                .send(client_id, &rpc_error(&Value::Null, -32700, "invalid JSON", None));
            return;
        }
    };

    let Some(cmd) = parse_client_command(&value) else {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        instance
            .hub()
            .send(client_id, &rpc_error(&id, -32600, "method is required", None));
        return;
    };

    match cmd.method.as_str() {
        "Target.setDiscoverTargets" => {
            ack(instance, client_id, &cmd);
            replay_attached(instance, client_id);
        }
        "Target.setAutoAttach" => {
            // The extension owns attach policy; acknowledge and move on.
            ack(instance, client_id, &cmd);
        }
        "Target.getTargets" => {
            let infos: Vec<Value> = instance
                .with_registry(|r| r.attached_snapshot())
                .iter()
                .map(target_info_json)
                .collect();
            instance.hub().send(
                client_id,
                &rpc_result(
                    &cmd.id,
                    json!({ "targetInfos": infos }),
                    cmd.session_id.as_deref(),
                ),
            );
        }
        "Target.attachToTarget" => attach_to_target(instance, client_id, &cmd),
        _ => {
            let instance = Arc::clone(instance);
            tokio::spawn(async move {
                forward_command(&instance, client_id, cmd).await;
            });
        }
    }
}

fn ack(instance: &Arc<RelayInstance>, client_id: Uuid, cmd: &ClientCommand) {
    instance.hub().send(
        client_id,
        &rpc_result(&cmd.id, json!({}), cmd.session_id.as_deref()),
    );
}

/// Replay the attached set as synthetic events to one client.
pub fn replay_attached(instance: &Arc<RelayInstance>, client_id: Uuid) {
    for target in instance.with_registry(|r| r.attached_snapshot()) {
        instance.hub().send(client_id, &attached_event(&target));
    }
}

/// `Target.attachToTarget`: resolve by target id against the registry.
/// Attached targets answer with their existing session; anything else is
/// `-32602 "No such target"` -- the extension owns real attach decisions.
fn attach_to_target(instance: &Arc<RelayInstance>, client_id: Uuid, cmd: &ClientCommand) {
    let Some(target_id) = cmd.params.get("targetId").and_then(|v| v.as_str()) else {
        instance.hub().send(
            client_id,
            &rpc_error(&cmd.id, -32602, "targetId is required", cmd.session_id.as_deref()),
        );
        return;
    };

    match instance.with_registry(|r| r.find_by_target_id(target_id).cloned()) {
        Some(target) => {
            // Event before reply, matching the order a real browser emits.
            instance.hub().send(client_id, &attached_event(&target));
            instance.hub().send(
                client_id,
                &rpc_result(
                    &cmd.id,
                    json!({ "sessionId": target.session_id }),
                    cmd.session_id.as_deref(),
                ),
            );
        }
        None => {
            instance.hub().send(
                client_id,
                &rpc_error(&cmd.id, -32602, "No such target", cmd.session_id.as_deref()),
            );
        }
    }
}

/// Forward a command to the extension and unicast the reply back to the
/// originating client under its original id.
async fn forward_command(instance: &Arc<RelayInstance>, client_id: Uuid, cmd: ClientCommand) {
    // A session the registry does not know is answered locally rather than
    // forwarded; the registry is authoritative on this side of the link.
    if let Some(session_id) = &cmd.session_id {
        if !instance.with_registry(|r| r.session_exists(session_id)) {
            instance.hub().send(
                client_id,
                &rpc_error(&cmd.id, -32001, "Session not found", Some(session_id)),
            );
            return;
        }
    }

    let mut payload = json!({
        "method": cmd.method,
        "params": cmd.params,
    });
    if let Some(session_id) = &cmd.session_id {
        payload["sessionId"] = json!(session_id);
    }

    let reply = instance
        .extension()
        .call("forwardCDPCommand", payload, instance.config().call_timeout)
        .await;

    let frame = match reply {
        Ok(CallReply {
            error: Some(error), ..
        }) => {
            // Extension-supplied CDP error, passed through verbatim.
            let mut frame = json!({ "id": cmd.id, "error": error });
            if let Some(session_id) = &cmd.session_id {
                frame["sessionId"] = json!(session_id);
            }
            frame
        }
        Ok(CallReply { result, .. }) => rpc_result(
            &cmd.id,
            result.unwrap_or_else(|| json!({})),
            cmd.session_id.as_deref(),
        ),
        Err(e) => {
            warn!(client_id = %client_id, method = %cmd.method, error = %e, "forwarded command failed");
            rpc_error(
                &cmd.id,
                e.rpc_code(),
                &e.to_string(),
                cmd.session_id.as_deref(),
            )
        }
    };
    instance.hub().send(client_id, &frame);
}
