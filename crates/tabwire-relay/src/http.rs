//! HTTP surface: discovery endpoints and the two WebSocket upgrades.
//!
//! All `/json/*` endpoints and the `/cdp` upgrade require the instance
//! bearer token; authentication happens before any WS handshake completes.
//! `/extension` is deliberately unauthenticated -- the extension runs
//! in-browser with no way to receive the token, and is protected by the
//! loopback bind plus the single-slot policy.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::{bearer_from_headers, token_from_request, token_matches};
use crate::error::RelayError;
use crate::extension::run_extension_socket;
use crate::hub::run_socket_writer;
use crate::instance::{wait_for_shutdown, RelayInstance};
use crate::router::{handle_client_frame, replay_attached};

/// Query parameters accepted on the `/cdp` upgrade, for clients that
/// cannot set headers.
#[derive(Debug, Deserialize)]
struct WsAuthParams {
    token: Option<String>,
}

/// Build the axum router for one relay instance.
pub fn build_router(instance: Arc<RelayInstance>) -> Router {
    Router::new()
        .route("/json/version", get(json_version))
        .route("/json/list", get(json_list))
        .route("/json/attach/{id}", post(json_attach))
        .route("/extension", get(ws_extension))
        .route("/cdp", get(ws_cdp))
        .with_state(instance)
}

/// `{error:{code,message}}` body for a non-200 response.
fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": { "code": status.as_u16(), "message": message },
    });
    (status, Json(body)).into_response()
}

fn relay_error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &err.to_string())
}

/// Validate the bearer header on a JSON endpoint.
fn check_auth(instance: &RelayInstance, headers: &HeaderMap) -> Result<(), Response> {
    match bearer_from_headers(headers) {
        Some(token) if token_matches(&token, instance.token()) => Ok(()),
        Some(_) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid bearer token",
        )),
        None => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing bearer token; expected: Authorization: Bearer <token>",
        )),
    }
}

/// `GET /json/version` -- browser identity plus the token-bearing `/cdp`
/// URL when an extension is connected.
async fn json_version(
    State(instance): State<Arc<RelayInstance>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_auth(&instance, &headers) {
        return resp;
    }
    let mut body = json!({
        "Browser": format!("tabwire-relay/{}", env!("CARGO_PKG_VERSION")),
        "Protocol-Version": "1.3",
    });
    if instance.extension().is_connected() {
        body["webSocketDebuggerUrl"] = json!(instance.cdp_ws_url());
    }
    (StatusCode::OK, Json(body)).into_response()
}

/// `GET /json/list` -- the registry's union view of attached targets and
/// non-duplicate discovered tabs.
async fn json_list(State(instance): State<Arc<RelayInstance>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&instance, &headers) {
        return resp;
    }
    let cdp_ws_url = instance.cdp_ws_url();
    let rows = instance.with_registry(|r| r.list(&cdp_ws_url));
    (StatusCode::OK, Json(Value::Array(rows))).into_response()
}

/// `POST /json/attach/{id}` -- ask the extension to attach a discovered tab
/// and block until the attach completes or times out.
async fn json_attach(
    State(instance): State<Arc<RelayInstance>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_auth(&instance, &headers) {
        return resp;
    }

    let Some(tab_id_str) = id.strip_prefix("dtab-") else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "attach id must name a discovered tab (dtab-<tabId>)",
        );
    };
    let Ok(tab_id) = tab_id_str.parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "malformed discovered tab id");
    };

    match instance.attach_discovered_tab(tab_id).await {
        Ok((target_id, session_id)) => (
            StatusCode::OK,
            Json(json!({ "targetId": target_id, "sessionId": session_id })),
        )
            .into_response(),
        Err(err) => {
            warn!(tab_id, error = %err, "attach request failed");
            relay_error_response(&err)
        }
    }
}

/// `GET /extension` -- the extension slot. Unauthenticated; loopback only.
///
/// No protocol-level message cap here: an oversized extension frame is
/// dropped with a log line by the socket loop instead of tearing the link
/// down.
async fn ws_extension(
    State(instance): State<Arc<RelayInstance>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_extension_socket(socket, instance))
}

/// `GET /cdp` -- CDP client upgrade. The bearer token is validated before
/// the handshake completes; failures return a plain 401, no upgrade.
async fn ws_cdp(
    State(instance): State<Arc<RelayInstance>>,
    headers: HeaderMap,
    Query(params): Query<WsAuthParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = token_from_request(&headers, params.token.as_deref());
    match token {
        Some(token) if token_matches(&token, instance.token()) => {}
        _ => {
            warn!("CDP upgrade rejected: missing or invalid token");
            return error_response(StatusCode::UNAUTHORIZED, "missing or invalid token");
        }
    }
    let max_frame = instance.config().max_frame_bytes;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_cdp_socket(socket, instance))
}

/// Main loop for an accepted CDP client socket.
async fn handle_cdp_socket(socket: WebSocket, instance: Arc<RelayInstance>) {
    let (sink, mut receiver) = socket.split();
    let registration = instance.hub().register();
    let client_id = registration.id;
    let writer = tokio::spawn(run_socket_writer(
        sink,
        registration.frames,
        registration.close,
    ));
    info!(client_id = %client_id, "CDP client connected");

    // Seed the client's model of the world with the current attached set.
    replay_attached(&instance, client_id);

    let mut shutdown = instance.shutdown_rx();
    loop {
        tokio::select! {
            maybe_msg = receiver.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&instance, client_id, &text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => handle_client_frame(&instance, client_id, text),
                            Err(_) => debug!(client_id = %client_id, "non-UTF-8 CDP frame dropped"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = instance.hub().enqueue_raw(client_id, Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "CDP client receive error");
                        break;
                    }
                    None => break,
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    instance.hub().unregister(client_id);
    let _ = writer.await;
    info!(client_id = %client_id, "CDP client disconnected");
}
