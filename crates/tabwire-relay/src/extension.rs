//! Extension link: the single WebSocket slot for the browser extension.
//!
//! The extension is the relay's only path into the browser, so exactly one
//! extension socket is live at a time; a second connection is accepted and
//! immediately closed with code 4001. Outbound calls carry auto-incrementing
//! ids matched against a pending table on reply: register before send,
//! resolve by id, drain with an error when the link drops.
//!
//! Liveness: the relay sends `{"method":"ping"}` every ping interval and
//! expects `{"method":"pong"}` back; after the configured number of silent
//! intervals the socket is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::hub::{run_socket_writer, CloseReason, CLOSE_GOING_AWAY};
use crate::instance::RelayInstance;
use crate::protocol::{event_frame, extension_call, parse_extension_frame, ExtensionFrame};

/// Close code for a second extension connection while one is live.
pub const CLOSE_SLOT_TAKEN: u16 = 4001;
/// Close code when the extension stops answering pings.
pub const CLOSE_PING_TIMEOUT: u16 = 4000;

/// The two halves of an extension reply, passed through verbatim.
#[derive(Debug)]
pub struct CallReply {
    pub result: Option<Value>,
    pub error: Option<Value>,
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<CallReply, RelayError>>,
}

struct ExtensionHandle {
    conn: u64,
    tx: mpsc::Sender<Message>,
    close: watch::Sender<Option<CloseReason>>,
}

/// The extension slot plus the outstanding-call table.
pub struct ExtensionLink {
    slot: Mutex<Option<ExtensionHandle>>,
    conn_seq: AtomicU64,
    next_call_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
}

impl ExtensionLink {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            conn_seq: AtomicU64::new(0),
            next_call_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Claim the slot for a new connection. Returns the connection sequence
    /// on success, or `None` when an extension is already live.
    fn occupy(
        &self,
        tx: mpsc::Sender<Message>,
        close: watch::Sender<Option<CloseReason>>,
    ) -> Option<u64> {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            return None;
        }
        let conn = self.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(ExtensionHandle { conn, tx, close });
        Some(conn)
    }

    /// Free the slot if it is still held by the given connection.
    fn release(&self, conn: u64) -> bool {
        let mut slot = self.lock_slot();
        match slot.as_ref() {
            Some(handle) if handle.conn == conn => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Signal the live connection's writer to close the socket.
    pub fn close_current(&self, reason: CloseReason) {
        if let Some(handle) = self.lock_slot().as_ref() {
            let _ = handle.close.send(Some(reason));
        }
    }

    /// Issue a call to the extension and wait for its reply.
    ///
    /// Fails with `ExtensionUnavailable` when no extension is connected or
    /// the link drops mid-call, and with `Timeout` when the deadline passes.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<CallReply, RelayError> {
        let tx = self
            .lock_slot()
            .as_ref()
            .map(|h| h.tx.clone())
            .ok_or_else(|| RelayError::ExtensionUnavailable {
                reason: "no extension connected".into(),
            })?;

        let id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        // Register the pending reply before sending to avoid a race with a
        // fast responder.
        self.lock_pending().insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx: reply_tx,
            },
        );

        debug!(id, method, "extension call");
        let frame = extension_call(id, method, params);
        if tx
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            self.lock_pending().remove(&id);
            return Err(RelayError::ExtensionUnavailable {
                reason: "extension link closed".into(),
            });
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::ExtensionUnavailable {
                reason: "extension disconnected".into(),
            }),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(RelayError::Timeout {
                    method: method.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Resolve a reply frame against the pending table. Unknown ids are
    /// logged and dropped.
    fn resolve_reply(&self, id: u64, reply: CallReply) {
        let pending = self.lock_pending().remove(&id);
        match pending {
            Some(call) => {
                debug!(id, method = %call.method, "extension reply");
                let _ = call.tx.send(Ok(reply));
            }
            None => warn!(id, "extension reply with unknown id dropped"),
        }
    }

    /// Fail every outstanding call, e.g. on disconnect or shutdown.
    pub fn fail_all(&self, make_error: impl Fn() -> RelayError) {
        let drained: Vec<PendingCall> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            let _ = call.tx.send(Err(make_error()));
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<ExtensionHandle>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ExtensionLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Main loop for an accepted `/extension` socket.
pub async fn run_extension_socket(socket: WebSocket, instance: Arc<RelayInstance>) {
    let (sink, mut receiver) = socket.split();
    let config = instance.config();
    let (tx, frames) = mpsc::channel::<Message>(config.socket_queue_cap);
    let (close_tx, close_rx) = watch::channel(None);

    let conn = match instance.extension().occupy(tx.clone(), close_tx) {
        Some(conn) => conn,
        None => {
            warn!("extension slot already occupied, rejecting connection");
            let mut sink = sink;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_SLOT_TAKEN,
                    reason: "extension already connected".into(),
                })))
                .await;
            return;
        }
    };

    info!(conn, "extension connected");
    let writer = tokio::spawn(run_socket_writer(sink, frames, close_rx));

    let mut shutdown = instance.shutdown_rx();
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; skip it so pings start one
    // full interval after connect.
    ping.tick().await;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            maybe_msg = receiver.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > config.max_frame_bytes {
                            warn!(len = text.len(), "oversized extension frame dropped");
                            continue;
                        }
                        handle_extension_text(&instance, &text, &mut missed_pongs);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > config.max_frame_bytes {
                            warn!(len = data.len(), "oversized extension frame dropped");
                            continue;
                        }
                        match std::str::from_utf8(&data) {
                            Ok(text) => handle_extension_text(&instance, text, &mut missed_pongs),
                            Err(_) => warn!("non-UTF-8 extension frame dropped"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(conn, "extension sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn, error = %e, "extension receive error");
                        break;
                    }
                    None => break,
                }
            }

            _ = ping.tick() => {
                if missed_pongs >= config.missed_pong_limit {
                    warn!(conn, missed = missed_pongs, "extension stopped answering pings, closing");
                    instance.extension().close_current(CloseReason {
                        code: CLOSE_PING_TIMEOUT,
                        reason: "ping timeout",
                    });
                    break;
                }
                let ping_frame = json!({ "method": "ping" }).to_string();
                if tx.send(Message::Text(ping_frame.into())).await.is_err() {
                    break;
                }
                missed_pongs += 1;
            }

            _ = crate::instance::wait_for_shutdown(&mut shutdown) => {
                info!(conn, "relay shutting down, closing extension socket");
                instance.extension().close_current(CloseReason {
                    code: CLOSE_GOING_AWAY,
                    reason: "relay shutting down",
                });
                break;
            }
        }
    }

    // Teardown: free the slot, clear the registry, fail outstanding work.
    instance.extension().release(conn);
    let events = instance.with_registry(|r| r.on_extension_disconnected());
    for event in &events {
        instance.hub().broadcast(event);
    }
    instance.extension().fail_all(|| RelayError::ExtensionUnavailable {
        reason: "extension disconnected".into(),
    });
    // Wake attach waiters so they observe the disconnect instead of timing out.
    instance.notify_attach_change();
    let _ = writer.await;
    info!(conn, "extension disconnected");
}

/// Dispatch one text frame from the extension. Malformed frames are logged
/// and dropped; the link stays up.
fn handle_extension_text(instance: &Arc<RelayInstance>, text: &str, missed_pongs: &mut u32) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed extension frame dropped");
            return;
        }
    };

    match parse_extension_frame(&value) {
        Some(ExtensionFrame::Reply { id, result, error }) => {
            instance
                .extension()
                .resolve_reply(id, CallReply { result, error });
        }
        Some(ExtensionFrame::Event { method, params }) => match method.as_str() {
            "pong" => *missed_pongs = 0,
            "forwardCDPEvent" => handle_forwarded_event(instance, &params),
            "tabsDiscovered" => instance.with_registry(|r| r.on_tabs_discovered(&params)),
            "tabUpdated" => instance.with_registry(|r| r.on_tab_updated(&params)),
            "tabRemoved" => instance.with_registry(|r| r.on_tab_removed(&params)),
            other => debug!(method = other, "unknown extension event dropped"),
        },
        None => warn!("unrecognized extension frame dropped"),
    }
}

/// Handle a `forwardCDPEvent` envelope: `Target.*` lifecycle events mutate
/// the registry and broadcast what it returns; everything else is broadcast
/// verbatim to all CDP clients.
fn handle_forwarded_event(instance: &Arc<RelayInstance>, params: &Value) {
    let Some(method) = params.get("method").and_then(|v| v.as_str()) else {
        warn!("forwardCDPEvent without method dropped");
        return;
    };
    let inner = params.get("params").cloned().unwrap_or(Value::Null);
    let session_id = params.get("sessionId").and_then(|v| v.as_str());

    let events = match method {
        "Target.attachedToTarget" => {
            let events = instance.with_registry(|r| r.on_attached_to_target(&inner));
            instance.notify_attach_change();
            events
        }
        "Target.detachedFromTarget" => instance.with_registry(|r| r.on_detached_from_target(&inner)),
        "Target.targetInfoChanged" => instance.with_registry(|r| r.on_target_info_changed(&inner)),
        _ => vec![event_frame(method, inner, session_id)],
    };
    for event in &events {
        instance.hub().broadcast(event);
    }
}
