//! CDP client session hub.
//!
//! Tracks the set of live CDP client sockets and owns all writes to them.
//! WebSocket frames must not interleave, so each socket gets one writer
//! task fed by a bounded mpsc queue; `broadcast` and `send` only enqueue.
//! A client that cannot drain its queue is closed with 1013 rather than
//! stalling the rest of the relay.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Close code sent when a client's write queue overflows.
pub const CLOSE_OVERLOADED: u16 = 1013;
/// Close code sent when the relay shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Why a socket is being closed; delivered to its writer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

struct ClientHandle {
    tx: mpsc::Sender<Message>,
    close: watch::Sender<Option<CloseReason>>,
}

/// Handed to the accept path for a newly registered client.
pub struct ClientRegistration {
    pub id: Uuid,
    pub frames: mpsc::Receiver<Message>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

/// The set of connected CDP clients.
pub struct CdpHub {
    clients: Mutex<HashMap<Uuid, ClientHandle>>,
    queue_cap: usize,
}

impl CdpHub {
    pub fn new(queue_cap: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            queue_cap,
        }
    }

    /// Register a new client and return the receiving halves for its
    /// writer task.
    pub fn register(&self) -> ClientRegistration {
        let id = Uuid::new_v4();
        let (tx, frames) = mpsc::channel(self.queue_cap);
        let (close_tx, close_rx) = watch::channel(None);
        let mut clients = self.lock();
        clients.insert(
            id,
            ClientHandle {
                tx,
                close: close_tx,
            },
        );
        debug!(client_id = %id, total = clients.len(), "CDP client registered");
        ClientRegistration {
            id,
            frames,
            close: close_rx,
        }
    }

    /// Drop a client after its socket closes.
    pub fn unregister(&self, id: Uuid) {
        let mut clients = self.lock();
        if clients.remove(&id).is_some() {
            debug!(client_id = %id, total = clients.len(), "CDP client unregistered");
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Enqueue a frame for every connected client.
    pub fn broadcast(&self, frame: &Value) {
        let text = frame.to_string();
        let mut overloaded = Vec::new();
        {
            let clients = self.lock();
            for (id, handle) in clients.iter() {
                let msg = Message::Text(text.clone().into());
                if let Err(mpsc::error::TrySendError::Full(_)) = handle.tx.try_send(msg) {
                    overloaded.push(*id);
                }
            }
        }
        for id in overloaded {
            self.kick(
                id,
                CloseReason {
                    code: CLOSE_OVERLOADED,
                    reason: "write queue overflow",
                },
            );
        }
    }

    /// Enqueue a frame for one client. Returns false if the client is gone.
    pub fn send(&self, id: Uuid, frame: &Value) -> bool {
        let msg = Message::Text(frame.to_string().into());
        let result = {
            let clients = self.lock();
            match clients.get(&id) {
                Some(handle) => handle.tx.try_send(msg),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.kick(
                    id,
                    CloseReason {
                        code: CLOSE_OVERLOADED,
                        reason: "write queue overflow",
                    },
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(id);
                false
            }
        }
    }

    /// Enqueue a raw WebSocket message (pong replies) for one client.
    pub fn enqueue_raw(&self, id: Uuid, msg: Message) -> bool {
        let clients = self.lock();
        match clients.get(&id) {
            Some(handle) => handle.tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Close one client with the given reason and forget it.
    pub fn kick(&self, id: Uuid, reason: CloseReason) {
        let handle = self.lock().remove(&id);
        if let Some(handle) = handle {
            warn!(client_id = %id, code = reason.code, reason = reason.reason, "closing CDP client");
            let _ = handle.close.send(Some(reason));
        }
    }

    /// Close every client, used during relay teardown.
    pub fn close_all(&self, reason: CloseReason) {
        let handles: Vec<_> = {
            let mut clients = self.lock();
            clients.drain().collect()
        };
        for (id, handle) in handles {
            debug!(client_id = %id, code = reason.code, "closing CDP client for shutdown");
            let _ = handle.close.send(Some(reason));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ClientHandle>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writer task for one WebSocket: drains the frame queue into the sink and
/// terminates on a close signal or queue teardown. Shared by the CDP client
/// and extension accept paths; both serialize all writes through it.
pub async fn run_socket_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Message>,
    mut close: watch::Receiver<Option<CloseReason>>,
) {
    loop {
        tokio::select! {
            maybe_frame = frames.recv() => {
                match maybe_frame {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            changed = close.changed() => {
                if changed.is_err() {
                    break;
                }
                let reason = *close.borrow();
                if let Some(reason) = reason {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: reason.code,
                            reason: reason.reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    // -- Test: register / send / unregister --

    #[tokio::test]
    async fn send_reaches_registered_client() {
        let hub = CdpHub::new(8);
        let mut reg = hub.register();
        assert_eq!(hub.client_count(), 1);

        assert!(hub.send(reg.id, &json!({ "id": 1, "result": {} })));
        let value: Value =
            serde_json::from_str(&text_of(reg.frames.recv().await.unwrap())).unwrap();
        assert_eq!(value["id"], 1);

        hub.unregister(reg.id);
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.send(reg.id, &json!({})));
    }

    // -- Test: broadcast fans out to all clients --

    #[tokio::test]
    async fn broadcast_fans_out() {
        let hub = CdpHub::new(8);
        let mut a = hub.register();
        let mut b = hub.register();

        hub.broadcast(&json!({ "method": "Target.targetInfoChanged", "params": {} }));

        for reg in [&mut a, &mut b] {
            let text = text_of(reg.frames.recv().await.unwrap());
            assert!(text.contains("Target.targetInfoChanged"));
        }
    }

    // -- Test: queue overflow kicks the slow client with 1013 --

    #[tokio::test]
    async fn overflow_closes_client() {
        let hub = CdpHub::new(2);
        let mut reg = hub.register();

        hub.broadcast(&json!({ "n": 1 }));
        hub.broadcast(&json!({ "n": 2 }));
        // Queue full now; the third broadcast must kick the client.
        hub.broadcast(&json!({ "n": 3 }));

        assert_eq!(hub.client_count(), 0);
        reg.close.changed().await.unwrap();
        let reason = reg.close.borrow().unwrap();
        assert_eq!(reason.code, CLOSE_OVERLOADED);
    }

    // -- Test: close_all signals every writer --

    #[tokio::test]
    async fn close_all_signals_everyone() {
        let hub = CdpHub::new(4);
        let mut a = hub.register();
        let mut b = hub.register();

        hub.close_all(CloseReason {
            code: CLOSE_GOING_AWAY,
            reason: "relay shutting down",
        });

        for reg in [&mut a, &mut b] {
            reg.close.changed().await.unwrap();
            assert_eq!(reg.close.borrow().unwrap().code, CLOSE_GOING_AWAY);
        }
        assert_eq!(hub.client_count(), 0);
    }
}
