//! One relay instance: the bound HTTP+WS server plus everything it owns.
//!
//! The instance is the ownership root -- registry, CDP hub, extension slot,
//! pending tables, shutdown channel. `shutdown` cancels everything: the
//! listener stops, sockets close with 1001, pending futures reject with a
//! shutdown error, and the registry is cleared.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::extension::ExtensionLink;
use crate::http;
use crate::hub::{CdpHub, CloseReason, CLOSE_GOING_AWAY};
use crate::registry::TargetRegistry;

/// Tunables for one relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host advertised in discovery URLs. The listener always binds
    /// loopback regardless.
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Deadline for `/json/attach/<id>` end to end.
    pub attach_timeout: Duration,
    /// Deadline for a forwarded CDP command.
    pub call_timeout: Duration,
    /// Interval between liveness pings to the extension.
    pub ping_interval: Duration,
    /// Silent ping intervals tolerated before the extension socket closes.
    pub missed_pong_limit: u32,
    /// Per-socket write queue capacity; overflow closes the socket.
    pub socket_queue_cap: usize,
    /// Largest inbound WS frame accepted on either endpoint.
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            attach_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            missed_pong_limit: 3,
            socket_queue_cap: 256,
            max_frame_bytes: 32 * 1024 * 1024,
        }
    }
}

/// A running relay bound to one loopback port.
pub struct RelayInstance {
    config: RelayConfig,
    token: String,
    registry: Mutex<TargetRegistry>,
    hub: CdpHub,
    extension: ExtensionLink,
    /// Generation counter bumped on every attach (and on extension
    /// disconnect) so attach waiters can re-check the registry.
    attach_gen: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl RelayInstance {
    /// Bind the listener and start serving.
    pub async fn start(config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        let bind_addr = SocketAddr::from(([127, 0, 0, 1], config.port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (attach_tx, _) = watch::channel(0u64);
        let queue_cap = config.socket_queue_cap;

        let instance = Arc::new(Self {
            config,
            token: crate::auth::mint_token(),
            registry: Mutex::new(TargetRegistry::new()),
            hub: CdpHub::new(queue_cap),
            extension: ExtensionLink::new(),
            attach_gen: attach_tx,
            shutdown: shutdown_tx,
            local_addr,
            server: Mutex::new(None),
        });

        let app = http::build_router(Arc::clone(&instance));
        let mut server_shutdown = shutdown_rx;
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    wait_for_shutdown(&mut server_shutdown).await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "relay server exited with error");
            }
        });
        instance
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);

        info!(addr = %local_addr, "relay listening");
        Ok(instance)
    }

    // -- Accessors ----------------------------------------------------------

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn hub(&self) -> &CdpHub {
        &self.hub
    }

    pub fn extension(&self) -> &ExtensionLink {
        &self.extension
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run a closure against the registry under its mutex.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut TargetRegistry) -> R) -> R {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut registry)
    }

    /// Wake attach waiters so they re-check the registry.
    pub fn notify_attach_change(&self) {
        self.attach_gen.send_modify(|gen| *gen += 1);
    }

    // -- Discovery URLs -----------------------------------------------------

    /// Base HTTP URL clients reach this relay on.
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.config.host, self.local_addr.port())
    }

    /// The token-bearing `/cdp` WebSocket URL advertised in discovery
    /// responses.
    pub fn cdp_ws_url(&self) -> String {
        format!(
            "ws://{}:{}/cdp?token={}",
            self.config.host,
            self.local_addr.port(),
            self.token
        )
    }

    // -- Driver-initiated attach --------------------------------------------

    /// Ask the extension to attach a previously discovered tab, then wait
    /// until the corresponding `Target.attachedToTarget` event has been
    /// observed. Returns `(target_id, session_id)`.
    ///
    /// The RPC reply and the attach event race; whichever lands first is
    /// remembered and the second completes the wait.
    pub async fn attach_discovered_tab(&self, tab_id: i64) -> Result<(String, String), RelayError> {
        if self.is_shutting_down() {
            return Err(RelayError::Shutdown);
        }
        if !self.extension.is_connected() {
            return Err(RelayError::ExtensionUnavailable {
                reason: "no extension connected".into(),
            });
        }
        if !self.with_registry(|r| r.has_discovered_tab(tab_id)) {
            return Err(RelayError::BadRequest {
                reason: format!("unknown discovered tab dtab-{tab_id}"),
            });
        }

        // Subscribe before issuing the call so an event arriving during the
        // RPC still wakes the wait loop.
        let mut attach_rx = self.attach_gen.subscribe();
        let deadline = Instant::now() + self.config.attach_timeout;

        let reply = self
            .extension
            .call(
                "attachDiscoveredTab",
                json!({ "tabId": tab_id }),
                self.config.attach_timeout,
            )
            .await?;

        if let Some(error) = reply.error {
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("attach rejected")
                .to_string();
            return Err(RelayError::BadRequest {
                reason: format!("extension rejected attach: {message}"),
            });
        }

        let result = reply.result.unwrap_or(serde_json::Value::Null);
        let session_id = result
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::Protocol {
                detail: "attach reply missing sessionId".into(),
            })?
            .to_string();
        let target_id = result
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::Protocol {
                detail: "attach reply missing targetId".into(),
            })?
            .to_string();

        loop {
            if self.with_registry(|r| r.session_exists(&session_id)) {
                info!(tab_id, session_id = %session_id, target_id = %target_id, "discovered tab attached");
                return Ok((target_id, session_id));
            }
            if self.is_shutting_down() {
                return Err(RelayError::Shutdown);
            }
            if !self.extension.is_connected() {
                return Err(RelayError::ExtensionUnavailable {
                    reason: "extension disconnected during attach".into(),
                });
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(RelayError::Timeout {
                    method: "attachDiscoveredTab".into(),
                    seconds: self.config.attach_timeout.as_secs(),
                });
            };
            match tokio::time::timeout(remaining, attach_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(RelayError::Shutdown),
                Err(_) => {
                    return Err(RelayError::Timeout {
                        method: "attachDiscoveredTab".into(),
                        seconds: self.config.attach_timeout.as_secs(),
                    });
                }
            }
        }
    }

    // -- Teardown -----------------------------------------------------------

    /// Stop the relay: close every socket, fail pending work, clear the
    /// registry, and wait for the server task to finish.
    pub async fn shutdown(&self) {
        info!(addr = %self.local_addr, "stopping relay");
        let _ = self.shutdown.send(true);

        self.extension.close_current(CloseReason {
            code: CLOSE_GOING_AWAY,
            reason: "relay shutting down",
        });
        self.hub.close_all(CloseReason {
            code: CLOSE_GOING_AWAY,
            reason: "relay shutting down",
        });
        self.extension.fail_all(|| RelayError::Shutdown);
        self.with_registry(|r| {
            let _ = r.on_extension_disconnected();
        });
        self.notify_attach_change();

        let handle = {
            self.server
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Wait for the shutdown signal without holding a non-`Send` borrow across
/// an await point; loops on `changed()` instead of `wait_for`.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
