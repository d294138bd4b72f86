//! tabwire: a Chrome extension ↔ CDP relay.
//!
//! A process-local bridge that lets CDP clients (automation drivers) drive
//! browser tabs through a browser extension over WebSocket, in environments
//! where the browser's own DevTools endpoint is not reachable -- locked-down
//! browsers, sandboxed profiles, mobile-embedded webviews.
//!
//! # Architecture
//!
//! Two populations connect to one bound loopback server:
//!
//! - **`/extension`** -- exactly one extension socket at a time. It observes
//!   the browser, enumerates tabs, and carries CDP traffic for the targets
//!   it has attached.
//! - **`/cdp`** -- zero or more CDP client sockets speaking standard Chrome
//!   DevTools Protocol framing, plus the usual `/json/version` and
//!   `/json/list` discovery endpoints.
//!
//! The relay multiplexes all CDP clients onto the single extension link
//! while preserving per-message `id`/`sessionId` request-response semantics,
//! keeps an authoritative registry of attached targets and discovered tabs,
//! and synthesizes the `Target.*` lifecycle events clients expect from a
//! real browser. Access is gated by a per-instance bearer token; the token
//! is discoverable through the authenticated `/json/version` response.
//!
//! # Example (conceptual)
//!
//! ```ignore
//! use tabwire_relay::{ensure_relay, stop_relay};
//!
//! let relay = ensure_relay("http://127.0.0.1:9222").await?;
//! println!("connect your driver to {}", relay.cdp_ws_url());
//! // ... drive the browser ...
//! stop_relay("http://127.0.0.1:9222").await?;
//! ```

pub mod auth;
pub mod error;
pub mod extension;
pub mod http;
pub mod hub;
pub mod instance;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod supervisor;

// Re-export the public surface at the crate root for convenience.
pub use error::RelayError;
pub use instance::{RelayConfig, RelayInstance};
pub use registry::{AttachedTarget, DiscoveredTab, TargetRegistry};
pub use supervisor::{ensure_relay, relay_auth_headers, stop_relay};
