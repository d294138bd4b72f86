//! Process-wide relay lifecycle, keyed by CDP URL.
//!
//! One relay instance exists per `host:port`; `ensure_relay` creates it on
//! first use and returns the existing instance afterwards. The map is a
//! private singleton initialized on first call -- never module-load-time
//! state -- and `stop_relay` is the explicit teardown.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use axum::http::{HeaderMap, HeaderValue};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RelayError;
use crate::instance::{RelayConfig, RelayInstance};

static RELAYS: OnceLock<Mutex<HashMap<String, Arc<RelayInstance>>>> = OnceLock::new();

fn relays() -> &'static Mutex<HashMap<String, Arc<RelayInstance>>> {
    RELAYS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Parse the host and port out of a CDP URL. `http`, `https`, `ws`, and
/// `wss` schemes are accepted; a missing explicit port falls back to the
/// scheme default.
pub fn parse_cdp_url(cdp_url: &str) -> Result<(String, u16), RelayError> {
    let parsed = url::Url::parse(cdp_url).map_err(|e| RelayError::InvalidUrl {
        url: cdp_url.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| RelayError::InvalidUrl {
            url: cdp_url.to_string(),
            reason: "missing host".into(),
        })?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| RelayError::InvalidUrl {
            url: cdp_url.to_string(),
            reason: "missing port".into(),
        })?;
    Ok((host, port))
}

fn instance_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Return the relay for `cdp_url`, starting one if none is running.
pub async fn ensure_relay(cdp_url: &str) -> Result<Arc<RelayInstance>, RelayError> {
    let (host, port) = parse_cdp_url(cdp_url)?;
    let key = instance_key(&host, port);

    let mut map = relays().lock().await;
    if let Some(existing) = map.get(&key) {
        if !existing.is_shutting_down() {
            debug!(key = %key, "reusing running relay");
            return Ok(Arc::clone(existing));
        }
        map.remove(&key);
    }

    let config = RelayConfig {
        host,
        port,
        ..RelayConfig::default()
    };
    let instance = RelayInstance::start(config).await?;
    map.insert(key, Arc::clone(&instance));
    Ok(instance)
}

/// Stop and remove the relay for `cdp_url`. Returns whether a relay was
/// actually running.
pub async fn stop_relay(cdp_url: &str) -> Result<bool, RelayError> {
    let (host, port) = parse_cdp_url(cdp_url)?;
    let key = instance_key(&host, port);

    let instance = { relays().lock().await.remove(&key) };
    match instance {
        Some(instance) => {
            instance.shutdown().await;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// The auth headers an in-process caller needs to reach the relay for
/// `cdp_url`, or `None` when no relay is running there.
pub async fn relay_auth_headers(cdp_url: &str) -> Result<Option<HeaderMap>, RelayError> {
    let (host, port) = parse_cdp_url(cdp_url)?;
    let key = instance_key(&host, port);

    let map = relays().lock().await;
    let Some(instance) = map.get(&key) else {
        return Ok(None);
    };
    let mut headers = HeaderMap::new();
    let value = format!("Bearer {}", instance.token());
    let value = HeaderValue::from_str(&value).map_err(|e| RelayError::Protocol {
        detail: format!("token not header-safe: {e}"),
    })?;
    headers.insert("authorization", value);
    Ok(Some(headers))
}
