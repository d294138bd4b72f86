//! Authoritative view of attached targets and discovered tabs.
//!
//! The registry is the single shared-state component of a relay instance.
//! It is deliberately synchronous: mutation methods take `&mut self`, never
//! block, and return the synthetic `Target.*` event frames the caller must
//! broadcast. Callers hold the instance mutex only for the duration of the
//! mutation, so every change is visible to subsequent `/json/list` reads.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::protocol::event_frame;

/// A tab the extension has attached. CDP traffic flows for these.
#[derive(Debug, Clone)]
pub struct AttachedTarget {
    /// Extension-assigned target id, stable for the attach's lifetime.
    pub target_id: String,
    /// Extension-assigned session id, unique across live attachments.
    pub session_id: String,
    pub title: String,
    pub url: String,
    pub waiting_for_debugger: bool,
    /// Attach order, used to keep listings and replays deterministic.
    seq: u64,
}

/// A tab the extension knows about but has not attached.
#[derive(Debug, Clone)]
pub struct DiscoveredTab {
    pub tab_id: i64,
    pub title: String,
    pub url: String,
    pub active: bool,
}

impl DiscoveredTab {
    /// Synthetic target id surfaced in `/json/list` and `/json/attach`.
    pub fn synthetic_id(&self) -> String {
        format!("dtab-{}", self.tab_id)
    }
}

/// Normalize a URL for dedup comparison: parse and re-stringify, fragment
/// kept, surrounding whitespace trimmed. Unparseable input falls back to
/// the trimmed raw string.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

/// Registry of attached sessions and discovered tabs for one relay instance.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    /// Live attachments keyed by session id.
    attached: HashMap<String, AttachedTarget>,
    /// Known-but-unattached tabs keyed by browser tab id.
    discovered: HashMap<i64, DiscoveredTab>,
    next_seq: u64,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Extension event handlers -------------------------------------------

    /// Handle `Target.attachedToTarget`.
    ///
    /// If the session id is already live for a *different* target, the old
    /// entry is detached first and a synthetic `Target.detachedFromTarget`
    /// precedes the rebroadcast. Re-delivery for the same target is a
    /// refresh. The incoming event is always rebroadcast.
    pub fn on_attached_to_target(&mut self, params: &Value) -> Vec<Value> {
        let Some(session_id) = params.get("sessionId").and_then(|v| v.as_str()) else {
            warn!("attachedToTarget event without sessionId, dropping");
            return Vec::new();
        };
        let info = target_info(params);
        let Some(target_id) = info.get("targetId").and_then(|v| v.as_str()) else {
            warn!(session_id, "attachedToTarget event without targetId, dropping");
            return Vec::new();
        };

        let mut events = Vec::new();

        if let Some(existing) = self.attached.get(session_id) {
            if existing.target_id != target_id {
                debug!(
                    session_id,
                    old_target = %existing.target_id,
                    new_target = target_id,
                    "session id reused, detaching old target"
                );
                events.push(event_frame(
                    "Target.detachedFromTarget",
                    json!({ "sessionId": session_id, "targetId": existing.target_id }),
                    None,
                ));
                self.attached.remove(session_id);
            }
        }

        let seq = match self.attached.get(session_id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.attached.insert(
            session_id.to_string(),
            AttachedTarget {
                target_id: target_id.to_string(),
                session_id: session_id.to_string(),
                title: str_field(&info, "title"),
                url: str_field(&info, "url"),
                waiting_for_debugger: params
                    .get("waitingForDebugger")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                seq,
            },
        );

        events.push(event_frame("Target.attachedToTarget", params.clone(), None));
        events
    }

    /// Handle `Target.detachedFromTarget`: remove and rebroadcast.
    pub fn on_detached_from_target(&mut self, params: &Value) -> Vec<Value> {
        if let Some(session_id) = params.get("sessionId").and_then(|v| v.as_str()) {
            if self.attached.remove(session_id).is_some() {
                debug!(session_id, "target detached");
            }
        }
        vec![event_frame("Target.detachedFromTarget", params.clone(), None)]
    }

    /// Handle `Target.targetInfoChanged`: update title/url by target id and
    /// rebroadcast.
    pub fn on_target_info_changed(&mut self, params: &Value) -> Vec<Value> {
        let info = target_info(params);
        if let Some(target_id) = info.get("targetId").and_then(|v| v.as_str()) {
            for entry in self.attached.values_mut() {
                if entry.target_id == target_id {
                    if let Some(title) = info.get("title").and_then(|v| v.as_str()) {
                        entry.title = title.to_string();
                    }
                    if let Some(url) = info.get("url").and_then(|v| v.as_str()) {
                        entry.url = url.to_string();
                    }
                }
            }
        }
        vec![event_frame("Target.targetInfoChanged", params.clone(), None)]
    }

    /// Handle `tabsDiscovered`: atomically replace the discovered-tab set.
    ///
    /// The tab list is accepted either as a bare array or wrapped in
    /// `{tabs: [...]}`.
    pub fn on_tabs_discovered(&mut self, params: &Value) {
        let tabs = match params {
            Value::Array(items) => items.as_slice(),
            other => match other.get("tabs").and_then(|v| v.as_array()) {
                Some(items) => items.as_slice(),
                None => {
                    warn!("tabsDiscovered event without a tab list, dropping");
                    return;
                }
            },
        };

        self.discovered.clear();
        for tab in tabs {
            let Some(tab_id) = tab.get("tabId").and_then(|v| v.as_i64()) else {
                warn!("discovered tab without tabId, skipping");
                continue;
            };
            self.discovered.insert(
                tab_id,
                DiscoveredTab {
                    tab_id,
                    title: str_field(tab, "title"),
                    url: str_field(tab, "url"),
                    active: tab.get("active").and_then(|v| v.as_bool()).unwrap_or(false),
                },
            );
        }
        debug!(count = self.discovered.len(), "discovered tab set replaced");
    }

    /// Handle `tabUpdated`: upsert a discovered tab.
    pub fn on_tab_updated(&mut self, params: &Value) {
        let Some(tab_id) = params.get("tabId").and_then(|v| v.as_i64()) else {
            warn!("tabUpdated event without tabId, dropping");
            return;
        };
        let entry = self.discovered.entry(tab_id).or_insert_with(|| DiscoveredTab {
            tab_id,
            title: String::new(),
            url: String::new(),
            active: false,
        });
        if let Some(title) = params.get("title").and_then(|v| v.as_str()) {
            entry.title = title.to_string();
        }
        if let Some(url) = params.get("url").and_then(|v| v.as_str()) {
            entry.url = url.to_string();
        }
        if let Some(active) = params.get("active").and_then(|v| v.as_bool()) {
            entry.active = active;
        }
    }

    /// Handle `tabRemoved`: delete the discovered tab if present.
    pub fn on_tab_removed(&mut self, params: &Value) {
        if let Some(tab_id) = params.get("tabId").and_then(|v| v.as_i64()) {
            self.discovered.remove(&tab_id);
        }
    }

    /// Clear both sets after the extension disconnects. Returns synthetic
    /// detach events so connected CDP clients observe the teardown.
    pub fn on_extension_disconnected(&mut self) -> Vec<Value> {
        let events = self
            .attached_snapshot()
            .iter()
            .map(|target| {
                event_frame(
                    "Target.detachedFromTarget",
                    json!({ "sessionId": target.session_id, "targetId": target.target_id }),
                    None,
                )
            })
            .collect();
        self.attached.clear();
        self.discovered.clear();
        events
    }

    // -- Queries ------------------------------------------------------------

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.attached.contains_key(session_id)
    }

    pub fn find_by_target_id(&self, target_id: &str) -> Option<&AttachedTarget> {
        self.attached.values().find(|t| t.target_id == target_id)
    }

    pub fn has_discovered_tab(&self, tab_id: i64) -> bool {
        self.discovered.contains_key(&tab_id)
    }

    /// Attached targets in attach order.
    pub fn attached_snapshot(&self) -> Vec<AttachedTarget> {
        let mut targets: Vec<_> = self.attached.values().cloned().collect();
        targets.sort_by_key(|t| t.seq);
        targets
    }

    /// The `/json/list` view: every attached target, then every discovered
    /// tab whose normalized URL is not already represented by an attached
    /// target. Only attached rows carry a `webSocketDebuggerUrl`.
    pub fn list(&self, cdp_ws_url: &str) -> Vec<Value> {
        let mut rows = Vec::new();
        for target in self.attached_snapshot() {
            rows.push(json!({
                "id": target.target_id,
                "type": "page",
                "title": target.title,
                "url": target.url,
                "webSocketDebuggerUrl": cdp_ws_url,
            }));
        }

        let attached_urls: Vec<String> = self
            .attached
            .values()
            .map(|t| normalize_url(&t.url))
            .collect();

        let mut tabs: Vec<_> = self.discovered.values().collect();
        tabs.sort_by_key(|t| t.tab_id);
        for tab in tabs {
            if attached_urls.contains(&normalize_url(&tab.url)) {
                continue;
            }
            rows.push(json!({
                "id": tab.synthetic_id(),
                "type": "page",
                "title": tab.title,
                "url": tab.url,
            }));
        }
        rows
    }
}

/// Build the synthetic `Target.attachedToTarget` event for a stored target,
/// used to replay the attached set to (late-joining) CDP clients.
pub fn attached_event(target: &AttachedTarget) -> Value {
    event_frame(
        "Target.attachedToTarget",
        json!({
            "sessionId": target.session_id,
            "targetInfo": target_info_json(target),
            "waitingForDebugger": target.waiting_for_debugger,
        }),
        None,
    )
}

/// Render a stored target as a CDP `TargetInfo` object.
pub fn target_info_json(target: &AttachedTarget) -> Value {
    json!({
        "targetId": target.target_id,
        "type": "page",
        "title": target.title,
        "url": target.url,
        "attached": true,
    })
}

/// Locate the `targetInfo` object of a `Target.*` event. The extension
/// nests it the way CDP does; a flat params object is tolerated too.
fn target_info(params: &Value) -> Value {
    params
        .get("targetInfo")
        .cloned()
        .unwrap_or_else(|| params.clone())
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WS: &str = "ws://127.0.0.1:9300/cdp?token=t";

    fn attach_params(session_id: &str, target_id: &str, url: &str, title: &str) -> Value {
        json!({
            "sessionId": session_id,
            "targetInfo": {
                "targetId": target_id,
                "type": "page",
                "title": title,
                "url": url,
            },
            "waitingForDebugger": false,
        })
    }

    // -- Test: attach inserts and rebroadcasts --

    #[test]
    fn attach_inserts_and_rebroadcasts() {
        let mut reg = TargetRegistry::new();
        let events =
            reg.on_attached_to_target(&attach_params("cb-tab-1", "t1", "https://example.com", "Example"));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["method"], "Target.attachedToTarget");
        assert_eq!(events[0]["params"]["sessionId"], "cb-tab-1");
        assert!(reg.session_exists("cb-tab-1"));
        assert_eq!(reg.find_by_target_id("t1").unwrap().title, "Example");
    }

    // -- Test: same session + same target is an idempotent refresh --

    #[test]
    fn repeated_attach_is_idempotent() {
        let mut reg = TargetRegistry::new();
        reg.on_attached_to_target(&attach_params("cb-tab-1", "t1", "https://example.com", "Example"));
        let events =
            reg.on_attached_to_target(&attach_params("cb-tab-1", "t1", "https://example.com/a", "Example A"));

        // No detach; still exactly one rebroadcast and one live session.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["method"], "Target.attachedToTarget");
        assert_eq!(reg.attached_snapshot().len(), 1);
        assert_eq!(reg.find_by_target_id("t1").unwrap().url, "https://example.com/a");
    }

    // -- Test: session id reuse detaches the old target first --

    #[test]
    fn session_reuse_detaches_old_target_first() {
        let mut reg = TargetRegistry::new();
        reg.on_attached_to_target(&attach_params("shared-session", "t1", "https://a.com", "A"));
        let events = reg.on_attached_to_target(&attach_params("shared-session", "t2", "https://b.com", "B"));

        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["method"], "Target.detachedFromTarget");
        assert_eq!(events[0]["params"]["sessionId"], "shared-session");
        assert_eq!(events[0]["params"]["targetId"], "t1");
        assert_eq!(events[1]["method"], "Target.attachedToTarget");

        // Exactly one live entry for the session id.
        assert_eq!(reg.attached_snapshot().len(), 1);
        assert_eq!(reg.find_by_target_id("t2").unwrap().session_id, "shared-session");
        assert!(reg.find_by_target_id("t1").is_none());
    }

    // -- Test: target info changes update title and url --

    #[test]
    fn target_info_changed_updates_fields() {
        let mut reg = TargetRegistry::new();
        reg.on_attached_to_target(&attach_params("cb-tab-1", "t1", "https://example.com", "Example"));
        let events = reg.on_target_info_changed(&json!({
            "targetInfo": {
                "targetId": "t1",
                "url": "https://www.derstandard.at/",
                "title": "DER STANDARD",
            }
        }));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["method"], "Target.targetInfoChanged");
        let target = reg.find_by_target_id("t1").unwrap();
        assert_eq!(target.title, "DER STANDARD");
        assert_eq!(target.url, "https://www.derstandard.at/");
    }

    // -- Test: tabsDiscovered is a full replace --

    #[test]
    fn tabs_discovered_replaces_set() {
        let mut reg = TargetRegistry::new();
        reg.on_tabs_discovered(&json!([
            { "tabId": 1, "url": "https://a.com", "title": "A" },
            { "tabId": 2, "url": "https://b.com", "title": "B" },
        ]));
        reg.on_tabs_discovered(&json!([
            { "tabId": 2, "url": "https://b.com", "title": "B" },
            { "tabId": 3, "url": "https://c.com", "title": "C" },
        ]));

        assert!(!reg.has_discovered_tab(1));
        assert!(reg.has_discovered_tab(2));
        assert!(reg.has_discovered_tab(3));
    }

    #[test]
    fn tabs_discovered_accepts_wrapped_list() {
        let mut reg = TargetRegistry::new();
        reg.on_tabs_discovered(&json!({ "tabs": [{ "tabId": 9, "url": "https://x.com" }] }));
        assert!(reg.has_discovered_tab(9));
    }

    // -- Test: tab update upserts, tab removal is a no-op when absent --

    #[test]
    fn tab_updated_upserts() {
        let mut reg = TargetRegistry::new();
        reg.on_tab_updated(&json!({ "tabId": 5, "url": "https://new.com", "active": true }));
        assert!(reg.has_discovered_tab(5));

        reg.on_tab_updated(&json!({ "tabId": 5, "title": "New" }));
        let rows = reg.list(WS);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "dtab-5");
        assert_eq!(rows[0]["title"], "New");
        assert_eq!(rows[0]["url"], "https://new.com");

        reg.on_tab_removed(&json!({ "tabId": 5 }));
        reg.on_tab_removed(&json!({ "tabId": 5 }));
        assert!(!reg.has_discovered_tab(5));
    }

    // -- Test: attached rows suppress discovered duplicates by URL --

    #[test]
    fn list_dedups_by_normalized_url() {
        let mut reg = TargetRegistry::new();
        reg.on_tabs_discovered(&json!([
            { "tabId": 300, "url": "https://example.com", "title": "Example" },
            { "tabId": 301, "url": "https://other.com", "title": "Other" },
        ]));
        reg.on_attached_to_target(&attach_params(
            "cb-tab-1",
            "real-t1",
            "https://example.com/",
            "Example",
        ));

        let rows = reg.list(WS);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "real-t1");
        assert_eq!(rows[0]["webSocketDebuggerUrl"], WS);
        assert_eq!(rows[1]["id"], "dtab-301");
        assert!(rows[1].get("webSocketDebuggerUrl").is_none());
        assert!(!rows.iter().any(|r| r["id"] == "dtab-300"));
    }

    // -- Test: URL normalization --

    #[test]
    fn url_normalization() {
        // Parsing adds the trailing slash on a bare authority.
        assert_eq!(normalize_url("https://example.com"), "https://example.com/");
        assert_eq!(normalize_url("https://example.com/  "), "https://example.com/");
        // Fragments are kept.
        assert_eq!(
            normalize_url("https://example.com/#frag"),
            "https://example.com/#frag"
        );
        // Unparseable input falls back to the trimmed raw string.
        assert_eq!(normalize_url("not a url "), "not a url");
    }

    // -- Test: extension disconnect clears everything --

    #[test]
    fn extension_disconnect_clears_and_detaches() {
        let mut reg = TargetRegistry::new();
        reg.on_attached_to_target(&attach_params("s1", "t1", "https://a.com", "A"));
        reg.on_attached_to_target(&attach_params("s2", "t2", "https://b.com", "B"));
        reg.on_tabs_discovered(&json!([{ "tabId": 500, "url": "https://c.com" }]));

        let events = reg.on_extension_disconnected();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e["method"] == "Target.detachedFromTarget"));
        assert!(reg.list(WS).is_empty());
        assert!(!reg.has_discovered_tab(500));
    }

    // -- Test: replay event rendering --

    #[test]
    fn attached_event_shape() {
        let mut reg = TargetRegistry::new();
        reg.on_attached_to_target(&attach_params("s1", "t1", "https://a.com", "A"));
        let target = &reg.attached_snapshot()[0];
        let event = attached_event(target);

        assert_eq!(event["method"], "Target.attachedToTarget");
        assert_eq!(event["params"]["sessionId"], "s1");
        assert_eq!(event["params"]["targetInfo"]["targetId"], "t1");
        assert_eq!(event["params"]["targetInfo"]["type"], "page");
        assert_eq!(event["params"]["targetInfo"]["attached"], true);
    }

    // -- Test: flat event params are tolerated --

    #[test]
    fn flat_attach_params_are_tolerated() {
        let mut reg = TargetRegistry::new();
        let events = reg.on_attached_to_target(&json!({
            "sessionId": "cb-tab-1",
            "targetId": "t1",
            "url": "https://example.com",
            "title": "Example",
        }));
        assert_eq!(events.len(), 1);
        assert_eq!(reg.find_by_target_id("t1").unwrap().url, "https://example.com");
    }
}
