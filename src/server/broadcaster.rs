//! Server-side state broadcasting.
//!
//! The [`Broadcaster`] owns the authoritative state tree. Mutations only
//! mark it dirty; [`Broadcaster::flush`] diffs the tree against the last
//! broadcast snapshot once and hands every session its own redacted copy
//! of that delta. Any number of mutations between two flushes cost one
//! message per session.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use super::session::{Identity, ServerSessionId};
use crate::core::PROTOCOL_VERSION;
use crate::delta::{Delta, StateTree, clone_public, clone_public_value, diff};
use crate::sync::ServerMessage;

/// Which parts of the tree each identity may see.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedactionRules {
    /// Top-level keys only privileged sessions receive.
    pub privileged_keys: Vec<String>,
    /// Top-level key holding one entry per user, e.g. `"users"`.
    ///
    /// Each session additionally receives its own entry under
    /// [`identity_key`](Self::identity_key).
    pub identity_source: Option<String>,
    /// Key the session's own user entry is written to.
    pub identity_key: String,
}

impl Default for RedactionRules {
    fn default() -> Self {
        Self {
            privileged_keys: Vec::new(),
            identity_source: None,
            identity_key: "me".to_string(),
        }
    }
}

impl RedactionRules {
    /// Produce the copy of `shared` that `identity` receives.
    ///
    /// `shared` is either a delta or a full public snapshot; both have the
    /// same shape so one routine serves `init` and `store-delta`.
    pub fn redact(&self, shared: &Delta, identity: &Identity) -> Delta {
        let mut out = shared.clone();
        out.remove(&self.identity_key);

        if !identity.privileged {
            for key in &self.privileged_keys {
                out.remove(key);
            }
        }

        if let Some(source) = &self.identity_source {
            // Read from `shared` so a privileged source still yields `me`.
            match shared.get(source) {
                Some(Value::Object(entries)) => {
                    if let Some(entry) = entries.get(&identity.user) {
                        out.insert(self.identity_key.clone(), clone_public_value(entry));
                    }
                }
                Some(_) => {
                    out.insert(self.identity_key.clone(), Value::Null);
                }
                None => {}
            }
        }

        out
    }
}

/// Authoritative state plus the sessions it is broadcast to.
#[derive(Debug)]
pub struct Broadcaster {
    canonical: StateTree,
    last_broadcast: StateTree,
    sessions: BTreeMap<ServerSessionId, Identity>,
    rules: RedactionRules,
    version: u32,
    dirty: bool,
}

impl Broadcaster {
    /// Start from `initial`, announcing [`PROTOCOL_VERSION`].
    pub fn new(initial: StateTree, rules: RedactionRules) -> Self {
        let last_broadcast = clone_public(&initial);
        Self {
            canonical: initial,
            last_broadcast,
            sessions: BTreeMap::new(),
            rules,
            version: PROTOCOL_VERSION,
            dirty: false,
        }
    }

    /// Announce a different protocol version in `init`.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Authoritative state, private keys included.
    pub fn canonical(&self) -> &StateTree {
        &self.canonical
    }

    /// Redaction rules in force.
    pub fn rules(&self) -> &RedactionRules {
        &self.rules
    }

    /// Whether mutations are waiting for [`flush`](Self::flush).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a session and build the `init` message it must receive.
    pub fn add_session(&mut self, id: ServerSessionId, identity: Identity) -> ServerMessage {
        let init = self.init_for(&identity);
        self.sessions.insert(id, identity);
        init
    }

    /// Forget a session. Returns its identity if it was registered.
    pub fn remove_session(&mut self, id: ServerSessionId) -> Option<Identity> {
        self.sessions.remove(&id)
    }

    /// Full redacted snapshot for `identity`.
    ///
    /// Built from the current tree, so it may include changes not yet
    /// flushed; the following delta then repeats them, which applying
    /// tolerates.
    pub fn init_for(&self, identity: &Identity) -> ServerMessage {
        let public = clone_public(&self.canonical);
        ServerMessage::Init {
            version: self.version,
            snapshot: self.rules.redact(&public, identity),
        }
    }

    /// Change the authoritative state. Nothing is sent until `flush`.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut StateTree) -> R) -> R {
        self.dirty = true;
        f(&mut self.canonical)
    }

    /// Diff once and return every non-empty per-session delta.
    pub fn flush(&mut self) -> Vec<(ServerSessionId, ServerMessage)> {
        if !self.dirty {
            return Vec::new();
        }
        self.dirty = false;

        let delta = diff(&self.canonical, &self.last_broadcast);
        if delta.is_empty() {
            return Vec::new();
        }
        self.last_broadcast = clone_public(&self.canonical);
        trace!(keys = delta.len(), sessions = self.sessions.len(), "broadcast");

        self.sessions
            .iter()
            .filter_map(|(id, identity)| {
                let redacted = self.rules.redact(&delta, identity);
                (!redacted.is_empty()).then(|| (*id, ServerMessage::StoreDelta(redacted)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(value: Value) -> StateTree {
        match value {
            Value::Object(map) => map,
            _ => panic!("test trees must be objects"),
        }
    }

    fn rules() -> RedactionRules {
        RedactionRules {
            privileged_keys: vec!["users".into()],
            identity_source: Some("users".into()),
            identity_key: "me".into(),
        }
    }

    fn initial() -> StateTree {
        tree(json!({
            "lights": {"l1": {"on": false}},
            "users": {
                "alice": {"name": "Alice", "_hash": "x"},
                "bob": {"name": "Bob"}
            },
            "_secrets": {"token": "t"}
        }))
    }

    fn sid(n: u8) -> ServerSessionId {
        ServerSessionId::new([n, 0, 0, 0, 0, 0])
    }

    fn delta_for(out: &[(ServerSessionId, ServerMessage)], id: ServerSessionId) -> Option<&Delta> {
        out.iter().find(|(s, _)| *s == id).map(|(_, m)| match m {
            ServerMessage::StoreDelta(d) => d,
            other => panic!("unexpected message {other:?}"),
        })
    }

    #[test]
    fn test_init_redacts_per_identity() {
        let b = Broadcaster::new(initial(), rules()).with_version(3);

        match b.init_for(&Identity::user("bob")) {
            ServerMessage::Init { version, snapshot } => {
                assert_eq!(version, 3);
                assert_eq!(
                    snapshot,
                    tree(json!({"lights": {"l1": {"on": false}}, "me": {"name": "Bob"}}))
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        match b.init_for(&Identity::admin("alice")) {
            ServerMessage::Init { snapshot, .. } => {
                assert_eq!(snapshot["me"], json!({"name": "Alice"}));
                assert!(snapshot.contains_key("users"));
                assert!(!snapshot.contains_key("_secrets"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_mutations_batch_into_one_delta() {
        let mut b = Broadcaster::new(initial(), rules());
        b.add_session(sid(1), Identity::user("bob"));

        b.mutate(|s| s["lights"]["l1"]["on"] = json!(true));
        b.mutate(|s| s["lights"]["l1"]["level"] = json!(40));
        assert!(b.is_dirty());

        let out = b.flush();
        assert_eq!(out.len(), 1);
        assert_eq!(
            delta_for(&out, sid(1)),
            Some(&tree(json!({"lights": {"l1": {"on": true, "level": 40}}})))
        );
        assert!(!b.is_dirty());
        assert!(b.flush().is_empty());
    }

    #[test]
    fn test_privileged_change_skips_regular_sessions() {
        let mut b = Broadcaster::new(initial(), rules());
        b.add_session(sid(1), Identity::user("bob"));
        b.add_session(sid(2), Identity::admin("alice"));

        b.mutate(|s| s["users"]["alice"]["name"] = json!("Alicia"));
        let out = b.flush();

        // Bob sees neither the users subtree nor a change to his own entry.
        assert_eq!(delta_for(&out, sid(1)), None);
        assert_eq!(
            delta_for(&out, sid(2)),
            Some(&tree(json!({
                "users": {"alice": {"name": "Alicia"}},
                "me": {"name": "Alicia"}
            })))
        );
    }

    #[test]
    fn test_identity_follows_own_entry() {
        let mut b = Broadcaster::new(initial(), rules());
        b.add_session(sid(1), Identity::user("bob"));

        b.mutate(|s| s["users"]["bob"]["name"] = json!("Robert"));
        let out = b.flush();
        assert_eq!(
            delta_for(&out, sid(1)),
            Some(&tree(json!({"me": {"name": "Robert"}})))
        );

        b.mutate(|s| {
            s["users"].as_object_mut().unwrap().remove("bob");
        });
        let out = b.flush();
        assert_eq!(delta_for(&out, sid(1)), Some(&tree(json!({"me": null}))));
    }

    #[test]
    fn test_private_only_change_sends_nothing() {
        let mut b = Broadcaster::new(initial(), rules());
        b.add_session(sid(1), Identity::admin("alice"));

        b.mutate(|s| s["_secrets"]["token"] = json!("rotated"));
        assert!(b.flush().is_empty());
        assert_eq!(b.canonical()["_secrets"]["token"], json!("rotated"));
    }

    #[test]
    fn test_removed_session_gets_nothing() {
        let mut b = Broadcaster::new(initial(), RedactionRules::default());
        b.add_session(sid(1), Identity::user("bob"));
        assert_eq!(b.remove_session(sid(1)), Some(Identity::user("bob")));

        b.mutate(|s| s["lights"]["l1"]["on"] = json!(true));
        assert!(b.flush().is_empty());
        assert_eq!(b.session_count(), 0);
    }

    #[test]
    fn test_shared_identity_key_is_stripped() {
        let mut b = Broadcaster::new(tree(json!({"me": "shared"})), rules());
        b.add_session(sid(1), Identity::user("carol"));

        b.mutate(|s| s["me"] = json!("changed"));
        assert!(b.flush().is_empty());
    }

    #[test]
    fn test_rules_deserialize_with_defaults() {
        let rules: RedactionRules =
            serde_json::from_value(json!({"privileged_keys": ["users"]})).unwrap();
        assert_eq!(rules.privileged_keys, vec!["users".to_string()]);
        assert_eq!(rules.identity_key, "me");
        assert_eq!(rules.identity_source, None);
    }
}
