//! Client store
//!
//! Holds the canonical tree received from the server, the observed view
//! (canonical with live predictions layered on top) and the prediction
//! ledger. Only the store changes these trees; callers read them through
//! [`ClientStore::canonical`] and [`ClientStore::view`] and learn about
//! changes through explicit subscriptions.

use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::delta::{Delta, StateTree, apply, clone_public, diff};

use super::command::Target;
use super::ledger::{PredictionHandle, PredictionLedger};

/// What caused a visible change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Canonical state from the server.
    Canonical,
    /// A new local prediction.
    Predicted,
    /// A prediction was reversed or expired.
    Rollback,
}

/// A visible change to the view.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    /// Cause of the change.
    pub kind: ChangeKind,
    /// Difference between the new view and the previous one.
    pub delta: Delta,
}

/// Token returned by [`ClientStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&StoreChange) + Send>;

/// Canonical tree, predicted view and ledger.
#[derive(Default)]
pub struct ClientStore {
    canonical: StateTree,
    view: StateTree,
    ledger: PredictionLedger,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
    revision: u64,
    canonical_dirty: bool,
}

impl fmt::Debug for ClientStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStore")
            .field("canonical", &self.canonical)
            .field("view", &self.view)
            .field("ledger", &self.ledger)
            .field("listeners", &self.listeners.len())
            .field("revision", &self.revision)
            .finish()
    }
}

impl ClientStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with previously persisted canonical state.
    pub fn with_state(state: StateTree) -> Self {
        let canonical = clone_public(&state);
        Self {
            view: canonical.clone(),
            canonical,
            ..Self::default()
        }
    }

    /// Last state confirmed by the server.
    pub fn canonical(&self) -> &StateTree {
        &self.canonical
    }

    /// What the UI should show.
    pub fn view(&self) -> &StateTree {
        &self.view
    }

    /// The prediction ledger.
    pub fn ledger(&self) -> &PredictionLedger {
        &self.ledger
    }

    /// Incremented on every visible change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace canonical state with a full snapshot.
    pub fn reset_canonical(&mut self, snapshot: &StateTree) {
        let before = self.view.clone();
        self.canonical = clone_public(snapshot);
        self.view = self.canonical.clone();
        self.ledger.relayer(&mut self.view);
        self.canonical_dirty = true;
        self.publish(ChangeKind::Canonical, &before);
    }

    /// Apply a canonical delta. Live predictions stay layered on top.
    pub fn apply_canonical(&mut self, delta: &Delta) {
        let before = self.view.clone();
        apply(&mut self.canonical, delta);
        apply(&mut self.view, delta);
        self.ledger.relayer(&mut self.view);
        self.canonical_dirty = true;
        self.publish(ChangeKind::Canonical, &before);
    }

    /// Predict a local change for `target`. See [`PredictionLedger::predict`].
    pub fn predict<F>(&mut self, target: Target, deadline: Option<Instant>, mutate: F) -> PredictionHandle
    where
        F: FnOnce(&mut StateTree),
    {
        let before = self.view.clone();
        let handle = self
            .ledger
            .predict(target, deadline, &self.canonical, &mut self.view, mutate);
        debug!(target = %handle.target(), id = handle.id(), "prediction applied");
        self.publish(ChangeKind::Predicted, &before);
        handle
    }

    /// Retire a prediction, keeping its values visible.
    pub fn commit(&mut self, handle: &PredictionHandle) -> bool {
        self.ledger.commit(handle)
    }

    /// Reverse a prediction.
    pub fn rollback(&mut self, handle: &PredictionHandle) -> bool {
        let before = self.view.clone();
        let rolled = self.ledger.rollback(handle, &self.canonical, &mut self.view);
        if rolled {
            debug!(target = %handle.target(), id = handle.id(), "prediction rolled back");
            self.publish(ChangeKind::Rollback, &before);
        }
        rolled
    }

    /// Re-arm a prediction's expiry. See [`PredictionLedger::settle`].
    pub fn settle(&mut self, handle: &PredictionHandle, deadline: Option<Instant>) -> bool {
        self.ledger.settle(handle, deadline)
    }

    /// Roll back predictions whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.view.clone();
        let expired = self.ledger.expire(now, &self.canonical, &mut self.view);
        if !expired.is_empty() {
            debug!(count = expired.len(), "predictions expired");
            self.publish(ChangeKind::Rollback, &before);
        }
        expired.len()
    }

    /// Roll back every live prediction.
    pub fn rollback_all(&mut self) -> usize {
        let before = self.view.clone();
        let count = self.ledger.clear(&self.canonical, &mut self.view);
        if count > 0 {
            self.publish(ChangeKind::Rollback, &before);
        }
        count
    }

    /// Earliest prediction expiry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ledger.next_deadline()
    }

    /// Whether canonical state changed since the last call, clearing the flag.
    pub fn take_canonical_dirty(&mut self) -> bool {
        std::mem::take(&mut self.canonical_dirty)
    }

    /// Register a change listener.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&StoreChange) + Send + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a change listener.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sub, _)| *sub != id);
        self.listeners.len() != before
    }

    fn publish(&mut self, kind: ChangeKind, before: &StateTree) {
        let delta = diff(&self.view, before);
        if delta.is_empty() {
            return;
        }
        self.revision += 1;
        let change = StoreChange { kind, delta };
        for (_, listener) in &mut self.listeners {
            listener(&change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::get_path;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn tree(value: Value) -> StateTree {
        match value {
            Value::Object(map) => map,
            _ => panic!("test trees must be objects"),
        }
    }

    fn on(view: &StateTree, id: &str) -> Option<bool> {
        get_path(view, &["lights", id, "on"]).and_then(Value::as_bool)
    }

    fn turn(id: &'static str, value: bool) -> impl FnOnce(&mut StateTree) {
        move |s: &mut StateTree| apply(s, &tree(json!({"lights": {id: {"on": value}}})))
    }

    #[test]
    fn test_canonical_under_prediction() {
        let mut store = ClientStore::new();
        store.reset_canonical(&tree(json!({"lights": {"l1": {"on": false}}})));

        store.predict("l1".into(), None, turn("l1", false));
        store.apply_canonical(&tree(json!({"lights": {"l1": {"on": true}}})));

        assert_eq!(on(store.canonical(), "l1"), Some(true));
        assert_eq!(on(store.view(), "l1"), Some(false));
    }

    #[test]
    fn test_rollback_reveals_newer_canonical() {
        let mut store = ClientStore::new();
        store.reset_canonical(&tree(json!({"lights": {"l1": {"on": false}}})));

        let handle = store.predict("l1".into(), None, turn("l1", true));
        store.apply_canonical(&tree(json!({"lights": {"l1": {"on": false, "bri": 5}}})));
        store.rollback(&handle);

        assert_eq!(store.view(), store.canonical());
    }

    #[test]
    fn test_committed_value_persists_until_overwritten() {
        let mut store = ClientStore::new();
        store.reset_canonical(&tree(json!({"lights": {"l1": {"on": false}}})));

        let handle = store.predict("l1".into(), None, turn("l1", true));
        assert!(store.commit(&handle));
        assert_eq!(on(store.view(), "l1"), Some(true));

        store.apply_canonical(&tree(json!({"lights": {"l1": {"on": false}}})));
        assert_eq!(on(store.view(), "l1"), Some(false));
    }

    #[test]
    fn test_expire() {
        let mut store = ClientStore::new();
        store.reset_canonical(&tree(json!({"lights": {"l1": {"on": false}}})));
        let now = Instant::now();

        store.predict("l1".into(), Some(now + Duration::from_secs(2)), turn("l1", true));
        assert_eq!(store.next_deadline(), Some(now + Duration::from_secs(2)));
        assert_eq!(store.expire(now + Duration::from_secs(1)), 0);
        assert_eq!(store.expire(now + Duration::from_secs(2)), 1);
        assert_eq!(on(store.view(), "l1"), Some(false));
    }

    #[test]
    fn test_reset_keeps_live_predictions() {
        let mut store = ClientStore::new();
        store.predict("l1".into(), None, turn("l1", true));
        store.reset_canonical(&tree(json!({"lights": {"l1": {"on": false}, "l2": {"on": true}}})));

        assert_eq!(on(store.view(), "l1"), Some(true));
        assert_eq!(on(store.view(), "l2"), Some(true));
    }

    #[test]
    fn test_subscribers_see_changes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut store = ClientStore::new();
        let sink = Arc::clone(&seen);
        let id = store.subscribe(move |change| sink.lock().unwrap().push(change.kind));

        store.reset_canonical(&tree(json!({"lights": {"l1": {"on": false}}})));
        let handle = store.predict("l1".into(), None, turn("l1", true));
        store.rollback(&handle);
        // No visible change, no notification.
        store.apply_canonical(&tree(json!({"lights": {"l1": {"on": false}}})));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChangeKind::Canonical, ChangeKind::Predicted, ChangeKind::Rollback]
        );
        assert_eq!(store.revision(), 3);

        assert!(store.unsubscribe(id));
        store.apply_canonical(&tree(json!({"lights": {"l1": {"on": true}}})));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_canonical_dirty_flag() {
        let mut store = ClientStore::with_state(tree(json!({"a": 1, "_local": 2})));
        assert!(!store.canonical().contains_key("_local"));
        assert!(!store.take_canonical_dirty());

        store.predict("a".into(), None, |s| {
            s.insert("a".into(), json!(2));
        });
        assert!(!store.take_canonical_dirty());

        store.apply_canonical(&tree(json!({"b": 1})));
        assert!(store.take_canonical_dirty());
        assert!(!store.take_canonical_dirty());
    }

    #[test]
    fn test_rollback_all() {
        let mut store = ClientStore::new();
        store.reset_canonical(&tree(json!({"lights": {"l1": {"on": false}, "l2": {"on": false}}})));
        store.predict("l1".into(), None, turn("l1", true));
        store.predict("l2".into(), None, turn("l2", true));

        assert_eq!(store.rollback_all(), 2);
        assert_eq!(store.view(), store.canonical());
    }
}
