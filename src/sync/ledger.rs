//! Prediction ledger
//!
//! Tracks optimistic local writes layered on top of canonical state. Each
//! live prediction remembers the forward patch it wrote to the view; the
//! view is always `canonical ⊕ forward patches in creation order`.
//!
//! The ledger does not own any tree. Callers pass the canonical tree and
//! the view in, which keeps the two in one place (the client store).

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::debug;

use crate::delta::{Delta, StateTree, apply, diff, restrict};

use super::command::Target;

/// Identifies one prediction.
///
/// A handle outlives its prediction. Once the prediction has been
/// committed, rolled back or superseded, operations on the handle are
/// no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PredictionHandle {
    target: Target,
    id: u64,
}

impl PredictionHandle {
    /// Target the prediction was made for.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Creation sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone)]
struct LivePrediction {
    target: Target,
    forward: Delta,
    deadline: Option<Instant>,
}

/// Live predictions keyed by creation order, at most one per target.
#[derive(Debug, Default)]
pub struct PredictionLedger {
    next_id: u64,
    live: BTreeMap<u64, LivePrediction>,
    by_target: HashMap<Target, u64>,
}

impl PredictionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a prediction for `target`.
    ///
    /// Any live prediction for the same target is rolled back first, so
    /// `mutate` always sees the view as it would be without it. `mutate`
    /// runs on a draft of the view; whatever it changes becomes the
    /// prediction's forward patch and is applied to `view`.
    pub fn predict<F>(
        &mut self,
        target: Target,
        deadline: Option<Instant>,
        canonical: &StateTree,
        view: &mut StateTree,
        mutate: F,
    ) -> PredictionHandle
    where
        F: FnOnce(&mut StateTree),
    {
        if let Some(&existing) = self.by_target.get(&target) {
            debug!(%target, superseded = existing, "superseding live prediction");
            self.remove_and_restore(existing, canonical, view);
        }

        let mut draft = view.clone();
        mutate(&mut draft);
        let forward = diff(&draft, view);
        apply(view, &forward);

        self.next_id += 1;
        let id = self.next_id;
        self.live.insert(
            id,
            LivePrediction {
                target: target.clone(),
                forward,
                deadline,
            },
        );
        self.by_target.insert(target.clone(), id);

        PredictionHandle { target, id }
    }

    /// Retire a prediction, leaving the view as it is.
    ///
    /// The predicted values stay visible until canonical state overwrites
    /// them. Returns `false` when the handle is stale.
    pub fn commit(&mut self, handle: &PredictionHandle) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        self.forget(handle.id);
        true
    }

    /// Reverse a prediction, restoring every field it wrote to the value
    /// implied by canonical state and the remaining live predictions.
    ///
    /// Returns `false` when the handle is stale.
    pub fn rollback(
        &mut self,
        handle: &PredictionHandle,
        canonical: &StateTree,
        view: &mut StateTree,
    ) -> bool {
        let Some(inverse) = self.inverse_patch(handle, canonical) else {
            return false;
        };
        self.forget(handle.id);
        apply(view, &inverse);
        true
    }

    /// Re-arm a prediction's expiry. `None` keeps it until the next settle.
    pub fn settle(&mut self, handle: &PredictionHandle, deadline: Option<Instant>) -> bool {
        match self.live.get_mut(&handle.id) {
            Some(entry) if entry.target == handle.target => {
                entry.deadline = deadline;
                true
            }
            _ => false,
        }
    }

    /// Roll back every prediction whose deadline is at or before `now`.
    pub fn expire(
        &mut self,
        now: Instant,
        canonical: &StateTree,
        view: &mut StateTree,
    ) -> Vec<PredictionHandle> {
        let due: Vec<PredictionHandle> = self
            .live
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(&id, entry)| PredictionHandle {
                target: entry.target.clone(),
                id,
            })
            .collect();

        for handle in &due {
            self.remove_and_restore(handle.id, canonical, view);
        }
        due
    }

    /// Roll back every live prediction.
    pub fn clear(&mut self, canonical: &StateTree, view: &mut StateTree) -> usize {
        let ids: Vec<u64> = self.live.keys().rev().copied().collect();
        for id in &ids {
            self.remove_and_restore(*id, canonical, view);
        }
        ids.len()
    }

    /// Re-apply every live forward patch to `view`, in creation order.
    ///
    /// Used after canonical state changed underneath the predictions.
    pub fn relayer(&self, view: &mut StateTree) {
        for entry in self.live.values() {
            apply(view, &entry.forward);
        }
    }

    /// The patch that would undo `handle` against current truth, or `None`
    /// when the handle is stale.
    pub fn inverse_patch(&self, handle: &PredictionHandle, canonical: &StateTree) -> Option<Delta> {
        if !self.is_live(handle) {
            return None;
        }
        self.inverse_of(handle.id, canonical)
    }

    /// Earliest expiry among live predictions.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.live.values().filter_map(|e| e.deadline).min()
    }

    /// Whether `handle` still names a live prediction.
    pub fn is_live(&self, handle: &PredictionHandle) -> bool {
        self.by_target.get(&handle.target) == Some(&handle.id)
    }

    /// Number of live predictions.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no prediction is live.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn forget(&mut self, id: u64) -> Option<LivePrediction> {
        let entry = self.live.remove(&id)?;
        self.by_target.remove(&entry.target);
        Some(entry)
    }

    fn remove_and_restore(&mut self, id: u64, canonical: &StateTree, view: &mut StateTree) {
        if let Some(inverse) = self.inverse_of(id, canonical) {
            self.forget(id);
            apply(view, &inverse);
        }
    }

    fn inverse_of(&self, id: u64, canonical: &StateTree) -> Option<Delta> {
        let entry = self.live.get(&id)?;
        Some(restrict(&self.layered_without(id, canonical), &entry.forward))
    }

    /// Canonical state with every live prediction except `skip` applied.
    fn layered_without(&self, skip: u64, canonical: &StateTree) -> StateTree {
        let mut base = canonical.clone();
        for (_, entry) in self.live.iter().filter(|(id, _)| **id != skip) {
            apply(&mut base, &entry.forward);
        }
        base
    }
}
