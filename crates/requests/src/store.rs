use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{ItemPatch, RequestItem, RequestKind, RequestStatus};

/// Item counts by status, derived from the current batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
}

impl StatusCounts {
    /// Items that reached a terminal status.
    pub fn finished(&self) -> usize {
        self.complete + self.failed
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.finished()
    }
}

/// Read-only projection of the current batch, sufficient to render per-item
/// cards and an aggregate progress indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub items: Vec<RequestItem>,
    pub active: bool,
    pub finished: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct BatchState {
    items: Vec<RequestItem>,
    active: bool,
}

/// Outcome of `reset_item`, telling the caller whether the reset also
/// reactivated a previously inactive batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub reactivated: bool,
}

/// The ordered request items of the current batch plus the "batch is active"
/// flag; single source of truth written by the scheduler and read by
/// observers.
///
/// The scheduler never reorders the sequence, only item statuses change.
#[derive(Debug, Default)]
pub struct StatusStore {
    inner: RwLock<BatchState>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards the previous batch and installs a new ordered sequence.
    ///
    /// Resolutions of operations issued for the previous batch must be
    /// ignored by the caller from this point on; lookups for their ids will
    /// miss since the old items are gone.
    pub fn replace_batch(&self, items: Vec<RequestItem>) {
        let mut state = self.inner.write();
        state.items = items;
        state.active = true;
    }

    /// Applies a partial update to the item with the given id.
    ///
    /// No-op for absent ids; returns whether an item was patched.
    pub fn patch(&self, id: u64, patch: ItemPatch) -> bool {
        let mut state = self.inner.write();
        match state.items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                patch.apply(item);
                true
            }
            None => false,
        }
    }

    /// Resets a terminal item back to `Pending`, clearing its result, error
    /// and progress annotation. Reactivates the batch if it was inactive.
    ///
    /// Returns `None` when the id is absent or the item is not terminal.
    pub fn reset_item(&self, id: u64) -> Option<ResetOutcome> {
        let mut state = self.inner.write();
        let item = state.items.iter_mut().find(|item| item.id == id)?;
        if !item.status.is_terminal() {
            return None;
        }
        item.status = RequestStatus::Pending;
        item.result = None;
        item.error = None;
        item.progress_message = None;

        let reactivated = !state.active;
        state.active = true;
        Some(ResetOutcome { reactivated })
    }

    /// Clears the active flag without touching item statuses.
    pub fn mark_inactive(&self) {
        self.inner.write().active = false;
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().active
    }

    pub fn get(&self, id: u64) -> Option<RequestItem> {
        self.inner
            .read()
            .items
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    /// First `Pending` item in batch sequence order, the next dispatch
    /// candidate.
    pub fn next_pending(&self) -> Option<RequestItem> {
        self.inner
            .read()
            .items
            .iter()
            .find(|item| item.status == RequestStatus::Pending)
            .cloned()
    }

    /// Whether any video item is in a non-terminal state anywhere in the
    /// batch. While true, video work is exclusive with respect to the whole
    /// queue and the effective concurrency ceiling collapses to 1.
    pub fn has_blocking_video(&self) -> bool {
        self.inner
            .read()
            .items
            .iter()
            .any(|item| item.kind == RequestKind::Video && !item.is_terminal())
    }

    pub fn counts(&self) -> StatusCounts {
        let state = self.inner.read();
        let mut counts = StatusCounts::default();
        for item in &state.items {
            match item.status {
                RequestStatus::Pending => counts.pending += 1,
                RequestStatus::InProgress => counts.in_progress += 1,
                RequestStatus::Complete => counts.complete += 1,
                RequestStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// No `Pending` or `InProgress` items remain.
    pub fn all_terminal(&self) -> bool {
        self.inner.read().items.iter().all(|item| item.is_terminal())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.inner.read();
        let finished = state.items.iter().filter(|item| item.is_terminal()).count();
        StatusSnapshot {
            total: state.items.len(),
            finished,
            items: state.items.clone(),
            active: state.active,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArtifactRef, RequestDescriptor};

    fn batch(n: usize) -> Vec<RequestItem> {
        (0..n as u64)
            .map(|id| RequestItem::new(id, RequestDescriptor::image_edit(id, format!("edit {id}"))))
            .collect()
    }

    #[test]
    fn test_replace_batch_installs_pending_items_and_activates() {
        let store = StatusStore::new();
        assert!(!store.is_active());

        store.replace_batch(batch(3));
        assert!(store.is_active());
        assert_eq!(store.counts().pending, 3);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_patch_unknown_id_is_noop() {
        let store = StatusStore::new();
        store.replace_batch(batch(2));
        assert!(!store.patch(99, ItemPatch::started()));
        assert_eq!(store.counts().in_progress, 0);
    }

    #[test]
    fn test_counts_and_all_terminal() {
        let store = StatusStore::new();
        store.replace_batch(batch(3));
        store.patch(0, ItemPatch::started());
        store.patch(0, ItemPatch::completed(ArtifactRef("r".into())));
        store.patch(1, ItemPatch::started());
        store.patch(1, ItemPatch::failed("boom"));

        let counts = store.counts();
        assert_eq!(counts.complete, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.finished(), 2);
        assert!(!store.all_terminal());

        store.patch(2, ItemPatch::started());
        store.patch(2, ItemPatch::completed(ArtifactRef("r2".into())));
        assert!(store.all_terminal());
    }

    #[test]
    fn test_reset_item_clears_fields_and_reactivates() {
        let store = StatusStore::new();
        store.replace_batch(batch(2));
        store.patch(0, ItemPatch::started());
        store.patch(0, ItemPatch::failed("boom"));
        store.patch(1, ItemPatch::started());
        store.patch(1, ItemPatch::completed(ArtifactRef("r".into())));
        store.mark_inactive();

        // Non-terminal and unknown items are not resettable.
        assert!(store.reset_item(42).is_none());

        let outcome = store.reset_item(0).unwrap();
        assert!(outcome.reactivated);
        assert!(store.is_active());

        let item = store.get(0).unwrap();
        assert_eq!(item.status, RequestStatus::Pending);
        assert!(item.error.is_none());
        assert!(item.result.is_none());
        assert!(item.progress_message.is_none());

        // Sibling untouched.
        assert_eq!(store.get(1).unwrap().status, RequestStatus::Complete);

        // Resetting while the batch is already active does not report a
        // reactivation.
        store.patch(0, ItemPatch::started());
        store.patch(0, ItemPatch::failed("again"));
        let outcome = store.reset_item(0).unwrap();
        assert!(!outcome.reactivated);
    }

    #[test]
    fn test_next_pending_respects_sequence_order() {
        let store = StatusStore::new();
        store.replace_batch(batch(3));
        store.patch(0, ItemPatch::started());
        assert_eq!(store.next_pending().unwrap().id, 1);
    }

    #[test]
    fn test_has_blocking_video() {
        let store = StatusStore::new();
        let mut items = batch(1);
        items.push(RequestItem::new(
            10,
            RequestDescriptor::video("a banana surfing".into(), Default::default(), None),
        ));
        store.replace_batch(items);
        assert!(store.has_blocking_video());

        store.patch(10, ItemPatch::started());
        assert!(store.has_blocking_video());

        store.patch(10, ItemPatch::completed(ArtifactRef("uri".into())));
        assert!(!store.has_blocking_video());
    }

    #[test]
    fn test_snapshot_reports_finished_and_total() {
        let store = StatusStore::new();
        store.replace_batch(batch(2));
        store.patch(0, ItemPatch::started());
        store.patch(0, ItemPatch::completed(ArtifactRef("r".into())));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.finished, 1);
        assert!(snapshot.active);
    }
}
