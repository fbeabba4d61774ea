//! Admission-control loop for generation request batches.
//!
//! The scheduler drains pending items from the status store in batch
//! sequence order, dispatches them to the generation client under the
//! effective concurrency ceiling, and reconciles resolutions as they
//! arrive. All state transitions happen inside a single-owner loop task
//! fed by messages, so no two scheduling passes ever interleave; only the
//! outstanding client calls run concurrently.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gen_api::{CredentialGate, GenerationClient, GenerationError, ProgressFn};
use requests::{
    ArtifactRef, IdGen, ImageLibrary, ItemPatch, RequestDescriptor, RequestItem, RequestKind,
    StatusStore,
};

/// Failure message recorded on items force-terminated by a cancel.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user.";

/// Failure message recorded when a referenced source image is gone at
/// dispatch time.
pub const MISSING_SOURCE_MESSAGE: &str = "Missing source image.";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler stopped")]
    Stopped,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Concurrency ceiling for image items while no video item is in a
    /// non-terminal state. Video items are always exclusive.
    pub image_concurrency: usize,
}

impl SchedulerConfig {
    pub fn with_image_concurrency(mut self, limit: usize) -> Self {
        self.image_concurrency = limit.max(1);
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            image_concurrency: 2,
        }
    }
}

/// Notifications emitted by the loop for observers.
///
/// Advisory only; the status store snapshot is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    BatchStarted { total: usize },
    ItemStarted { id: u64 },
    ItemProgress { id: u64, message: String },
    ItemCompleted { id: u64 },
    ItemFailed { id: u64, error: String },
    AuthRequired,
    BatchCancelled,
    BatchFinished,
}

#[derive(Debug)]
enum DispatchError {
    Generation(GenerationError),
    MissingSource,
}

impl DispatchError {
    fn message(&self) -> String {
        match self {
            Self::Generation(GenerationError::Cancelled) => CANCELLED_MESSAGE.to_string(),
            Self::Generation(error) => error.to_string(),
            Self::MissingSource => MISSING_SOURCE_MESSAGE.to_string(),
        }
    }

    fn is_auth(&self) -> bool {
        matches!(self, Self::Generation(error) if error.is_auth())
    }
}

#[derive(Debug)]
enum SchedulerMsg {
    Submit(Vec<RequestDescriptor>),
    Cancel,
    Retry(u64),
    OpFinished {
        epoch: u64,
        id: u64,
        outcome: Result<ArtifactRef, DispatchError>,
    },
    Progress {
        epoch: u64,
        id: u64,
        message: String,
    },
}

/// Cloneable control surface over a running scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: UnboundedSender<SchedulerMsg>,
    store: Arc<StatusStore>,
    credentials: CredentialGate,
}

impl SchedulerHandle {
    /// Replaces the current batch with a freshly built one and starts
    /// dispatching. Descriptors are assumed to be builder-validated.
    pub fn submit(&self, batch: Vec<RequestDescriptor>) -> Result<(), SchedulerError> {
        self.tx
            .send(SchedulerMsg::Submit(batch))
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Cooperatively cancels the current batch: every in-flight call is
    /// signalled, every non-terminal item is force-failed.
    pub fn cancel(&self) -> Result<(), SchedulerError> {
        self.tx
            .send(SchedulerMsg::Cancel)
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Resets one terminal item back to pending and resumes scheduling.
    pub fn retry(&self, id: u64) -> Result<(), SchedulerError> {
        self.tx
            .send(SchedulerMsg::Retry(id))
            .map_err(|_| SchedulerError::Stopped)
    }

    /// The status store this scheduler writes; read it for projections.
    pub fn store(&self) -> Arc<StatusStore> {
        self.store.clone()
    }

    /// Shared credential flag, cleared on authorization failures.
    pub fn credentials(&self) -> &CredentialGate {
        &self.credentials
    }
}

/// Spawns the scheduling loop.
pub struct Scheduler;

impl Scheduler {
    pub fn start(
        client: Arc<dyn GenerationClient>,
        library: Arc<ImageLibrary>,
        config: SchedulerConfig,
    ) -> (SchedulerHandle, UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store = Arc::new(StatusStore::new());
        let credentials = CredentialGate::new();

        let scheduler_loop = SchedulerLoop {
            store: store.clone(),
            library,
            client,
            config,
            credentials: credentials.clone(),
            ids: IdGen::new(),
            tx: tx.clone(),
            events: events_tx,
            active: 0,
            epoch: 0,
            cancel: CancellationToken::new(),
        };
        tokio::spawn(scheduler_loop.run(rx));

        (
            SchedulerHandle {
                tx,
                store,
                credentials,
            },
            events_rx,
        )
    }
}

struct SchedulerLoop {
    store: Arc<StatusStore>,
    library: Arc<ImageLibrary>,
    client: Arc<dyn GenerationClient>,
    config: SchedulerConfig,
    credentials: CredentialGate,
    ids: IdGen,
    tx: UnboundedSender<SchedulerMsg>,
    events: UnboundedSender<SchedulerEvent>,

    /// Operations currently in flight for the current epoch. Incremented
    /// exactly once per dispatch, decremented exactly once per
    /// matching-epoch resolution.
    active: usize,

    /// Stamp of the current batch. Resolutions carrying an older stamp are
    /// discarded without touching the store or the counter.
    epoch: u64,

    /// Cancellation context shared by every dispatch of the current batch;
    /// replaced wholesale, never cancelled per item.
    cancel: CancellationToken,
}

impl SchedulerLoop {
    async fn run(mut self, mut rx: UnboundedReceiver<SchedulerMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
        }
    }

    fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Submit(batch) => self.handle_submit(batch),
            SchedulerMsg::Cancel => self.handle_cancel(),
            SchedulerMsg::Retry(id) => self.handle_retry(id),
            SchedulerMsg::OpFinished { epoch, id, outcome } => {
                self.handle_finished(epoch, id, outcome)
            }
            SchedulerMsg::Progress { epoch, id, message } => {
                self.handle_progress(epoch, id, message)
            }
        }
    }

    fn handle_submit(&mut self, batch: Vec<RequestDescriptor>) {
        // The old batch's context is discarded, not cancelled; its late
        // resolutions fail the epoch check and are ignored.
        self.epoch += 1;
        self.active = 0;
        self.cancel = CancellationToken::new();

        let items: Vec<RequestItem> = batch
            .into_iter()
            .map(|descriptor| RequestItem::new(self.ids.next_id(), descriptor))
            .collect();
        let total = items.len();
        debug!(total, epoch = self.epoch, "installing new batch");
        self.store.replace_batch(items);
        self.emit(SchedulerEvent::BatchStarted { total });
        self.run_pass();
    }

    fn handle_cancel(&mut self) {
        if !self.store.is_active() {
            return;
        }
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.epoch += 1;
        self.active = 0;

        for item in self.store.snapshot().items {
            if !item.is_terminal() {
                self.store.patch(item.id, ItemPatch::failed(CANCELLED_MESSAGE));
                self.emit(SchedulerEvent::ItemFailed {
                    id: item.id,
                    error: CANCELLED_MESSAGE.to_string(),
                });
            }
        }
        self.store.mark_inactive();
        debug!(epoch = self.epoch, "batch cancelled");
        self.emit(SchedulerEvent::BatchCancelled);
    }

    fn handle_retry(&mut self, id: u64) {
        match self.store.reset_item(id) {
            Some(outcome) => {
                if outcome.reactivated {
                    // Nothing is in flight for the current epoch when the
                    // batch is inactive, so a fresh context is enough.
                    self.cancel = CancellationToken::new();
                    debug!(id, "batch reactivated for retry");
                }
                self.run_pass();
            }
            None => debug!(id, "retry ignored for unknown or non-terminal item"),
        }
    }

    fn handle_finished(&mut self, epoch: u64, id: u64, outcome: Result<ArtifactRef, DispatchError>) {
        if epoch != self.epoch {
            debug!(id, epoch, "discarding resolution from a superseded batch");
            return;
        }
        self.active = self.active.saturating_sub(1);

        match outcome {
            Ok(artifact) => {
                self.store.patch(id, ItemPatch::completed(artifact));
                self.emit(SchedulerEvent::ItemCompleted { id });
            }
            Err(error) => {
                if error.is_auth() {
                    // Only signalled here; re-authorization is handled by
                    // whoever owns the credentials.
                    self.credentials.revoke();
                    self.emit(SchedulerEvent::AuthRequired);
                }
                let message = error.message();
                warn!(id, %message, "generation request failed");
                self.store.patch(id, ItemPatch::failed(message.clone()));
                self.emit(SchedulerEvent::ItemFailed { id, error: message });
            }
        }
        self.run_pass();
    }

    fn handle_progress(&mut self, epoch: u64, id: u64, message: String) {
        if epoch != self.epoch {
            return;
        }
        self.store.patch(id, ItemPatch::progress(message.clone()));
        self.emit(SchedulerEvent::ItemProgress { id, message });
    }

    /// One scheduling pass: start pending items in sequence order until the
    /// effective ceiling is reached, then settle batch completion.
    fn run_pass(&mut self) {
        if !self.store.is_active() {
            return;
        }
        loop {
            if self.active >= self.effective_limit() {
                break;
            }
            let Some(item) = self.store.next_pending() else {
                break;
            };
            self.dispatch(item);
        }
        if self.active == 0 && self.store.all_terminal() {
            self.store.mark_inactive();
            debug!("batch finished");
            self.emit(SchedulerEvent::BatchFinished);
        }
    }

    /// 1 while any video item is in a non-terminal state — video work is
    /// exclusive with respect to the whole queue — otherwise the image
    /// ceiling.
    fn effective_limit(&self) -> usize {
        if self.store.has_blocking_video() {
            1
        } else {
            self.config.image_concurrency
        }
    }

    fn dispatch(&mut self, item: RequestItem) {
        self.store.patch(item.id, ItemPatch::started());
        self.active += 1;
        self.emit(SchedulerEvent::ItemStarted { id: item.id });
        debug!(id = item.id, kind = %item.kind, "dispatching request");

        let epoch = self.epoch;
        let id = item.id;
        let source = item
            .source_image_id
            .and_then(|image_id| self.library.get(image_id));

        // A dangling image reference is resolved through the normal path so
        // the counter stays balanced: one increment, one decrement.
        if item.source_image_id.is_some() && source.is_none() {
            let _ = self.tx.send(SchedulerMsg::OpFinished {
                epoch,
                id,
                outcome: Err(DispatchError::MissingSource),
            });
            return;
        }

        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        match item.kind {
            RequestKind::Image => {
                let prompt = item.prompt;
                let image = match source {
                    Some(image) => image,
                    None => {
                        let _ = tx.send(SchedulerMsg::OpFinished {
                            epoch,
                            id,
                            outcome: Err(DispatchError::MissingSource),
                        });
                        return;
                    }
                };
                tokio::spawn(async move {
                    let outcome = client
                        .edit_image(&image, &prompt, cancel)
                        .await
                        .map_err(DispatchError::Generation);
                    let _ = tx.send(SchedulerMsg::OpFinished { epoch, id, outcome });
                });
            }
            RequestKind::Video => {
                let prompt = item.prompt;
                let aspect_ratio = item.aspect_ratio.unwrap_or_default();
                let progress_tx = tx.clone();
                let on_progress: ProgressFn = Arc::new(move |message: String| {
                    let _ = progress_tx.send(SchedulerMsg::Progress { epoch, id, message });
                });
                tokio::spawn(async move {
                    let outcome = client
                        .generate_video(&prompt, aspect_ratio, cancel, on_progress, source.as_ref())
                        .await
                        .map_err(DispatchError::Generation);
                    let _ = tx.send(SchedulerMsg::OpFinished { epoch, id, outcome });
                });
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use requests::{AspectRatio, RequestStatus, UploadedImage};

    struct MockCall {
        kind: RequestKind,
        prompt: String,
        tx: Option<oneshot::Sender<gen_api::Result<ArtifactRef>>>,
        progress: Option<ProgressFn>,
    }

    /// Generation client whose calls park until the test resolves them.
    struct MockClient {
        calls: Mutex<Vec<MockCall>>,
    }

    impl MockClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn call_kind(&self, index: usize) -> RequestKind {
            self.calls.lock()[index].kind
        }

        fn call_prompt(&self, index: usize) -> String {
            self.calls.lock()[index].prompt.clone()
        }

        fn resolve(&self, index: usize, result: gen_api::Result<ArtifactRef>) {
            let tx = self.calls.lock()[index]
                .tx
                .take()
                .expect("call already resolved");
            let _ = tx.send(result);
        }

        fn emit_progress(&self, index: usize, message: &str) {
            let progress = self.calls.lock()[index]
                .progress
                .clone()
                .expect("not a video call");
            progress(message.to_string());
        }

        async fn wait_for_calls(&self, n: usize) {
            timeout(Duration::from_secs(5), async {
                while self.call_count() < n {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
            .await
            .expect("timed out waiting for generation calls");
        }
    }

    #[async_trait]
    impl GenerationClient for MockClient {
        fn name(&self) -> &str {
            "mock"
        }

        async fn edit_image(
            &self,
            _image: &UploadedImage,
            prompt: &str,
            cancel: CancellationToken,
        ) -> gen_api::Result<ArtifactRef> {
            let (tx, rx) = oneshot::channel();
            self.calls.lock().push(MockCall {
                kind: RequestKind::Image,
                prompt: prompt.to_string(),
                tx: Some(tx),
                progress: None,
            });
            tokio::select! {
                _ = cancel.cancelled() => Err(GenerationError::Cancelled),
                result = rx => result.unwrap_or(Err(GenerationError::Cancelled)),
            }
        }

        async fn generate_video(
            &self,
            prompt: &str,
            _aspect_ratio: AspectRatio,
            cancel: CancellationToken,
            on_progress: ProgressFn,
            _reference_image: Option<&UploadedImage>,
        ) -> gen_api::Result<ArtifactRef> {
            let (tx, rx) = oneshot::channel();
            self.calls.lock().push(MockCall {
                kind: RequestKind::Video,
                prompt: prompt.to_string(),
                tx: Some(tx),
                progress: Some(on_progress),
            });
            tokio::select! {
                _ = cancel.cancelled() => Err(GenerationError::Cancelled),
                result = rx => result.unwrap_or(Err(GenerationError::Cancelled)),
            }
        }
    }

    struct Fixture {
        handle: SchedulerHandle,
        events: UnboundedReceiver<SchedulerEvent>,
        client: Arc<MockClient>,
        library: Arc<ImageLibrary>,
    }

    fn fixture(image_concurrency: usize) -> Fixture {
        let client = MockClient::new();
        let library = Arc::new(ImageLibrary::new());
        let generation_client: Arc<dyn GenerationClient> = client.clone();
        let (handle, events) = Scheduler::start(
            generation_client,
            library.clone(),
            SchedulerConfig::default().with_image_concurrency(image_concurrency),
        );
        Fixture {
            handle,
            events,
            client,
            library,
        }
    }

    fn upload(library: &ImageLibrary, n: usize) -> Vec<u64> {
        (0..n)
            .map(|i| library.add(format!("img{i}.png"), "image/png", "QQ=="))
            .collect()
    }

    fn artifact(tag: &str) -> ArtifactRef {
        ArtifactRef(format!("data:image/png;base64,{tag}"))
    }

    async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting until {description}"));
    }

    /// Gives a buggy scheduler the chance to do more than it should before
    /// the test asserts it did not.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    async fn drain_until(
        events: &mut UnboundedReceiver<SchedulerEvent>,
        mut predicate: impl FnMut(&SchedulerEvent) -> bool,
    ) -> Vec<SchedulerEvent> {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                let done = predicate(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("timed out draining events");
        seen
    }

    #[tokio::test]
    async fn test_image_batch_respects_concurrency_ceiling() {
        let mut fx = fixture(2);
        let ids = upload(&fx.library, 5);
        let batch = ids
            .iter()
            .map(|&id| RequestDescriptor::image_edit(id, format!("edit {id}")))
            .collect();
        fx.handle.submit(batch).unwrap();

        fx.client.wait_for_calls(2).await;
        settle().await;
        let store = fx.handle.store();
        let counts = store.counts();
        assert_eq!(counts.in_progress, 2);
        assert_eq!(counts.pending, 3);
        assert_eq!(fx.client.call_count(), 2);

        // Completion order is independent of dispatch order: resolve the
        // second call first.
        fx.client.resolve(1, Ok(artifact("b")));
        fx.client.wait_for_calls(3).await;
        settle().await;
        let counts = store.counts();
        assert_eq!(counts.complete, 1);
        assert_eq!(counts.in_progress, 2);
        assert_eq!(counts.pending, 2);

        fx.client.resolve(0, Ok(artifact("a")));
        fx.client.resolve(2, Ok(artifact("c")));
        fx.client.wait_for_calls(5).await;
        fx.client.resolve(3, Ok(artifact("d")));
        fx.client.resolve(4, Ok(artifact("e")));

        wait_until("all items complete and batch inactive", || {
            store.counts().complete == 5 && !store.is_active()
        })
        .await;

        let events =
            drain_until(&mut fx.events, |event| matches!(event, SchedulerEvent::BatchFinished))
                .await;
        assert!(matches!(
            events.first(),
            Some(SchedulerEvent::BatchStarted { total: 5 })
        ));
    }

    #[tokio::test]
    async fn test_video_is_globally_exclusive() {
        let fx = fixture(2);
        let ids = upload(&fx.library, 2);
        let batch = vec![
            RequestDescriptor::video("a banana surfing".into(), AspectRatio::Landscape, None),
            RequestDescriptor::image_edit(ids[0], "edit a".into()),
            RequestDescriptor::image_edit(ids[1], "edit b".into()),
        ];
        fx.handle.submit(batch).unwrap();

        fx.client.wait_for_calls(1).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 1);
        assert_eq!(fx.client.call_kind(0), RequestKind::Video);
        let store = fx.handle.store();
        let counts = store.counts();
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending, 2);

        // Once the video reaches a terminal state, image dispatch widens to
        // the configured ceiling.
        fx.client.resolve(0, Ok(ArtifactRef("https://example.com/v.mp4".into())));
        fx.client.wait_for_calls(3).await;
        settle().await;
        assert_eq!(store.counts().in_progress, 2);

        fx.client.resolve(1, Ok(artifact("a")));
        fx.client.resolve(2, Ok(artifact("b")));
        wait_until("batch finished", || !store.is_active()).await;
        assert_eq!(store.counts().complete, 3);
    }

    #[tokio::test]
    async fn test_pending_video_collapses_image_ceiling() {
        let fx = fixture(2);
        let ids = upload(&fx.library, 2);
        let batch = vec![
            RequestDescriptor::image_edit(ids[0], "edit a".into()),
            RequestDescriptor::image_edit(ids[1], "edit b".into()),
            RequestDescriptor::video("finale".into(), AspectRatio::Portrait, None),
        ];
        fx.handle.submit(batch).unwrap();

        // A pending video anywhere in the batch caps everything at 1.
        fx.client.wait_for_calls(1).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 1);
        assert_eq!(fx.client.call_kind(0), RequestKind::Image);

        fx.client.resolve(0, Ok(artifact("a")));
        fx.client.wait_for_calls(2).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 2);
        assert_eq!(fx.client.call_kind(1), RequestKind::Image);

        fx.client.resolve(1, Ok(artifact("b")));
        fx.client.wait_for_calls(3).await;
        assert_eq!(fx.client.call_kind(2), RequestKind::Video);

        fx.client
            .resolve(2, Ok(ArtifactRef("https://example.com/v.mp4".into())));
        let store = fx.handle.store();
        wait_until("batch finished", || !store.is_active()).await;
        assert_eq!(store.counts().complete, 3);
    }

    #[tokio::test]
    async fn test_cancel_fails_non_terminal_items_and_ignores_late_resolutions() {
        let fx = fixture(2);
        let ids = upload(&fx.library, 5);
        let batch = ids
            .iter()
            .map(|&id| RequestDescriptor::image_edit(id, format!("edit {id}")))
            .collect();
        fx.handle.submit(batch).unwrap();

        fx.client.wait_for_calls(2).await;
        fx.client.resolve(0, Ok(artifact("a")));
        fx.client.wait_for_calls(3).await;

        // 1 complete, 2 in flight, 2 pending.
        let store = fx.handle.store();
        wait_until("one complete, two in flight", || {
            let counts = store.counts();
            counts.complete == 1 && counts.in_progress == 2 && counts.pending == 2
        })
        .await;

        fx.handle.cancel().unwrap();
        wait_until("batch inactive", || !store.is_active()).await;
        let counts = store.counts();
        assert_eq!(counts.complete, 1);
        assert_eq!(counts.failed, 4);
        for item in store.snapshot().items {
            if item.status == RequestStatus::Failed {
                assert_eq!(item.error.as_deref(), Some(CANCELLED_MESSAGE));
            }
        }

        // Resolutions of the calls that were in flight when the batch was
        // cancelled must not mutate the store.
        fx.client.resolve(1, Ok(artifact("late-b")));
        fx.client.resolve(2, Ok(artifact("late-c")));
        settle().await;
        let counts = store.counts();
        assert_eq!(counts.complete, 1);
        assert_eq!(counts.failed, 4);
        assert!(!store.is_active());
    }

    #[tokio::test]
    async fn test_retry_resets_only_that_item_and_reactivates() {
        let fx = fixture(2);
        let ids = upload(&fx.library, 2);
        let batch = ids
            .iter()
            .map(|&id| RequestDescriptor::image_edit(id, format!("edit {id}")))
            .collect();
        fx.handle.submit(batch).unwrap();

        fx.client.wait_for_calls(2).await;
        fx.client
            .resolve(0, Err(GenerationError::Api("model exploded".into())));
        fx.client.resolve(1, Ok(artifact("b")));

        let store = fx.handle.store();
        wait_until("batch settled with one failure", || {
            !store.is_active() && store.all_terminal()
        })
        .await;
        let failed = store
            .snapshot()
            .items
            .into_iter()
            .find(|item| item.status == RequestStatus::Failed)
            .unwrap();
        assert!(failed.error.as_deref().unwrap().contains("model exploded"));

        fx.handle.retry(failed.id).unwrap();
        fx.client.wait_for_calls(3).await;
        assert!(store.is_active());
        assert_eq!(store.get(failed.id).unwrap().status, RequestStatus::InProgress);
        // Sibling untouched by the retry.
        let counts = store.counts();
        assert_eq!(counts.complete, 1);

        fx.client.resolve(2, Ok(artifact("a2")));
        wait_until("retried item completed", || {
            store.counts().complete == 2 && !store.is_active()
        })
        .await;
    }

    #[tokio::test]
    async fn test_auth_failure_revokes_credentials_and_signals() {
        let mut fx = fixture(2);
        let ids = upload(&fx.library, 2);
        let batch = ids
            .iter()
            .map(|&id| RequestDescriptor::image_edit(id, format!("edit {id}")))
            .collect();
        fx.handle.submit(batch).unwrap();

        fx.client.wait_for_calls(2).await;
        assert!(fx.handle.credentials().has_credentials());

        fx.client
            .resolve(0, Err(GenerationError::Auth("API key not valid".into())));
        let store = fx.handle.store();
        wait_until("auth failure recorded", || store.counts().failed == 1).await;
        assert!(!fx.handle.credentials().has_credentials());
        let events =
            drain_until(&mut fx.events, |event| matches!(event, SchedulerEvent::AuthRequired))
                .await;
        assert!(events
            .iter()
            .any(|event| matches!(event, SchedulerEvent::AuthRequired)));

        // The sibling already in flight is unaffected and runs to
        // completion.
        assert_eq!(store.counts().in_progress, 1);
        fx.client.resolve(1, Ok(artifact("b")));
        wait_until("sibling completed", || {
            store.counts().complete == 1 && !store.is_active()
        })
        .await;
        assert_eq!(store.counts().failed, 1);
    }

    #[tokio::test]
    async fn test_missing_source_image_fails_item_without_dispatch() {
        let fx = fixture(2);
        let ids = upload(&fx.library, 1);
        let batch = vec![
            RequestDescriptor::image_edit(ids[0], "edit a".into()),
            RequestDescriptor::image_edit(9999, "edit ghost".into()),
        ];
        fx.handle.submit(batch).unwrap();

        let store = fx.handle.store();
        wait_until("dangling reference failed", || store.counts().failed == 1).await;
        let failed = store
            .snapshot()
            .items
            .into_iter()
            .find(|item| item.status == RequestStatus::Failed)
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some(MISSING_SOURCE_MESSAGE));

        // Only the valid item ever reached the client.
        fx.client.wait_for_calls(1).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 1);
        assert_eq!(fx.client.call_prompt(0), "edit a");

        fx.client.resolve(0, Ok(artifact("a")));
        wait_until("batch finished", || !store.is_active()).await;
        let counts = store.counts();
        assert_eq!(counts.complete, 1);
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn test_new_batch_discards_stale_resolutions() {
        let fx = fixture(2);
        let ids = upload(&fx.library, 1);
        fx.handle
            .submit(vec![RequestDescriptor::image_edit(ids[0], "first".into())])
            .unwrap();
        fx.client.wait_for_calls(1).await;

        fx.handle
            .submit(vec![RequestDescriptor::image_edit(ids[0], "second".into())])
            .unwrap();
        fx.client.wait_for_calls(2).await;

        // The first batch's call resolves after it was superseded; nothing
        // in the new batch may change.
        fx.client.resolve(0, Ok(artifact("stale")));
        settle().await;
        let store = fx.handle.store();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].prompt, "second");
        assert_eq!(snapshot.items[0].status, RequestStatus::InProgress);
        assert!(snapshot.items[0].result.is_none());

        fx.client.resolve(1, Ok(artifact("fresh")));
        wait_until("second batch completed", || {
            store.counts().complete == 1 && !store.is_active()
        })
        .await;
    }

    #[tokio::test]
    async fn test_video_progress_updates_item() {
        let mut fx = fixture(2);
        fx.handle
            .submit(vec![RequestDescriptor::video(
                "a banana in space".into(),
                AspectRatio::Landscape,
                None,
            )])
            .unwrap();
        fx.client.wait_for_calls(1).await;

        fx.client.emit_progress(0, "Rendering frames...");
        let store = fx.handle.store();
        wait_until("progress recorded", || {
            store
                .snapshot()
                .items
                .first()
                .and_then(|item| item.progress_message.clone())
                .is_some()
        })
        .await;
        let item = store.snapshot().items.remove(0);
        assert_eq!(item.progress_message.as_deref(), Some("Rendering frames..."));
        assert_eq!(item.status, RequestStatus::InProgress);

        let events = drain_until(&mut fx.events, |event| {
            matches!(event, SchedulerEvent::ItemProgress { .. })
        })
        .await;
        assert!(events
            .iter()
            .any(|event| matches!(event, SchedulerEvent::ItemProgress { .. })));

        fx.client
            .resolve(0, Ok(ArtifactRef("https://example.com/v.mp4".into())));
        wait_until("video completed", || !store.is_active()).await;
        assert_eq!(store.counts().complete, 1);
    }

    #[tokio::test]
    async fn test_cancel_without_active_batch_is_noop() {
        let fx = fixture(2);
        fx.handle.cancel().unwrap();
        settle().await;
        assert!(!fx.handle.store().is_active());
        assert!(fx.handle.store().is_empty());
    }
}
