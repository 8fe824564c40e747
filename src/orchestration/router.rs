// Request router and the worker that hosts the pipeline
//
// Callers submit detection requests here. Each in-flight request owns one
// entry in the pending map, keyed by its `RequestId`; the entry records where
// the eventual `detectionResults` must go. The worker is spawned lazily on the
// first request and respawned if it has died. Completion messages flow back
// through `complete()`, which delivers and removes the entry exactly once.
// Every queued request carries a `DispatchTicket`; if the command is lost
// (worker aborted, request task cancelled) the ticket answers the caller
// with a failure instead of leaving the entry orphaned.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::pipeline::PipelineOrchestrator;
use crate::core::errors::{RouterError, RouterResult};
use crate::core::types::{DetectionRequest, DetectionResults, RawImage, RequestId, Settings};

/// What the worker runs for each request
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    async fn process(&self, request: DetectionRequest) -> DetectionResults;
}

#[async_trait]
impl DetectionBackend for PipelineOrchestrator {
    async fn process(&self, request: DetectionRequest) -> DetectionResults {
        self.run(&request)
            .await
            .into_results_async(request.request_id.clone())
            .await
    }
}

/// Identity of a cross-boundary caller (a tab and frame in the page world)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub tab_id: i64,
    pub frame_id: i64,
}

/// Result routed back to a remote caller together with its own tag
#[derive(Debug, Clone)]
pub struct RemoteReply {
    pub origin: Origin,
    pub tag: String,
    pub results: DetectionResults,
}

/// Where a request's results go
#[derive(Debug)]
pub enum PendingEntry {
    /// Same-process caller awaiting the reply
    Direct(oneshot::Sender<DetectionResults>),
    /// Caller on the other side of a message boundary
    Remote {
        origin: Origin,
        tag: String,
        sink: mpsc::UnboundedSender<RemoteReply>,
    },
}

struct PendingSlot {
    generation: u64,
    entry: PendingEntry,
}

/// Commands understood by the worker
#[derive(Debug)]
enum WorkerCommand {
    Detect {
        ticket: DispatchTicket,
        image: RawImage,
        settings: Option<Settings>,
    },
    UpdateSettings(Settings),
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    task: JoinHandle<()>,
    started: u64,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.tx.is_closed()
    }
}

struct RouterInner {
    pending: Mutex<HashMap<RequestId, PendingSlot>>,
    generation: AtomicU64,
    worker: Mutex<Option<WorkerHandle>>,
    workers_started: AtomicU64,
    backend: Arc<dyn DetectionBackend>,
    /// Settings for requests that carry none; written only by the worker
    settings: Arc<RwLock<Settings>>,
}

/// Removes its pending entry on drop unless `complete()` already did
struct PendingGuard {
    router: Weak<RouterInner>,
    request_id: RequestId,
    generation: u64,
    armed: bool,
}

impl PendingGuard {
    /// Leave the entry for `complete()` to remove
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        let mut pending = inner.pending.lock();
        if pending
            .get(&self.request_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            pending.remove(&self.request_id);
            debug!("[{}] Pending entry released without a result", self.request_id);
        }
    }
}

/// Owned by a request from the moment it is queued until its results are delivered
#[derive(Debug)]
struct DispatchTicket {
    router: Weak<RouterInner>,
    request_id: RequestId,
    generation: u64,
    armed: bool,
}

impl DispatchTicket {
    fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    fn deliver(mut self, results: DetectionResults) {
        self.armed = false;
        if let Some(inner) = self.router.upgrade() {
            RequestRouter { inner }.resolve(results, Some(self.generation));
        }
    }

    /// The command never left the router; the caller sees the forward error instead
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DispatchTicket {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        warn!("[{}] Request lost before completion", self.request_id);
        let results = DetectionResults::failure(
            self.request_id.clone(),
            "worker stopped before the request completed",
        );
        RequestRouter { inner }.resolve(results, Some(self.generation));
    }
}

#[derive(Clone)]
pub struct RequestRouter {
    inner: Arc<RouterInner>,
}

impl RequestRouter {
    pub fn new(backend: Arc<dyn DetectionBackend>, default_settings: Settings) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                worker: Mutex::new(None),
                workers_started: AtomicU64::new(0),
                backend,
                settings: Arc::new(RwLock::new(default_settings)),
            }),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.inner.pending.lock().contains_key(request_id)
    }

    pub fn worker_alive(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(WorkerHandle::is_alive)
    }

    /// Number of workers spawned so far, restarts included
    pub fn workers_started(&self) -> u64 {
        self.inner.workers_started.load(Ordering::Relaxed)
    }

    pub fn current_settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }

    fn register(
        &self,
        request_id: RequestId,
        entry: PendingEntry,
    ) -> RouterResult<(PendingGuard, DispatchTicket)> {
        let mut pending = self.inner.pending.lock();
        if pending.contains_key(&request_id) {
            return Err(RouterError::DuplicateRequestId(request_id.to_string()));
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        pending.insert(request_id.clone(), PendingSlot { generation, entry });
        trace!("[{}] Registered ({} in flight)", request_id, pending.len());

        let ticket = DispatchTicket {
            router: Arc::downgrade(&self.inner),
            request_id: request_id.clone(),
            generation,
            armed: true,
        };
        let guard = PendingGuard {
            router: Arc::downgrade(&self.inner),
            request_id,
            generation,
            armed: true,
        };
        Ok((guard, ticket))
    }

    /// Return a live worker, spawning one if there is none or the last one died
    fn ensure_worker(&self) -> mpsc::UnboundedSender<WorkerCommand> {
        let mut worker = self.inner.worker.lock();

        if let Some(handle) = worker.as_ref() {
            if handle.is_alive() {
                return handle.tx.clone();
            }
            warn!("Worker #{} is gone, starting a new one", handle.started);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let started = self.inner.workers_started.fetch_add(1, Ordering::Relaxed) + 1;
        let task = tokio::spawn(worker_loop(
            rx,
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.settings),
        ));
        info!("✓ Worker #{} started", started);

        *worker = Some(WorkerHandle {
            tx: tx.clone(),
            task,
            started,
        });
        tx
    }

    fn forward(&self, command: WorkerCommand) -> RouterResult<()> {
        self.ensure_worker().send(command).map_err(|returned| {
            if let WorkerCommand::Detect { ticket, .. } = returned.0 {
                ticket.disarm();
            }
            RouterError::WorkerUnavailable("worker channel closed".to_string())
        })
    }

    /// Submit a request and wait for its results
    pub async fn submit(
        &self,
        image: RawImage,
        request_id: Option<RequestId>,
        settings: Option<Settings>,
    ) -> RouterResult<DetectionResults> {
        let request_id = request_id.unwrap_or_else(RequestId::generate);
        let (tx, rx) = oneshot::channel();
        let (_guard, ticket) = self.register(request_id.clone(), PendingEntry::Direct(tx))?;

        self.forward(WorkerCommand::Detect {
            ticket,
            image,
            settings,
        })?;

        rx.await
            .map_err(|_| RouterError::ResponseDropped(request_id.to_string()))
    }

    /// Submit on behalf of a remote caller; results are pushed into `sink`
    pub fn submit_remote(
        &self,
        origin: Origin,
        tag: impl Into<String>,
        image: RawImage,
        request_id: Option<RequestId>,
        settings: Option<Settings>,
        sink: mpsc::UnboundedSender<RemoteReply>,
    ) -> RouterResult<RequestId> {
        let request_id = request_id.unwrap_or_else(RequestId::generate);
        let (guard, ticket) = self.register(
            request_id.clone(),
            PendingEntry::Remote {
                origin,
                tag: tag.into(),
                sink,
            },
        )?;

        self.forward(WorkerCommand::Detect {
            ticket,
            image,
            settings,
        })?;

        guard.disarm();
        Ok(request_id)
    }

    /// Replace the settings used by later requests that carry none
    pub fn update_settings(&self, settings: Settings) -> RouterResult<()> {
        self.forward(WorkerCommand::UpdateSettings(settings))
    }

    /// Route a completion message to its caller. Unknown ids are logged and dropped.
    pub fn complete(&self, results: DetectionResults) -> bool {
        self.resolve(results, None)
    }

    /// Deliver `results` and remove the entry; with a generation, only the
    /// entry registered under it is eligible
    fn resolve(&self, results: DetectionResults, generation: Option<u64>) -> bool {
        let slot = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&results.request_id) {
                Some(slot) if generation.map_or(true, |g| g == slot.generation) => {
                    pending.remove(&results.request_id)
                }
                _ => None,
            }
        };
        let Some(slot) = slot else {
            if generation.is_some() {
                debug!("[{}] Caller already gone, dropping results", results.request_id);
            } else {
                warn!(
                    "No pending request for '{}', dropping results",
                    results.request_id
                );
            }
            return false;
        };

        let request_id = results.request_id.clone();
        match slot.entry {
            PendingEntry::Direct(tx) => {
                if tx.send(results).is_err() {
                    debug!("[{}] Caller went away before results arrived", request_id);
                }
            }
            PendingEntry::Remote { origin, tag, sink } => {
                let reply = RemoteReply {
                    origin,
                    tag,
                    results,
                };
                if sink.send(reply).is_err() {
                    debug!("[{}] Remote sink closed before results arrived", request_id);
                }
            }
        }
        trace!("[{}] Delivered", request_id);
        true
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
    backend: Arc<dyn DetectionBackend>,
    settings: Arc<RwLock<Settings>>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WorkerCommand::UpdateSettings(next) => {
                info!(
                    "Settings updated (ocr: {}, translation: {}, {} → {})",
                    next.ocr_provider.as_str(),
                    next.translation_provider.as_str(),
                    next.source_language,
                    next.target_language
                );
                *settings.write() = next;
            }
            WorkerCommand::Detect {
                ticket,
                image,
                settings: carried,
            } => {
                let snapshot = Arc::new(carried.unwrap_or_else(|| settings.read().clone()));
                let request = DetectionRequest {
                    image,
                    request_id: ticket.request_id().clone(),
                    settings: snapshot,
                };
                let backend = Arc::clone(&backend);

                tokio::spawn(async move {
                    let run = tokio::spawn(async move { backend.process(request).await });
                    let results = match run.await {
                        Ok(results) => results,
                        Err(e) => {
                            let request_id = ticket.request_id().clone();
                            warn!("[{}] Request task failed: {}", request_id, e);
                            DetectionResults::failure(request_id, format!("request task failed: {}", e))
                        }
                    };
                    ticket.deliver(results);
                });
            }
        }
    }
    debug!("Worker channel closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BoundingBox, Detection};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Echoes the target language of the settings snapshot as detection text
    struct EchoBackend {
        gate: Option<Arc<Semaphore>>,
        panic_on: Option<RequestId>,
    }

    #[async_trait]
    impl DetectionBackend for EchoBackend {
        async fn process(&self, request: DetectionRequest) -> DetectionResults {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if self.panic_on.as_ref() == Some(&request.request_id) {
                panic!("backend exploded");
            }
            let mut detection = Detection::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0), 0.9, 1);
            detection.recognized_text = request.settings.target_language.clone();
            DetectionResults::success(request.request_id, vec![detection.to_wire()])
        }
    }

    fn router_with(gate: Option<Arc<Semaphore>>) -> RequestRouter {
        RequestRouter::new(
            Arc::new(EchoBackend {
                gate,
                panic_on: None,
            }),
            Settings::default(),
        )
    }

    fn image() -> RawImage {
        RawImage::new(1, 1, vec![0, 0, 0, 255]).unwrap()
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_entry_is_removed_after_completion() {
        let router = router_with(None);
        assert!(!router.worker_alive());

        let results = router
            .submit(image(), Some(RequestId::new("img_1")), None)
            .await
            .unwrap();

        assert_eq!(results.request_id, RequestId::new("img_1"));
        assert_eq!(results.results.unwrap()[0].text, "en");
        assert_eq!(router.pending_count(), 0);
        assert!(router.worker_alive());
    }

    #[tokio::test]
    async fn test_second_completion_is_a_noop() {
        let router = router_with(None);
        let results = router.submit(image(), None, None).await.unwrap();

        assert!(!router.complete(results.clone()));
        assert!(!router.complete(results));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_is_rejected() {
        let gate = Arc::new(Semaphore::new(0));
        let router = router_with(Some(gate.clone()));

        let first = {
            let router = router.clone();
            tokio::spawn(async move { router.submit(image(), Some(RequestId::new("dup")), None).await })
        };
        wait_until(|| router.is_pending(&RequestId::new("dup"))).await;

        let second = router.submit(image(), Some(RequestId::new("dup")), None).await;
        assert!(matches!(second, Err(RouterError::DuplicateRequestId(_))));
        assert_eq!(router.pending_count(), 1);

        gate.add_permits(1);
        assert!(first.await.unwrap().is_ok());
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_releases_its_entry() {
        let gate = Arc::new(Semaphore::new(0));
        let router = router_with(Some(gate.clone()));

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            router.submit(image(), Some(RequestId::new("slow")), None),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(router.pending_count(), 0);

        // The late completion finds no entry and is dropped
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_settings_update_applies_to_later_requests() {
        let router = router_with(None);
        router
            .update_settings(Settings {
                target_language: "fr".to_string(),
                ..Settings::default()
            })
            .unwrap();

        let implicit = router.submit(image(), None, None).await.unwrap();
        assert_eq!(implicit.results.unwrap()[0].text, "fr");

        let carried = router
            .submit(
                image(),
                None,
                Some(Settings {
                    target_language: "de".to_string(),
                    ..Settings::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(carried.results.unwrap()[0].text, "de");
        assert_eq!(router.current_settings().target_language, "fr");
    }

    #[tokio::test]
    async fn test_dead_worker_is_restarted() {
        let router = router_with(None);
        router.submit(image(), None, None).await.unwrap();
        assert_eq!(router.workers_started(), 1);

        abort_worker(&router);
        wait_until(|| !router.worker_alive()).await;

        assert!(router.submit(image(), None, None).await.is_ok());
        assert_eq!(router.workers_started(), 2);
    }

    fn abort_worker(router: &RequestRouter) {
        if let Some(handle) = router.inner.worker.lock().as_ref() {
            handle.task.abort();
        }
    }

    #[tokio::test]
    async fn test_request_queued_on_aborted_worker_fails_instead_of_hanging() {
        let router = router_with(None);
        // Spawns the worker; it has not run yet when it is aborted
        router.update_settings(Settings::default()).unwrap();
        abort_worker(&router);

        let results = tokio::time::timeout(
            Duration::from_secs(1),
            router.submit(image(), Some(RequestId::new("queued")), None),
        )
        .await
        .expect("caller must not hang")
        .unwrap();

        assert_eq!(results.request_id, RequestId::new("queued"));
        assert!(results.results.is_none());
        assert!(results.error.is_some());
        assert_eq!(router.pending_count(), 0);

        // The next request gets a fresh worker
        assert!(router.submit(image(), None, None).await.unwrap().error.is_none());
        assert_eq!(router.workers_started(), 2);
    }

    #[tokio::test]
    async fn test_remote_request_lost_with_worker_is_answered() {
        let router = router_with(None);
        router.update_settings(Settings::default()).unwrap();
        abort_worker(&router);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let origin = Origin {
            tab_id: 3,
            frame_id: 1,
        };
        let id = router
            .submit_remote(origin.clone(), "tag-9", image(), None, None, tx)
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("remote caller must be answered")
            .unwrap();
        assert_eq!(reply.origin, origin);
        assert_eq!(reply.tag, "tag-9");
        assert_eq!(reply.results.request_id, id);
        assert!(reply.results.error.is_some());
        assert!(!router.is_pending(&id));
    }

    #[tokio::test]
    async fn test_remote_results_reach_their_origin() {
        let router = router_with(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let origin = Origin {
            tab_id: 7,
            frame_id: 0,
        };

        let id = router
            .submit_remote(origin.clone(), "tag-3", image(), None, None, tx)
            .unwrap();
        let reply = rx.recv().await.unwrap();

        assert_eq!(reply.origin, origin);
        assert_eq!(reply.tag, "tag-3");
        assert_eq!(reply.results.request_id, id);
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_request_still_completes_with_error() {
        let router = RequestRouter::new(
            Arc::new(EchoBackend {
                gate: None,
                panic_on: Some(RequestId::new("boom")),
            }),
            Settings::default(),
        );

        let results = router
            .submit(image(), Some(RequestId::new("boom")), None)
            .await
            .unwrap();
        assert!(results.is_error());
        assert_eq!(router.pending_count(), 0);
        assert!(router.submit(image(), None, None).await.is_ok());
    }
}
