//! # Request Dispatcher
//!
//! The `Dispatcher` turns registered [`Request`]s into grouped, bounded
//! concurrent work and gives every request a cache-first, live-fetch,
//! cache-as-backup resolution.
//!
//! ## Core Design Principles:
//!
//! 1.  **Idempotent Submission**: requests are keyed by id. Re-adding an id that is
//!     still pending is a no-op, so a request is never processed twice at once.
//!
//! 2.  **Ordered Groups**: a dispatch cycle snapshots every `Unloaded` request and
//!     buckets it by group. Buckets run in ascending order; a bucket starts only
//!     after every task of the previous one has finished.
//!
//! 3.  **Bounded Workers**: all cycles of a dispatcher share one semaphore, so no
//!     more than `worker_count` requests are processed at any moment.
//!
//! 4.  **Failure Isolation**: handler, validator and `on_error` panics are caught,
//!     and a panicking worker task only fails its own request. Nothing propagates
//!     out of a dispatch; failures reach callers through `on_error` and the
//!     returned [`CycleReport`].

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::cache::{read_cache, remove_quietly, write_cache, CacheError};
use crate::configs::config_dispatch::DispatcherConfig;
use crate::core::registry::{CyclePlan, Registry};
use crate::core::request::{LiveFailure, LoadingPhase, Request, RequestError};
use crate::retrieve::http_fetch::{FetchError, HttpFetcher, ReqwestFetcher};

/// How a request of a cycle ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Validated cached bytes were accepted without a network call.
    Cache,
    /// The live response was accepted.
    Live,
    /// The live fetch failed and the cache backup was accepted.
    Backup,
    /// No path satisfied the request; `on_error` was called.
    Failed,
}

/// # Cycle Report
///
/// Outcome of one dispatch cycle, listing request ids per resolution path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Monotonic cycle id, starting at 1 for each dispatcher.
    pub cycle: u64,
    /// Satisfied by validated cache data.
    pub from_cache: Vec<String>,
    /// Satisfied by a live response.
    pub from_live: Vec<String>,
    /// Satisfied by the cache backup after a failed live fetch.
    pub from_backup: Vec<String>,
    /// Not satisfied by any path.
    pub failed: Vec<String>,
    /// Put back to `Unloaded` because the cycle was interrupted.
    pub rearmed: Vec<String>,
    /// Whether the cycle was cut short by [`Dispatcher::interrupt`].
    pub interrupted: bool,
}

impl CycleReport {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Default::default()
        }
    }

    fn record(&mut self, id: String, resolution: Resolution) {
        match resolution {
            Resolution::Cache => self.from_cache.push(id),
            Resolution::Live => self.from_live.push(id),
            Resolution::Backup => self.from_backup.push(id),
            Resolution::Failed => self.failed.push(id),
        }
    }

    /// Number of satisfied requests, whatever the path.
    pub fn satisfied(&self) -> usize {
        self.from_cache.len() + self.from_live.len() + self.from_backup.len()
    }

    /// The resolution recorded for `id`, if it finished in this cycle.
    pub fn resolution_of(&self, id: &str) -> Option<Resolution> {
        let has = |ids: &[String]| ids.iter().any(|i| i == id);
        if has(&self.from_cache) {
            Some(Resolution::Cache)
        } else if has(&self.from_live) {
            Some(Resolution::Live)
        } else if has(&self.from_backup) {
            Some(Resolution::Backup)
        } else if has(&self.failed) {
            Some(Resolution::Failed)
        } else {
            None
        }
    }

    /// True when every request of the cycle was satisfied and the cycle ran to the end.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

/// # Core Dispatcher
///
/// Owns the pending-request registry and runs dispatch cycles. Cloning is
/// cheap and every clone drives the same registry and worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    /// Pending requests, cycle counter and interruption token, behind one lock.
    registry: Arc<Mutex<Registry>>,
    /// The HTTP client used for live fetches.
    fetcher: Arc<dyn HttpFetcher>,
    /// Worker pool shared by every cycle.
    workers: Arc<Semaphore>,
    config: Arc<DispatcherConfig>,
}

impl Dispatcher {
    /// Creates a dispatcher that fetches through `fetcher`.
    pub fn new(config: DispatcherConfig, fetcher: Arc<dyn HttpFetcher>) -> Self {
        let worker_count = config.worker_count.max(1);
        log::info!(
            "Dispatcher created with {} worker(s){}",
            worker_count,
            if config.cache_only { " in cache-only mode" } else { "" }
        );
        Self {
            registry: Arc::new(Mutex::new(Registry::new())),
            fetcher,
            workers: Arc::new(Semaphore::new(worker_count)),
            config: Arc::new(config),
        }
    }

    /// Creates a dispatcher with a [`ReqwestFetcher`] built from `config`.
    ///
    /// # Errors
    /// Returns [`FetchError::Build`] if the HTTP client cannot be initialised.
    pub fn with_reqwest(config: DispatcherConfig) -> Result<Self, FetchError> {
        let fetcher = ReqwestFetcher::from_config(&config)?;
        Ok(Self::new(config, Arc::new(fetcher)))
    }

    /// The configuration this dispatcher runs with.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        lock_registry(&self.registry)
    }

    /// Claims every waiting request for a new cycle. The returned guard settles
    /// the claimed requests if the cycle is dropped before it does so itself.
    fn claim(&self) -> Option<(CyclePlan, CycleGuard)> {
        let plan = self.lock().begin_cycle()?;
        let guard = CycleGuard {
            registry: Arc::clone(&self.registry),
            cycle: plan.id,
            ids: plan.request_ids(),
            armed: true,
        };
        Some((plan, guard))
    }

    /// # Add Request
    ///
    /// Registers `request` for the next dispatch cycle.
    ///
    /// # Returns
    /// `false`, leaving the registry untouched, when a request with the same id
    /// is already pending.
    pub fn add_request(&self, request: Request) -> bool {
        let id = request.id().to_string();
        let added = self.lock().insert(request);
        if added {
            log::debug!("Request {} registered", id);
        } else {
            log::debug!("Request {} is already pending, ignoring duplicate", id);
        }
        added
    }

    /// Runs a dispatch cycle on the current task.
    ///
    /// Returns `None` when no request is waiting. Dropping the returned future
    /// before it completes cancels the cycle like [`interrupt`](Self::interrupt)
    /// does: finished requests leave the registry, the others wait for the next
    /// dispatch.
    pub async fn dispatch(&self) -> Option<CycleReport> {
        let (plan, guard) = self.claim()?;
        Some(self.run_cycle(plan, guard).await)
    }

    /// Snapshots the waiting requests now and runs the cycle on a new tokio task.
    ///
    /// Returns `None` when no request is waiting, or when called outside a
    /// tokio runtime (in which case the registry is left untouched). Aborting
    /// the handle settles the cycle the same way as dropping
    /// [`dispatch`](Self::dispatch).
    pub fn dispatch_async(&self) -> Option<JoinHandle<CycleReport>> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Cannot dispatch in the background outside a tokio runtime: {}", e);
                return None;
            }
        };

        let (plan, guard) = self.claim()?;
        let dispatcher = self.clone();
        Some(handle.spawn(async move { dispatcher.run_cycle(plan, guard).await }))
    }

    /// [`add_request`](Self::add_request) followed by [`dispatch`](Self::dispatch).
    pub async fn add_and_dispatch(&self, request: Request) -> Option<CycleReport> {
        self.add_request(request);
        self.dispatch().await
    }

    /// [`add_request`](Self::add_request) followed by [`dispatch_async`](Self::dispatch_async).
    pub fn add_and_dispatch_async(&self, request: Request) -> Option<JoinHandle<CycleReport>> {
        self.add_request(request);
        self.dispatch_async()
    }

    /// # Interrupt
    ///
    /// Stops every cycle currently running at its next group wait. Finished
    /// requests of those cycles are dropped; the others go back to `Unloaded`
    /// and are retried by the next dispatch. Later cycles are unaffected.
    pub fn interrupt(&self) {
        log::warn!("Interrupting running dispatch cycles");
        self.lock().interrupt();
    }

    /// Number of requests in the registry, whatever their status.
    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    /// Whether a request with this id is in the registry.
    pub fn is_pending(&self, id: &str) -> bool {
        self.status_of(id).is_some()
    }

    /// Lifecycle status of a registered request.
    pub fn status_of(&self, id: &str) -> Option<LoadingPhase> {
        self.lock().status_of(id)
    }

    /// Number of dispatch cycles started so far.
    pub fn cycles_started(&self) -> u64 {
        self.lock().cycles_started()
    }

    async fn run_cycle(&self, plan: CyclePlan, guard: CycleGuard) -> CycleReport {
        let CyclePlan { id, groups, token } = plan;
        let mut report = CycleReport::new(id);
        log::info!(
            "Dispatch cycle {} started with {} request(s) in {} group(s)",
            id,
            guard.ids.len(),
            groups.len()
        );

        for (group, requests) in groups {
            log::debug!("Cycle {}: running group {} ({} request(s))", id, group, requests.len());

            // 1. One task per request; the semaphore bounds how many run at once
            let mut tasks = JoinSet::new();
            for request in requests {
                let dispatcher = self.clone();
                tasks.spawn(async move {
                    let request_id = request.id().to_string();
                    let resolution = match AssertUnwindSafe(dispatcher.process(&request))
                        .catch_unwind()
                        .await
                    {
                        Ok(resolution) => resolution,
                        Err(_) => {
                            log::error!("Worker for request {} panicked", request_id);
                            Resolution::Failed
                        }
                    };
                    dispatcher.lock().mark_loaded(id, &request_id);
                    (request_id, resolution)
                });
            }

            // 2. Wait for the whole group unless the cycle gets interrupted
            let interrupted = loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break true,
                    joined = tasks.join_next() => match joined {
                        None => break false,
                        Some(Ok((request_id, resolution))) => report.record(request_id, resolution),
                        Some(Err(e)) => log::error!("Cycle {}: worker task failed: {}", id, e),
                    },
                }
            };

            if interrupted {
                return self.abandon_cycle(tasks, guard, report).await;
            }
        }

        // 3. Every group is done; drop this cycle's requests
        guard.finish();
        log::info!(
            "Dispatch cycle {} finished: {} satisfied ({} cache, {} live, {} backup), {} failed",
            id,
            report.satisfied(),
            report.from_cache.len(),
            report.from_live.len(),
            report.from_backup.len(),
            report.failed.len()
        );
        report
    }

    async fn abandon_cycle(
        &self,
        mut tasks: JoinSet<(String, Resolution)>,
        guard: CycleGuard,
        mut report: CycleReport,
    ) -> CycleReport {
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            // Tasks that completed before the abort still carry their outcome.
            if let Ok((request_id, resolution)) = joined {
                report.record(request_id, resolution);
            }
        }

        let (removed, rearmed) = guard.reconcile();
        log::warn!(
            "Dispatch cycle {} interrupted: {} finished request(s) dropped, {} re-armed",
            report.cycle,
            removed.len(),
            rearmed.len()
        );
        report.rearmed = rearmed;
        report.interrupted = true;
        report
    }

    /// # Process
    ///
    /// Resolves one request:
    /// 1.  Cache first, when a validator can vouch for the cached bytes.
    /// 2.  Live fetch, unless the dispatcher is cache-only.
    /// 3.  Cache as backup, when the request opted in.
    /// 4.  Otherwise `on_error`.
    async fn process(&self, request: &Request) -> Resolution {
        // The semaphore is never closed; without a permit the request still runs.
        let _permit = self.workers.acquire().await.ok();
        let cache_path = request
            .cache_file()
            .map(|path| self.config.resolve_cache_path(path));

        if let Some(path) = cache_path.as_deref() {
            if request.has_cache_validator() && self.try_cache_first(request, path).await {
                return Resolution::Cache;
            }
        }

        let live = if self.config.cache_only {
            log::debug!("Skipping live fetch of {} (cache-only mode)", request.id());
            LiveFailure::CacheOnly
        } else {
            match self.fetch_live(request, cache_path.as_deref()).await {
                Ok(()) => return Resolution::Live,
                Err(failure) => failure,
            }
        };

        match self.use_backup(request, cache_path.as_deref(), live).await {
            Ok(()) => Resolution::Backup,
            Err(error) => {
                log::warn!("Request {} could not be satisfied: {}", request.id(), error);
                request.report_error(&error);
                Resolution::Failed
            }
        }
    }

    async fn try_cache_first(&self, request: &Request, path: &Path) -> bool {
        let bytes = match read_cache(path).await {
            Ok(bytes) => bytes,
            Err(CacheError::NotFound(_)) => return false,
            Err(e) => {
                log::warn!("Could not read cache for {}: {}", request.id(), e);
                return false;
            }
        };

        if !request.validate_cache(&bytes) {
            log::warn!(
                "Cache file {} for {} failed validation, fetching instead",
                path.display(),
                request.id()
            );
            remove_quietly(path).await;
            return false;
        }

        match request.invoke_handler(None, &bytes) {
            Ok(true) => {
                log::debug!("Request {} satisfied from cache {}", request.id(), path.display());
                true
            }
            Ok(false) => {
                log::warn!("Handler rejected cached data for {}, fetching instead", request.id());
                remove_quietly(path).await;
                false
            }
            Err(reason) => {
                log::warn!("Handler failed on cached data for {}: {}", request.id(), reason);
                remove_quietly(path).await;
                false
            }
        }
    }

    async fn fetch_live(&self, request: &Request, cache_path: Option<&Path>) -> Result<(), LiveFailure> {
        let target = request.resolved_target(self.config.default_timeout());

        // 1. Exchange
        let response = match self.fetcher.fetch(&target).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!(
                    "Error occurred whilst fetching {} from {}: {}",
                    request.id(),
                    target.url,
                    e
                );
                return Err(e.into());
            }
        };
        if response.meta.status != 200 {
            let e = FetchError::UnexpectedStatus {
                status: response.meta.status,
            };
            log::warn!("Error occurred whilst fetching {} from {}: {}", request.id(), target.url, e);
            return Err(e.into());
        }

        // 2. Interpretation
        match request.invoke_handler(Some(&response.meta), &response.body) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Handler rejected live data for {} from {}", request.id(), target.url);
                return Err(LiveFailure::Rejected);
            }
            Err(reason) => {
                log::warn!("Handler failed on live data for {}: {}", request.id(), reason);
                return Err(LiveFailure::Handler(reason));
            }
        }

        // 3. Write-through, best effort
        if let Some(path) = cache_path {
            if let Err(e) = write_cache(path, &response.body).await {
                log::warn!("Could not persist {} to cache: {}", request.id(), e);
                remove_quietly(path).await;
            }
        }

        log::debug!("Request {} satisfied from {}", request.id(), target.url);
        Ok(())
    }

    async fn use_backup(
        &self,
        request: &Request,
        cache_path: Option<&Path>,
        live: LiveFailure,
    ) -> Result<(), RequestError> {
        if !request.use_cache_as_backup() {
            return Err(RequestError::NoBackup { live });
        }
        let Some(path) = cache_path else {
            return Err(RequestError::BackupMissing { live });
        };

        let bytes = match read_cache(path).await {
            Ok(bytes) => bytes,
            Err(CacheError::NotFound(_)) => return Err(RequestError::BackupMissing { live }),
            Err(e) => {
                let reason = e.to_string();
                remove_quietly(path).await;
                return Err(RequestError::BackupUnreadable { live, reason });
            }
        };

        match request.invoke_handler(None, &bytes) {
            Ok(true) => {
                log::info!(
                    "Request {} satisfied from cache backup after live failure: {}",
                    request.id(),
                    live
                );
                Ok(())
            }
            Ok(false) => {
                remove_quietly(path).await;
                Err(RequestError::BackupRejected { live })
            }
            Err(reason) => {
                log::warn!("Handler failed on backup data for {}: {}", request.id(), reason);
                remove_quietly(path).await;
                Err(RequestError::BackupRejected { live })
            }
        }
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // The registry stays consistent between statements, so a poisoned
    // guard is still usable.
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The requests claimed by one cycle.
///
/// A cycle settles them through [`CycleGuard::finish`] or
/// [`CycleGuard::reconcile`]. If the cycle future is dropped first (a caller
/// timeout, an aborted `dispatch_async` handle), `Drop` reconciles them instead
/// so none stays claimed forever.
struct CycleGuard {
    registry: Arc<Mutex<Registry>>,
    cycle: u64,
    ids: Vec<String>,
    armed: bool,
}

impl CycleGuard {
    fn finish(mut self) {
        self.armed = false;
        lock_registry(&self.registry).finish_cycle(self.cycle, &self.ids);
    }

    fn reconcile(mut self) -> (Vec<String>, Vec<String>) {
        self.armed = false;
        let mut registry = lock_registry(&self.registry);
        registry.reconcile_interrupted(self.cycle, &self.ids)
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (removed, rearmed) = lock_registry(&self.registry).reconcile_interrupted(self.cycle, &self.ids);
        log::warn!(
            "Dispatch cycle {} was cancelled: {} finished request(s) dropped, {} re-armed",
            self.cycle,
            removed.len(),
            rearmed.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieve::http_fetch::{FetchResponse, FetchTarget, ResponseMeta};
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every fetch with the same status and body.
    struct FixedFetcher {
        status: u16,
        body: &'static [u8],
        calls: AtomicUsize,
    }

    impl FixedFetcher {
        fn new(status: u16, body: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl HttpFetcher for FixedFetcher {
        fn fetch<'a>(&'a self, target: &'a FetchTarget) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.status == 200 {
                Ok(FetchResponse {
                    meta: ResponseMeta {
                        url: target.url.clone(),
                        status: 200,
                        headers: HeaderMap::new(),
                    },
                    body: Bytes::from_static(self.body),
                })
            } else {
                Err(FetchError::UnexpectedStatus { status: self.status })
            };
            Box::pin(async move { result })
        }
    }

    fn request(id: &str) -> Request {
        Request::builder(id, "https://example.com/data")
            .handle(|_, bytes| !bytes.is_empty())
            .build()
            .unwrap()
    }

    #[test]
    fn report_tracks_resolutions() {
        let mut report = CycleReport::new(3);
        report.record("a".into(), Resolution::Live);
        report.record("b".into(), Resolution::Backup);
        report.record("c".into(), Resolution::Failed);

        assert_eq!(report.satisfied(), 2);
        assert_eq!(report.resolution_of("b"), Some(Resolution::Backup));
        assert_eq!(report.resolution_of("zzz"), None);
        assert!(!report.is_success());
    }

    #[test]
    fn dispatch_async_outside_runtime_leaves_registry_alone() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), FixedFetcher::new(200, b"x"));
        assert!(dispatcher.add_request(request("a")));

        assert!(dispatcher.dispatch_async().is_none());
        assert_eq!(dispatcher.status_of("a"), Some(LoadingPhase::Unloaded));
        assert_eq!(dispatcher.cycles_started(), 0);
    }

    #[tokio::test]
    async fn dispatch_resolves_and_empties_registry() {
        let fetcher = FixedFetcher::new(200, b"payload");
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), fetcher.clone());
        dispatcher.add_request(request("a"));

        let report = dispatcher.dispatch().await.unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.from_live, vec!["a".to_string()]);
        assert_eq!(dispatcher.pending_len(), 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_async_snapshots_immediately() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), FixedFetcher::new(404, b""));
        let handle = dispatcher.add_and_dispatch_async(request("gone")).unwrap();

        // Already claimed by the spawned cycle, so nothing is left to dispatch.
        assert!(dispatcher.dispatch().await.is_none());

        let report = handle.await.unwrap();
        assert_eq!(report.failed, vec!["gone".to_string()]);
        assert!(!dispatcher.is_pending("gone"));
    }

    #[tokio::test]
    async fn dispatch_with_nothing_pending_returns_none() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), FixedFetcher::new(200, b"x"));
        assert!(dispatcher.dispatch().await.is_none());
        assert!(dispatcher.dispatch_async().is_none());
        assert_eq!(dispatcher.cycles_started(), 0);
    }
}
