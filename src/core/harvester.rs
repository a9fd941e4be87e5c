use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::classify::{ResponseClassifier, StatusClass};
use crate::core::config::{HarvestConfig, TraversalMode};
use crate::core::recovery::{RecoveryAction, RecoveryMachine};
use crate::http::{CatalogRequestBuilder, Item, ItemId};
use crate::identity::IdentityGenerator;
use crate::proxy::{ProxyPool, WorkerId};
use crate::scrapers::BackendKind;
use crate::session::{BackendFactory, Session, SessionSupervisor};
use crate::stats::{CategoryOutcome, CategoryReport, HarvestReport, StatsTracker};
use crate::storage::{Checkpoint, CheckpointStore, ItemBatch, ItemSink, RawArchive};
use crate::taxonomy::{CategoryId, SourceId, Taxonomy, TaxonomyEntry};
use crate::{HarvestError, HarvestResult};

/// Drives every category of one source through the fetch, classify and
/// recover loop, checkpointing after each page.
pub struct Harvester {
    config: Arc<HarvestConfig>,
    source: SourceId,
    taxonomy: Taxonomy,
    factory: Arc<dyn BackendFactory>,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn ItemSink>,
    proxies: Arc<ProxyPool>,
    identities: IdentityGenerator,
    archive: Option<RawArchive>,
    stats: StatsTracker,
    cancel: CancellationToken,
    requests: CatalogRequestBuilder,
    classifier: ResponseClassifier,
    running: AtomicBool,
}

/// What `--check` reports about a freshly warmed-up session.
#[derive(Debug, Clone)]
pub struct SessionProbe {
    pub backend: BackendKind,
    pub proxy: Option<String>,
    pub anon_id: String,
    pub has_csrf_token: bool,
}

struct WorkItem {
    entry: TaxonomyEntry,
    checkpoint: Checkpoint,
}

/// State shared by the workers of one run.
struct RunState {
    queue: Mutex<VecDeque<WorkItem>>,
    reports: Mutex<Vec<CategoryReport>>,
    halted: Mutex<Option<String>>,
    halt: CancellationToken,
    session_failures: AtomicUsize,
    session_established: AtomicBool,
    session_exhausted: AtomicBool,
}

struct Worker {
    id: WorkerId,
    supervisor: SessionSupervisor,
    session: Option<Session>,
    consecutive_failures: usize,
}

enum PageOutcome {
    Items(Vec<Item>),
    Exhausted,
    /// The page cannot be used; the session is not to blame.
    Abandoned(String),
    Failed(String),
    Interrupted,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Harvester {
    pub fn new(
        config: HarvestConfig,
        source: SourceId,
        taxonomy: Taxonomy,
        factory: Arc<dyn BackendFactory>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn ItemSink>,
    ) -> Self {
        let requests = CatalogRequestBuilder::new(config.site.clone());
        let classifier = ResponseClassifier::new(&config.site, &config.retry);
        Self {
            config: Arc::new(config),
            source,
            taxonomy,
            factory,
            checkpoints,
            sink,
            proxies: Arc::new(ProxyPool::direct()),
            identities: IdentityGenerator::new(),
            archive: None,
            stats: StatsTracker::new(),
            cancel: CancellationToken::new(),
            requests,
            classifier,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_identities(mut self, identities: IdentityGenerator) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_archive(mut self, archive: RawArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_stats(mut self, stats: StatsTracker) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn supervisor(&self, worker: WorkerId) -> SessionSupervisor {
        SessionSupervisor::new(
            Arc::clone(&self.config),
            self.identities.clone(),
            Arc::clone(&self.factory),
            self.proxies.handle(worker),
            self.stats.clone(),
        )
    }

    /// Establishes one session and reports on it without harvesting.
    pub async fn probe_session(&self) -> HarvestResult<SessionProbe> {
        let supervisor = self.supervisor(0);
        let session = supervisor
            .create_session()
            .await
            .ok_or(HarvestError::SessionCreationExhausted {
                attempts: self.config.max_session_attempts,
            })?;
        let probe = SessionProbe {
            backend: session.backend_kind(),
            proxy: session.proxy.as_ref().map(|p| p.redacted()),
            anon_id: session.anon_id(),
            has_csrf_token: session.tokens.contains_key("csrf"),
        };
        session.close().await;
        Ok(probe)
    }

    /// Harvests every selected category once. Partial progress is reported,
    /// not raised; only a run that never got a session returns `Err`.
    pub async fn run(&self) -> HarvestResult<HarvestReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HarvestError::AlreadyRunning(self.source.to_string()));
        }
        let _running = RunningGuard(&self.running);

        let records: HashMap<CategoryId, Checkpoint> = self
            .checkpoints
            .list(&self.source)
            .await?
            .into_iter()
            .map(|c| (c.category_id, c))
            .collect();
        let pass = self.determine_pass(&records).await?;
        info!(
            "Harvesting source {} ({:?}, pass {}, {} categories)",
            self.source,
            self.config.mode,
            pass,
            self.taxonomy.len()
        );

        let mut report = HarvestReport::new(self.source.clone(), self.config.mode, pass);
        let mut queue = VecDeque::new();
        for entry in self.taxonomy.entries() {
            let checkpoint = match records.get(&entry.category_id) {
                Some(stored) if stored.pass == pass && stored.status.is_terminal() => {
                    debug!("Category {} already done in pass {}", entry.category_id, pass);
                    report.categories.push(CategoryReport {
                        category_id: entry.category_id,
                        category_name: entry.category_name.clone(),
                        outcome: CategoryOutcome::Skipped,
                        pages: stored.pages_collected,
                        items: 0,
                    });
                    continue;
                }
                Some(stored) if stored.pass == pass => stored.clone(),
                Some(stored) => Checkpoint::next_pass(stored, pass),
                None => Checkpoint::new(self.source.clone(), entry.category_id, pass),
            };
            queue.push_back(WorkItem {
                entry: entry.clone(),
                checkpoint,
            });
        }

        if queue.is_empty() {
            info!("Nothing to harvest for source {} in pass {}", self.source, pass);
            self.stats.finish();
            return Ok(report);
        }

        let workers = self.config.workers.min(queue.len()).max(1);
        let run = RunState {
            queue: Mutex::new(queue),
            reports: Mutex::new(Vec::new()),
            halted: Mutex::new(None),
            halt: self.cancel.child_token(),
            session_failures: AtomicUsize::new(0),
            session_established: AtomicBool::new(false),
            session_exhausted: AtomicBool::new(false),
        };
        join_all((0..workers).map(|id| self.work(id, &run))).await;

        let established = run.session_established.load(Ordering::SeqCst);
        let exhausted = run.session_exhausted.load(Ordering::SeqCst);
        report.categories.extend(run.reports.into_inner());
        for left in run.queue.into_inner() {
            report.categories.push(CategoryReport {
                category_id: left.entry.category_id,
                category_name: left.entry.category_name,
                outcome: CategoryOutcome::Interrupted,
                pages: left.checkpoint.pages_collected,
                items: 0,
            });
        }
        report
            .categories
            .sort_by_key(|c| self.taxonomy.position(c.category_id));
        report.halted = run.halted.into_inner();
        report.cancelled = self.cancel.is_cancelled();

        if let Err(e) = self.sink.flush().await {
            warn!("Failed to flush item sink: {}", e);
        }
        self.stats.finish();

        if exhausted && !established {
            return Err(HarvestError::SessionCreationExhausted {
                attempts: self.config.max_session_attempts,
            });
        }
        info!(
            "Source {} pass {} done: {} completed, {} failed, {} items",
            self.source,
            pass,
            report.completed(),
            report.failed(),
            report.total_items()
        );
        Ok(report)
    }

    /// The pass of the latest checkpoint, or the next one once every selected
    /// category is terminal in it. `resume = false` always opens a new pass.
    async fn determine_pass(&self, records: &HashMap<CategoryId, Checkpoint>) -> HarvestResult<u32> {
        let Some(highest) = records.values().map(|c| c.pass).max() else {
            return Ok(1);
        };
        if !self.config.resume {
            return Ok(highest + 1);
        }

        if let Some(latest) = self.checkpoints.last_position(&self.source).await? {
            info!(
                "Last checkpoint: category {} page {} ({:?}, pass {})",
                latest.category_id, latest.pages_collected, latest.status, latest.pass
            );
        }
        let finished = self.taxonomy.entries().iter().all(|entry| {
            records
                .get(&entry.category_id)
                .is_some_and(|c| c.pass == highest && c.status.is_terminal())
        });
        Ok(if finished { highest + 1 } else { highest })
    }

    async fn work(&self, id: WorkerId, run: &RunState) {
        let supervisor = self.supervisor(id);
        let session = match supervisor.create_session().await {
            Some(session) => session,
            None => {
                run.session_exhausted.store(true, Ordering::SeqCst);
                self.halt(run, format!("worker {} could not establish a session", id));
                return;
            }
        };
        run.session_established.store(true, Ordering::SeqCst);

        let mut worker = Worker {
            id,
            supervisor,
            session: Some(session),
            consecutive_failures: 0,
        };
        let mut first = true;
        loop {
            if run.halt.is_cancelled() {
                break;
            }
            if !first && !pause_or_cancel(self.config.category_delay.sample(), &run.halt).await {
                break;
            }
            first = false;

            let Some(item) = run.queue.lock().pop_front() else {
                break;
            };
            let report = self.harvest_category(&mut worker, run, item).await;
            run.reports.lock().push(report);
        }

        if let Some(session) = worker.session.take() {
            session.close().await;
        }
        debug!("Worker {} finished", worker.id);
    }

    async fn harvest_category(
        &self,
        worker: &mut Worker,
        run: &RunState,
        item: WorkItem,
    ) -> CategoryReport {
        let WorkItem {
            entry,
            mut checkpoint,
        } = item;
        let marker = match self.config.mode {
            TraversalMode::Delta => checkpoint.last_seen_item_id.clone(),
            TraversalMode::Exhaustive => None,
        };
        let start = checkpoint.pages_collected + 1;
        info!(
            "Worker {}: category {} ({}) from page {}",
            worker.id, entry.category_name, entry.category_id, start
        );

        let mut emitted = 0usize;
        let mut page = start;
        let outcome = loop {
            if page > self.config.page_cap {
                debug!("Page cap {} reached for {}", self.config.page_cap, entry.category_id);
                break CategoryOutcome::Completed;
            }
            if run.halt.is_cancelled() {
                break CategoryOutcome::Interrupted;
            }
            if page > start && !pause_or_cancel(self.config.page_delay.sample(), &run.halt).await {
                break CategoryOutcome::Interrupted;
            }

            let items = match self.fetch_page(worker, run, entry.category_id, page).await {
                PageOutcome::Items(items) => items,
                PageOutcome::Exhausted => break CategoryOutcome::Completed,
                PageOutcome::Interrupted => break CategoryOutcome::Interrupted,
                PageOutcome::Abandoned(reason) => {
                    warn!("Category {} ended on page {}: {}", entry.category_id, page, reason);
                    break CategoryOutcome::Failed { reason };
                }
                PageOutcome::Failed(reason) => {
                    warn!("Category {} failed on page {}: {}", entry.category_id, page, reason);
                    self.note_failed_page(worker, run).await;
                    break CategoryOutcome::Failed { reason };
                }
            };
            worker.consecutive_failures = 0;

            if page == 1 {
                checkpoint.pending_head_id = items.first().map(|item| item.id.clone());
            }
            let (keep, reached_marker) = cut_at_marker(&items, marker.as_ref(), page);
            let fresh = &items[..keep];
            if !fresh.is_empty() {
                let batch = ItemBatch {
                    source_id: &self.source,
                    category_id: entry.category_id,
                    category_name: &entry.category_name,
                    page,
                    items: fresh,
                };
                if let Err(e) = self.sink.accept(batch).await {
                    break CategoryOutcome::Failed {
                        reason: format!("item sink: {}", e),
                    };
                }
            }
            emitted += fresh.len();
            self.stats.record_page(fresh.len());

            checkpoint.record_page(page);
            if let Err(e) = self.checkpoints.save(&checkpoint).await {
                error!("Checkpoint write failed for {}: {}", entry.category_id, e);
                break CategoryOutcome::Failed {
                    reason: e.to_string(),
                };
            }
            debug!(
                "Category {} page {}: {} items, {} new",
                entry.category_id,
                page,
                items.len(),
                fresh.len()
            );

            if reached_marker {
                info!("Category {} caught up with its last seen item", entry.category_id);
                break CategoryOutcome::Completed;
            }
            page += 1;
        };

        let finalized = match &outcome {
            CategoryOutcome::Completed => {
                checkpoint.complete();
                true
            }
            CategoryOutcome::Failed { .. } => {
                checkpoint.fail();
                true
            }
            _ => false,
        };
        if finalized {
            if let Err(e) = self.checkpoints.save(&checkpoint).await {
                error!("Could not finalize checkpoint for {}: {}", entry.category_id, e);
            }
        }

        info!(
            "Category {} ({}): {:?}, {} pages, {} items",
            entry.category_name, entry.category_id, outcome, checkpoint.pages_collected, emitted
        );
        CategoryReport {
            category_id: entry.category_id,
            category_name: entry.category_name,
            outcome,
            pages: checkpoint.pages_collected,
            items: emitted,
        }
    }

    /// One page through the recovery machine until it yields items, ends the
    /// category, or gives up. Every attempt gets a freshly built request so
    /// the `time` token keeps increasing.
    async fn fetch_page(
        &self,
        worker: &mut Worker,
        run: &RunState,
        category: CategoryId,
        page: u32,
    ) -> PageOutcome {
        let mut machine = RecoveryMachine::new(&self.config.retry);
        loop {
            let Some(session) = worker.session.as_mut() else {
                return PageOutcome::Interrupted;
            };
            let request =
                match self
                    .requests
                    .page_request(&self.source, category, page, self.config.mode)
                {
                    Ok(request) => request,
                    Err(e) => return PageOutcome::Abandoned(e.to_string()),
                };
            let response = session.fetch(&request).await;
            let result = self.classifier.classify(&response);

            if let (Some(archive), Ok(raw)) = (&self.archive, &response) {
                if matches!(result.status_class, StatusClass::Ok | StatusClass::Empty) {
                    if let Err(e) = archive.store(&self.source, category, page, &raw.body) {
                        warn!("Failed to archive page {} of {}: {}", page, category, e);
                    }
                }
            }

            let action = machine.next(&result);
            if let Some(reason) = result.status_class.retry_reason() {
                if !matches!(action, RecoveryAction::Fatal(_) | RecoveryAction::Abandon(_)) {
                    self.stats.record_retry(reason);
                }
            }
            debug!("Page {} of {}: {:?} -> {:?}", page, category, result.status_class, action);

            match action {
                RecoveryAction::Consume => return PageOutcome::Items(result.items),
                RecoveryAction::EndCategory => return PageOutcome::Exhausted,
                RecoveryAction::Abandon(reason) => return PageOutcome::Abandoned(reason),
                RecoveryAction::Fatal(reason) => return PageOutcome::Failed(reason),
                RecoveryAction::Backoff {
                    delay,
                    refresh_cookies,
                } => {
                    warn!("Rate limited on page {} of {}, waiting {:?}", page, category, delay);
                    if !pause_or_cancel(delay, &run.halt).await {
                        return PageOutcome::Interrupted;
                    }
                    if refresh_cookies {
                        if let Err(e) = worker.supervisor.refresh_cookies(session).await {
                            warn!("Cookie refresh failed: {}", e);
                        }
                    }
                }
                RecoveryAction::RotateProxy => {
                    warn!("Blocked on page {} of {}, rotating proxy", page, category);
                    worker.supervisor.rotate_proxy(session).await;
                }
                RecoveryAction::RotateIdentity { pause } => {
                    warn!("Still blocked on page {} of {}, rotating identity", page, category);
                    worker.supervisor.rotate_identity(session).await;
                    if !pause_or_cancel(pause, &run.halt).await {
                        return PageOutcome::Interrupted;
                    }
                }
                RecoveryAction::RebuildSession => {
                    warn!("Rebuilding session for page {} of {}", page, category);
                    if !self.rebuild_session(worker, run).await {
                        return PageOutcome::Interrupted;
                    }
                }
                RecoveryAction::Retry { delay } => {
                    debug!("Retrying page {} of {} in {:?}", page, category, delay);
                    if !pause_or_cancel(delay, &run.halt).await {
                        return PageOutcome::Interrupted;
                    }
                }
            }
        }
    }

    /// Counts toward the run-wide session-failure cap; halts the run when the
    /// cap is hit or no replacement session can be made.
    async fn rebuild_session(&self, worker: &mut Worker, run: &RunState) -> bool {
        let failures = run.session_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.retry.max_session_failures {
            self.halt(run, format!("session failure cap reached ({} rebuilds)", failures));
            return false;
        }
        let Some(old) = worker.session.take() else {
            return false;
        };
        match worker.supervisor.rebuild(old).await {
            Some(session) => {
                worker.session = Some(session);
                true
            }
            None => {
                run.session_exhausted.store(true, Ordering::SeqCst);
                self.halt(run, format!("worker {} lost its session", worker.id));
                false
            }
        }
    }

    async fn note_failed_page(&self, worker: &mut Worker, run: &RunState) {
        worker.consecutive_failures += 1;
        if worker.consecutive_failures >= self.config.retry.consecutive_failure_threshold {
            warn!(
                "Worker {}: {} consecutive failed pages, rebuilding session",
                worker.id, worker.consecutive_failures
            );
            worker.consecutive_failures = 0;
            self.rebuild_session(worker, run).await;
        }
    }

    fn halt(&self, run: &RunState, reason: String) {
        error!("Halting run for source {}: {}", self.source, reason);
        run.halted.lock().get_or_insert(reason);
        run.halt.cancel();
    }
}

/// How many leading items are new, and whether the marker was reached.
/// Page 1 is always emitted whole.
fn cut_at_marker(items: &[Item], marker: Option<&ItemId>, page: u32) -> (usize, bool) {
    let Some(marker) = marker else {
        return (items.len(), false);
    };
    match items.iter().position(|item| &item.id == marker) {
        Some(_) if page == 1 => (items.len(), true),
        Some(position) => (position, true),
        None => (items.len(), false),
    }
}

/// Sleeps unless cancelled first; `false` means stop.
async fn pause_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
