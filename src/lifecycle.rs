//! Artifact lifecycle: post-response deletion and age-based eviction
//!
//! Every admitted request works inside its own directory `<output_dir>/<request-id>/`.
//! That directory is registered in an [`ArtifactRegistry`] for as long as an
//! [`ArtifactLease`] on it is alive. The periodic sweep skips registered entries, so
//! only leftovers (a crash, a failed deletion, files dropped in by hand) are evicted by
//! age.

use crate::config::RetentionConfig;
use crate::types::{Event, RequestId};
use crate::utils::{created_at, remove_path, remove_path_blocking};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// In-memory set of output-directory entries owned by active requests
///
/// Registrations are counted, so an entry stays owned until every registration has
/// been released.
#[derive(Clone, Debug, Default)]
pub struct ArtifactRegistry {
    owned: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl ArtifactRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as owned
    pub fn register(&self, path: &Path) {
        *self.lock().entry(path.to_path_buf()).or_insert(0) += 1;
    }

    /// Drop one registration of `path`
    pub fn release(&self, path: &Path) {
        let mut owned = self.lock();
        if let Some(count) = owned.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                owned.remove(path);
            }
        }
    }

    /// Whether an active request owns `path`
    pub fn is_owned(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    /// Number of owned entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is owned
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // the map holds no invariants a panicking holder could break
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, usize>> {
        self.owned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of a best-effort deletion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Paths removed (or already gone)
    pub deleted: usize,
    /// Paths that could not be removed
    pub failed: usize,
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries examined
    pub scanned: usize,
    /// Entries removed for being older than the retention threshold
    pub evicted: usize,
    /// Entries skipped because an active request owns them
    pub in_use: usize,
    /// Entries that could not be inspected or removed
    pub failed: usize,
}

/// Deletes artifacts after delivery and evicts stale entries from the output directory
pub struct ArtifactLifecycle {
    output_dir: PathBuf,
    max_age: Duration,
    sweep_interval: Duration,
    registry: ArtifactRegistry,
    event_tx: broadcast::Sender<Event>,
}

impl ArtifactLifecycle {
    /// Create a lifecycle manager for `output_dir`
    pub fn new(
        output_dir: PathBuf,
        retention: &RetentionConfig,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            output_dir,
            max_age: retention.max_age,
            sweep_interval: retention.sweep_interval,
            registry: ArtifactRegistry::new(),
            event_tx,
        }
    }

    /// Directory being managed
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Registry of owned entries
    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    /// Take ownership of the working directory for request `id`
    ///
    /// The directory is registered before this returns, so a sweep can never evict it
    /// while the lease is alive. The directory itself is not created.
    pub fn lease(self: &Arc<Self>, id: RequestId) -> ArtifactLease {
        let root = self.output_dir.join(id.as_str());
        self.registry.register(&root);
        ArtifactLease {
            id,
            root,
            paths: Vec::new(),
            lifecycle: Some(Arc::clone(self)),
        }
    }

    /// Remove each path, logging failures instead of returning them
    pub async fn delete_artifacts(&self, paths: &[PathBuf]) -> DeletionReport {
        let mut report = DeletionReport::default();
        for path in paths {
            match remove_path(path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "deleted artifact");
                    report.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete artifact");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Whether an entry created at `created` is past retention at `now`
    ///
    /// Strictly older than the threshold; timestamps in the future never expire.
    pub fn is_expired(&self, created: SystemTime, now: SystemTime) -> bool {
        now.duration_since(created)
            .map(|age| age > self.max_age)
            .unwrap_or(false)
    }

    /// One full pass over the output directory
    ///
    /// Every deletion completes before this returns. Fails only when the directory
    /// cannot be listed; per-entry problems are counted in the report.
    pub async fn sweep_once(&self, now: SystemTime) -> std::io::Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut entries = tokio::fs::read_dir(&self.output_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            report.scanned += 1;
            let path = entry.path();

            if self.registry.is_owned(&path) {
                report.in_use += 1;
                continue;
            }

            let created = match entry.metadata().await.and_then(|m| created_at(&m)) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to stat entry");
                    report.failed += 1;
                    continue;
                }
            };

            if !self.is_expired(created, now) {
                continue;
            }

            match remove_path(&path).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "evicted expired artifact");
                    report.evicted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to evict artifact");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sweep, wait `sweep_interval`, repeat until `cancel` fires
    ///
    /// A failed pass is logged and the loop carries on; passes never overlap.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            dir = %self.output_dir.display(),
            max_age_secs = self.max_age.as_secs(),
            interval_ms = self.sweep_interval.as_millis() as u64,
            "artifact sweeper started"
        );

        loop {
            match self.sweep_once(SystemTime::now()).await {
                Ok(report) => {
                    if report.evicted > 0 || report.failed > 0 {
                        tracing::info!(
                            scanned = report.scanned,
                            evicted = report.evicted,
                            in_use = report.in_use,
                            failed = report.failed,
                            "sweep completed"
                        );
                    }
                    self.event_tx
                        .send(Event::SweepCompleted {
                            scanned: report.scanned,
                            evicted: report.evicted,
                            in_use: report.in_use,
                            failed: report.failed,
                        })
                        .ok();
                }
                Err(e) => {
                    tracing::warn!(dir = %self.output_dir.display(), error = %e, "sweep failed");
                    self.event_tx
                        .send(Event::SweepFailed {
                            error: e.to_string(),
                        })
                        .ok();
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {}
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }

        tracing::info!("artifact sweeper stopped");
    }

    /// Spawn [`run_sweeper`](Self::run_sweeper) on the runtime
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_sweeper(cancel))
    }

    async fn finish(&self, id: RequestId, root: PathBuf, mut paths: Vec<PathBuf>) {
        paths.push(root.clone());
        let report = self.delete_artifacts(&paths).await;
        self.registry.release(&root);
        self.announce(id, report);
    }

    fn finish_blocking(&self, id: RequestId, root: PathBuf, mut paths: Vec<PathBuf>) {
        paths.push(root.clone());
        let mut report = DeletionReport::default();
        for path in &paths {
            match remove_path_blocking(path) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete artifact");
                    report.failed += 1;
                }
            }
        }
        self.registry.release(&root);
        self.announce(id, report);
    }

    fn announce(&self, id: RequestId, report: DeletionReport) {
        tracing::debug!(
            request_id = %id,
            deleted = report.deleted,
            failed = report.failed,
            "request artifacts released"
        );
        self.event_tx
            .send(Event::ArtifactsDeleted {
                id,
                deleted: report.deleted,
                failed: report.failed,
            })
            .ok();
    }
}

/// Ownership of one request's artifacts
///
/// While the lease lives, the request directory is protected from the sweep. When it
/// is released, explicitly or by drop, every tracked path and the directory itself are
/// deleted and the registration is dropped. Drop hands the deletion to the runtime, so
/// a response body can hold the lease and clean up however transmission ends.
pub struct ArtifactLease {
    id: RequestId,
    root: PathBuf,
    paths: Vec<PathBuf>,
    lifecycle: Option<Arc<ArtifactLifecycle>>,
}

impl std::fmt::Debug for ArtifactLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactLease")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("paths", &self.paths)
            .finish()
    }
}

impl ArtifactLease {
    /// Request this lease belongs to
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Working directory of the request
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths tracked for deletion, in addition to the root
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Schedule `path` for deletion on release
    pub fn track(&mut self, path: PathBuf) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Delete everything now and wait for it
    pub async fn release(mut self) {
        if let Some(lifecycle) = self.lifecycle.take() {
            let paths = std::mem::take(&mut self.paths);
            lifecycle.finish(self.id.clone(), self.root.clone(), paths).await;
        }
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        let Some(lifecycle) = self.lifecycle.take() else {
            return;
        };
        let id = self.id.clone();
        let root = self.root.clone();
        let paths = std::mem::take(&mut self.paths);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    lifecycle.finish(id, root, paths).await;
                });
            }
            Err(_) => lifecycle.finish_blocking(id, root, paths),
        }
    }
}
