//! Admission-controlled fetch orchestration
//!
//! [`FetchBroker`] is the entry point for requests. One request runs strictly in
//! order: validate, estimate, admit (size budget and free space), fetch, bundle when
//! there is more than one artifact, then hand back a [`Deliverable`] whose lease
//! deletes every artifact of the request once it is dropped.

use crate::bundler::Bundler;
use crate::config::{Config, ToolsConfig};
use crate::error::{Error, Result, ToHttpStatus};
use crate::estimator::SizeEstimator;
use crate::fetcher::FetchExecutor;
use crate::heartbeat::{DdnsClient, HeartbeatUpdater};
use crate::lifecycle::{ArtifactLease, ArtifactLifecycle};
use crate::process::{CommandRunner, ProcessRunner, resolve_tool};
use crate::types::{Event, FetchRequest, RequestId, SizeEstimate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Default binary name of the fetch tool
pub const FETCH_TOOL_BINARY: &str = "yt-dlp";

/// Default binary name of the archive tool
pub const ARCHIVE_TOOL_BINARY: &str = "zip";

/// Resolved external tool locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    /// Fetch/probe tool
    pub fetch: PathBuf,
    /// Archive tool
    pub archive: PathBuf,
}

impl ToolPaths {
    /// Resolve both tools from explicit paths or PATH
    pub fn resolve(tools: &ToolsConfig) -> Result<Self> {
        let fetch = resolve_tool(
            tools.fetch_tool_path.as_deref(),
            FETCH_TOOL_BINARY,
            tools.search_path,
        )
        .ok_or_else(|| Error::Config {
            message: format!("{} not found; install it or set its path", FETCH_TOOL_BINARY),
            key: Some("tools.fetch_tool_path".to_string()),
        })?;

        let archive = resolve_tool(
            tools.archive_tool_path.as_deref(),
            ARCHIVE_TOOL_BINARY,
            tools.search_path,
        )
        .ok_or_else(|| Error::Config {
            message: format!("{} not found; install it or set its path", ARCHIVE_TOOL_BINARY),
            key: Some("tools.archive_tool_path".to_string()),
        })?;

        Ok(Self { fetch, archive })
    }
}

/// The single file handed back for one request
#[derive(Debug)]
pub struct Deliverable {
    /// Request id
    pub id: RequestId,
    /// Path of the fetched file or the archive
    pub path: PathBuf,
    /// File name offered to the client
    pub file_name: String,
    /// Size on disk
    pub size_bytes: u64,
    /// Ownership of every artifact of the request; dropping it deletes them
    pub lease: ArtifactLease,
}

/// Media fetch broker
pub struct FetchBroker {
    config: Arc<Config>,
    output_dir: PathBuf,
    event_tx: broadcast::Sender<Event>,
    estimator: SizeEstimator,
    executor: FetchExecutor,
    bundler: Bundler,
    lifecycle: Arc<ArtifactLifecycle>,
    fetch_slots: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl FetchBroker {
    /// Create a broker running the real external tools
    ///
    /// Tools are resolved from configuration or PATH; a missing tool is a
    /// configuration error.
    pub async fn new(config: Config) -> Result<Self> {
        let tools = ToolPaths::resolve(&config.tools)?;
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(config.tools.timeout));
        Self::with_runner(config, tools, runner).await
    }

    /// Create a broker with explicit tool paths and command runner
    pub async fn with_runner(
        config: Config,
        tools: ToolPaths,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.output_dir).await?;
        let output_dir = tokio::fs::canonicalize(&config.output_dir).await?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let lifecycle = Arc::new(ArtifactLifecycle::new(
            output_dir.clone(),
            &config.retention,
            event_tx.clone(),
        ));

        let fetch_slots = config
            .admission
            .max_concurrent_fetches
            .map(|n| Arc::new(Semaphore::new(n)));

        tracing::info!(
            output_dir = %output_dir.display(),
            fetch_tool = %tools.fetch.display(),
            archive_tool = %tools.archive.display(),
            runner = runner.name(),
            max_request_bytes = config.admission.max_request_bytes,
            max_concurrent_fetches = ?config.admission.max_concurrent_fetches,
            "fetch broker ready"
        );

        Ok(Self {
            estimator: SizeEstimator::new(tools.fetch.clone(), Arc::clone(&runner)),
            executor: FetchExecutor::new(tools.fetch, Arc::clone(&runner)),
            bundler: Bundler::new(tools.archive, runner),
            config: Arc::new(config),
            output_dir,
            event_tx,
            lifecycle,
            fetch_slots,
            cancel: CancellationToken::new(),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Canonical output directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Artifact lifecycle manager
    pub fn lifecycle(&self) -> &Arc<ArtifactLifecycle> {
        &self.lifecycle
    }

    /// Subscribe to broker events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Event sender shared with background tasks
    pub fn event_sender(&self) -> broadcast::Sender<Event> {
        self.event_tx.clone()
    }

    /// Validate raw parameters and run the request
    pub async fn submit<I, S>(&self, urls: I, format: Option<&str>) -> Result<Deliverable>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let request = match FetchRequest::new(urls, format) {
            Ok(r) => r,
            Err(e) => {
                let error = Error::from(e);
                self.reject(&error);
                return Err(error);
            }
        };
        self.handle(request).await
    }

    /// Run a validated request through estimation, admission, fetch, and bundling
    pub async fn handle(&self, request: FetchRequest) -> Result<Deliverable> {
        let estimate = match self
            .estimator
            .estimate(request.urls(), request.format())
            .await
        {
            Ok(e) => e,
            Err(e) => {
                self.reject(&e);
                return Err(e);
            }
        };

        if let Err(e) = self.admit(&estimate).await {
            self.reject(&e);
            return Err(e);
        }

        let id = RequestId::generate();
        tracing::info!(
            request_id = %id,
            urls = request.urls().len(),
            format = %request.format(),
            projected_bytes = estimate.total_bytes,
            "request admitted"
        );
        self.event_tx
            .send(Event::RequestAdmitted {
                id: id.clone(),
                url_count: request.urls().len(),
                projected_bytes: estimate.total_bytes,
            })
            .ok();

        let _slot = self.acquire_slot().await?;
        let lease = self.lifecycle.lease(id.clone());
        self.produce(&request, lease).await
    }

    /// Check the projection against the request budget and free disk space
    async fn admit(&self, estimate: &SizeEstimate) -> Result<()> {
        let admission = &self.config.admission;
        if estimate.total_bytes > admission.max_request_bytes {
            return Err(Error::QuotaExceeded {
                projected: estimate.total_bytes,
                limit: admission.max_request_bytes,
            });
        }

        if admission.disk_space.enabled {
            let required = estimate
                .total_bytes
                .saturating_add(admission.disk_space.min_free_space);
            let dir = self.output_dir.clone();
            let available =
                tokio::task::spawn_blocking(move || crate::utils::get_available_space(&dir))
                    .await
                    .map_err(|e| Error::Other(format!("disk space check panicked: {}", e)))??;
            if available < required {
                return Err(Error::InsufficientSpace {
                    required,
                    available,
                });
            }
        }

        Ok(())
    }

    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.fetch_slots {
            Some(slots) => Arc::clone(slots)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| Error::Other("fetch slots closed".to_string())),
            None => Ok(None),
        }
    }

    // Any early return drops the lease, which deletes the request directory
    async fn produce(&self, request: &FetchRequest, mut lease: ArtifactLease) -> Result<Deliverable> {
        let id = lease.id().clone();
        let root = lease.root().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let fetched = self
            .executor
            .fetch(request.urls(), request.format(), &root)
            .await?;
        for path in &fetched.paths {
            lease.track(path.clone());
        }
        self.event_tx
            .send(Event::FetchCompleted {
                id: id.clone(),
                artifact_count: fetched.paths.len(),
            })
            .ok();

        let path = match fetched.paths.as_slice() {
            [] => {
                tracing::warn!(request_id = %id, "fetch tool reported no artifacts");
                return Err(Error::Fetch("fetch tool reported no artifacts".to_string()));
            }
            [single] => single.clone(),
            many => {
                let archive = self.bundler.bundle(many, &root).await?;
                lease.track(archive.clone());
                self.event_tx
                    .send(Event::BundleCreated {
                        id: id.clone(),
                        archive: archive.clone(),
                    })
                    .ok();
                archive
            }
        };

        let size_bytes = tokio::fs::metadata(&path).await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.bin", id));

        tracing::info!(
            request_id = %id,
            file = %file_name,
            size_bytes,
            artifacts = lease.paths().len(),
            "deliverable ready"
        );

        Ok(Deliverable {
            id,
            path,
            file_name,
            size_bytes,
            lease,
        })
    }

    fn reject(&self, error: &Error) {
        tracing::info!(code = error.error_code(), error = %error, "request rejected");
        self.event_tx
            .send(Event::RequestRejected {
                reason: error.error_code().to_string(),
            })
            .ok();
    }

    /// Spawn the eviction sweep and, when enabled, the heartbeat
    pub fn start_background_tasks(&self) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = vec![self.lifecycle.spawn_sweeper(self.cancel.child_token())];

        let heartbeat = &self.config.heartbeat;
        if heartbeat.enabled {
            let client = DdnsClient::new(heartbeat)?;
            let updater = Arc::new(HeartbeatUpdater::new(
                Arc::new(client),
                heartbeat,
                self.event_tx.clone(),
            ));
            handles.push(updater.spawn(self.cancel.child_token()));
        } else {
            tracing::debug!("heartbeat disabled");
        }

        Ok(handles)
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        tracing::info!("stopping background tasks");
        self.cancel.cancel();
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
