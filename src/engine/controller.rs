// Reader controller: one screen's acquisition and viewing state machine.
//
// All mutable reader state lives here. The download/parse pipeline runs in a
// spawned task and reports back over a per-attempt channel; events are applied
// in arrival order on the caller's task only. With a catalog attached, the
// metadata lookup is the first pipeline stage and runs while `Resolving`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{CacheEntry, DocumentCache};
use super::downloader::{
    DownloadError, DownloadProgress, DownloadSession, DownloadStatus, Downloader,
};
use super::locator::{resolve, DocumentRef, MissingSourceError};
use super::render::{
    DisplayOptions, Orientation, PagingMode, ParseError, PdfEngine, RenderSession, ViewerEngine,
};
use crate::config::{ReaderConfig, STATUS_HISTORY_LIMIT};
use crate::source::catalog::CatalogSource;
use crate::source::http_source::HttpSource;
use crate::source::traits::DocumentSource;

pub const MISSING_SOURCE_MESSAGE: &str = "No PDF URL available for this content.";
pub const DOWNLOAD_FAILED_MESSAGE: &str =
    "Failed to download PDF. Please check your internet connection and try again.";
pub const PARSE_FAILED_MESSAGE: &str = "Failed to load PDF. Please try again later.";

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    MissingSource(#[from] MissingSourceError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl ReaderError {
    /// Message shown to the reader; the cause itself is only logged.
    pub fn user_message(&self) -> &'static str {
        match self {
            ReaderError::MissingSource(_) => MISSING_SOURCE_MESSAGE,
            ReaderError::Download(_) => DOWNLOAD_FAILED_MESSAGE,
            ReaderError::Parse(_) => PARSE_FAILED_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    Idle,
    Resolving,
    Downloading,
    Loading,
    Ready,
    Error,
}

impl ReaderStatus {
    /// Whether an attempt is still running toward `Ready` or `Error`.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ReaderStatus::Resolving | ReaderStatus::Downloading | ReaderStatus::Loading
        )
    }
}

/// Read-only view of the controller handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSnapshot {
    pub status: ReaderStatus,
    pub progress_fraction: f64,
    /// Engine parse progress while `Loading`; distinct from download progress.
    pub load_fraction: f64,
    pub current_page: u32,
    pub total_pages: u32,
    pub zoom_scale: f64,
    pub orientation: Orientation,
    pub paging_mode: PagingMode,
    pub error_message: Option<String>,
}

enum PipelineEvent {
    Resolved {
        doc: DocumentRef,
        url: String,
        key: String,
        destination: PathBuf,
    },
    ResolveFailed(MissingSourceError),
    DownloadProgress(DownloadProgress),
    Downloaded(PathBuf),
    DownloadFailed(DownloadError),
    LoadProgress(f64),
    Loaded { path: PathBuf, total_pages: u32 },
    LoadFailed(ParseError),
}

struct SequencedEvent {
    generation: u64,
    seq: u64,
    event: PipelineEvent,
}

struct EventSink {
    tx: mpsc::UnboundedSender<SequencedEvent>,
    generation: u64,
    next_seq: AtomicU64,
}

impl EventSink {
    fn send(&self, event: PipelineEvent) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        // A closed receiver means the attempt was superseded or torn down.
        let _ = self.tx.send(SequencedEvent {
            generation: self.generation,
            seq,
            event,
        });
    }
}

struct Attempt {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<SequencedEvent>,
}

pub struct ReaderController {
    doc: DocumentRef,
    cache: Arc<DocumentCache>,
    downloader: Arc<Downloader>,
    engine: Arc<dyn ViewerEngine>,
    catalog: Option<Arc<dyn CatalogSource>>,
    render: RenderSession,
    status: ReaderStatus,
    progress: f64,
    load_progress: f64,
    error_message: Option<String>,
    cache_entry: Option<CacheEntry>,
    download: Option<DownloadSession>,
    generation: u64,
    last_seq: u64,
    attempt: Option<Attempt>,
    history: Vec<ReaderStatus>,
    closed: bool,
}

impl ReaderController {
    pub fn new(
        doc: DocumentRef,
        config: &ReaderConfig,
        source: Arc<dyn DocumentSource>,
        engine: Arc<dyn ViewerEngine>,
    ) -> Self {
        Self {
            doc,
            cache: Arc::new(DocumentCache::new(
                config.storage_root.clone(),
                config.cache_key_policy,
            )),
            downloader: Arc::new(Downloader::new(source)),
            engine,
            catalog: None,
            render: RenderSession::new(config),
            status: ReaderStatus::Idle,
            progress: 0.0,
            load_progress: 0.0,
            error_message: None,
            cache_entry: None,
            download: None,
            generation: 0,
            last_seq: 0,
            attempt: None,
            history: vec![ReaderStatus::Idle],
            closed: false,
        }
    }

    /// HTTP transport with the configured headers and the built-in PDF engine.
    pub fn with_defaults(doc: DocumentRef, config: &ReaderConfig) -> Self {
        let source = Arc::new(HttpSource::new(config.request_headers.clone()));
        Self::new(doc, config, source, Arc::new(PdfEngine))
    }

    /// Look the document up in `catalog` at the start of every attempt.
    ///
    /// A failed lookup keeps the current reference, so a document without
    /// candidate URLs ends in the missing-source error.
    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogSource>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn document(&self) -> &DocumentRef {
        &self.doc
    }

    pub fn status(&self) -> ReaderStatus {
        self.status
    }

    /// Most recent statuses entered, oldest first; bounded by `STATUS_HISTORY_LIMIT`.
    pub fn history(&self) -> &[ReaderStatus] {
        &self.history
    }

    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        self.cache_entry.as_ref()
    }

    pub fn download_session(&self) -> Option<&DownloadSession> {
        self.download.as_ref()
    }

    pub fn display_options(&self) -> DisplayOptions {
        self.render.display_options()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn snapshot(&self) -> ReaderSnapshot {
        let view = self.render.view();
        ReaderSnapshot {
            status: self.status,
            progress_fraction: self.progress,
            load_fraction: self.load_progress,
            current_page: view.current_page,
            total_pages: view.total_pages,
            zoom_scale: view.zoom_scale,
            orientation: view.orientation,
            paging_mode: view.paging_mode,
            error_message: self.error_message.clone(),
        }
    }

    /// Begin the session. Only valid from `Idle`; use `retry` afterwards.
    pub fn start(&mut self) -> bool {
        if self.closed || self.status != ReaderStatus::Idle {
            return false;
        }
        self.begin_attempt();
        true
    }

    /// Abandon any in-flight attempt and start over from `Resolving`.
    ///
    /// The downloader clears both the cached and the partial file before the
    /// new transfer, so nothing from the previous attempt is reused.
    pub fn retry(&mut self) -> bool {
        if self.closed {
            return false;
        }
        info!("reader book={} retry requested from {:?}", self.doc.book_id, self.status);
        self.begin_attempt();
        true
    }

    pub fn on_page_changed(&mut self, page: u32) -> bool {
        if self.closed || self.status != ReaderStatus::Ready {
            return false;
        }
        let applied = self.render.set_page(page);
        debug!("reader book={} page={}", self.doc.book_id, applied);
        true
    }

    pub fn set_zoom(&mut self, scale: f64) -> bool {
        if self.closed || self.status != ReaderStatus::Ready {
            return false;
        }
        self.render.set_zoom(scale);
        true
    }

    pub fn toggle_orientation(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let orientation = self.render.toggle_orientation();
        debug!(
            "reader book={} orientation={:?} paging={:?}",
            self.doc.book_id,
            orientation,
            self.render.view().paging_mode
        );
        true
    }

    pub fn set_paging_mode(&mut self, mode: PagingMode) -> bool {
        if self.closed {
            return false;
        }
        self.render.set_paging_mode(mode)
    }

    /// Tear the session down. In-flight work is cancelled and any result it
    /// still produces is ignored; no later event or command changes state.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // The cancelled task cleans up its partial file while still holding the
        // cache slot, so a reader opened next for the same slot waits for it.
        drop(self.cancel_attempt());
        info!("reader book={} closed in {:?}", self.doc.book_id, self.status);
    }

    /// Wait for the next state change from the running attempt.
    /// Returns `None` once nothing is in flight (settled, errored or closed).
    pub async fn next_update(&mut self) -> Option<ReaderSnapshot> {
        loop {
            if self.closed || !self.status.is_busy() {
                return None;
            }
            let received = match self.attempt.as_mut() {
                Some(attempt) => attempt.events.recv().await,
                None => return None,
            };
            match received {
                Some(event) => {
                    if self.apply(event) {
                        return Some(self.snapshot());
                    }
                }
                None => {
                    self.pipeline_vanished();
                    return Some(self.snapshot());
                }
            }
        }
    }

    /// Drive the attempt until it settles and return the final snapshot.
    pub async fn run_until_settled(&mut self) -> ReaderSnapshot {
        while self.next_update().await.is_some() {}
        self.snapshot()
    }

    /// Apply every already-delivered event without waiting. Returns how many changed state.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let received = match self.attempt.as_mut() {
                Some(attempt) => attempt.events.try_recv(),
                None => return applied,
            };
            match received {
                Ok(event) => {
                    if self.apply(event) {
                        applied += 1;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return applied,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.closed && self.status.is_busy() {
                        self.pipeline_vanished();
                        applied += 1;
                    }
                    return applied;
                }
            }
        }
    }

    fn begin_attempt(&mut self) {
        let previous = self.cancel_attempt();
        self.generation += 1;
        self.last_seq = 0;
        self.progress = 0.0;
        self.load_progress = 0.0;
        self.error_message = None;
        self.download = None;
        self.cache_entry = None;
        self.render.detach();
        self.transition(ReaderStatus::Resolving);

        let target = if let Some(catalog) = self.catalog.clone() {
            Target::Lookup {
                catalog,
                doc: self.doc.clone(),
                cache: Arc::clone(&self.cache),
            }
        } else {
            match resolve(&self.doc) {
                Ok(url) => {
                    let key = self.cache.key_for(&self.doc);
                    let destination = self.cache.path(&key);
                    self.enter_downloading(url.clone(), key, destination.clone());
                    Target::Direct { url, destination }
                }
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pipeline = Pipeline {
            downloader: Arc::clone(&self.downloader),
            engine: Arc::clone(&self.engine),
            options: self.render.display_options(),
            sink: Arc::new(EventSink {
                tx,
                generation: self.generation,
                next_seq: AtomicU64::new(0),
            }),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(pipeline.run(previous, target));
        self.attempt = Some(Attempt {
            cancel,
            task,
            events: rx,
        });
    }

    fn enter_downloading(&mut self, url: String, key: String, destination: PathBuf) {
        self.cache_entry = Some(CacheEntry {
            key,
            file_path: destination.clone(),
            is_complete: false,
        });
        let mut session = DownloadSession::new(url, destination);
        session.advance(DownloadStatus::InProgress);
        self.download = Some(session);
        self.transition(ReaderStatus::Downloading);
    }

    /// Cancel the current attempt and hand back its task so a successor can
    /// wait for it before starting its own pipeline.
    fn cancel_attempt(&mut self) -> Option<JoinHandle<()>> {
        let attempt = self.attempt.take()?;
        attempt.cancel.cancel();
        Some(attempt.task)
    }

    /// Returns `true` when the event changed observable state.
    fn apply(&mut self, sequenced: SequencedEvent) -> bool {
        if self.closed {
            return false;
        }
        if sequenced.generation != self.generation || sequenced.seq <= self.last_seq {
            debug!(
                "reader book={} discarding stale event gen={} seq={} (current gen={} seq={})",
                self.doc.book_id,
                sequenced.generation,
                sequenced.seq,
                self.generation,
                self.last_seq
            );
            return false;
        }
        self.last_seq = sequenced.seq;

        match sequenced.event {
            PipelineEvent::Resolved {
                doc,
                url,
                key,
                destination,
            } => {
                if self.status != ReaderStatus::Resolving {
                    return false;
                }
                self.doc = doc;
                self.enter_downloading(url, key, destination);
                true
            }
            PipelineEvent::ResolveFailed(e) => {
                if self.status != ReaderStatus::Resolving {
                    return false;
                }
                self.fail(e.into());
                true
            }
            PipelineEvent::DownloadProgress(progress) => {
                if self.status != ReaderStatus::Downloading || progress.fraction < self.progress {
                    return false;
                }
                if let Some(session) = self.download.as_mut() {
                    session.bytes_written = progress.bytes_written;
                    session.bytes_expected = progress.bytes_expected;
                }
                let changed = progress.fraction > self.progress;
                self.progress = progress.fraction;
                changed
            }
            PipelineEvent::Downloaded(path) => {
                if self.status != ReaderStatus::Downloading {
                    return false;
                }
                self.progress = 1.0;
                if let Some(session) = self.download.as_mut() {
                    session.advance(DownloadStatus::Complete);
                }
                if let Some(entry) = self.cache_entry.as_mut() {
                    entry.file_path = path;
                    entry.is_complete = true;
                }
                self.transition(ReaderStatus::Loading);
                true
            }
            PipelineEvent::DownloadFailed(e) => {
                if self.status != ReaderStatus::Downloading {
                    return false;
                }
                if let Some(session) = self.download.as_mut() {
                    session.advance(DownloadStatus::Failed);
                }
                if let Some(entry) = self.cache_entry.as_mut() {
                    entry.is_complete = false;
                }
                self.fail(e.into());
                true
            }
            PipelineEvent::LoadProgress(fraction) => {
                if self.status != ReaderStatus::Loading || fraction <= self.load_progress {
                    return false;
                }
                self.load_progress = fraction;
                true
            }
            PipelineEvent::Loaded { path, total_pages } => {
                if self.status != ReaderStatus::Loading {
                    return false;
                }
                self.load_progress = 1.0;
                self.render.attach(path, total_pages);
                info!(
                    "reader book={} ready pages={}",
                    self.doc.book_id, total_pages
                );
                self.transition(ReaderStatus::Ready);
                true
            }
            PipelineEvent::LoadFailed(e) => {
                if self.status != ReaderStatus::Loading {
                    return false;
                }
                self.fail(e.into());
                true
            }
        }
    }

    /// The pipeline task ended without a terminal event (panicked or aborted).
    fn pipeline_vanished(&mut self) {
        let err: ReaderError = match self.status {
            ReaderStatus::Resolving => MissingSourceError {
                book_id: self.doc.book_id.clone(),
            }
            .into(),
            ReaderStatus::Loading => {
                ParseError::Engine("viewer task ended without a result".to_string()).into()
            }
            _ => DownloadError::Transfer("download task ended without a result".to_string()).into(),
        };
        self.fail(err);
    }

    fn fail(&mut self, err: ReaderError) {
        warn!(
            "reader book={} failed in {:?}: {}",
            self.doc.book_id, self.status, err
        );
        self.error_message = Some(err.user_message().to_string());
        self.transition(ReaderStatus::Error);
    }

    fn transition(&mut self, next: ReaderStatus) {
        debug!(
            "reader book={} {:?} -> {:?}",
            self.doc.book_id, self.status, next
        );
        self.status = next;
        self.history.push(next);
        if self.history.len() > STATUS_HISTORY_LIMIT {
            let excess = self.history.len() - STATUS_HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

impl Drop for ReaderController {
    fn drop(&mut self) {
        self.close();
    }
}

/// Where an attempt's document comes from.
enum Target {
    /// URL already resolved from the reference the controller holds.
    Direct { url: String, destination: PathBuf },
    /// Fetch catalog metadata first, then resolve.
    Lookup {
        catalog: Arc<dyn CatalogSource>,
        doc: DocumentRef,
        cache: Arc<DocumentCache>,
    },
}

/// One attempt's background work: lookup, download, then engine load.
struct Pipeline {
    downloader: Arc<Downloader>,
    engine: Arc<dyn ViewerEngine>,
    options: DisplayOptions,
    sink: Arc<EventSink>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(self, previous: Option<JoinHandle<()>>, target: Target) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let (url, destination) = match target {
            Target::Direct { url, destination } => (url, destination),
            Target::Lookup {
                catalog,
                doc,
                cache,
            } => match self.lookup(&*catalog, doc, &cache).await {
                Some(found) => found,
                None => return,
            },
        };

        let progress_sink = Arc::clone(&self.sink);
        let downloaded = self
            .downloader
            .download(
                &url,
                &destination,
                move |progress| progress_sink.send(PipelineEvent::DownloadProgress(progress)),
                &self.cancel,
            )
            .await;

        let path = match downloaded {
            Ok(path) => path,
            Err(e) => {
                if !self.cancel.is_cancelled() {
                    self.sink.send(PipelineEvent::DownloadFailed(e));
                }
                return;
            }
        };
        self.sink.send(PipelineEvent::Downloaded(path.clone()));

        let load_sink = Arc::clone(&self.sink);
        let on_load_progress =
            move |fraction: f64| load_sink.send(PipelineEvent::LoadProgress(fraction));
        let loaded = tokio::select! {
            loaded = self.engine.load(&path, &self.options, &on_load_progress) => loaded,
            _ = self.cancel.cancelled() => {
                debug!("viewer load cancelled path={}", path.display());
                return;
            }
        };

        match loaded {
            Ok(total_pages) => self.sink.send(PipelineEvent::Loaded { path, total_pages }),
            Err(e) => self.sink.send(PipelineEvent::LoadFailed(e)),
        }
    }

    /// Refresh `doc` from the catalog and resolve it. `None` when cancelled or
    /// when no URL resolves (the failure has already been reported).
    async fn lookup(
        &self,
        catalog: &dyn CatalogSource,
        doc: DocumentRef,
        cache: &DocumentCache,
    ) -> Option<(String, PathBuf)> {
        let looked_up = tokio::select! {
            found = catalog.document_ref(&doc.book_id, doc.episode_id.as_deref()) => found,
            _ = self.cancel.cancelled() => {
                debug!("catalog lookup cancelled book={}", doc.book_id);
                return None;
            }
        };
        let doc = match looked_up {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "catalog lookup failed book={} episode={:?}: {}",
                    doc.book_id, doc.episode_id, e
                );
                doc
            }
        };

        match resolve(&doc) {
            Ok(url) => {
                let key = cache.key_for(&doc);
                let destination = cache.path(&key);
                self.sink.send(PipelineEvent::Resolved {
                    doc,
                    url: url.clone(),
                    key,
                    destination: destination.clone(),
                });
                Some((url, destination))
            }
            Err(e) => {
                self.sink.send(PipelineEvent::ResolveFailed(e));
                None
            }
        }
    }
}
