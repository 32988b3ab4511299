// Reader handle: runs one controller on its own task and exposes commands/snapshots.
// Also the catalog entry points used by the reader screens.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::ReaderConfig;
use crate::engine::controller::{ReaderController, ReaderSnapshot};
use crate::engine::locator::DocumentRef;
use crate::engine::render::PagingMode;
use crate::source::catalog::{CatalogSource, EpisodeSummary, HttpCatalog};

#[derive(Debug, Clone, PartialEq)]
enum ReaderCommand {
    TogglePagination,
    ToggleOrientation,
    Retry,
    PageChanged(u32),
    SetZoom(f64),
    SetPagingMode(PagingMode),
    Close,
}

#[flutter_rust_bridge::frb(opaque)]
pub struct ReaderHandle {
    commands: mpsc::UnboundedSender<ReaderCommand>,
    snapshots: watch::Receiver<ReaderSnapshot>,
}

impl ReaderHandle {
    /// Start `controller` on a driver task. Must be called inside a tokio runtime.
    pub fn spawn(mut controller: ReaderController) -> Self {
        controller.start();
        let (snapshot_tx, snapshot_rx) = watch::channel(controller.snapshot());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(controller, command_rx, snapshot_tx));
        Self {
            commands: command_tx,
            snapshots: snapshot_rx,
        }
    }

    pub fn snapshot(&self) -> ReaderSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait for the next published snapshot. `None` once the reader is closed.
    pub async fn changed(&mut self) -> Option<ReaderSnapshot> {
        self.snapshots.changed().await.ok()?;
        Some(self.snapshots.borrow_and_update().clone())
    }

    pub fn toggle_orientation(&self) {
        self.send(ReaderCommand::ToggleOrientation);
    }

    /// Flip between paged and continuous reading (only honoured when Horizontal).
    pub fn toggle_pagination(&self) {
        self.send(ReaderCommand::TogglePagination);
    }

    pub fn retry(&self) {
        self.send(ReaderCommand::Retry);
    }

    pub fn page_changed(&self, page: u32) {
        self.send(ReaderCommand::PageChanged(page));
    }

    pub fn set_zoom(&self, scale: f64) {
        self.send(ReaderCommand::SetZoom(scale));
    }

    pub fn set_paging_mode(&self, mode: PagingMode) {
        self.send(ReaderCommand::SetPagingMode(mode));
    }

    pub fn close(&self) {
        self.send(ReaderCommand::Close);
    }

    fn send(&self, cmd: ReaderCommand) {
        if self.commands.send(cmd).is_err() {
            debug!("reader command dropped: driver already stopped");
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(ReaderCommand::Close);
    }
}

/// Open a reader for a document whose candidate URLs are already known.
pub async fn open_reader(doc: DocumentRef, config: ReaderConfig) -> ReaderHandle {
    ReaderHandle::spawn(ReaderController::with_defaults(doc, &config))
}

/// Open a reader whose document is looked up in the catalog.
///
/// The lookup runs inside the reader's `Resolving` phase and is cancelled with
/// it. A failed lookup leaves the reference without candidate URLs, so the
/// reader reports the missing source through its normal error state.
pub async fn open_reader_from_catalog(
    book_id: String,
    episode_id: Option<String>,
    config: ReaderConfig,
) -> ReaderHandle {
    let catalog = Arc::new(HttpCatalog::new(config.catalog_base_url.clone()));
    let doc = DocumentRef {
        episode_id,
        ..DocumentRef::new(book_id)
    };
    ReaderHandle::spawn(ReaderController::with_defaults(doc, &config).with_catalog(catalog))
}

/// Episodes of a book, in catalog order, skipping rows without an id.
pub async fn list_episodes(book_id: String, config: ReaderConfig) -> Result<Vec<EpisodeSummary>> {
    let catalog = HttpCatalog::new(config.catalog_base_url);
    let rows = catalog.list_episodes(&book_id).await?;
    Ok(rows.iter().filter_map(EpisodeSummary::from_row).collect())
}

async fn drive(
    mut controller: ReaderController,
    mut commands: mpsc::UnboundedReceiver<ReaderCommand>,
    snapshots: watch::Sender<ReaderSnapshot>,
) {
    loop {
        let busy = controller.status().is_busy();
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    None | Some(ReaderCommand::Close) => {
                        controller.close();
                        break;
                    }
                    Some(cmd) => apply_command(&mut controller, cmd),
                }
            }
            update = controller.next_update(), if busy => {
                if update.is_none() {
                    continue;
                }
            }
        }
        snapshots.send_replace(controller.snapshot());
    }
    debug!("reader driver for book={} stopped", controller.document().book_id);
}

fn apply_command(controller: &mut ReaderController, cmd: ReaderCommand) {
    let accepted = match cmd {
        ReaderCommand::ToggleOrientation => controller.toggle_orientation(),
        ReaderCommand::TogglePagination => {
            let next = match controller.snapshot().paging_mode {
                PagingMode::Paged => PagingMode::Continuous,
                PagingMode::Continuous => PagingMode::Paged,
            };
            controller.set_paging_mode(next)
        }
        ReaderCommand::Retry => controller.retry(),
        ReaderCommand::PageChanged(page) => controller.on_page_changed(page),
        ReaderCommand::SetZoom(scale) => controller.set_zoom(scale),
        ReaderCommand::SetPagingMode(mode) => controller.set_paging_mode(mode),
        ReaderCommand::Close => {
            controller.close();
            true
        }
    };
    if !accepted {
        debug!("reader command ignored in {:?}", controller.status());
    }
}
