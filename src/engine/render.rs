// Render session: viewer state (page, zoom, orientation, paging) and the engine seam.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pdf::file::FileOptions;
use thiserror::Error;
use tracing::debug;

use crate::config::ReaderConfig;
use crate::detect::document::{detect_document, DocumentFormat};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported document format: {0}")]
    Unsupported(&'static str),
    #[error("malformed pdf: {0}")]
    Malformed(String),
    #[error("document has no pages")]
    NoPages,
    #[error("viewer engine error: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    Horizontal,
    #[default]
    Vertical,
}

impl Orientation {
    pub fn toggled(self) -> Self {
        match self {
            Orientation::Horizontal => Orientation::Vertical,
            Orientation::Vertical => Orientation::Horizontal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
    #[default]
    Continuous,
    Paged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderViewState {
    /// 1-based.
    pub current_page: u32,
    pub total_pages: u32,
    pub zoom_scale: f64,
    pub orientation: Orientation,
    pub paging_mode: PagingMode,
}

impl Default for ReaderViewState {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_pages: 0,
            zoom_scale: 1.0,
            orientation: Orientation::Vertical,
            paging_mode: PagingMode::Continuous,
        }
    }
}

/// Options handed to the viewer engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayOptions {
    pub fit_width: bool,
    pub orientation: Orientation,
    pub paging_enabled: bool,
    pub page_gap: u32,
}

#[async_trait]
pub trait ViewerEngine: Send + Sync {
    /// Parse the document at `path` and return its page count.
    async fn load(
        &self,
        path: &Path,
        options: &DisplayOptions,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<u32, ParseError>;
}

/// Built-in engine backed by the `pdf` crate: opens the document and reads
/// its page count from the catalog's page tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfEngine;

#[async_trait]
impl ViewerEngine for PdfEngine {
    async fn load(
        &self,
        path: &Path,
        options: &DisplayOptions,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<u32, ParseError> {
        let data = tokio::fs::read(path).await.map_err(|source| ParseError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let format = detect_document(&data);
        if format != DocumentFormat::Pdf {
            return Err(ParseError::Unsupported(format.label()));
        }

        on_progress(0.0);
        // Parsing walks the xref chain and object streams; keep it off the async workers.
        let pages = tokio::task::spawn_blocking(move || page_count(data))
            .await
            .map_err(|e| ParseError::Engine(e.to_string()))??;
        on_progress(1.0);

        debug!(
            "pdf loaded path={} pages={} orientation={:?} paging={}",
            path.display(),
            pages,
            options.orientation,
            options.paging_enabled
        );
        Ok(pages)
    }
}

/// `/Count` of the root page tree in the newest revision of the document.
fn page_count(data: Vec<u8>) -> Result<u32, ParseError> {
    let file = FileOptions::cached()
        .load(data)
        .map_err(|e| ParseError::Malformed(e.to_string()))?;
    match file.num_pages() {
        0 => Err(ParseError::NoPages),
        pages => Ok(pages),
    }
}

pub struct RenderSession {
    view: ReaderViewState,
    /// Last explicit paging choice, restored when returning to Horizontal.
    preferred_paging: PagingMode,
    document: Option<PathBuf>,
    min_zoom: f64,
    max_zoom: f64,
    page_gap: u32,
    fit_width: bool,
}

impl RenderSession {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            view: ReaderViewState {
                zoom_scale: config.clamp_zoom(1.0),
                ..ReaderViewState::default()
            },
            preferred_paging: PagingMode::Continuous,
            document: None,
            min_zoom: config.min_zoom,
            max_zoom: config.max_zoom.max(config.min_zoom),
            page_gap: config.page_gap,
            fit_width: config.fit_width,
        }
    }

    pub fn view(&self) -> &ReaderViewState {
        &self.view
    }

    pub fn document(&self) -> Option<&Path> {
        self.document.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.document.is_some()
    }

    /// Bind a parsed document; the reader opens on page 1.
    pub fn attach(&mut self, path: PathBuf, total_pages: u32) {
        self.document = Some(path);
        self.view.total_pages = total_pages;
        self.view.current_page = 1;
    }

    /// Drop the bound document, keeping orientation, paging and zoom preferences.
    pub fn detach(&mut self) {
        self.document = None;
        self.view.total_pages = 0;
        self.view.current_page = 1;
    }

    /// Returns the page actually applied (clamped to the document).
    pub fn set_page(&mut self, page: u32) -> u32 {
        let last = self.view.total_pages.max(1);
        self.view.current_page = page.clamp(1, last);
        self.view.current_page
    }

    pub fn set_zoom(&mut self, scale: f64) -> f64 {
        self.view.zoom_scale = if scale.is_finite() {
            scale.clamp(self.min_zoom, self.max_zoom)
        } else {
            self.min_zoom
        };
        self.view.zoom_scale
    }

    /// Vertical always reads continuously; Horizontal restores the last explicit choice.
    pub fn toggle_orientation(&mut self) -> Orientation {
        self.view.orientation = self.view.orientation.toggled();
        self.view.paging_mode = match self.view.orientation {
            Orientation::Vertical => PagingMode::Continuous,
            Orientation::Horizontal => self.preferred_paging,
        };
        self.view.orientation
    }

    /// Record an explicit paging choice. `Paged` is refused while Vertical.
    pub fn set_paging_mode(&mut self, mode: PagingMode) -> bool {
        if mode == PagingMode::Paged && self.view.orientation == Orientation::Vertical {
            return false;
        }
        self.preferred_paging = mode;
        self.view.paging_mode = mode;
        true
    }

    pub fn display_options(&self) -> DisplayOptions {
        DisplayOptions {
            fit_width: self.fit_width,
            orientation: self.view.orientation,
            paging_enabled: self.view.paging_mode == PagingMode::Paged,
            page_gap: self.page_gap,
        }
    }
}
