use std::collections::HashMap;

use serde::Deserialize;

/// File extension used for cached documents.
pub const CACHE_FILE_EXTENSION: &str = "pdf";

/// Suffix appended to the cache path while a transfer is in flight.
pub const PARTIAL_FILE_SUFFIX: &str = "part";

/// Smallest zoom factor the viewer accepts.
pub const MIN_ZOOM_SCALE: f64 = 1.0;

/// Largest zoom factor the viewer accepts.
pub const MAX_ZOOM_SCALE: f64 = 3.0;

/// Bytes inspected for a format signature before handing a file to the engine.
pub const FORMAT_SNIFF_BYTES: usize = 1024;

/// Status transitions kept for inspection; older entries are dropped first.
pub const STATUS_HISTORY_LIMIT: usize = 32;

/// Cache file naming policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyPolicy {
    /// One slot per book; opening another episode overwrites the file.
    #[default]
    BookOnly,
    /// One slot per (book, episode) pair.
    BookAndEpisode,
}

/// Top-level configuration for a reader session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Document-storage root under which cached files are written.
    pub storage_root: String,
    pub cache_key_policy: CacheKeyPolicy,
    pub min_zoom: f64,
    pub max_zoom: f64,
    /// Gap between pages handed to the viewer, in points.
    pub page_gap: u32,
    pub fit_width: bool,
    /// Static headers sent with every document request.
    pub request_headers: HashMap<String, String>,
    /// Base URL of the catalog REST endpoint (empty when unused).
    pub catalog_base_url: String,
}

impl ReaderConfig {
    pub fn with_storage_root(storage_root: impl Into<String>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    pub fn clamp_zoom(&self, scale: f64) -> f64 {
        if !scale.is_finite() {
            return self.min_zoom;
        }
        scale.clamp(self.min_zoom, self.max_zoom.max(self.min_zoom))
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            storage_root: String::new(),
            cache_key_policy: CacheKeyPolicy::BookOnly,
            min_zoom: MIN_ZOOM_SCALE,
            max_zoom: MAX_ZOOM_SCALE,
            page_gap: 0,
            fit_width: true,
            request_headers: HashMap::new(),
            catalog_base_url: String::new(),
        }
    }
}
