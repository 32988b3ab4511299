// Document location: ordered fallback over the URL fields of a document.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no document url available for book {book_id}")]
pub struct MissingSourceError {
    pub book_id: String,
}

/// Identity and candidate locations of one readable document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentRef {
    pub book_id: String,
    pub episode_id: Option<String>,
    pub episode_primary: Option<String>,
    pub episode_alternate: Option<String>,
    pub book_primary: Option<String>,
    pub book_alternate: Option<String>,
}

impl DocumentRef {
    pub fn new(book_id: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            ..Self::default()
        }
    }

    pub fn with_episode(mut self, episode_id: impl Into<String>) -> Self {
        self.episode_id = Some(episode_id.into());
        self
    }

    /// Candidate URLs in resolution order.
    pub fn candidate_urls(&self) -> [Option<&str>; 4] {
        [
            self.episode_primary.as_deref(),
            self.episode_alternate.as_deref(),
            self.book_primary.as_deref(),
            self.book_alternate.as_deref(),
        ]
    }
}

/// Return the first non-blank candidate URL, trimmed.
pub fn resolve(doc: &DocumentRef) -> Result<String, MissingSourceError> {
    doc.candidate_urls()
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|url| !url.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MissingSourceError {
            book_id: doc.book_id.clone(),
        })
}
