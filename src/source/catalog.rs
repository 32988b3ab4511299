// Catalog metadata lookup: builds a DocumentRef from book/episode rows.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::locator::DocumentRef;

/// One catalog row. Rows published over time carry either or both URL spellings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogRow {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "pdfUrl")]
    pub pdf_url_camel: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub issue_number: Option<Value>,
}

impl CatalogRow {
    /// Row id as text; numeric and string ids are both accepted.
    pub fn id_string(&self) -> Option<String> {
        match &self.id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Table-of-contents entry for one episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeSummary {
    pub id: String,
    pub title: Option<String>,
    pub issue_number: Option<String>,
    /// Whether the row itself carries a document URL.
    pub has_document: bool,
}

impl EpisodeSummary {
    /// `None` for rows without a usable id.
    pub fn from_row(row: &CatalogRow) -> Option<Self> {
        let has_url = |url: &Option<String>| url.as_deref().is_some_and(|u| !u.trim().is_empty());
        Some(Self {
            id: row.id_string()?,
            title: row.title.clone(),
            issue_number: match &row.issue_number {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            },
            has_document: has_url(&row.pdf_url_camel) || has_url(&row.pdf_url),
        })
    }
}

/// Combine a book row and an optional episode row into a document reference.
pub fn document_ref_from_rows(
    book: &CatalogRow,
    episode: Option<&CatalogRow>,
) -> Result<DocumentRef> {
    let book_id = book
        .id_string()
        .ok_or_else(|| anyhow!("catalog book row has no id"))?;
    Ok(DocumentRef {
        book_id,
        episode_id: episode.and_then(CatalogRow::id_string),
        episode_primary: episode.and_then(|e| e.pdf_url_camel.clone()),
        episode_alternate: episode.and_then(|e| e.pdf_url.clone()),
        book_primary: book.pdf_url_camel.clone(),
        book_alternate: book.pdf_url.clone(),
    })
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn book(&self, book_id: &str) -> Result<CatalogRow>;
    async fn episode(&self, episode_id: &str) -> Result<CatalogRow>;
    async fn list_episodes(&self, book_id: &str) -> Result<Vec<CatalogRow>>;

    async fn document_ref(&self, book_id: &str, episode_id: Option<&str>) -> Result<DocumentRef> {
        let book = self.book(book_id).await?;
        let episode = match episode_id {
            Some(id) => Some(self.episode(id).await?),
            None => None,
        };
        document_ref_from_rows(&book, episode.as_ref())
    }
}

/// PostgREST-style JSON catalog: `GET {base}/{table}?{column}=eq.{value}`.
pub struct HttpCatalog {
    client: Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn select(&self, table: &str, column: &str, value: &str) -> Result<Vec<CatalogRow>> {
        let url = format!("{}/{}", self.base_url, table);
        let filter = format!("eq.{}", value);
        let resp = self
            .client
            .get(&url)
            .query(&[("select", "*"), (column, filter.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            warn!("catalog query failed status={} table={}", status.as_u16(), table);
            return Err(anyhow!("catalog query failed: HTTP {}", status.as_u16()));
        }

        let rows: Vec<CatalogRow> = resp.json().await?;
        debug!("catalog {} {}={} rows={}", table, column, value, rows.len());
        Ok(rows)
    }

    async fn select_one(&self, table: &str, id: &str) -> Result<CatalogRow> {
        self.select(table, "id", id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} row {} not found", table, id))
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn book(&self, book_id: &str) -> Result<CatalogRow> {
        self.select_one("books", book_id).await
    }

    async fn episode(&self, episode_id: &str) -> Result<CatalogRow> {
        self.select_one("episodes", episode_id).await
    }

    async fn list_episodes(&self, book_id: &str) -> Result<Vec<CatalogRow>> {
        self.select("episodes", "book_id", book_id).await
    }
}
