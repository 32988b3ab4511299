// Shared fixtures: a fake document upstream and sample PDF bodies.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const PAGE_OBJECT: &str = "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>";

/// Writes a PDF body revision by revision, each closed by a classic xref table.
pub struct PdfBuilder {
    body: Vec<u8>,
    pending: Vec<(u32, usize)>,
    last_xref: Option<usize>,
    size: u32,
}

impl PdfBuilder {
    pub fn new() -> Self {
        Self {
            body: b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec(),
            pending: Vec::new(),
            last_xref: None,
            size: 1,
        }
    }

    pub fn object(mut self, id: u32, value: &str) -> Self {
        self.pending.push((id, self.body.len()));
        self.body
            .extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", id, value).as_bytes());
        self.size = self.size.max(id + 1);
        self
    }

    /// Append roughly `bytes` of comment lines.
    pub fn padding(mut self, bytes: usize) -> Self {
        for line in 0..bytes / 64 {
            let mut pad = format!("% padding line {:08}", line).into_bytes();
            pad.resize(63, b'.');
            pad.push(b'\n');
            self.body.extend_from_slice(&pad);
        }
        self
    }

    /// Close the objects written since the last revision with an xref section.
    pub fn revision(mut self) -> Self {
        let xref_at = self.body.len();
        let mut entries = std::mem::take(&mut self.pending);
        entries.sort();

        let mut xref = String::from("xref\n");
        if self.last_xref.is_none() {
            xref.push_str("0 1\n0000000000 65535 f \n");
        }
        for (id, offset) in &entries {
            xref.push_str(&format!("{} 1\n{:010} 00000 n \n", id, offset));
        }
        let prev = self
            .last_xref
            .map(|at| format!(" /Prev {}", at))
            .unwrap_or_default();
        xref.push_str(&format!(
            "trailer\n<< /Size {} /Root 1 0 R{} >>\nstartxref\n{}\n%%EOF\n",
            self.size, prev, xref_at
        ));
        self.body.extend_from_slice(xref.as_bytes());
        self.last_xref = Some(xref_at);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.body
    }
}

fn page_tree(pages: u32) -> String {
    let kids: Vec<String> = (0..pages).map(|i| format!("{} 0 R", i + 3)).collect();
    format!("<< /Type /Pages /Count {} /Kids [{}] >>", pages, kids.join(" "))
}

fn base_document(pages: u32) -> PdfBuilder {
    let mut pdf = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(2, &page_tree(pages));
    for i in 0..pages {
        pdf = pdf.object(i + 3, PAGE_OBJECT);
    }
    pdf
}

/// A valid PDF with `pages` pages, padded with about `padding` comment bytes.
pub fn sample_pdf(pages: u32, padding: usize) -> Vec<u8> {
    base_document(pages).padding(padding).revision().finish()
}

/// A PDF re-saved once: the second revision rewrites every page object.
pub fn sample_pdf_resaved(pages: u32) -> Vec<u8> {
    let mut pdf = base_document(pages).revision();
    for i in 0..pages {
        pdf = pdf.object(
            i + 3,
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Rotate 90 >>",
        );
    }
    pdf.revision().finish()
}

/// A PDF 1.5 file whose page tree and pages live in an object stream,
/// indexed by a cross-reference stream.
pub fn sample_pdf_object_streams(pages: u32) -> Vec<u8> {
    let mut body = b"%PDF-1.5\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let catalog_at = body.len();
    body.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");

    let mut packed = vec![(2, page_tree(pages))];
    packed.extend((0..pages).map(|i| (i + 3, PAGE_OBJECT.to_string())));
    let mut header = String::new();
    let mut objects = String::new();
    for (id, value) in &packed {
        header.push_str(&format!("{} {} ", id, objects.len()));
        objects.push_str(value);
        objects.push('\n');
    }
    let stream_id = pages + 3;
    let stream_at = body.len();
    body.extend_from_slice(
        format!(
            "{} 0 obj\n<< /Type /ObjStm /N {} /First {} /Length {} >>\nstream\n{}{}\nendstream\nendobj\n",
            stream_id,
            packed.len(),
            header.len(),
            header.len() + objects.len(),
            header,
            objects
        )
        .as_bytes(),
    );

    // Rows with /W [1 4 2]: type, offset or stream number, generation or index.
    let xref_id = pages + 4;
    let xref_at = body.len();
    let mut rows = Vec::new();
    let mut row = |kind: u8, field: u32, extra: u16| {
        rows.push(kind);
        rows.extend_from_slice(&field.to_be_bytes());
        rows.extend_from_slice(&extra.to_be_bytes());
    };
    row(0, 0, 0xFFFF);
    row(1, catalog_at as u32, 0);
    for index in 0..packed.len() {
        row(2, stream_id, index as u16);
    }
    row(1, stream_at as u32, 0);
    row(1, xref_at as u32, 0);

    body.extend_from_slice(
        format!(
            "{} 0 obj\n<< /Type /XRef /Size {} /W [1 4 2] /Root 1 0 R /Length {} >>\nstream\n",
            xref_id,
            xref_id + 1,
            rows.len()
        )
        .as_bytes(),
    );
    body.extend_from_slice(&rows);
    body.extend_from_slice(b"\nendstream\nendobj\n");
    body.extend_from_slice(format!("startxref\n{}\n%%EOF\n", xref_at).as_bytes());
    body
}

pub struct UpstreamState {
    docs: RwLock<HashMap<String, Vec<u8>>>,
    failures_left: AtomicU32,
    hits: AtomicU32,
}

impl UpstreamState {
    pub fn set_doc(&self, name: &str, body: Vec<u8>) {
        self.docs.write().insert(name.to_string(), body);
    }

    /// Answer the next `n` requests with HTTP 500.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

pub struct Upstream {
    pub addr: SocketAddr,
    pub state: Arc<UpstreamState>,
}

impl Upstream {
    pub fn url(&self, name: &str) -> String {
        format!("http://{}/docs/{}", self.addr, name)
    }
}

async fn serve_doc(
    State(state): State<Arc<UpstreamState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let should_fail = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if should_fail {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream unavailable").into_response();
    }

    let body = state.docs.read().get(&name).cloned();
    match body {
        Some(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (header::CONTENT_LENGTH, body.len().to_string()),
            ],
            body,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "no such document").into_response(),
    }
}

pub async fn start_upstream(docs: Vec<(&str, Vec<u8>)>) -> Upstream {
    let state = Arc::new(UpstreamState {
        docs: RwLock::new(
            docs.into_iter()
                .map(|(name, body)| (name.to_string(), body))
                .collect(),
        ),
        failures_left: AtomicU32::new(0),
        hits: AtomicU32::new(0),
    });
    let app = Router::new()
        .route("/docs/{name}", get(serve_doc))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Upstream { addr, state }
}

type Tables = Arc<HashMap<String, Vec<Value>>>;

async fn serve_rows(
    State(tables): State<Tables>,
    Path(table): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(rows) = tables.get(&table) else {
        return (StatusCode::NOT_FOUND, "no such table").into_response();
    };
    let is_match = |row: &Value| {
        params
            .iter()
            .filter(|(column, _)| column.as_str() != "select")
            .all(|(column, filter)| {
                let wanted = filter.strip_prefix("eq.").unwrap_or(filter);
                match row.get(column) {
                    Some(Value::String(s)) => s == wanted,
                    Some(other) => other.to_string() == wanted,
                    None => false,
                }
            })
    };
    let found: Vec<Value> = rows.iter().filter(|row| is_match(*row)).cloned().collect();
    Json(found).into_response()
}

/// PostgREST-style catalog serving `books` and `episodes`; returns its base URL.
pub async fn start_catalog(books: Vec<Value>, episodes: Vec<Value>) -> String {
    let tables: Tables = Arc::new(HashMap::from([
        ("books".to_string(), books),
        ("episodes".to_string(), episodes),
    ]));
    let app = Router::new()
        .route("/rest/v1/{table}", get(serve_rows))
        .with_state(tables);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}/rest/v1", addr)
}

/// Raw HTTP server that announces `announced` bytes, sends `sent` of them, then
/// either drops the connection (`hang = false`) or keeps it open without sending more.
pub async fn start_partial_server(announced: usize, sent: usize, hang: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/pdf\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    announced
                );
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.write_all(&vec![b'%'; sent]).await;
                let _ = socket.flush().await;
                if hang {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            });
        }
    });
    addr
}

/// Poll `cond` for up to two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
