use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::traits::{DocumentSource, SourceInfo, SourceStream};

/// Number of body chunks buffered between the socket reader and the consumer.
const CHUNK_CHANNEL_CAPACITY: usize = 16;

pub struct HttpSource {
    client: Client,
    headers: HashMap<String, String>,
}

impl HttpSource {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self::with_client(Client::new(), headers)
    }

    pub fn with_client(client: Client, headers: HashMap<String, String>) -> Self {
        Self { client, headers }
    }

    fn build_request(&self, url: &str) -> RequestBuilder {
        let mut req = self.client.get(url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[async_trait]
impl DocumentSource for HttpSource {
    async fn open(&self, url: &str) -> Result<SourceStream> {
        let mut resp = self.build_request(url).send().await?;

        let status = resp.status();
        debug!("http open status={} url={}", status.as_u16(), url);
        if !status.is_success() {
            warn!("http open failed status={} url={}", status.as_u16(), url);
            return Err(anyhow!("download failed: HTTP {}", status.as_u16()));
        }

        let content_length = resp.content_length().filter(|len| *len > 0);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let (tx, rx) = mpsc::channel::<Result<Bytes>>(CHUNK_CHANNEL_CAPACITY);
        let url = url.to_string();
        tokio::spawn(async move {
            loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Receiver dropped (transfer cancelled).
                            debug!("http body receiver dropped url={}", url);
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!("http body read failed url={}: {}", url, e);
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });

        Ok(SourceStream {
            info: SourceInfo {
                content_length,
                content_type,
            },
            chunks: rx,
        })
    }
}
