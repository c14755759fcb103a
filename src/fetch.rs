// src/fetch.rs
//! Content fetching boundary: trait for the scheduler, HTTP implementation,
//! and the HTML-to-text cleaning applied before fingerprinting.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("http status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub content: String,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError>;
}

/// Default fetcher: GET the URL, strip markup, collapse whitespace.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let fut = async {
            let resp = self
                .client
                .get(url)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            resp.text()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))
        };
        let body = match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res?,
            Err(_) => return Err(FetchError::Timeout(self.timeout)),
        };
        Ok(FetchedContent {
            content: clean_content(&body),
            fetched_at: Utc::now(),
        })
    }
}

/// Reduce raw HTML to comparable plain text.
pub fn clean_content(s: &str) -> String {
    // 1) Drop script/style blocks wholesale
    static RE_BLOCKS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_blocks = RE_BLOCKS
        .get_or_init(|| regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
    let mut out = re_blocks.replace_all(s, " ").to_string();

    // 2) Block-level tags become line breaks so paragraph structure survives
    static RE_BREAKS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_breaks = RE_BREAKS
        .get_or_init(|| regex::Regex::new(r"(?i)</?(p|div|br|li|h[1-6]|tr|section|article)[^>]*>").unwrap());
    out = re_breaks.replace_all(&out, "\n").to_string();

    // 3) Strip remaining tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 4) HTML entity decode
    out = html_escape::decode_html_entities(&out).to_string();

    // 5) Normalize curly quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 6) Collapse horizontal whitespace per line, then blank-line runs
    static RE_HWS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_hws = RE_HWS.get_or_init(|| regex::Regex::new(r"[ \t\r\x{A0}]+").unwrap());
    out = re_hws.replace_all(&out, " ").to_string();
    static RE_NL: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_nl = RE_NL.get_or_init(|| regex::Regex::new(r" ?\n[ \n]*").unwrap());
    out = re_nl.replace_all(&out, "\n").to_string();

    out.trim().to_string()
}
