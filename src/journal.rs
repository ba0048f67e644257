//! Job-source journal: pull-based feed of crawl job descriptors, also used for
//! heartbeats, progress tags and checkpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{CrawlerError, Result};
use crate::types::JournalEntry;

#[async_trait]
pub trait JobJournal: Send + Sync {
    /// Tag-filter search, e.g. `#status:active #type:event created_at:>=1700000000`.
    async fn search(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<JournalEntry>>;

    async fn create_entry(&self, title: &str, content: &str, tags: &[String]) -> Result<JournalEntry>;

    async fn update_entry_content(&self, entry_id: &str, title: &str, content: &str) -> Result<()>;

    async fn create_tags(&self, entry_id: &str, tags: &[String]) -> Result<()>;

    async fn delete_tag(&self, entry_id: &str, tag: &str) -> Result<()>;
}

/// HTTP client for a Bugout-compatible journal API.
pub struct HttpJournal {
    client: reqwest::Client,
    api_url: String,
    journal_id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    entry_url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct EntryResponse {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    created_at: String,
}

/// Journal timestamps come without a timezone; treat them as UTC.
fn parse_created_at(raw: &str) -> Result<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp());
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| CrawlerError::Journal(format!("Invalid created_at {}: {}", raw, e)))
}

impl SearchResult {
    fn into_entry(self) -> Result<JournalEntry> {
        let id = self
            .entry_url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(JournalEntry {
            id,
            title: self.title,
            content: self.content.unwrap_or_default(),
            tags: self.tags,
            created_at: parse_created_at(&self.created_at)?,
        })
    }
}

impl HttpJournal {
    pub fn new(api_url: &str, journal_id: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            journal_id: journal_id.to_string(),
            token: token.to_string(),
        })
    }

    fn entries_url(&self) -> String {
        format!("{}/journals/{}/entries", self.api_url, self.journal_id)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CrawlerError::Journal(format!("Journal responded {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl JobJournal for HttpJournal {
    async fn search(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<JournalEntry>> {
        let url = format!("{}/journals/{}/search", self.api_url, self.journal_id);
        debug!("Journal search: {} (offset {}, limit {})", query, offset, limit);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[
                ("q", query.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
                ("content", "true".to_string()),
            ])
            .send()
            .await?;
        let body: SearchResponse = Self::check(response).await?.json().await?;

        body.results.into_iter().map(SearchResult::into_entry).collect()
    }

    async fn create_entry(&self, title: &str, content: &str, tags: &[String]) -> Result<JournalEntry> {
        let response = self
            .client
            .post(self.entries_url())
            .bearer_auth(&self.token)
            .json(&json!({ "title": title, "content": content, "tags": tags }))
            .send()
            .await?;
        let entry: EntryResponse = Self::check(response).await?.json().await?;

        Ok(JournalEntry {
            id: entry.id,
            title: entry.title,
            content: entry.content.unwrap_or_default(),
            tags: entry.tags,
            created_at: parse_created_at(&entry.created_at)?,
        })
    }

    async fn update_entry_content(&self, entry_id: &str, title: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/{}/content", self.entries_url(), entry_id))
            .bearer_auth(&self.token)
            .json(&json!({ "title": title, "content": content }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn create_tags(&self, entry_id: &str, tags: &[String]) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/{}/tags", self.entries_url(), entry_id))
            .bearer_auth(&self.token)
            .json(&json!({ "tags": tags }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_tag(&self, entry_id: &str, tag: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/{}/tags", self.entries_url(), entry_id))
            .bearer_auth(&self.token)
            .json(&json!({ "tag": tag }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
