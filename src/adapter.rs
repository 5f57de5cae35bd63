use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::browser::ExecutionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    NotStarted,
    InProgress,
    HalfTime,
    Finished,
}

impl MatchStatus {
    /// Map the status labels sites commonly print. A bare number is a
    /// running clock minute.
    pub fn parse(label: &str) -> Option<MatchStatus> {
        let label = label.trim().to_lowercase();
        if label.trim_end_matches('\'').parse::<u32>().is_ok() {
            return Some(MatchStatus::InProgress);
        }
        match label.as_str() {
            "" => None,
            "not started" | "not_started" | "ns" | "scheduled" | "pregame" => {
                Some(MatchStatus::NotStarted)
            }
            "half time" | "half_time" | "halftime" | "ht" => Some(MatchStatus::HalfTime),
            "finished" | "match finished" | "ft" | "final" | "aet" | "pen" | "ended"
            | "postponed" | "cancelled" | "abandoned" => Some(MatchStatus::Finished),
            "live" | "in progress" | "in_progress" | "1h" | "2h" | "et" => {
                Some(MatchStatus::InProgress)
            }
            _ => None,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, MatchStatus::InProgress | MatchStatus::HalfTime)
    }
}

/// Keys owned by the fixed part of a serialized `MatchRecord`.
const RESERVED_KEYS: [&str; 3] = ["adapter", "source_url", "status"];

/// One scraped match. `adapter` and `source_url` record provenance; the
/// remaining domain fields are adapter-specific and never shadow them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub adapter: String,
    pub source_url: String,
    #[serde(default)]
    pub status: Option<MatchStatus>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl MatchRecord {
    pub fn new(adapter: &str, source_url: &str) -> Self {
        MatchRecord {
            adapter: adapter.to_string(),
            source_url: source_url.to_string(),
            status: None,
            fields: Map::new(),
        }
    }

    pub fn with_status(mut self, status: Option<MatchStatus>) -> Self {
        self.status = status;
        self
    }

    /// Attach an adapter-specific field. Reserved keys are dropped.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if RESERVED_KEYS.contains(&key) {
            warn!("[{}] Ignoring field '{}': reserved key", self.adapter, key);
            return self;
        }
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("serialize match record")
    }
}

/// Site-specific extraction plugged into the orchestrator.
#[async_trait]
pub trait MatchAdapter: Send + Sync {
    /// Source name used for provenance, breakers and reliability scores.
    fn name(&self) -> &str;

    fn supports(&self, url: &Url) -> bool;

    /// `Ok(None)` means the page loaded but holds no match data.
    async fn fetch_match(&self, ctx: &dyn ExecutionContext, url: &str)
        -> Result<Option<MatchRecord>>;
}

/// Ordered adapter list; the first adapter that supports a URL wins.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn MatchAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn MatchAdapter>) -> &mut Self {
        self.adapters.push(adapter);
        self
    }

    pub fn resolve(&self, url: &Url) -> Option<Arc<dyn MatchAdapter>> {
        self.adapters.iter().find(|a| a.supports(url)).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

const TEXT_EXCERPT_CHARS: usize = 500;

const PAGE_PROBE_JS: &str = r#"(() => {
    const el = document.querySelector('[data-match-status]');
    const meta = document.querySelector('meta[name="match:status"]');
    return {
        title: document.title || "",
        text: (document.body ? document.body.innerText : "").slice(0, 4000),
        status: el ? el.getAttribute('data-match-status') : (meta ? meta.content : null)
    };
})()"#;

/// Fallback adapter for any http(s) page: title, a text excerpt, and the
/// status a page declares via `data-match-status` or a `match:status` meta tag.
pub struct GenericPageAdapter;

#[async_trait]
impl MatchAdapter for GenericPageAdapter {
    fn name(&self) -> &str {
        "generic"
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn fetch_match(
        &self,
        ctx: &dyn ExecutionContext,
        url: &str,
    ) -> Result<Option<MatchRecord>> {
        ctx.navigate(url).await?;
        let probe = ctx.evaluate(PAGE_PROBE_JS).await?;
        Ok(record_from_probe(self.name(), url, &probe))
    }
}

fn record_from_probe(adapter: &str, url: &str, probe: &Value) -> Option<MatchRecord> {
    let title = probe["title"].as_str().unwrap_or_default().trim();
    let text = probe["text"].as_str().unwrap_or_default().trim();
    let status = probe["status"].as_str().and_then(MatchStatus::parse);
    if title.is_empty() && text.is_empty() && status.is_none() {
        return None;
    }
    let excerpt: String = text.chars().take(TEXT_EXCERPT_CHARS).collect();
    Some(
        MatchRecord::new(adapter, url)
            .with_status(status)
            .with_field("title", json!(title))
            .with_field("text_excerpt", json!(excerpt)),
    )
}
