//! In-memory collaborators and fixtures shared by the Harvest test suites.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::{CrawlSource, ItemParser, Notifier, PatternRetriever, Storage};
use harvest_core::types::{CrawlPattern, Item, PatternSuggestion, RawItem};

/// A raw item with a title, url and body.
pub fn raw_item(title: &str, url: &str, content: &str) -> RawItem {
    RawItem {
        title: title.to_string(),
        url: url.to_string(),
        content: content.to_string(),
        timestamp: Some("2024-05-01T08:00:00Z".to_string()),
        source: "news.test".to_string(),
        kind: "article".to_string(),
    }
}

/// `n` well-formed articles under `https://news.test/articles/`.
pub fn news_items(n: usize) -> Vec<RawItem> {
    (0..n)
        .map(|i| {
            raw_item(
                &format!("Technology briefing number {i} on new AI chips"),
                &format!("https://news.test/articles/{i}"),
                "A long enough body describing the technology story in detail, well past fifty characters.",
            )
        })
        .collect()
}

/// Parsed form of [`news_items`].
pub fn parsed_news_items(n: usize) -> Vec<Item> {
    news_items(n).into_iter().map(Item::from).collect()
}

/// Always returns the same items.
pub struct StaticCrawlSource {
    items: Vec<RawItem>,
    calls: AtomicUsize,
}

impl StaticCrawlSource {
    pub fn new(items: Vec<RawItem>) -> Self {
        Self {
            items,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CrawlSource for StaticCrawlSource {
    fn crawl(&self, _url: &str) -> BoxFuture<'_, Result<Vec<RawItem>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items = self.items.clone();
        Box::pin(async move { Ok(items) })
    }
}

/// Fails every crawl with the given message.
pub struct FailingCrawlSource {
    message: String,
}

impl FailingCrawlSource {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl CrawlSource for FailingCrawlSource {
    fn crawl(&self, _url: &str) -> BoxFuture<'_, Result<Vec<RawItem>>> {
        let message = self.message.clone();
        Box::pin(async move { Err(HarvestError::Crawl(message)) })
    }
}

/// Converts raw items one to one. Items without a url are skipped and
/// items titled `"!malformed"` fail to parse.
pub struct PassthroughParser;

impl ItemParser for PassthroughParser {
    fn parse(&self, raw: RawItem) -> BoxFuture<'_, Result<Option<Item>>> {
        Box::pin(async move {
            if raw.title == "!malformed" {
                return Err(HarvestError::Parse(format!("malformed item {}", raw.url)));
            }
            if raw.url.is_empty() {
                return Ok(None);
            }
            Ok(Some(Item::from(raw)))
        })
    }
}

/// Deduplicates by url in memory.
#[derive(Default)]
pub struct MemoryStorage {
    seen: Mutex<HashSet<String>>,
    stored: Mutex<Vec<Item>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `urls` already stored.
    pub fn with_seen<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seen: Mutex::new(urls.into_iter().map(Into::into).collect()),
            stored: Mutex::new(vec![]),
        }
    }

    pub async fn stored(&self) -> Vec<Item> {
        self.stored.lock().await.clone()
    }
}

impl Storage for MemoryStorage {
    fn batch_check_and_store(&self, items: Vec<Item>) -> BoxFuture<'_, Result<Vec<Item>>> {
        Box::pin(async move {
            let mut seen = self.seen.lock().await;
            let fresh: Vec<Item> = items
                .into_iter()
                .filter(|item| seen.insert(item.url.clone()))
                .collect();
            self.stored.lock().await.extend(fresh.iter().cloned());
            Ok(fresh)
        })
    }
}

/// Rejects every write.
pub struct FailingStorage;

impl Storage for FailingStorage {
    fn batch_check_and_store(&self, _items: Vec<Item>) -> BoxFuture<'_, Result<Vec<Item>>> {
        Box::pin(async { Err(HarvestError::Storage("disk full".into())) })
    }
}

/// Records every batch it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    batches: Mutex<Vec<Vec<Item>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<Vec<Item>> {
        self.batches.lock().await.clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, items: Vec<Item>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.batches.lock().await.push(items);
            Ok(())
        })
    }
}

/// Returns a fixed ranked list, truncated to `n`.
pub struct StaticPatternRetriever {
    suggestions: Vec<PatternSuggestion>,
}

impl StaticPatternRetriever {
    pub fn new(suggestions: Vec<PatternSuggestion>) -> Self {
        Self { suggestions }
    }

    /// A single suggestion carrying a timeout and a concurrency limit.
    pub fn with_tuned_pattern() -> Self {
        let pattern = CrawlPattern {
            crawler: "static".into(),
            target_url: "https://news.test".into(),
            timeout_secs: Some(20.0),
            concurrency: Some(2),
            ..CrawlPattern::default()
        };
        Self::new(vec![PatternSuggestion {
            pattern,
            similarity: 0.92,
            success_rate: 0.88,
        }])
    }
}

impl PatternRetriever for StaticPatternRetriever {
    fn suggest_patterns(
        &self,
        _url: &str,
        n: usize,
    ) -> BoxFuture<'_, Result<Vec<PatternSuggestion>>> {
        let out: Vec<PatternSuggestion> = self.suggestions.iter().take(n).cloned().collect();
        Box::pin(async move { Ok(out) })
    }
}
