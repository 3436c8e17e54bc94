use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{Item, PatternSuggestion, RawItem};

/// Fetches the raw item list for a target.
pub trait CrawlSource: Send + Sync + 'static {
    /// Fetch all raw items currently listed at `url`.
    fn crawl(&self, url: &str) -> BoxFuture<'_, Result<Vec<RawItem>>>;
}

/// Turns one raw item into a structured item.
pub trait ItemParser: Send + Sync + 'static {
    /// Parse a raw item. `Ok(None)` means the item was skipped.
    fn parse(&self, raw: RawItem) -> BoxFuture<'_, Result<Option<Item>>>;
}

/// Persistence with deduplication as a side effect.
pub trait Storage: Send + Sync + 'static {
    /// Store every unseen item and return only the newly inserted ones.
    fn batch_check_and_store(&self, items: Vec<Item>) -> BoxFuture<'_, Result<Vec<Item>>>;
}

/// Delivers new items to the outside world.
pub trait Notifier: Send + Sync + 'static {
    fn send(&self, items: Vec<Item>) -> BoxFuture<'_, Result<()>>;
}

/// Ranked crawl patterns that worked for similar sites.
pub trait PatternRetriever: Send + Sync + 'static {
    fn suggest_patterns(&self, url: &str, n: usize)
        -> BoxFuture<'_, Result<Vec<PatternSuggestion>>>;
}
