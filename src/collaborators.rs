//! Local collaborators for the command line: a JSON feed file stands in for
//! the network, items are kept in memory and new ones are logged.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::{CrawlSource, ItemParser, Notifier, Storage};
use harvest_core::types::{Item, RawItem};

/// A feed file is either one listing for every url or listings keyed by url.
#[derive(Deserialize)]
#[serde(untagged)]
enum Feed {
    Listing(Vec<RawItem>),
    Sites(HashMap<String, Vec<RawItem>>),
}

pub struct JsonFeedSource {
    path: PathBuf,
}

impl JsonFeedSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CrawlSource for JsonFeedSource {
    fn crawl(&self, url: &str) -> BoxFuture<'_, Result<Vec<RawItem>>> {
        let url = url.to_string();
        Box::pin(async move {
            let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                HarvestError::Crawl(format!("{}: {e}", self.path.display()))
            })?;
            let feed: Feed = serde_json::from_str(&content)?;
            let items = match feed {
                Feed::Listing(items) => items,
                Feed::Sites(mut sites) => sites
                    .remove(&url)
                    .ok_or_else(|| HarvestError::Crawl(format!("no listing for {url}")))?,
            };
            debug!(url = %url, items = items.len(), "Read feed listing");
            Ok(items)
        })
    }
}

/// Trims fields, collapses whitespace in the body and drops items without a url.
pub struct NormalizingParser;

impl ItemParser for NormalizingParser {
    fn parse(&self, raw: RawItem) -> BoxFuture<'_, Result<Option<Item>>> {
        Box::pin(async move {
            let url = raw.url.trim().to_string();
            if url.is_empty() {
                return Ok(None);
            }
            let mut item = Item::from(raw);
            item.url = url;
            item.title = item.title.trim().to_string();
            item.content = item.content.split_whitespace().collect::<Vec<_>>().join(" ");
            Ok(Some(item))
        })
    }
}

/// Remembers stored urls for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    seen: Mutex<HashSet<String>>,
}

impl Storage for MemoryStore {
    fn batch_check_and_store(&self, items: Vec<Item>) -> BoxFuture<'_, Result<Vec<Item>>> {
        Box::pin(async move {
            let mut seen = self.seen.lock().await;
            Ok(items
                .into_iter()
                .filter(|item| seen.insert(item.url.clone()))
                .collect())
        })
    }
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, items: Vec<Item>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            for item in &items {
                info!(title = %item.title, url = %item.url, "New item");
            }
            Ok(())
        })
    }
}
