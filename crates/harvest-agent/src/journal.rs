use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use harvest_core::event::{EventBus, WorkflowEvent};

/// JSONL journal of workflow events.
///
/// One JSON object per line, flushed after every entry so a crashed process
/// leaves every earlier line intact. Lines from different runs are told apart
/// by their `run_id`.
pub struct RunJournal {
    path: PathBuf,
}

#[derive(Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a WorkflowEvent,
}

impl RunJournal {
    /// Journal into `{dir}/{timestamp}.jsonl`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        Self {
            path: dir.as_ref().join(format!("{timestamp}.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to `events` immediately and write in the background.
    ///
    /// Events already queued when `cancel` fires are still written.
    pub fn spawn(self, events: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = events.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Some(dir) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                error!(error = %e, "Failed to create journal directory");
                return;
            }
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "Failed to open journal");
                return;
            }
        };
        info!(path = %self.path.display(), "Run journal started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut written = 0usize;

        loop {
            let event = tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Journal lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed, journal stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            let entry = JournalEntry {
                timestamp: Utc::now().to_rfc3339(),
                event: &event,
            };
            let Ok(json) = serde_json::to_string(&entry) else {
                continue;
            };
            if let Err(e) = writer.write_all(format!("{json}\n").as_bytes()).await {
                error!(error = %e, "Failed to write journal entry");
                break;
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush journal");
            }
            written += 1;
        }

        writer.flush().await.ok();
        debug!(path = %self.path.display(), entries = written, "Run journal finished");
    }
}
