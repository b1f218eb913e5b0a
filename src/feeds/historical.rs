//! Historical replay client - JSON-lines record files replayed in order
//!
//! Files are fetched ahead of the replay cursor by short-lived tokio tasks,
//! at most `download_concurrency` at a time. File order is kept.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{KeepGoing, MarketDataProvider, RawRecord, RecordCallback, SessionEnd};
use crate::core::config::HistoricalConfig;
use crate::core::{Error, Result};

pub struct HistoricalReplayClient {
    files: Vec<PathBuf>,
    download_concurrency: usize,
    /// Files fully replayed; a retry resumes after them
    next_file: usize,
    skipped_lines: u64,
}

impl HistoricalReplayClient {
    pub fn new(files: Vec<PathBuf>, download_concurrency: usize) -> Self {
        Self { files, download_concurrency: download_concurrency.max(1), next_file: 0, skipped_lines: 0 }
    }

    pub fn from_config(config: &HistoricalConfig) -> Self {
        Self::new(config.files.clone(), config.download_concurrency)
    }

    /// Lines that did not parse as records.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }
}

/// Records replayed between two voluntary yields to the runtime.
pub const REPLAY_YIELD_EVERY: usize = 1024;

async fn load(path: PathBuf) -> Result<(PathBuf, Vec<u8>)> {
    let content = tokio::fs::read(&path)
        .await
        .map_err(|e| Error::ProviderConnection(format!("cannot read {}: {}", path.display(), e)))?;
    Ok((path, content))
}

#[async_trait]
impl MarketDataProvider for HistoricalReplayClient {
    fn name(&self) -> &str {
        "historical"
    }

    async fn get_book_update(&mut self, callback: &mut RecordCallback<'_>) -> Result<SessionEnd> {
        let pending: Vec<PathBuf> = self.files.iter().skip(self.next_file).cloned().collect();
        info!("📼 Replaying {} file(s), {} loading ahead", pending.len(), self.download_concurrency);

        let mut batches = futures::stream::iter(pending)
            .map(|path| tokio::spawn(load(path)))
            .buffered(self.download_concurrency);

        let mut since_yield = 0usize;
        while let Some(joined) = batches.next().await {
            let (path, content) =
                joined.map_err(|e| Error::ProviderConnection(format!("batch load task failed: {}", e)))??;
            debug!("replaying {} ({} bytes)", path.display(), content.len());

            for (n, line) in content.split(|b| *b == b'\n').enumerate() {
                match RawRecord::from_line(line) {
                    Ok(Some(record)) => {
                        if callback(record) == KeepGoing::Stop {
                            return Ok(SessionEnd::Stopped);
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        self.skipped_lines += 1;
                        warn!("skipping line {} of {}: {}", n + 1, path.display(), e);
                    }
                }

                since_yield += 1;
                if since_yield >= REPLAY_YIELD_EVERY {
                    since_yield = 0;
                    tokio::task::yield_now().await;
                }
            }
            self.next_file += 1;
        }

        info!("📼 Replay exhausted ({} unparsable lines)", self.skipped_lines);
        Ok(SessionEnd::Exhausted)
    }
}
