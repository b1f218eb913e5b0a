//! Live feed client - JSON-lines records over TCP

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::{KeepGoing, MarketDataProvider, RawRecord, RecordCallback, SessionEnd};
use crate::core::config::LiveConfig;
use crate::core::{Error, Result};

pub struct LiveFeedClient {
    address: String,
    skipped_lines: u64,
}

impl LiveFeedClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), skipped_lines: 0 }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(config.address.clone())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }
}

#[async_trait]
impl MarketDataProvider for LiveFeedClient {
    fn name(&self) -> &str {
        "live"
    }

    async fn get_book_update(&mut self, callback: &mut RecordCallback<'_>) -> Result<SessionEnd> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| Error::ProviderConnection(format!("connect {}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;
        info!("📡 Connected to live feed {}", self.address);

        let mut lines = BufReader::new(stream).split(b'\n');
        loop {
            let line = match lines.next_segment().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Live feed {} closed the session", self.address);
                    return Ok(SessionEnd::Closed);
                }
                Err(e) => {
                    return Err(Error::ProviderConnection(format!("read {}: {}", self.address, e)));
                }
            };

            match RawRecord::from_line(&line) {
                Ok(Some(record)) => {
                    if callback(record) == KeepGoing::Stop {
                        return Ok(SessionEnd::Stopped);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.skipped_lines += 1;
                    warn!("skipping unparsable live line: {}", e);
                }
            }
        }
    }
}
