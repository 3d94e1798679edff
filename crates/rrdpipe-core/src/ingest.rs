//! Graphite line-protocol listener.
//!
//! Each connection carries lines `<path> <value> <timestamp>\n`. Reads that
//! arrive in a short burst are batched; every batch publishes one arrival
//! per subscription key with all the timestamps seen for it. Values are not
//! forwarded: subscribers re-read the archives.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, trace, warn};

use crate::query::MAX_TIMESTAMP;
use crate::router::{SubscriptionKey, SubscriptionRouter};

/// How long to wait for the rest of a burst before flushing a batch.
pub const BURST_POLL: Duration = Duration::from_millis(100);

/// Longest a burst is gathered before it is flushed regardless of traffic.
pub const MAX_BATCH_DELAY: Duration = Duration::from_secs(1);

/// Buffered bytes that force a flush.
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Pending partial lines longer than this are discarded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: String,
    pub value: f64,
    pub timestamp: i64,
}

/// Parses `<path> <value> <timestamp>`. Fractional timestamps are truncated;
/// timestamps outside `0..=MAX_TIMESTAMP` are rejected.
pub fn parse_line(line: &str) -> Option<Sample> {
    let mut parts = line.split_whitespace();
    let (path, value, timestamp) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let value = value.parse().ok()?;
    let timestamp = match timestamp.parse::<i64>() {
        Ok(ts) => ts,
        Err(_) => {
            let ts = timestamp.parse::<f64>().ok()?;
            if !ts.is_finite() {
                return None;
            }
            ts.floor() as i64
        }
    };
    if !(0..=MAX_TIMESTAMP).contains(&timestamp) {
        return None;
    }
    Some(Sample {
        path: path.to_string(),
        value,
        timestamp,
    })
}

pub struct IngestionServer {
    router: Arc<SubscriptionRouter>,
    poll: Duration,
    max_batch_delay: Duration,
}

impl IngestionServer {
    pub fn new(router: Arc<SubscriptionRouter>) -> Self {
        Self {
            router,
            poll: BURST_POLL,
            max_batch_delay: MAX_BATCH_DELAY,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay = delay;
        self
    }

    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    /// Accepts connections until the task is dropped; one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "ingestion listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_stream(stream, peer).await;
            });
        }
    }

    async fn handle_stream(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "ingestion connection opened");
        match self.handle_connection(stream).await {
            Ok(lines) => debug!(peer = %peer, lines, "ingestion connection closed"),
            Err(e) => debug!(peer = %peer, error = %e, "ingestion connection failed"),
        }
    }

    /// Reads one connection to EOF. Returns the number of complete lines seen.
    pub async fn handle_connection<R>(&self, mut reader: R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut total = 0;

        loop {
            let n = reader.read(&mut chunk).await?;
            let mut eof = n == 0;
            pending.extend_from_slice(&chunk[..n]);

            // Gather the rest of the burst, bounded in time and size.
            let deadline = Instant::now() + self.max_batch_delay;
            while !eof && pending.len() < MAX_BATCH_BYTES {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(self.poll.min(remaining), reader.read(&mut chunk)).await {
                    Ok(Ok(0)) => eof = true,
                    Ok(Ok(n)) => pending.extend_from_slice(&chunk[..n]),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => break,
                }
            }

            let split = if eof {
                pending.len()
            } else {
                pending.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1)
            };
            let complete: Vec<u8> = pending.drain(..split).collect();
            total += self.process_batch(&complete);

            if pending.len() > MAX_LINE_LEN {
                debug!(len = pending.len(), "discarding oversized partial line");
                pending.clear();
            }
            if eof {
                return Ok(total);
            }
        }
    }

    /// Parses a batch of lines and publishes one arrival per key.
    /// Returns the number of non-empty lines in the batch.
    pub fn process_batch(&self, data: &[u8]) -> usize {
        let mut arrivals: HashMap<SubscriptionKey, BTreeSet<i64>> = HashMap::new();
        let mut lines = 0;

        for raw in data.split(|&b| b == b'\n') {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            lines += 1;
            let Some(sample) = std::str::from_utf8(raw).ok().and_then(parse_line) else {
                debug!(line = %String::from_utf8_lossy(raw), "dropping malformed line");
                continue;
            };
            let keys = self.router.keys_for_sample(&sample.path);
            if keys.is_empty() {
                trace!(path = %sample.path, "no subscribers for metric");
                continue;
            }
            for key in keys {
                arrivals.entry(key).or_default().insert(sample.timestamp);
            }
        }

        for (key, timestamps) in arrivals {
            self.router.publish(&key, timestamps.into_iter().collect());
        }
        lines
    }
}
