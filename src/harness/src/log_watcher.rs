//! Tails the output of an external process and flips a [`ReadinessSignal`]
//! the first time a marker substring shows up.

use memchr::memmem;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::readiness::ReadinessSignal;

const CHUNK_SIZE: usize = 8 * 1024;

/// How a marker is searched for across consecutive output chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerScan {
    /// Every chunk is searched on its own. A marker split across two chunks
    /// is never found.
    PerChunk,
    /// The last `marker.len() - 1` bytes of a chunk are carried into the next
    /// search, so split markers are found as well.
    #[default]
    SlidingWindow,
}

/// Incremental marker search over a byte stream.
#[derive(Debug, Clone)]
pub struct MarkerMatcher {
    marker: Vec<u8>,
    scan: MarkerScan,
    carry: Vec<u8>,
}

impl MarkerMatcher {
    pub fn new(marker: impl Into<String>, scan: MarkerScan) -> Self {
        Self {
            marker: marker.into().into_bytes(),
            scan,
            carry: Vec::new(),
        }
    }

    /// Returns true if the marker occurs in `chunk`, or, for
    /// [`MarkerScan::SlidingWindow`], straddles the previous chunk and this one.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        match self.scan {
            MarkerScan::PerChunk => memmem::find(chunk, &self.marker).is_some(),
            MarkerScan::SlidingWindow => {
                let mut window = std::mem::take(&mut self.carry);
                window.extend_from_slice(chunk);
                let found = memmem::find(&window, &self.marker).is_some();

                let keep = self.marker.len().saturating_sub(1);
                let start = window.len().saturating_sub(keep);
                window.drain(..start);
                self.carry = window;
                found
            }
        }
    }
}

/// How a watcher stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The stream reached EOF, typically because the process exited.
    Closed { marker_seen: bool },
    /// Reading the stream failed.
    Failed { marker_seen: bool, error: String },
}

impl WatchOutcome {
    pub fn marker_seen(&self) -> bool {
        match self {
            WatchOutcome::Closed { marker_seen } | WatchOutcome::Failed { marker_seen, .. } => {
                *marker_seen
            }
        }
    }
}

/// Watches one output stream of one service.
#[derive(Debug, Clone)]
pub struct LogWatcher {
    service: String,
    matcher: MarkerMatcher,
    signal: ReadinessSignal,
}

impl LogWatcher {
    pub fn new(
        service: impl Into<String>,
        marker: impl Into<String>,
        scan: MarkerScan,
        signal: ReadinessSignal,
    ) -> Self {
        Self {
            service: service.into(),
            matcher: MarkerMatcher::new(marker, scan),
            signal,
        }
    }

    /// Reads `stream` until it closes, echoing every chunk.
    ///
    /// `on_ready` runs at most once, and only if this watcher is the one that
    /// moved the signal to `Ready`. Timing out is left to the caller.
    pub async fn watch<R, F>(mut self, mut stream: R, on_ready: F) -> WatchOutcome
    where
        R: AsyncRead + Unpin,
        F: FnOnce(),
    {
        self.signal.begin_waiting();

        let mut on_ready = Some(on_ready);
        let mut marker_seen = false;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!(service = %self.service, marker_seen, "output stream closed");
                    return WatchOutcome::Closed { marker_seen };
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(service = %self.service, "failed to read output: {e}");
                    return WatchOutcome::Failed {
                        marker_seen,
                        error: e.to_string(),
                    };
                }
            };

            let chunk = &buf[..n];
            self.echo(chunk);

            if self.matcher.feed(chunk) && !marker_seen {
                marker_seen = true;
                if self.signal.mark_ready() {
                    if let Some(callback) = on_ready.take() {
                        callback();
                    }
                }
            }
        }
    }

    /// Runs [`LogWatcher::watch`] on its own task.
    pub fn spawn<R, F>(self, stream: R, on_ready: F) -> LogWatcherHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let service = self.service.clone();
        let handle = tokio::spawn(self.watch(stream, on_ready));
        LogWatcherHandle { service, handle }
    }

    fn echo(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            tracing::info!(target: "process_output", service = %self.service, "{line}");
        }
    }
}

/// Owns a spawned watcher task; the task is aborted when the handle drops.
#[derive(Debug)]
pub struct LogWatcherHandle {
    service: String,
    handle: JoinHandle<WatchOutcome>,
}

impl LogWatcherHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Waits for the watcher to stop. Returns `None` if it was aborted.
    pub async fn join(mut self) -> Option<WatchOutcome> {
        (&mut self.handle).await.ok()
    }
}

impl Drop for LogWatcherHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
