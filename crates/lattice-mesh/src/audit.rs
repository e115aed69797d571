use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

pub const DEFAULT_MAX_BUFFER_TIME: Duration = Duration::from_millis(500);
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
struct Commitment {
    bytes: usize,
    expires_at: Instant,
}

/// Tracks outbound byte commitments against a transport so a stalled buffer
/// can be told apart from one that is merely busy.
///
/// Producers `record` every send; `audit` compares the transport's current
/// buffered amount against the still-live commitments. A buffered amount
/// larger than everything we committed to within the expiry window means the
/// transport stopped draining.
pub struct BufferAuditor {
    label: &'static str,
    max_buffer_time: Duration,
    clean_interval: Duration,
    entries: Mutex<VecDeque<Commitment>>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl BufferAuditor {
    pub fn new(label: &'static str) -> Arc<Self> {
        Self::with_tunables(label, DEFAULT_MAX_BUFFER_TIME, DEFAULT_CLEAN_INTERVAL)
    }

    pub fn with_tunables(
        label: &'static str,
        max_buffer_time: Duration,
        clean_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(BufferAuditor {
            label,
            max_buffer_time,
            clean_interval,
            entries: Mutex::new(VecDeque::new()),
            cleaner: Mutex::new(None),
        })
    }

    /// Spawn the background expiry sweep. Runs until `stop` (or drop).
    pub fn start(self: &Arc<Self>) {
        let mut cleaner = self.cleaner.lock();
        if cleaner.is_some() {
            return;
        }
        let auditor = Arc::clone(self);
        *cleaner = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(auditor.clean_interval).await;
                auditor.drop_expired(Instant::now());
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.cleaner.lock().take() {
            handle.abort();
        }
        self.entries.lock().clear();
    }

    /// Record `bytes` just handed to the transport.
    pub fn record(&self, bytes: usize) {
        self.entries.lock().push_back(Commitment {
            bytes,
            expires_at: Instant::now() + self.max_buffer_time,
        });
    }

    /// Whether `current_buffered` is covered by live commitments. Never
    /// panics; an auditor in a bad way reports a stall rather than throwing.
    pub fn audit(&self, current_buffered: usize) -> bool {
        let now = Instant::now();
        self.drop_expired(now);
        let allowed: usize = self
            .entries
            .lock()
            .iter()
            .map(|entry| entry.bytes)
            .fold(0usize, |sum, bytes| sum.saturating_add(bytes));
        let ok = current_buffered <= allowed;
        if !ok {
            trace!(
                channel = self.label,
                current_buffered,
                allowed,
                "buffered amount exceeds recorded commitments"
            );
        }
        ok
    }

    fn drop_expired(&self, now: Instant) {
        let mut entries = self.entries.lock();
        while entries
            .front()
            .map(|entry| entry.expires_at <= now)
            .unwrap_or(false)
        {
            entries.pop_front();
        }
    }
}

impl Drop for BufferAuditor {
    fn drop(&mut self) {
        if let Some(handle) = self.cleaner.lock().take() {
            handle.abort();
        }
    }
}
