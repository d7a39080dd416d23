//! Heart-beat monitoring.
//!
//! The monitor samples the transport codec's byte counters on fixed
//! intervals. No read progress across a full read interval declares the peer
//! dead; no write progress across half a write interval emits a keep-alive
//! newline so the peer observes activity. A monotonic session nonce cancels
//! timer loops left over from a previous `start`, so `stop`/`start` cycles
//! never deliver stale callbacks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

/// Monitor intervals negotiated from the server configuration and the
/// client's `heart-beat: cx,cy` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeatTimes {
    /// Interval the peer must show read activity within; zero disables.
    pub read_interval: Duration,
    /// Interval our writes must stay under; zero disables.
    pub write_interval: Duration,
}

/// Forgiveness added on top of the read interval, capped at the interval
/// itself.
const READ_GRACE_CAP_MS: u64 = 5000;

/// Combine the server's configured heart-beat floor with what the client
/// advertised. `cx` is how often the client can send, `cy` how often it
/// wants to receive; zero on either side disables that side.
pub fn negotiate(
    configured_outbound_ms: u64,
    configured_inbound_ms: u64,
    client_cx_ms: u64,
    client_cy_ms: u64,
) -> HeartBeatTimes {
    let write_interval = if client_cy_ms == 0 {
        0
    } else {
        configured_outbound_ms.max(client_cy_ms)
    };
    let read_interval = if client_cx_ms == 0 {
        0
    } else {
        let base = configured_inbound_ms.max(client_cx_ms);
        base + base.min(READ_GRACE_CAP_MS)
    };
    HeartBeatTimes {
        read_interval: Duration::from_millis(read_interval),
        write_interval: Duration::from_millis(write_interval),
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

type Callback = Arc<dyn Fn() + Send + Sync>;

pub struct HeartBeatMonitor {
    read_interval: Duration,
    write_interval: Duration,
    read_counter: Arc<AtomicU64>,
    write_counter: Arc<AtomicU64>,
    on_dead: Callback,
    on_keep_alive: Callback,
    session: Arc<AtomicU32>,
}

impl HeartBeatMonitor {
    pub fn new() -> Self {
        Self {
            read_interval: Duration::ZERO,
            write_interval: Duration::ZERO,
            read_counter: Arc::new(AtomicU64::new(0)),
            write_counter: Arc::new(AtomicU64::new(0)),
            on_dead: Arc::new(|| {}),
            on_keep_alive: Arc::new(|| {}),
            session: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Arm the read side: `counter` must advance within every `interval` or
    /// `on_dead` fires.
    pub fn read_side(
        mut self,
        interval: Duration,
        counter: Arc<AtomicU64>,
        on_dead: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.read_interval = interval;
        self.read_counter = counter;
        self.on_dead = Arc::new(on_dead);
        self
    }

    /// Arm the write side: when `counter` shows no progress across half of
    /// `interval`, `on_keep_alive` fires so the transport emits a newline.
    pub fn write_side(
        mut self,
        interval: Duration,
        counter: Arc<AtomicU64>,
        on_keep_alive: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.write_interval = interval;
        self.write_counter = counter;
        self.on_keep_alive = Arc::new(on_keep_alive);
        self
    }

    /// Start both check loops. Must run inside a tokio runtime. Calling
    /// `start` again supersedes the previous loops.
    pub fn start(&self) {
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.write_interval.is_zero() {
            let period = (self.write_interval / 2).max(Duration::from_millis(1));
            let counter = self.write_counter.clone();
            let callback = self.on_keep_alive.clone();
            let nonce = self.session.clone();
            tokio::spawn(async move {
                let mut last = counter.load(Ordering::Relaxed);
                loop {
                    tokio::time::sleep(period).await;
                    if nonce.load(Ordering::SeqCst) != session {
                        return;
                    }
                    if counter.load(Ordering::Relaxed) == last {
                        callback();
                    }
                    last = counter.load(Ordering::Relaxed);
                }
            });
        }

        if !self.read_interval.is_zero() {
            let period = self.read_interval;
            let counter = self.read_counter.clone();
            let callback = self.on_dead.clone();
            let nonce = self.session.clone();
            tokio::spawn(async move {
                let mut last = counter.load(Ordering::Relaxed);
                loop {
                    tokio::time::sleep(period).await;
                    if nonce.load(Ordering::SeqCst) != session {
                        return;
                    }
                    let current = counter.load(Ordering::Relaxed);
                    if current == last {
                        callback();
                    }
                    last = current;
                }
            });
        }
    }

    /// Invalidate in-flight timer loops. Safe to call repeatedly.
    pub fn stop(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for HeartBeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeartBeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartBeatMonitor")
            .field("read_interval", &self.read_interval)
            .field("write_interval", &self.write_interval)
            .field("session", &self.session.load(Ordering::SeqCst))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
