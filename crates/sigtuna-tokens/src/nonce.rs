#![forbid(unsafe_code)]

//! Replay-detection nonce cache.
//!
//! Entries are retained for `replay_window + 2 × clock_skew`; after that a
//! replayed value would already be rejected by timestamp freshness, so the
//! entry can be dropped. The add operation is an atomic check-and-insert so
//! replay detection stays correct across concurrently processed messages.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct NonceCache {
    retention: Duration,
    entries: Mutex<HashMap<Vec<u8>, Instant>>,
}

impl NonceCache {
    pub fn new(replay_window: Duration, clock_skew: Duration) -> Self {
        NonceCache {
            retention: replay_window + 2 * clock_skew,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically insert the nonce. Returns `false` if it was already
    /// present, i.e. a replay.
    pub fn try_add_nonce(&self, nonce: &[u8]) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("nonce cache lock");
        entries.retain(|_, seen| now.duration_since(*seen) < self.retention);
        match entries.get(nonce) {
            Some(_) => false,
            None => {
                entries.insert(nonce.to_vec(), now);
                true
            }
        }
    }

    /// Non-mutating lookup. Returns `true` if the nonce has been seen, i.e. a
    /// replay.
    pub fn check_nonce(&self, nonce: &[u8]) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock().expect("nonce cache lock");
        match entries.get(nonce) {
            Some(seen) => now.duration_since(*seen) < self.retention,
            None => false,
        }
    }
}
