#![forbid(unsafe_code)]

//! Security timestamps and freshness validation.

use chrono::{DateTime, Duration, Utc};
use sigtuna_core::{Error, Result};

/// A `wsu:Timestamp` element: creation and expiration instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityTimestamp {
    pub id: Option<String>,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl SecurityTimestamp {
    pub fn new(id: Option<String>, created: DateTime<Utc>, expires: DateTime<Utc>) -> Self {
        SecurityTimestamp {
            id,
            created,
            expires,
        }
    }

    /// Validate the creation/expiration range and freshness against the
    /// current clock.
    ///
    /// The message is fresh when now lies within
    /// `[created − skew, expires + skew]`, and — when a replay window is
    /// given — `created` is no older than `replay_window + skew`.
    pub fn validate_freshness(
        &self,
        replay_window: Option<Duration>,
        clock_skew: Duration,
    ) -> Result<()> {
        self.validate_freshness_at(Utc::now(), replay_window, clock_skew)
    }

    /// Clock-injected variant of [`validate_freshness`](Self::validate_freshness).
    pub fn validate_freshness_at(
        &self,
        now: DateTime<Utc>,
        replay_window: Option<Duration>,
        clock_skew: Duration,
    ) -> Result<()> {
        if self.expires < self.created {
            return Err(Error::Structure(
                "timestamp expires before it was created".into(),
            ));
        }
        if self.created > now + clock_skew {
            return Err(Error::Replay(format!(
                "timestamp creation time {} is in the future",
                self.created
            )));
        }
        if self.expires + clock_skew < now {
            return Err(Error::Replay(format!(
                "timestamp expired at {}",
                self.expires
            )));
        }
        if let Some(window) = replay_window {
            if self.created + window + clock_skew < now {
                return Err(Error::Replay(format!(
                    "timestamp creation time {} is outside the replay window",
                    self.created
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(created_offset_secs: i64, expires_offset_secs: i64) -> (SecurityTimestamp, DateTime<Utc>) {
        let now = Utc::now();
        (
            SecurityTimestamp::new(
                Some("ts-1".into()),
                now + Duration::seconds(created_offset_secs),
                now + Duration::seconds(expires_offset_secs),
            ),
            now,
        )
    }

    #[test]
    fn test_fresh_timestamp_is_accepted() {
        let (t, now) = ts(-10, 290);
        t.validate_freshness_at(now, None, Duration::seconds(5))
            .expect("fresh");
    }

    #[test]
    fn test_expired_timestamp_is_rejected() {
        let (t, now) = ts(-600, -300);
        let err = t
            .validate_freshness_at(now, None, Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, Error::Replay(_)));
    }

    #[test]
    fn test_future_creation_beyond_skew_is_rejected() {
        let (t, now) = ts(60, 360);
        let err = t
            .validate_freshness_at(now, None, Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, Error::Replay(_)));
    }

    #[test]
    fn test_replay_window_tightens_creation_bound() {
        let (t, now) = ts(-120, 600);
        t.validate_freshness_at(now, None, Duration::seconds(5))
            .expect("fresh without window");
        let err = t
            .validate_freshness_at(now, Some(Duration::seconds(60)), Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, Error::Replay(_)));
    }

    #[test]
    fn test_inverted_range_is_a_structure_violation() {
        let (t, now) = ts(10, -10);
        let err = t
            .validate_freshness_at(now, None, Duration::seconds(60))
            .unwrap_err();
        assert!(matches!(err, Error::Structure(_)));
    }
}
