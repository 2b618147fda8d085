use std::time::Duration;

use bytes::Bytes;

/// What a publisher hands to the broker. The broker fills in identity and
/// creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publication {
    pub body: Bytes,
    /// Zero means the message never expires.
    pub time_to_live: Duration,
}

impl Publication {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            time_to_live: Duration::ZERO,
        }
    }

    pub fn with_ttl(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// RPC callers send the TTL as whole seconds; negative values mean none.
    pub fn with_ttl_secs(self, secs: i64) -> Self {
        self.with_ttl(Duration::from_secs(secs.max(0) as u64))
    }
}

/// A published message as stored and delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub subject: String,
    pub body: Bytes,
    pub time_to_live: Duration,
    /// Unix ms.
    pub created_at_ms: i64,
    /// Set once by expiration or deletion; never reverts.
    pub removed: bool,
}

impl Message {
    pub fn new(id: u64, subject: impl Into<String>, publication: Publication, created_at_ms: i64) -> Self {
        Self {
            id,
            subject: subject.into(),
            body: publication.body,
            time_to_live: publication.time_to_live,
            created_at_ms,
            removed: false,
        }
    }

    pub fn expires(&self) -> bool {
        !self.time_to_live.is_zero()
    }

    /// Saturates at `u64::MAX`.
    pub fn time_to_live_ms(&self) -> u64 {
        u64::try_from(self.time_to_live.as_millis()).unwrap_or(u64::MAX)
    }
}
