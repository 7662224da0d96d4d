//! Expiration modes and cache entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default lifetime of `Short` and `Long` entries
pub const DEFAULT_SHORT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_LONG_TTL: Duration = Duration::from_secs(60);

/// How long an entry stays valid, and where it lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpirationMode {
    /// Persisted, expires after the short TTL
    Short,
    /// Persisted, expires after the long TTL
    Long,
    /// In-memory only, gone when the process ends
    OneSession,
    /// Persisted, never expires
    NotExpired,
}

impl ExpirationMode {
    pub const ALL: [ExpirationMode; 4] = [
        ExpirationMode::Short,
        ExpirationMode::Long,
        ExpirationMode::OneSession,
        ExpirationMode::NotExpired,
    ];

    /// Whether entries in this mode are written to disk
    pub fn is_persisted(self) -> bool {
        !matches!(self, ExpirationMode::OneSession)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExpirationMode::Short => "short",
            ExpirationMode::Long => "long",
            ExpirationMode::OneSession => "one-session",
            ExpirationMode::NotExpired => "not-expired",
        }
    }
}

impl fmt::Display for ExpirationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpirationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "short" => Ok(ExpirationMode::Short),
            "long" => Ok(ExpirationMode::Long),
            "one-session" | "session" => Ok(ExpirationMode::OneSession),
            "not-expired" | "never" => Ok(ExpirationMode::NotExpired),
            other => Err(format!(
                "Unknown expiration mode '{}' (expected: short, long, one-session, not-expired)",
                other
            )),
        }
    }
}

/// TTL table used to turn a mode into an absolute deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub short_ttl: Duration,
    pub long_ttl: Duration,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            short_ttl: DEFAULT_SHORT_TTL,
            long_ttl: DEFAULT_LONG_TTL,
        }
    }
}

impl ExpirationPolicy {
    /// Lifetime for a mode; `None` means the entry never expires.
    ///
    /// `OneSession` entries are bounded by the process, not by a clock.
    pub fn ttl(&self, mode: ExpirationMode) -> Option<Duration> {
        match mode {
            ExpirationMode::Short => Some(self.short_ttl),
            ExpirationMode::Long => Some(self.long_ttl),
            ExpirationMode::OneSession | ExpirationMode::NotExpired => None,
        }
    }

    /// Absolute deadline for an entry inserted at `now`
    pub fn expires_at(&self, mode: ExpirationMode, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = self.ttl(mode)?;
        // Saturate rather than overflow on absurd configured TTLs
        let deadline = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(deadline)
    }
}

/// A stored value and its deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
