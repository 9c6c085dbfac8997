use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Coordinator-assigned lease identifier.
///
/// Rendered in hex, the way it appears in lock request keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A time-bounded grant from the coordinator, as seen by the client that holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Identifier assigned by the coordinator
    pub id: LeaseId,
    /// Requested time-to-live
    pub ttl: Duration,
    /// When the lease was granted
    pub granted_at: DateTime<Utc>,
    /// When the lease was last renewed
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(id: LeaseId, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id,
            ttl,
            granted_at: now,
            renewed_at: now,
        }
    }

    /// Instant after which the coordinator drops the lease unless it is renewed.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.renewed_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check if this lease has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at()
    }

    /// Record a successful renewal.
    pub fn renew(&mut self) {
        self.renewed_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_renders_hex() {
        assert_eq!(LeaseId(255).to_string(), "ff");
        assert_eq!(LeaseId(0x694d77aa9e8ba4f7).to_string(), "694d77aa9e8ba4f7");
    }

    #[test]
    fn test_fresh_lease_not_expired() {
        let lease = Lease::new(LeaseId(1), Duration::from_secs(60));
        assert!(!lease.is_expired());
        assert!(lease.expires_at() > lease.granted_at);
    }

    #[test]
    fn test_stale_lease_expired() {
        let mut lease = Lease::new(LeaseId(1), Duration::from_secs(2));
        lease.renewed_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(lease.is_expired());

        lease.renew();
        assert!(!lease.is_expired());
    }
}
