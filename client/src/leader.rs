//! Leader election between contexts of one device.
//!
//! Exactly one context holds the sync connection. Leadership is a lease in
//! a store all contexts share: a context claims it when it is free, expired
//! or already its own, and keeps it by renewing every heartbeat. A context
//! that disappears without releasing simply stops renewing, and the lease
//! becomes claimable once it expires.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub expires_at: Instant,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Shared storage for the leadership lease.
pub trait LeaseStore: Send + Sync {
    fn read(&self) -> Option<Lease>;

    /// Replace the lease with `next` only if it still equals `expected`.
    fn compare_and_set(&self, expected: Option<&Lease>, next: Option<Lease>) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    lease: Mutex<Option<Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Lease>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn read(&self) -> Option<Lease> {
        self.lock().clone()
    }

    fn compare_and_set(&self, expected: Option<&Lease>, next: Option<Lease>) -> bool {
        let mut lease = self.lock();
        if lease.as_ref() != expected {
            return false;
        }
        *lease = next;
        true
    }
}

/// One context's view of the election.
#[derive(Clone)]
pub struct LeaderElection {
    id: String,
    ttl: Duration,
    leases: Arc<dyn LeaseStore>,
}

impl LeaderElection {
    pub fn new(id: impl Into<String>, ttl: Duration, leases: Arc<dyn LeaseStore>) -> Self {
        Self {
            id: id.into(),
            ttl,
            leases,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim or renew the lease. Returns whether this context leads.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let current = self.leases.read();
        let claimable = match &current {
            None => true,
            Some(lease) => lease.holder == self.id || lease.is_expired(now),
        };
        if !claimable {
            return false;
        }

        let next = Lease {
            holder: self.id.clone(),
            expires_at: now + self.ttl,
        };
        let acquired = self.leases.compare_and_set(current.as_ref(), Some(next));
        if acquired && current.as_ref().map_or(true, |l| l.holder != self.id) {
            tracing::info!(context = %self.id, "Became sync leader");
        }
        acquired
    }

    /// Give the lease up if this context holds it.
    pub fn release(&self) {
        if let Some(lease) = self.leases.read() {
            if lease.holder == self.id && self.leases.compare_and_set(Some(&lease), None) {
                tracing::info!(context = %self.id, "Released sync leadership");
            }
        }
    }

    pub fn is_leader(&self, now: Instant) -> bool {
        self.leases
            .read()
            .is_some_and(|lease| lease.holder == self.id && !lease.is_expired(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election(id: &str, leases: &Arc<MemoryLeaseStore>) -> LeaderElection {
        LeaderElection::new(id, Duration::from_secs(5), leases.clone())
    }

    #[test]
    fn first_claimant_wins() {
        let leases = Arc::new(MemoryLeaseStore::new());
        let a = election("a", &leases);
        let b = election("b", &leases);
        let now = Instant::now();

        assert!(a.try_acquire(now));
        assert!(!b.try_acquire(now));
        assert!(a.is_leader(now));
        assert!(!b.is_leader(now));
        // Renewal keeps it
        assert!(a.try_acquire(now + Duration::from_secs(4)));
        assert!(!b.try_acquire(now + Duration::from_secs(8)));
    }

    #[test]
    fn expired_lease_can_be_taken() {
        let leases = Arc::new(MemoryLeaseStore::new());
        let a = election("a", &leases);
        let b = election("b", &leases);
        let now = Instant::now();

        assert!(a.try_acquire(now));
        let later = now + Duration::from_secs(5);
        assert!(b.try_acquire(later));
        assert!(!a.is_leader(later));
        assert!(!a.try_acquire(later));
    }

    #[test]
    fn release_frees_only_own_lease() {
        let leases = Arc::new(MemoryLeaseStore::new());
        let a = election("a", &leases);
        let b = election("b", &leases);
        let now = Instant::now();

        assert!(a.try_acquire(now));
        b.release();
        assert!(a.is_leader(now));
        a.release();
        assert!(leases.read().is_none());
        assert!(b.try_acquire(now));
    }
}
