use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;

use crate::{Claim, Lease, LeaseStore, LeaseStream, Release, Renewal};

/// Process-local lease store. Every operation holds the map lock for its
/// whole duration, which gives the same atomicity a shared store gets from
/// conditional writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<Ipv4Addr, Lease>>>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("ttl {0:?} is out of range")]
    InvalidTtl(Duration),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Ipv4Addr, Lease>> {
        // a panic while holding the lock can't leave a half-written entry
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, MemoryError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or(MemoryError::InvalidTtl(ttl))
}

#[async_trait]
impl LeaseStore for MemoryStore {
    type Error = MemoryError;

    async fn try_claim(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Claim, Self::Error> {
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| expiry(now, ttl)).transpose()?;
        let mut guard = self.lock();

        if let Some(existing) = guard.get(&ip)
            && existing.is_active(now)
        {
            return Ok(Claim::AlreadyLeased);
        }

        let lease = Lease::new(ip, owner, now, expires_at);
        if guard.insert(ip, lease.clone()).is_some() {
            debug!(?ip, "replaced expired entry");
        }
        Ok(Claim::Claimed(lease))
    }

    async fn release(&self, ip: Ipv4Addr, owner: &str) -> Result<Release, Self::Error> {
        let now = Utc::now();
        let mut guard = self.lock();
        match guard.get(&ip) {
            Some(lease) if lease.is_active(now) => {
                if lease.owner() != owner {
                    return Ok(Release::NotOwner);
                }
            }
            _ => return Ok(Release::NotFound),
        }
        Ok(match guard.remove(&ip) {
            Some(lease) => Release::Released(lease.released()),
            None => Release::NotFound,
        })
    }

    async fn renew(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Duration,
    ) -> Result<Renewal, Self::Error> {
        let now = Utc::now();
        let expires_at = expiry(now, ttl)?;
        let mut guard = self.lock();
        match guard.get_mut(&ip) {
            Some(lease) if lease.is_active(now) => {
                if lease.owner() != owner {
                    return Ok(Renewal::NotOwner);
                }
                lease.expires_at = Some(expires_at);
                Ok(Renewal::Renewed(lease.clone()))
            }
            _ => Ok(Renewal::NotFound),
        }
    }

    async fn list_leases(&self) -> Result<LeaseStream<Self::Error>, Self::Error> {
        let snapshot = self.lock().values().cloned().map(Ok).collect::<Vec<_>>();
        Ok(futures::stream::iter(snapshot).boxed())
    }

    async fn reclaim(&self, lease: &Lease) -> Result<bool, Self::Error> {
        let now = Utc::now();
        let mut guard = self.lock();
        let matches = guard.get(&lease.address()).is_some_and(|current| {
            current.owner() == lease.owner()
                && current.expires_at() == lease.expires_at()
                && current.is_expired(now)
        });
        if matches {
            guard.remove(&lease.address());
        }
        Ok(matches)
    }

    async fn is_free(&self, ip: Ipv4Addr) -> Result<bool, Self::Error> {
        let now = Utc::now();
        Ok(!self.lock().get(&ip).is_some_and(|lease| lease.is_active(now)))
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn now(&self) -> Result<DateTime<Utc>, Self::Error> {
        Ok(Utc::now())
    }
}
