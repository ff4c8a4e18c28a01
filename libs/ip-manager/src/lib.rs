//! # ip-manager
//!
//! `ip-manager` defines a trait `LeaseStore` that provides atomic claim,
//! release & renew primitives over lease records keyed by IP.
//!
//! The store is not meant to be used by the api directly. Instead, it's wrapped
//! in an `Allocator` which takes a generic parameter that must implement
//! `LeaseStore`. `Allocator` uses those primitives to pick free addresses out
//! of an [`AddressSpace`] and manage the lease lifecycle, while the store stays
//! the only source of truth for which addresses are taken.
//!
//! No locks are held in process: every mutation is a single conditional write
//! on the store, so any number of allocators on any number of hosts can share
//! one store.
//!
//! [`LeaseStore`]: crate::LeaseStore
//! [`Allocator`]: crate::Allocator
//! [`AddressSpace`]: config::AddressSpace
use std::{
    net::Ipv4Addr,
    ops::RangeInclusive,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod allocator;
pub mod memory;
pub mod metrics;
pub mod redis;

pub use allocator::{Allocator, RetryPolicy};

/// longest lease a caller may ask for
pub const MAX_TTL: Duration = Duration::from_secs(u32::MAX as u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Active,
    Released,
}

/// A claim on one address by one owner. `expires_at` of `None` means the
/// lease is held until explicitly released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    address: Ipv4Addr,
    owner: String,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    state: LeaseState,
}

impl Lease {
    pub fn new(
        address: Ipv4Addr,
        owner: impl Into<String>,
        acquired_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            address,
            owner: owner.into(),
            acquired_at,
            expires_at,
            state: LeaseState::Active,
        }
    }
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }
    pub fn owner(&self) -> &str {
        &self.owner
    }
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
    pub fn state(&self) -> LeaseState {
        self.state
    }
    /// true if the lease has an expiry at or before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state == LeaseState::Active && !self.is_expired(now)
    }
    /// mark the lease as released
    pub fn released(mut self) -> Self {
        self.state = LeaseState::Released;
        self
    }
}

/// result of a conditional claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Claimed(Lease),
    /// an unexpired lease already exists for the address
    AlreadyLeased,
}

/// result of an owner-checked release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    Released(Lease),
    NotOwner,
    NotFound,
}

/// result of an owner-checked renew
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renewal {
    Renewed(Lease),
    NotOwner,
    NotFound,
}

/// A finite, non-restartable snapshot of lease records
pub type LeaseStream<E> = BoxStream<'static, Result<Lease, E>>;

#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;

    /// creates a lease only if no unexpired lease exists for `ip`, as a single
    /// conditional write
    async fn try_claim(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Claim, Self::Error>;
    /// removes the lease if `owner` matches the stored owner. expired leases
    /// are treated as absent
    async fn release(&self, ip: Ipv4Addr, owner: &str) -> Result<Release, Self::Error>;
    /// sets expiry to now + `ttl` if `owner` matches
    async fn renew(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Duration,
    ) -> Result<Renewal, Self::Error>;
    /// every stored record, expired ones included
    async fn list_leases(&self) -> Result<LeaseStream<Self::Error>, Self::Error>;
    /// removes `lease` only if the stored record still has the same owner &
    /// expiry and that expiry has passed. Returns false if nothing was removed
    async fn reclaim(&self, lease: &Lease) -> Result<bool, Self::Error>;
    async fn is_free(&self, ip: Ipv4Addr) -> Result<bool, Self::Error>;
    async fn ping(&self) -> Result<(), Self::Error>;
    /// the clock the store judges expiry by. Anything filtering records
    /// outside the store must compare against this, not the local clock
    async fn now(&self) -> Result<DateTime<Utc>, Self::Error>;

    /// records unexpired as of the store clock
    async fn list_active(&self) -> Result<LeaseStream<Self::Error>, Self::Error> {
        let now = self.now().await?;
        Ok(self
            .list_leases()
            .await?
            .filter(move |lease| {
                let keep = match lease {
                    Ok(lease) => lease.is_active(now),
                    Err(_) => true,
                };
                futures::future::ready(keep)
            })
            .boxed())
    }
}

#[derive(Error, Debug)]
pub enum IpError<E> {
    #[error("no free address left in range {range:?}")]
    PoolExhausted { range: RangeInclusive<Ipv4Addr> },
    #[error("no lease found for {0}")]
    NotFound(Ipv4Addr),
    #[error("lease for {ip} is not owned by {owner:?}")]
    NotOwner { ip: Ipv4Addr, owner: String },
    #[error("{0} is not an allocatable address")]
    OutOfRange(Ipv4Addr),
    #[error("owner must not be empty")]
    EmptyOwner,
    #[error("ttl {0:?} is out of range, at most {max:?} is allowed", max = MAX_TTL)]
    InvalidTtl(Duration),
    #[error("store did not respond within {0:?}")]
    Timeout(Duration),
    #[error("store unavailable")]
    StoreUnavailable(#[from] E),
}

impl<E> IpError<E> {
    /// transient failures, the caller should retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpError::Timeout(_) | IpError::StoreUnavailable(_))
    }
}
