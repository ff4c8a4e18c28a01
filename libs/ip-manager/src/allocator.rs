use std::{future::Future, net::Ipv4Addr, time::Duration};

use config::{AddressSpace, IpamConfig, LeaseTime};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::{Claim, IpError, Lease, LeaseStore, LeaseStream, MAX_TTL, Release, Renewal, metrics};

const DEFAULT_MAX_RETRIES: u32 = 3;
/// default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry policy for read-only store listings. Mutations are never retried,
/// a timed out claim may or may not have been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay between retries (actual delay uses exponential backoff).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Hands out addresses from an [`AddressSpace`] using only the atomic
/// primitives of a [`LeaseStore`]. Holds no lease state of its own, so any
/// number of allocators can share one store.
#[derive(Debug)]
pub struct Allocator<S> {
    store: S,
    network: String,
    space: AddressSpace,
    lease_time: LeaseTime,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<S: LeaseStore> Allocator<S> {
    pub fn new(store: S, cfg: &IpamConfig) -> Self {
        let space = cfg.address_space().clone();
        metrics::TOTAL_AVAILABLE_ADDRS.set(space.allocatable_size() as i64);
        Self {
            store,
            network: cfg.network_name().to_owned(),
            space,
            lease_time: cfg.lease_time(),
            timeout: DEFAULT_STORE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn network_name(&self) -> &str {
        &self.network
    }

    pub fn lease_time(&self) -> LeaseTime {
        self.lease_time
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// claim the lowest free address in range for `owner`. Each candidate
    /// costs one conditional write, nothing is read up front
    #[tracing::instrument(level = "debug", skip(self), fields(network = %self.network))]
    pub async fn allocate(
        &self,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Lease, IpError<S::Error>> {
        if owner.is_empty() {
            return Err(IpError::EmptyOwner);
        }
        let ttl = self
            .lease_time
            .determine_lease(ttl)
            .map(check_ttl::<S::Error>)
            .transpose()?;

        for ip in self.space.iter() {
            match self
                .timed("try_claim", self.store.try_claim(ip, owner, ttl))
                .await?
            {
                Claim::Claimed(lease) => {
                    metrics::ALLOCATIONS.inc();
                    info!(
                        ?ip,
                        owner,
                        expires_at = ?lease.expires_at(),
                        "allocated address"
                    );
                    return Ok(lease);
                }
                Claim::AlreadyLeased => {
                    metrics::CLAIM_CONFLICTS.inc();
                    debug!(?ip, "address already leased, trying next");
                }
            }
        }

        metrics::POOL_EXHAUSTED.inc();
        warn!(
            owner,
            range = ?self.space.range(),
            "no free address left in range"
        );
        Err(IpError::PoolExhausted {
            range: self.space.range(),
        })
    }

    /// release `ip` if it is held by `owner`
    pub async fn release(&self, ip: Ipv4Addr, owner: &str) -> Result<Lease, IpError<S::Error>> {
        self.check_request(ip, owner)?;
        match self.timed("release", self.store.release(ip, owner)).await? {
            Release::Released(lease) => {
                metrics::RELEASES.inc();
                info!(?ip, owner, "released address");
                Ok(lease)
            }
            Release::NotOwner => {
                metrics::OWNER_MISMATCH.inc();
                warn!(?ip, owner, "release rejected, not the lease owner");
                Err(IpError::NotOwner {
                    ip,
                    owner: owner.to_owned(),
                })
            }
            Release::NotFound => Err(IpError::NotFound(ip)),
        }
    }

    /// extend the lease on `ip` by `ttl` from now, clamped to the lease time bounds
    pub async fn renew(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, IpError<S::Error>> {
        self.check_request(ip, owner)?;
        let ttl = check_ttl::<S::Error>(self.lease_time.clamp(ttl))?;
        match self.timed("renew", self.store.renew(ip, owner, ttl)).await? {
            Renewal::Renewed(lease) => {
                metrics::RENEWALS.inc();
                debug!(?ip, owner, expires_at = ?lease.expires_at(), "renewed lease");
                Ok(lease)
            }
            Renewal::NotOwner => {
                metrics::OWNER_MISMATCH.inc();
                warn!(?ip, owner, "renew rejected, not the lease owner");
                Err(IpError::NotOwner {
                    ip,
                    owner: owner.to_owned(),
                })
            }
            Renewal::NotFound => Err(IpError::NotFound(ip)),
        }
    }

    /// reclaim every lease whose expiry has passed on the store clock,
    /// returns how many this call removed. Leases removed concurrently by
    /// another sweeper are skipped.
    pub async fn sweep_expired(&self) -> Result<u64, IpError<S::Error>> {
        let now = self.timed("now", self.store.now()).await?;
        let mut leases = self.timed("list_leases", self.store.list_leases()).await?;
        let mut reclaimed = 0;
        let mut active = 0;
        while let Some(lease) = self.next_record("list_leases", &mut leases).await? {
            if !lease.is_expired(now) {
                active += 1;
                continue;
            }
            if self.timed("reclaim", self.store.reclaim(&lease)).await? {
                reclaimed += 1;
                debug!(ip = ?lease.address(), owner = lease.owner(), "reclaimed expired lease");
            }
        }
        metrics::SWEEPS.inc();
        metrics::SWEEP_RECLAIMED.inc_by(reclaimed);
        metrics::ACTIVE_LEASES.set(active);
        if reclaimed > 0 {
            info!(reclaimed, active, "swept expired leases");
        }
        Ok(reclaimed)
    }

    /// every active lease, ordered by address
    pub async fn leases(&self) -> Result<Vec<Lease>, IpError<S::Error>> {
        let mut stream = self
            .with_retry("list_active", move || async move {
                self.store.list_active().await
            })
            .await?;
        let mut leases = Vec::new();
        while let Some(lease) = self.next_record("list_active", &mut stream).await? {
            leases.push(lease);
        }
        leases.sort_by_key(|lease| lease.address());
        Ok(leases)
    }

    pub async fn is_free(&self, ip: Ipv4Addr) -> Result<bool, IpError<S::Error>> {
        self.timed("is_free", self.store.is_free(ip)).await
    }

    pub async fn ping(&self) -> Result<(), IpError<S::Error>> {
        self.timed("ping", self.store.ping()).await
    }

    fn check_request(&self, ip: Ipv4Addr, owner: &str) -> Result<(), IpError<S::Error>> {
        if owner.is_empty() {
            return Err(IpError::EmptyOwner);
        }
        if !self.space.contains(&ip) {
            return Err(IpError::OutOfRange(ip));
        }
        Ok(())
    }

    /// next record of a listing, each bounded by the store timeout
    async fn next_record(
        &self,
        op: &'static str,
        stream: &mut LeaseStream<S::Error>,
    ) -> Result<Option<Lease>, IpError<S::Error>> {
        match tokio::time::timeout(self.timeout, stream.next()).await {
            Ok(None) => Ok(None),
            Ok(Some(res)) => res.map(Some).map_err(|err| self.failed(op, err)),
            Err(_) => Err(self.timed_out(op)),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, IpError<S::Error>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, S::Error>>,
    {
        let mut attempts = 0;
        loop {
            match self.timed(op, f()).await {
                Err(err) if err.is_retryable() && attempts < self.retry.max_retries => {
                    attempts += 1;
                    let delay = self.retry.delay(attempts);
                    debug!(op, attempts, ?delay, "retrying store read");
                    tokio::time::sleep(delay).await;
                }
                res => return res,
            }
        }
    }

    async fn timed<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T, IpError<S::Error>>
    where
        Fut: Future<Output = Result<T, S::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(err)) => Err(self.failed(op, err)),
            Err(_) => Err(self.timed_out(op)),
        }
    }

    fn failed(&self, op: &'static str, err: S::Error) -> IpError<S::Error> {
        metrics::STORE_ERRORS.inc();
        error!(?err, op, "lease store operation failed");
        IpError::StoreUnavailable(err)
    }

    fn timed_out(&self, op: &'static str) -> IpError<S::Error> {
        metrics::STORE_TIMEOUTS.inc();
        warn!(op, timeout = ?self.timeout, "lease store operation timed out");
        IpError::Timeout(self.timeout)
    }
}

fn check_ttl<E>(ttl: Duration) -> Result<Duration, IpError<E>> {
    if ttl > MAX_TTL {
        return Err(IpError::InvalidTtl(ttl));
    }
    Ok(ttl)
}
