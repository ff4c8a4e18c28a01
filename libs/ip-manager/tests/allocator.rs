use std::{
    collections::HashSet,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use config::IpamConfig;
use ip_manager::{
    Allocator, Claim, IpError, Lease, LeaseStore, LeaseStream, Release, Renewal, RetryPolicy,
    memory::{MemoryError, MemoryStore},
};
use rand::Rng;
use tracing_test::traced_test;

static SCENARIO: &str = r#"
network:
  name: vxlan-net
  subnet: 172.20.0.0/16
  range_start: 172.20.0.10
  range_end: 172.20.0.12
  gateway: 172.20.0.1
store:
  backend: memory
"#;

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn allocator(cfg: &str) -> Allocator<MemoryStore> {
    let cfg = IpamConfig::new(cfg).unwrap();
    Allocator::new(MemoryStore::new(), &cfg)
}

#[tokio::test]
#[traced_test]
async fn sequential_allocation_scenario() {
    let alloc = allocator(SCENARIO);
    assert_eq!(alloc.address_space().allocatable_size(), 3);

    for (owner, expected) in [
        ("c1", "172.20.0.10"),
        ("c2", "172.20.0.11"),
        ("c3", "172.20.0.12"),
    ] {
        let lease = alloc.allocate(owner, None).await.unwrap();
        assert_eq!(lease.address(), ip(expected));
        assert_eq!(lease.owner(), owner);
        assert!(!alloc.is_free(lease.address()).await.unwrap());
    }

    match alloc.allocate("c4", None).await {
        Err(IpError::PoolExhausted { range }) => {
            assert_eq!(range, ip("172.20.0.10")..=ip("172.20.0.12"))
        }
        other => panic!("expected pool exhausted, got {other:?}"),
    }

    alloc.release(ip("172.20.0.11"), "c2").await.unwrap();
    let lease = alloc.allocate("c4", None).await.unwrap();
    assert_eq!(lease.address(), ip("172.20.0.11"));
}

#[tokio::test]
async fn release_succeeds_once() {
    let alloc = allocator(SCENARIO);
    let lease = alloc.allocate("c1", None).await.unwrap();

    let released = alloc.release(lease.address(), "c1").await.unwrap();
    assert_eq!(released.address(), lease.address());
    assert!(matches!(
        alloc.release(lease.address(), "c1").await,
        Err(IpError::NotFound(addr)) if addr == lease.address()
    ));
    assert!(alloc.is_free(lease.address()).await.unwrap());
}

#[tokio::test]
async fn release_by_other_owner_keeps_lease() {
    let alloc = allocator(SCENARIO);
    let lease = alloc.allocate("c1", None).await.unwrap();

    match alloc.release(lease.address(), "c2").await {
        Err(IpError::NotOwner { ip, owner }) => {
            assert_eq!(ip, lease.address());
            assert_eq!(owner, "c2");
        }
        other => panic!("expected not owner, got {other:?}"),
    }
    assert!(!alloc.is_free(lease.address()).await.unwrap());
    assert!(matches!(
        alloc
            .renew(lease.address(), "c2", Duration::from_secs(60))
            .await,
        Err(IpError::NotOwner { .. })
    ));
}

#[tokio::test]
async fn exhaustion_and_recovery() {
    let alloc = allocator(
        r#"
network:
  subnet: 10.20.0.0/24
  range_start: 10.20.0.1
  range_end: 10.20.0.254
  gateway: 10.20.0.1
  exclude: [10.20.0.100]
"#,
    );
    let size = alloc.address_space().allocatable_size();
    assert_eq!(size, 252);

    let mut seen = HashSet::new();
    for i in 0..size {
        let lease = alloc.allocate(&format!("c{i}"), None).await.unwrap();
        assert!(alloc.address_space().is_allocatable(&lease.address()));
        assert!(seen.insert(lease.address()));
    }
    assert!(!seen.contains(&ip("10.20.0.100")));
    assert!(matches!(
        alloc.allocate("late", None).await,
        Err(IpError::PoolExhausted { .. })
    ));

    alloc.release(ip("10.20.0.50"), "c48").await.unwrap();
    assert_eq!(
        alloc.allocate("late", None).await.unwrap().address(),
        ip("10.20.0.50")
    );
    assert!(matches!(
        alloc.allocate("later", None).await,
        Err(IpError::PoolExhausted { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_are_unique() {
    let alloc = Arc::new(allocator(
        r#"
network:
  subnet: 10.30.0.0/24
  range_start: 10.30.0.10
  range_end: 10.30.0.49
  gateway: 10.30.0.1
"#,
    ));
    let size = alloc.address_space().allocatable_size() as usize;

    // more callers than addresses, every address handed out exactly once
    let mut tasks = Vec::new();
    for i in 0..size + 10 {
        let alloc = alloc.clone();
        tasks.push(tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(0..5);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            alloc.allocate(&format!("host-{i}"), None).await
        }));
    }

    let mut addrs = HashSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(lease) => assert!(addrs.insert(lease.address()), "duplicate {lease:?}"),
            Err(IpError::PoolExhausted { .. }) => exhausted += 1,
            Err(err) => panic!("unexpected error {err:?}"),
        }
    }
    assert_eq!(addrs.len(), size);
    assert_eq!(exhausted, 10);
}

#[tokio::test]
async fn allocators_share_one_store() {
    // two "hosts" with their own allocator over the same store
    let cfg = IpamConfig::new(SCENARIO).unwrap();
    let store = MemoryStore::new();
    let a = Allocator::new(store.clone(), &cfg);
    let b = Allocator::new(store, &cfg);

    assert_eq!(a.allocate("a1", None).await.unwrap().address(), ip("172.20.0.10"));
    assert_eq!(b.allocate("b1", None).await.unwrap().address(), ip("172.20.0.11"));
    assert!(matches!(
        b.release(ip("172.20.0.10"), "b1").await,
        Err(IpError::NotOwner { .. })
    ));
    a.release(ip("172.20.0.10"), "a1").await.unwrap();
    assert_eq!(b.allocate("b2", None).await.unwrap().address(), ip("172.20.0.10"));
}

#[tokio::test]
async fn sweep_reclaims_once() {
    let alloc = allocator(SCENARIO);
    let short = alloc
        .allocate("c1", Some(Duration::from_millis(10)))
        .await
        .unwrap();
    let kept = alloc.allocate("c2", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // expired leases are free before the sweep has run
    assert!(alloc.is_free(short.address()).await.unwrap());
    assert_eq!(alloc.leases().await.unwrap(), vec![kept.clone()]);

    assert_eq!(alloc.sweep_expired().await.unwrap(), 1);
    assert_eq!(alloc.sweep_expired().await.unwrap(), 0);
    assert!(!alloc.is_free(kept.address()).await.unwrap());
    assert!(matches!(
        alloc.release(short.address(), "c1").await,
        Err(IpError::NotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_sweeps_are_idempotent() {
    let cfg = IpamConfig::new(SCENARIO).unwrap();
    let store = MemoryStore::new();
    let a = Arc::new(Allocator::new(store.clone(), &cfg));
    let b = Arc::new(Allocator::new(store, &cfg));
    for owner in ["c1", "c2", "c3"] {
        a.allocate(owner, Some(Duration::from_millis(5)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (ra, rb) = tokio::join!(a.sweep_expired(), b.sweep_expired());
    assert_eq!(ra.unwrap() + rb.unwrap(), 3);
}

#[tokio::test]
async fn expired_lease_is_reallocated() {
    let alloc = allocator(SCENARIO);
    alloc
        .allocate("c1", Some(Duration::from_millis(5)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // no sweep in between, the claim takes over the expired record
    let lease = alloc.allocate("c2", None).await.unwrap();
    assert_eq!(lease.address(), ip("172.20.0.10"));
    assert!(matches!(
        alloc
            .renew(lease.address(), "c1", Duration::from_secs(60))
            .await,
        Err(IpError::NotOwner { .. })
    ));
}

#[tokio::test]
async fn renew_extends_lease() {
    let alloc = allocator(SCENARIO);
    let lease = alloc
        .allocate("c1", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    let renewed = alloc
        .renew(lease.address(), "c1", Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(renewed.expires_at() > lease.expires_at());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!alloc.is_free(lease.address()).await.unwrap());
    assert!(matches!(
        alloc
            .renew(ip("172.20.0.12"), "c1", Duration::from_secs(60))
            .await,
        Err(IpError::NotFound(_))
    ));
}

/// store whose calls hang for a while, or fail outright
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    stall: Duration,
    fail: bool,
}

impl FlakyStore {
    async fn flake(&self) -> Result<(), MemoryError> {
        tokio::time::sleep(self.stall).await;
        if self.fail {
            return Err(MemoryError::InvalidTtl(Duration::MAX));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FlakyStore {
    type Error = MemoryError;

    async fn try_claim(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Claim, Self::Error> {
        self.flake().await?;
        self.inner.try_claim(ip, owner, ttl).await
    }
    async fn release(&self, ip: Ipv4Addr, owner: &str) -> Result<Release, Self::Error> {
        self.inner.release(ip, owner).await
    }
    async fn renew(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Duration,
    ) -> Result<Renewal, Self::Error> {
        self.inner.renew(ip, owner, ttl).await
    }
    async fn list_leases(&self) -> Result<LeaseStream<Self::Error>, Self::Error> {
        self.flake().await?;
        self.inner.list_leases().await
    }
    async fn reclaim(&self, lease: &Lease) -> Result<bool, Self::Error> {
        self.inner.reclaim(lease).await
    }
    async fn is_free(&self, ip: Ipv4Addr) -> Result<bool, Self::Error> {
        self.inner.is_free(ip).await
    }
    async fn ping(&self) -> Result<(), Self::Error> {
        self.flake().await
    }
    async fn now(&self) -> Result<DateTime<Utc>, Self::Error> {
        self.flake().await?;
        self.inner.now().await
    }
}

#[tokio::test]
#[traced_test]
async fn slow_store_times_out() {
    let cfg = IpamConfig::new(SCENARIO).unwrap();
    let store = FlakyStore {
        inner: MemoryStore::new(),
        stall: Duration::from_millis(200),
        fail: false,
    };
    let alloc = Allocator::new(store, &cfg)
        .with_timeout(Duration::from_millis(20))
        .with_retry_policy(RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
        });

    let err = alloc.allocate("c1", None).await.unwrap_err();
    assert!(matches!(err, IpError::Timeout(_)));
    assert!(err.is_retryable());
    assert!(matches!(alloc.ping().await, Err(IpError::Timeout(_))));
    assert!(matches!(alloc.leases().await, Err(IpError::Timeout(_))));
}

#[tokio::test]
async fn store_failure_is_not_exhaustion() {
    let cfg = IpamConfig::new(SCENARIO).unwrap();
    let store = FlakyStore {
        inner: MemoryStore::new(),
        stall: Duration::ZERO,
        fail: true,
    };
    let alloc = Allocator::new(store, &cfg).with_retry_policy(RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
    });

    assert!(matches!(
        alloc.allocate("c1", None).await,
        Err(IpError::StoreUnavailable(_))
    ));
    assert!(matches!(
        alloc.sweep_expired().await,
        Err(IpError::StoreUnavailable(_))
    ));
}

/// store where every listed record costs a round trip
#[derive(Clone)]
struct RoundTripStore {
    inner: MemoryStore,
    per_record: Duration,
}

#[async_trait]
impl LeaseStore for RoundTripStore {
    type Error = MemoryError;

    async fn try_claim(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Claim, Self::Error> {
        self.inner.try_claim(ip, owner, ttl).await
    }
    async fn release(&self, ip: Ipv4Addr, owner: &str) -> Result<Release, Self::Error> {
        self.inner.release(ip, owner).await
    }
    async fn renew(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Duration,
    ) -> Result<Renewal, Self::Error> {
        self.inner.renew(ip, owner, ttl).await
    }
    async fn list_leases(&self) -> Result<LeaseStream<Self::Error>, Self::Error> {
        let per_record = self.per_record;
        Ok(self
            .inner
            .list_leases()
            .await?
            .then(move |lease| async move {
                tokio::time::sleep(per_record).await;
                lease
            })
            .boxed())
    }
    async fn reclaim(&self, lease: &Lease) -> Result<bool, Self::Error> {
        self.inner.reclaim(lease).await
    }
    async fn is_free(&self, ip: Ipv4Addr) -> Result<bool, Self::Error> {
        self.inner.is_free(ip).await
    }
    async fn ping(&self) -> Result<(), Self::Error> {
        self.inner.ping().await
    }
    async fn now(&self) -> Result<DateTime<Utc>, Self::Error> {
        self.inner.now().await
    }
}

#[tokio::test]
async fn allocation_cost_is_independent_of_active_leases() {
    let cfg = IpamConfig::new(
        r#"
network:
  subnet: 10.40.0.0/16
  range_start: 10.40.0.10
  range_end: 10.40.255.254
  gateway: 10.40.0.1
"#,
    )
    .unwrap();
    let store = MemoryStore::new();
    // fill the store directly, high in the range so the low addresses stay free
    for i in 0..500u32 {
        let ip = Ipv4Addr::from(u32::from(ip("10.40.100.0")) + i);
        store.try_claim(ip, &format!("host-{i}"), None).await.unwrap();
    }
    let alloc = Allocator::new(
        RoundTripStore {
            inner: store,
            per_record: Duration::from_millis(5),
        },
        &cfg,
    )
    .with_timeout(Duration::from_millis(200));

    let lease = tokio::time::timeout(Duration::from_secs(1), alloc.allocate("new-host", None))
        .await
        .expect("allocate should not list the store")
        .unwrap();
    assert_eq!(lease.address(), ip("10.40.0.10"));

    // listing pays per record but each record gets its own deadline
    assert_eq!(alloc.leases().await.unwrap().len(), 501);
}

/// store whose clock runs ahead of this host's
struct SkewedStore {
    inner: MemoryStore,
    ahead: chrono::Duration,
    reclaims: AtomicUsize,
}

#[async_trait]
impl LeaseStore for SkewedStore {
    type Error = MemoryError;

    async fn try_claim(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Claim, Self::Error> {
        self.inner.try_claim(ip, owner, ttl).await
    }
    async fn release(&self, ip: Ipv4Addr, owner: &str) -> Result<Release, Self::Error> {
        self.inner.release(ip, owner).await
    }
    async fn renew(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Duration,
    ) -> Result<Renewal, Self::Error> {
        self.inner.renew(ip, owner, ttl).await
    }
    async fn list_leases(&self) -> Result<LeaseStream<Self::Error>, Self::Error> {
        self.inner.list_leases().await
    }
    async fn reclaim(&self, _lease: &Lease) -> Result<bool, Self::Error> {
        // the store's own clock says expired, so the conditional delete succeeds
        self.reclaims.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
    async fn is_free(&self, ip: Ipv4Addr) -> Result<bool, Self::Error> {
        self.inner.is_free(ip).await
    }
    async fn ping(&self) -> Result<(), Self::Error> {
        Ok(())
    }
    async fn now(&self) -> Result<DateTime<Utc>, Self::Error> {
        Ok(Utc::now() + self.ahead)
    }
}

#[tokio::test]
async fn expiry_follows_store_clock() {
    let cfg = IpamConfig::new(SCENARIO).unwrap();
    let alloc = Allocator::new(
        SkewedStore {
            inner: MemoryStore::new(),
            ahead: chrono::Duration::hours(2),
            reclaims: AtomicUsize::new(0),
        },
        &cfg,
    );
    alloc
        .allocate("c1", Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    alloc.allocate("c2", None).await.unwrap();

    // locally the first lease has an hour left, the store says it is gone
    assert_eq!(alloc.sweep_expired().await.unwrap(), 1);
    assert_eq!(alloc.store().reclaims.load(Ordering::SeqCst), 1);
    let leases = alloc.leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].owner(), "c2");
}
