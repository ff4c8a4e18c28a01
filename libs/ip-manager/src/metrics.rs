//! Allocator metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of successful allocations
    pub static ref ALLOCATIONS: IntCounter = register_int_counter!(
        "ipam_allocations",
        "count of addresses successfully allocated"
    ).unwrap();

    /// Count of allocations that found no free address
    pub static ref POOL_EXHAUSTED: IntCounter = register_int_counter!(
        "ipam_pool_exhausted",
        "count of allocations rejected because the pool was exhausted"
    ).unwrap();

    /// Count of claims lost to another allocator between snapshot and claim
    pub static ref CLAIM_CONFLICTS: IntCounter = register_int_counter!(
        "ipam_claim_conflicts",
        "count of conditional claims that found the address already leased"
    ).unwrap();

    /// Count of leases released by their owner
    pub static ref RELEASES: IntCounter = register_int_counter!(
        "ipam_releases",
        "count of leases released"
    ).unwrap();

    /// Count of leases renewed by their owner
    pub static ref RENEWALS: IntCounter = register_int_counter!(
        "ipam_renewals",
        "count of leases renewed"
    ).unwrap();

    /// Count of release/renew calls rejected because of an owner mismatch
    pub static ref OWNER_MISMATCH: IntCounter = register_int_counter!(
        "ipam_owner_mismatch",
        "count of release or renew calls made by a non-owner"
    ).unwrap();

    /// Count of expiry sweeps completed
    pub static ref SWEEPS: IntCounter = register_int_counter!(
        "ipam_sweeps",
        "count of expired lease sweeps completed"
    ).unwrap();

    /// Count of expired leases reclaimed by sweeps
    pub static ref SWEEP_RECLAIMED: IntCounter = register_int_counter!(
        "ipam_sweep_reclaimed",
        "count of expired leases reclaimed by sweeps"
    ).unwrap();

    /// Count of store errors
    pub static ref STORE_ERRORS: IntCounter = register_int_counter!(
        "ipam_store_errors",
        "count of failed lease store operations"
    ).unwrap();

    /// Count of store operations that timed out
    pub static ref STORE_TIMEOUTS: IntCounter = register_int_counter!(
        "ipam_store_timeouts",
        "count of lease store operations that timed out"
    ).unwrap();

    /// Gauge: active leases seen by the last sweep
    pub static ref ACTIVE_LEASES: IntGauge = register_int_gauge!(
        "ipam_active_leases",
        "active leases seen by the last sweep"
    ).unwrap();

    /// Gauge: total allocatable addresses
    pub static ref TOTAL_AVAILABLE_ADDRS: IntGauge = register_int_gauge!(
        "ipam_total_available_addrs",
        "total allocatable addresses in the configured range"
    ).unwrap();

    /// Gauge: current store state (1=available, 0=unavailable)
    pub static ref STORE_AVAILABLE: IntGauge = register_int_gauge!(
        "ipam_store_available",
        "current lease store state (1=available, 0=unavailable)"
    ).unwrap();
}
