#![allow(missing_docs)] // lazy_static items dont carry docstrings well

//! # metrics
//!
//! process wide statistics, allocator metrics live in `ip-manager`
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{HistogramVec, IntGauge, register_histogram_vec, register_int_gauge};

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();

    /// histogram of admin api response times
    pub static ref API_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "ipam_api_duration",
        "admin api request duration (seconds)",
        &["route"]
    )
    .unwrap();

    /// # of expiry sweeps that failed
    pub static ref SWEEP_FAILURES: IntGauge =
        register_int_gauge!("ipam_sweep_failures", "consecutive failed expiry sweeps").unwrap();
}

/// refresh [`UPTIME`] from [`START_TIME`]
pub fn update_uptime() {
    UPTIME.set(START_TIME.elapsed().as_secs() as i64);
}
