//! # Config docs
//!
//! The wire format is what gets deserialized from disk, it is validated and
//! transformed into [`IpamConfig`] before anything uses it.
//!
//! ## Network
//!
//! A single subnet is managed. `range_start`/`range_end` are the inclusive
//! bounds of allocatable addresses. The `gateway`, the network address and the
//! broadcast address are never handed out, neither is anything in `exclude`.
//! `name` is only a label.
//!
//! ## Lease time
//!
//! `lease_time` is optional. When `default` is missing, allocations that don't
//! ask for a ttl are permanent until released. Requested ttls are clamped to
//! `min`/`max` when those are set. Durations are seconds, or a string with an
//! `s`, `m`, `h` or `d` suffix.
//!
//! ## Store
//!
//! `backend` is `redis` (default) or `memory`. The memory backend is per-process
//! and only useful for a single instance or for testing.
//!
//! [`IpamConfig`]: crate::IpamConfig
use std::{collections::BTreeMap, net::Ipv4Addr, num::NonZeroU32, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

use crate::LeaseTime;

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub network: Network,
    #[serde(default)]
    pub lease_time: Option<MinMax>,
    #[serde(default)]
    pub store: Store,
    /// addresses of the nodes participating in the deployment, labels only
    #[serde(default)]
    pub nodes: BTreeMap<String, Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Network {
    #[serde(default = "default_network_name")]
    pub name: String,
    /// kept as a string so a malformed CIDR is reported as a config error
    pub subnet: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub exclude: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Store {
    #[serde(default)]
    pub backend: BackendMode,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            backend: BackendMode::default(),
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MinMax {
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub default: Option<NonZeroU32>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub min: Option<NonZeroU32>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub max: Option<NonZeroU32>,
}

pub fn default_network_name() -> String {
    "ipam".to_owned()
}

pub fn default_redis_host() -> String {
    "127.0.0.1".to_owned()
}

pub const fn default_redis_port() -> u16 {
    6379
}

pub fn default_key_prefix() -> String {
    "ipam".to_owned()
}

impl From<MinMax> for LeaseTime {
    fn from(lease_time: MinMax) -> Self {
        let secs = |n: NonZeroU32| Duration::from_secs(n.get() as u64);
        LeaseTime::new(
            lease_time.default.map(secs),
            lease_time.min.map(secs),
            lease_time.max.map(secs),
        )
    }
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "60m", "24h", "7d"
/// If no unit is specified, assumes seconds
pub(crate) fn parse_duration(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u32>().context("invalid number")?;

    let num_seconds = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'd', 'h', 'm', or 's' are supported",
            other
        ),
    };

    num.checked_mul(num_seconds)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LeaseDuration {
    Seconds(u64),
    String(String),
}

impl LeaseDuration {
    fn into_nonzero<E: de::Error>(self) -> Result<NonZeroU32, E> {
        match self {
            LeaseDuration::Seconds(val) => NonZeroU32::new(
                u32::try_from(val).map_err(|_| E::custom("duration value too large"))?,
            )
            .ok_or_else(|| E::custom("duration cannot be zero")),
            LeaseDuration::String(s) => NonZeroU32::new(parse_duration(&s).map_err(E::custom)?)
                .ok_or_else(|| E::custom("duration cannot be zero")),
        }
    }
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<NonZeroU32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<LeaseDuration>::deserialize(de)?
        .map(LeaseDuration::into_nonzero)
        .transpose()
}
