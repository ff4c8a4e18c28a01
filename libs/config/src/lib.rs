use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::debug;

mod space;
pub mod wire;

pub use space::{AddressSpace, AddressSpaceIter, ConfigError};

/// ipam config, built once at startup and shared immutably
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamConfig {
    network_name: String,
    space: AddressSpace,
    lease_time: LeaseTime,
    store: wire::Store,
    nodes: BTreeMap<String, Ipv4Addr>,
    wire: wire::Config,
    path: Option<PathBuf>,
}

impl IpamConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        let input = input.as_ref();
        let cfg = match serde_json::from_str::<wire::Config>(input) {
            Ok(cfg) => cfg,
            Err(_err) => serde_yaml::from_str(input).context("failed to decode config")?,
        };
        let config = Self::from_wire(cfg)?;
        debug!(?config);
        Ok(config)
    }

    /// validate the wire format into an `IpamConfig`
    pub fn from_wire(cfg: wire::Config) -> Result<Self, ConfigError> {
        let space = AddressSpace::from_wire(&cfg.network)?;
        let lease_time = LeaseTime::from(cfg.lease_time.unwrap_or_default());
        if let (Some(min), Some(max)) = (lease_time.min, lease_time.max)
            && min > max
        {
            return Err(ConfigError::InvalidLeaseTime { min, max });
        }
        Ok(Self {
            network_name: cfg.network.name.clone(),
            space,
            lease_time,
            store: cfg.store.clone(),
            nodes: cfg.nodes.clone(),
            wire: cfg,
            path: None,
        })
    }

    /// the logical network name, a label only
    pub fn network_name(&self) -> &str {
        &self.network_name
    }
    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }
    pub fn lease_time(&self) -> LeaseTime {
        self.lease_time
    }
    pub fn store(&self) -> &wire::Store {
        &self.store
    }
    pub fn backend_mode(&self) -> wire::BackendMode {
        self.store.backend
    }
    pub fn nodes(&self) -> &BTreeMap<String, Ipv4Addr> {
        &self.nodes
    }
    /// the config as it was decoded
    pub fn wire(&self) -> &wire::Config {
        &self.wire
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
    /// connection url for the redis backend
    pub fn redis_url(&self) -> String {
        let wire::Store {
            host,
            port,
            db,
            password,
            ..
        } = &self.store;
        match password {
            Some(pass) => format!("redis://:{pass}@{host}:{port}/{db}"),
            None => format!("redis://{host}:{port}/{db}"),
        }
    }
}

/// ttl policy for leases
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LeaseTime {
    default: Option<Duration>,
    min: Option<Duration>,
    max: Option<Duration>,
}

impl LeaseTime {
    pub fn new(default: Option<Duration>, min: Option<Duration>, max: Option<Duration>) -> Self {
        Self { default, min, max }
    }
    pub fn get_default(&self) -> Option<Duration> {
        self.default
    }
    pub fn get_min(&self) -> Option<Duration> {
        self.min
    }
    pub fn get_max(&self) -> Option<Duration> {
        self.max
    }
    /// calculate the ttl based on a possible requested time. `None` means the
    /// lease never expires
    pub fn determine_lease(&self, requested: Option<Duration>) -> Option<Duration> {
        match requested {
            Some(req) => Some(self.clamp(req)),
            None => self.default,
        }
    }
    /// time must be larger than `min` and smaller than `max`
    pub fn clamp(&self, ttl: Duration) -> Duration {
        let ttl = self.min.map_or(ttl, |min| ttl.max(min));
        self.max.map_or(ttl, |max| ttl.min(max))
    }
}
