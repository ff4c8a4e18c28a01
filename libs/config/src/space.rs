use std::{
    collections::BTreeSet,
    net::Ipv4Addr,
    ops::RangeInclusive,
    time::Duration,
};

use ipnet::{Ipv4AddrRange, Ipv4Net};
use thiserror::Error;
use tracing::warn;

use crate::wire;

/// Errors for a malformed or inconsistent config. The process must not
/// start if any of these are returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed subnet {subnet:?}: {reason}")]
    MalformedSubnet { subnet: String, reason: String },
    #[error("range start {start} is greater than range end {end}")]
    InvertedRange { start: Ipv4Addr, end: Ipv4Addr },
    #[error("{what} {ip} is outside of subnet {subnet}")]
    OutsideSubnet {
        what: &'static str,
        ip: Ipv4Addr,
        subnet: Ipv4Net,
    },
    #[error("range {start}-{end} has no allocatable addresses after reserved addresses are removed")]
    EmptyRange { start: Ipv4Addr, end: Ipv4Addr },
    #[error("lease time min {min:?} is greater than max {max:?}")]
    InvalidLeaseTime { min: Duration, max: Duration },
}

/// The managed subnet and the inclusive range of addresses that may be handed
/// out from it. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    subnet: Ipv4Net,
    range: RangeInclusive<Ipv4Addr>,
    gateway: Ipv4Addr,
    /// gateway, network, broadcast & any explicit exclusions
    reserved: BTreeSet<Ipv4Addr>,
    allocatable: u64,
}

impl AddressSpace {
    pub fn new(
        subnet: Ipv4Net,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<Self, ConfigError> {
        Self::with_exclusions(subnet, range_start, range_end, gateway, &[])
    }

    /// parse the subnet from CIDR notation
    pub fn parse(
        subnet: &str,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<Self, ConfigError> {
        Self::new(parse_subnet(subnet)?, range_start, range_end, gateway)
    }

    pub fn from_wire(net: &wire::Network) -> Result<Self, ConfigError> {
        Self::with_exclusions(
            parse_subnet(&net.subnet)?,
            net.range_start,
            net.range_end,
            net.gateway,
            &net.exclude,
        )
    }

    pub fn with_exclusions(
        subnet: Ipv4Net,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        gateway: Ipv4Addr,
        exclude: &[Ipv4Addr],
    ) -> Result<Self, ConfigError> {
        let trunc = subnet.trunc();
        if trunc != subnet {
            warn!(%subnet, network = %trunc, "subnet has host bits set, using network address");
        }
        let subnet = trunc;

        if range_start > range_end {
            return Err(ConfigError::InvertedRange {
                start: range_start,
                end: range_end,
            });
        }
        let check = |what, ip| {
            if subnet.contains(&ip) {
                Ok(())
            } else {
                Err(ConfigError::OutsideSubnet { what, ip, subnet })
            }
        };
        check("range start", range_start)?;
        check("range end", range_end)?;
        check("gateway", gateway)?;
        for ip in exclude {
            check("excluded address", *ip)?;
        }

        let mut reserved = BTreeSet::from([gateway]);
        // /31 & /32 have no network or broadcast address (RFC 3021)
        if subnet.prefix_len() < 31 {
            reserved.insert(subnet.network());
            reserved.insert(subnet.broadcast());
        }
        reserved.extend(exclude.iter().copied());

        let range = range_start..=range_end;
        let total = (u32::from(range_end) - u32::from(range_start)) as u64 + 1;
        let reserved_in_range = reserved.iter().filter(|ip| range.contains(*ip)).count() as u64;
        let allocatable = total - reserved_in_range;
        if allocatable == 0 {
            return Err(ConfigError::EmptyRange {
                start: range_start,
                end: range_end,
            });
        }

        Ok(Self {
            subnet,
            range,
            gateway,
            reserved,
            allocatable,
        })
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }
    /// get the starting IP of the range
    pub fn range_start(&self) -> Ipv4Addr {
        *self.range.start()
    }
    /// get the ending IP of the range
    pub fn range_end(&self) -> Ipv4Addr {
        *self.range.end()
    }
    pub fn range(&self) -> RangeInclusive<Ipv4Addr> {
        self.range.clone()
    }
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }
    /// true iff `ip` lies within `[range_start, range_end]`
    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        self.range.contains(ip)
    }
    /// true for the gateway, network & broadcast addresses and explicit exclusions
    pub fn is_reserved(&self, ip: &Ipv4Addr) -> bool {
        self.reserved.contains(ip)
    }
    /// in range and not reserved
    pub fn is_allocatable(&self, ip: &Ipv4Addr) -> bool {
        self.contains(ip) && !self.is_reserved(ip)
    }
    /// count the total number of addresses that could possibly be
    /// handed out minus reservations
    pub fn allocatable_size(&self) -> u64 {
        self.allocatable
    }
    /// ascending iterator over every allocatable address
    pub fn iter(&self) -> AddressSpaceIter<'_> {
        AddressSpaceIter {
            reserved: &self.reserved,
            iter: Ipv4AddrRange::new(self.range_start(), self.range_end()),
        }
    }
}

fn parse_subnet(subnet: &str) -> Result<Ipv4Net, ConfigError> {
    subnet
        .trim()
        .parse::<Ipv4Net>()
        .map_err(|err| ConfigError::MalformedSubnet {
            subnet: subnet.to_owned(),
            reason: err.to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct AddressSpaceIter<'a> {
    reserved: &'a BTreeSet<Ipv4Addr>,
    iter: Ipv4AddrRange,
}

impl Iterator for AddressSpaceIter<'_> {
    type Item = Ipv4Addr;

    // skips reserved addresses
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = self.iter.next()?;
            if !self.reserved.contains(&next) {
                return Some(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_small_range() {
        let space = AddressSpace::parse(
            "172.20.0.0/16",
            ip("172.20.0.10"),
            ip("172.20.0.12"),
            ip("172.20.0.1"),
        )
        .unwrap();
        assert_eq!(space.allocatable_size(), 3);
        assert_eq!(
            space.iter().collect::<Vec<_>>(),
            vec![ip("172.20.0.10"), ip("172.20.0.11"), ip("172.20.0.12")]
        );
        assert!(space.contains(&ip("172.20.0.11")));
        assert!(!space.contains(&ip("172.20.0.13")));
        assert!(space.is_reserved(&ip("172.20.0.1")));
        assert!(space.is_reserved(&ip("172.20.0.0")));
        assert!(space.is_reserved(&ip("172.20.255.255")));
        assert!(!space.is_reserved(&ip("172.20.0.10")));
    }

    #[test]
    fn test_reserved_inside_range() {
        // whole /24, gateway in the range
        let space = AddressSpace::parse(
            "10.0.0.0/24",
            ip("10.0.0.0"),
            ip("10.0.0.255"),
            ip("10.0.0.1"),
        )
        .unwrap();
        assert_eq!(space.allocatable_size(), 253);
        let mut iter = space.iter();
        assert_eq!(iter.next(), Some(ip("10.0.0.2")));
        assert_eq!(space.iter().last(), Some(ip("10.0.0.254")));
        assert_eq!(space.iter().count() as u64, space.allocatable_size());
        assert!(space.contains(&ip("10.0.0.1")));
        assert!(!space.is_allocatable(&ip("10.0.0.1")));
    }

    #[test]
    fn test_exclusions() {
        let space = AddressSpace::with_exclusions(
            "192.168.1.0/24".parse().unwrap(),
            ip("192.168.1.100"),
            ip("192.168.1.103"),
            ip("192.168.1.1"),
            &[ip("192.168.1.101")],
        )
        .unwrap();
        assert_eq!(space.allocatable_size(), 3);
        assert_eq!(
            space.iter().collect::<Vec<_>>(),
            vec![ip("192.168.1.100"), ip("192.168.1.102"), ip("192.168.1.103")]
        );
    }

    #[test]
    fn test_point_to_point() {
        let space = AddressSpace::parse(
            "10.1.1.0/31",
            ip("10.1.1.0"),
            ip("10.1.1.1"),
            ip("10.1.1.0"),
        )
        .unwrap();
        assert_eq!(space.allocatable_size(), 1);
        assert_eq!(space.iter().collect::<Vec<_>>(), vec![ip("10.1.1.1")]);
    }

    #[test]
    fn test_host_bits_truncated() {
        let space = AddressSpace::parse(
            "172.20.5.5/16",
            ip("172.20.0.10"),
            ip("172.20.0.12"),
            ip("172.20.0.1"),
        )
        .unwrap();
        assert_eq!(space.subnet(), "172.20.0.0/16".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_malformed_subnet() {
        let err = AddressSpace::parse(
            "172.20.0.0/33",
            ip("172.20.0.10"),
            ip("172.20.0.12"),
            ip("172.20.0.1"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedSubnet { .. }));
        let err = AddressSpace::parse(
            "not-a-cidr",
            ip("172.20.0.10"),
            ip("172.20.0.12"),
            ip("172.20.0.1"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedSubnet { .. }));
    }

    #[test]
    fn test_range_outside_subnet() {
        let err = AddressSpace::parse(
            "172.20.0.0/16",
            ip("172.20.0.10"),
            ip("172.21.0.12"),
            ip("172.20.0.1"),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::OutsideSubnet {
                what: "range end",
                ip: ip("172.21.0.12"),
                subnet: "172.20.0.0/16".parse().unwrap(),
            }
        );
        let err = AddressSpace::parse(
            "172.20.0.0/16",
            ip("172.20.0.10"),
            ip("172.20.0.12"),
            ip("10.0.0.1"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutsideSubnet {
                what: "gateway",
                ..
            }
        ));
    }

    #[test]
    fn test_inverted_range() {
        let err = AddressSpace::parse(
            "172.20.0.0/16",
            ip("172.20.0.12"),
            ip("172.20.0.10"),
            ip("172.20.0.1"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvertedRange { .. }));
    }

    #[test]
    fn test_empty_after_reservations() {
        let err = AddressSpace::parse(
            "172.20.0.0/16",
            ip("172.20.0.1"),
            ip("172.20.0.1"),
            ip("172.20.0.1"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRange { .. }));
    }
}
