use std::fmt;
use std::net::{AddrParseError, IpAddr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubnetError {
    #[error("expected ADDRESS/PREFIX")]
    MissingPrefix,

    #[error("invalid network address: {0}")]
    Address(#[from] AddrParseError),

    #[error("invalid prefix length {0:?}")]
    Prefix(String),

    #[error("prefix length {prefix} exceeds {max}")]
    PrefixTooLong { prefix: u8, max: u8 },
}

/// CIDR block agents must report their `X-Real-IP` from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedSubnet {
    network: IpAddr,
    prefix: u8,
}

impl TrustedSubnet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = v4_mask(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = v6_mask(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(IpAddr::V4(v4))),
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

impl FromStr for TrustedSubnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.trim().split_once('/').ok_or(SubnetError::MissingPrefix)?;
        let network: IpAddr = addr.parse()?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| SubnetError::Prefix(prefix.to_string()))?;

        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(SubnetError::PrefixTooLong { prefix, max });
        }

        let network = match network {
            IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & v4_mask(prefix)).into()),
            IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & v6_mask(prefix)).into()),
        };

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for TrustedSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip")
    }

    #[test]
    fn test_v4_membership() {
        let subnet: TrustedSubnet = "192.168.1.0/24".parse().expect("parse");
        assert!(subnet.contains(ip("192.168.1.77")));
        assert!(!subnet.contains(ip("192.168.2.1")));
        assert!(subnet.contains(ip("::ffff:192.168.1.5")));
        assert!(!subnet.contains(ip("fe80::1")));
    }

    #[test]
    fn test_network_is_normalized() {
        let subnet: TrustedSubnet = "10.1.2.3/8".parse().expect("parse");
        assert_eq!(subnet.to_string(), "10.0.0.0/8");
        assert!(subnet.contains(ip("10.200.0.1")));
    }

    #[test]
    fn test_edge_prefixes() {
        let all: TrustedSubnet = "0.0.0.0/0".parse().expect("parse");
        assert!(all.contains(ip("203.0.113.9")));

        let single: TrustedSubnet = "127.0.0.1/32".parse().expect("parse");
        assert!(single.contains(ip("127.0.0.1")));
        assert!(!single.contains(ip("127.0.0.2")));
    }

    #[test]
    fn test_v6_membership() {
        let subnet: TrustedSubnet = "2001:db8::/32".parse().expect("parse");
        assert!(subnet.contains(ip("2001:db8:ffff::1")));
        assert!(!subnet.contains(ip("2001:db9::1")));
        assert!(!subnet.contains(ip("10.0.0.1")));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            "10.0.0.0".parse::<TrustedSubnet>(),
            Err(SubnetError::MissingPrefix)
        ));
        assert!(matches!(
            "10.0.0.0/40".parse::<TrustedSubnet>(),
            Err(SubnetError::PrefixTooLong { prefix: 40, max: 32 })
        ));
        assert!(matches!(
            "10.0.0/8".parse::<TrustedSubnet>(),
            Err(SubnetError::Address(_))
        ));
        assert!(matches!(
            "10.0.0.0/x".parse::<TrustedSubnet>(),
            Err(SubnetError::Prefix(_))
        ));
    }
}
