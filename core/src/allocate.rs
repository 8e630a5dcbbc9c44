//! Allocation of peer ordinals, peer addresses and new instances
//!
//! All functions are pure over a snapshot of the host. Nothing is cached:
//! callers take a fresh snapshot before every allocation.

use crate::config::NetworkSection;
use crate::{Error, InstanceAllocation, InstanceDetail, PortRange, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Next peer ordinal: one past the highest seen, starting at 1
///
/// `high_water` is the largest ordinal ever handed out for the instance in
/// this session, so ordinals of deleted peers are not reused.
pub fn next_peer_ordinal(existing: &[u32], high_water: Option<u32>) -> u32 {
    existing
        .iter()
        .copied()
        .chain(high_water)
        .max()
        .unwrap_or(0)
        + 1
}

/// First address of `subnet` not inside any network in `taken`
///
/// Scans from the second host address to the second-to-last one, which for
/// a `/24` is `.2` through `.253`. Single addresses are passed as `/32`
/// networks; a peer whose `AllowedIPs` is wider claims its whole range.
pub fn next_free_address(subnet: Ipv4Net, taken: &[Ipv4Net]) -> Result<Ipv4Addr> {
    let subnet = subnet.trunc();
    let first = u32::from(subnet.network()).saturating_add(2);
    let last = u32::from(subnet.broadcast()).saturating_sub(2);
    (first..=last)
        .map(Ipv4Addr::from)
        .find(|addr| !taken.iter().any(|net| net.contains(addr)))
        .ok_or_else(|| Error::SubnetExhausted(subnet.to_string()))
}

/// Resources of instance ordinal `n` under the fixed progression
pub fn instance_allocation(n: u32, network: &NetworkSection) -> Option<InstanceAllocation> {
    let listen_port = u32::from(network.base_listen_port)
        .checked_add(u32::from(network.listen_port_step).checked_mul(n)?)?;
    let start = u32::from(network.base_forward_port)
        .checked_add(u32::from(network.forward_range_size).checked_mul(n)?)?;
    let end = start.checked_add(u32::from(network.forward_range_size) - 1)?;
    let third_octet = u8::try_from(n.checked_add(1)?).ok()?;

    let prefix: Vec<u8> = network
        .subnet_prefix
        .split('.')
        .filter_map(|o| o.parse().ok())
        .collect();
    let &[a, b] = prefix.as_slice() else {
        return None;
    };
    let server_address = Ipv4Net::new(Ipv4Addr::new(a, b, third_octet, 1), 24).ok()?;

    Some(InstanceAllocation {
        ordinal: n,
        name: format!("wg{}", n),
        listen_port: u16::try_from(listen_port).ok()?,
        forward_range: PortRange::new(u16::try_from(start).ok()?, u16::try_from(end).ok()?),
        server_address,
    })
}

/// Forwarded range of instance ordinal `n` under the fixed progression
pub fn arithmetic_range(n: u32, network: &NetworkSection) -> Option<PortRange> {
    instance_allocation(n, network).map(|a| a.forward_range)
}

/// What an existing or already planned instance occupies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub name: String,
    pub listen_port: Option<u16>,
    pub range: Option<PortRange>,
    pub subnet: Option<Ipv4Net>,
}

impl From<&InstanceDetail> for Claim {
    fn from(detail: &InstanceDetail) -> Self {
        Self {
            name: detail.name.clone(),
            listen_port: detail.listen_port,
            range: detail.port_mapping.map(|m| m.range),
            subnet: detail.subnet(),
        }
    }
}

impl From<&InstanceAllocation> for Claim {
    fn from(allocation: &InstanceAllocation) -> Self {
        Self {
            name: allocation.name.clone(),
            listen_port: Some(allocation.listen_port),
            range: Some(allocation.forward_range),
            subnet: Some(allocation.subnet()),
        }
    }
}

fn conflicts(candidate: &InstanceAllocation, claim: &Claim) -> bool {
    let ours = candidate.forward_range;
    let name = candidate.name == claim.name;
    let port = claim.listen_port.is_some_and(|p| {
        p == candidate.listen_port || ours.contains(p)
    });
    let range = claim.range.is_some_and(|r| {
        r.overlaps(&ours) || r.contains(candidate.listen_port)
    });
    let subnet = claim.subnet.is_some_and(|s| {
        s.contains(&candidate.subnet()) || candidate.subnet().contains(&s)
    });
    name || port || range || subnet
}

/// Smallest ordinal whose name, ports and subnet collide with nothing claimed
pub fn next_instance_allocation(
    claims: &[Claim],
    network: &NetworkSection,
) -> Result<InstanceAllocation> {
    let mut n = 0u32;
    while let Some(candidate) = instance_allocation(n, network) {
        if !claims.iter().any(|c| conflicts(&candidate, c)) {
            log::debug!(
                "allocated {} port {} range {}",
                candidate.name,
                candidate.listen_port,
                candidate.forward_range
            );
            return Ok(candidate);
        }
        n += 1;
    }
    Err(Error::SubnetExhausted(format!(
        "{}.0.0/16 (no instance slot left)",
        network.subnet_prefix
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn network() -> NetworkSection {
        EngineConfig::default().network
    }

    #[test]
    fn test_next_peer_ordinal() {
        assert_eq!(next_peer_ordinal(&[], None), 1);
        assert_eq!(next_peer_ordinal(&[1, 3, 2], None), 4);
        assert_eq!(next_peer_ordinal(&[1], Some(5)), 6);
    }

    #[test]
    fn test_next_free_address_skips_taken() {
        let subnet: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let taken = [
            Ipv4Net::from(Ipv4Addr::new(10, 0, 1, 1)),
            Ipv4Net::from(Ipv4Addr::new(10, 0, 1, 2)),
        ];
        assert_eq!(
            next_free_address(subnet, &taken).unwrap(),
            Ipv4Addr::new(10, 0, 1, 3)
        );
        assert_eq!(
            next_free_address(subnet, &taken).unwrap(),
            next_free_address(subnet, &taken).unwrap()
        );
        assert_eq!(
            next_free_address("10.0.1.1/24".parse().unwrap(), &[]).unwrap(),
            Ipv4Addr::new(10, 0, 1, 2)
        );
    }

    #[test]
    fn test_subnet_exhausted() {
        let subnet: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let taken: Vec<Ipv4Net> = (2..=253)
            .map(|i| Ipv4Net::from(Ipv4Addr::new(10, 0, 1, i)))
            .collect();
        let err = next_free_address(subnet, &taken).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SubnetExhausted);
    }

    #[test]
    fn test_next_free_address_skips_wide_allowed_ips() {
        let subnet: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let taken = [
            Ipv4Net::from(Ipv4Addr::new(10, 0, 1, 1)),
            "10.0.1.2/31".parse().unwrap(),
        ];
        assert_eq!(
            next_free_address(subnet, &taken).unwrap(),
            Ipv4Addr::new(10, 0, 1, 4)
        );

        let taken = ["10.0.1.0/28".parse().unwrap()];
        assert_eq!(
            next_free_address(subnet, &taken).unwrap(),
            Ipv4Addr::new(10, 0, 1, 16)
        );
    }

    #[test]
    fn test_instance_progression() {
        let a = instance_allocation(0, &network()).unwrap();
        assert_eq!(a.listen_port, 52835);
        assert_eq!(a.forward_range, PortRange::new(55835, 56834));
        assert_eq!(a.server_address.to_string(), "10.0.1.1/24");

        let b = instance_allocation(1, &network()).unwrap();
        assert_eq!(b.name, "wg1");
        assert_eq!(b.listen_port, 52845);
        assert_eq!(b.forward_range, PortRange::new(56835, 57834));
        assert_eq!(b.subnet().to_string(), "10.0.2.0/24");

        // 55835 + 1000n runs out of u16 space before 255 instances
        assert!(instance_allocation(10, &network()).is_none());
    }

    #[test]
    fn test_next_instance_skips_claimed() {
        let existing = Claim {
            name: "wg0".to_string(),
            listen_port: Some(52835),
            range: Some(PortRange::new(55835, 56834)),
            subnet: Some("10.0.1.0/24".parse().unwrap()),
        };
        let next = next_instance_allocation(&[existing.clone()], &network()).unwrap();
        assert_eq!(next.name, "wg1");
        assert!(!next.forward_range.overlaps(&existing.range.unwrap()));

        // a hand-made instance squatting on wg1's subnet pushes allocation on
        let squatter = Claim {
            name: "office".to_string(),
            listen_port: Some(51820),
            range: None,
            subnet: Some("10.0.2.0/24".parse().unwrap()),
        };
        let next = next_instance_allocation(&[existing, squatter], &network()).unwrap();
        assert_eq!(next.name, "wg2");
    }

    #[test]
    fn test_instance_slots_exhausted() {
        let claims: Vec<Claim> = (0..10)
            .filter_map(|n| instance_allocation(n, &network()))
            .map(|a| Claim::from(&a))
            .collect();
        let err = next_instance_allocation(&claims, &network()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SubnetExhausted);
    }
}
