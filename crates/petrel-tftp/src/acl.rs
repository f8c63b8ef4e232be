//! Client subnet access control.
//!
//! When the server is not open to any client, the opening request of each
//! transfer is checked against a single permitted IPv4 subnet. Packets from
//! outside the subnet are dropped without a reply.

use std::net::Ipv4Addr;

use crate::error::{Result, TftpError};

/// A permitted IPv4 subnet: network address plus mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetFilter {
    network: u32,
    mask: u32,
}

impl SubnetFilter {
    /// Build a filter from an address string and a mask string. The mask is
    /// either a prefix length (`"16"`) or a dotted quad (`"255.255.0.0"`);
    /// dotted masks must have contiguous leading ones. The address is
    /// masked down to its network, so `192.168.1.7/24` and `192.168.1.0/24`
    /// define the same subnet.
    pub fn new(address: &str, mask: &str) -> Result<Self> {
        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| TftpError::Config(format!("invalid subnet address '{address}'")))?;
        let mask_bits = parse_mask(mask)?;
        Ok(Self {
            network: u32::from(address) & mask_bits,
            mask: mask_bits,
        })
    }

    /// True when `addr` falls inside the permitted subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask == self.network
    }
}

fn parse_mask(mask: &str) -> Result<u32> {
    if mask.contains('.') {
        let quad: Ipv4Addr = mask
            .parse()
            .map_err(|_| TftpError::Config(format!("invalid subnet mask '{mask}'")))?;
        let bits = u32::from(quad);
        // Contiguous-ones check: the complement of a valid mask is all
        // low-order ones, so adding one to it leaves no shared bits.
        if (!bits).wrapping_add(1) & !bits != 0 {
            return Err(TftpError::Config(format!(
                "subnet mask '{mask}' is not contiguous"
            )));
        }
        return Ok(bits);
    }
    let prefix: u32 = mask
        .parse()
        .map_err(|_| TftpError::Config(format!("invalid subnet mask '{mask}'")))?;
    if prefix > 32 {
        return Err(TftpError::Config(format!(
            "subnet prefix '{mask}' must be 0-32"
        )));
    }
    if prefix == 0 {
        return Ok(0);
    }
    Ok(u32::MAX << (32 - prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_mask_membership() {
        let filter = SubnetFilter::new("192.168.0.0", "24").unwrap();
        assert!(filter.contains(Ipv4Addr::new(192, 168, 0, 200)));
        assert!(!filter.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!filter.contains(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn dotted_mask_membership() {
        let filter = SubnetFilter::new("10.1.0.0", "255.255.0.0").unwrap();
        assert!(filter.contains(Ipv4Addr::new(10, 1, 200, 3)));
        assert!(!filter.contains(Ipv4Addr::new(10, 2, 0, 1)));
    }

    #[test]
    fn host_address_is_masked_to_network() {
        let a = SubnetFilter::new("192.168.1.7", "24").unwrap();
        let b = SubnetFilter::new("192.168.1.0", "24").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn slash_32_matches_one_host() {
        let filter = SubnetFilter::new("172.16.4.2", "32").unwrap();
        assert!(filter.contains(Ipv4Addr::new(172, 16, 4, 2)));
        assert!(!filter.contains(Ipv4Addr::new(172, 16, 4, 3)));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        let filter = SubnetFilter::new("0.0.0.0", "0").unwrap();
        assert!(filter.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn rejects_bad_address_or_mask() {
        assert!(SubnetFilter::new("not-an-ip", "24").is_err());
        assert!(SubnetFilter::new("192.168.0.0", "33").is_err());
        assert!(SubnetFilter::new("192.168.0.0", "255.0.255.0").is_err());
        assert!(SubnetFilter::new("192.168.0.0", "mask").is_err());
    }
}
