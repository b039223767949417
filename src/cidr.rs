use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Malformed CIDR block: {0}")]
    Malformed(String),

    #[error("CIDR block {0} has host bits set")]
    HostBitsSet(String),

    #[error("Prefix /{prefix} does not fit inside {parent}")]
    PrefixOutOfRange { prefix: u8, parent: String },

    #[error("Address space of {parent} exhausted while allocating a /{prefix}")]
    Exhausted { prefix: u8, parent: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self, Error> {
        if prefix > 32 {
            return Err(Error::Malformed(format!("{}/{}", network, prefix)));
        }
        let cidr = Self { network, prefix };
        if u32::from(network) & !mask_v4(prefix) != 0 {
            return Err(Error::HostBitsSet(cidr.to_string()));
        }

        return Ok(cidr);
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    fn first(&self) -> u64 {
        u32::from(self.network) as u64
    }

    /// One past the last address of the block.
    fn end(&self) -> u64 {
        self.first() + (1u64 << (32 - self.prefix))
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.first() >= self.first() && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.first() < other.end() && other.first() < self.end()
    }
}

fn mask_v4(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - p),
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = split_cidr(s)?;
        let network =
            Ipv4Addr::from_str(address).map_err(|_| Error::Malformed(s.to_string()))?;

        return Ipv4Cidr::new(network, prefix);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Cidr {
    network: Ipv6Addr,
    prefix: u8,
}

impl Ipv6Cidr {
    pub fn new(network: Ipv6Addr, prefix: u8) -> Result<Self, Error> {
        if prefix > 128 {
            return Err(Error::Malformed(format!("{}/{}", network, prefix)));
        }
        let cidr = Self { network, prefix };
        let mask = match prefix {
            0 => 0,
            p => u128::MAX << (128 - p),
        };
        if u128::from(network) & !mask != 0 {
            return Err(Error::HostBitsSet(cidr.to_string()));
        }

        return Ok(cidr);
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl fmt::Display for Ipv6Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv6Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = split_cidr(s)?;
        let network =
            Ipv6Addr::from_str(address).map_err(|_| Error::Malformed(s.to_string()))?;

        return Ipv6Cidr::new(network, prefix);
    }
}

fn split_cidr(s: &str) -> Result<(&str, u8), Error> {
    let (address, prefix) = s
        .split_once('/')
        .ok_or_else(|| Error::Malformed(s.to_string()))?;
    let prefix = prefix
        .parse::<u8>()
        .map_err(|_| Error::Malformed(s.to_string()))?;

    return Ok((address, prefix));
}

/// Hands out consecutive IPv4 blocks from a parent range. Each block is
/// aligned to its own size, so blocks never overlap and never leave the
/// parent.
#[derive(Debug)]
pub struct Ipv4Allocator {
    parent: Ipv4Cidr,
    next: u64,
}

impl Ipv4Allocator {
    pub fn new(parent: Ipv4Cidr) -> Self {
        Self {
            next: parent.first(),
            parent,
        }
    }

    pub fn allocate(&mut self, prefix: u8) -> Result<Ipv4Cidr, Error> {
        if prefix < self.parent.prefix || prefix > 32 {
            return Err(Error::PrefixOutOfRange {
                prefix,
                parent: self.parent.to_string(),
            });
        }

        let size = 1u64 << (32 - prefix);
        let start = self.next.div_ceil(size) * size;
        if start + size > self.parent.end() {
            return Err(Error::Exhausted {
                prefix,
                parent: self.parent.to_string(),
            });
        }
        self.next = start + size;

        return Ipv4Cidr::new(Ipv4Addr::from(start as u32), prefix);
    }
}

/// Hands out consecutive /64 blocks, the only IPv6 subnet size the VPC
/// accepts.
#[derive(Debug)]
pub struct Ipv6Allocator {
    parent: Ipv6Cidr,
    issued: u128,
}

impl Ipv6Allocator {
    pub const SUBNET_PREFIX: u8 = 64;

    pub fn new(parent: Ipv6Cidr) -> Result<Self, Error> {
        if parent.prefix > Self::SUBNET_PREFIX {
            return Err(Error::PrefixOutOfRange {
                prefix: Self::SUBNET_PREFIX,
                parent: parent.to_string(),
            });
        }

        return Ok(Self { parent, issued: 0 });
    }

    pub fn allocate(&mut self) -> Result<Ipv6Cidr, Error> {
        let capacity = 1u128 << (Self::SUBNET_PREFIX - self.parent.prefix);
        if self.issued >= capacity {
            return Err(Error::Exhausted {
                prefix: Self::SUBNET_PREFIX,
                parent: self.parent.to_string(),
            });
        }

        let start = u128::from(self.parent.network) + (self.issued << 64);
        self.issued += 1;

        Ipv6Cidr::new(Ipv6Addr::from(start), Self::SUBNET_PREFIX)
    }
}
