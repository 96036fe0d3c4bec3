use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use inetnum::addr::Prefix;
use zerocopy::{
    BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, U64,
};

use crate::errors::EngineError;

// Address family markers in the persisted keys. IPv4 sorts before IPv6, like
// it does for `std::net::IpAddr`.
const AFI_V4: u8 = 1;
const AFI_V6: u8 = 2;

/// The number of key ranges the persisted key space is divided into: one per
/// (address family, first octet of the address).
#[cfg(test)]
pub const KEY_RANGES: u32 = 512;

//------------ PrefixKey -----------------------------------------------------

// The prefix as it is laid out in the keys of the disk tier. The network
// address is stored big endian and before the length, so that the byte
// order of the keys is: address family, address, length. IPv4 addresses
// occupy the first four bytes of `net`. The derived `Ord` gives the same
// order, so it is used as the key of all the ordered maps in the engine and
// as the canonical prefix order for tie-breaks.
#[derive(
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Debug,
    Copy,
    Clone,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(C)]
pub(crate) struct PrefixKey {
    afi: u8,
    net: [u8; 16],
    len: u8,
} // 18

impl PrefixKey {
    pub(crate) fn range_id(&self) -> u32 {
        let first = self.net[0] as u32;
        if self.afi == AFI_V4 {
            first
        } else {
            256 + first
        }
    }
}

impl From<&Prefix> for PrefixKey {
    fn from(value: &Prefix) -> Self {
        let mut net = [0_u8; 16];
        let afi = match value.addr() {
            IpAddr::V4(addr) => {
                for (t, s) in net.iter_mut().zip(addr.octets()) {
                    *t = s;
                }
                AFI_V4
            }
            IpAddr::V6(addr) => {
                net = addr.octets();
                AFI_V6
            }
        };

        Self {
            afi,
            net,
            len: value.len(),
        }
    }
}

impl TryFrom<&PrefixKey> for Prefix {
    type Error = EngineError;

    fn try_from(value: &PrefixKey) -> Result<Self, Self::Error> {
        let addr = match value.afi {
            AFI_V4 => {
                let mut octets = [0_u8; 4];
                for (t, s) in octets.iter_mut().zip(value.net) {
                    *t = s;
                }
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AFI_V6 => IpAddr::V6(Ipv6Addr::from(value.net)),
            _ => return Err(EngineError::CorruptEntry),
        };
        Prefix::new(addr, value.len).map_err(|_| EngineError::CorruptEntry)
    }
}

//------------ VersionedKey --------------------------------------------------

// The full key of one stored version of a prefix. Versions are big endian,
// so a prefix scan over the `PrefixKey` returns them oldest first.
#[derive(
    Eq,
    PartialEq,
    Debug,
    Copy,
    Clone,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(C)]
pub(crate) struct VersionedKey {
    pub(crate) prefix: PrefixKey,       // 18
    pub(crate) version: U64<BigEndian>, // 8
} // 26

pub(crate) const VERSIONED_KEY_SIZE: usize = 26;

impl VersionedKey {
    pub(crate) fn new(prefix: &Prefix, version: u64) -> Self {
        Self {
            prefix: PrefixKey::from(prefix),
            version: version.into(),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.get()
    }
}

//------------ Helpers -------------------------------------------------------

/// Returns the key range a prefix belongs to, a number smaller than
/// [KEY_RANGES].
#[cfg(test)]
pub fn range_id(prefix: &Prefix) -> u32 {
    PrefixKey::from(prefix).range_id()
}

/// Returns the prefix of length `len` that covers `addr`, i.e. `addr` with
/// all bits beyond `len` set to zero. Returns `None` if `len` is too large
/// for the address family.
pub fn covering_prefix(addr: IpAddr, len: u8) -> Option<Prefix> {
    let net = match addr {
        IpAddr::V4(a) => {
            if len > 32 {
                return None;
            }
            let mask = u32::MAX.checked_shl(32 - len as u32).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(u32::from(a) & mask))
        }
        IpAddr::V6(a) => {
            if len > 128 {
                return None;
            }
            let mask = u128::MAX.checked_shl(128 - len as u32).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(u128::from(a) & mask))
        }
    };
    Prefix::new(net, len).ok()
}

/// The maximum prefix length for the address family of `addr`.
pub fn max_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}
