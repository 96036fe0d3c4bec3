use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use inetnum::addr::Prefix;

//------------ Payload -------------------------------------------------------

/// The opaque path attributes stored for a prefix.
///
/// The engine never looks inside a payload. Cloning is cheap, the bytes are
/// shared between the tiers, the cache and readers.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self(value.into())
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().into())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self(value.into_bytes().into())
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(value: &[u8; N]) -> Self {
        Self(value.as_slice().into())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Payload({:?})", s),
            Err(_) => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "<{} bytes>", self.0.len()),
        }
    }
}

//------------ RouteEntry ----------------------------------------------------

/// A single version of the route stored for a prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    pub prefix: Prefix,
    pub payload: Payload,
    /// Assigned by the engine at write time, starting at 1 for the first
    /// insert of a prefix.
    pub version: u64,
    /// Set on withdrawal. A tombstone carries an empty payload.
    pub tombstone: bool,
}

impl RouteEntry {
    pub fn new(prefix: Prefix, payload: Payload, version: u64) -> Self {
        Self {
            prefix,
            payload,
            version,
            tombstone: false,
        }
    }

    pub fn tombstone(prefix: Prefix, version: u64) -> Self {
        Self {
            prefix,
            payload: Payload::empty(),
            version,
            tombstone: true,
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tombstone {
            write!(f, "{} v{} (withdrawn)", self.prefix, self.version)
        } else {
            write!(f, "{} v{} {}", self.prefix, self.version, self.payload)
        }
    }
}

//------------ RouteOperation ------------------------------------------------

/// The kind of ingestion event applied to a prefix.
///
/// `Insert` and `Update` are both upserts: the engine does not care whether
/// the prefix was known before.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RouteOperation {
    Insert,
    Update,
    Withdraw,
}

impl fmt::Display for RouteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteOperation::Insert => write!(f, "insert"),
            RouteOperation::Update => write!(f, "update"),
            RouteOperation::Withdraw => write!(f, "withdraw"),
        }
    }
}

//------------ RouteEvent ----------------------------------------------------

/// An ingestion event, as produced by an external source.
#[derive(Clone, Debug)]
pub struct RouteEvent {
    pub prefix: Prefix,
    pub operation: RouteOperation,
    pub payload: Payload,
}

impl RouteEvent {
    pub fn insert(prefix: Prefix, payload: impl Into<Payload>) -> Self {
        Self {
            prefix,
            operation: RouteOperation::Insert,
            payload: payload.into(),
        }
    }

    pub fn update(prefix: Prefix, payload: impl Into<Payload>) -> Self {
        Self {
            prefix,
            operation: RouteOperation::Update,
            payload: payload.into(),
        }
    }

    pub fn withdraw(prefix: Prefix) -> Self {
        Self {
            prefix,
            operation: RouteOperation::Withdraw,
            payload: Payload::empty(),
        }
    }
}

//------------ TierLocation --------------------------------------------------

/// The tier holding the authoritative copy of a prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TierLocation {
    Memory = 1,
    Disk = 2,
}

impl TierLocation {
    pub fn other(self) -> Self {
        match self {
            TierLocation::Memory => TierLocation::Disk,
            TierLocation::Disk => TierLocation::Memory,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TierLocation::Memory),
            2 => Some(TierLocation::Disk),
            _ => None,
        }
    }
}

impl fmt::Display for TierLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierLocation::Memory => write!(f, "memory"),
            TierLocation::Disk => write!(f, "disk"),
        }
    }
}

// Milliseconds since the UNIX epoch. Wall clock time is used, so that
// tombstone ages survive a restart of the engine.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
