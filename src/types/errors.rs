use std::fmt;

/// Possible errors returned by methods on a tiered RIB, or one of its tiers.
///
/// Only `StorageExhausted`, `IoFailure` and `ConfigInvalid` normally reach
/// the callers of the engine's public API: `CapacityExceeded` is handled by
/// the write path, and `CorruptEntry` is handled by quarantining the entry.
/// Both are still returned by the tiers themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// The memory tier holds its configured maximum number of entries. The
    /// write should be retried after migration has made room, or be placed
    /// on disk instead.
    CapacityExceeded,
    /// The disk tier has reached its byte budget. New writes fail until
    /// compaction frees space.
    StorageExhausted,
    /// A disk operation failed, even after retrying with backoff. The
    /// string holds the last underlying error.
    IoFailure(String),
    /// A stored record failed its checksum, or could not be decoded. The
    /// record has been quarantined.
    CorruptEntry,
    /// The configuration contains a bad threshold, path or mode
    /// combination. The string describes the offending option.
    ConfigInvalid(String),
}

impl EngineError {
    /// A short, stable name for the kind of error, used as a label in the
    /// error counters.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::CapacityExceeded => ErrorKind::CapacityExceeded,
            EngineError::StorageExhausted => ErrorKind::StorageExhausted,
            EngineError::IoFailure(_) => ErrorKind::IoFailure,
            EngineError::CorruptEntry => ErrorKind::CorruptEntry,
            EngineError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
        }
    }
}

impl std::error::Error for EngineError {}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::CapacityExceeded => {
                write!(f, "Error: The memory tier is at capacity.")
            }
            EngineError::StorageExhausted => write!(
                f,
                "Error: The disk tier has exhausted its storage budget. \
                Writes will fail until compaction frees space."
            ),
            EngineError::IoFailure(e) => {
                write!(f, "Error: Disk I/O failed: {}", e)
            }
            EngineError::CorruptEntry => write!(
                f,
                "Error: A stored entry is corrupt and has been quarantined."
            ),
            EngineError::ConfigInvalid(e) => {
                write!(f, "Error: Invalid configuration: {}", e)
            }
        }
    }
}

impl From<lsm_tree::Error> for EngineError {
    fn from(value: lsm_tree::Error) -> Self {
        EngineError::IoFailure(value.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        EngineError::IoFailure(value.to_string())
    }
}

//------------ ErrorKind -----------------------------------------------------

/// The kind of an [EngineError], without its payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CapacityExceeded,
    StorageExhausted,
    IoFailure,
    CorruptEntry,
    ConfigInvalid,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::CapacityExceeded,
        ErrorKind::StorageExhausted,
        ErrorKind::IoFailure,
        ErrorKind::CorruptEntry,
        ErrorKind::ConfigInvalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::StorageExhausted => "storage_exhausted",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::CorruptEntry => "corrupt_entry",
            ErrorKind::ConfigInvalid => "config_invalid",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ErrorKind::CapacityExceeded => 0,
            ErrorKind::StorageExhausted => 1,
            ErrorKind::IoFailure => 2,
            ErrorKind::CorruptEntry => 3,
            ErrorKind::ConfigInvalid => 4,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
