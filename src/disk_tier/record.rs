use zerocopy::{
    BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, U32,
    U64,
};

use crate::errors::EngineError;
use crate::types::{Payload, RouteEntry};

const FLAG_TOMBSTONE: u8 = 0b0000_0001;
const FLAG_COMPRESSED: u8 = 0b0000_0010;

//------------ ValueHeader ---------------------------------------------------

// The header in front of every value in the disk tier. The checksum covers
// the rest of the header and the (possibly compressed) body.
#[derive(
    Copy, Clone, Debug, KnownLayout, Immutable, FromBytes, IntoBytes, Unaligned,
)]
#[repr(C)]
pub(crate) struct ValueHeader {
    checksum: U32<BigEndian>,   // 4
    flags: u8,                  // 1
    written_at: U64<BigEndian>, // 8
    raw_len: U32<BigEndian>,    // 4
} // 17

impl ValueHeader {
    fn checksum_for(&self, body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[self.flags]);
        hasher.update(self.written_at.as_bytes());
        hasher.update(self.raw_len.as_bytes());
        hasher.update(body);
        hasher.finalize()
    }
}

//------------ ValueMeta -----------------------------------------------------

// What the disk tier's version index needs to know about a stored value,
// without decompressing it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ValueMeta {
    pub tombstone: bool,
    pub written_at: u64,
}

//------------ Encoding ------------------------------------------------------

// Encode an entry into the bytes of a value. The payload is compressed only
// if asked for, and only if that actually makes it smaller.
pub(crate) fn encode(
    entry: &RouteEntry,
    written_at: u64,
    compression: bool,
) -> Vec<u8> {
    let raw = entry.payload.as_bytes();
    let compressed = if compression && !raw.is_empty() {
        let c = lz4_flex::compress(raw);
        if c.len() < raw.len() {
            Some(c)
        } else {
            None
        }
    } else {
        None
    };

    let mut flags = 0;
    if entry.tombstone {
        flags |= FLAG_TOMBSTONE;
    }
    if compressed.is_some() {
        flags |= FLAG_COMPRESSED;
    }

    let body = compressed.as_deref().unwrap_or(raw);
    let mut header = ValueHeader {
        checksum: 0.into(),
        flags,
        written_at: written_at.into(),
        raw_len: (raw.len() as u32).into(),
    };
    header.checksum = header.checksum_for(body).into();

    let mut value = header.as_bytes().to_vec();
    value.extend_from_slice(body);
    value
}

// Verify the checksum of a value and return its header and body.
fn verified(bytes: &[u8]) -> Result<(ValueHeader, &[u8]), EngineError> {
    let (header, body) = ValueHeader::read_from_prefix(bytes)
        .map_err(|_| EngineError::CorruptEntry)?;
    if header.checksum.get() != header.checksum_for(body) {
        return Err(EngineError::CorruptEntry);
    }
    Ok((header, body))
}

pub(crate) fn decode_meta(bytes: &[u8]) -> Result<ValueMeta, EngineError> {
    let (header, _) = verified(bytes)?;
    Ok(ValueMeta {
        tombstone: header.flags & FLAG_TOMBSTONE != 0,
        written_at: header.written_at.get(),
    })
}

pub(crate) fn decode_payload(
    bytes: &[u8],
) -> Result<(ValueMeta, Payload), EngineError> {
    let (header, body) = verified(bytes)?;
    let raw_len = header.raw_len.get() as usize;

    let payload = if header.flags & FLAG_COMPRESSED != 0 {
        let raw = lz4_flex::decompress(body, raw_len)
            .map_err(|_| EngineError::CorruptEntry)?;
        if raw.len() != raw_len {
            return Err(EngineError::CorruptEntry);
        }
        Payload::from(raw)
    } else {
        if body.len() != raw_len {
            return Err(EngineError::CorruptEntry);
        }
        Payload::from(body)
    };

    Ok((
        ValueMeta {
            tombstone: header.flags & FLAG_TOMBSTONE != 0,
            written_at: header.written_at.get(),
        },
        payload,
    ))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use inetnum::addr::Prefix;

    use super::*;

    fn entry(payload: Vec<u8>) -> RouteEntry {
        RouteEntry::new(
            Prefix::from_str("192.0.2.0/24").unwrap(),
            Payload::from(payload),
            3,
        )
    }

    #[test]
    fn compression_is_transparent() {
        let payload = b"AS_PATH 65000 65001 65002 ".repeat(40);
        let e = entry(payload.clone());

        let plain = encode(&e, 42, false);
        let packed = encode(&e, 42, true);
        assert!(packed.len() < plain.len());

        for bytes in [plain, packed] {
            let (meta, p) = decode_payload(&bytes).unwrap();
            assert_eq!(p.as_bytes(), payload.as_slice());
            assert_eq!(meta.written_at, 42);
            assert!(!meta.tombstone);
        }
    }

    #[test]
    fn incompressible_payload_is_stored_raw() {
        let e = entry(vec![1, 2, 3]);
        let bytes = encode(&e, 1, true);
        assert_eq!(bytes.len(), 17 + 3);
        assert_eq!(decode_payload(&bytes).unwrap().1.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn tombstones() {
        let e = RouteEntry::tombstone(
            Prefix::from_str("192.0.2.0/24").unwrap(),
            7,
        );
        let bytes = encode(&e, 99, true);
        let meta = decode_meta(&bytes).unwrap();
        assert!(meta.tombstone);
        assert_eq!(meta.written_at, 99);
    }

    #[test]
    fn corruption_is_detected() {
        let e = entry(b"some attributes".to_vec());
        let mut bytes = encode(&e, 1, false);
        if let Some(b) = bytes.last_mut() {
            *b ^= 0xff;
        }
        assert_eq!(decode_payload(&bytes), Err(EngineError::CorruptEntry));
        assert_eq!(decode_meta(&bytes), Err(EngineError::CorruptEntry));

        // Too short to even hold a header.
        assert_eq!(decode_meta(&[0, 1, 2]), Err(EngineError::CorruptEntry));
    }
}
