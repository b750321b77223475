//! Binary framing for persisted records.
//!
//! All records are serialized with:
//! - JSON for data (the serde derives of the domain types)
//! - Length-prefixed format for framing
//! - CRC32 checksum for corruption detection
//! - Version byte for forward compatibility

use std::io::{Read, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying pkbp snapshot files.
pub const MAGIC: [u8; 4] = *b"PKBP";

/// Largest record accepted by [`decode`].
const MAX_RECORD_SIZE: usize = 1 << 30;

/// Serializes a value to one framed record.
///
/// Format:
/// ```text
/// [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
/// ```
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let data = serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })?;
    let len = u32::try_from(data.len()).map_err(|_| StorageError::Serialization {
        message: format!("record of {} bytes does not fit a frame", data.len()),
    })?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Reads one framed record, verifying its checksum.
///
/// # Errors
/// `Corrupted` on version, size or checksum mismatch; `Serialization`
/// if the payload does not deserialize; `Io` on short reads.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, StorageError> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(StorageError::Corrupted {
            message: format!("unsupported codec version {} (expected {CODEC_VERSION})", version[0]),
        });
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(StorageError::Corrupted {
            message: format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}"),
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(StorageError::Corrupted {
            message: format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}"),
        });
    }

    serde_json::from_slice(&data).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

/// Writes the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> Result<(), StorageError> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Reads and validates the file header, returning its version.
pub fn read_header(reader: &mut impl Read) -> Result<u8, StorageError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(StorageError::Corrupted {
            message: format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        });
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_roundtrip_simple() {
        let value = vec!["jane".to_string(), "smith".to_string()];
        let encoded = encode(&value).unwrap();
        let decoded: Vec<String> = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"test data".to_string()).unwrap();
        encoded[7] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }

    #[test]
    fn test_rejects_oversized_record() {
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);

        let err = read_header(&mut Cursor::new(b"NOPE\x01".to_vec())).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }

    #[test]
    fn test_truncated_record_is_io_error() {
        let encoded = encode(&42u32).unwrap();
        let err = decode::<u32>(&mut Cursor::new(&encoded[..encoded.len() - 2])).unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }
}
