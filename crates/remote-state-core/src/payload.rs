use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};

use crate::error::StateError;

/// First byte of every gzip stream.
pub const GZIP_MAGIC: u8 = 0x1f;

/// The state blob as seen by callers, plus its MD5 digest.
///
/// `md5` is always computed over `data` as returned, i.e. after any
/// transparent decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Vec<u8>,
    pub md5: [u8; 16],
}

impl Payload {
    pub fn new(data: Vec<u8>) -> Self {
        let md5 = checksum(&data);
        Self { data, md5 }
    }

    /// Build a payload from bytes as stored by a backend, unwrapping a gzip
    /// envelope if present.
    pub fn from_stored(raw: Vec<u8>) -> Result<Self, StateError> {
        Ok(Self::new(decompress(raw)?))
    }

    /// Build a payload whose digest was reported by the backend, failing if
    /// it does not match the data.
    pub fn with_checksum(data: Vec<u8>, md5: &[u8]) -> Result<Self, StateError> {
        let actual = checksum(&data);
        if md5 != actual {
            return Err(StateError::Checksum {
                expected: hex::encode(md5),
                actual: hex::encode(actual),
            });
        }
        Ok(Self { data, md5: actual })
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }
}

/// MD5 digest of `data`.
pub fn checksum(data: &[u8]) -> [u8; 16] {
    let digest = Md5::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.first() == Some(&GZIP_MAGIC)
}

/// Gzip `data` for storage.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, StateError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| StateError::Serialization(format!("Failed to compress state: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| StateError::Serialization(format!("Failed to compress state: {}", e)))
}

/// Undo [`compress`]; bytes without the gzip magic byte pass through.
pub fn decompress(raw: Vec<u8>) -> Result<Vec<u8>, StateError> {
    if !is_gzip(&raw) {
        return Ok(raw);
    }

    let mut data = Vec::new();
    GzDecoder::new(raw.as_slice())
        .read_to_end(&mut data)
        .map_err(|e| StateError::Serialization(format!("Failed to decompress state: {}", e)))?;
    Ok(data)
}
