//! GGUF header check
//!
//! llama.cpp reports a bad file only as a null model. Reading the fixed header
//! first turns the common mistakes (wrong file, truncated download, unsupported
//! version) into a readable error before any weights are mapped.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, GgufError> {
        let magic = u32::from_le_bytes(le_array(&bytes[0..4]));
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }

        let version = u32::from_le_bytes(le_array(&bytes[4..8]));
        if !(2..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: u64::from_le_bytes(le_array(&bytes[8..16])),
            metadata_kv_count: u64::from_le_bytes(le_array(&bytes[16..24])),
        })
    }
}

fn le_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

/// Reads and checks the header of the GGUF file at `path`
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;
    let mut bytes = [0u8; HEADER_LEN];
    match file.read_exact(&mut bytes) {
        Ok(()) => GgufHeader::parse(&bytes),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(GgufError::FileTooSmall),
        Err(e) => Err(e.into()),
    }
}
