//! Fixed-size content-addressed chunking.
//!
//! Splits a byte stream into chunks of `chunk_size` bytes (the final chunk
//! may be shorter) and SHA-256-addresses each one. Chunk boundaries depend
//! only on byte offset, never on content.

use crate::error::ChunkerError;
use sha2::{Digest, Sha256};

/// One chunk produced by splitting a file: its 0-indexed position, content,
/// and content address.
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub chunk_number: i32,
    pub data: bytes::Bytes,
    pub checksum: String,
    pub size: i64,
}

/// Splits `data` into fixed-size chunks starting at `chunk_number` 0.
/// Empty input yields an empty sequence: a zero-byte File has no Chunk rows.
pub fn chunk_fixed_size(
    data: bytes::Bytes,
    chunk_size: usize,
) -> Result<Vec<PlannedChunk>, ChunkerError> {
    if chunk_size == 0 {
        return Err(ChunkerError::InvalidChunkSize);
    }

    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut chunks = Vec::with_capacity(data.len() / chunk_size + 1);
    let mut offset = 0usize;
    let mut chunk_number = 0i32;

    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        let slice = data.slice(offset..end);
        let checksum = checksum_of(&slice);

        chunks.push(PlannedChunk {
            chunk_number,
            size: slice.len() as i64,
            data: slice,
            checksum,
        });

        offset = end;
        chunk_number += 1;
    }

    Ok(chunks)
}

pub fn checksum_of(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn splits_on_exact_boundary() {
        let data = Bytes::from(vec![7u8; 10]);
        let chunks = chunk_fixed_size(data, 5).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_number, 0);
        assert_eq!(chunks[1].chunk_number, 1);
        assert_eq!(chunks[0].size, 5);
        assert_eq!(chunks[1].size, 5);
    }

    #[test]
    fn final_chunk_is_short() {
        let data = Bytes::from(vec![1u8; 12]);
        let chunks = chunk_fixed_size(data, 5).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].size, 2);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunks = chunk_fixed_size(Bytes::new(), 5 * 1024 * 1024).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn identical_content_produces_identical_checksum() {
        let a = chunk_fixed_size(Bytes::from_static(b"hello world"), 1024).unwrap();
        let b = chunk_fixed_size(Bytes::from_static(b"hello world"), 1024).unwrap();
        assert_eq!(a[0].checksum, b[0].checksum);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(chunk_fixed_size(Bytes::from_static(b"x"), 0).is_err());
    }
}
