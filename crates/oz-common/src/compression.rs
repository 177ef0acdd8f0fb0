// compression.rs: Deflate wrapping for save files.
//
// A compressed save is the little-endian uncompressed length followed by raw
// deflate data.

use std::io::Read;

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use crate::error::{OzError, OzResult};

/// Largest save image we agree to inflate.
pub const MAX_DECOMPRESS_SIZE: usize = 256 * 1024 * 1024;

pub fn compress_save(data: &[u8]) -> OzResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 8);
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());

    let mut encoder = DeflateEncoder::new(data, Compression::default());
    encoder
        .read_to_end(&mut out)
        .map_err(|e| OzError::Compression(format!("compression failed: {}", e)))?;

    Ok(out)
}

pub fn decompress_save(data: &[u8]) -> OzResult<Vec<u8>> {
    if data.len() < 8 {
        return Err(OzError::Truncated {
            what: "save",
            offset: data.len(),
        });
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[..8]);
    let size = u64::from_le_bytes(len_bytes) as usize;
    if size > MAX_DECOMPRESS_SIZE {
        return Err(OzError::Compression(format!(
            "uncompressed size {} exceeds maximum {}",
            size, MAX_DECOMPRESS_SIZE
        )));
    }

    let mut decoder = DeflateDecoder::new(&data[8..]);
    let mut out = Vec::with_capacity(size);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| OzError::Compression(format!("decompression failed: {}", e)))?;

    if out.len() != size {
        return Err(OzError::SizeMismatch {
            what: "save",
            expected: size,
            found: out.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_save_shrinks() {
        let original = vec![7u8; 10000];
        let packed = compress_save(&original).unwrap();
        assert!(packed.len() < original.len() / 10);
        assert_eq!(decompress_save(&packed).unwrap(), original);
    }

    #[test]
    fn test_length_header_is_checked() {
        let mut packed = compress_save(b"some world state").unwrap();
        packed[0] = packed[0].wrapping_add(1);
        assert!(matches!(
            decompress_save(&packed),
            Err(OzError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_short_input_is_truncated() {
        assert!(matches!(
            decompress_save(&[1, 2, 3]),
            Err(OzError::Truncated { .. })
        ));
    }
}
