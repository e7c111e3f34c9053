//! Transport compression for generated tensors and previews.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Zlib-compress a payload
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inverse of [`compress`]
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Compress when enabled, falling back to the raw payload on failure
pub fn encode_payload(data: Vec<u8>, enabled: bool) -> Vec<u8> {
    if !enabled {
        return data;
    }
    match compress(&data) {
        Ok(compressed) => compressed,
        Err(e) => {
            tracing::warn!("Response compression failed, sending raw payload: {}", e);
            data
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressible_tensor_shrinks() {
        let tensor = vec![7u8; 64 * 1024];
        let compressed = compress(&tensor).unwrap();
        assert!(compressed.len() < tensor.len() / 10);
        assert_eq!(decompress(&compressed).unwrap(), tensor);
    }

    #[test]
    fn test_disabled_passes_through() {
        let data = b"raw tensor".to_vec();
        assert_eq!(encode_payload(data.clone(), false), data);
    }
}
