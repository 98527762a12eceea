use std::io::{self, Cursor, Read};
use zstd::stream::{encode_all, Decoder};

/// Compress a frame body using zstd
pub fn zstd_compress(input: &[u8], level: i32) -> io::Result<Vec<u8>> {
    encode_all(Cursor::new(input), level)
}

/// Decompress a frame body, refusing output larger than `limit` bytes
pub fn zstd_decompress(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    // one byte past the limit tells "exactly at" from "over"
    Decoder::new(input)?
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed body exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}
