//! Length-prefixed wire encoding for [`FeatureFrame`].
//!
//! ```text
//! Frame (version 1):
//! [4B length N]              # big-endian, bytes that follow
//! [1B version=0x01]
//! [1B flags]                 # bit0: zstd body, bit1: json body
//! [4B body_len]              # body bytes as stored on the wire
//! [ ... body ... ]
//! [4B CRC32]                 # over version..body
//!
//! Binary body (after zstd, if flagged):
//! [8B f64 timestamp]
//! [4B global_len] [global_len * 4B f32]
//! [4B patch_rows]
//! patch_rows * ([4B row_len] [row_len * 4B f32])
//!
//! JSON body:
//! {"clsFeatures":[..],"patchFeatures":[[..]],"timestamp":..}
//! ```
//!
//! Everything after the length prefix is little-endian.

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::compress::{zstd_compress, zstd_decompress};
use crate::frame::{FeatureFrame, RaggedGrid};

pub const WIRE_VERSION: u8 = 1;

/// Size of the big-endian length prefix.
pub const PREFIX_LEN: usize = 4;

/// version + flags + body_len
pub const HEADER_LEN: usize = 6;

pub const TRAILER_LEN: usize = 4;

/// Smallest payload (bytes after the prefix) that can be a frame.
pub const MIN_PAYLOAD_LEN: usize = HEADER_LEN + TRAILER_LEN;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

bitflags::bitflags! {
    /// Frame flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const ZSTD = 1 << 0;
        const JSON = 1 << 1;
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes buffered yet. Feed more and retry.
    #[error("frame truncated, waiting for more bytes")]
    Truncated,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("declared frame length {declared} exceeds maximum {max}")]
    Oversized { declared: usize, max: usize },
}

impl From<RaggedGrid> for DecodeError {
    fn from(err: RaggedGrid) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("cannot encode ragged grid: {0}")]
    RaggedGrid(RaggedGrid),
    #[error("encoded frame of {0} bytes does not fit the length prefix")]
    TooLarge(usize),
    /// JSON has no NaN or infinity, so such frames need the binary body.
    #[error("json body cannot carry non-finite values")]
    NonFinite,
    #[error("zstd compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// How the body of an outgoing frame is represented.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// zstd level; `None` sends the body uncompressed.
    pub zstd_level: Option<i32>,
    /// Send the body as JSON instead of packed floats.
    pub json: bool,
}

impl EncodeOptions {
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::empty();
        if self.zstd_level.is_some() {
            flags |= Flags::ZSTD;
        }
        if self.json {
            flags |= Flags::JSON;
        }
        flags
    }
}

impl FeatureFrame {
    /// Encode with a binary, uncompressed body.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.encode_with(&EncodeOptions::default())
    }

    /// Encode to a complete wire frame, length prefix included.
    pub fn encode_with(&self, opts: &EncodeOptions) -> Result<Vec<u8>, EncodeError> {
        self.check_grid().map_err(EncodeError::RaggedGrid)?;

        let mut body = if opts.json {
            if !self.timestamp.is_finite() || !self.values().all(f32::is_finite) {
                return Err(EncodeError::NonFinite);
            }
            serde_json::to_vec(self)?
        } else {
            self.encode_binary_body()?
        };
        if let Some(level) = opts.zstd_level {
            body = zstd_compress(&body, level).map_err(EncodeError::Compress)?;
        }

        let payload_len = HEADER_LEN + body.len() + TRAILER_LEN;
        let declared = u32::try_from(payload_len).map_err(|_| EncodeError::TooLarge(payload_len))?;

        let mut buf = Vec::with_capacity(PREFIX_LEN + payload_len);
        buf.write_u32::<BigEndian>(declared)?;
        buf.write_u8(WIRE_VERSION)?;
        buf.write_u8(opts.flags().bits())?;
        buf.write_u32::<LittleEndian>(body.len() as u32)?;
        buf.extend_from_slice(&body);

        let crc = crc32fast::hash(&buf[PREFIX_LEN..]);
        buf.write_u32::<LittleEndian>(crc)?;

        Ok(buf)
    }

    fn encode_binary_body(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + self.value_count() * 4 + self.patch_count() * 4);
        buf.write_f64::<LittleEndian>(self.timestamp)?;

        buf.write_u32::<LittleEndian>(self.global_vector.len() as u32)?;
        for &v in &self.global_vector {
            buf.write_f32::<LittleEndian>(v)?;
        }

        buf.write_u32::<LittleEndian>(self.patch_grid.len() as u32)?;
        for row in &self.patch_grid {
            buf.write_u32::<LittleEndian>(row.len() as u32)?;
            for &v in row {
                buf.write_f32::<LittleEndian>(v)?;
            }
        }

        Ok(buf)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns the frame and the number of bytes it occupied, prefix included.
    /// Bytes past that point are left for the next call.
    pub fn decode(data: &[u8], max_frame_size: usize) -> Result<(Self, usize), DecodeError> {
        if data.len() < PREFIX_LEN {
            return Err(DecodeError::Truncated);
        }

        let declared = BigEndian::read_u32(&data[..PREFIX_LEN]) as usize;
        if declared > max_frame_size {
            return Err(DecodeError::Oversized {
                declared,
                max: max_frame_size,
            });
        }
        if declared < MIN_PAYLOAD_LEN {
            return Err(DecodeError::Malformed(format!(
                "declared length {declared} is below the minimum {MIN_PAYLOAD_LEN}"
            )));
        }

        let total = PREFIX_LEN + declared;
        if data.len() < total {
            return Err(DecodeError::Truncated);
        }

        let frame = decode_payload(&data[PREFIX_LEN..total], max_frame_size)?;
        Ok((frame, total))
    }
}

fn decode_payload(payload: &[u8], max_frame_size: usize) -> Result<FeatureFrame, DecodeError> {
    let (checked, tail) = payload.split_at(payload.len() - TRAILER_LEN);
    let mut cursor = Cursor::new(checked);

    let version = cursor.read_u8().map_err(short_read)?;
    if version != WIRE_VERSION {
        return Err(DecodeError::Malformed(format!(
            "unsupported version {version}"
        )));
    }

    let raw_flags = cursor.read_u8().map_err(short_read)?;
    let flags = Flags::from_bits(raw_flags)
        .ok_or_else(|| DecodeError::Malformed(format!("unknown flags {raw_flags:#04x}")))?;

    let body_len = cursor.read_u32::<LittleEndian>().map_err(short_read)? as usize;
    let body = &checked[HEADER_LEN..];
    if body_len != body.len() {
        return Err(DecodeError::Malformed(format!(
            "body length {body_len} disagrees with frame length (expected {})",
            body.len()
        )));
    }

    let expected_crc = LittleEndian::read_u32(tail);
    let computed_crc = crc32fast::hash(checked);
    if expected_crc != computed_crc {
        return Err(DecodeError::Malformed(format!(
            "CRC32 mismatch: expected {expected_crc:#010x}, got {computed_crc:#010x}"
        )));
    }

    let inflated;
    let body = if flags.contains(Flags::ZSTD) {
        inflated = zstd_decompress(body, max_frame_size)
            .map_err(|e| DecodeError::Malformed(format!("zstd body: {e}")))?;
        inflated.as_slice()
    } else {
        body
    };

    let frame = if flags.contains(Flags::JSON) {
        serde_json::from_slice::<FeatureFrame>(body)
            .map_err(|e| DecodeError::Malformed(format!("json body: {e}")))?
    } else {
        decode_binary_body(body)?
    };

    frame.check_grid()?;
    Ok(frame)
}

fn decode_binary_body(body: &[u8]) -> Result<FeatureFrame, DecodeError> {
    let mut cursor = Cursor::new(body);

    let timestamp = cursor.read_f64::<LittleEndian>().map_err(short_read)?;
    let global_vector = read_vector(&mut cursor)?;

    let rows = cursor.read_u32::<LittleEndian>().map_err(short_read)? as usize;
    // every row carries at least its own 4-byte length
    if rows > remaining(&cursor) / 4 {
        return Err(DecodeError::Malformed(format!(
            "{rows} patch rows cannot fit in the remaining body"
        )));
    }
    let mut patch_grid = Vec::with_capacity(rows);
    for _ in 0..rows {
        patch_grid.push(read_vector(&mut cursor)?);
    }

    if remaining(&cursor) != 0 {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes after patch grid",
            remaining(&cursor)
        )));
    }

    Ok(FeatureFrame {
        global_vector,
        patch_grid,
        timestamp,
    })
}

fn read_vector(cursor: &mut Cursor<&[u8]>) -> Result<Vec<f32>, DecodeError> {
    let len = cursor.read_u32::<LittleEndian>().map_err(short_read)? as usize;
    if len > remaining(cursor) / 4 {
        return Err(DecodeError::Malformed(format!(
            "vector of {len} floats overruns the body"
        )));
    }

    let mut raw = vec![0u8; len * 4];
    cursor.read_exact(&mut raw).map_err(short_read)?;
    let mut values = vec![0f32; len];
    LittleEndian::read_f32_into(&raw, &mut values);
    Ok(values)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

fn short_read(e: std::io::Error) -> DecodeError {
    DecodeError::Malformed(format!("body ended early: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> FeatureFrame {
        FeatureFrame::new(
            vec![0.25, -1.5, 3.0, f32::MIN_POSITIVE],
            vec![vec![1.0, 2.0, 3.0], vec![-4.0, 5.5, 0.0]],
            1_730_616_000.125,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();
        let (decoded, used) = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();

        assert_eq!(decoded, frame);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_prefix_counts_following_bytes() {
        let encoded = sample_frame().encode().unwrap();
        let declared = BigEndian::read_u32(&encoded[..4]) as usize;
        assert_eq!(declared, encoded.len() - PREFIX_LEN);
        assert_eq!(encoded[4], WIRE_VERSION);
        assert_eq!(encoded[5], 0);
    }

    #[test]
    fn test_empty_frame() {
        let frame = FeatureFrame::default();
        let encoded = frame.encode().unwrap();
        let (decoded, _) = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_zstd_body() {
        let frame = FeatureFrame::new(vec![0.5; 384], vec![vec![0.125; 384]; 16], 2.0).unwrap();
        let opts = EncodeOptions {
            zstd_level: Some(3),
            json: false,
        };
        let compressed = frame.encode_with(&opts).unwrap();
        let plain = frame.encode().unwrap();
        assert!(compressed.len() < plain.len());
        assert_eq!(compressed[5], Flags::ZSTD.bits());

        let (decoded, _) = FeatureFrame::decode(&compressed, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_json_body() {
        let frame = sample_frame();
        let opts = EncodeOptions {
            zstd_level: None,
            json: true,
        };
        let encoded = frame.encode_with(&opts).unwrap();
        let (decoded, _) = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_json_body_refuses_non_finite() {
        let opts = EncodeOptions {
            zstd_level: None,
            json: true,
        };
        let frame = FeatureFrame::new(vec![1.0, f32::NAN], vec![vec![f32::INFINITY]], 0.0).unwrap();
        assert!(matches!(frame.encode_with(&opts), Err(EncodeError::NonFinite)));

        let frame = FeatureFrame::new(vec![1.0], vec![vec![f32::NEG_INFINITY]], 0.0).unwrap();
        assert!(matches!(frame.encode_with(&opts), Err(EncodeError::NonFinite)));

        let frame = FeatureFrame::new(vec![1.0], vec![], f64::NAN).unwrap();
        assert!(matches!(frame.encode_with(&opts), Err(EncodeError::NonFinite)));

        // the binary body carries the same frame
        let frame = FeatureFrame::new(vec![1.0, f32::NAN], vec![vec![f32::INFINITY]], 0.0).unwrap();
        let (decoded, _) = FeatureFrame::decode(&frame.encode().unwrap(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert!(decoded.global_vector[1].is_nan());
        assert_eq!(decoded.patch_grid, vec![vec![f32::INFINITY]]);
    }

    #[test]
    fn test_json_body_compressed() {
        let frame = sample_frame();
        let opts = EncodeOptions {
            zstd_level: Some(1),
            json: true,
        };
        let encoded = frame.encode_with(&opts).unwrap();
        assert_eq!(encoded[5], (Flags::ZSTD | Flags::JSON).bits());
        let (decoded, _) = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_truncated() {
        let encoded = sample_frame().encode().unwrap();
        assert_eq!(
            FeatureFrame::decode(&encoded[..2], DEFAULT_MAX_FRAME_SIZE).unwrap_err(),
            DecodeError::Truncated
        );
        assert_eq!(
            FeatureFrame::decode(&encoded[..encoded.len() - 1], DEFAULT_MAX_FRAME_SIZE)
                .unwrap_err(),
            DecodeError::Truncated
        );
    }

    #[test]
    fn test_oversized_prefix_needs_no_payload() {
        let err = FeatureFrame::decode(&[0xFF, 0xFF, 0xFF, 0xFF], 1024).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Oversized {
                declared: 0xFFFF_FFFF,
                max: 1024
            }
        );
    }

    #[test]
    fn test_zero_length_prefix() {
        let err = FeatureFrame::decode(&[0, 0, 0, 0], 1024).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_leaves_following_frame() {
        let mut stream = sample_frame().encode().unwrap();
        let first_len = stream.len();
        stream.extend(FeatureFrame::default().encode().unwrap());

        let (first, used) = FeatureFrame::decode(&stream, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(first, sample_frame());
        assert_eq!(used, first_len);

        let (second, _) = FeatureFrame::decode(&stream[used..], DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_crc_mismatch() {
        let mut encoded = sample_frame().encode().unwrap();
        encoded[20] ^= 0x40;
        let err = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        match err {
            DecodeError::Malformed(msg) => assert!(msg.contains("CRC32")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_version() {
        let mut encoded = sample_frame().encode().unwrap();
        encoded[4] = 9;
        let err = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_unknown_flags() {
        let mut encoded = sample_frame().encode().unwrap();
        encoded[5] = 0x80;
        let err = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    /// Hand-built payload, since `encode` refuses ragged grids.
    fn ragged_frame_bytes() -> Vec<u8> {
        let mut body = Vec::new();
        body.write_f64::<LittleEndian>(0.0).unwrap();
        body.write_u32::<LittleEndian>(1).unwrap();
        body.write_f32::<LittleEndian>(1.0).unwrap();
        body.write_u32::<LittleEndian>(2).unwrap();
        body.write_u32::<LittleEndian>(2).unwrap();
        body.write_f32::<LittleEndian>(1.0).unwrap();
        body.write_f32::<LittleEndian>(2.0).unwrap();
        body.write_u32::<LittleEndian>(1).unwrap();
        body.write_f32::<LittleEndian>(3.0).unwrap();

        let mut payload = Vec::new();
        payload.write_u8(WIRE_VERSION).unwrap();
        payload.write_u8(0).unwrap();
        payload.write_u32::<LittleEndian>(body.len() as u32).unwrap();
        payload.extend_from_slice(&body);
        let crc = crc32fast::hash(&payload);
        payload.write_u32::<LittleEndian>(crc).unwrap();

        let mut frame = Vec::new();
        frame.write_u32::<BigEndian>(payload.len() as u32).unwrap();
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn test_ragged_grid_is_malformed() {
        let err = FeatureFrame::decode(&ragged_frame_bytes(), DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_encode_rejects_ragged_grid() {
        let frame = FeatureFrame {
            global_vector: vec![],
            patch_grid: vec![vec![1.0], vec![1.0, 2.0]],
            timestamp: 0.0,
        };
        assert!(matches!(frame.encode(), Err(EncodeError::RaggedGrid(_))));
    }

    #[test]
    fn test_json_ragged_grid_is_malformed() {
        let body = br#"{"clsFeatures":[],"patchFeatures":[[1.0],[1.0,2.0]],"timestamp":0}"#;
        let mut payload = vec![WIRE_VERSION, Flags::JSON.bits()];
        payload.write_u32::<LittleEndian>(body.len() as u32).unwrap();
        payload.extend_from_slice(body);
        let crc = crc32fast::hash(&payload);
        payload.write_u32::<LittleEndian>(crc).unwrap();
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);

        let err = FeatureFrame::decode(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_vector_length_overrun() {
        let mut body = Vec::new();
        body.write_f64::<LittleEndian>(0.0).unwrap();
        body.write_u32::<LittleEndian>(1_000_000).unwrap();
        let mut payload = vec![WIRE_VERSION, 0];
        payload.write_u32::<LittleEndian>(body.len() as u32).unwrap();
        payload.extend_from_slice(&body);
        let crc = crc32fast::hash(&payload);
        payload.write_u32::<LittleEndian>(crc).unwrap();
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);

        let err = FeatureFrame::decode(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_non_finite_values_survive() {
        let frame = FeatureFrame::new(vec![f32::INFINITY, f32::NEG_INFINITY, -0.0], vec![], 0.0)
            .unwrap();
        let encoded = frame.encode().unwrap();
        let (decoded, _) = FeatureFrame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, frame);

        let nan = FeatureFrame::new(vec![f32::NAN], vec![], 0.0).unwrap();
        let (decoded, _) = FeatureFrame::decode(&nan.encode().unwrap(), 1024).unwrap();
        assert!(decoded.global_vector[0].is_nan());
    }
}
