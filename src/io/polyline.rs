//! Encoded polyline codec (precision 1e5)
//!
//! Each point is a pair of zig-zag varints holding the delta from the previous
//! point. A varint is a sequence of 5-bit groups, least significant first, each
//! stored as `group + 63` with 0x20 set on every group but the last.

use crate::domain::types::{Coordinate, InvalidCoordinate};
use thiserror::Error;

const PRECISION: f64 = 1e5;
const MAX_SHIFT: u32 = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PathDecodeError {
    #[error("input ends in the middle of a point at byte {0}")]
    Truncated(usize),
    #[error("byte {byte:#04x} at offset {offset} is outside the polyline alphabet")]
    InvalidByte { offset: usize, byte: u8 },
    #[error("varint starting before offset {0} does not fit in 64 bits")]
    Overflow(usize),
    #[error(transparent)]
    OutOfRange(#[from] InvalidCoordinate),
}

/// Read one varint starting at `*pos`, advancing past it
fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<i64, PathDecodeError> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let Some(&byte) = bytes.get(*pos) else {
            return Err(PathDecodeError::Truncated(*pos));
        };
        if !(63..=126).contains(&byte) {
            return Err(PathDecodeError::InvalidByte { offset: *pos, byte });
        }
        if shift >= MAX_SHIFT {
            return Err(PathDecodeError::Overflow(*pos));
        }
        *pos += 1;

        let chunk = u64::from(byte - 63);
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }

    let value = result as i64;
    Ok(if value & 1 != 0 { !(value >> 1) } else { value >> 1 })
}

/// Decode an encoded polyline into coordinates
pub fn decode(encoded: &str) -> Result<Vec<Coordinate>, PathDecodeError> {
    let bytes = encoded.as_bytes();
    let mut path = Vec::with_capacity(bytes.len() / 4);
    let mut pos = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;

    while pos < bytes.len() {
        lat = lat.wrapping_add(read_varint(bytes, &mut pos)?);
        lon = lon.wrapping_add(read_varint(bytes, &mut pos)?);
        path.push(Coordinate::new(lat as f64 / PRECISION, lon as f64 / PRECISION)?);
    }

    Ok(path)
}

fn write_varint(delta: i64, out: &mut String) {
    let mut v = delta << 1;
    if delta < 0 {
        v = !v;
    }
    let mut v = v as u64;
    while v >= 0x20 {
        out.push(char::from((0x20 | (v & 0x1f)) as u8 + 63));
        v >>= 5;
    }
    out.push(char::from(v as u8 + 63));
}

/// Encode coordinates as a polyline
pub fn encode(path: &[Coordinate]) -> String {
    let mut out = String::with_capacity(path.len() * 8);
    let mut prev_lat: i64 = 0;
    let mut prev_lon: i64 = 0;

    for point in path {
        let lat = (point.latitude() * PRECISION).round() as i64;
        let lon = (point.longitude() * PRECISION).round() as i64;
        write_varint(lat - prev_lat, &mut out);
        write_varint(lon - prev_lon, &mut out);
        prev_lat = lat;
        prev_lon = lon;
    }

    out
}
