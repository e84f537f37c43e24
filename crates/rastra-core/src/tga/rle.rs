//! Run-length layout analysis for format B.
//!
//! Random per-line access into a run-length compressed payload is only
//! legal when every run ends exactly at a scanline boundary; a run that
//! crosses one forces whole-image sequential decode. The walker here
//! decodes packet headers only, never pixel values, over a bounded
//! rolling window, so the cost of the answer is one forward pass of the
//! raw-data range regardless of image size.

use crate::error::{Error, Result};
use crate::io::ChunkReader;
use std::fs::File;
use tracing::{debug, trace};

/// Walks run-length packets across `[start, end)` of `file` and reports
/// whether any run crosses a scanline boundary.
///
/// A packet's leading byte selects a repeat run (high bit set: one pixel
/// repeated `(n & 0x7F) + 1` times) or a raw run (`(n & 0x7F) + 1` literal
/// pixels). Returns `true` the moment a packet pushes the current row past
/// `width`; `false` only after every row was accounted for exactly. A
/// stream that runs dry before that is malformed.
pub(crate) fn runs_span_scanlines(
    file: &mut File,
    start: u64,
    end: u64,
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
) -> Result<bool> {
    let mut reader = ChunkReader::new(file, start, end);
    for row in 0..height {
        let mut decoded = 0u32;
        while decoded < width {
            let header = match reader.next_u8()? {
                Some(byte) => byte,
                None => {
                    return Err(Error::corrupted(
                        reader.position(),
                        format!("run-length stream exhausted inside row {row}"),
                    ))
                }
            };
            let count = u32::from(header & 0x7F) + 1;
            let payload = if header & 0x80 != 0 {
                bytes_per_pixel
            } else {
                bytes_per_pixel * count
            };
            if !reader.skip(u64::from(payload)) {
                return Err(Error::corrupted(
                    reader.position(),
                    format!("run-length packet truncated in row {row}"),
                ));
            }
            decoded += count;
            if decoded > width {
                debug!(row, decoded, width, "run crosses scanline boundary");
                return Ok(true);
            }
        }
        trace!(row, "row boundary aligned");
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn analyze(stream: &[u8], width: u32, height: u32, bpp: u32) -> Result<bool> {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(stream).unwrap();
        runs_span_scanlines(&mut file, 0, stream.len() as u64, width, height, bpp)
    }

    /// Raw packet header for `count` literal pixels.
    fn raw(count: u8) -> u8 {
        count - 1
    }

    /// Repeat packet header for `count` repetitions.
    fn rep(count: u8) -> u8 {
        0x80 | (count - 1)
    }

    #[test]
    fn test_aligned_packets_over_ten_rows() {
        // One raw packet of exactly the row width, ten rows long.
        let mut stream = Vec::new();
        for _ in 0..10 {
            stream.push(raw(4));
            stream.extend_from_slice(&[0xAA; 4]);
        }
        assert!(!analyze(&stream, 4, 10, 1).unwrap());
    }

    #[test]
    fn test_run_crossing_row_two_by_one_pixel() {
        let mut stream = Vec::new();
        stream.push(raw(4));
        stream.extend_from_slice(&[0xAA; 4]);
        // Second row: a repeat run of five pixels on a four-pixel row.
        stream.push(rep(5));
        stream.push(0xBB);
        assert!(analyze(&stream, 4, 10, 1).unwrap());
    }

    #[test]
    fn test_rows_split_across_multiple_packets() {
        // 2 + repeat 3 + 3 = 8 pixels per row, three-byte pixels.
        let mut stream = Vec::new();
        for _ in 0..4 {
            stream.push(raw(2));
            stream.extend_from_slice(&[0x11; 6]);
            stream.push(rep(3));
            stream.extend_from_slice(&[0x22; 3]);
            stream.push(raw(3));
            stream.extend_from_slice(&[0x33; 9]);
        }
        assert!(!analyze(&stream, 8, 4, 3).unwrap());
    }

    #[test]
    fn test_exhausted_stream_is_malformed() {
        let mut stream = Vec::new();
        stream.push(raw(4));
        stream.extend_from_slice(&[0xAA; 4]);
        // Declared two rows, provided one.
        let err = analyze(&stream, 4, 2, 1).unwrap_err();
        assert!(matches!(err, Error::CorruptedStructure { .. }));
    }

    #[test]
    fn test_truncated_packet_payload_is_malformed() {
        // Raw packet announcing four pixels with only two bytes behind it.
        let stream = [raw(4), 0xAA, 0xAB];
        let err = analyze(&stream, 4, 1, 1).unwrap_err();
        assert!(matches!(err, Error::CorruptedStructure { .. }));
    }
}
