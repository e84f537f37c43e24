//! # rastra-core
//!
//! Structural codec for two legacy raster containers: a block-oriented,
//! palette-indexed container ("GIF") and a header/footer container with a
//! trailing extension area ("TGA").
//!
//! This crate owns the offset-driven binary plumbing of those formats:
//! - Stateless format sniffing without building descriptors
//! - Structural scanning into an in-memory model (headers, frame
//!   descriptors, extension records, raw-data offsets)
//! - Palette and transparency reconciliation against a canonical RGBA
//!   representation
//! - Incremental rewriting that relocates only the sections following a
//!   size change and never touches raw pixel payload bytes
//! - Run-length layout analysis deciding whether random per-line access
//!   is legal
//! - Cooperative sister-file locking around every structural operation
//!
//! Decoding or encoding the compressed pixel payload itself is explicitly
//! out of scope; payloads pass through as opaque bytes for the
//! pixel-access layer.
//!
//! ## Architecture
//!
//! - [`gif`]: format A sniffer, scanner, and incremental writer
//! - [`tga`]: format B sniffer, scanner, full-rewrite writer and
//!   run-length analysis
//! - [`palette`]: color-table model and transparency reconciliation
//! - [`tags`]: uniform attribute tagging with dirty tracking
//! - [`session`]: container sessions and positioned I/O
//! - [`lock`]: identity-keyed cooperative locking
//! - [`error`]: error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use rastra_core::{detect_format, AccessMode, ContainerFormat, Tag};
//! use rastra_core::gif::GifFile;
//!
//! if let Some(ContainerFormat::Gif) = detect_format("./scan.img", 0) {
//!     let mut image = GifFile::open("./scan.img", AccessMode::Write, 0)?;
//!     image.tags_mut().set_text(Tag::Notes, "checked 2024-06-12");
//!     image.save()?;
//!     image.close()?;
//! }
//! # Ok::<(), rastra_core::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod error;
pub mod gif;
mod io;
pub mod lock;
pub mod palette;
pub mod session;
pub mod tags;
pub mod tga;

// Re-export primary types for convenience
pub use error::{Error, Result};
pub use lock::{FileKey, LockGuard, LockHandle};
pub use palette::{AlphaHistogram, ColorTable, Rgba};
pub use session::{AccessMode, BlockAccess, ContainerSession, FrameDescriptor};
pub use tags::{AttributeSet, DateStamp, Tag, TagValue};

use std::path::Path;

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Container formats this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// The block-oriented, palette-indexed container.
    Gif,
    /// The header/footer container with a trailing extension area.
    Tga,
}

/// Runs both sniffers against the stream starting at `origin`.
///
/// Like the per-format `detect` functions this never raises; a file
/// neither sniffer recognizes is simply `None`.
pub fn detect_format(path: impl AsRef<Path>, origin: u64) -> Option<ContainerFormat> {
    let path = path.as_ref();
    if gif::detect(path, origin) {
        Some(ContainerFormat::Gif)
    } else if tga::detect(path, origin) {
        Some(ContainerFormat::Tga)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format_distinguishes_the_two() {
        let dir = tempfile::tempdir().unwrap();

        let gif_path = dir.path().join("one.gif");
        let header = gif::GifHeader {
            version: gif::GifVersion::V89a,
            width: 2,
            height: 2,
            color_resolution: 7,
            global_table_bits: None,
            background: 0,
            aspect_ratio: 0,
        };
        let palette = [Rgba::opaque(0, 0, 0), Rgba::opaque(255, 255, 255)];
        let gif = gif::GifFile::create(&gif_path, 0, header, Some(&palette)).unwrap();
        gif.close().unwrap();
        assert_eq!(detect_format(&gif_path, 0), Some(ContainerFormat::Gif));

        let tga_path = dir.path().join("two.tga");
        let header = tga::TgaHeader {
            id_length: 0,
            color_map_type: 0,
            image_type: tga::TgaImageType::TrueColor,
            color_map_first: 0,
            color_map_len: 0,
            color_map_entry_bits: 0,
            x_origin: 0,
            y_origin: 0,
            width: 2,
            height: 2,
            pixel_depth: 24,
            descriptor: 0,
        };
        let tga = tga::TgaFile::create(&tga_path, 0, header, None, &[0u8; 12]).unwrap();
        tga.close().unwrap();
        assert_eq!(detect_format(&tga_path, 0), Some(ContainerFormat::Tga));

        let junk = dir.path().join("noise.bin");
        std::fs::write(&junk, [0u8; 64]).unwrap();
        assert_eq!(detect_format(&junk, 0), None);
    }
}
