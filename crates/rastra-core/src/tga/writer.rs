//! Full-rewrite writer for format B.
//!
//! Unlike format A there is no in-place patching of the trailing metadata:
//! every save recomputes the section chain `rawDataEnd → PostageStamp →
//! ExtensionArea → ScanLineTable → ColorCorrectionTable`, writes the
//! present sections back to back, and finishes with the footer whose
//! extension-area offset is the single pointer external readers trust.
//! Absent sections keep offset zero and contribute nothing to the chain.
//! Bytes inside the declared raw-data range are never rewritten; the only
//! in-place write is the same-size color map preceding it.

use super::{
    ExtensionArea, TgaFile, TgaFooter, TgaHeader, COLOR_CORRECTION_WORDS, EXTENSION_AREA_LEN,
    HEADER_LEN,
};
use crate::error::Result;
use crate::palette::ColorTable;
use crate::session::ContainerSession;
use crate::tags::Tag;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

/// Writes the header and optional color map at the container origin.
/// Returns the offset of the first raw-data byte.
pub(crate) fn write_leader(
    session: &mut ContainerSession,
    header: &TgaHeader,
    table: Option<&ColorTable>,
) -> Result<u64> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN as usize);
    buf.put_slice(&header.serialize());
    if let Some(table) = table {
        let mut raw = table.to_color_map_bytes(header.color_map_entry_bits)?;
        // The in-memory table is padded to a power of two; the disk map
        // keeps the header's exact entry count.
        raw.truncate(header.color_map_bytes() as usize);
        buf.put_slice(&raw);
    }
    session.write_at(0, &buf)?;
    trace!(leader_len = buf.len(), "wrote container leader");
    Ok(buf.len() as u64)
}

/// Offsets assigned to the trailing sections by one chain layout pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SectionChain {
    pub(crate) stamp_offset: u32,
    pub(crate) extension_offset: u32,
    pub(crate) scanline_offset: u32,
    pub(crate) color_correction_offset: u32,
    /// First byte after the last section; the footer goes here.
    pub(crate) end: u64,
}

/// Pure layout function: each present section starts where the previous
/// one ended, beginning at the end of the raw data.
pub(crate) fn layout_chain(
    raw_end: u64,
    stamp_len: Option<u64>,
    has_extension: bool,
    scanline_len: Option<u64>,
    correction_len: Option<u64>,
) -> SectionChain {
    let mut chain = SectionChain::default();
    let mut cursor = raw_end;
    if let Some(len) = stamp_len {
        chain.stamp_offset = cursor as u32;
        cursor += len;
    }
    if has_extension {
        chain.extension_offset = cursor as u32;
        cursor += EXTENSION_AREA_LEN;
    }
    if let Some(len) = scanline_len {
        chain.scanline_offset = cursor as u32;
        cursor += len;
    }
    if let Some(len) = correction_len {
        chain.color_correction_offset = cursor as u32;
        cursor += len;
    }
    chain.end = cursor;
    chain
}

/// Folds dirty tag values into the extension-area fields they own.
fn merge_tags(tga: &mut TgaFile) {
    let needs_extension = tga.extension.is_some()
        || tga.stamp.is_some()
        || tga.scanline_table.is_some()
        || tga.color_correction.is_some()
        || [
            Tag::Author,
            Tag::Notes,
            Tag::DateTime,
            Tag::Software,
            Tag::SoftwareVersion,
            Tag::Background,
        ]
        .iter()
        .any(|tag| tga.tags.get(*tag).is_some());
    if !needs_extension {
        return;
    }
    let ext = tga.extension.get_or_insert_with(ExtensionArea::default);
    if tga.tags.is_dirty(Tag::Author) {
        ext.author = tga.tags.text(Tag::Author).unwrap_or_default().to_string();
    }
    if tga.tags.is_dirty(Tag::Notes) {
        ext.comments = tga.tags.text(Tag::Notes).unwrap_or_default().to_string();
    }
    if tga.tags.is_dirty(Tag::DateTime) {
        ext.stamp = tga.tags.stamp(Tag::DateTime).unwrap_or_default();
    }
    if tga.tags.is_dirty(Tag::Software) {
        ext.software_id = tga.tags.text(Tag::Software).unwrap_or_default().to_string();
    }
    if tga.tags.is_dirty(Tag::SoftwareVersion) {
        match tga.tags.text(Tag::SoftwareVersion) {
            Some(text) => ext.set_version_text(text),
            None => {
                ext.version_number = 0;
                ext.version_letter = b' ';
            }
        }
    }
    if tga.tags.is_dirty(Tag::Background) {
        ext.key_color = tga.tags.color(Tag::Background).map_or(0, u32::from);
    }
}

/// Rewrites the trailing section chain and footer. Called with the
/// container lock held.
pub(crate) fn save_full(tga: &mut TgaFile) -> Result<()> {
    if tga.palette_dirty {
        if let Some(table) = &tga.color_table {
            let mut raw = table.to_color_map_bytes(tga.header.color_map_entry_bits)?;
            raw.truncate(tga.header.color_map_bytes() as usize);
            let at = HEADER_LEN + u64::from(tga.header.id_length);
            tga.session.write_at(at, &raw)?;
            trace!(at, "rewrote color map in place");
        }
    }

    merge_tags(tga);

    let chain = layout_chain(
        tga.raw_end,
        tga.stamp.as_ref().map(|s| s.serialized_len()),
        tga.extension.is_some(),
        tga.scanline_table.as_ref().map(|t| t.len() as u64 * 4),
        tga.color_correction
            .as_ref()
            .map(|_| COLOR_CORRECTION_WORDS as u64 * 2),
    );

    if let Some(stamp) = &tga.stamp {
        let mut buf = BytesMut::with_capacity(stamp.serialized_len() as usize);
        buf.put_u8(stamp.width);
        buf.put_u8(stamp.height);
        buf.put_slice(&stamp.data);
        tga.session.write_at(u64::from(chain.stamp_offset), &buf)?;
    }
    if let Some(ext) = tga.extension.as_mut() {
        ext.stamp_offset = chain.stamp_offset;
        ext.scanline_offset = chain.scanline_offset;
        ext.color_correction_offset = chain.color_correction_offset;
        let raw = ext.serialize();
        tga.session
            .write_at(u64::from(chain.extension_offset), &raw)?;
    }
    if let Some(table) = &tga.scanline_table {
        let mut buf = BytesMut::with_capacity(table.len() * 4);
        for offset in table {
            buf.put_u32_le(*offset);
        }
        tga.session
            .write_at(u64::from(chain.scanline_offset), &buf)?;
    }
    if let Some(table) = &tga.color_correction {
        let mut buf = BytesMut::with_capacity(table.len() * 2);
        for word in table {
            buf.put_u16_le(*word);
        }
        tga.session
            .write_at(u64::from(chain.color_correction_offset), &buf)?;
    }

    // The footer pointer goes down last; a developer directory does not
    // survive relocation, so its offset resets to zero.
    let footer = TgaFooter {
        extension_offset: chain.extension_offset,
        developer_offset: 0,
    };
    tga.session.write_at(chain.end, &footer.serialize())?;
    tga.session.truncate_to(chain.end + super::FOOTER_LEN)?;
    tga.footer = Some(footer);
    debug!(
        extension_offset = chain.extension_offset,
        end = chain.end,
        "rewrote section chain"
    );
    tga.session.flush()
}

#[cfg(test)]
mod tests {
    use super::super::{PostageStamp, TgaFile, TgaHeader, TgaImageType};
    use super::*;
    use crate::session::AccessMode;
    use pretty_assertions::assert_eq;

    fn header() -> TgaHeader {
        TgaHeader {
            id_length: 0,
            color_map_type: 0,
            image_type: TgaImageType::TrueColor,
            color_map_first: 0,
            color_map_len: 0,
            color_map_entry_bits: 0,
            x_origin: 0,
            y_origin: 0,
            width: 4,
            height: 4,
            pixel_depth: 24,
            descriptor: 0,
        }
    }

    fn create_with_all_sections(path: &std::path::Path) {
        let payload = vec![0x55u8; 4 * 4 * 3];
        let mut tga = TgaFile::create(path, 0, header(), None, &payload).unwrap();
        tga.tags_mut().set_text(Tag::Author, "cartographer");
        tga.set_postage_stamp(PostageStamp {
            width: 2,
            height: 2,
            data: vec![0x11; 12],
        })
        .unwrap();
        tga.set_scan_line_table(vec![54, 66, 78, 90]).unwrap();
        tga.set_color_correction(vec![0x8000; COLOR_CORRECTION_WORDS])
            .unwrap();
        tga.save().unwrap();
        tga.close().unwrap();
    }

    #[test]
    fn test_offset_ordering_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chained.tga");
        create_with_all_sections(&path);

        let tga = TgaFile::open(&path, AccessMode::Read, 0).unwrap();
        let footer = *tga.footer().unwrap();
        let ext = tga.extension().unwrap().clone();
        let raw_end = 18 + 4 * 4 * 3u32;

        // Strict ordering with exact adjacency.
        assert_eq!(ext.stamp_offset, raw_end);
        assert_eq!(footer.extension_offset, ext.stamp_offset + 2 + 12);
        assert_eq!(
            ext.scanline_offset,
            footer.extension_offset + EXTENSION_AREA_LEN as u32
        );
        assert_eq!(ext.color_correction_offset, ext.scanline_offset + 4 * 4);
        assert!(ext.stamp_offset < footer.extension_offset);
        assert!(footer.extension_offset < ext.scanline_offset);
        assert!(ext.scanline_offset < ext.color_correction_offset);

        assert_eq!(tga.postage_stamp().unwrap().data.len(), 12);
        assert_eq!(tga.scan_line_table().unwrap(), &[54, 66, 78, 90]);
        assert_eq!(tga.color_correction().unwrap()[0], 0x8000);
    }

    #[test]
    fn test_absent_sections_keep_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.tga");
        let payload = vec![0x55u8; 4 * 4 * 3];
        let mut tga = TgaFile::create(&path, 0, header(), None, &payload).unwrap();
        tga.tags_mut().set_text(Tag::Author, "nobody in particular");
        tga.save().unwrap();
        tga.close().unwrap();

        let tga = TgaFile::open(&path, AccessMode::Read, 0).unwrap();
        let ext = tga.extension().unwrap();
        assert_eq!(ext.stamp_offset, 0);
        assert_eq!(ext.scanline_offset, 0);
        assert_eq!(ext.color_correction_offset, 0);
        assert!(tga.postage_stamp().is_none());
    }

    #[test]
    fn test_chain_layout_is_pure_and_contiguous() {
        let chain = layout_chain(100, Some(14), true, Some(16), Some(2048));
        assert_eq!(chain.stamp_offset, 100);
        assert_eq!(chain.extension_offset, 114);
        assert_eq!(chain.scanline_offset, 114 + 495);
        assert_eq!(chain.color_correction_offset, 114 + 495 + 16);
        assert_eq!(chain.end, 114 + 495 + 16 + 2048);

        let sparse = layout_chain(100, None, true, None, None);
        assert_eq!(sparse.stamp_offset, 0);
        assert_eq!(sparse.extension_offset, 100);
        assert_eq!(sparse.scanline_offset, 0);
        assert_eq!(sparse.color_correction_offset, 0);
        assert_eq!(sparse.end, 100 + 495);
    }

    #[test]
    fn test_repeated_saves_are_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stable.tga");
        create_with_all_sections(&path);
        let first = std::fs::read(&path).unwrap();

        let mut tga = TgaFile::open(&path, AccessMode::Write, 0).unwrap();
        tga.tags_mut().set_text(Tag::Author, "cartographer");
        tga.save().unwrap();
        tga.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_footer_anchors_extension_after_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growing.tga");
        let payload = vec![0x55u8; 4 * 4 * 3];
        let mut tga = TgaFile::create(&path, 0, header(), None, &payload).unwrap();
        tga.tags_mut().set_text(Tag::Author, "first author");
        tga.save().unwrap();
        tga.close().unwrap();

        // Adding a postage stamp shifts the whole chain; the footer must
        // follow the extension area to its new home.
        let mut tga = TgaFile::open(&path, AccessMode::Write, 0).unwrap();
        tga.set_postage_stamp(PostageStamp {
            width: 2,
            height: 2,
            data: vec![0x22; 12],
        })
        .unwrap();
        tga.save().unwrap();
        tga.close().unwrap();

        let tga = TgaFile::open(&path, AccessMode::Read, 0).unwrap();
        let raw_end = 18 + 4 * 4 * 3u32;
        assert_eq!(tga.extension().unwrap().stamp_offset, raw_end);
        assert_eq!(tga.footer().unwrap().extension_offset, raw_end + 14);
        assert_eq!(tga.tags().text(Tag::Author), Some("first author"));
    }
}
