//! Incremental writer for format A.
//!
//! Two write paths share this module. Creation lays the container down
//! front to back: leader, one frame, then the metadata tail. The
//! structural rewrite path patches an existing container: the background
//! byte, the global table and the graphic control block are fixed-size and
//! rewritten in place at their recorded offsets; Comment and Application
//! blocks are rewritten in place when their serialized size is unchanged
//! and otherwise re-appended before the terminal trailer byte. Bytes
//! inside a frame's declared raw-data range are never rewritten.

use super::blocks::{comment_len, put_sub_blocks, serialize_comment, GraphicControl};
use super::{
    application_from_tags, BlockLocation, FrameSpec, GifFile, GifHeader, BACKGROUND_OFFSET,
    BLOCK_TRAILER, HEADER_LEN, SIGNATURE,
};
use crate::error::{Error, Result};
use crate::palette::{resolve_transparency, AlphaHistogram, ColorTable};
use crate::session::{BlockAccess, ContainerSession, FrameDescriptor};
use crate::tags::Tag;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

/// Writes the fixed header and optional global table at the container
/// origin. Returns the offset of the first byte after the leader.
pub(crate) fn write_leader(
    session: &mut ContainerSession,
    header: &GifHeader,
    table: Option<&ColorTable>,
) -> Result<u64> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN as usize + table.map_or(0, |t| t.len() * 3));
    buf.put_slice(SIGNATURE);
    buf.put_slice(header.version.bytes());
    buf.put_u16_le(header.width);
    buf.put_u16_le(header.height);
    buf.put_u8(header.packed());
    buf.put_u8(header.background);
    buf.put_u8(header.aspect_ratio);
    if let Some(table) = table {
        buf.put_slice(&table.to_rgb_bytes());
    }
    let len = buf.len() as u64;
    session.write_at(0, &buf)?;
    trace!(leader_len = len, "wrote container leader");
    Ok(len)
}

/// Serializes and writes one frame at the current content end. The payload
/// bytes are framed into sub-blocks but never interpreted.
pub(crate) fn append_frame(
    gif: &mut GifFile,
    spec: &FrameSpec,
    histogram: &AlphaHistogram,
    data: &[u8],
) -> Result<super::GifFrame> {
    let local_table = spec
        .local_palette
        .as_deref()
        .map(ColorTable::from_canonical)
        .transpose()?;
    let render_table = local_table.as_ref().or(gif.global_table.as_ref());
    let transparency = render_table
        .and_then(|table| resolve_transparency(table, spec.known_transparency, histogram));

    let base = gif.content_end;
    let mut buf = BytesMut::new();

    let needs_control = transparency.is_some() || spec.delay_centis > 0 || spec.disposal > 0;
    let control = needs_control.then_some(GraphicControl {
        disposal: spec.disposal,
        delay_centis: spec.delay_centis,
        transparent: transparency,
    });
    let control_offset = control.map(|c| {
        let offset = base + buf.len() as u64;
        buf.put_slice(&c.serialize());
        offset
    });

    buf.put_u8(super::BLOCK_IMAGE);
    buf.put_u16_le(spec.left);
    buf.put_u16_le(spec.top);
    buf.put_u16_le(spec.width);
    buf.put_u16_le(spec.height);
    let mut packed = 0u8;
    if spec.interlaced {
        packed |= 0x40;
    }
    if let Some(table) = &local_table {
        packed |= 0x80 | (table.index_bits() - 1);
    }
    buf.put_u8(packed);
    if let Some(table) = &local_table {
        buf.put_slice(&table.to_rgb_bytes());
    }
    buf.put_u8(spec.lzw_min_code_size);
    let data_start = base + buf.len() as u64;
    put_sub_blocks(&mut buf, data);
    let data_end = base + buf.len() as u64;

    gif.session.write_at(base, &buf)?;
    gif.content_end = data_end;
    gif.trailer_offset = data_end;
    debug!(data_start, data_end, "appended frame");

    let index_bits = local_table
        .as_ref()
        .map(ColorTable::index_bits)
        .or(gif.header.global_table_bits)
        .unwrap_or(8);
    Ok(super::GifFrame {
        descriptor: FrameDescriptor {
            width: spec.width,
            height: spec.height,
            interlaced: spec.interlaced,
            rle_compressed: false,
            access: BlockAccess::Sequential,
            transparency,
            index_bits,
            data_start,
            data_end,
        },
        left: spec.left,
        top: spec.top,
        local_table,
        lzw_min_code_size: spec.lzw_min_code_size,
        control,
        control_offset,
    })
}

/// Rewrites the sections owned by dirty state. Called with the container
/// lock held.
pub(crate) fn save_structural(gif: &mut GifFile) -> Result<()> {
    // The single background byte lives at a fixed header offset.
    if gif.tags.is_dirty(Tag::Background) {
        if let Some(color) = gif.tags.color(Tag::Background) {
            gif.header.background = color as u8;
            gif.session
                .write_at(BACKGROUND_OFFSET, &[gif.header.background])?;
        }
    }

    let mut relocate = !gif.finalized;

    if gif.palette_dirty {
        if let Some(table) = gif.global_table.clone() {
            if gif.frames.is_empty() {
                // Nothing follows the leader but the metadata tail, so the
                // table may change size; the tail is re-laid below.
                gif.content_end = write_leader(&mut gif.session, &gif.header, Some(&table))?;
                relocate = true;
            } else {
                gif.session.write_at(HEADER_LEN, &table.to_rgb_bytes())?;
                let frame = &gif.frames[0];
                if let (Some(control), Some(offset)) = (frame.control, frame.control_offset) {
                    gif.session.write_at(offset, &control.serialize())?;
                }
            }
        }
    }

    let app_new = application_from_tags(&gif.tags);
    let comment_new = gif.tags.text(Tag::Notes).map(str::to_owned);
    let app_dirty = gif.tags.is_dirty(Tag::Software) || gif.tags.is_dirty(Tag::SoftwareVersion);
    let notes_dirty = gif.tags.is_dirty(Tag::Notes);

    let mut app_in_place = None;
    let mut comment_in_place = None;
    if app_dirty {
        match (&app_new, gif.app_loc) {
            (Some(app), Some(loc)) if app.serialized_len() == loc.len => {
                app_in_place = Some(loc);
            }
            (None, None) => {}
            _ => relocate = true,
        }
    }
    if notes_dirty {
        match (&comment_new, gif.comment_loc) {
            (Some(text), Some(loc)) if comment_len(text) == loc.len => {
                comment_in_place = Some(loc);
            }
            (None, None) => {}
            _ => relocate = true,
        }
    }

    if relocate {
        // Re-lay the metadata tail after the last frame's raw data. Managed
        // blocks located before the raw data stay where they are; a dirty
        // one that changed size gets its replacement appended here and the
        // stale bytes are left untouched (they cannot move without
        // rewriting payload bytes).
        let base = gif.content_end;
        let mut tail = BytesMut::new();

        if let Some(app) = &app_new {
            let emit = app_dirty || gif.app_loc.map_or(true, |loc| loc.offset >= base);
            if emit {
                let offset = base + tail.len() as u64;
                app.serialize_into(&mut tail);
                gif.app_loc = Some(BlockLocation {
                    offset,
                    len: app.serialized_len(),
                });
            }
        } else {
            gif.app_loc = None;
        }
        if let Some(text) = &comment_new {
            let emit = notes_dirty || gif.comment_loc.map_or(true, |loc| loc.offset >= base);
            if emit {
                let offset = base + tail.len() as u64;
                serialize_comment(text, &mut tail);
                gif.comment_loc = Some(BlockLocation {
                    offset,
                    len: comment_len(text),
                });
            }
        } else {
            gif.comment_loc = None;
        }

        gif.trailer_offset = base + tail.len() as u64;
        tail.put_u8(BLOCK_TRAILER);
        gif.session.write_at(base, &tail)?;
        gif.session.truncate_to(base + tail.len() as u64)?;
        debug!(base, tail_len = tail.len(), "re-laid metadata tail");
    } else {
        if let (Some(app), Some(loc)) = (&app_new, app_in_place) {
            let mut buf = BytesMut::new();
            app.serialize_into(&mut buf);
            gif.session.write_at(loc.offset, &buf)?;
            trace!(offset = loc.offset, "rewrote application block in place");
        }
        if let (Some(text), Some(loc)) = (&comment_new, comment_in_place) {
            let mut buf = BytesMut::new();
            serialize_comment(text, &mut buf);
            gif.session.write_at(loc.offset, &buf)?;
            trace!(offset = loc.offset, "rewrote comment block in place");
        }
    }

    gif.session.flush()
}

#[cfg(test)]
mod tests {
    use super::super::{AccessMode, GifFile, GifVersion, Tag};
    use crate::palette::Rgba;

    fn header() -> super::GifHeader {
        super::GifHeader {
            version: GifVersion::V89a,
            width: 2,
            height: 2,
            color_resolution: 7,
            global_table_bits: None,
            background: 0,
            aspect_ratio: 0,
        }
    }

    fn palette() -> Vec<Rgba> {
        vec![Rgba::opaque(0, 0, 0), Rgba::opaque(255, 255, 255)]
    }

    fn create_basic(path: &std::path::Path) {
        let mut gif = GifFile::create(path, 0, header(), Some(&palette())).unwrap();
        let spec = super::FrameSpec {
            width: 2,
            height: 2,
            lzw_min_code_size: 2,
            ..super::FrameSpec::default()
        };
        gif.append_frame(&spec, &crate::palette::AlphaHistogram::new(), &[1, 2, 3])
            .unwrap();
        gif.tags_mut().set_text(Tag::Notes, "0123456789");
        gif.save().unwrap();
        gif.close().unwrap();
    }

    #[test]
    fn test_same_size_comment_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inplace.gif");
        create_basic(&path);
        let len_before = std::fs::metadata(&path).unwrap().len();

        let mut gif = GifFile::open(&path, AccessMode::Write, 0).unwrap();
        gif.tags_mut().set_text(Tag::Notes, "abcdefghij");
        gif.save().unwrap();
        gif.close().unwrap();

        // Same serialized size: the file length must not move.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);
        let back = GifFile::open(&path, AccessMode::Read, 0).unwrap();
        assert_eq!(back.tags().text(Tag::Notes), Some("abcdefghij"));
    }

    #[test]
    fn test_size_change_relocates_before_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relocate.gif");
        create_basic(&path);

        let mut gif = GifFile::open(&path, AccessMode::Write, 0).unwrap();
        gif.tags_mut()
            .set_text(Tag::Notes, "a comment of a decidedly different length");
        gif.save().unwrap();
        gif.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        // The trailer stays the single final byte of the container.
        assert_eq!(*raw.last().unwrap(), 0x3B);
        let back = GifFile::open(&path, AccessMode::Read, 0).unwrap();
        assert_eq!(
            back.tags().text(Tag::Notes),
            Some("a comment of a decidedly different length")
        );
    }

    #[test]
    fn test_background_byte_patched_at_fixed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("background.gif");
        create_basic(&path);

        let mut gif = GifFile::open(&path, AccessMode::Write, 0).unwrap();
        gif.tags_mut()
            .set(Tag::Background, crate::tags::TagValue::Color(1));
        gif.save().unwrap();
        gif.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw[super::BACKGROUND_OFFSET as usize], 1);
        let back = GifFile::open(&path, AccessMode::Read, 0).unwrap();
        assert_eq!(back.header().background, 1);
    }

    #[test]
    fn test_removed_notes_drop_the_comment_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.gif");
        create_basic(&path);

        let mut gif = GifFile::open(&path, AccessMode::Write, 0).unwrap();
        gif.tags_mut().remove(Tag::Notes);
        gif.save().unwrap();
        gif.close().unwrap();

        let back = GifFile::open(&path, AccessMode::Read, 0).unwrap();
        assert_eq!(back.tags().text(Tag::Notes), None);
    }
}
