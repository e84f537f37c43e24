//! Format A: block-oriented, palette-indexed container support.
//!
//! The container is a fixed header followed by a stream of tagged blocks:
//! image descriptors, extension blocks and a terminal trailer byte. The
//! structural scanner walks that stream once, building frame descriptors
//! and folding metadata blocks into an [`AttributeSet`]; the sniffer
//! replays the same block transitions without building anything and
//! reports a plain boolean.
//!
//! ## Block transition table
//!
//! | Leading byte | Meaning                                     |
//! |--------------|---------------------------------------------|
//! | `0x2C`       | image descriptor, one frame                 |
//! | `0x21`       | extension introducer, dispatch on label     |
//! | `0x3B`       | trailer, terminal success                   |
//! | anything else| corruption                                  |

mod blocks;
mod writer;

pub use blocks::{Application, ExtensionRecord, GraphicControl};

use crate::error::{Error, Result};
use crate::io::{fill_fixed_ascii, ReadFieldExt};
use crate::lock::{FileKey, LockHandle};
use crate::palette::{resolve_transparency, AlphaHistogram, ColorTable, Rgba};
use crate::session::{AccessMode, BlockAccess, ContainerSession, FrameDescriptor};
use crate::tags::{AttributeSet, Tag, TagValue};
use blocks::{skip_sub_blocks, LABEL_APPLICATION, LABEL_COMMENT, LABEL_GRAPHIC_CONTROL};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, trace};

const SIGNATURE: &[u8; 3] = b"GIF";
const BLOCK_IMAGE: u8 = 0x2C;
const BLOCK_EXTENSION: u8 = 0x21;
const BLOCK_TRAILER: u8 = 0x3B;

/// Serialized length of the fixed header (signature through aspect byte).
pub(crate) const HEADER_LEN: u64 = 13;
/// Origin-relative offset of the single background-index byte.
pub(crate) const BACKGROUND_OFFSET: u64 = 11;

/// Container version from the header signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GifVersion {
    /// The original 87a revision, no extension blocks.
    V87a,
    /// The 89a revision with extension blocks.
    V89a,
}

impl GifVersion {
    fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw {
            b"87a" => Some(Self::V87a),
            b"89a" => Some(Self::V89a),
            _ => None,
        }
    }

    fn bytes(self) -> &'static [u8; 3] {
        match self {
            Self::V87a => b"87a",
            Self::V89a => b"89a",
        }
    }
}

/// Fixed-size format-A header record.
///
/// Read-only after the initial scan; mutated only during create or a full
/// rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GifHeader {
    /// Container version. Writes always emit the extension-capable
    /// revision regardless of this value.
    pub version: GifVersion,
    /// Logical screen width.
    pub width: u16,
    /// Logical screen height.
    pub height: u16,
    /// Color-resolution bits from the packed byte.
    pub color_resolution: u8,
    /// Bits per global-table index, `None` when no global table present.
    pub global_table_bits: Option<u8>,
    /// Screen background index.
    pub background: u8,
    /// Pixel aspect-ratio byte, round-tripped verbatim.
    pub aspect_ratio: u8,
}

impl GifHeader {
    /// Parses the 13-byte fixed header.
    fn parse<R: Read + Seek + ?Sized>(r: &mut R) -> Result<Self> {
        let mut signature = [0u8; 6];
        r.field_bytes(&mut signature, "container signature")?;
        if &signature[..3] != SIGNATURE {
            return Err(Error::corrupted(0, "bad container signature"));
        }
        let version = GifVersion::from_bytes(&signature[3..]).ok_or_else(|| {
            Error::corrupted(3, format!("unknown container version {:?}", &signature[3..]))
        })?;
        let width = r.field_u16("screen width")?;
        let height = r.field_u16("screen height")?;
        let packed = r.field_u8("screen flags")?;
        let background = r.field_u8("background index")?;
        let aspect_ratio = r.field_u8("aspect ratio")?;
        Ok(Self {
            version,
            width,
            height,
            color_resolution: (packed >> 4) & 0x07,
            global_table_bits: (packed & 0x80 != 0).then_some((packed & 0x07) + 1),
            background,
            aspect_ratio,
        })
    }

    fn packed(&self) -> u8 {
        let mut packed = (self.color_resolution & 0x07) << 4;
        if let Some(bits) = self.global_table_bits {
            packed |= 0x80 | (bits - 1);
        }
        packed
    }

    /// Number of global-table entries implied by the packed field.
    pub fn global_table_len(&self) -> Option<usize> {
        self.global_table_bits.map(|bits| 1usize << bits)
    }
}

/// Recorded position of a managed metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockLocation {
    pub(crate) offset: u64,
    pub(crate) len: u64,
}

/// One scanned frame: the shared descriptor plus format-A specifics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GifFrame {
    /// Derived descriptor handed to the pixel-access layer.
    pub descriptor: FrameDescriptor,
    /// Left offset within the logical screen.
    pub left: u16,
    /// Top offset within the logical screen.
    pub top: u16,
    /// Local color table, when the frame carries one.
    pub local_table: Option<ColorTable>,
    /// Minimum code size byte preceding the compressed payload.
    pub lzw_min_code_size: u8,
    /// Graphic control attached from the preceding extension block.
    pub control: Option<GraphicControl>,
    pub(crate) control_offset: Option<u64>,
}

/// Result of the single forward structural pass.
#[derive(Debug)]
pub(crate) struct ScannedGif {
    pub(crate) header: GifHeader,
    pub(crate) global_table: Option<ColorTable>,
    pub(crate) frames: Vec<GifFrame>,
    pub(crate) tags: AttributeSet,
    pub(crate) loop_count: Option<u16>,
    pub(crate) comment_loc: Option<BlockLocation>,
    pub(crate) app_loc: Option<BlockLocation>,
    pub(crate) trailer_offset: u64,
    /// End of the last frame's raw data (or of the leader when no frames).
    pub(crate) content_end: u64,
}

/// Walks the block stream once, building the structural model.
pub(crate) fn scan_structure(file: &mut File, origin: u64) -> Result<ScannedGif> {
    file.seek(SeekFrom::Start(origin))?;
    let header = GifHeader::parse(file)?;
    trace!(width = header.width, height = header.height, "scanned header");

    let mut global_table = match header.global_table_len() {
        Some(len) => {
            let mut raw = vec![0u8; len * 3];
            file.field_bytes(&mut raw, "global color table")?;
            Some(ColorTable::from_rgb_bytes(&raw, None)?)
        }
        None => None,
    };

    let mut frames: Vec<GifFrame> = Vec::new();
    let mut tags = AttributeSet::new();
    let mut loop_count = None;
    let mut comment_loc = None;
    let mut app_loc = None;
    let mut pending_control: Option<(GraphicControl, u64)> = None;
    let mut content_end = file.stream_position()? - origin;

    let (trailer_offset, records) = loop {
        let block_start = file.stream_position()? - origin;
        let introducer = file.field_u8("block introducer")?;
        match introducer {
            BLOCK_IMAGE => {
                let control = pending_control.take();
                let frame = parse_frame(file, origin, &header, control)?;
                content_end = frame.descriptor.data_end;
                frames.push(frame);
            }
            BLOCK_EXTENSION => {
                let label = file.field_u8("extension label")?;
                match ExtensionRecord::parse(file, label)? {
                    ExtensionRecord::Comment(text) => {
                        tags.record_text_append(Tag::Notes, &text);
                        let end = file.stream_position()? - origin;
                        comment_loc = Some(BlockLocation {
                            offset: block_start,
                            len: end - block_start,
                        });
                    }
                    ExtensionRecord::GraphicControl(control) => {
                        pending_control = Some((control, block_start));
                    }
                    ExtensionRecord::Application(app) => {
                        let end = file.stream_position()? - origin;
                        if app.identifier_text() == "NETSCAPE" && app.payload.len() >= 3 {
                            loop_count =
                                Some(u16::from_le_bytes([app.payload[1], app.payload[2]]));
                        } else {
                            tags.record(Tag::Software, TagValue::Text(app.identifier_text()));
                            tags.record(
                                Tag::SoftwareVersion,
                                TagValue::Text(app.auth_code_text()),
                            );
                            app_loc = Some(BlockLocation {
                                offset: block_start,
                                len: end - block_start,
                            });
                        }
                    }
                }
            }
            BLOCK_TRAILER => break (block_start, frames),
            other => {
                return Err(Error::corrupted(
                    block_start,
                    format!("unknown block introducer 0x{other:02X}"),
                ))
            }
        }
    };

    tags.record(Tag::Background, TagValue::Color(u16::from(header.background)));

    // A frame rendered through the global table projects its transparency
    // index onto it; local tables were patched while parsing.
    if let Some(table) = global_table.as_mut() {
        let global_transparency = records
            .iter()
            .filter(|f| f.local_table.is_none())
            .find_map(|f| f.descriptor.transparency);
        if let Some(index) = global_transparency {
            let mut entries = table.entries().to_vec();
            if let Some(entry) = entries.get_mut(index as usize) {
                entry.a = 0;
            }
            *table = ColorTable::new(entries)?;
        }
    }

    debug!(
        frames = records.len(),
        trailer_offset, "structural scan complete"
    );
    Ok(ScannedGif {
        header,
        global_table,
        frames: records,
        tags,
        loop_count,
        comment_loc,
        app_loc,
        trailer_offset,
        content_end,
    })
}

fn parse_frame(
    file: &mut File,
    origin: u64,
    header: &GifHeader,
    control: Option<(GraphicControl, u64)>,
) -> Result<GifFrame> {
    let left = file.field_u16("frame left offset")?;
    let top = file.field_u16("frame top offset")?;
    let width = file.field_u16("frame width")?;
    let height = file.field_u16("frame height")?;
    let packed = file.field_u8("frame flags")?;
    let interlaced = packed & 0x40 != 0;
    let transparency = control.and_then(|(c, _)| c.transparent);

    let local_table = if packed & 0x80 != 0 {
        let bits = (packed & 0x07) + 1;
        let mut raw = vec![0u8; (1usize << bits) * 3];
        file.field_bytes(&mut raw, "local color table")?;
        Some(ColorTable::from_rgb_bytes(&raw, transparency)?)
    } else {
        None
    };

    let lzw_min_code_size = file.field_u8("minimum code size")?;
    let data_start = file.stream_position()? - origin;
    skip_sub_blocks(file)?;
    let data_end = file.stream_position()? - origin;
    trace!(width, height, data_start, data_end, "scanned frame");

    let index_bits = local_table
        .as_ref()
        .map(ColorTable::index_bits)
        .or(header.global_table_bits)
        .unwrap_or(8);

    Ok(GifFrame {
        descriptor: FrameDescriptor {
            width,
            height,
            interlaced,
            rle_compressed: false,
            access: BlockAccess::Sequential,
            transparency,
            index_bits,
            data_start,
            data_end,
        },
        left,
        top,
        local_table,
        lzw_min_code_size,
        control: control.map(|(c, _)| c),
        control_offset: control.map(|(_, offset)| offset),
    })
}

/// Stateless detection: replays the scanner's block transitions without
/// building descriptors. Never raises; malformed or unsupported input is
/// reported as `false`.
pub fn detect(path: impl AsRef<Path>, origin: u64) -> bool {
    let path = path.as_ref();
    let Ok(key) = FileKey::for_path(path) else {
        return false;
    };
    let handle = LockHandle::new(key);
    let Ok(_guard) = handle.acquire() else {
        return false;
    };
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    detect_stream(&mut file, origin)
}

pub(crate) fn detect_stream<R: Read + Seek + ?Sized>(r: &mut R, origin: u64) -> bool {
    detect_inner(r, origin).unwrap_or(false)
}

fn detect_inner<R: Read + Seek + ?Sized>(r: &mut R, origin: u64) -> Result<bool> {
    r.seek(SeekFrom::Start(origin))?;
    let mut signature = [0u8; 6];
    r.field_bytes(&mut signature, "container signature")?;
    if &signature[..3] != SIGNATURE || GifVersion::from_bytes(&signature[3..]).is_none() {
        return Ok(false);
    }
    r.skip_bytes(4)?;
    let packed = r.field_u8("screen flags")?;
    r.skip_bytes(2)?;
    if packed & 0x80 != 0 {
        r.skip_bytes((1u64 << ((packed & 0x07) + 1)) * 3)?;
    }
    loop {
        match r.field_u8("block introducer")? {
            BLOCK_IMAGE => {
                r.skip_bytes(8)?;
                let packed = r.field_u8("frame flags")?;
                if packed & 0x80 != 0 {
                    r.skip_bytes((1u64 << ((packed & 0x07) + 1)) * 3)?;
                }
                r.skip_bytes(1)?;
                skip_sub_blocks(r)?;
            }
            BLOCK_EXTENSION => match r.field_u8("extension label")? {
                LABEL_COMMENT | LABEL_GRAPHIC_CONTROL | LABEL_APPLICATION => {
                    skip_sub_blocks(r)?;
                }
                // Plain text is structurally valid but unsupported; any
                // other label is unrecognized. Either way: not ours.
                _ => return Ok(false),
            },
            BLOCK_TRAILER => return Ok(true),
            _ => return Ok(false),
        }
    }
}

/// Parameters for appending a frame to a container being created.
#[derive(Debug, Clone, Default)]
pub struct FrameSpec {
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Left offset within the logical screen.
    pub left: u16,
    /// Top offset within the logical screen.
    pub top: u16,
    /// Store the frame interlaced.
    pub interlaced: bool,
    /// Local palette; the frame uses the global table when `None`.
    pub local_palette: Option<Vec<Rgba>>,
    /// Frame delay in hundredths of a second.
    pub delay_centis: u16,
    /// Disposal method bits.
    pub disposal: u8,
    /// Previously known transparency index, if the caller has one.
    pub known_transparency: Option<u8>,
    /// Minimum code size byte for the compressed payload.
    pub lzw_min_code_size: u8,
}

/// An open format-A container.
///
/// All structural state lives in memory after the initial scan; mutations
/// go through the attribute set and palette API and reach disk on
/// [`GifFile::save`].
#[derive(Debug)]
pub struct GifFile {
    pub(crate) session: ContainerSession,
    pub(crate) header: GifHeader,
    pub(crate) global_table: Option<ColorTable>,
    pub(crate) frames: Vec<GifFrame>,
    pub(crate) tags: AttributeSet,
    loop_count: Option<u16>,
    pub(crate) comment_loc: Option<BlockLocation>,
    pub(crate) app_loc: Option<BlockLocation>,
    pub(crate) trailer_offset: u64,
    pub(crate) content_end: u64,
    pub(crate) finalized: bool,
    pub(crate) palette_dirty: bool,
}

impl GifFile {
    /// Opens an existing container and scans its structure.
    ///
    /// Multi-frame containers are read-only: requesting write access to
    /// one fails with [`Error::IllegalAccessMode`] before any byte is
    /// touched.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode, origin: u64) -> Result<Self> {
        let mut session = ContainerSession::open(path, mode, origin)?;
        let guard = session.lock()?;
        let scan = scan_structure(session.file(), origin)?;
        if scan.frames.len() > 1 && mode.is_writable() {
            return Err(Error::illegal_access(format!(
                "container holds {} frames; multi-frame containers are read-only",
                scan.frames.len()
            )));
        }
        drop(guard);
        Ok(Self {
            session,
            header: scan.header,
            global_table: scan.global_table,
            frames: scan.frames,
            tags: scan.tags,
            loop_count: scan.loop_count,
            comment_loc: scan.comment_loc,
            app_loc: scan.app_loc,
            trailer_offset: scan.trailer_offset,
            content_end: scan.content_end,
            finalized: true,
            palette_dirty: false,
        })
    }

    /// Creates a new container and writes its leader (header plus global
    /// table). Frames are appended afterwards; the trailer and metadata
    /// blocks are written by [`GifFile::save`].
    pub fn create(
        path: impl AsRef<Path>,
        origin: u64,
        mut header: GifHeader,
        palette: Option<&[Rgba]>,
    ) -> Result<Self> {
        // Extensions require the later revision.
        header.version = GifVersion::V89a;
        let global_table = palette.map(ColorTable::from_canonical).transpose()?;
        header.global_table_bits = global_table.as_ref().map(ColorTable::index_bits);

        let mut session = ContainerSession::open(path, AccessMode::Create, origin)?;
        let guard = session.lock()?;
        let content_end = writer::write_leader(&mut session, &header, global_table.as_ref())?;
        session.truncate_to(content_end)?;
        drop(guard);

        let mut tags = AttributeSet::new();
        tags.record(Tag::Background, TagValue::Color(u16::from(header.background)));
        Ok(Self {
            session,
            header,
            global_table,
            frames: Vec::new(),
            tags,
            loop_count: None,
            comment_loc: None,
            app_loc: None,
            trailer_offset: content_end,
            content_end,
            finalized: false,
            palette_dirty: false,
        })
    }

    /// The scanned header record.
    pub fn header(&self) -> &GifHeader {
        &self.header
    }

    /// Scanned frames in stream order.
    pub fn frames(&self) -> &[GifFrame] {
        &self.frames
    }

    /// Derived descriptors for the pixel-access layer.
    pub fn frame_descriptors(&self) -> Vec<FrameDescriptor> {
        self.frames.iter().map(|f| f.descriptor.clone()).collect()
    }

    /// Animation loop count from a NETSCAPE2.0 application block, if any.
    pub fn loop_count(&self) -> Option<u16> {
        self.loop_count
    }

    /// The generic attribute set.
    pub fn tags(&self) -> &AttributeSet {
        &self.tags
    }

    /// Mutable access to the attribute set; changed tags are rewritten on
    /// the next save.
    pub fn tags_mut(&mut self) -> &mut AttributeSet {
        &mut self.tags
    }

    /// The canonical global palette, if the container carries one.
    pub fn palette(&self) -> Option<&ColorTable> {
        self.global_table.as_ref()
    }

    /// Replaces the global palette from a canonical RGBA palette.
    ///
    /// When the palette carries transparent entries the frame needs a
    /// graphic control block to declare the chosen index; the histogram
    /// decides it when no previously known index survives.
    pub fn set_palette(&mut self, palette: &[Rgba], histogram: &AlphaHistogram) -> Result<()> {
        self.session.require_writable()?;
        let table = ColorTable::from_canonical(palette)?;
        let known = self.frames.first().and_then(|f| f.descriptor.transparency);
        let transparency = resolve_transparency(&table, known, histogram);

        if self.frames.is_empty() {
            // Nothing behind the leader yet; it may change size freely.
            self.header.global_table_bits = Some(table.index_bits());
        } else {
            let old_bits = self.header.global_table_bits.unwrap_or(0);
            if table.index_bits() != old_bits {
                return Err(Error::unsupported(format!(
                    "palette of {} entries does not fit the existing {}-bit table; \
                     resizing would relocate raw data",
                    palette.len(),
                    old_bits
                )));
            }
            if transparency.is_some() {
                let frame = &mut self.frames[0];
                if frame.control_offset.is_none() {
                    return Err(Error::unsupported(
                        "no graphic control block to carry a transparency index",
                    ));
                }
                let control = frame.control.get_or_insert_with(GraphicControl::default);
                control.transparent = transparency;
                frame.descriptor.transparency = transparency;
            }
        }
        self.global_table = Some(table);
        self.palette_dirty = true;
        Ok(())
    }

    /// Appends the only frame of a container being created. The payload is
    /// the pre-compressed pixel stream; it is framed into sub-blocks here
    /// but its bytes are never interpreted.
    pub fn append_frame(
        &mut self,
        spec: &FrameSpec,
        histogram: &AlphaHistogram,
        data: &[u8],
    ) -> Result<()> {
        self.session.require_writable()?;
        if !self.frames.is_empty() {
            return Err(Error::illegal_access(
                "container already holds a frame; multi-frame containers are read-only",
            ));
        }
        let guard = self.session.lock()?;
        let frame = writer::append_frame(self, spec, histogram, data)?;
        drop(guard);
        self.frames.push(frame);
        Ok(())
    }

    /// Rewrites the sections owned by dirty state: the background byte in
    /// place, the global table and graphic control in place, and dirty
    /// metadata blocks either in place (size unchanged) or re-appended
    /// before the trailer.
    pub fn save(&mut self) -> Result<()> {
        self.session.require_writable()?;
        let guard = self.session.lock()?;
        writer::save_structural(self)?;
        drop(guard);
        self.tags.clear_dirty();
        self.palette_dirty = false;
        self.finalized = true;
        Ok(())
    }

    /// Saves pending changes (in writable modes) and closes the session.
    pub fn close(mut self) -> Result<()> {
        if self.session.mode().is_writable()
            && (!self.finalized || self.tags.any_dirty() || self.palette_dirty)
        {
            self.save()?;
        }
        self.session.flush()
    }
}

/// Builds the application identifier and auth code from the tag values.
pub(crate) fn application_from_tags(tags: &AttributeSet) -> Option<Application> {
    let software = tags.text(Tag::Software)?;
    let mut identifier = [0u8; 8];
    fill_fixed_ascii(&mut identifier, software);
    let mut auth_code = [0u8; 3];
    fill_fixed_ascii(&mut auth_code, tags.text(Tag::SoftwareVersion).unwrap_or(""));
    Some(Application {
        identifier,
        auth_code,
        payload: Vec::new(),
    })
}
