//! Format B: header/footer container with a trailing extension area.
//!
//! The container has no block state machine: a fixed 18-byte header sits at
//! the origin, the raw pixel payload follows the optional color map, and
//! everything else hangs off the 26-byte footer at the end of the stream.
//! The footer's extension-area offset anchors a fixed 495-byte record
//! which in turn carries offsets to three optional sub-sections: a postage
//! stamp thumbnail, a scan-line table and a color-correction table. A zero
//! offset means "absent" throughout. Files without the footer signature
//! are the legacy variant and are detected by a size heuristic instead.

mod rle;
mod writer;

use crate::error::{Error, Result};
use crate::io::{fill_fixed_ascii, fixed_ascii, ReadFieldExt};
use crate::lock::{FileKey, LockHandle};
use crate::palette::{ColorTable, Rgba};
use crate::session::{AccessMode, BlockAccess, ContainerSession, FrameDescriptor};
use crate::tags::{AttributeSet, DateStamp, Tag, TagValue};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

pub(crate) const HEADER_LEN: u64 = 18;
pub(crate) const FOOTER_LEN: u64 = 26;
pub(crate) const EXTENSION_AREA_LEN: u64 = 495;
/// The color-correction table is always 256 entries of four 16-bit words.
pub(crate) const COLOR_CORRECTION_WORDS: usize = 1024;

const FOOTER_SIGNATURE: &[u8; 18] = b"TRUEVISION-XFILE.\0";

/// Image-type byte of the format-B header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TgaImageType {
    /// Uncompressed, color-mapped.
    ColorMapped,
    /// Uncompressed, true-color.
    TrueColor,
    /// Uncompressed, grayscale.
    Grayscale,
    /// Run-length compressed, color-mapped.
    ColorMappedRle,
    /// Run-length compressed, true-color.
    TrueColorRle,
    /// Run-length compressed, grayscale.
    GrayscaleRle,
}

impl TgaImageType {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::ColorMapped),
            2 => Ok(Self::TrueColor),
            3 => Ok(Self::Grayscale),
            9 => Ok(Self::ColorMappedRle),
            10 => Ok(Self::TrueColorRle),
            11 => Ok(Self::GrayscaleRle),
            other => Err(Error::unsupported(format!("image type {other}"))),
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::ColorMapped => 1,
            Self::TrueColor => 2,
            Self::Grayscale => 3,
            Self::ColorMappedRle => 9,
            Self::TrueColorRle => 10,
            Self::GrayscaleRle => 11,
        }
    }

    /// True for the run-length compressed variants.
    pub fn is_rle(self) -> bool {
        matches!(
            self,
            Self::ColorMappedRle | Self::TrueColorRle | Self::GrayscaleRle
        )
    }

    /// True for the color-mapped variants.
    pub fn is_color_mapped(self) -> bool {
        matches!(self, Self::ColorMapped | Self::ColorMappedRle)
    }

    fn legal_depths(self) -> &'static [u8] {
        if self.is_color_mapped() {
            &[8, 16]
        } else if matches!(self, Self::Grayscale | Self::GrayscaleRle) {
            &[8]
        } else {
            &[15, 16, 24, 32]
        }
    }
}

/// Fixed-size format-B header record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgaHeader {
    /// Length of the image-id field following the header.
    pub id_length: u8,
    /// 0 = no color map, 1 = color map present.
    pub color_map_type: u8,
    /// Image type descriptor.
    pub image_type: TgaImageType,
    /// First color-map index covered by the on-disk map.
    pub color_map_first: u16,
    /// Number of on-disk color-map entries.
    pub color_map_len: u16,
    /// Bits per on-disk color-map entry.
    pub color_map_entry_bits: u8,
    /// Horizontal origin of the image.
    pub x_origin: u16,
    /// Vertical origin of the image.
    pub y_origin: u16,
    /// Image width in pixels.
    pub width: u16,
    /// Image height in pixels.
    pub height: u16,
    /// Bits per pixel.
    pub pixel_depth: u8,
    /// Packed descriptor byte: bit 5 selects top origin, bits 0-3 count
    /// alpha bits.
    pub descriptor: u8,
}

impl TgaHeader {
    fn parse<R: Read + Seek + ?Sized>(r: &mut R) -> Result<Self> {
        Ok(Self {
            id_length: r.field_u8("id length")?,
            color_map_type: r.field_u8("color map type")?,
            image_type: TgaImageType::from_code(r.field_u8("image type")?)?,
            color_map_first: r.field_u16("color map first index")?,
            color_map_len: r.field_u16("color map length")?,
            color_map_entry_bits: r.field_u8("color map entry size")?,
            x_origin: r.field_u16("x origin")?,
            y_origin: r.field_u16("y origin")?,
            width: r.field_u16("image width")?,
            height: r.field_u16("image height")?,
            pixel_depth: r.field_u8("pixel depth")?,
            descriptor: r.field_u8("image descriptor")?,
        })
    }

    pub(crate) fn serialize(&self) -> [u8; HEADER_LEN as usize] {
        let mut raw = [0u8; HEADER_LEN as usize];
        raw[0] = self.id_length;
        raw[1] = self.color_map_type;
        raw[2] = self.image_type.code();
        raw[3..5].copy_from_slice(&self.color_map_first.to_le_bytes());
        raw[5..7].copy_from_slice(&self.color_map_len.to_le_bytes());
        raw[7] = self.color_map_entry_bits;
        raw[8..10].copy_from_slice(&self.x_origin.to_le_bytes());
        raw[10..12].copy_from_slice(&self.y_origin.to_le_bytes());
        raw[12..14].copy_from_slice(&self.width.to_le_bytes());
        raw[14..16].copy_from_slice(&self.height.to_le_bytes());
        raw[16] = self.pixel_depth;
        raw[17] = self.descriptor;
        raw
    }

    /// Validates the field combinations against the supported legal sets.
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::corrupted(12, "zero image dimensions"));
        }
        if self.color_map_type > 1 {
            return Err(Error::unsupported(format!(
                "color map type {}",
                self.color_map_type
            )));
        }
        if self.image_type.is_color_mapped() && self.color_map_type != 1 {
            return Err(Error::corrupted(
                1,
                "color-mapped image without a color map",
            ));
        }
        if !self.image_type.legal_depths().contains(&self.pixel_depth) {
            return Err(Error::unsupported(format!(
                "pixel depth {} for image type {}",
                self.pixel_depth,
                self.image_type.code()
            )));
        }
        if self.color_map_type == 1
            && !matches!(self.color_map_entry_bits, 15 | 16 | 24 | 32)
        {
            return Err(Error::unsupported(format!(
                "color map entry size {} bits",
                self.color_map_entry_bits
            )));
        }
        Ok(())
    }

    /// Whole bytes per pixel.
    pub fn bytes_per_pixel(&self) -> u32 {
        u32::from(self.pixel_depth).div_ceil(8)
    }

    /// Serialized length of the on-disk color map.
    pub(crate) fn color_map_bytes(&self) -> u64 {
        u64::from(self.color_map_len) * u64::from(self.color_map_entry_bits).div_ceil(8)
    }

    /// Uncompressed payload size implied by the dimensions.
    fn theoretical_pixel_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.bytes_per_pixel())
    }

    /// True when row zero is the top row.
    pub fn top_origin(&self) -> bool {
        self.descriptor & 0x20 != 0
    }

    /// Number of attribute (alpha) bits per pixel.
    pub fn alpha_bits(&self) -> u8 {
        self.descriptor & 0x0F
    }
}

/// Footer record anchoring the extension area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TgaFooter {
    /// Offset of the extension area, zero when absent.
    pub extension_offset: u32,
    /// Offset of the developer directory, zero when absent. Surfaced from
    /// a scan; a full rewrite drops the directory and resets this to zero.
    pub developer_offset: u32,
}

impl TgaFooter {
    fn parse(raw: &[u8; FOOTER_LEN as usize]) -> Option<Self> {
        if &raw[8..] != FOOTER_SIGNATURE {
            return None;
        }
        Some(Self {
            extension_offset: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            developer_offset: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        })
    }

    pub(crate) fn serialize(&self) -> [u8; FOOTER_LEN as usize] {
        let mut raw = [0u8; FOOTER_LEN as usize];
        raw[0..4].copy_from_slice(&self.extension_offset.to_le_bytes());
        raw[4..8].copy_from_slice(&self.developer_offset.to_le_bytes());
        raw[8..].copy_from_slice(FOOTER_SIGNATURE);
        raw
    }
}

/// The fixed 495-byte extension-area record.
///
/// Free-text fields round-trip through [`AttributeSet`] tags; the three
/// sub-section offsets are recomputed by every full rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionArea {
    /// Author name, up to 40 characters.
    pub author: String,
    /// Author comments, up to four 80-character lines.
    pub comments: String,
    /// Creation timestamp; all-zero when unrecorded.
    pub stamp: DateStamp,
    /// Job name, up to 40 characters.
    pub job_name: String,
    /// Accumulated job time as (hours, minutes, seconds).
    pub job_time: (u16, u16, u16),
    /// Software identifier, up to 40 characters.
    pub software_id: String,
    /// Software version number scaled by 100.
    pub version_number: u16,
    /// Software version letter, space when unused.
    pub version_letter: u8,
    /// Key (background) color as a packed 32-bit value.
    pub key_color: u32,
    /// Pixel aspect ratio as (numerator, denominator).
    pub pixel_ratio: (u16, u16),
    /// Gamma as (numerator, denominator).
    pub gamma: (u16, u16),
    /// Offset of the color-correction table, zero when absent.
    pub color_correction_offset: u32,
    /// Offset of the postage stamp, zero when absent.
    pub stamp_offset: u32,
    /// Offset of the scan-line table, zero when absent.
    pub scanline_offset: u32,
    /// Interpretation of the attribute bits.
    pub attributes_type: u8,
}

impl Default for ExtensionArea {
    fn default() -> Self {
        Self {
            author: String::new(),
            comments: String::new(),
            stamp: DateStamp::default(),
            job_name: String::new(),
            job_time: (0, 0, 0),
            software_id: String::new(),
            version_number: 0,
            version_letter: b' ',
            key_color: 0,
            pixel_ratio: (0, 0),
            gamma: (0, 0),
            color_correction_offset: 0,
            stamp_offset: 0,
            scanline_offset: 0,
            attributes_type: 0,
        }
    }
}

fn read_u16_at(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(raw[at..at + 2].try_into().unwrap())
}

fn read_u32_at(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(raw[at..at + 4].try_into().unwrap())
}

impl ExtensionArea {
    fn parse(raw: &[u8; EXTENSION_AREA_LEN as usize]) -> Result<Self> {
        let declared = read_u16_at(raw, 0);
        if u64::from(declared) != EXTENSION_AREA_LEN {
            return Err(Error::corrupted(
                0,
                format!("extension area declares {declared} bytes, expected 495"),
            ));
        }
        let mut lines: Vec<String> = (0..4)
            .map(|i| fixed_ascii(&raw[43 + i * 81..43 + (i + 1) * 81]))
            .collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        Ok(Self {
            author: fixed_ascii(&raw[2..43]),
            comments: lines.join("\n"),
            stamp: DateStamp {
                month: read_u16_at(raw, 367),
                day: read_u16_at(raw, 369),
                year: read_u16_at(raw, 371),
                hour: read_u16_at(raw, 373),
                minute: read_u16_at(raw, 375),
                second: read_u16_at(raw, 377),
            },
            job_name: fixed_ascii(&raw[379..420]),
            job_time: (
                read_u16_at(raw, 420),
                read_u16_at(raw, 422),
                read_u16_at(raw, 424),
            ),
            software_id: fixed_ascii(&raw[426..467]),
            version_number: read_u16_at(raw, 467),
            version_letter: raw[469],
            key_color: read_u32_at(raw, 470),
            pixel_ratio: (read_u16_at(raw, 474), read_u16_at(raw, 476)),
            gamma: (read_u16_at(raw, 478), read_u16_at(raw, 480)),
            color_correction_offset: read_u32_at(raw, 482),
            stamp_offset: read_u32_at(raw, 486),
            scanline_offset: read_u32_at(raw, 490),
            attributes_type: raw[494],
        })
    }

    pub(crate) fn serialize(&self) -> [u8; EXTENSION_AREA_LEN as usize] {
        let mut raw = [0u8; EXTENSION_AREA_LEN as usize];
        raw[0..2].copy_from_slice(&(EXTENSION_AREA_LEN as u16).to_le_bytes());
        fill_fixed_ascii(&mut raw[2..43], &self.author);
        for (i, line) in self.comments.split('\n').take(4).enumerate() {
            fill_fixed_ascii(&mut raw[43 + i * 81..43 + (i + 1) * 81], line);
        }
        raw[367..369].copy_from_slice(&self.stamp.month.to_le_bytes());
        raw[369..371].copy_from_slice(&self.stamp.day.to_le_bytes());
        raw[371..373].copy_from_slice(&self.stamp.year.to_le_bytes());
        raw[373..375].copy_from_slice(&self.stamp.hour.to_le_bytes());
        raw[375..377].copy_from_slice(&self.stamp.minute.to_le_bytes());
        raw[377..379].copy_from_slice(&self.stamp.second.to_le_bytes());
        fill_fixed_ascii(&mut raw[379..420], &self.job_name);
        raw[420..422].copy_from_slice(&self.job_time.0.to_le_bytes());
        raw[422..424].copy_from_slice(&self.job_time.1.to_le_bytes());
        raw[424..426].copy_from_slice(&self.job_time.2.to_le_bytes());
        fill_fixed_ascii(&mut raw[426..467], &self.software_id);
        raw[467..469].copy_from_slice(&self.version_number.to_le_bytes());
        raw[469] = self.version_letter;
        raw[470..474].copy_from_slice(&self.key_color.to_le_bytes());
        raw[474..476].copy_from_slice(&self.pixel_ratio.0.to_le_bytes());
        raw[476..478].copy_from_slice(&self.pixel_ratio.1.to_le_bytes());
        raw[478..480].copy_from_slice(&self.gamma.0.to_le_bytes());
        raw[480..482].copy_from_slice(&self.gamma.1.to_le_bytes());
        raw[482..486].copy_from_slice(&self.color_correction_offset.to_le_bytes());
        raw[486..490].copy_from_slice(&self.stamp_offset.to_le_bytes());
        raw[490..494].copy_from_slice(&self.scanline_offset.to_le_bytes());
        raw[494] = self.attributes_type;
        raw
    }

    /// The version fields as display text, e.g. `2.05b`.
    pub fn version_text(&self) -> Option<String> {
        if self.version_number == 0 && matches!(self.version_letter, 0 | b' ') {
            return None;
        }
        let mut text = format!(
            "{}.{:02}",
            self.version_number / 100,
            self.version_number % 100
        );
        if !matches!(self.version_letter, 0 | b' ') {
            text.push(self.version_letter as char);
        }
        Some(text)
    }

    /// Parses display text back into the scaled number and letter,
    /// tolerating missing pieces.
    pub(crate) fn set_version_text(&mut self, text: &str) {
        let text = text.trim();
        let letter = text
            .chars()
            .last()
            .filter(char::is_ascii_alphabetic)
            .map(|c| c as u8);
        let digits = &text[..text.len() - usize::from(letter.is_some())];
        let (major, minor) = digits.split_once('.').unwrap_or((digits, ""));
        let major: u16 = major.parse().unwrap_or(0);
        let minor_digits: String = minor
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .take(2)
            .collect();
        let minor: u16 = match minor_digits.len() {
            0 => 0,
            1 => minor_digits.parse::<u16>().unwrap_or(0) * 10,
            _ => minor_digits.parse().unwrap_or(0),
        };
        self.version_number = major * 100 + minor;
        self.version_letter = letter.unwrap_or(b' ');
    }
}

/// Embedded low-resolution thumbnail raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostageStamp {
    /// Stamp width in pixels, at most 64 by convention.
    pub width: u8,
    /// Stamp height in pixels.
    pub height: u8,
    /// Raw stamp pixels in the same pixel format as the main image.
    pub data: Vec<u8>,
}

impl PostageStamp {
    /// Serialized length: two dimension bytes plus the raw pixels.
    pub(crate) fn serialized_len(&self) -> u64 {
        2 + self.data.len() as u64
    }
}

/// Result of the structural scan.
#[derive(Debug)]
pub(crate) struct ScannedTga {
    pub(crate) header: TgaHeader,
    pub(crate) color_table: Option<ColorTable>,
    pub(crate) footer: Option<TgaFooter>,
    pub(crate) extension: Option<ExtensionArea>,
    pub(crate) stamp: Option<PostageStamp>,
    pub(crate) scanline_table: Option<Vec<u32>>,
    pub(crate) color_correction: Option<Vec<u16>>,
    pub(crate) raw_start: u64,
    pub(crate) raw_end: u64,
    pub(crate) tags: AttributeSet,
}

/// Reads the header, color map, footer and every discovered trailing
/// section, narrowing the raw-data boundary as sections surface.
pub(crate) fn scan_structure(file: &mut File, origin: u64) -> Result<ScannedTga> {
    let container_len = file.seek(SeekFrom::End(0))?.saturating_sub(origin);
    file.seek(SeekFrom::Start(origin))?;
    let header = TgaHeader::parse(file)?;
    header.validate()?;
    file.skip_bytes(u64::from(header.id_length))?;

    let color_table = if header.color_map_type == 1 && header.color_map_len > 0 {
        let mut raw = vec![0u8; header.color_map_bytes() as usize];
        file.field_bytes(&mut raw, "color map")?;
        let parsed = ColorTable::from_color_map_bytes(&raw, header.color_map_entry_bits)?;
        // On-disk maps need not be power-of-two sized; pad to the model's
        // canonical length. The header keeps the on-disk entry count.
        Some(ColorTable::from_canonical(parsed.entries())?)
    } else {
        None
    };
    let raw_start = file.stream_position()? - origin;

    let footer = if container_len >= HEADER_LEN + FOOTER_LEN {
        let mut raw = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::Start(origin + container_len - FOOTER_LEN))?;
        file.field_bytes(&mut raw, "footer record")?;
        TgaFooter::parse(&raw)
    } else {
        None
    };

    let mut raw_end = container_len - footer.map_or(0, |_| FOOTER_LEN);
    let mut extension = None;
    let mut stamp = None;
    let mut scanline_table = None;
    let mut color_correction = None;

    if let Some(footer) = footer {
        if footer.extension_offset != 0 {
            let ext_offset = u64::from(footer.extension_offset);
            if ext_offset + EXTENSION_AREA_LEN > container_len {
                return Err(Error::corrupted(
                    ext_offset,
                    "extension area offset out of file bounds",
                ));
            }
            let mut raw = [0u8; EXTENSION_AREA_LEN as usize];
            file.seek(SeekFrom::Start(origin + ext_offset))?;
            file.field_bytes(&mut raw, "extension area")?;
            let ext = ExtensionArea::parse(&raw)?;
            raw_end = raw_end.min(ext_offset);

            if ext.stamp_offset != 0 {
                let at = u64::from(ext.stamp_offset);
                file.seek(SeekFrom::Start(origin + at))?;
                let width = file.field_u8("postage stamp width")?;
                let height = file.field_u8("postage stamp height")?;
                let len =
                    u64::from(width) * u64::from(height) * u64::from(header.bytes_per_pixel());
                if at + 2 + len > container_len {
                    return Err(Error::corrupted(at, "postage stamp exceeds file bounds"));
                }
                let mut data = vec![0u8; len as usize];
                file.field_bytes(&mut data, "postage stamp data")?;
                stamp = Some(PostageStamp {
                    width,
                    height,
                    data,
                });
                raw_end = raw_end.min(at);
            }
            if ext.scanline_offset != 0 {
                let at = u64::from(ext.scanline_offset);
                let len = u64::from(header.height) * 4;
                if at + len > container_len {
                    return Err(Error::corrupted(at, "scan-line table exceeds file bounds"));
                }
                file.seek(SeekFrom::Start(origin + at))?;
                let mut table = Vec::with_capacity(header.height as usize);
                for row in 0..header.height {
                    table.push(file.field_u32(&format!("scan-line offset {row}"))?);
                }
                scanline_table = Some(table);
                raw_end = raw_end.min(at);
            }
            if ext.color_correction_offset != 0 {
                let at = u64::from(ext.color_correction_offset);
                let len = COLOR_CORRECTION_WORDS as u64 * 2;
                if at + len > container_len {
                    return Err(Error::corrupted(
                        at,
                        "color-correction table exceeds file bounds",
                    ));
                }
                file.seek(SeekFrom::Start(origin + at))?;
                let mut raw = vec![0u8; len as usize];
                file.field_bytes(&mut raw, "color-correction table")?;
                color_correction = Some(
                    raw.chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                );
                raw_end = raw_end.min(at);
            }
            extension = Some(ext);
        }
        if footer.developer_offset != 0 {
            raw_end = raw_end.min(u64::from(footer.developer_offset));
        }
    }

    let mut tags = AttributeSet::new();
    if let Some(ext) = &extension {
        if !ext.author.is_empty() {
            tags.record(Tag::Author, TagValue::Text(ext.author.clone()));
        }
        if !ext.comments.is_empty() {
            tags.record(Tag::Notes, TagValue::Text(ext.comments.clone()));
        }
        if !ext.stamp.is_empty() {
            tags.record(Tag::DateTime, TagValue::Stamp(ext.stamp));
        }
        if !ext.software_id.is_empty() {
            tags.record(Tag::Software, TagValue::Text(ext.software_id.clone()));
        }
        if let Some(version) = ext.version_text() {
            tags.record(Tag::SoftwareVersion, TagValue::Text(version));
        }
        if ext.key_color != 0 {
            tags.record(Tag::Background, TagValue::Color(ext.key_color as u16));
        }
    }

    debug!(
        raw_start,
        raw_end,
        has_footer = footer.is_some(),
        "structural scan complete"
    );
    Ok(ScannedTga {
        header,
        color_table,
        footer,
        extension,
        stamp,
        scanline_table,
        color_correction,
        raw_start,
        raw_end,
        tags,
    })
}

/// Tunables for footer-less detection.
///
/// The slack multiplier bounds how much larger than its theoretical
/// uncompressed size a run-length file may be before it stops looking like
/// format B. The default follows the historical tolerance; it is empirical
/// rather than load-bearing, hence configurable.
#[derive(Debug, Clone)]
pub struct DetectOptions {
    /// Worst-case growth multiplier for run-length payloads.
    pub rle_size_slack: f64,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            rle_size_slack: 1.5,
        }
    }
}

/// Stateless detection with default options.
pub fn detect(path: impl AsRef<Path>, origin: u64) -> bool {
    detect_with_options(path, origin, &DetectOptions::default())
}

/// Stateless detection: validates the header's legal sets, then trusts the
/// footer signature, falling back to the size heuristic for the legacy
/// footer-less variant. Never raises.
pub fn detect_with_options(path: impl AsRef<Path>, origin: u64, options: &DetectOptions) -> bool {
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
    detect_stream(&mut file, origin, options)
}

pub(crate) fn detect_stream<R: Read + Seek + ?Sized>(
    r: &mut R,
    origin: u64,
    options: &DetectOptions,
) -> bool {
    detect_inner(r, origin, options).unwrap_or(false)
}

fn detect_inner<R: Read + Seek + ?Sized>(
    r: &mut R,
    origin: u64,
    options: &DetectOptions,
) -> Result<bool> {
    let container_len = r.seek(SeekFrom::End(0))?.saturating_sub(origin);
    if container_len < HEADER_LEN {
        return Ok(false);
    }
    r.seek(SeekFrom::Start(origin))?;
    let header = match TgaHeader::parse(r) {
        Ok(header) => header,
        Err(_) => return Ok(false),
    };
    if header.validate().is_err() {
        return Ok(false);
    }

    if container_len >= HEADER_LEN + FOOTER_LEN {
        let mut raw = [0u8; FOOTER_LEN as usize];
        r.seek(SeekFrom::Start(origin + container_len - FOOTER_LEN))?;
        r.field_bytes(&mut raw, "footer record")?;
        if TgaFooter::parse(&raw).is_some() {
            return Ok(true);
        }
    }

    // Legacy footer-less variant: fall back to the size heuristic.
    let theoretical = HEADER_LEN
        + u64::from(header.id_length)
        + header.color_map_bytes()
        + header.theoretical_pixel_bytes();
    if header.image_type.is_rle() {
        Ok(container_len as f64 <= theoretical as f64 * options.rle_size_slack)
    } else {
        Ok(container_len >= theoretical)
    }
}

/// An open format-B container.
pub struct TgaFile {
    pub(crate) session: ContainerSession,
    pub(crate) header: TgaHeader,
    pub(crate) color_table: Option<ColorTable>,
    pub(crate) footer: Option<TgaFooter>,
    pub(crate) extension: Option<ExtensionArea>,
    pub(crate) stamp: Option<PostageStamp>,
    pub(crate) scanline_table: Option<Vec<u32>>,
    pub(crate) color_correction: Option<Vec<u16>>,
    pub(crate) raw_start: u64,
    pub(crate) raw_end: u64,
    pub(crate) tags: AttributeSet,
    access_cache: Option<BlockAccess>,
    pub(crate) palette_dirty: bool,
    pub(crate) sections_dirty: bool,
}

impl TgaFile {
    /// Opens an existing container and scans its structure.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode, origin: u64) -> Result<Self> {
        let mut session = ContainerSession::open(path, mode, origin)?;
        let guard = session.lock()?;
        let scan = scan_structure(session.file(), origin)?;
        drop(guard);
        Ok(Self {
            session,
            header: scan.header,
            color_table: scan.color_table,
            footer: scan.footer,
            extension: scan.extension,
            stamp: scan.stamp,
            scanline_table: scan.scanline_table,
            color_correction: scan.color_correction,
            raw_start: scan.raw_start,
            raw_end: scan.raw_end,
            tags: scan.tags,
            access_cache: None,
            palette_dirty: false,
            sections_dirty: false,
        })
    }

    /// Creates a new container from a header, an optional canonical
    /// palette and the raw (possibly pre-compressed) pixel payload. The
    /// footer and extension chain are laid down by [`TgaFile::save`].
    pub fn create(
        path: impl AsRef<Path>,
        origin: u64,
        mut header: TgaHeader,
        palette: Option<&[Rgba]>,
        payload: &[u8],
    ) -> Result<Self> {
        let color_table = palette.map(ColorTable::from_canonical).transpose()?;
        match (&color_table, palette) {
            (Some(table), Some(entries)) => {
                header.color_map_type = 1;
                header.color_map_first = 0;
                header.color_map_len = entries.len() as u16;
                if !matches!(header.color_map_entry_bits, 15 | 16 | 24 | 32) {
                    header.color_map_entry_bits =
                        if table.entries().iter().any(|e| e.a != 255) {
                            32
                        } else {
                            24
                        };
                }
            }
            _ => {
                header.color_map_type = 0;
                header.color_map_first = 0;
                header.color_map_len = 0;
                header.color_map_entry_bits = 0;
            }
        }
        header.id_length = 0;
        header.validate()?;

        let mut session = ContainerSession::open(path, AccessMode::Create, origin)?;
        let guard = session.lock()?;
        let raw_start = writer::write_leader(&mut session, &header, color_table.as_ref())?;
        session.write_at(raw_start, payload)?;
        let raw_end = raw_start + payload.len() as u64;
        session.truncate_to(raw_end)?;
        drop(guard);

        Ok(Self {
            session,
            header,
            color_table,
            footer: None,
            extension: None,
            stamp: None,
            scanline_table: None,
            color_correction: None,
            raw_start,
            raw_end,
            tags: AttributeSet::new(),
            access_cache: None,
            palette_dirty: false,
            sections_dirty: true,
        })
    }

    /// The scanned header record.
    pub fn header(&self) -> &TgaHeader {
        &self.header
    }

    /// The scanned footer record, if the container carries one.
    pub fn footer(&self) -> Option<&TgaFooter> {
        self.footer.as_ref()
    }

    /// The extension area, if present.
    pub fn extension(&self) -> Option<&ExtensionArea> {
        self.extension.as_ref()
    }

    /// Mutable extension area, created on demand. The whole trailing chain
    /// is rewritten on the next save.
    pub fn extension_mut(&mut self) -> &mut ExtensionArea {
        self.sections_dirty = true;
        self.extension.get_or_insert_with(ExtensionArea::default)
    }

    /// The canonical palette, if the container carries a color map.
    pub fn palette(&self) -> Option<&ColorTable> {
        self.color_table.as_ref()
    }

    /// Replaces the color map from a canonical RGBA palette. The on-disk
    /// map precedes the raw data, so its serialized size must not change.
    pub fn set_palette(&mut self, palette: &[Rgba]) -> Result<()> {
        self.session.require_writable()?;
        if self.header.color_map_type != 1 {
            return Err(Error::unsupported(
                "container has no color map to reconcile",
            ));
        }
        if palette.len() != usize::from(self.header.color_map_len) {
            return Err(Error::unsupported(format!(
                "palette of {} entries does not match the {}-entry on-disk map; \
                 resizing would relocate raw data",
                palette.len(),
                self.header.color_map_len
            )));
        }
        self.color_table = Some(ColorTable::from_canonical(palette)?);
        self.palette_dirty = true;
        Ok(())
    }

    /// The embedded thumbnail, if present.
    pub fn postage_stamp(&self) -> Option<&PostageStamp> {
        self.stamp.as_ref()
    }

    /// Sets or replaces the embedded thumbnail.
    pub fn set_postage_stamp(&mut self, stamp: PostageStamp) -> Result<()> {
        let expected =
            u32::from(stamp.width) * u32::from(stamp.height) * self.header.bytes_per_pixel();
        if stamp.data.len() as u32 != expected {
            return Err(Error::corrupted(
                0,
                format!(
                    "postage stamp data holds {} bytes, dimensions imply {expected}",
                    stamp.data.len()
                ),
            ));
        }
        self.stamp = Some(stamp);
        self.sections_dirty = true;
        Ok(())
    }

    /// The scan-line table, if present.
    pub fn scan_line_table(&self) -> Option<&[u32]> {
        self.scanline_table.as_deref()
    }

    /// Sets the scan-line table; one offset per image row.
    pub fn set_scan_line_table(&mut self, table: Vec<u32>) -> Result<()> {
        if table.len() != usize::from(self.header.height) {
            return Err(Error::corrupted(
                0,
                format!(
                    "scan-line table holds {} entries for {} rows",
                    table.len(),
                    self.header.height
                ),
            ));
        }
        self.scanline_table = Some(table);
        self.access_cache = None;
        self.sections_dirty = true;
        Ok(())
    }

    /// The color-correction table, if present.
    pub fn color_correction(&self) -> Option<&[u16]> {
        self.color_correction.as_deref()
    }

    /// Sets the color-correction table of 256 four-word entries.
    pub fn set_color_correction(&mut self, table: Vec<u16>) -> Result<()> {
        if table.len() != COLOR_CORRECTION_WORDS {
            return Err(Error::corrupted(
                0,
                format!(
                    "color-correction table holds {} words, expected {COLOR_CORRECTION_WORDS}",
                    table.len()
                ),
            ));
        }
        self.color_correction = Some(table);
        self.sections_dirty = true;
        Ok(())
    }

    /// The generic attribute set.
    pub fn tags(&self) -> &AttributeSet {
        &self.tags
    }

    /// Mutable access to the attribute set; changed tags reach the
    /// extension area on the next save.
    pub fn tags_mut(&mut self) -> &mut AttributeSet {
        &mut self.tags
    }

    /// Derived descriptor for the pixel-access layer.
    ///
    /// The access mode reflects what is currently known; call
    /// [`TgaFile::resolve_access`] to force the run-length analysis.
    pub fn frame_descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            width: self.header.width,
            height: self.header.height,
            interlaced: false,
            rle_compressed: self.header.image_type.is_rle(),
            access: self.access_cache.unwrap_or(BlockAccess::Sequential),
            transparency: None,
            index_bits: 8,
            data_start: self.raw_start,
            data_end: self.raw_end,
        }
    }

    /// Determines the legal block-access mode, running the run-length
    /// layout analysis on first use when the payload is compressed and no
    /// scan-line table short-circuits the answer.
    pub fn resolve_access(&mut self) -> Result<BlockAccess> {
        if let Some(access) = self.access_cache {
            return Ok(access);
        }
        let access = if !self.header.image_type.is_rle() || self.scanline_table.is_some() {
            BlockAccess::RandomLine
        } else {
            let guard = self.session.lock()?;
            let origin = self.session.origin();
            let (start, end) = (origin + self.raw_start, origin + self.raw_end);
            let (width, height, bpp) = (
                u32::from(self.header.width),
                u32::from(self.header.height),
                self.header.bytes_per_pixel(),
            );
            let spans = rle::runs_span_scanlines(
                self.session.file(),
                start,
                end,
                width,
                height,
                bpp,
            )?;
            drop(guard);
            if spans {
                BlockAccess::Sequential
            } else {
                BlockAccess::RandomLine
            }
        };
        self.access_cache = Some(access);
        Ok(access)
    }

    /// Fails with [`Error::IllegalAccessMode`] unless random line access
    /// is legal for this container.
    pub fn require_line_access(&mut self) -> Result<()> {
        match self.resolve_access()? {
            BlockAccess::RandomLine => Ok(()),
            BlockAccess::Sequential => Err(Error::illegal_access(
                "run-length runs span scanline boundaries; only whole-image decode is legal",
            )),
        }
    }

    /// Recomputes the trailing section chain and rewrites it, footer last.
    /// Raw-data bytes are never touched.
    pub fn save(&mut self) -> Result<()> {
        self.session.require_writable()?;
        let guard = self.session.lock()?;
        writer::save_full(self)?;
        drop(guard);
        self.tags.clear_dirty();
        self.palette_dirty = false;
        self.sections_dirty = false;
        Ok(())
    }

    /// Saves pending changes (in writable modes) and closes the session.
    pub fn close(mut self) -> Result<()> {
        if self.session.mode().is_writable()
            && (self.sections_dirty || self.tags.any_dirty() || self.palette_dirty)
        {
            self.save()?;
        }
        self.session.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn truecolor_header(width: u16, height: u16) -> TgaHeader {
        TgaHeader {
            id_length: 0,
            color_map_type: 0,
            image_type: TgaImageType::TrueColor,
            color_map_first: 0,
            color_map_len: 0,
            color_map_entry_bits: 0,
            x_origin: 0,
            y_origin: 0,
            width,
            height,
            pixel_depth: 24,
            descriptor: 0x20,
        }
    }

    fn sample_payload(header: &TgaHeader) -> Vec<u8> {
        vec![0x7Fu8; (header.theoretical_pixel_bytes()) as usize]
    }

    fn create_sample(path: &std::path::Path) {
        let header = truecolor_header(4, 4);
        let payload = sample_payload(&header);
        let mut tga = TgaFile::create(path, 0, header, None, &payload).unwrap();
        tga.tags_mut().set_text(Tag::Author, "someone with a scanner");
        tga.tags_mut().set_text(Tag::Notes, "first line\nsecond line");
        tga.tags_mut().set_text(Tag::Software, "RASTRA");
        tga.tags_mut().set_text(Tag::SoftwareVersion, "2.05b");
        tga.tags_mut().set(
            Tag::DateTime,
            TagValue::Stamp(DateStamp {
                year: 1997,
                month: 3,
                day: 14,
                hour: 9,
                minute: 26,
                second: 53,
            }),
        );
        tga.save().unwrap();
        tga.close().unwrap();
    }

    #[test]
    fn test_round_trip_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.tga");
        create_sample(&path);

        let tga = TgaFile::open(&path, AccessMode::Read, 0).unwrap();
        assert_eq!(tga.header().width, 4);
        assert_eq!(tga.header().image_type, TgaImageType::TrueColor);
        assert!(tga.header().top_origin());
        assert_eq!(tga.tags().text(Tag::Author), Some("someone with a scanner"));
        assert_eq!(tga.tags().text(Tag::Notes), Some("first line\nsecond line"));
        assert_eq!(tga.tags().text(Tag::Software), Some("RASTRA"));
        assert_eq!(tga.tags().text(Tag::SoftwareVersion), Some("2.05b"));
        let stamp = tga.tags().stamp(Tag::DateTime).unwrap();
        assert_eq!((stamp.year, stamp.month, stamp.day), (1997, 3, 14));
        assert_eq!(tga.footer().unwrap().developer_offset, 0);
    }

    #[test]
    fn test_color_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.tga");
        let mut header = truecolor_header(2, 2);
        header.image_type = TgaImageType::ColorMapped;
        header.pixel_depth = 8;
        let palette: Vec<Rgba> = (0..4u8)
            .map(|i| Rgba {
                r: i * 10,
                g: i * 20,
                b: i * 30,
                a: if i == 3 { 0 } else { 255 },
            })
            .collect();
        let tga = TgaFile::create(&path, 0, header, Some(&palette), &[0, 1, 2, 3]).unwrap();
        tga.close().unwrap();

        let back = TgaFile::open(&path, AccessMode::Read, 0).unwrap();
        // Alpha present, so the map was stored at 32 bits per entry.
        assert_eq!(back.header().color_map_entry_bits, 32);
        assert_eq!(back.palette().unwrap().entries(), palette.as_slice());
    }

    #[test]
    fn test_payload_bytes_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.tga");
        create_sample(&path);

        let before = std::fs::read(&path).unwrap();
        let mut tga = TgaFile::open(&path, AccessMode::Write, 0).unwrap();
        let (start, end) = (tga.raw_start as usize, tga.raw_end as usize);
        tga.tags_mut().set_text(Tag::Notes, "completely different commentary");
        tga.save().unwrap();
        tga.close().unwrap();

        let after = std::fs::read(&path).unwrap();
        assert_eq!(&after[start..end], &before[start..end]);
    }

    #[test]
    fn test_sniffer_soundness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sniff.tga");
        create_sample(&path);
        assert!(detect(&path, 0));

        let mut raw = std::fs::read(&path).unwrap();
        // Image type 7 is outside the legal set.
        raw[2] = 7;
        std::fs::write(&path, &raw).unwrap();
        assert!(!detect(&path, 0));
    }

    #[test]
    fn test_footerless_size_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let header = truecolor_header(4, 4);

        // Legacy uncompressed file: exactly the theoretical size, no footer.
        let legacy = dir.path().join("legacy.tga");
        let mut raw = header.serialize().to_vec();
        raw.extend_from_slice(&sample_payload(&header));
        std::fs::write(&legacy, &raw).unwrap();
        assert!(detect(&legacy, 0));

        // Truncated below the theoretical size: not this format.
        let short = dir.path().join("short.tga");
        std::fs::write(&short, &raw[..raw.len() - 8]).unwrap();
        assert!(!detect(&short, 0));
    }

    #[test]
    fn test_footerless_rle_heuristic_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let mut header = truecolor_header(4, 4);
        header.image_type = TgaImageType::TrueColorRle;

        // A run-length file may undershoot the theoretical size but not
        // exceed the slack bound.
        let path = dir.path().join("rle.tga");
        let mut raw = header.serialize().to_vec();
        raw.extend_from_slice(&vec![0u8; 60]);
        std::fs::write(&path, &raw).unwrap();
        assert!(detect(&path, 0));

        let bloated = dir.path().join("bloated.tga");
        let mut raw = header.serialize().to_vec();
        raw.extend_from_slice(&vec![0u8; 4 * 4 * 3 * 2]);
        std::fs::write(&bloated, &raw).unwrap();
        assert!(!detect(&bloated, 0));
        assert!(detect_with_options(
            &bloated,
            0,
            &DetectOptions {
                rle_size_slack: 2.5
            }
        ));
    }

    #[test]
    fn test_extension_area_serialization_is_symmetric() {
        let mut ext = ExtensionArea::default();
        ext.author = "ada".into();
        ext.comments = "one\ntwo\nthree".into();
        ext.stamp = DateStamp {
            year: 2001,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
        };
        ext.job_name = "batch 42".into();
        ext.job_time = (1, 30, 0);
        ext.software_id = "rastra".into();
        ext.set_version_text("1.25c");
        ext.key_color = 0x00FF_00FF;
        ext.pixel_ratio = (4, 3);
        ext.gamma = (22, 10);
        ext.attributes_type = 2;

        let raw = ext.serialize();
        assert_eq!(raw.len() as u64, EXTENSION_AREA_LEN);
        let back = ExtensionArea::parse(&raw).unwrap();
        assert_eq!(back, ext);
        assert_eq!(back.version_text().as_deref(), Some("1.25c"));
    }

    #[test]
    fn test_version_text_parsing_tolerates_shapes() {
        let mut ext = ExtensionArea::default();
        ext.set_version_text("2.05b");
        assert_eq!((ext.version_number, ext.version_letter), (205, b'b'));
        ext.set_version_text("3.1");
        assert_eq!((ext.version_number, ext.version_letter), (310, b' '));
        ext.set_version_text("");
        assert_eq!((ext.version_number, ext.version_letter), (0, b' '));
    }

    #[test]
    fn test_mismatched_scan_line_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.tga");
        create_sample(&path);

        let mut tga = TgaFile::open(&path, AccessMode::Write, 0).unwrap();
        let err = tga.set_scan_line_table(vec![0; 3]).unwrap_err();
        assert!(matches!(err, Error::CorruptedStructure { .. }));
        assert!(tga.set_scan_line_table(vec![0; 4]).is_ok());
    }
}
