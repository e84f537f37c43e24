//! Sub-block codec and extension records for format A.
//!
//! Format A streams variable-length extension payloads as chains of
//! size-prefixed sub-blocks: one size byte (1-255) followed by that many
//! payload bytes, terminated by a zero size byte. Every extension block is
//! a tagged variant over that mechanism, so the decoder here is a small
//! dispatch on the extension label followed by sub-block reads.

use crate::error::{Error, Result};
use crate::io::ReadFieldExt;
use bytes::{BufMut, BytesMut};
use std::io::{Read, Seek};

/// Extension label for the unsupported plain-text block.
pub(crate) const LABEL_PLAIN_TEXT: u8 = 0x01;
/// Extension label for a graphic control block.
pub(crate) const LABEL_GRAPHIC_CONTROL: u8 = 0xF9;
/// Extension label for a comment block.
pub(crate) const LABEL_COMMENT: u8 = 0xFE;
/// Extension label for an application block.
pub(crate) const LABEL_APPLICATION: u8 = 0xFF;

/// Reads a sub-block chain, concatenating the payload bytes.
pub(crate) fn read_sub_blocks<R: Read + Seek + ?Sized>(r: &mut R) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    loop {
        let size = r.field_u8("sub-block size")?;
        if size == 0 {
            return Ok(payload);
        }
        let start = payload.len();
        payload.resize(start + size as usize, 0);
        r.field_bytes(&mut payload[start..], "sub-block payload")?;
    }
}

/// Skips a sub-block chain without retaining the payload.
pub(crate) fn skip_sub_blocks<R: Read + Seek + ?Sized>(r: &mut R) -> Result<()> {
    loop {
        let size = r.field_u8("sub-block size")?;
        if size == 0 {
            return Ok(());
        }
        r.skip_bytes(size as u64)?;
    }
}

/// Appends `payload` as a sub-block chain, including the terminator.
pub(crate) fn put_sub_blocks(buf: &mut BytesMut, payload: &[u8]) {
    for chunk in payload.chunks(255) {
        buf.put_u8(chunk.len() as u8);
        buf.put_slice(chunk);
    }
    buf.put_u8(0);
}

/// Serialized length of `payload` as a sub-block chain.
pub(crate) fn sub_blocks_len(payload_len: usize) -> u64 {
    payload_len as u64 + payload_len.div_ceil(255) as u64 + 1
}

/// Graphic control data buffered for the image descriptor that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphicControl {
    /// Disposal method bits from the packed byte.
    pub disposal: u8,
    /// Frame delay in hundredths of a second.
    pub delay_centis: u16,
    /// Transparent palette index; `None` when the valid flag is clear.
    pub transparent: Option<u8>,
}

impl GraphicControl {
    /// Fixed block size declared by a graphic control block.
    const BLOCK_SIZE: u8 = 4;

    /// Parses the block body following the `0x21 0xF9` introducer.
    pub(crate) fn parse<R: Read + Seek + ?Sized>(r: &mut R) -> Result<Self> {
        let pos = r.stream_position()?;
        let size = r.field_u8("graphic control block size")?;
        if size != Self::BLOCK_SIZE {
            return Err(Error::corrupted(
                pos,
                format!("graphic control block size {size}, expected 4"),
            ));
        }
        let packed = r.field_u8("graphic control flags")?;
        let delay_centis = r.field_u16("graphic control delay")?;
        let index = r.field_u8("transparent color index")?;
        skip_sub_blocks(r)?;
        Ok(Self {
            disposal: (packed >> 2) & 0x07,
            delay_centis,
            transparent: (packed & 0x01 != 0).then_some(index),
        })
    }

    /// Serializes the whole block, introducer included. The layout is
    /// fixed-size, which is what lets the writer patch it in place.
    pub(crate) fn serialize(&self) -> [u8; 8] {
        let mut packed = (self.disposal & 0x07) << 2;
        if self.transparent.is_some() {
            packed |= 0x01;
        }
        let [delay_lo, delay_hi] = self.delay_centis.to_le_bytes();
        [
            0x21,
            LABEL_GRAPHIC_CONTROL,
            Self::BLOCK_SIZE,
            packed,
            delay_lo,
            delay_hi,
            self.transparent.unwrap_or(0),
            0,
        ]
    }
}

/// Application extension data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    /// Eight-byte application identifier.
    pub identifier: [u8; 8],
    /// Three-byte authentication code.
    pub auth_code: [u8; 3],
    /// Concatenated payload sub-blocks.
    pub payload: Vec<u8>,
}

impl Application {
    /// Fixed header size declared by an application block.
    const BLOCK_SIZE: u8 = 11;

    pub(crate) fn parse<R: Read + Seek + ?Sized>(r: &mut R) -> Result<Self> {
        let pos = r.stream_position()?;
        let size = r.field_u8("application block size")?;
        if size != Self::BLOCK_SIZE {
            return Err(Error::corrupted(
                pos,
                format!("application block size {size}, expected 11"),
            ));
        }
        let mut identifier = [0u8; 8];
        r.field_bytes(&mut identifier, "application identifier")?;
        let mut auth_code = [0u8; 3];
        r.field_bytes(&mut auth_code, "application auth code")?;
        let payload = read_sub_blocks(r)?;
        Ok(Self {
            identifier,
            auth_code,
            payload,
        })
    }

    pub(crate) fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&[0x21, LABEL_APPLICATION, Self::BLOCK_SIZE]);
        buf.put_slice(&self.identifier);
        buf.put_slice(&self.auth_code);
        put_sub_blocks(buf, &self.payload);
    }

    /// Serialized length of the whole block, introducer included.
    pub(crate) fn serialized_len(&self) -> u64 {
        3 + 8 + 3 + sub_blocks_len(self.payload.len())
    }

    /// The identifier as trimmed ASCII text.
    pub fn identifier_text(&self) -> String {
        crate::io::fixed_ascii(&self.identifier)
    }

    /// The authentication code as trimmed ASCII text.
    pub fn auth_code_text(&self) -> String {
        crate::io::fixed_ascii(&self.auth_code)
    }
}

/// One parsed extension block, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionRecord {
    /// Comment block text.
    Comment(String),
    /// Graphic control block, buffered for the next image descriptor.
    GraphicControl(GraphicControl),
    /// Application block.
    Application(Application),
}

impl ExtensionRecord {
    /// Parses the extension body after the `0x21` introducer and its label
    /// byte. Plain-text blocks are structurally valid but unsupported and
    /// abort the scan; unknown labels are corruption.
    pub(crate) fn parse<R: Read + Seek + ?Sized>(r: &mut R, label: u8) -> Result<Self> {
        match label {
            LABEL_COMMENT => {
                let raw = read_sub_blocks(r)?;
                Ok(Self::Comment(
                    String::from_utf8_lossy(&raw).into_owned(),
                ))
            }
            LABEL_GRAPHIC_CONTROL => Ok(Self::GraphicControl(GraphicControl::parse(r)?)),
            LABEL_APPLICATION => Ok(Self::Application(Application::parse(r)?)),
            LABEL_PLAIN_TEXT => Err(Error::unsupported("plain text extension block")),
            other => {
                let pos = r.stream_position()?;
                Err(Error::corrupted(
                    pos,
                    format!("unknown extension label 0x{other:02X}"),
                ))
            }
        }
    }
}

/// Serializes a comment block, introducer included.
pub(crate) fn serialize_comment(text: &str, buf: &mut BytesMut) {
    buf.put_slice(&[0x21, LABEL_COMMENT]);
    put_sub_blocks(buf, text.as_bytes());
}

/// Serialized length of a comment block for `text`.
pub(crate) fn comment_len(text: &str) -> u64 {
    2 + sub_blocks_len(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sub_block_round_trip() {
        let payload: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let mut buf = BytesMut::new();
        put_sub_blocks(&mut buf, &payload);
        assert_eq!(buf.len() as u64, sub_blocks_len(payload.len()));

        let mut cur = Cursor::new(buf.to_vec());
        assert_eq!(read_sub_blocks(&mut cur).unwrap(), payload);
    }

    #[test]
    fn test_empty_sub_block_chain_is_just_a_terminator() {
        let mut buf = BytesMut::new();
        put_sub_blocks(&mut buf, &[]);
        assert_eq!(buf.as_ref(), &[0u8]);
        assert_eq!(sub_blocks_len(0), 1);
    }

    #[test]
    fn test_truncated_sub_block_is_corruption() {
        let mut cur = Cursor::new(vec![5u8, 1, 2]);
        assert!(matches!(
            read_sub_blocks(&mut cur),
            Err(Error::CorruptedStructure { .. })
        ));
    }

    #[test]
    fn test_graphic_control_round_trip() {
        let gce = GraphicControl {
            disposal: 2,
            delay_centis: 500,
            transparent: Some(7),
        };
        let raw = gce.serialize();
        // Skip the 0x21 0xF9 introducer the parser has already consumed.
        let mut cur = Cursor::new(raw[2..].to_vec());
        assert_eq!(GraphicControl::parse(&mut cur).unwrap(), gce);
    }

    #[test]
    fn test_graphic_control_without_transparency() {
        let gce = GraphicControl {
            disposal: 1,
            delay_centis: 10,
            transparent: None,
        };
        let raw = gce.serialize();
        assert_eq!(raw[3] & 0x01, 0);
        let mut cur = Cursor::new(raw[2..].to_vec());
        assert_eq!(GraphicControl::parse(&mut cur).unwrap().transparent, None);
    }

    #[test]
    fn test_application_round_trip() {
        let app = Application {
            identifier: *b"NETSCAPE",
            auth_code: *b"2.0",
            payload: vec![0x01, 0x00, 0x00],
        };
        let mut buf = BytesMut::new();
        app.serialize_into(&mut buf);
        assert_eq!(buf.len() as u64, app.serialized_len());

        let mut cur = Cursor::new(buf[2..].to_vec());
        let back = Application::parse(&mut cur).unwrap();
        assert_eq!(back, app);
        assert_eq!(back.identifier_text(), "NETSCAPE");
        assert_eq!(back.auth_code_text(), "2.0");
    }

    #[test]
    fn test_plain_text_is_unsupported() {
        let mut cur = Cursor::new(vec![0u8]);
        assert!(matches!(
            ExtensionRecord::parse(&mut cur, LABEL_PLAIN_TEXT),
            Err(Error::UnsupportedVariant { .. })
        ));
    }

    #[test]
    fn test_unknown_label_is_corruption() {
        let mut cur = Cursor::new(vec![0u8]);
        assert!(matches!(
            ExtensionRecord::parse(&mut cur, 0x42),
            Err(Error::CorruptedStructure { .. })
        ));
    }
}
