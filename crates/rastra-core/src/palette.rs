//! Palette and transparency reconciliation.
//!
//! Both containers store indexed color as an on-disk color table whose
//! entry layout differs from the canonical in-memory form: format A stores
//! plain RGB triplets in canonical order with transparency expressed as a
//! separate index, while format B stores channel-reversed BGR(A) entries at
//! 16, 24 or 32 bits per entry. This module converts both to and from a
//! single canonical RGBA representation, keeping the conversions symmetric
//! so repeated read→write cycles are byte-stable.

use crate::error::{Error, Result};

/// One canonical palette entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
    /// Alpha channel; 255 is fully opaque.
    pub a: u8,
}

impl Rgba {
    /// Creates an opaque entry.
    pub fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// The `(i, i, i)` gray default used for unpopulated table slots.
    fn slot_default(i: usize) -> Self {
        let v = i as u8;
        Self::opaque(v, v, v)
    }
}

/// Ordered color table with a power-of-two length in `[2, 256]`.
///
/// The length is the source of the bit count stored in the owning header's
/// packed field, so the invariant is enforced on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorTable {
    entries: Vec<Rgba>,
}

impl ColorTable {
    /// Wraps an entry list, validating the length invariant.
    pub fn new(entries: Vec<Rgba>) -> Result<Self> {
        let len = entries.len();
        if !(2..=256).contains(&len) || !len.is_power_of_two() {
            return Err(Error::unsupported(format!(
                "color table length {len} is not a power of two in 2..=256"
            )));
        }
        Ok(Self { entries })
    }

    /// Builds a table from an arbitrary canonical palette, padding to the
    /// next power-of-two length with `(i, i, i, 255)` defaults.
    pub fn from_canonical(palette: &[Rgba]) -> Result<Self> {
        if palette.len() > 256 {
            return Err(Error::unsupported(format!(
                "palette holds {} entries, more than the 256 a color table can carry",
                palette.len()
            )));
        }
        let len = palette.len().next_power_of_two().max(2);
        let mut entries = Vec::with_capacity(len);
        entries.extend_from_slice(palette);
        for i in palette.len()..len {
            entries.push(Rgba::slot_default(i));
        }
        Self::new(entries)
    }

    /// The canonical entries, in table order.
    pub fn entries(&self) -> &[Rgba] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A color table is never empty; present for completeness.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bit count implied by the table length (`log2(len)`), as stored in
    /// the owning header's packed field.
    pub fn index_bits(&self) -> u8 {
        self.entries.len().trailing_zeros() as u8
    }

    /// Index of the first entry with zero alpha, if any.
    pub fn first_transparent(&self) -> Option<u8> {
        self.entries.iter().position(|e| e.a == 0).map(|i| i as u8)
    }

    /// Returns true if any entry carries zero alpha.
    pub fn has_transparency(&self) -> bool {
        self.entries.iter().any(|e| e.a == 0)
    }

    // --- format A (RGB triplets, canonical channel order) ---

    /// Decodes a format-A table from raw RGB triplets. When the owning
    /// graphic control block declared a transparency index, that entry's
    /// alpha is cleared.
    pub fn from_rgb_bytes(raw: &[u8], transparent: Option<u8>) -> Result<Self> {
        if raw.len() % 3 != 0 {
            return Err(Error::corrupted(
                0,
                format!("RGB color table of {} bytes is not triplet-aligned", raw.len()),
            ));
        }
        let mut entries: Vec<Rgba> = raw
            .chunks_exact(3)
            .map(|c| Rgba::opaque(c[0], c[1], c[2]))
            .collect();
        if let Some(index) = transparent {
            if let Some(entry) = entries.get_mut(index as usize) {
                entry.a = 0;
            }
        }
        Self::new(entries)
    }

    /// Encodes the table as raw RGB triplets in canonical order. Alpha is
    /// not representable here; it travels as a transparency index chosen by
    /// [`resolve_transparency`].
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.entries.len() * 3);
        for e in &self.entries {
            raw.extend_from_slice(&[e.r, e.g, e.b]);
        }
        raw
    }

    // --- format B (channel-reversed entries, 16/24/32 bits) ---

    /// Decodes a format-B color map. Two-byte entries are widened to full
    /// 8-bit channels; 24- and 32-bit entries have their B,G,R[,A] disk
    /// order permuted to canonical RGB(A).
    pub fn from_color_map_bytes(raw: &[u8], entry_bits: u8) -> Result<Self> {
        let entries = match entry_bits {
            15 | 16 => raw
                .chunks_exact(2)
                .map(|c| {
                    let v = u16::from_le_bytes([c[0], c[1]]);
                    Rgba::opaque(
                        widen5((v >> 10) & 0x1F),
                        widen5((v >> 5) & 0x1F),
                        widen5(v & 0x1F),
                    )
                })
                .collect(),
            24 => raw
                .chunks_exact(3)
                .map(|c| Rgba::opaque(c[2], c[1], c[0]))
                .collect(),
            32 => raw
                .chunks_exact(4)
                .map(|c| Rgba {
                    r: c[2],
                    g: c[1],
                    b: c[0],
                    a: c[3],
                })
                .collect(),
            other => {
                return Err(Error::unsupported(format!(
                    "color map entry size of {other} bits"
                )))
            }
        };
        Self::new(entries)
    }

    /// Encodes the table as a format-B color map, reversing the channel
    /// permutation applied on read so a read→write cycle is idempotent.
    pub fn to_color_map_bytes(&self, entry_bits: u8) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        match entry_bits {
            15 | 16 => {
                for e in &self.entries {
                    let v: u16 = (u16::from(narrow5(e.r)) << 10)
                        | (u16::from(narrow5(e.g)) << 5)
                        | u16::from(narrow5(e.b));
                    raw.extend_from_slice(&v.to_le_bytes());
                }
            }
            24 => {
                for e in &self.entries {
                    raw.extend_from_slice(&[e.b, e.g, e.r]);
                }
            }
            32 => {
                for e in &self.entries {
                    raw.extend_from_slice(&[e.b, e.g, e.r, e.a]);
                }
            }
            other => {
                return Err(Error::unsupported(format!(
                    "color map entry size of {other} bits"
                )))
            }
        }
        Ok(raw)
    }
}

/// Widens a 5-bit channel to 8 bits, replicating the high bits so that the
/// matching [`narrow5`] recovers the original value.
fn widen5(v: u16) -> u8 {
    let v = v as u8;
    (v << 3) | (v >> 2)
}

fn narrow5(v: u8) -> u8 {
    v >> 3
}

/// 256-bucket histogram of alpha-zero pixel occurrences.
///
/// The pixel-access layer records every pixel whose palette entry carries
/// zero alpha while it builds its output; the reconciler then picks the
/// most frequent index as the on-disk transparency index. Ties break toward
/// the lowest index, which downstream visual output depends on.
#[derive(Debug, Clone)]
pub struct AlphaHistogram {
    buckets: [u64; 256],
}

impl Default for AlphaHistogram {
    fn default() -> Self {
        Self { buckets: [0; 256] }
    }
}

impl AlphaHistogram {
    /// Creates an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one alpha-zero pixel at `index`.
    pub fn record(&mut self, index: u8) {
        self.buckets[index as usize] += 1;
    }

    /// The most frequent index, lowest index on ties; `None` if nothing
    /// was recorded.
    pub fn resolve(&self) -> Option<u8> {
        let (index, &count) = self
            .buckets
            .iter()
            .enumerate()
            .max_by(|(ia, ca), (ib, cb)| ca.cmp(cb).then(ib.cmp(ia)))?;
        (count > 0).then_some(index as u8)
    }
}

/// Chooses the transparency index a format-A table must declare.
///
/// Returns `None` when the palette is fully opaque. Otherwise the
/// previously known index wins if it still names a transparent entry;
/// failing that, the histogram decides, and a palette with transparent
/// entries but no recorded pixels falls back to the lowest transparent
/// index.
pub fn resolve_transparency(
    table: &ColorTable,
    known: Option<u8>,
    histogram: &AlphaHistogram,
) -> Option<u8> {
    if !table.has_transparency() {
        return None;
    }
    if let Some(index) = known {
        if table.entries().get(index as usize).is_some_and(|e| e.a == 0) {
            return Some(index);
        }
    }
    histogram.resolve().or_else(|| table.first_transparent())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_length_invariant() {
        assert!(ColorTable::new(vec![Rgba::opaque(0, 0, 0); 3]).is_err());
        assert!(ColorTable::new(vec![Rgba::opaque(0, 0, 0); 512]).is_err());
        assert!(ColorTable::new(vec![]).is_err());
        let table = ColorTable::new(vec![Rgba::opaque(0, 0, 0); 16]).unwrap();
        assert_eq!(table.index_bits(), 4);
    }

    #[test]
    fn test_from_canonical_pads_with_gray_defaults() {
        let table = ColorTable::from_canonical(&[
            Rgba::opaque(10, 20, 30),
            Rgba::opaque(40, 50, 60),
            Rgba::opaque(70, 80, 90),
        ])
        .unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.entries()[3], Rgba::opaque(3, 3, 3));
    }

    #[test]
    fn test_rgb_round_trip_with_transparency() {
        let raw = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let table = ColorTable::from_rgb_bytes(&raw, Some(2)).unwrap();
        assert_eq!(table.entries()[2].a, 0);
        assert_eq!(table.entries()[0].a, 255);
        assert_eq!(table.to_rgb_bytes(), raw);
    }

    #[test]
    fn test_color_map_channel_permutation() {
        // Disk order is B,G,R,A; canonical is R,G,B,A.
        let raw = [0x01u8, 0x02, 0x03, 0xFF, 0x04, 0x05, 0x06, 0x00];
        let table = ColorTable::from_color_map_bytes(&raw, 32).unwrap();
        assert_eq!(table.entries()[0], Rgba { r: 3, g: 2, b: 1, a: 255 });
        assert_eq!(table.entries()[1], Rgba { r: 6, g: 5, b: 4, a: 0 });
        assert_eq!(table.to_color_map_bytes(32).unwrap(), raw);
    }

    #[test]
    fn test_16_bit_entries_round_trip() {
        // 5-bit channels widen to 8 bits and narrow back without drift.
        let raw: Vec<u8> = (0..32u16)
            .map(|v| (v << 10) | ((31 - v) << 5) | v)
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let table = ColorTable::from_color_map_bytes(&raw, 16).unwrap();
        assert_eq!(table.to_color_map_bytes(16).unwrap(), raw);
    }

    #[test]
    fn test_unsupported_entry_size() {
        assert!(ColorTable::from_color_map_bytes(&[0; 8], 48).is_err());
    }

    #[test]
    fn test_histogram_prefers_most_frequent_index() {
        let mut entries = vec![Rgba::opaque(9, 9, 9); 8];
        entries[3].a = 0;
        entries[7].a = 0;
        let table = ColorTable::new(entries).unwrap();

        let mut histogram = AlphaHistogram::new();
        for _ in 0..5 {
            histogram.record(3);
        }
        for _ in 0..2 {
            histogram.record(7);
        }
        assert_eq!(resolve_transparency(&table, None, &histogram), Some(3));
    }

    #[test]
    fn test_histogram_tie_breaks_to_lowest_index() {
        let mut entries = vec![Rgba::opaque(0, 0, 0); 8];
        entries[3].a = 0;
        entries[7].a = 0;
        let table = ColorTable::new(entries).unwrap();

        let mut histogram = AlphaHistogram::new();
        for _ in 0..4 {
            histogram.record(3);
            histogram.record(7);
        }
        assert_eq!(resolve_transparency(&table, None, &histogram), Some(3));
    }

    #[test]
    fn test_transparency_resolution_order() {
        let mut entries = vec![Rgba::opaque(0, 0, 0); 4];
        entries[1].a = 0;
        entries[2].a = 0;
        let table = ColorTable::new(entries).unwrap();
        let empty = AlphaHistogram::new();

        // Known index wins while it still names a transparent entry.
        assert_eq!(resolve_transparency(&table, Some(2), &empty), Some(2));
        // A stale known index falls through to the histogram/fallback.
        assert_eq!(resolve_transparency(&table, Some(3), &empty), Some(1));
        // Fully opaque palettes need no index at all.
        let opaque = ColorTable::new(vec![Rgba::opaque(0, 0, 0); 4]).unwrap();
        assert_eq!(resolve_transparency(&opaque, None, &empty), None);
    }
}
