//! Bulk payload header codec.
//!
//! Every payload transfer starts with a header: `bHeaderLength`, a bitfield
//! and, in the legacy 12-byte form, a 4-byte presentation timestamp and a
//! 6-byte source clock reference.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Payload header bitfield flags.
pub mod flags {
    /// Frame ID, toggled at every frame boundary.
    pub const FID: u8 = 0x01;
    /// End of frame.
    pub const EOF: u8 = 0x02;
    /// Presentation timestamp present.
    pub const PTS: u8 = 0x04;
    /// Source clock reference present.
    pub const SCR: u8 = 0x08;
    /// Still image.
    pub const STI: u8 = 0x20;
    /// Payload error.
    pub const ERR: u8 = 0x40;
    /// End of header.
    pub const EOH: u8 = 0x80;
}

/// Length of the compact header.
pub const COMPACT_HEADER_LEN: usize = 2;
/// Length of the header carrying PTS and SCR fields.
pub const LEGACY_HEADER_LEN: usize = 12;

/// Which payload header layout the gadget emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HeaderFormat {
    /// `{length, bitfield}`.
    #[default]
    Compact,
    /// `{length, bitfield, PTS[4], SCR[6]}`.
    Legacy,
}

impl HeaderFormat {
    /// Encoded header length in bytes.
    pub const fn len(self) -> usize {
        match self {
            Self::Compact => COMPACT_HEADER_LEN,
            Self::Legacy => LEGACY_HEADER_LEN,
        }
    }
}

/// One-bit frame identifier carried in every payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameId(bool);

impl FrameId {
    /// Frame ID with the bit cleared.
    pub const ZERO: Self = Self(false);

    /// The bit as sent on the wire.
    pub fn bit(self) -> u8 {
        u8::from(self.0)
    }

    /// Flip to the next frame's identifier.
    pub fn toggle(&mut self) {
        self.0 = !self.0;
    }

    /// Identifier that the next frame will carry.
    #[must_use]
    pub fn toggled(self) -> Self {
        Self(!self.0)
    }
}

/// Source clock reference: 32-bit STC plus 11-bit SOF counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceClock {
    pub stc: u32,
    pub sof: u16,
}

/// A decoded or to-be-encoded payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadHeader {
    pub frame_id: FrameId,
    pub end_of_frame: bool,
    pub error: bool,
    pub pts: Option<u32>,
    pub scr: Option<SourceClock>,
}

impl PayloadHeader {
    /// Header for a transfer of `frame_id`, marking end of frame when `eof`.
    pub fn new(frame_id: FrameId, eof: bool) -> Self {
        Self {
            frame_id,
            end_of_frame: eof,
            ..Self::default()
        }
    }

    /// Bitfield byte for this header.
    pub fn bitfield(&self) -> u8 {
        let mut bits = flags::EOH | self.frame_id.bit();
        if self.end_of_frame {
            bits |= flags::EOF;
        }
        if self.error {
            bits |= flags::ERR;
        }
        if self.pts.is_some() {
            bits |= flags::PTS;
        }
        if self.scr.is_some() {
            bits |= flags::SCR;
        }
        bits
    }

    /// Encode into `out` using `format`, returning the header length.
    ///
    /// The compact layout has no room for timestamps, so PTS/SCR are only
    /// emitted (and only flagged) in the legacy layout. Absent timestamps are
    /// written as zero.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferTooSmall`] if `out` is shorter than the
    /// header.
    pub fn write_to(&self, format: HeaderFormat, out: &mut [u8]) -> ProtocolResult<usize> {
        let len = format.len();
        let available = out.len();
        let Some(out) = out.get_mut(..len) else {
            return Err(ProtocolError::buffer_too_small(
                "payload header",
                len,
                available,
            ));
        };

        match format {
            HeaderFormat::Compact => {
                let bits = self.bitfield() & !(flags::PTS | flags::SCR);
                out[0] = COMPACT_HEADER_LEN as u8;
                out[1] = bits;
            }
            HeaderFormat::Legacy => {
                out[0] = LEGACY_HEADER_LEN as u8;
                out[1] = self.bitfield();
                out[2..6].copy_from_slice(&self.pts.unwrap_or(0).to_le_bytes());
                let scr = self.scr.unwrap_or_default();
                out[6..10].copy_from_slice(&scr.stc.to_le_bytes());
                out[10..12].copy_from_slice(&(scr.sof & 0x07FF).to_le_bytes());
            }
        }

        Ok(len)
    }

    /// Decode a header from the start of a payload transfer.
    ///
    /// Returns the header and its length so callers can slice the data.
    ///
    /// # Errors
    ///
    /// Fails when the input is empty, the length byte is shorter than two or
    /// longer than the input, or the EOH bit is clear.
    pub fn parse(bytes: &[u8]) -> ProtocolResult<(Self, usize)> {
        let [length, bits, ..] = *bytes else {
            return Err(ProtocolError::truncated(
                "payload header",
                COMPACT_HEADER_LEN,
                bytes.len(),
            ));
        };

        let header_len = usize::from(length);
        if header_len < COMPACT_HEADER_LEN || header_len > bytes.len() {
            return Err(ProtocolError::InvalidHeaderLength {
                length,
                available: bytes.len(),
            });
        }
        if bits & flags::EOH == 0 {
            return Err(ProtocolError::MissingEndOfHeader(bits));
        }

        let fields = &bytes[COMPACT_HEADER_LEN..header_len];
        let mut offset = 0;
        let pts = if bits & flags::PTS != 0 {
            let f = header_field(fields, &mut offset, 4, length, bytes.len())?;
            Some(u32::from_le_bytes([f[0], f[1], f[2], f[3]]))
        } else {
            None
        };
        let scr = if bits & flags::SCR != 0 {
            let f = header_field(fields, &mut offset, 6, length, bytes.len())?;
            Some(SourceClock {
                stc: u32::from_le_bytes([f[0], f[1], f[2], f[3]]),
                sof: u16::from_le_bytes([f[4], f[5]]) & 0x07FF,
            })
        } else {
            None
        };

        let header = Self {
            frame_id: FrameId(bits & flags::FID != 0),
            end_of_frame: bits & flags::EOF != 0,
            error: bits & flags::ERR != 0,
            pts,
            scr,
        };
        Ok((header, header_len))
    }
}

fn header_field<'a>(
    fields: &'a [u8],
    offset: &mut usize,
    n: usize,
    length: u8,
    available: usize,
) -> ProtocolResult<&'a [u8]> {
    let field = fields
        .get(*offset..*offset + n)
        .ok_or(ProtocolError::InvalidHeaderLength { length, available })?;
    *offset += n;
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_header_bits() -> Result<(), ProtocolError> {
        let mut out = [0u8; 2];
        let header = PayloadHeader::new(FrameId::ZERO.toggled(), true);
        assert_eq!(header.write_to(HeaderFormat::Compact, &mut out)?, 2);
        assert_eq!(out, [0x02, 0x83]);

        let header = PayloadHeader::new(FrameId::ZERO, false);
        header.write_to(HeaderFormat::Compact, &mut out)?;
        assert_eq!(out, [0x02, 0x80]);
        Ok(())
    }

    #[test]
    fn test_compact_drops_timestamps() -> Result<(), ProtocolError> {
        let mut out = [0u8; 2];
        let header = PayloadHeader {
            pts: Some(7),
            ..PayloadHeader::new(FrameId::ZERO, false)
        };
        header.write_to(HeaderFormat::Compact, &mut out)?;
        assert_eq!(out[1], flags::EOH);
        Ok(())
    }

    #[test]
    fn test_legacy_header_zero_timestamps() -> Result<(), ProtocolError> {
        let mut out = [0xAAu8; 12];
        PayloadHeader::new(FrameId::ZERO, true).write_to(HeaderFormat::Legacy, &mut out)?;
        assert_eq!(out, [12, 0x82, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_legacy_header_parse_with_timestamps() -> Result<(), ProtocolError> {
        let header = PayloadHeader {
            pts: Some(0x0102_0304),
            scr: Some(SourceClock {
                stc: 0x0A0B_0C0D,
                sof: 0x07FF,
            }),
            ..PayloadHeader::new(FrameId::ZERO.toggled(), false)
        };
        let mut out = [0u8; 12];
        header.write_to(HeaderFormat::Legacy, &mut out)?;
        assert_eq!(out[1], 0x80 | 0x08 | 0x04 | 0x01);

        let (parsed, len) = PayloadHeader::parse(&out)?;
        assert_eq!(len, 12);
        assert_eq!(parsed, header);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        assert!(matches!(
            PayloadHeader::parse(&[0x02]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert_eq!(
            PayloadHeader::parse(&[0x05, 0x80, 0x00]),
            Err(ProtocolError::InvalidHeaderLength {
                length: 5,
                available: 3
            })
        );
        assert_eq!(
            PayloadHeader::parse(&[0x02, 0x03]),
            Err(ProtocolError::MissingEndOfHeader(0x03))
        );
        // PTS flagged but the declared length leaves no room for it.
        assert!(matches!(
            PayloadHeader::parse(&[0x02, 0x84, 0, 0, 0, 0]),
            Err(ProtocolError::InvalidHeaderLength { length: 2, .. })
        ));
    }

    #[test]
    fn test_frame_id_toggle() {
        let mut fid = FrameId::default();
        assert_eq!(fid.bit(), 0);
        fid.toggle();
        assert_eq!(fid.bit(), 1);
        fid.toggle();
        assert_eq!(fid, FrameId::ZERO);
    }
}
