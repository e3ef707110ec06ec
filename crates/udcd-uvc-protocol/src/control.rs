//! Video streaming probe/commit control block (`VS_PROBE_CONTROL` / `VS_COMMIT_CONTROL`).
//!
//! Wire layout is little-endian and packed. UVC 1.0 hosts exchange the first
//! 26 bytes; UVC 1.1 adds the clock frequency and framing/version fields for a
//! total of 34 bytes.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Length of the UVC 1.0 streaming control block.
pub const STREAMING_CONTROL_LEN_V1_0: usize = 26;
/// Length of the UVC 1.1 streaming control block.
pub const STREAMING_CONTROL_LEN_V1_1: usize = 34;

/// UVC revision governing the control block length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControlVersion {
    /// 26-byte control block.
    V1_0,
    /// 34-byte control block.
    #[default]
    V1_1,
}

impl ControlVersion {
    /// Encoded length of the control block for this revision.
    pub const fn len(self) -> usize {
        match self {
            Self::V1_0 => STREAMING_CONTROL_LEN_V1_0,
            Self::V1_1 => STREAMING_CONTROL_LEN_V1_1,
        }
    }
}

/// Negotiated streaming parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamingControl {
    pub bm_hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// Frame interval in 100 ns units.
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
}

impl StreamingControl {
    /// Encode into `out`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferTooSmall`] if `out` cannot hold the
    /// control block for `version`.
    pub fn write_to(&self, version: ControlVersion, out: &mut [u8]) -> ProtocolResult<usize> {
        let len = version.len();
        let available = out.len();
        let Some(out) = out.get_mut(..len) else {
            return Err(ProtocolError::buffer_too_small(
                "streaming control",
                len,
                available,
            ));
        };

        out[0..2].copy_from_slice(&self.bm_hint.to_le_bytes());
        out[2] = self.format_index;
        out[3] = self.frame_index;
        out[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        out[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        out[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        out[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        out[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        out[16..18].copy_from_slice(&self.delay.to_le_bytes());
        out[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());

        if version == ControlVersion::V1_1 {
            out[26..30].copy_from_slice(&self.clock_frequency.to_le_bytes());
            out[30] = self.framing_info;
            out[31] = self.preferred_version;
            out[32] = self.min_version;
            out[33] = self.max_version;
        }

        Ok(len)
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_bytes(&self, version: ControlVersion) -> Vec<u8> {
        let mut out = vec![0u8; version.len()];
        // The buffer is sized from `version`, so encoding cannot fail.
        let _ = self.write_to(version, &mut out);
        out
    }

    /// Decode a control block.
    ///
    /// The 1.1 trailer is decoded when at least 34 bytes are present; shorter
    /// input (down to 26 bytes) leaves the trailer fields zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] for fewer than 26 bytes.
    pub fn parse(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < STREAMING_CONTROL_LEN_V1_0 {
            return Err(ProtocolError::truncated(
                "streaming control",
                STREAMING_CONTROL_LEN_V1_0,
                bytes.len(),
            ));
        }

        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        let mut control = Self {
            bm_hint: u16_at(0),
            format_index: bytes[2],
            frame_index: bytes[3],
            frame_interval: u32_at(4),
            key_frame_rate: u16_at(8),
            p_frame_rate: u16_at(10),
            comp_quality: u16_at(12),
            comp_window_size: u16_at(14),
            delay: u16_at(16),
            max_video_frame_size: u32_at(18),
            max_payload_transfer_size: u32_at(22),
            ..Self::default()
        };

        if bytes.len() >= STREAMING_CONTROL_LEN_V1_1 {
            control.clock_frequency = u32_at(26);
            control.framing_info = bytes[30];
            control.preferred_version = bytes[31];
            control.min_version = bytes[32];
            control.max_version = bytes[33];
        }

        Ok(control)
    }

    /// Copy the host-selectable fields from a SET_CUR payload.
    ///
    /// Only the format index, frame index and frame interval are taken; every
    /// other field keeps the device's value.
    pub fn apply_selection(&mut self, requested: &StreamingControl) {
        self.format_index = requested.format_index;
        self.frame_index = requested.frame_index;
        self.frame_interval = requested.frame_interval;
    }

    /// Frame rate implied by the frame interval, rounded down.
    pub fn frames_per_second(&self) -> u32 {
        if self.frame_interval == 0 {
            0
        } else {
            crate::format::INTERVAL_UNITS_PER_SECOND / self.frame_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StreamingControl {
        StreamingControl {
            bm_hint: 0x0001,
            format_index: 1,
            frame_index: 2,
            frame_interval: 333_333,
            max_video_frame_size: 783_360,
            max_payload_transfer_size: 16_384,
            clock_frequency: 48_000_000,
            preferred_version: 1,
            ..StreamingControl::default()
        }
    }

    #[test]
    fn test_v1_1_layout() -> Result<(), ProtocolError> {
        let bytes = sample().to_bytes(ControlVersion::V1_1);
        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[0..4], &[0x01, 0x00, 0x01, 0x02]);
        assert_eq!(&bytes[4..8], &333_333u32.to_le_bytes());
        assert_eq!(&bytes[22..26], &16_384u32.to_le_bytes());
        assert_eq!(&bytes[26..30], &48_000_000u32.to_le_bytes());
        assert_eq!(bytes[31], 1);
        assert_eq!(StreamingControl::parse(&bytes)?, sample());
        Ok(())
    }

    #[test]
    fn test_v1_0_drops_trailer() -> Result<(), ProtocolError> {
        let bytes = sample().to_bytes(ControlVersion::V1_0);
        assert_eq!(bytes.len(), 26);

        let parsed = StreamingControl::parse(&bytes)?;
        assert_eq!(parsed.frame_interval, 333_333);
        assert_eq!(parsed.clock_frequency, 0);
        assert_eq!(parsed.preferred_version, 0);
        Ok(())
    }

    #[test]
    fn test_parse_truncated() {
        assert_eq!(
            StreamingControl::parse(&[0u8; 25]),
            Err(ProtocolError::truncated("streaming control", 26, 25))
        );
    }

    #[test]
    fn test_write_to_small_buffer() {
        let mut out = [0u8; 30];
        assert_eq!(
            sample().write_to(ControlVersion::V1_1, &mut out),
            Err(ProtocolError::buffer_too_small("streaming control", 34, 30))
        );
    }

    #[test]
    fn test_apply_selection_copies_three_fields() {
        let mut current = sample();
        let requested = StreamingControl {
            bm_hint: 0xFFFF,
            format_index: 1,
            frame_index: 4,
            frame_interval: 166_666,
            max_video_frame_size: 1,
            max_payload_transfer_size: 2,
            ..StreamingControl::default()
        };

        current.apply_selection(&requested);

        assert_eq!(current.frame_index, 4);
        assert_eq!(current.frame_interval, 166_666);
        assert_eq!(current.bm_hint, 0x0001);
        assert_eq!(current.max_video_frame_size, 783_360);
        assert_eq!(current.max_payload_transfer_size, 16_384);
        assert_eq!(current.frames_per_second(), 60);
    }
}
