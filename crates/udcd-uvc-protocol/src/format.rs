//! Advertised video formats and frame sizes.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Frame intervals are expressed in 100 ns units.
pub const INTERVAL_UNITS_PER_SECOND: u32 = 10_000_000;

/// Format index of the uncompressed NV12 format.
pub const FORMAT_INDEX_NV12: u8 = 1;

/// Convert a frame rate into a frame interval in 100 ns units.
///
/// A rate of zero maps to zero.
pub const fn fps_to_interval(fps: u32) -> u32 {
    if fps == 0 {
        0
    } else {
        INTERVAL_UNITS_PER_SECOND / fps
    }
}

/// Pixel layouts the gadget can emit or consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar Y followed by interleaved UV at quarter resolution.
    Nv12,
    /// Packed 4:2:2 Y0 U Y1 V.
    Yuy2,
}

impl PixelFormat {
    /// Average bits per pixel.
    pub const fn bits_per_pixel(self) -> u8 {
        match self {
            Self::Nv12 => 12,
            Self::Yuy2 => 16,
        }
    }

    /// Bytes needed for one `width`×`height` frame.
    pub const fn frame_size(self, width: u16, height: u16) -> u32 {
        let pixels = width as u32 * height as u32;
        match self {
            Self::Nv12 => pixels * 3 / 2,
            Self::Yuy2 => pixels * 2,
        }
    }

    /// The 16-byte format GUID advertised in the format descriptor.
    pub const fn guid(self) -> [u8; 16] {
        match self {
            Self::Nv12 => [
                b'N', b'V', b'1', b'2', 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00,
                0x38, 0x9B, 0x71,
            ],
            Self::Yuy2 => [
                b'Y', b'U', b'Y', b'2', 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00,
                0x38, 0x9B, 0x71,
            ],
        }
    }
}

/// One advertised frame size with its discrete intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub frame_index: u8,
    pub width: u16,
    pub height: u16,
    pub default_interval: u32,
    /// Discrete intervals, fastest first.
    pub intervals: &'static [u32],
}

/// One advertised format and its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub format_index: u8,
    pub pixel_format: PixelFormat,
    pub default_frame_index: u8,
    pub frames: &'static [FrameDescriptor],
}

const NV12_INTERVALS: &[u32] = &[fps_to_interval(60), fps_to_interval(30)];

const NV12_FRAMES: &[FrameDescriptor] = &[
    FrameDescriptor {
        frame_index: 1,
        width: 960,
        height: 544,
        default_interval: fps_to_interval(60),
        intervals: NV12_INTERVALS,
    },
    FrameDescriptor {
        frame_index: 2,
        width: 896,
        height: 504,
        default_interval: fps_to_interval(60),
        intervals: NV12_INTERVALS,
    },
    FrameDescriptor {
        frame_index: 3,
        width: 864,
        height: 488,
        default_interval: fps_to_interval(60),
        intervals: NV12_INTERVALS,
    },
    FrameDescriptor {
        frame_index: 4,
        width: 480,
        height: 272,
        default_interval: fps_to_interval(60),
        intervals: NV12_INTERVALS,
    },
];

/// Every format the gadget advertises, in descriptor order.
pub const FORMATS: &[FormatDescriptor] = &[FormatDescriptor {
    format_index: FORMAT_INDEX_NV12,
    pixel_format: PixelFormat::Nv12,
    default_frame_index: 1,
    frames: NV12_FRAMES,
}];

impl FrameDescriptor {
    /// Frame size in bytes for `format`.
    pub const fn frame_size(&self, format: PixelFormat) -> u32 {
        format.frame_size(self.width, self.height)
    }

    /// Bit rate at `fps` frames per second.
    pub const fn bitrate(&self, format: PixelFormat, fps: u32) -> u32 {
        self.width as u32 * self.height as u32 * format.bits_per_pixel() as u32 * fps
    }

    /// Slowest advertised interval.
    pub fn max_interval(&self) -> u32 {
        self.intervals
            .iter()
            .copied()
            .max()
            .unwrap_or(self.default_interval)
    }

    /// Fastest advertised interval.
    pub fn min_interval(&self) -> u32 {
        self.intervals
            .iter()
            .copied()
            .min()
            .unwrap_or(self.default_interval)
    }
}

impl FormatDescriptor {
    /// Frame with the given 1-based index.
    pub fn frame(&self, frame_index: u8) -> Option<&'static FrameDescriptor> {
        self.frames.iter().find(|f| f.frame_index == frame_index)
    }

    /// Largest frame size of any frame in this format.
    pub fn max_frame_size(&self) -> u32 {
        self.frames
            .iter()
            .map(|f| f.frame_size(self.pixel_format))
            .max()
            .unwrap_or(0)
    }
}

/// Resolved format/frame pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSelection {
    pub format: &'static FormatDescriptor,
    pub frame: &'static FrameDescriptor,
}

impl FrameSelection {
    /// Bytes per frame for this selection.
    pub fn frame_size(&self) -> u32 {
        self.frame.frame_size(self.format.pixel_format)
    }
}

/// Resolve a format/frame index pair against [`FORMATS`].
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedFormat`] if either index is not
/// advertised.
pub fn lookup(format_index: u8, frame_index: u8) -> ProtocolResult<FrameSelection> {
    FORMATS
        .iter()
        .find(|f| f.format_index == format_index)
        .and_then(|format| format.frame(frame_index).map(|frame| FrameSelection { format, frame }))
        .ok_or_else(|| ProtocolError::unsupported_format(format_index, frame_index))
}

/// Largest frame size across every advertised format.
pub fn max_video_frame_size() -> u32 {
    FORMATS
        .iter()
        .map(FormatDescriptor::max_frame_size)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals() {
        assert_eq!(fps_to_interval(60), 166_666);
        assert_eq!(fps_to_interval(30), 333_333);
        assert_eq!(fps_to_interval(0), 0);
    }

    #[test]
    fn test_nv12_frame_sizes() {
        assert_eq!(PixelFormat::Nv12.frame_size(960, 544), 783_360);
        assert_eq!(PixelFormat::Nv12.frame_size(480, 272), 195_840);
        assert_eq!(PixelFormat::Yuy2.frame_size(480, 272), 261_120);
        assert_eq!(max_video_frame_size(), 783_360);
    }

    #[test]
    fn test_lookup() -> Result<(), ProtocolError> {
        let sel = lookup(1, 3)?;
        assert_eq!((sel.frame.width, sel.frame.height), (864, 488));
        assert_eq!(sel.frame_size(), 864 * 488 * 3 / 2);

        assert_eq!(lookup(2, 1), Err(ProtocolError::unsupported_format(2, 1)));
        assert_eq!(lookup(1, 0), Err(ProtocolError::unsupported_format(1, 0)));
        assert_eq!(lookup(1, 5), Err(ProtocolError::unsupported_format(1, 5)));
        Ok(())
    }

    #[test]
    fn test_bitrate() {
        let frame = &NV12_FRAMES[0];
        assert_eq!(frame.bitrate(PixelFormat::Nv12, 60), 376_012_800);
        assert_eq!(frame.bitrate(PixelFormat::Nv12, 30), 188_006_400);
        assert_eq!(frame.min_interval(), 166_666);
        assert_eq!(frame.max_interval(), 333_333);
    }

    #[test]
    fn test_guid_prefix() {
        assert_eq!(&PixelFormat::Nv12.guid()[..4], b"NV12");
    }
}
