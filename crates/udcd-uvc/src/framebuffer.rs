//! Frame buffer sized to the negotiated frame.

use tracing::{debug, warn};
use udcd_uvc_protocol::{FrameSelection, PixelFormat};

use crate::error::{GadgetError, GadgetResult};

/// Allocation granularity of the frame buffer.
pub const FRAME_BUFFER_ALIGN: usize = 4096;

/// Conversion target for one negotiated format/frame pair.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    frame_len: usize,
    selection: FrameSelection,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer for `selection`, rounded up to
    /// [`FRAME_BUFFER_ALIGN`].
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Allocation`] if the memory cannot be reserved.
    pub fn allocate(selection: FrameSelection) -> GadgetResult<Self> {
        let frame_len = selection.frame_size() as usize;
        let size = frame_len.next_multiple_of(FRAME_BUFFER_ALIGN);

        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| {
            warn!(size, error = %e, "frame buffer allocation failed");
            GadgetError::Allocation { size }
        })?;
        data.resize(size, 0);

        debug!(
            width = selection.frame.width,
            height = selection.frame.height,
            size,
            "frame buffer allocated"
        );
        Ok(Self {
            data,
            frame_len,
            selection,
        })
    }

    /// Whether this buffer was allocated for the given indices.
    pub fn matches(&self, format_index: u8, frame_index: u8) -> bool {
        self.selection.format.format_index == format_index
            && self.selection.frame.frame_index == frame_index
    }

    pub fn selection(&self) -> FrameSelection {
        self.selection
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.selection.format.pixel_format
    }

    pub fn width(&self) -> u16 {
        self.selection.frame.width
    }

    pub fn height(&self) -> u16 {
        self.selection.frame.height
    }

    /// The frame bytes, without the alignment tail.
    pub fn frame(&self) -> &[u8] {
        &self.data[..self.frame_len]
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.frame_len]
    }

    /// Allocated bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use udcd_uvc_protocol::lookup;

    use super::*;

    #[test]
    fn test_rounds_to_page() -> GadgetResult<()> {
        let fb = FrameBuffer::allocate(lookup(1, 1)?)?;
        assert_eq!(fb.frame().len(), 783_360);
        assert_eq!(fb.capacity(), 786_432);
        assert!(fb.matches(1, 1));
        assert!(!fb.matches(1, 2));
        Ok(())
    }

    #[test]
    fn test_small_frame() -> GadgetResult<()> {
        let fb = FrameBuffer::allocate(lookup(1, 4)?)?;
        assert_eq!(fb.frame().len(), 480 * 272 * 3 / 2);
        assert_eq!(fb.capacity() % FRAME_BUFFER_ALIGN, 0);
        assert_eq!((fb.width(), fb.height()), (480, 272));
        Ok(())
    }
}
