//! Display collaborator: framebuffer access and vblank notification.

use std::sync::Arc;

use tracing::debug;

use crate::error::{GadgetError, GadgetResult};

/// Pixel layout of the display's framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourcePixelFormat {
    /// 32-bit, bytes in R, G, B, A order.
    A8B8G8R8,
    /// 16-bit little-endian, R in bits 0-4, G in 5-9, B in 10-14.
    A1B5G5R5,
}

impl SourcePixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::A8B8G8R8 => 4,
            Self::A1B5G5R5 => 2,
        }
    }
}

/// A snapshot of one framebuffer level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub width: u32,
    pub height: u32,
    /// Row stride in pixels.
    pub pitch: u32,
    pub pixel_format: SourcePixelFormat,
    /// `None` when the level has no framebuffer bound.
    pub pixels: Option<Arc<[u8]>>,
}

/// Called with the number of vblanks since the previous call.
pub type VblankCallback = Box<dyn Fn(u32) + Send + Sync + 'static>;

/// Handle returned by [`Display::register_vblank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VblankId(pub u64);

/// The platform display.
pub trait Display: Send + Sync {
    /// Block until the system has set a framebuffer.
    fn wait_for_framebuffer_set(&self) -> GadgetResult<()>;

    /// Head whose output is streamed.
    fn primary_head(&self) -> u32;

    /// Framebuffer of `head` at `level`.
    fn framebuffer(&self, head: u32, level: u32) -> GadgetResult<FramebufferInfo>;

    fn register_vblank(&self, callback: VblankCallback) -> GadgetResult<VblankId>;

    fn unregister_vblank(&self, id: VblankId) -> GadgetResult<()>;
}

/// Framebuffer currently shown on the primary head.
///
/// Level 0 is tried first; level 1 is used when level 0 fails or has no
/// pixels bound.
///
/// # Errors
///
/// Returns [`GadgetError::Display`] when neither level yields pixels.
pub fn current_framebuffer(display: &dyn Display) -> GadgetResult<FramebufferInfo> {
    let head = display.primary_head();
    match display.framebuffer(head, 0) {
        Ok(info) if info.pixels.is_some() => return Ok(info),
        Ok(_) => debug!(head, "level 0 framebuffer unbound, trying level 1"),
        Err(e) => debug!(head, error = %e, "level 0 framebuffer query failed, trying level 1"),
    }

    let info = display.framebuffer(head, 1)?;
    if info.pixels.is_none() {
        return Err(GadgetError::display(format!(
            "no framebuffer bound on head {head}"
        )));
    }
    Ok(info)
}
