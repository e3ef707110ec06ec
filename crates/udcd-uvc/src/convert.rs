//! RGB to YUV conversion of display framebuffers.
//!
//! [`SoftwareConverter`] uses BT.601 studio-swing coefficients with
//! nearest-neighbour scaling. Chroma is taken from the average of each
//! horizontal pixel pair; NV12 takes it from the even rows.

use udcd_uvc_protocol::PixelFormat;

use crate::display::{FramebufferInfo, SourcePixelFormat};
use crate::error::{GadgetError, GadgetResult};

/// Converts a framebuffer into a video frame.
pub trait PixelConverter: Send + Sync {
    /// Scale and convert `src` into `dst` as a `dst_width` x `dst_height`
    /// frame in `dst_format`.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Convert`] when the source or destination cannot
    /// hold the requested frame.
    fn convert(
        &self,
        dst: &mut [u8],
        dst_format: PixelFormat,
        dst_width: u16,
        dst_height: u16,
        src: &FramebufferInfo,
    ) -> GadgetResult<()>;
}

#[inline]
fn clip(x: i32) -> u8 {
    u8::try_from(x.clamp(0, 255)).unwrap_or(u8::MAX)
}

#[inline]
fn average(a: u8, b: u8) -> u8 {
    a / 2 + b / 2 + (a & b & 1)
}

#[inline]
pub fn rgb_to_y(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    clip(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16)
}

#[inline]
pub fn rgb_to_u(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    clip(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128)
}

#[inline]
pub fn rgb_to_v(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    clip(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128)
}

/// Nearest-neighbour sampler over a validated source framebuffer.
struct Sampler<'a> {
    pixels: &'a [u8],
    format: SourcePixelFormat,
    pitch: usize,
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
}

impl Sampler<'_> {
    fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let sx = x * self.src_w / self.dst_w;
        let sy = y * self.src_h / self.dst_h;
        let bpp = self.format.bytes_per_pixel();
        let off = (sy * self.pitch + sx) * bpp;
        match self.format {
            SourcePixelFormat::A8B8G8R8 => {
                [self.pixels[off], self.pixels[off + 1], self.pixels[off + 2]]
            }
            SourcePixelFormat::A1B5G5R5 => {
                let v = u16::from_le_bytes([self.pixels[off], self.pixels[off + 1]]);
                let expand = |c: u16| {
                    let c = (c & 0x1F) as u8;
                    (c << 3) | (c >> 2)
                };
                [expand(v), expand(v >> 5), expand(v >> 10)]
            }
        }
    }

    fn pair_chroma(&self, x: usize, y: usize) -> (u8, u8) {
        let [r0, g0, b0] = self.rgb(x, y);
        let [r1, g1, b1] = self.rgb(x + 1, y);
        let (r, g, b) = (average(r0, r1), average(g0, g1), average(b0, b1));
        (rgb_to_u(r, g, b), rgb_to_v(r, g, b))
    }
}

/// Pure-software BT.601 converter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareConverter;

impl SoftwareConverter {
    pub fn new() -> Self {
        Self
    }

    fn sampler<'a>(
        src: &'a FramebufferInfo,
        dst_width: u16,
        dst_height: u16,
    ) -> GadgetResult<Sampler<'a>> {
        let pixels = src
            .pixels
            .as_deref()
            .ok_or_else(|| GadgetError::convert("source framebuffer has no pixels"))?;
        if src.width == 0 || src.height == 0 || dst_width == 0 || dst_height == 0 {
            return Err(GadgetError::convert("zero-sized frame"));
        }
        if src.pitch < src.width {
            return Err(GadgetError::convert(format!(
                "pitch {} is narrower than width {}",
                src.pitch, src.width
            )));
        }
        if dst_width % 2 != 0 || dst_height % 2 != 0 {
            return Err(GadgetError::convert(format!(
                "destination {dst_width}x{dst_height} must have even dimensions"
            )));
        }

        let (pitch, src_w, src_h) = (src.pitch as usize, src.width as usize, src.height as usize);
        let needed = ((src_h - 1) * pitch + src_w) * src.pixel_format.bytes_per_pixel();
        if pixels.len() < needed {
            return Err(GadgetError::convert(format!(
                "source holds {} bytes, {needed} needed",
                pixels.len()
            )));
        }

        Ok(Sampler {
            pixels,
            format: src.pixel_format,
            pitch,
            src_w,
            src_h,
            dst_w: usize::from(dst_width),
            dst_h: usize::from(dst_height),
        })
    }

    fn to_nv12(s: &Sampler<'_>, dst: &mut [u8]) {
        let (w, h) = (s.dst_w, s.dst_h);
        let (luma, chroma) = dst.split_at_mut(w * h);

        for (y, row) in luma.chunks_exact_mut(w).enumerate() {
            for (x, out) in row.iter_mut().enumerate() {
                let [r, g, b] = s.rgb(x, y);
                *out = rgb_to_y(r, g, b);
            }
        }

        for (cy, row) in chroma.chunks_exact_mut(w).take(h / 2).enumerate() {
            for (cx, uv) in row.chunks_exact_mut(2).enumerate() {
                let (u, v) = s.pair_chroma(cx * 2, cy * 2);
                uv[0] = u;
                uv[1] = v;
            }
        }
    }

    fn to_yuy2(s: &Sampler<'_>, dst: &mut [u8]) {
        let w = s.dst_w;
        for (y, row) in dst.chunks_exact_mut(w * 2).take(s.dst_h).enumerate() {
            for (px, out) in row.chunks_exact_mut(4).enumerate() {
                let x = px * 2;
                let [r0, g0, b0] = s.rgb(x, y);
                let [r1, g1, b1] = s.rgb(x + 1, y);
                let (u, v) = s.pair_chroma(x, y);
                out[0] = rgb_to_y(r0, g0, b0);
                out[1] = u;
                out[2] = rgb_to_y(r1, g1, b1);
                out[3] = v;
            }
        }
    }
}

impl PixelConverter for SoftwareConverter {
    fn convert(
        &self,
        dst: &mut [u8],
        dst_format: PixelFormat,
        dst_width: u16,
        dst_height: u16,
        src: &FramebufferInfo,
    ) -> GadgetResult<()> {
        let sampler = Self::sampler(src, dst_width, dst_height)?;
        let needed = dst_format.frame_size(dst_width, dst_height) as usize;
        if dst.len() < needed {
            return Err(GadgetError::convert(format!(
                "destination holds {} bytes, {needed} needed",
                dst.len()
            )));
        }

        match dst_format {
            PixelFormat::Nv12 => Self::to_nv12(&sampler, &mut dst[..needed]),
            PixelFormat::Yuy2 => Self::to_yuy2(&sampler, &mut dst[..needed]),
        }
        Ok(())
    }
}
