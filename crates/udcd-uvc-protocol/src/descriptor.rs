//! USB and UVC descriptor byte builders.
//!
//! Builds the device, configuration, interface, endpoint and class-specific
//! video descriptors the gadget registers with the device controller. The
//! configuration produced by [`configuration_descriptor`] does not include
//! the interface association descriptor; [`splice_interface_association`]
//! grafts it in after the fact, the same way the controller's serializer is
//! patched at registration.

use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::format::{FORMATS, FormatDescriptor};

/// Descriptor type codes.
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const DEBUG: u8 = 0x0A;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const CS_INTERFACE: u8 = 0x24;
}

/// Video class codes.
pub mod video_class {
    /// CC_VIDEO
    pub const CC_VIDEO: u8 = 0x0E;
    /// SC_VIDEOCONTROL
    pub const SC_VIDEOCONTROL: u8 = 0x01;
    /// SC_VIDEOSTREAMING
    pub const SC_VIDEOSTREAMING: u8 = 0x02;
    /// SC_VIDEO_INTERFACE_COLLECTION
    pub const SC_VIDEO_INTERFACE_COLLECTION: u8 = 0x03;
    /// PC_PROTOCOL_UNDEFINED
    pub const PC_PROTOCOL_UNDEFINED: u8 = 0x00;
}

/// Class-specific descriptor subtypes.
pub mod subtype {
    pub const VC_HEADER: u8 = 0x01;
    pub const VC_INPUT_TERMINAL: u8 = 0x02;
    pub const VC_OUTPUT_TERMINAL: u8 = 0x03;
    pub const VS_INPUT_HEADER: u8 = 0x01;
    pub const VS_FORMAT_UNCOMPRESSED: u8 = 0x04;
    pub const VS_FRAME_UNCOMPRESSED: u8 = 0x05;
    pub const VS_COLORFORMAT: u8 = 0x0D;
}

/// Video control interface number.
pub const CONTROL_INTERFACE: u8 = 0;
/// Video streaming interface number.
pub const STREAM_INTERFACE: u8 = 1;

/// Entity ID of the video control interface itself.
pub const INTERFACE_CONTROL_ID: u8 = 0;
/// Entity ID of the input terminal.
pub const INPUT_TERMINAL_ID: u8 = 1;
/// Entity ID of the streaming output terminal.
pub const OUTPUT_TERMINAL_ID: u8 = 2;

/// Bulk IN endpoint carrying video payloads.
pub const VIDEO_ENDPOINT_ADDRESS: u8 = 0x81;

/// bcdUVC advertised in the VC header.
pub const UVC_VERSION_BCD: u16 = 0x0110;
/// dwClockFrequency advertised in the VC header.
pub const DEVICE_CLOCK_FREQUENCY: u32 = 48_000_000;

const ITT_VENDOR_SPECIFIC: u16 = 0x0200;
const TT_STREAMING: u16 = 0x0101;

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIG_DESCRIPTOR_LEN: usize = 9;
pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

/// Interface association descriptor grouping the two video interfaces.
pub const INTERFACE_ASSOCIATION_DESCRIPTOR: [u8; 8] = [
    0x08,
    descriptor_type::INTERFACE_ASSOCIATION,
    CONTROL_INTERFACE,
    0x02,
    video_class::CC_VIDEO,
    video_class::SC_VIDEO_INTERFACE_COLLECTION,
    video_class::PC_PROTOCOL_UNDEFINED,
    0x00,
];

/// Bus speed a descriptor set is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsbSpeed {
    Full,
    High,
}

impl UsbSpeed {
    /// Bulk endpoint max packet size at this speed.
    pub const fn bulk_max_packet_size(self) -> u16 {
        match self {
            Self::Full => 64,
            Self::High => 512,
        }
    }
}

#[derive(Default)]
struct DescriptorWriter {
    buf: Vec<u8>,
}

impl DescriptorWriter {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn len_u8(len: usize) -> u8 {
    u8::try_from(len).unwrap_or(u8::MAX)
}

fn len_u16(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

/// Standard device descriptor (miscellaneous class with IAD).
pub fn device_descriptor(vendor_id: u16, product_id: u16) -> Vec<u8> {
    let mut w = DescriptorWriter::default();
    w.u8(DEVICE_DESCRIPTOR_LEN as u8)
        .u8(descriptor_type::DEVICE)
        .u16(0x0200)
        .u8(0xEF)
        .u8(0x02)
        .u8(0x01)
        .u8(64)
        .u16(vendor_id)
        .u16(product_id)
        .u16(0x0100)
        .u8(0)
        .u8(2)
        .u8(3)
        .u8(1);
    w.finish()
}

/// String descriptor with UTF-16LE contents.
pub fn string_descriptor(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut w = DescriptorWriter::default();
    w.u8(len_u8(2 + units.len() * 2)).u8(descriptor_type::STRING);
    for unit in units {
        w.u16(unit);
    }
    w.finish()
}

/// Standard interface descriptor for a video interface.
pub fn interface_descriptor(number: u8, subclass: u8, num_endpoints: u8) -> Vec<u8> {
    let mut w = DescriptorWriter::default();
    w.u8(INTERFACE_DESCRIPTOR_LEN as u8)
        .u8(descriptor_type::INTERFACE)
        .u8(number)
        .u8(0)
        .u8(num_endpoints)
        .u8(video_class::CC_VIDEO)
        .u8(subclass)
        .u8(video_class::PC_PROTOCOL_UNDEFINED)
        .u8(0);
    w.finish()
}

/// Bulk endpoint descriptor.
pub fn bulk_endpoint_descriptor(address: u8, speed: UsbSpeed) -> Vec<u8> {
    let mut w = DescriptorWriter::default();
    w.u8(ENDPOINT_DESCRIPTOR_LEN as u8)
        .u8(descriptor_type::ENDPOINT)
        .u8(address)
        .u8(0x02)
        .u16(speed.bulk_max_packet_size())
        .u8(0);
    w.finish()
}

/// Class-specific video control descriptors: header, input and output terminals.
pub fn video_control_descriptors() -> Vec<u8> {
    const HEADER_LEN: usize = 12 + 1;
    const INPUT_TERMINAL_LEN: usize = 8;
    const OUTPUT_TERMINAL_LEN: usize = 9;
    let total = HEADER_LEN + INPUT_TERMINAL_LEN + OUTPUT_TERMINAL_LEN;

    let mut w = DescriptorWriter::default();
    w.u8(HEADER_LEN as u8)
        .u8(descriptor_type::CS_INTERFACE)
        .u8(subtype::VC_HEADER)
        .u16(UVC_VERSION_BCD)
        .u16(len_u16(total))
        .u32(DEVICE_CLOCK_FREQUENCY)
        .u8(1)
        .u8(STREAM_INTERFACE);

    w.u8(INPUT_TERMINAL_LEN as u8)
        .u8(descriptor_type::CS_INTERFACE)
        .u8(subtype::VC_INPUT_TERMINAL)
        .u8(INPUT_TERMINAL_ID)
        .u16(ITT_VENDOR_SPECIFIC)
        .u8(0)
        .u8(0);

    w.u8(OUTPUT_TERMINAL_LEN as u8)
        .u8(descriptor_type::CS_INTERFACE)
        .u8(subtype::VC_OUTPUT_TERMINAL)
        .u8(OUTPUT_TERMINAL_ID)
        .u16(TT_STREAMING)
        .u8(0)
        .u8(INPUT_TERMINAL_ID)
        .u8(0);

    w.finish()
}

fn write_format(w: &mut DescriptorWriter, format: &FormatDescriptor) {
    let pixel_format = format.pixel_format;
    w.u8(27)
        .u8(descriptor_type::CS_INTERFACE)
        .u8(subtype::VS_FORMAT_UNCOMPRESSED)
        .u8(format.format_index)
        .u8(len_u8(format.frames.len()))
        .bytes(&pixel_format.guid())
        .u8(pixel_format.bits_per_pixel())
        .u8(format.default_frame_index)
        .u8(0)
        .u8(0)
        .u8(0)
        .u8(0);

    for frame in format.frames {
        let min_fps = crate::format::INTERVAL_UNITS_PER_SECOND / frame.max_interval().max(1);
        let max_fps = crate::format::INTERVAL_UNITS_PER_SECOND / frame.min_interval().max(1);
        w.u8(len_u8(26 + 4 * frame.intervals.len()))
            .u8(descriptor_type::CS_INTERFACE)
            .u8(subtype::VS_FRAME_UNCOMPRESSED)
            .u8(frame.frame_index)
            .u8(0)
            .u16(frame.width)
            .u16(frame.height)
            .u32(frame.bitrate(pixel_format, min_fps))
            .u32(frame.bitrate(pixel_format, max_fps))
            .u32(frame.frame_size(pixel_format))
            .u32(frame.default_interval)
            .u8(len_u8(frame.intervals.len()));
        for &interval in frame.intervals {
            w.u32(interval);
        }
    }

    w.u8(6)
        .u8(descriptor_type::CS_INTERFACE)
        .u8(subtype::VS_COLORFORMAT)
        .u8(0)
        .u8(0)
        .u8(0);
}

/// Class-specific video streaming descriptors: input header, formats, frames
/// and colour matching.
pub fn video_streaming_descriptors() -> Vec<u8> {
    const CONTROL_SIZE: usize = 1;
    let header_len = 13 + FORMATS.len() * CONTROL_SIZE;

    let mut body = DescriptorWriter::default();
    for format in FORMATS {
        write_format(&mut body, format);
    }
    let body = body.finish();

    let mut w = DescriptorWriter::default();
    w.u8(len_u8(header_len))
        .u8(descriptor_type::CS_INTERFACE)
        .u8(subtype::VS_INPUT_HEADER)
        .u8(len_u8(FORMATS.len()))
        .u16(len_u16(header_len + body.len()))
        .u8(VIDEO_ENDPOINT_ADDRESS)
        .u8(0)
        .u8(OUTPUT_TERMINAL_ID)
        .u8(0)
        .u8(0)
        .u8(0)
        .u8(CONTROL_SIZE as u8);
    for _ in FORMATS {
        w.u8(0);
    }
    w.bytes(&body);
    w.finish()
}

/// Full configuration descriptor set (without the IAD) for `speed`.
pub fn configuration_descriptor(speed: UsbSpeed) -> Vec<u8> {
    let vc = video_control_descriptors();
    let vs = video_streaming_descriptors();
    let total = CONFIG_DESCRIPTOR_LEN
        + 2 * INTERFACE_DESCRIPTOR_LEN
        + ENDPOINT_DESCRIPTOR_LEN
        + vc.len()
        + vs.len();

    let mut w = DescriptorWriter::default();
    w.u8(CONFIG_DESCRIPTOR_LEN as u8)
        .u8(descriptor_type::CONFIGURATION)
        .u16(len_u16(total))
        .u8(2)
        .u8(1)
        .u8(0)
        .u8(0x80)
        .u8(250);
    w.bytes(&interface_descriptor(
        CONTROL_INTERFACE,
        video_class::SC_VIDEOCONTROL,
        0,
    ))
    .bytes(&vc)
    .bytes(&interface_descriptor(
        STREAM_INTERFACE,
        video_class::SC_VIDEOSTREAMING,
        1,
    ))
    .bytes(&vs)
    .bytes(&bulk_endpoint_descriptor(VIDEO_ENDPOINT_ADDRESS, speed));
    w.finish()
}

/// Insert `iad` immediately after the 9-byte configuration descriptor at the
/// head of `config` and grow `wTotalLength` by its length.
///
/// # Errors
///
/// Fails if `config` does not start with a configuration descriptor, if
/// `iad` is not a well-formed interface association descriptor, or if the
/// grown total length would not fit in 16 bits.
pub fn splice_interface_association(config: &[u8], iad: &[u8]) -> ProtocolResult<Vec<u8>> {
    if config.len() < CONFIG_DESCRIPTOR_LEN {
        return Err(ProtocolError::truncated(
            "configuration descriptor",
            CONFIG_DESCRIPTOR_LEN,
            config.len(),
        ));
    }
    if usize::from(config[0]) != CONFIG_DESCRIPTOR_LEN
        || config[1] != descriptor_type::CONFIGURATION
    {
        return Err(ProtocolError::MalformedDescriptor(
            "expected a configuration descriptor",
        ));
    }
    if iad.len() != INTERFACE_ASSOCIATION_DESCRIPTOR.len()
        || usize::from(iad[0]) != iad.len()
        || iad[1] != descriptor_type::INTERFACE_ASSOCIATION
    {
        return Err(ProtocolError::MalformedDescriptor(
            "expected an interface association descriptor",
        ));
    }

    let total = u16::from_le_bytes([config[2], config[3]]);
    let grown = u16::try_from(iad.len())
        .ok()
        .and_then(|n| total.checked_add(n))
        .ok_or(ProtocolError::MalformedDescriptor(
            "configuration total length overflow",
        ))?;

    let mut out = Vec::with_capacity(config.len() + iad.len());
    out.extend_from_slice(&config[..CONFIG_DESCRIPTOR_LEN]);
    out[2..4].copy_from_slice(&grown.to_le_bytes());
    out.extend_from_slice(iad);
    out.extend_from_slice(&config[CONFIG_DESCRIPTOR_LEN..]);

    trace!(from = total, to = grown, "spliced interface association descriptor");
    Ok(out)
}

/// Configuration descriptor set for `speed` with the IAD grafted in.
///
/// # Errors
///
/// Propagates [`splice_interface_association`] failures.
pub fn configuration_with_iad(speed: UsbSpeed) -> ProtocolResult<Vec<u8>> {
    splice_interface_association(
        &configuration_descriptor(speed),
        &INTERFACE_ASSOCIATION_DESCRIPTOR,
    )
}
