//! USB Video Class wire formats for a bulk-streaming UVC gadget.
//!
//! This crate is intentionally I/O-free. It covers EP0 setup packets and UVC
//! request codes, the probe/commit streaming control block, the bulk payload
//! header, the advertised format/frame table and the descriptor bytes the
//! gadget registers, so every layout can be tested without a device
//! controller.

#![deny(static_mut_refs)]

pub mod control;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod payload;
pub mod request;

// Flat re-exports so callers can use `udcd_uvc_protocol::Foo`.
pub use control::{
    ControlVersion, STREAMING_CONTROL_LEN_V1_0, STREAMING_CONTROL_LEN_V1_1, StreamingControl,
};
pub use descriptor::{
    CONTROL_INTERFACE, INPUT_TERMINAL_ID, INTERFACE_ASSOCIATION_DESCRIPTOR, INTERFACE_CONTROL_ID,
    OUTPUT_TERMINAL_ID, STREAM_INTERFACE, UsbSpeed, VIDEO_ENDPOINT_ADDRESS,
    configuration_descriptor, configuration_with_iad, device_descriptor,
    splice_interface_association, string_descriptor,
};
pub use error::{ProtocolError, ProtocolResult};
pub use format::{
    FORMAT_INDEX_NV12, FORMATS, FormatDescriptor, FrameDescriptor, FrameSelection,
    INTERVAL_UNITS_PER_SECOND, PixelFormat, fps_to_interval, lookup, max_video_frame_size,
};
pub use payload::{
    COMPACT_HEADER_LEN, FrameId, HeaderFormat, LEGACY_HEADER_LEN, PayloadHeader, SourceClock,
    flags,
};
pub use request::{
    DESCRIPTOR_TYPE_DEBUG, FEATURE_ENDPOINT_HALT, SETUP_PACKET_LEN, SetupPacket, UvcRequest,
    VsControl, info_caps, request_type, standard_request,
};
