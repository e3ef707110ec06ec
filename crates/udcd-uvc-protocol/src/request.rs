//! EP0 setup packets, standard USB requests and UVC class request codes.

use crate::error::{ProtocolError, ProtocolResult};

/// Size of a USB setup packet on the wire.
pub const SETUP_PACKET_LEN: usize = 8;

/// `bmRequestType` bit fields.
pub mod request_type {
    /// Direction bit: device-to-host.
    pub const DIR_DEVICE_TO_HOST: u8 = 0x80;
    /// Type field mask.
    pub const TYPE_MASK: u8 = 0x60;
    /// Standard request.
    pub const TYPE_STANDARD: u8 = 0x00;
    /// Class request.
    pub const TYPE_CLASS: u8 = 0x20;
    /// Vendor request.
    pub const TYPE_VENDOR: u8 = 0x40;
    /// Recipient field mask.
    pub const RECIPIENT_MASK: u8 = 0x1F;
    /// Recipient: device.
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    /// Recipient: interface.
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    /// Recipient: endpoint.
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;

    /// Class request to an interface, device-to-host (`0xA1`).
    pub const CLASS_INTERFACE_IN: u8 = DIR_DEVICE_TO_HOST | TYPE_CLASS | RECIPIENT_INTERFACE;
    /// Class request to an interface, host-to-device (`0x21`).
    pub const CLASS_INTERFACE_OUT: u8 = TYPE_CLASS | RECIPIENT_INTERFACE;
    /// Standard request to an interface, host-to-device (`0x01`).
    pub const STANDARD_INTERFACE_OUT: u8 = TYPE_STANDARD | RECIPIENT_INTERFACE;
    /// Standard request to an endpoint, host-to-device (`0x02`).
    pub const STANDARD_ENDPOINT_OUT: u8 = TYPE_STANDARD | RECIPIENT_ENDPOINT;
    /// Standard request to the device, device-to-host (`0x80`).
    pub const STANDARD_DEVICE_IN: u8 = DIR_DEVICE_TO_HOST | TYPE_STANDARD | RECIPIENT_DEVICE;
}

/// Standard `bRequest` codes used by the gadget.
pub mod standard_request {
    /// GET_STATUS
    pub const GET_STATUS: u8 = 0x00;
    /// CLEAR_FEATURE
    pub const CLEAR_FEATURE: u8 = 0x01;
    /// SET_FEATURE
    pub const SET_FEATURE: u8 = 0x03;
    /// GET_DESCRIPTOR
    pub const GET_DESCRIPTOR: u8 = 0x06;
    /// SET_INTERFACE
    pub const SET_INTERFACE: u8 = 0x0B;
}

/// Feature selector for CLEAR_FEATURE on an endpoint.
pub const FEATURE_ENDPOINT_HALT: u16 = 0x0000;

/// Endpoint number bits of `wIndex` for endpoint-recipient requests.
pub const ENDPOINT_NUMBER_MASK: u16 = 0x000F;

/// Descriptor type of the USB debug descriptor.
pub const DESCRIPTOR_TYPE_DEBUG: u8 = 0x0A;

/// UVC class-specific request codes (`bRequest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UvcRequest {
    /// SET_CUR
    SetCur = 0x01,
    /// GET_CUR
    GetCur = 0x81,
    /// GET_MIN
    GetMin = 0x82,
    /// GET_MAX
    GetMax = 0x83,
    /// GET_RES
    GetRes = 0x84,
    /// GET_LEN
    GetLen = 0x85,
    /// GET_INFO
    GetInfo = 0x86,
    /// GET_DEF
    GetDef = 0x87,
}

impl UvcRequest {
    /// Whether the request carries data from device to host.
    pub fn is_get(self) -> bool {
        (self as u8) & 0x80 != 0
    }
}

impl TryFrom<u8> for UvcRequest {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        match value {
            0x01 => Ok(Self::SetCur),
            0x81 => Ok(Self::GetCur),
            0x82 => Ok(Self::GetMin),
            0x83 => Ok(Self::GetMax),
            0x84 => Ok(Self::GetRes),
            0x85 => Ok(Self::GetLen),
            0x86 => Ok(Self::GetInfo),
            0x87 => Ok(Self::GetDef),
            other => Err(ProtocolError::UnknownRequest(other)),
        }
    }
}

/// Video streaming interface control selectors (high byte of `wValue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VsControl {
    /// VS_PROBE_CONTROL
    Probe = 0x01,
    /// VS_COMMIT_CONTROL
    Commit = 0x02,
    /// VS_STILL_PROBE_CONTROL
    StillProbe = 0x03,
    /// VS_STILL_COMMIT_CONTROL
    StillCommit = 0x04,
    /// VS_STILL_IMAGE_TRIGGER_CONTROL
    StillImageTrigger = 0x05,
    /// VS_STREAM_ERROR_CODE_CONTROL
    StreamErrorCode = 0x06,
    /// VS_GENERATE_KEY_FRAME_CONTROL
    GenerateKeyFrame = 0x07,
    /// VS_UPDATE_FRAME_SEGMENT_CONTROL
    UpdateFrameSegment = 0x08,
    /// VS_SYNCH_DELAY_CONTROL
    SynchDelay = 0x09,
}

impl TryFrom<u8> for VsControl {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        match value {
            0x01 => Ok(Self::Probe),
            0x02 => Ok(Self::Commit),
            0x03 => Ok(Self::StillProbe),
            0x04 => Ok(Self::StillCommit),
            0x05 => Ok(Self::StillImageTrigger),
            0x06 => Ok(Self::StreamErrorCode),
            0x07 => Ok(Self::GenerateKeyFrame),
            0x08 => Ok(Self::UpdateFrameSegment),
            0x09 => Ok(Self::SynchDelay),
            other => Err(ProtocolError::UnknownControlSelector(other)),
        }
    }
}

/// GET_INFO capability bits.
pub mod info_caps {
    /// Supports GET requests.
    pub const SUPPORTS_GET: u8 = 0x01;
    /// Supports SET requests.
    pub const SUPPORTS_SET: u8 = 0x02;
}

/// A decoded EP0 setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    /// Build a setup packet from its fields.
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Build a UVC class request addressed to a video streaming control.
    pub const fn class_streaming(
        request: UvcRequest,
        control: VsControl,
        interface: u8,
        length: u16,
    ) -> Self {
        let request_type = if (request as u8) & 0x80 != 0 {
            request_type::CLASS_INTERFACE_IN
        } else {
            request_type::CLASS_INTERFACE_OUT
        };
        Self::new(
            request_type,
            request as u8,
            (control as u16) << 8,
            interface as u16,
            length,
        )
    }

    /// Decode an 8-byte little-endian setup packet.
    pub fn parse(bytes: &[u8]) -> ProtocolResult<Self> {
        let [request_type, request, v0, v1, i0, i1, l0, l1, ..] = *bytes else {
            return Err(ProtocolError::truncated(
                "setup packet",
                SETUP_PACKET_LEN,
                bytes.len(),
            ));
        };

        Ok(Self {
            request_type,
            request,
            value: u16::from_le_bytes([v0, v1]),
            index: u16::from_le_bytes([i0, i1]),
            length: u16::from_le_bytes([l0, l1]),
        })
    }

    /// Encode into the 8-byte wire form.
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            v[0],
            v[1],
            i[0],
            i[1],
            l[0],
            l[1],
        ]
    }

    /// Whether data flows from device to host.
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & request_type::DIR_DEVICE_TO_HOST != 0
    }

    /// Whether this is a class-specific request.
    pub fn is_class(&self) -> bool {
        self.request_type & request_type::TYPE_MASK == request_type::TYPE_CLASS
    }

    /// Interface number (low byte of `wIndex`).
    pub fn interface_number(&self) -> u8 {
        self.index.to_le_bytes()[0]
    }

    /// Entity ID (high byte of `wIndex`) for control-interface requests.
    pub fn entity_id(&self) -> u8 {
        self.index.to_le_bytes()[1]
    }

    /// Control selector (high byte of `wValue`).
    pub fn control_selector(&self) -> u8 {
        self.value.to_le_bytes()[1]
    }

    /// Endpoint number addressed by an endpoint-recipient request.
    pub fn endpoint_number(&self) -> u8 {
        (self.index & ENDPOINT_NUMBER_MASK).to_le_bytes()[0]
    }

    /// Descriptor type (high byte of `wValue`) for GET_DESCRIPTOR.
    pub fn descriptor_type(&self) -> u8 {
        self.control_selector()
    }
}
