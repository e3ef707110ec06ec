//! UVC gadget streaming core.
//!
//! Turns a display's framebuffer into a USB Video Class stream over bulk
//! transfers. The crate is organised leaves first:
//!
//! - [`transport`]: the device controller seam and single-request transport
//! - [`queue`]: packet batching into chained submissions
//! - [`segmenter`]: frame to payload-transfer splitting
//! - [`control`]: probe/commit negotiation on EP0
//! - [`streaming`]: the vblank-paced streaming thread
//! - [`driver`] and [`gadget`]: registration and lifecycle
//!
//! Wire formats live in [`udcd_uvc_protocol`]. Platform collaborators are
//! traits ([`UsbDeviceController`], [`UdcDriverManager`], [`Display`],
//! [`PixelConverter`]); [`mock`] has in-memory versions of each.

#![deny(static_mut_refs)]

pub mod config;
pub mod control;
pub mod convert;
pub mod display;
pub mod driver;
pub mod error;
pub mod framebuffer;
pub mod gadget;
pub mod mock;
pub mod pacer;
pub mod queue;
pub mod segmenter;
pub mod session;
pub mod stats;
pub mod streaming;
pub mod transport;

pub use config::{GadgetConfig, GadgetConfigBuilder};
pub use control::{ControlOutcome, ControlState, ControlStateMachine};
pub use convert::{PixelConverter, SoftwareConverter};
pub use display::{Display, FramebufferInfo, SourcePixelFormat, VblankCallback, VblankId};
pub use driver::{ClassDriver, DriverDescriptors, DriverSwitch, UdcDriverManager, UvcClassDriver};
pub use error::{DriverStatus, GadgetError, GadgetResult};
pub use framebuffer::FrameBuffer;
pub use gadget::UvcGadget;
pub use pacer::VblankPacer;
pub use queue::{CompletionWait, PayloadQueue};
pub use segmenter::{FrameReport, FrameSegmenter, transfer_count};
pub use session::{EventFlag, Session, StreamState};
pub use stats::{StatsSnapshot, StreamStats};
pub use streaming::StreamingLoop;
pub use transport::{Endpoint, TransferStatus, Transport, UsbDeviceController};

pub use udcd_uvc_protocol as protocol;
