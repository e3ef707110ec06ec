//! Error types for the UVC gadget runtime.

use std::time::Duration;

use thiserror::Error;
use udcd_uvc_protocol::ProtocolError;

/// Failure reported by the USB driver manager for a driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverStatus {
    /// The operation targets a driver or gadget that is not active.
    #[error("not active")]
    NotActive,
    /// Any other failure, with the platform error code.
    #[error("error code {0:#010x}")]
    Failed(i32),
}

/// Errors produced by the gadget runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GadgetError {
    /// The controller rejected a transfer submission or completed it with an error.
    #[error("Transfer on endpoint {endpoint} failed with code {code}")]
    Transport {
        /// Endpoint number
        endpoint: u8,
        /// Controller error code
        code: i32,
    },

    /// More segments were enqueued than one payload transfer can hold.
    #[error("Payload queue full: capacity is {capacity} segments")]
    QueueFull {
        /// Queue capacity in segments
        capacity: usize,
    },

    /// The in-flight transfer was cancelled by a stream abort.
    #[error("Transfer cancelled")]
    Cancelled,

    /// No completion arrived within the configured bound.
    #[error("Timed out after {0:?} waiting for transfer completion")]
    Timeout(Duration),

    /// The endpoint is halted.
    #[error("Endpoint {0} is stalled")]
    Stalled(u8),

    /// The device is not attached to a host.
    #[error("Device detached")]
    Detached,

    /// Frame buffer allocation failed.
    #[error("Failed to allocate a {size}-byte frame buffer")]
    Allocation {
        /// Requested size in bytes
        size: usize,
    },

    /// Wire-format error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A driver manager operation failed.
    #[error("Driver operation {operation} on {name} failed: {status}")]
    Driver {
        /// Driver name, or the product ID for activation
        name: String,
        /// Operation that failed
        operation: &'static str,
        /// Reported status
        status: DriverStatus,
    },

    /// The display collaborator failed.
    #[error("Display error: {0}")]
    Display(String),

    /// Pixel conversion failed.
    #[error("Pixel conversion failed: {0}")]
    Convert(String),

    /// The streaming thread could not be created.
    #[error("Failed to spawn streaming thread: {0}")]
    ThreadSpawn(String),

    /// The streaming thread panicked.
    #[error("Streaming thread panicked")]
    ThreadPanicked,

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The gadget was started twice.
    #[error("Gadget is already running")]
    AlreadyRunning,
}

impl GadgetError {
    /// Create a transport error.
    #[must_use]
    pub fn transport(endpoint: u8, code: i32) -> Self {
        Self::Transport { endpoint, code }
    }

    /// Create a driver operation error.
    #[must_use]
    pub fn driver(name: impl Into<String>, operation: &'static str, status: DriverStatus) -> Self {
        Self::Driver {
            name: name.into(),
            operation,
            status,
        }
    }

    /// Create a display error.
    #[must_use]
    pub fn display(msg: impl Into<String>) -> Self {
        Self::Display(msg.into())
    }

    /// Create a conversion error.
    #[must_use]
    pub fn convert(msg: impl Into<String>) -> Self {
        Self::Convert(msg.into())
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Whether this error came from the stream being torn down rather than a fault.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Detached)
    }
}

/// A specialized `Result` type for gadget operations.
pub type GadgetResult<T> = std::result::Result<T, GadgetError>;
