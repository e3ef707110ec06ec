//! USB device controller seam and the transport primitive built on it.
//!
//! [`UsbDeviceController`] is the boundary to the platform's device
//! controller. [`Transport`] wraps it with the cache maintenance every
//! request needs: buffers are written back before a send and invalidated
//! before a receive.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::GadgetResult;

/// A device endpoint, identified by number (direction bit stripped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(u8);

impl Endpoint {
    /// The default control endpoint.
    pub const CONTROL: Self = Self(0);

    /// Endpoint with the given number; the direction bit is ignored.
    pub const fn new(number: u8) -> Self {
        Self(number & 0x0F)
    }

    pub const fn number(self) -> u8 {
        self.0
    }
}

/// How a submitted request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// All bytes moved.
    Completed {
        /// Bytes transferred
        transferred: usize,
    },
    /// Cancelled before completion.
    Cancelled,
    /// Controller reported an error.
    Error(i32),
}

/// Completion callback for sends and chains. Runs in the controller's context.
pub type Completion = Box<dyn FnOnce(TransferStatus) + Send + 'static>;

/// Completion callback for receives; gets the received bytes.
pub type ReceiveCompletion = Box<dyn FnOnce(TransferStatus, &[u8]) + Send + 'static>;

/// Platform device controller.
///
/// Implementations must not invoke a completion while holding a lock the
/// completion might need; completions may re-enter the controller.
pub trait UsbDeviceController: Send + Sync {
    /// Queue `data` for transmission on `endpoint`.
    fn send(&self, endpoint: Endpoint, data: &[u8]) -> GadgetResult<()>;

    /// Queue a receive of up to `length` bytes on `endpoint`.
    fn receive(
        &self,
        endpoint: Endpoint,
        length: usize,
        on_complete: ReceiveCompletion,
    ) -> GadgetResult<()>;

    /// Submit `segments` as one linked request. `on_complete` fires once, after
    /// the last segment.
    fn submit_chain(
        &self,
        endpoint: Endpoint,
        segments: &[&[u8]],
        on_complete: Completion,
    ) -> GadgetResult<()>;

    /// Cancel every request in flight on `endpoint`.
    fn cancel_all(&self, endpoint: Endpoint) -> GadgetResult<()>;

    /// Discard any data sitting in the endpoint FIFO.
    fn clear_fifo(&self, endpoint: Endpoint) -> GadgetResult<()>;

    /// Halt `endpoint`.
    fn stall(&self, endpoint: Endpoint) -> GadgetResult<()>;

    /// Write back CPU caches covering `data`.
    fn writeback_range(&self, _data: &[u8]) {}

    /// Invalidate CPU caches covering a receive buffer of `length` bytes.
    fn invalidate_range(&self, _length: usize) {}
}

/// Single-request transport with cache maintenance.
#[derive(Clone)]
pub struct Transport {
    controller: Arc<dyn UsbDeviceController>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(controller: Arc<dyn UsbDeviceController>) -> Self {
        Self { controller }
    }

    /// Write back and send `data` on `endpoint`.
    ///
    /// # Errors
    ///
    /// Submission failures are returned as-is; nothing is retried.
    pub fn send(&self, endpoint: Endpoint, data: &[u8]) -> GadgetResult<()> {
        self.controller.writeback_range(data);
        trace!(endpoint = endpoint.number(), len = data.len(), "send");
        self.controller.send(endpoint, data).inspect_err(|e| {
            warn!(endpoint = endpoint.number(), error = %e, "send submission failed");
        })
    }

    /// Invalidate and receive up to `length` bytes on `endpoint`.
    ///
    /// # Errors
    ///
    /// Submission failures are returned as-is.
    pub fn receive(
        &self,
        endpoint: Endpoint,
        length: usize,
        on_complete: ReceiveCompletion,
    ) -> GadgetResult<()> {
        self.controller.invalidate_range(length);
        trace!(endpoint = endpoint.number(), length, "receive");
        self.controller
            .receive(endpoint, length, on_complete)
            .inspect_err(|e| {
                warn!(endpoint = endpoint.number(), error = %e, "receive submission failed");
            })
    }

    /// Write back every segment and submit them as one chain.
    ///
    /// # Errors
    ///
    /// Submission failures are returned as-is.
    pub fn submit_chain(
        &self,
        endpoint: Endpoint,
        segments: &[&[u8]],
        on_complete: Completion,
    ) -> GadgetResult<()> {
        for segment in segments {
            self.controller.writeback_range(segment);
        }
        self.controller.submit_chain(endpoint, segments, on_complete)
    }

    /// Cancel in-flight requests on `endpoint`.
    ///
    /// # Errors
    ///
    /// Propagates controller failures.
    pub fn cancel_all(&self, endpoint: Endpoint) -> GadgetResult<()> {
        self.controller.cancel_all(endpoint)
    }

    /// Clear the FIFO of `endpoint`.
    ///
    /// # Errors
    ///
    /// Propagates controller failures.
    pub fn clear_fifo(&self, endpoint: Endpoint) -> GadgetResult<()> {
        self.controller.clear_fifo(endpoint)
    }

    /// Stall `endpoint`.
    ///
    /// # Errors
    ///
    /// Propagates controller failures.
    pub fn stall(&self, endpoint: Endpoint) -> GadgetResult<()> {
        self.controller.stall(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDeviceController;

    #[test]
    fn test_endpoint_strips_direction() {
        assert_eq!(Endpoint::new(0x81).number(), 1);
        assert_eq!(Endpoint::CONTROL.number(), 0);
    }

    #[test]
    fn test_send_writes_back_first() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let transport = Transport::new(Arc::new(mock.clone()));

        transport.send(Endpoint::CONTROL, &[1, 2, 3])?;
        transport.receive(Endpoint::CONTROL, 26, Box::new(|_, _| {}))?;

        assert_eq!(mock.writeback_bytes(), 3);
        assert_eq!(mock.invalidated_bytes(), 26);
        assert_eq!(mock.take_sent(Endpoint::CONTROL), vec![vec![1, 2, 3]]);
        Ok(())
    }
}
