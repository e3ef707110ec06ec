//! Shared gadget state.
//!
//! One [`Session`] is shared between the control-endpoint handler (running in
//! the controller's context) and the streaming thread. The negotiated control
//! block and the stream state are the only fields written from one context
//! and read from the other: the writer updates them and then raises an
//! [`EventFlag`] bit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use udcd_uvc_protocol::{
    ControlVersion, FORMATS, SetupPacket, StreamingControl, max_video_frame_size,
};

use crate::config::GadgetConfig;
use crate::error::{GadgetError, GadgetResult};
use crate::stats::StreamStats;
use crate::transport::{Endpoint, Transport, UsbDeviceController};

/// Event bits understood by the streaming thread.
pub mod event {
    /// A frame should be sent.
    pub const FRAME: u32 = 1 << 0;
    /// The streaming thread should exit.
    pub const SHUTDOWN: u32 = 1 << 1;
}

/// Size of the EP0 receive buffer for SET_CUR payloads.
pub const CONTROL_BUFFER_LEN: usize = 64;

/// `stopped | active`, shared with the payload queue.
#[derive(Debug, Default)]
pub struct StreamState {
    active: AtomicBool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Transition `stopped -> active`. Returns `false` if already active.
    pub fn start(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transition `active -> stopped`. Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        self.active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Bit-set wakeup primitive with wait-any/clear-on-wake semantics.
#[derive(Debug, Default)]
pub struct EventFlag {
    bits: Mutex<u32>,
    cond: Condvar,
}

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `bits` and wake every waiter.
    pub fn set(&self, bits: u32) {
        let mut guard = self.bits.lock();
        *guard |= bits;
        self.cond.notify_all();
    }

    /// Block until any bit in `mask` is set or `timeout` elapses.
    ///
    /// Returns the matched bits (and clears them), or `None` on timeout.
    pub fn wait(&self, mask: u32, timeout: Duration) -> Option<u32> {
        let mut guard = self.bits.lock();
        if *guard & mask == 0 {
            let _ = self
                .cond
                .wait_while_for(&mut guard, |bits| *bits & mask == 0, timeout);
        }
        let matched = *guard & mask;
        if matched == 0 {
            return None;
        }
        *guard &= !matched;
        Some(matched)
    }

    /// Currently raised bits.
    pub fn peek(&self) -> u32 {
        *self.bits.lock()
    }
}

/// The in-flight EP0 receive for a SET_CUR request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingControlTransfer {
    /// Setup packet that started the transfer.
    pub setup: SetupPacket,
    /// Received bytes, zero padded.
    pub buffer: [u8; CONTROL_BUFFER_LEN],
    /// Bytes actually received.
    pub received: usize,
}

impl PendingControlTransfer {
    pub fn new(setup: SetupPacket) -> Self {
        Self {
            setup,
            buffer: [0; CONTROL_BUFFER_LEN],
            received: 0,
        }
    }

    /// Bytes requested by the host, capped at the buffer size.
    pub fn expected_len(&self) -> usize {
        usize::from(self.setup.length).min(CONTROL_BUFFER_LEN)
    }

    /// Copy received bytes into the buffer.
    pub fn fill(&mut self, data: &[u8]) {
        let n = data.len().min(self.expected_len());
        self.buffer[..n].copy_from_slice(&data[..n]);
        self.received = n;
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.received]
    }
}

/// State shared by the control handler and the streaming loop.
#[derive(Debug)]
pub struct Session {
    config: GadgetConfig,
    default_control: StreamingControl,
    current: Mutex<StreamingControl>,
    state: Arc<StreamState>,
    pending: Mutex<Option<PendingControlTransfer>>,
    events: EventFlag,
    stats: StreamStats,
    transport: Transport,
}

impl Session {
    /// Create a session for `config` talking to `controller`.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::InvalidConfiguration`] if `config` fails validation.
    pub fn new(
        config: GadgetConfig,
        controller: Arc<dyn UsbDeviceController>,
    ) -> GadgetResult<Arc<Self>> {
        config.validate()?;
        let default_control = default_streaming_control(&config)?;
        debug!(?default_control, "session created");

        Ok(Arc::new(Self {
            current: Mutex::new(default_control),
            default_control,
            state: Arc::new(StreamState::new()),
            pending: Mutex::new(None),
            events: EventFlag::new(),
            stats: StreamStats::new(),
            transport: Transport::new(controller),
            config,
        }))
    }

    pub fn config(&self) -> &GadgetConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn events(&self) -> &EventFlag {
        &self.events
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Handle to the stream state for the payload queue.
    pub fn stream_state(&self) -> Arc<StreamState> {
        Arc::clone(&self.state)
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_active()
    }

    pub fn video_endpoint(&self) -> Endpoint {
        Endpoint::new(self.config.video_endpoint)
    }

    pub fn control_version(&self) -> ControlVersion {
        self.config.control_version
    }

    /// The immutable control block served for GET_MIN/GET_MAX/GET_DEF.
    pub fn default_control(&self) -> StreamingControl {
        self.default_control
    }

    /// The negotiated control block.
    pub fn current_control(&self) -> StreamingControl {
        *self.current.lock()
    }

    /// Apply `f` to the negotiated control block.
    pub fn update_current<R>(&self, f: impl FnOnce(&mut StreamingControl) -> R) -> R {
        f(&mut self.current.lock())
    }

    /// Reset the negotiated control block to the default.
    pub fn reset_current(&self) {
        *self.current.lock() = self.default_control;
        debug!("current streaming control reset to default");
    }

    /// Record a new pending SET_CUR transfer, replacing any previous one.
    pub fn begin_control_transfer(&self, setup: SetupPacket) -> usize {
        let pending = PendingControlTransfer::new(setup);
        let len = pending.expected_len();
        if self.pending.lock().replace(pending).is_some() {
            debug!("overwrote an unfinished SET_CUR transfer");
        }
        len
    }

    /// Take the pending SET_CUR transfer, filling it with `data`.
    pub fn finish_control_transfer(&self, data: &[u8]) -> Option<PendingControlTransfer> {
        let mut pending = self.pending.lock().take()?;
        pending.fill(data);
        Some(pending)
    }

    pub fn has_pending_control_transfer(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Transition to `active` and wake the streaming thread.
    pub fn start_streaming(&self) -> bool {
        let started = self.state.start();
        if started {
            info!("stream started");
        }
        self.events.set(event::FRAME);
        started
    }

    /// Video-abort: stop the stream, cancel in-flight video requests and
    /// clear the video FIFO. A no-op unless the stream is active.
    pub fn video_abort(&self) -> bool {
        if !self.state.stop() {
            debug!("video abort ignored, stream not active");
            return false;
        }

        info!("stream aborted");
        self.stats.record_abort();
        let endpoint = self.video_endpoint();
        if let Err(e) = self.transport.cancel_all(endpoint) {
            warn!(error = %e, "failed to cancel video requests");
        }
        if let Err(e) = self.transport.clear_fifo(endpoint) {
            warn!(error = %e, "failed to clear video FIFO");
        }
        true
    }

    /// Ask the streaming thread to exit.
    pub fn request_shutdown(&self) {
        self.events.set(event::SHUTDOWN);
    }
}

/// Default control block advertised before any negotiation.
///
/// # Errors
///
/// Fails if no format is advertised.
pub fn default_streaming_control(config: &GadgetConfig) -> GadgetResult<StreamingControl> {
    let format = FORMATS
        .first()
        .ok_or_else(|| GadgetError::invalid_configuration("no video formats advertised"))?;
    let frame = format
        .frame(format.default_frame_index)
        .ok_or_else(|| GadgetError::invalid_configuration("default frame index not advertised"))?;

    Ok(StreamingControl {
        format_index: format.format_index,
        frame_index: frame.frame_index,
        frame_interval: frame.default_interval,
        max_video_frame_size: max_video_frame_size(),
        max_payload_transfer_size: config.max_payload_transfer_size,
        preferred_version: 1,
        ..StreamingControl::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDeviceController;

    #[test]
    fn test_stream_state_transitions() {
        let state = StreamState::new();
        assert!(!state.is_active());
        assert!(state.start());
        assert!(!state.start());
        assert!(state.stop());
        assert!(!state.stop());
    }

    #[test]
    fn test_event_flag_wait_clears_matched_bits() {
        let flag = EventFlag::new();
        flag.set(event::FRAME | event::SHUTDOWN);
        assert_eq!(
            flag.wait(event::FRAME, Duration::from_millis(1)),
            Some(event::FRAME)
        );
        assert_eq!(flag.peek(), event::SHUTDOWN);
        assert_eq!(flag.wait(event::FRAME, Duration::from_millis(1)), None);
    }

    #[test]
    fn test_event_flag_wakes_across_threads() {
        let flag = Arc::new(EventFlag::new());
        let setter = Arc::clone(&flag);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            setter.set(event::SHUTDOWN);
        });
        let bits = flag.wait(event::FRAME | event::SHUTDOWN, Duration::from_secs(5));
        assert_eq!(bits, Some(event::SHUTDOWN));
        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_pending_transfer_caps_length() {
        let setup = SetupPacket::new(0x21, 0x01, 0x0100, 1, 200);
        let mut pending = PendingControlTransfer::new(setup);
        assert_eq!(pending.expected_len(), CONTROL_BUFFER_LEN);
        pending.fill(&[7u8; 100]);
        assert_eq!(pending.received, CONTROL_BUFFER_LEN);
    }

    #[test]
    fn test_video_abort_is_idempotent() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let session = Session::new(GadgetConfig::default(), Arc::new(mock.clone()))?;

        assert!(!session.video_abort());
        assert!(session.start_streaming());
        assert!(session.video_abort());
        assert!(!session.video_abort());

        assert_eq!(mock.cancel_count(Endpoint::new(1)), 1);
        assert_eq!(mock.fifo_clear_count(Endpoint::new(1)), 1);
        assert_eq!(session.stats().snapshot().aborts, 1);
        Ok(())
    }

    #[test]
    fn test_default_control() -> GadgetResult<()> {
        let control = default_streaming_control(&GadgetConfig::default())?;
        assert_eq!(control.format_index, 1);
        assert_eq!(control.frame_index, 1);
        assert_eq!(control.frame_interval, 166_666);
        assert_eq!(control.max_video_frame_size, 960 * 544 * 3 / 2);
        assert_eq!(control.max_payload_transfer_size, 16 * 1024);
        Ok(())
    }
}
