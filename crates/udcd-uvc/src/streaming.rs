//! The streaming thread.
//!
//! [`StreamingLoop::run`] owns the whole streaming lifetime: it waits for the
//! display, switches the bus over to the UVC driver, then sends one frame per
//! [`event::FRAME`] while the stream is active. On [`event::SHUTDOWN`] it
//! gives the bus back and releases the frame buffer.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use udcd_uvc_protocol::{FrameId, lookup};

use crate::convert::PixelConverter;
use crate::display::{Display, VblankId, current_framebuffer};
use crate::driver::{DriverSwitch, UdcDriverManager};
use crate::error::{GadgetError, GadgetResult};
use crate::framebuffer::FrameBuffer;
use crate::pacer::VblankPacer;
use crate::segmenter::{FrameReport, FrameSegmenter};
use crate::session::{Session, event};

/// State owned by the streaming thread.
pub struct StreamingLoop {
    session: Arc<Session>,
    display: Arc<dyn Display>,
    converter: Arc<dyn PixelConverter>,
    switch: DriverSwitch,
    segmenter: FrameSegmenter,
    pacer: Arc<VblankPacer>,
    frame_buffer: Option<FrameBuffer>,
    frame_id: FrameId,
}

impl std::fmt::Debug for StreamingLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingLoop")
            .field("frame_id", &self.frame_id)
            .field("frame_buffer", &self.frame_buffer.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamingLoop {
    /// Create the loop for `session`.
    ///
    /// # Errors
    ///
    /// Fails when the session's packet geometry cannot carry a payload header.
    pub fn new(
        session: Arc<Session>,
        display: Arc<dyn Display>,
        converter: Arc<dyn PixelConverter>,
        manager: Arc<dyn UdcDriverManager>,
    ) -> GadgetResult<Self> {
        let segmenter = FrameSegmenter::for_session(&session)?;
        let switch = DriverSwitch::new(manager, session.config().clone());
        let pacer = Arc::new(VblankPacer::new(session.config().vblank_rate_hz));
        Ok(Self {
            session,
            display,
            converter,
            switch,
            segmenter,
            pacer,
            frame_buffer: None,
            frame_id: FrameId::ZERO,
        })
    }

    /// Identifier the next frame will carry.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn has_frame_buffer(&self) -> bool {
        self.frame_buffer.is_some()
    }

    /// Thread body: start up, stream until shutdown, tear down.
    ///
    /// # Errors
    ///
    /// Returns start-up failures; the bus is left with the stock drivers.
    pub fn run(mut self) -> GadgetResult<()> {
        if !self.startup()? {
            info!("shutdown requested during start-up");
            return Ok(());
        }

        let session = Arc::clone(&self.session);
        let pacer = Arc::clone(&self.pacer);
        let vblank = match self
            .display
            .register_vblank(Box::new(move |count| pacer.tick(&session, count)))
        {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "failed to register vblank callback");
                self.switch.restore_default();
                return Err(e);
            }
        };

        info!("streaming thread running");
        while self.step() {}

        self.teardown(vblank);
        Ok(())
    }

    /// Returns `false` if shutdown was requested before the switch happened.
    fn startup(&mut self) -> GadgetResult<bool> {
        self.display.wait_for_framebuffer_set()?;
        debug!("framebuffer available");

        let delay = self.session.config().startup_delay();
        if self
            .session
            .events()
            .wait(event::SHUTDOWN, delay)
            .is_some()
        {
            return Ok(false);
        }

        // Must precede activation: the host negotiates as soon as it enumerates.
        self.session.reset_current();
        self.switch.activate_uvc()?;
        Ok(true)
    }

    /// Wait for one event and act on it. Returns `false` on shutdown.
    pub fn step(&mut self) -> bool {
        let idle = self.session.config().idle_timeout();
        match self
            .session
            .events()
            .wait(event::FRAME | event::SHUTDOWN, idle)
        {
            None => {
                if self.frame_buffer.take().is_some() {
                    debug!(?idle, "idle, frame buffer released");
                }
                true
            }
            Some(bits) if bits & event::SHUTDOWN != 0 => false,
            Some(_) => {
                if self.session.is_streaming() {
                    self.stream_one();
                }
                true
            }
        }
    }

    fn stream_one(&mut self) {
        match self.send_frame() {
            Ok(_) => {}
            Err(e @ (GadgetError::Display(_) | GadgetError::Convert(_))) => {
                warn!(error = %e, "frame skipped");
                self.session.stats().record_dropped_frame();
            }
            Err(e) if e.is_abort() => {
                debug!(error = %e, "frame interrupted by abort");
                self.session.stats().record_dropped_frame();
            }
            Err(e) => {
                warn!(error = %e, "frame transfer failed, stopping stream");
                self.session.stats().record_dropped_frame();
                self.session.video_abort();
            }
        }
    }

    /// Capture, convert and send one frame at the negotiated format.
    ///
    /// The frame ID toggles only when the whole frame was delivered.
    ///
    /// # Errors
    ///
    /// Returns lookup, allocation, display, conversion and transfer errors.
    pub fn send_frame(&mut self) -> GadgetResult<FrameReport> {
        let control = self.session.current_control();
        let selection = lookup(control.format_index, control.frame_index)?;

        let reusable = self
            .frame_buffer
            .as_ref()
            .is_some_and(|fb| fb.matches(control.format_index, control.frame_index));
        if !reusable {
            self.frame_buffer = None;
            self.frame_buffer = Some(FrameBuffer::allocate(selection)?);
        }
        let Some(fb) = self.frame_buffer.as_mut() else {
            return Err(GadgetError::Allocation {
                size: selection.frame_size() as usize,
            });
        };

        let source = current_framebuffer(self.display.as_ref())?;
        let (format, width, height) = (fb.pixel_format(), fb.width(), fb.height());
        self.converter
            .convert(fb.frame_mut(), format, width, height, &source)?;

        let report = self.segmenter.transfer_frame(self.frame_id, fb.frame())?;
        self.frame_id.toggle();
        self.session
            .stats()
            .record_frame(report.transfers, report.bytes);
        Ok(report)
    }

    fn teardown(&mut self, vblank: VblankId) {
        info!("streaming thread stopping");
        if let Err(e) = self.display.unregister_vblank(vblank) {
            warn!(error = %e, "failed to unregister vblank callback");
        }
        self.session.video_abort();
        self.switch.restore_default();
        self.frame_buffer = None;
        self.pacer.reset();
    }
}
