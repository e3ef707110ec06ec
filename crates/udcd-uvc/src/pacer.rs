//! Vblank-derived frame pacing.
//!
//! The display reports vertical blanks at its refresh rate; frames are due
//! whenever the accumulated blank time reaches the negotiated frame interval.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;
use udcd_uvc_protocol::INTERVAL_UNITS_PER_SECOND;

use crate::session::{Session, event};

/// Accumulates vblanks until a frame interval has elapsed.
#[derive(Debug)]
pub struct VblankPacer {
    refresh_hz: u32,
    frames: AtomicU32,
}

impl VblankPacer {
    pub fn new(refresh_hz: u32) -> Self {
        Self {
            refresh_hz: refresh_hz.max(1),
            frames: AtomicU32::new(0),
        }
    }

    /// Account for `count` vblanks. Returns `true`, and starts counting
    /// again, once they span at least `interval` (100 ns units).
    pub fn on_vblank(&self, count: u32, interval: u32) -> bool {
        let frames = self
            .frames
            .fetch_add(count, Ordering::AcqRel)
            .saturating_add(count);
        let elapsed =
            u64::from(frames) * u64::from(INTERVAL_UNITS_PER_SECOND) / u64::from(self.refresh_hz);
        if elapsed >= u64::from(interval) {
            self.frames.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn reset(&self) {
        self.frames.store(0, Ordering::Release);
    }

    /// Vblank entry point: paces against the session's negotiated interval
    /// and raises [`event::FRAME`] when a frame is due. Blanks are not
    /// counted while the stream is stopped.
    pub fn tick(&self, session: &Session, count: u32) {
        if !session.is_streaming() {
            return;
        }
        let interval = session.current_control().frame_interval;
        if self.on_vblank(count, interval) {
            trace!(interval, "frame due");
            session.events().set(event::FRAME);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::GadgetConfig;
    use crate::error::GadgetResult;
    use crate::mock::MockDeviceController;

    #[test]
    fn test_sixty_fps_fires_every_blank() {
        let pacer = VblankPacer::new(60);
        assert!(pacer.on_vblank(1, 166_666));
        assert!(pacer.on_vblank(1, 166_666));
    }

    #[test]
    fn test_thirty_fps_fires_every_other_blank() {
        let pacer = VblankPacer::new(60);
        let fired: Vec<bool> = (0..6).map(|_| pacer.on_vblank(1, 333_333)).collect();
        assert_eq!(fired, vec![false, true, false, true, false, true]);
    }

    #[test]
    fn test_missed_blanks_count_together() {
        let pacer = VblankPacer::new(60);
        assert!(pacer.on_vblank(2, 333_333));
    }

    #[test]
    fn test_tick_only_counts_while_streaming() -> GadgetResult<()> {
        let session = Session::new(GadgetConfig::default(), Arc::new(MockDeviceController::new()))?;
        let pacer = VblankPacer::new(60);

        pacer.tick(&session, 1);
        assert_eq!(session.events().peek() & event::FRAME, 0);

        session.start_streaming();
        let _ = session.events().wait(event::FRAME, std::time::Duration::ZERO);
        pacer.tick(&session, 1);
        assert_eq!(session.events().peek() & event::FRAME, event::FRAME);
        Ok(())
    }
}
