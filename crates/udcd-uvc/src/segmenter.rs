//! Frame segmentation into UVC bulk payload transfers.
//!
//! A frame is carried by one or more payload transfers of at most
//! `max_payload_transfer_size` bytes, header included. Each transfer is
//! queued as packets: the lead packet holds the payload header and the first
//! data bytes, the rest are `max_packet_size` slices.

use tracing::{debug, trace};
use udcd_uvc_protocol::{FrameId, HeaderFormat, LEGACY_HEADER_LEN, PayloadHeader};

use crate::error::{GadgetError, GadgetResult};
use crate::queue::{CompletionWait, PayloadQueue};
use crate::session::Session;

/// Outcome of one delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameReport {
    /// Payload transfers issued
    pub transfers: usize,
    /// Frame bytes delivered, headers excluded
    pub bytes: usize,
}

/// Number of payload transfers needed for a `frame_len`-byte frame.
///
/// An empty frame still takes one header-only transfer.
pub fn transfer_count(header_format: HeaderFormat, max_payload: usize, frame_len: usize) -> usize {
    let chunk = max_payload.saturating_sub(header_format.len()).max(1);
    frame_len.div_ceil(chunk).max(1)
}

/// Splits frames into payload transfers and drives the [`PayloadQueue`].
#[derive(Debug)]
pub struct FrameSegmenter {
    queue: PayloadQueue,
    header_format: HeaderFormat,
    max_payload: usize,
    max_packet: usize,
}

impl FrameSegmenter {
    /// Create a segmenter over `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::InvalidConfiguration`] when a packet cannot
    /// hold the header plus one data byte or a payload is smaller than a
    /// packet.
    pub fn new(
        queue: PayloadQueue,
        header_format: HeaderFormat,
        max_payload: usize,
        max_packet: usize,
    ) -> GadgetResult<Self> {
        if max_packet <= header_format.len() {
            return Err(GadgetError::invalid_configuration(
                "max packet size must exceed the payload header",
            ));
        }
        if max_payload < max_packet {
            return Err(GadgetError::invalid_configuration(
                "max payload transfer size must be at least one packet",
            ));
        }
        Ok(Self {
            queue,
            header_format,
            max_payload,
            max_packet,
        })
    }

    /// Segmenter wired to the session's video endpoint and configuration.
    ///
    /// # Errors
    ///
    /// See [`FrameSegmenter::new`].
    pub fn for_session(session: &Session) -> GadgetResult<Self> {
        let config = session.config();
        let max_packet = usize::from(config.max_packet_size);
        let queue = PayloadQueue::new(
            session.transport().clone(),
            session.video_endpoint(),
            config.queue_capacity(),
            max_packet,
            CompletionWait {
                timeout: config.completion_timeout(),
                poll: config.completion_poll(),
            },
            session.stream_state(),
        );
        Self::new(
            queue,
            config.header_format,
            config.max_payload_transfer_size as usize,
            max_packet,
        )
    }

    pub fn header_format(&self) -> HeaderFormat {
        self.header_format
    }

    /// Frame bytes carried by a full payload transfer.
    pub fn chunk_len(&self) -> usize {
        self.max_payload - self.header_format.len()
    }

    /// Send `data` as one frame tagged with `frame_id`.
    ///
    /// # Errors
    ///
    /// Returns the first queue or transport error; the remaining transfers
    /// of the frame are not sent.
    pub fn transfer_frame(&mut self, frame_id: FrameId, data: &[u8]) -> GadgetResult<FrameReport> {
        let header_len = self.header_format.len();
        let chunk = self.chunk_len();
        let mut remaining = data;
        let mut report = FrameReport::default();

        while remaining.len() + header_len > self.max_payload {
            let (head, tail) = remaining.split_at(chunk);
            self.send_payload(frame_id, false, head)?;
            report.transfers += 1;
            report.bytes += head.len();
            remaining = tail;
        }

        self.send_payload(frame_id, true, remaining)?;
        report.transfers += 1;
        report.bytes += remaining.len();

        debug!(
            fid = frame_id.bit(),
            transfers = report.transfers,
            bytes = report.bytes,
            "frame transferred"
        );
        Ok(report)
    }

    fn send_payload(&mut self, frame_id: FrameId, eof: bool, data: &[u8]) -> GadgetResult<()> {
        if !self.queue.is_stream_active() {
            return Err(GadgetError::Cancelled);
        }

        let mut header = [0u8; LEGACY_HEADER_LEN];
        let header_len = PayloadHeader::new(frame_id, eof).write_to(self.header_format, &mut header)?;

        self.queue.reset();
        let lead = data.len().min(self.max_packet - header_len);
        let (first, rest) = data.split_at(lead);
        self.queue.enqueue_lead(&header[..header_len], first)?;
        for packet in rest.chunks(self.max_packet) {
            self.queue.enqueue(packet)?;
        }

        trace!(
            eof,
            len = data.len(),
            packets = self.queue.len(),
            "payload transfer queued"
        );
        self.queue.submit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use udcd_uvc_protocol::flags;

    use super::*;
    use crate::mock::MockDeviceController;
    use crate::session::StreamState;
    use crate::transport::{Endpoint, Transport};

    fn segmenter(
        mock: &MockDeviceController,
        format: HeaderFormat,
        max_payload: usize,
        max_packet: usize,
    ) -> GadgetResult<FrameSegmenter> {
        let state = Arc::new(StreamState::new());
        let _ = state.start();
        let queue = PayloadQueue::new(
            Transport::new(Arc::new(mock.clone())),
            Endpoint::new(1),
            max_payload.div_ceil(max_packet),
            max_packet,
            CompletionWait {
                timeout: Duration::from_millis(200),
                poll: Duration::from_millis(5),
            },
            state,
        );
        FrameSegmenter::new(queue, format, max_payload, max_packet)
    }

    #[test]
    fn test_transfer_count() {
        assert_eq!(transfer_count(HeaderFormat::Compact, 16_384, 0), 1);
        assert_eq!(transfer_count(HeaderFormat::Compact, 16_384, 16_382), 1);
        assert_eq!(transfer_count(HeaderFormat::Compact, 16_384, 16_383), 2);
        assert_eq!(transfer_count(HeaderFormat::Compact, 16_384, 783_360), 48);
        assert_eq!(transfer_count(HeaderFormat::Legacy, 16_384, 16_372), 1);
    }

    #[test]
    fn test_small_frame_is_one_packet() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let mut seg = segmenter(&mock, HeaderFormat::Compact, 64, 16)?;

        let report = seg.transfer_frame(FrameId::ZERO.toggled(), &[9, 8, 7])?;
        assert_eq!(report, FrameReport { transfers: 1, bytes: 3 });

        let chains = mock.chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(
            chains[0].segments,
            vec![vec![2, flags::EOH | flags::EOF | flags::FID, 9, 8, 7]]
        );
        Ok(())
    }

    #[test]
    fn test_empty_frame_sends_header_only() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let mut seg = segmenter(&mock, HeaderFormat::Legacy, 64, 16)?;

        let report = seg.transfer_frame(FrameId::ZERO, &[])?;
        assert_eq!(report.transfers, 1);
        let chains = mock.chains();
        assert_eq!(chains[0].segments.len(), 1);
        assert_eq!(chains[0].segments[0].len(), LEGACY_HEADER_LEN);
        assert_eq!(chains[0].segments[0][1], flags::EOH | flags::EOF);
        Ok(())
    }

    #[test]
    fn test_lead_packet_layout() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let mut seg = segmenter(&mock, HeaderFormat::Compact, 64, 16)?;
        let data: Vec<u8> = (0..40).collect();

        seg.transfer_frame(FrameId::ZERO, &data)?;
        let chains = mock.chains();
        let lens: Vec<usize> = chains[0].segments.iter().map(Vec::len).collect();
        // 2-byte header + 14 data bytes, then 16, then the last 10.
        assert_eq!(lens, vec![16, 16, 10]);
        Ok(())
    }

    #[test]
    fn test_inactive_stream_is_cancelled() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let state = Arc::new(StreamState::new());
        let queue = PayloadQueue::new(
            Transport::new(Arc::new(mock.clone())),
            Endpoint::new(1),
            4,
            16,
            CompletionWait {
                timeout: Duration::from_millis(50),
                poll: Duration::from_millis(5),
            },
            state,
        );
        let mut seg = FrameSegmenter::new(queue, HeaderFormat::Compact, 64, 16)?;

        assert_eq!(
            seg.transfer_frame(FrameId::ZERO, &[1, 2, 3]),
            Err(GadgetError::Cancelled)
        );
        assert!(mock.chains().is_empty());
        Ok(())
    }

    #[test]
    fn test_rejects_packet_smaller_than_header() {
        let mock = MockDeviceController::new();
        assert!(segmenter(&mock, HeaderFormat::Legacy, 64, 12).is_err());
        assert!(segmenter(&mock, HeaderFormat::Compact, 8, 16).is_err());
    }
}
