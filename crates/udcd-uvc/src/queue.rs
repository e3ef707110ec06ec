//! Payload queue: batches packet-sized segments into one chained submission.
//!
//! Segments are staged in a single arena that is reset, not freed, between
//! transfers. [`PayloadQueue::submit`] hands the whole batch to the
//! controller as one chain and blocks until the chain's tail completes, the
//! stream is stopped, or the completion timeout expires.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use crate::error::{GadgetError, GadgetResult};
use crate::session::StreamState;
use crate::transport::{Endpoint, TransferStatus, Transport};

type CompletionMsg = (u64, TransferStatus);

/// Bounds on the per-submission completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionWait {
    /// Give up after this long.
    pub timeout: Duration,
    /// Re-check the stream state this often.
    pub poll: Duration,
}

/// Packet batcher for one endpoint.
pub struct PayloadQueue {
    transport: Transport,
    endpoint: Endpoint,
    capacity: usize,
    staging: Vec<u8>,
    segments: Vec<Range<usize>>,
    completion_tx: Sender<CompletionMsg>,
    completion_rx: Receiver<CompletionMsg>,
    seq: u64,
    wait: CompletionWait,
    state: Arc<StreamState>,
}

impl std::fmt::Debug for PayloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadQueue")
            .field("endpoint", &self.endpoint)
            .field("capacity", &self.capacity)
            .field("queued", &self.segments.len())
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl PayloadQueue {
    /// Create a queue holding up to `capacity` segments of at most
    /// `max_packet` bytes.
    pub fn new(
        transport: Transport,
        endpoint: Endpoint,
        capacity: usize,
        max_packet: usize,
        wait: CompletionWait,
        state: Arc<StreamState>,
    ) -> Self {
        let (completion_tx, completion_rx) = channel::bounded(1);
        Self {
            transport,
            endpoint,
            capacity,
            staging: Vec::with_capacity(capacity.saturating_mul(max_packet)),
            segments: Vec::with_capacity(capacity),
            completion_tx,
            completion_rx,
            seq: 0,
            wait,
            state,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Segments queued since the last reset.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether the stream this queue feeds is still active.
    pub fn is_stream_active(&self) -> bool {
        self.state.is_active()
    }

    /// Drop every queued segment, keeping the arena's allocation.
    pub fn reset(&mut self) {
        self.staging.clear();
        self.segments.clear();
    }

    /// Queue one segment.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::QueueFull`] once `capacity` segments are queued.
    pub fn enqueue(&mut self, data: &[u8]) -> GadgetResult<()> {
        self.enqueue_parts(&[data])
    }

    /// Queue one segment made of `header` immediately followed by `data`.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::QueueFull`] once `capacity` segments are queued.
    pub fn enqueue_lead(&mut self, header: &[u8], data: &[u8]) -> GadgetResult<()> {
        self.enqueue_parts(&[header, data])
    }

    fn enqueue_parts(&mut self, parts: &[&[u8]]) -> GadgetResult<()> {
        if self.segments.len() >= self.capacity {
            return Err(GadgetError::QueueFull {
                capacity: self.capacity,
            });
        }
        let start = self.staging.len();
        for part in parts {
            self.staging.extend_from_slice(part);
        }
        self.segments.push(start..self.staging.len());
        Ok(())
    }

    /// Submit the queued segments as one chain and wait for its completion.
    ///
    /// Returns the number of bytes the controller reported. An empty queue
    /// submits nothing.
    ///
    /// # Errors
    ///
    /// - [`GadgetError::Cancelled`] if the chain was cancelled or the stream
    ///   stopped while waiting
    /// - [`GadgetError::Transport`] if the chain completed with an error
    /// - [`GadgetError::Timeout`] if no completion arrived in time
    /// - any submission error from the controller
    pub fn submit(&mut self) -> GadgetResult<usize> {
        if self.segments.is_empty() {
            return Ok(0);
        }

        // Late completions from an earlier timed-out chain must not occupy
        // the slot this chain's completion needs.
        while let Ok((stale, _)) = self.completion_rx.try_recv() {
            trace!(stale, "discarded late completion");
        }

        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let tx = self.completion_tx.clone();
        let on_complete = Box::new(move |status: TransferStatus| {
            if tx.try_send((seq, status)).is_err() {
                trace!(seq, "completion slot busy, dropping");
            }
        });

        let segments: Vec<&[u8]> = self
            .segments
            .iter()
            .map(|range| &self.staging[range.clone()])
            .collect();
        trace!(
            seq,
            segments = segments.len(),
            bytes = self.staging.len(),
            "submitting chain"
        );
        self.transport
            .submit_chain(self.endpoint, &segments, on_complete)?;

        self.wait_for(seq)
    }

    fn wait_for(&self, seq: u64) -> GadgetResult<usize> {
        let deadline = Instant::now() + self.wait.timeout;
        loop {
            match self.completion_rx.recv_timeout(self.wait.poll) {
                Ok((done, status)) if done == seq => {
                    return match status {
                        TransferStatus::Completed { transferred } => Ok(transferred),
                        TransferStatus::Cancelled => {
                            debug!(seq, "chain cancelled");
                            Err(GadgetError::Cancelled)
                        }
                        TransferStatus::Error(code) => {
                            warn!(seq, code, "chain completed with error");
                            Err(GadgetError::transport(self.endpoint.number(), code))
                        }
                    };
                }
                Ok((stale, _)) => {
                    trace!(stale, seq, "discarded late completion");
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.state.is_active() {
                        debug!(seq, "stream stopped while waiting for completion");
                        return Err(GadgetError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        warn!(seq, timeout = ?self.wait.timeout, "chain completion timed out");
                        if let Err(e) = self.transport.cancel_all(self.endpoint) {
                            warn!(error = %e, "failed to cancel timed-out chain");
                        }
                        return Err(GadgetError::Timeout(self.wait.timeout));
                    }
                }
                // The queue owns a sender, so the channel cannot disconnect.
                Err(RecvTimeoutError::Disconnected) => return Err(GadgetError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CompletionMode, MockDeviceController};

    fn queue(mock: &MockDeviceController, capacity: usize) -> (PayloadQueue, Arc<StreamState>) {
        let state = Arc::new(StreamState::new());
        let _ = state.start();
        let queue = PayloadQueue::new(
            Transport::new(Arc::new(mock.clone())),
            Endpoint::new(1),
            capacity,
            8,
            CompletionWait {
                timeout: Duration::from_millis(200),
                poll: Duration::from_millis(5),
            },
            Arc::clone(&state),
        );
        (queue, state)
    }

    #[test]
    fn test_enqueue_respects_capacity() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let (mut q, _state) = queue(&mock, 2);

        q.enqueue(&[1])?;
        q.enqueue_lead(&[0x02, 0x80], &[2])?;
        assert_eq!(
            q.enqueue(&[3]),
            Err(GadgetError::QueueFull { capacity: 2 })
        );

        q.reset();
        assert!(q.is_empty());
        q.enqueue(&[4])?;
        Ok(())
    }

    #[test]
    fn test_submit_preserves_order() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let (mut q, _state) = queue(&mock, 4);

        q.enqueue_lead(&[0x02, 0x80], &[1, 2])?;
        q.enqueue(&[3, 4, 5])?;
        q.enqueue(&[6])?;
        assert_eq!(q.submit()?, 8);

        let chains = mock.chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(
            chains[0].segments,
            vec![vec![0x02, 0x80, 1, 2], vec![3, 4, 5], vec![6]]
        );
        Ok(())
    }

    #[test]
    fn test_empty_submit_is_noop() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        let (mut q, _state) = queue(&mock, 4);
        assert_eq!(q.submit()?, 0);
        assert!(mock.chains().is_empty());
        Ok(())
    }

    #[test]
    fn test_error_completion_maps_to_transport_error() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        mock.fail_next_chain(-22);
        let (mut q, _state) = queue(&mock, 4);

        q.enqueue(&[1])?;
        assert_eq!(q.submit(), Err(GadgetError::transport(1, -22)));
        Ok(())
    }

    #[test]
    fn test_timeout_cancels_chain() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        mock.set_completion_mode(CompletionMode::Manual);
        let (mut q, _state) = queue(&mock, 4);

        q.enqueue(&[1])?;
        assert_eq!(q.submit(), Err(GadgetError::Timeout(Duration::from_millis(200))));
        assert_eq!(mock.cancel_count(Endpoint::new(1)), 1);
        Ok(())
    }

    #[test]
    fn test_stopped_stream_releases_wait() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        mock.set_completion_mode(CompletionMode::Manual);
        let (mut q, state) = queue(&mock, 4);
        let _ = state.stop();

        q.enqueue(&[1])?;
        assert_eq!(q.submit(), Err(GadgetError::Cancelled));
        Ok(())
    }

    #[test]
    fn test_late_completion_is_discarded() -> GadgetResult<()> {
        let mock = MockDeviceController::new();
        mock.set_completion_mode(CompletionMode::Manual);
        let (mut q, _state) = queue(&mock, 4);

        q.enqueue(&[1])?;
        assert!(matches!(q.submit(), Err(GadgetError::Timeout(_))));

        // The first chain's completion was consumed by the cancel; the second
        // chain completes normally.
        mock.set_completion_mode(CompletionMode::Immediate);
        q.reset();
        q.enqueue(&[2, 3])?;
        assert_eq!(q.submit()?, 2);
        Ok(())
    }
}
