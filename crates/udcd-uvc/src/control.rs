//! EP0 request handling for the video function.
//!
//! Class requests on the streaming interface negotiate the probe/commit
//! control block. A SET_CUR has a data stage, so the handler only starts the
//! EP0 receive; [`ControlStateMachine::complete_set_cur`] runs when the
//! controller completes it. Standard requests that halt or de-select the
//! streaming interface run the video-abort.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use udcd_uvc_protocol::{
    DESCRIPTOR_TYPE_DEBUG, FEATURE_ENDPOINT_HALT, INPUT_TERMINAL_ID, INTERFACE_CONTROL_ID,
    OUTPUT_TERMINAL_ID, SetupPacket, StreamingControl, UvcRequest, VsControl, info_caps, lookup,
    request_type, standard_request,
};

use crate::error::GadgetResult;
use crate::session::Session;
use crate::transport::{Endpoint, TransferStatus};

/// How a request was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Answered or acted on.
    Handled,
    /// Not addressed to this function; the USB stack should handle it.
    Ignored,
    /// Refused; EP0 has been stalled.
    Stalled,
}

/// Whether an EP0 data stage is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    AwaitingSetCurPayload,
}

/// Control-endpoint state machine over a shared [`Session`].
#[derive(Debug, Clone)]
pub struct ControlStateMachine {
    session: Arc<Session>,
}

impl ControlStateMachine {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> ControlState {
        if self.session.has_pending_control_transfer() {
            ControlState::AwaitingSetCurPayload
        } else {
            ControlState::Idle
        }
    }

    /// Dispatch one setup packet.
    pub fn handle_request(&self, setup: &SetupPacket) -> ControlOutcome {
        trace!(?setup, "control request");

        let result = match setup.request_type {
            request_type::CLASS_INTERFACE_IN | request_type::CLASS_INTERFACE_OUT => {
                self.handle_class(setup)
            }
            request_type::STANDARD_INTERFACE_OUT => Ok(self.handle_standard_interface(setup)),
            request_type::STANDARD_ENDPOINT_OUT => Ok(self.handle_standard_endpoint(setup)),
            request_type::STANDARD_DEVICE_IN => Ok(self.handle_standard_device(setup)),
            _ => Ok(ControlOutcome::Ignored),
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, ?setup, "control request failed");
            self.stall()
        })
    }

    fn handle_class(&self, setup: &SetupPacket) -> GadgetResult<ControlOutcome> {
        let config = self.session.config();
        let interface = setup.interface_number();
        if interface == config.stream_interface {
            self.handle_streaming(setup)
        } else if interface == config.control_interface {
            Ok(self.handle_control_entity(setup))
        } else {
            debug!(interface, "class request for unknown interface");
            Ok(ControlOutcome::Ignored)
        }
    }

    fn handle_control_entity(&self, setup: &SetupPacket) -> ControlOutcome {
        match setup.entity_id() {
            INTERFACE_CONTROL_ID => debug!(request = setup.request, "interface control request"),
            INPUT_TERMINAL_ID => debug!(request = setup.request, "input terminal request"),
            OUTPUT_TERMINAL_ID => debug!(request = setup.request, "output terminal request"),
            entity => debug!(entity, request = setup.request, "request for unknown entity"),
        }
        ControlOutcome::Handled
    }

    fn handle_streaming(&self, setup: &SetupPacket) -> GadgetResult<ControlOutcome> {
        let selector = match VsControl::try_from(setup.control_selector()) {
            Ok(s @ (VsControl::Probe | VsControl::Commit)) => s,
            Ok(other) => {
                debug!(?other, "unsupported streaming control");
                return Ok(self.stall());
            }
            Err(e) => {
                debug!(error = %e, "unknown streaming control");
                return Ok(self.stall());
            }
        };
        let request = match UvcRequest::try_from(setup.request) {
            Ok(r) if r.is_get() == setup.is_device_to_host() => r,
            Ok(r) => {
                debug!(?r, "request direction mismatch");
                return Ok(self.stall());
            }
            Err(e) => {
                debug!(error = %e, "unknown class request");
                return Ok(self.stall());
            }
        };
        debug!(?selector, ?request, length = setup.length, "streaming request");

        let version = self.session.control_version();
        match (request, selector) {
            (UvcRequest::GetInfo, _) => {
                self.reply(setup, &[info_caps::SUPPORTS_GET | info_caps::SUPPORTS_SET])
            }
            (UvcRequest::GetLen, _) => {
                let len = u16::try_from(version.len()).unwrap_or(u16::MAX);
                self.reply(setup, &len.to_le_bytes())
            }
            (UvcRequest::GetMin | UvcRequest::GetMax | UvcRequest::GetDef, VsControl::Probe) => {
                self.reply(setup, &self.session.default_control().to_bytes(version))
            }
            (UvcRequest::GetCur, _) => {
                self.reply(setup, &self.session.current_control().to_bytes(version))
            }
            (UvcRequest::SetCur, _) => self.begin_set_cur(setup),
            _ => Ok(self.stall()),
        }
    }

    fn handle_standard_interface(&self, setup: &SetupPacket) -> ControlOutcome {
        if setup.request != standard_request::SET_INTERFACE {
            return ControlOutcome::Ignored;
        }
        let interface = setup.interface_number();
        if interface != self.session.config().stream_interface {
            return ControlOutcome::Ignored;
        }
        info!(interface, alt = setup.value, "SET_INTERFACE");
        if setup.value == 0 {
            self.session.video_abort();
        }
        ControlOutcome::Handled
    }

    fn handle_standard_endpoint(&self, setup: &SetupPacket) -> ControlOutcome {
        if setup.request != standard_request::CLEAR_FEATURE || setup.value != FEATURE_ENDPOINT_HALT
        {
            return ControlOutcome::Ignored;
        }
        let endpoint = setup.endpoint_number();
        if endpoint != self.session.video_endpoint().number() {
            return ControlOutcome::Ignored;
        }
        info!(endpoint, "CLEAR_FEATURE(ENDPOINT_HALT)");
        self.session.video_abort();
        ControlOutcome::Handled
    }

    fn handle_standard_device(&self, setup: &SetupPacket) -> ControlOutcome {
        if setup.request == standard_request::GET_DESCRIPTOR
            && setup.descriptor_type() == DESCRIPTOR_TYPE_DEBUG
        {
            debug!("refusing debug descriptor");
            return self.stall();
        }
        ControlOutcome::Ignored
    }

    fn begin_set_cur(&self, setup: &SetupPacket) -> GadgetResult<ControlOutcome> {
        let len = self.session.begin_control_transfer(*setup);
        let machine = self.clone();
        self.session.transport().receive(
            Endpoint::CONTROL,
            len,
            Box::new(move |status, data| {
                machine.complete_set_cur(status, data);
            }),
        )?;
        Ok(ControlOutcome::Handled)
    }

    /// Finish a SET_CUR once its data stage has been received.
    ///
    /// Out-of-range format or frame indices stall EP0 and leave the current
    /// control untouched. A Commit with valid indices starts the stream.
    pub fn complete_set_cur(&self, status: TransferStatus, data: &[u8]) -> ControlOutcome {
        let Some(pending) = self.session.finish_control_transfer(data) else {
            debug!("SET_CUR data without a pending request");
            return ControlOutcome::Ignored;
        };
        if !matches!(status, TransferStatus::Completed { .. }) {
            warn!(?status, "SET_CUR data stage failed");
            return ControlOutcome::Ignored;
        }

        let requested = match StreamingControl::parse(pending.data()) {
            Ok(control) => control,
            Err(e) => {
                warn!(error = %e, "malformed SET_CUR payload");
                return self.stall();
            }
        };
        if let Err(e) = lookup(requested.format_index, requested.frame_index) {
            warn!(error = %e, "rejecting SET_CUR");
            return self.stall();
        }

        let current = self.session.update_current(|current| {
            current.apply_selection(&requested);
            *current
        });

        if pending.setup.control_selector() == VsControl::Commit as u8 {
            info!(
                format = current.format_index,
                frame = current.frame_index,
                interval = current.frame_interval,
                "commit"
            );
            self.session.start_streaming();
        } else {
            debug!(
                format = current.format_index,
                frame = current.frame_index,
                interval = current.frame_interval,
                "probe"
            );
        }
        ControlOutcome::Handled
    }

    fn reply(&self, setup: &SetupPacket, bytes: &[u8]) -> GadgetResult<ControlOutcome> {
        let len = bytes.len().min(usize::from(setup.length));
        self.session
            .transport()
            .send(Endpoint::CONTROL, &bytes[..len])?;
        Ok(ControlOutcome::Handled)
    }

    fn stall(&self) -> ControlOutcome {
        if let Err(e) = self.session.transport().stall(Endpoint::CONTROL) {
            warn!(error = %e, "failed to stall EP0");
        }
        ControlOutcome::Stalled
    }
}

#[cfg(test)]
mod tests {
    use udcd_uvc_protocol::STREAMING_CONTROL_LEN_V1_1;

    use super::*;
    use crate::config::GadgetConfig;
    use crate::mock::MockDeviceController;

    fn machine() -> GadgetResult<(ControlStateMachine, MockDeviceController)> {
        let mock = MockDeviceController::new();
        let session = Session::new(GadgetConfig::default(), Arc::new(mock.clone()))?;
        Ok((ControlStateMachine::new(session), mock))
    }

    fn get(request: UvcRequest, control: VsControl, length: u16) -> SetupPacket {
        SetupPacket::class_streaming(request, control, 1, length)
    }

    #[test]
    fn test_get_info_and_len() -> GadgetResult<()> {
        let (m, mock) = machine()?;

        assert_eq!(
            m.handle_request(&get(UvcRequest::GetInfo, VsControl::Probe, 1)),
            ControlOutcome::Handled
        );
        assert_eq!(
            m.handle_request(&get(UvcRequest::GetLen, VsControl::Commit, 2)),
            ControlOutcome::Handled
        );
        assert_eq!(
            mock.take_sent(Endpoint::CONTROL),
            vec![vec![0x03], vec![STREAMING_CONTROL_LEN_V1_1 as u8, 0]]
        );
        Ok(())
    }

    #[test]
    fn test_reply_truncated_to_w_length() -> GadgetResult<()> {
        let (m, mock) = machine()?;
        m.handle_request(&get(UvcRequest::GetCur, VsControl::Probe, 26));
        let sent = mock.take_sent(Endpoint::CONTROL);
        assert_eq!(sent[0].len(), 26);
        Ok(())
    }

    #[test]
    fn test_get_res_and_commit_min_stall() -> GadgetResult<()> {
        let (m, mock) = machine()?;
        assert_eq!(
            m.handle_request(&get(UvcRequest::GetRes, VsControl::Probe, 34)),
            ControlOutcome::Stalled
        );
        assert_eq!(
            m.handle_request(&get(UvcRequest::GetMin, VsControl::Commit, 34)),
            ControlOutcome::Stalled
        );
        assert_eq!(mock.stall_count(Endpoint::CONTROL), 2);
        Ok(())
    }

    #[test]
    fn test_set_cur_awaits_payload() -> GadgetResult<()> {
        let (m, mock) = machine()?;
        let setup = SetupPacket::class_streaming(UvcRequest::SetCur, VsControl::Probe, 1, 34);

        assert_eq!(m.handle_request(&setup), ControlOutcome::Handled);
        assert_eq!(m.state(), ControlState::AwaitingSetCurPayload);

        let requested = StreamingControl {
            format_index: 1,
            frame_index: 4,
            frame_interval: 333_333,
            ..StreamingControl::default()
        };
        assert!(mock.deliver_control_data(&requested.to_bytes(m.session().control_version())));
        assert_eq!(m.state(), ControlState::Idle);

        let current = m.session().current_control();
        assert_eq!(current.frame_index, 4);
        assert_eq!(current.frame_interval, 333_333);
        assert_eq!(current.max_payload_transfer_size, 16 * 1024);
        assert!(!m.session().is_streaming());
        Ok(())
    }

    #[test]
    fn test_short_payload_stalls() -> GadgetResult<()> {
        let (m, mock) = machine()?;
        let setup = SetupPacket::class_streaming(UvcRequest::SetCur, VsControl::Commit, 1, 34);
        m.handle_request(&setup);
        assert!(mock.deliver_control_data(&[1, 0, 1, 1]));
        assert_eq!(mock.stall_count(Endpoint::CONTROL), 1);
        assert!(!m.session().is_streaming());
        Ok(())
    }

    #[test]
    fn test_entity_requests_are_acknowledged() -> GadgetResult<()> {
        let (m, mock) = machine()?;
        let setup = SetupPacket::new(request_type::CLASS_INTERFACE_IN, 0x81, 0x0200, 0x0100, 2);
        assert_eq!(m.handle_request(&setup), ControlOutcome::Handled);
        assert!(mock.take_sent(Endpoint::CONTROL).is_empty());
        Ok(())
    }

    #[test]
    fn test_debug_descriptor_is_refused() -> GadgetResult<()> {
        let (m, _mock) = machine()?;
        let debug = SetupPacket::new(request_type::STANDARD_DEVICE_IN, 0x06, 0x0A00, 0, 4);
        assert_eq!(m.handle_request(&debug), ControlOutcome::Stalled);

        let device = SetupPacket::new(request_type::STANDARD_DEVICE_IN, 0x06, 0x0100, 0, 18);
        assert_eq!(m.handle_request(&device), ControlOutcome::Ignored);
        Ok(())
    }

    #[test]
    fn test_set_interface_nonzero_alt_keeps_stream() -> GadgetResult<()> {
        let (m, _mock) = machine()?;
        m.session().start_streaming();

        let alt1 = SetupPacket::new(request_type::STANDARD_INTERFACE_OUT, 0x0B, 1, 1, 0);
        assert_eq!(m.handle_request(&alt1), ControlOutcome::Handled);
        assert!(m.session().is_streaming());

        let other_if = SetupPacket::new(request_type::STANDARD_INTERFACE_OUT, 0x0B, 0, 0, 0);
        assert_eq!(m.handle_request(&other_if), ControlOutcome::Ignored);
        assert!(m.session().is_streaming());

        let alt0 = SetupPacket::new(request_type::STANDARD_INTERFACE_OUT, 0x0B, 0, 1, 0);
        assert_eq!(m.handle_request(&alt0), ControlOutcome::Handled);
        assert!(!m.session().is_streaming());
        Ok(())
    }
}
