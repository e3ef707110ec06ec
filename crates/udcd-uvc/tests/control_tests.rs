//! Probe/commit negotiation scenarios over the control state machine.

use std::sync::Arc;

use udcd_uvc::mock::MockDeviceController;
use udcd_uvc::protocol::{
    ControlVersion, SetupPacket, StreamingControl, UvcRequest, VsControl, request_type,
};
use udcd_uvc::{
    ControlOutcome, ControlStateMachine, Endpoint, GadgetConfig, GadgetResult, Session,
};

fn machine_with(
    config: GadgetConfig,
) -> GadgetResult<(ControlStateMachine, MockDeviceController)> {
    let mock = MockDeviceController::new();
    let session = Session::new(config, Arc::new(mock.clone()))?;
    Ok((ControlStateMachine::new(session), mock))
}

fn machine() -> GadgetResult<(ControlStateMachine, MockDeviceController)> {
    machine_with(GadgetConfig::default())
}

fn get(
    m: &ControlStateMachine,
    mock: &MockDeviceController,
    request: UvcRequest,
    control: VsControl,
) -> Vec<u8> {
    let setup = SetupPacket::class_streaming(request, control, 1, 64);
    assert_eq!(m.handle_request(&setup), ControlOutcome::Handled);
    let mut sent = mock.take_sent(Endpoint::CONTROL);
    assert_eq!(sent.len(), 1);
    sent.remove(0)
}

fn set_cur(
    m: &ControlStateMachine,
    mock: &MockDeviceController,
    control: VsControl,
    payload: &StreamingControl,
) {
    let version = m.session().control_version();
    let len = u16::try_from(version.len()).unwrap_or(u16::MAX);
    let setup = SetupPacket::class_streaming(UvcRequest::SetCur, control, 1, len);
    assert_eq!(m.handle_request(&setup), ControlOutcome::Handled);
    assert!(mock.deliver_control_data(&payload.to_bytes(version)));
}

#[test]
fn test_min_max_def_identical_before_set_cur() -> GadgetResult<()> {
    let (m, mock) = machine()?;

    let min = get(&m, &mock, UvcRequest::GetMin, VsControl::Probe);
    let max = get(&m, &mock, UvcRequest::GetMax, VsControl::Probe);
    let def = get(&m, &mock, UvcRequest::GetDef, VsControl::Probe);
    let cur = get(&m, &mock, UvcRequest::GetCur, VsControl::Probe);

    assert_eq!(min, max);
    assert_eq!(max, def);
    assert_eq!(def, cur);
    assert_eq!(def.len(), 34);
    Ok(())
}

#[test]
fn test_get_cur_after_commit_returns_written_bytes() -> GadgetResult<()> {
    let (m, mock) = machine()?;
    let requested = StreamingControl {
        frame_index: 2,
        frame_interval: 333_333,
        ..m.session().default_control()
    };

    set_cur(&m, &mock, VsControl::Probe, &requested);
    assert!(!m.session().is_streaming());
    assert_eq!(
        get(&m, &mock, UvcRequest::GetCur, VsControl::Probe),
        requested.to_bytes(ControlVersion::V1_1)
    );

    set_cur(&m, &mock, VsControl::Commit, &requested);
    assert!(m.session().is_streaming());
    assert_eq!(
        get(&m, &mock, UvcRequest::GetCur, VsControl::Commit),
        requested.to_bytes(ControlVersion::V1_1)
    );

    // Defaults are not affected by negotiation.
    let def = get(&m, &mock, UvcRequest::GetDef, VsControl::Probe);
    assert_eq!(StreamingControl::parse(&def)?.frame_index, 1);
    Ok(())
}

#[test]
fn test_set_cur_copies_only_selection_fields() -> GadgetResult<()> {
    let (m, mock) = machine()?;
    let requested = StreamingControl {
        format_index: 1,
        frame_index: 3,
        frame_interval: 166_666,
        max_payload_transfer_size: 3072,
        max_video_frame_size: 1,
        key_frame_rate: 9,
        ..StreamingControl::default()
    };
    set_cur(&m, &mock, VsControl::Probe, &requested);

    let current = m.session().current_control();
    assert_eq!(current.frame_index, 3);
    assert_eq!(current.max_payload_transfer_size, 16 * 1024);
    assert_eq!(current.max_video_frame_size, 783_360);
    assert_eq!(current.key_frame_rate, 0);
    Ok(())
}

#[test]
fn test_invalid_indices_are_rejected() -> GadgetResult<()> {
    let (m, mock) = machine()?;
    let before = m.session().current_control();

    for (format_index, frame_index) in [(2, 1), (1, 0), (1, 5), (0, 0)] {
        let requested = StreamingControl {
            format_index,
            frame_index,
            ..before
        };
        set_cur(&m, &mock, VsControl::Commit, &requested);
    }

    assert_eq!(mock.stall_count(Endpoint::CONTROL), 4);
    assert_eq!(m.session().current_control(), before);
    assert!(!m.session().is_streaming());
    Ok(())
}

#[test]
fn test_clear_feature_abort_is_idempotent() -> GadgetResult<()> {
    let (m, mock) = machine()?;
    m.session().start_streaming();

    let clear_halt = SetupPacket::new(request_type::STANDARD_ENDPOINT_OUT, 0x01, 0, 0x81, 0);
    assert_eq!(m.handle_request(&clear_halt), ControlOutcome::Handled);
    assert!(!m.session().is_streaming());
    assert_eq!(m.handle_request(&clear_halt), ControlOutcome::Handled);

    assert_eq!(mock.cancel_count(Endpoint::new(1)), 1);
    assert_eq!(mock.fifo_clear_count(Endpoint::new(1)), 1);
    assert_eq!(m.session().stats().snapshot().aborts, 1);
    Ok(())
}

#[test]
fn test_clear_feature_on_other_endpoint_is_ignored() -> GadgetResult<()> {
    let (m, _mock) = machine()?;
    m.session().start_streaming();

    let clear_ep2 = SetupPacket::new(request_type::STANDARD_ENDPOINT_OUT, 0x01, 0, 0x82, 0);
    assert_eq!(m.handle_request(&clear_ep2), ControlOutcome::Ignored);
    assert!(m.session().is_streaming());
    Ok(())
}

#[test]
fn test_uvc_1_0_control_length() -> GadgetResult<()> {
    let config = GadgetConfig::builder()
        .control_version(ControlVersion::V1_0)
        .build()?;
    let (m, mock) = machine_with(config)?;

    assert_eq!(get(&m, &mock, UvcRequest::GetLen, VsControl::Probe), vec![26, 0]);
    assert_eq!(get(&m, &mock, UvcRequest::GetDef, VsControl::Probe).len(), 26);

    let requested = StreamingControl {
        frame_index: 4,
        ..m.session().default_control()
    };
    set_cur(&m, &mock, VsControl::Commit, &requested);
    assert_eq!(m.session().current_control().frame_index, 4);
    assert!(m.session().is_streaming());
    Ok(())
}

#[test]
fn test_second_set_cur_replaces_pending_transfer() -> GadgetResult<()> {
    let (m, mock) = machine()?;
    let probe = SetupPacket::class_streaming(UvcRequest::SetCur, VsControl::Probe, 1, 34);
    let commit = SetupPacket::class_streaming(UvcRequest::SetCur, VsControl::Commit, 1, 34);
    m.handle_request(&probe);
    m.handle_request(&commit);

    let payload = m.session().default_control().to_bytes(ControlVersion::V1_1);
    // The first data stage completes the replacement; the second finds nothing pending.
    assert!(mock.deliver_control_data(&payload));
    assert!(m.session().is_streaming());
    assert!(mock.deliver_control_data(&payload));
    assert_eq!(mock.stall_count(Endpoint::CONTROL), 0);
    Ok(())
}
