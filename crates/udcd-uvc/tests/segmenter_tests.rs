//! Property tests for frame segmentation over the recording controller.

use std::sync::Arc;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use udcd_uvc::mock::{MockDeviceController, SubmittedChain};
use udcd_uvc::protocol::{FrameId, HeaderFormat, flags};
use udcd_uvc::{FrameSegmenter, GadgetConfig, GadgetResult, Session, transfer_count};

#[derive(Debug, Clone, Copy)]
struct Geometry {
    header_format: HeaderFormat,
    max_packet: u16,
    max_payload: u32,
}

fn arb_geometry() -> impl Strategy<Value = Geometry> {
    (
        prop_oneof![Just(HeaderFormat::Compact), Just(HeaderFormat::Legacy)],
        16u16..=128,
        1u32..=8,
        0u32..16,
    )
        .prop_map(|(header_format, max_packet, packets, extra)| Geometry {
            header_format,
            max_packet,
            max_payload: u32::from(max_packet) * packets + extra,
        })
}

fn send(geometry: Geometry, frame_id: FrameId, data: &[u8]) -> GadgetResult<Vec<SubmittedChain>> {
    let mock = MockDeviceController::new();
    let config = GadgetConfig::builder()
        .header_format(geometry.header_format)
        .max_packet_size(geometry.max_packet)
        .max_payload_transfer_size(geometry.max_payload)
        .build()?;
    let session = Session::new(config, Arc::new(mock.clone()))?;
    session.start_streaming();

    let mut segmenter = FrameSegmenter::for_session(&session)?;
    segmenter.transfer_frame(frame_id, data)?;
    Ok(mock.chains())
}

fn run(
    geometry: Geometry,
    frame_id: FrameId,
    data: &[u8],
) -> Result<Vec<SubmittedChain>, TestCaseError> {
    send(geometry, frame_id, data).map_err(|e| TestCaseError::fail(e.to_string()))
}

fn header_flags(chain: &SubmittedChain) -> u8 {
    chain.segments.first().and_then(|s| s.get(1)).copied().unwrap_or(0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// One chain per payload transfer, as many as `transfer_count` predicts.
    #[test]
    fn prop_chain_count_matches_transfer_count(
        geometry in arb_geometry(),
        data in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let chains = run(geometry, FrameId::ZERO, &data)?;
        let expected = transfer_count(
            geometry.header_format,
            geometry.max_payload as usize,
            data.len(),
        );
        prop_assert_eq!(chains.len(), expected);
    }

    /// EOF is set on the last transfer only and every transfer carries the
    /// frame's FID.
    #[test]
    fn prop_eof_last_and_fid_constant(
        geometry in arb_geometry(),
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        odd in any::<bool>(),
    ) {
        let frame_id = if odd { FrameId::ZERO.toggled() } else { FrameId::ZERO };
        let chains = run(geometry, frame_id, &data)?;
        prop_assert!(!chains.is_empty());

        let last = chains.len() - 1;
        for (i, chain) in chains.iter().enumerate() {
            let bits = header_flags(chain);
            prop_assert_eq!(bits & flags::EOF != 0, i == last);
            prop_assert_eq!(bits & flags::FID, frame_id.bit());
            prop_assert_eq!(bits & flags::EOH, flags::EOH);
        }
    }

    /// Stripping each transfer's header and concatenating gives the frame back.
    #[test]
    fn prop_data_reassembles(
        geometry in arb_geometry(),
        data in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let chains = run(geometry, FrameId::ZERO, &data)?;
        let header_len = geometry.header_format.len();

        let mut reassembled = Vec::with_capacity(data.len());
        for chain in &chains {
            let payload = chain.payload();
            prop_assert_eq!(payload.first().copied(), u8::try_from(header_len).ok());
            reassembled.extend_from_slice(&payload[header_len..]);
        }
        prop_assert_eq!(reassembled, data);
    }

    /// Transfers fit the payload limit and packets fit the endpoint.
    #[test]
    fn prop_sizes_within_limits(
        geometry in arb_geometry(),
        data in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let chains = run(geometry, FrameId::ZERO, &data)?;
        for chain in &chains {
            prop_assert!(chain.len() <= geometry.max_payload as usize);
            for segment in &chain.segments {
                prop_assert!(!segment.is_empty());
                prop_assert!(segment.len() <= usize::from(geometry.max_packet));
            }
        }
    }
}

#[test]
fn test_full_frame_at_default_geometry() -> GadgetResult<()> {
    let data = vec![0x5A; 783_360];
    let geometry = Geometry {
        header_format: HeaderFormat::Compact,
        max_packet: 512,
        max_payload: 16 * 1024,
    };
    let chains = send(geometry, FrameId::ZERO, &data)?;

    assert_eq!(chains.len(), 48);
    assert!(chains[..47].iter().all(|c| c.len() == 16 * 1024));
    assert_eq!(chains[47].len(), 783_360 - 47 * 16_382 + 2);
    assert!(chains[..47].iter().all(|c| c.segments.len() == 32));
    Ok(())
}
