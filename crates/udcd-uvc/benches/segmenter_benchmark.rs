//! Benchmarks for frame segmentation and pixel conversion.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use udcd_uvc::display::current_framebuffer;
use udcd_uvc::mock::{MockDeviceController, MockDisplay};
use udcd_uvc::protocol::{FrameId, HeaderFormat, PixelFormat};
use udcd_uvc::{
    FrameSegmenter, GadgetConfig, PixelConverter, Session, SoftwareConverter, transfer_count,
};

fn bench_transfer_count(c: &mut Criterion) {
    c.bench_function("transfer_count_960x544", |b| {
        b.iter(|| {
            black_box(transfer_count(
                black_box(HeaderFormat::Compact),
                black_box(16 * 1024),
                black_box(783_360),
            ))
        });
    });
}

fn bench_transfer_frame(c: &mut Criterion) {
    let mock = MockDeviceController::new();
    let Ok(session) = Session::new(GadgetConfig::default(), Arc::new(mock.clone())) else {
        return;
    };
    session.start_streaming();
    let Ok(mut segmenter) = FrameSegmenter::for_session(&session) else {
        return;
    };
    let frame = vec![0x80u8; 783_360];
    let mut frame_id = FrameId::ZERO;

    c.bench_function("transfer_frame_960x544_nv12", |b| {
        b.iter(|| {
            let _ = black_box(segmenter.transfer_frame(frame_id, black_box(&frame)));
            frame_id.toggle();
            mock.clear_chains();
        });
    });
}

fn bench_convert_nv12(c: &mut Criterion) {
    let display = MockDisplay::solid(960, 544, [0x40, 0x80, 0xC0]);
    let Ok(source) = current_framebuffer(&display) else {
        return;
    };
    let converter = SoftwareConverter::new();
    let mut frame = vec![0u8; 783_360];

    c.bench_function("convert_960x544_nv12", |b| {
        b.iter(|| {
            let _ = black_box(converter.convert(&mut frame, PixelFormat::Nv12, 960, 544, &source));
        });
    });
}

criterion_group!(
    benches,
    bench_transfer_count,
    bench_transfer_frame,
    bench_convert_nv12
);
criterion_main!(benches);
