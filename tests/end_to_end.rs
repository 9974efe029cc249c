mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{camera_options, codec_params, fast_policy, small_sensor, wait_until, HEIGHT, WIDTH};
use vpp::capture::{Camera, Size};
use vpp::codec::{Decoder, Encoder};
use vpp::display::Display;
use vpp::hal::virtual_hw::{HeapAllocator, LoopbackCodec, VirtualDisplay};
use vpp::hal::{Layer, MemAllocator, Stage};
use vpp::pipeline::{bind_with, unbind, BindState, Module, PipeIdAllocator};

#[test]
fn camera_to_display_keeps_frame_order() -> Result<(), Box<dyn Error>> {
    let heap = HeapAllocator::new();
    let allocator: Arc<dyn MemAllocator> = heap.clone();
    let sensor = small_sensor();
    let codec = LoopbackCodec::new();
    let screen = VirtualDisplay::new();
    let pipes = PipeIdAllocator::new();

    let camera = Arc::new(Camera::new(sensor.clone(), Arc::clone(&allocator)));
    camera.open(&camera_options(&[Size::new(WIDTH, HEIGHT)]))?;
    let encoder = Arc::new(Encoder::new(codec.clone(), Arc::clone(&pipes)));
    encoder.open(codec_params())?;
    let decoder = Arc::new(Decoder::new(codec.clone(), Arc::clone(&pipes)));
    decoder.open(codec_params(), None)?;
    let display = Arc::new(Display::new(screen.clone(), Arc::clone(&allocator)));
    display.open(WIDTH, HEIGHT)?;

    let stages: Vec<Arc<dyn Module>> = vec![
        camera.clone(),
        encoder.clone(),
        decoder.clone(),
        display.clone(),
    ];
    for pair in stages.windows(2) {
        bind_with(Arc::clone(&pair[0]), Arc::clone(&pair[1]), None, fast_policy())?;
    }
    for stage in &stages[1..] {
        assert_eq!(stage.bind_state(), BindState::Bound);
    }

    assert!(wait_until(Duration::from_secs(10), || {
        screen.frame_markers().len() >= 20
    }));

    for pair in stages.windows(2) {
        unbind(pair[0].as_ref(), pair[1].as_ref())?;
    }

    // Frames may be dropped on the way but never reordered
    let markers = screen.frame_markers();
    assert!(markers.windows(2).all(|w| w[0] < w[1]), "{markers:?}");
    assert_eq!(screen.presented(Layer::Video), markers.len() as u64);

    let channel = camera.channel_for(Size::new(WIDTH, HEIGHT))?;
    assert_eq!(sensor.outstanding(Stage::Scaler, channel), 0);

    display.close()?;
    decoder.close()?;
    encoder.close()?;
    camera.close()?;
    assert_eq!(heap.live(), 0);
    assert_eq!(codec.active(), 0);
    assert_eq!(pipes.in_use(), 0);
    Ok(())
}

#[test]
fn direct_binding_sees_every_frame_once() -> Result<(), Box<dyn Error>> {
    let allocator: Arc<dyn MemAllocator> = HeapAllocator::new();
    let sensor = small_sensor();
    let camera = Arc::new(Camera::new(sensor.clone(), Arc::clone(&allocator)));
    camera.open(&camera_options(&[Size::new(WIDTH, HEIGHT)]))?;
    let screen = VirtualDisplay::new();
    let display = Arc::new(Display::new(screen.clone(), Arc::clone(&allocator)));
    display.open(WIDTH, HEIGHT)?;

    let policy = fast_policy();
    let channel = bind_with(camera.clone(), display.clone(), None, policy)?;
    assert!(wait_until(Duration::from_secs(5), || {
        screen.frame_markers().len() >= 10
    }));

    let started = Instant::now();
    unbind(camera.as_ref(), display.as_ref())?;
    assert!(started.elapsed() < Duration::from_millis(policy.timeout_ms as u64 * 5));

    let markers = screen.frame_markers();
    let expected: Vec<u64> = (0..markers.len() as u64).collect();
    assert_eq!(markers, expected);
    assert_eq!(display.core().link_metrics().frames_forwarded, markers.len() as u64);
    assert_eq!(sensor.outstanding(Stage::Scaler, channel), 0);
    Ok(())
}

#[test]
fn scaler_only_camera_feeds_the_display() -> Result<(), Box<dyn Error>> {
    use vpp::capture::{ProcessMode, Rect, ScalerOptions, ScalerOutput};
    use vpp::frame::{Frame, PixelFormat};

    let heap = HeapAllocator::new();
    let allocator: Arc<dyn MemAllocator> = heap.clone();
    let scaler = Arc::new(Camera::new(small_sensor(), Arc::clone(&allocator)));
    scaler.open_scaler(&ScalerOptions {
        pipe_id: 1,
        mode: ProcessMode::Scale,
        input: Size::new(WIDTH, HEIGHT),
        outputs: vec![ScalerOutput {
            dst: Size::new(WIDTH / 2, HEIGHT / 2),
            crop: Rect::default(),
        }],
        ring_depth: 4,
    })?;

    let screen = VirtualDisplay::new();
    let display = Arc::new(Display::new(screen.clone(), Arc::clone(&allocator)));
    display.open(WIDTH / 2, HEIGHT / 2)?;
    bind_with(scaler.clone(), display.clone(), None, fast_policy())?;

    for id in 0..3u64 {
        let mut frame = Frame::new(WIDTH, HEIGHT, PixelFormat::Nv12);
        if let Some(plane) = frame.plane_mut(0) {
            plane[..8].copy_from_slice(&id.to_le_bytes());
        }
        scaler.set_frame(&frame)?;
        assert!(wait_until(Duration::from_secs(5), || {
            screen.presented(Layer::Video) > id
        }));
    }

    unbind(scaler.as_ref(), display.as_ref())?;
    assert_eq!(screen.frame_markers(), vec![0, 1, 2]);

    display.close()?;
    scaler.close()?;
    assert_eq!(heap.live(), 0);
    Ok(())
}
