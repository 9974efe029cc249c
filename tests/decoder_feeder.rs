mod common;

use std::error::Error;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use common::{codec_params, wait_until};
use vpp::codec::Decoder;
use vpp::frame::PixelFormat;
use vpp::hal::virtual_hw::{read_marker, LoopbackCodec, MemoryPacketSource};
use vpp::hal::PacketSource;
use vpp::pipeline::{Module, PipeIdAllocator};
use vpp::VppError;

fn decoder(codec: &std::sync::Arc<LoopbackCodec>) -> Decoder {
    Decoder::new(codec.clone(), PipeIdAllocator::new()).with_feed_interval(Duration::from_millis(1))
}

#[test]
fn feeder_loops_over_the_stream() -> Result<(), Box<dyn Error>> {
    let codec = LoopbackCodec::new();
    let decoder = decoder(&codec);
    let source = MemoryPacketSource::numbered(5);
    let rewinds = source.rewind_counter();

    let frames = decoder.open(codec_params(), Some(Box::new(source)))?;
    assert_eq!(frames, Some(5));

    assert!(wait_until(Duration::from_secs(5), || {
        rewinds.load(Ordering::Relaxed) >= 2
    }));

    // Output ids count up per decoder, payloads cycle through the stream
    let mut last_id = None;
    for _ in 0..6 {
        let frame = decoder.get_frame(0, 1000)?;
        assert_eq!(frame.format(), PixelFormat::Nv12);
        let marker = frame.plane(0).and_then(read_marker);
        assert!(matches!(marker, Some(m) if m < 5), "{marker:?}");
        if let Some(prev) = last_id {
            assert!(frame.frame_id() > prev);
        }
        last_id = Some(frame.frame_id());
        decoder.return_frame(frame, 0)?;
    }

    decoder.close()?;
    let stopped = rewinds.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(rewinds.load(Ordering::Relaxed), stopped);
    assert_eq!(codec.active(), 0);
    Ok(())
}

#[test]
fn manual_decoding_with_end_of_stream() -> Result<(), Box<dyn Error>> {
    use vpp::frame::Frame;

    let codec = LoopbackCodec::new();
    let decoder = decoder(&codec);
    assert_eq!(decoder.open(codec_params(), None)?, None);

    let params = codec_params();
    let payload: &[u8] = &[7, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3];
    let mut packet = Frame::from_planes(
        params.width,
        params.height,
        PixelFormat::H264,
        &[payload],
    )?;
    decoder.set_frame(&packet)?;
    if let Some(plane) = packet.plane_mut(0) {
        plane[0] = 8;
    }
    decoder.set_frame_eos(&packet, true)?;

    for expected in [7u64, 8] {
        let frame = decoder.get_frame(0, 1000)?;
        assert_eq!(frame.plane(0).and_then(read_marker), Some(expected));
        decoder.return_frame(frame, 0)?;
    }
    assert!(decoder.get_frame(0, 10).unwrap_err().is_timeout());
    assert_eq!(codec.returned(), 2);
    decoder.close()?;
    Ok(())
}

struct BrokenSource;

impl PacketSource for BrokenSource {
    fn open(&mut self) -> vpp::Result<u64> {
        Err(VppError::InvalidArgument("no such stream".into()))
    }

    fn read_packet(&mut self) -> vpp::Result<Option<Bytes>> {
        Ok(None)
    }

    fn rewind(&mut self) -> vpp::Result<()> {
        Ok(())
    }
}

#[test]
fn unreadable_stream_fails_open() {
    let codec = LoopbackCodec::new();
    let pipes = PipeIdAllocator::new();
    let decoder = Decoder::new(codec.clone(), pipes.clone());

    assert!(matches!(
        decoder.open(codec_params(), Some(Box::new(BrokenSource))),
        Err(VppError::InvalidArgument(_))
    ));
    assert!(!decoder.is_open());
    assert_eq!(codec.active(), 0);
    assert_eq!(pipes.in_use(), 0);
}
