//! Hardware encoder and decoder stages

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, VppError};
use crate::frame::{BufferDescriptor, Frame, Origin, PhysAddr, PixelFormat, PlaneDesc};
use crate::hal::{CodecBackend, CodecRole, CodecSetup, PacketSource};
use crate::pipeline::binder::CancelToken;
use crate::pipeline::{Module, ModuleCore, ModuleKind, PipeIdAllocator, PipeIdLease, DEFAULT_TIMEOUT_MS};
use crate::utils::{now_us, read, write};
use crate::CodecConfig;

/// Interval between two packets pushed by the decoder feeder
pub const FEED_INTERVAL: Duration = Duration::from_millis(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecType {
    #[default]
    H264,
    H265,
    Mjpeg,
}

impl CodecType {
    /// Map the integer codes used by callers: 1 = H.264, 2 = H.265, 3 = MJPEG.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(CodecType::H264),
            2 => Ok(CodecType::H265),
            3 => Ok(CodecType::Mjpeg),
            other => Err(VppError::InvalidArgument(format!(
                "codec type {other} not supported, use 1 (H264), 2 (H265) or 3 (MJPEG)"
            ))),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            CodecType::H264 => 1,
            CodecType::H265 => 2,
            CodecType::Mjpeg => 3,
        }
    }

    /// Format of the compressed stream
    pub fn format(self) -> PixelFormat {
        match self {
            CodecType::H264 => PixelFormat::H264,
            CodecType::H265 => PixelFormat::H265,
            CodecType::Mjpeg => PixelFormat::Mjpeg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParams {
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in kbps, ignored by decoders
    pub bitrate_kbps: u32,
    pub fps: u32,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            codec: CodecType::H264,
            width: 1920,
            height: 1080,
            bitrate_kbps: 8000,
            fps: 30,
        }
    }
}

impl From<&CodecConfig> for CodecParams {
    fn from(cfg: &CodecConfig) -> Self {
        Self {
            codec: cfg.codec,
            width: cfg.width,
            height: cfg.height,
            bitrate_kbps: cfg.bitrate_kbps,
            fps: cfg.fps,
        }
    }
}

impl CodecParams {
    fn setup(&self, role: CodecRole) -> Result<CodecSetup> {
        if self.width == 0 || self.height == 0 {
            return Err(VppError::InvalidArgument(format!(
                "codec size {}x{}",
                self.width, self.height
            )));
        }
        Ok(CodecSetup {
            role,
            codec: self.codec,
            width: self.width,
            height: self.height,
            bitrate_kbps: self.bitrate_kbps,
            fps: self.fps,
        })
    }
}

/// Running codec context on a held pipeline id.
///
/// Dropping it stops and releases the context, then gives the id back.
struct CodecSession {
    backend: Arc<dyn CodecBackend>,
    setup: CodecSetup,
    started: bool,
    pipe: PipeIdLease,
}

impl CodecSession {
    fn open(
        backend: &Arc<dyn CodecBackend>,
        pipes: &Arc<PipeIdAllocator>,
        setup: CodecSetup,
    ) -> Result<Self> {
        let pipe = pipes.acquire()?;
        let pipe_id = pipe.id();
        backend.configure(pipe_id, &setup).map_err(|e| {
            error!(pipe_id, ?setup, "codec config param error: {e}");
            e
        })?;
        let mut session = Self {
            backend: Arc::clone(backend),
            setup,
            started: false,
            pipe,
        };
        session.backend.start(pipe_id).map_err(|e| {
            error!(pipe_id, ?setup, "codec start error: {e}");
            e
        })?;
        session.started = true;
        Ok(session)
    }

    fn pipe_id(&self) -> u8 {
        self.pipe.id()
    }

    fn get_output(&self, timeout_ms: u32) -> Result<BufferDescriptor> {
        self.backend.dequeue_output(self.pipe_id(), timeout_ms)
    }

    fn put_output(&self, buf: BufferDescriptor) -> Result<()> {
        self.backend.queue_output(self.pipe_id(), buf)
    }
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        let pipe_id = self.pipe.id();
        if self.started {
            if let Err(e) = self.backend.stop(pipe_id) {
                warn!(pipe_id, "codec stop: {e}");
            }
        }
        if let Err(e) = self.backend.release(pipe_id) {
            warn!(pipe_id, "codec release: {e}");
        }
        debug!(pipe_id, "codec session closed");
    }
}

/// Copy `src` into an input buffer of the codec and queue it.
///
/// With `trim`, planes of the input buffer are cut to the source length so
/// the codec sees the exact payload size.
fn feed(
    backend: &dyn CodecBackend,
    pipe_id: u8,
    setup: &CodecSetup,
    src: &BufferDescriptor,
    trim: bool,
    eos: bool,
) -> Result<()> {
    let format = match setup.role {
        CodecRole::Encode => PixelFormat::Nv12,
        CodecRole::Decode => setup.codec.format(),
    };
    let sizes = format.plane_sizes(setup.width, setup.height);
    if src.planes.len() > sizes.len() {
        return Err(VppError::InvalidArgument(format!(
            "{} planes, {format:?} input takes {}",
            src.planes.len(),
            sizes.len()
        )));
    }
    for (i, (plane, size)) in src.planes.iter().zip(sizes).enumerate() {
        if plane.data.len() > size {
            return Err(VppError::InvalidArgument(format!(
                "plane {i}: {} bytes do not fit in {size}",
                plane.data.len()
            )));
        }
    }

    let mut input = backend.dequeue_input(pipe_id, DEFAULT_TIMEOUT_MS)?;
    input.copy_from(src)?;
    if trim {
        for (dst, src) in input.planes.iter_mut().zip(&src.planes) {
            dst.data.truncate(src.data.len());
        }
    }
    backend.queue_input(pipe_id, input, eos)
}

fn leased(core: &ModuleCore, buf: BufferDescriptor, channel: u32) -> Frame {
    Frame::leased(
        buf,
        Origin {
            module: core.id(),
            channel,
            stage: 0,
        },
    )
}

/// Hardware video encoder.
///
/// Raw frames go in through `set_frame`, compressed packets come out of
/// `get_frame` on channel 0.
pub struct Encoder {
    core: ModuleCore,
    backend: Arc<dyn CodecBackend>,
    pipes: Arc<PipeIdAllocator>,
    session: RwLock<Option<CodecSession>>,
}

impl Encoder {
    pub fn new(backend: Arc<dyn CodecBackend>, pipes: Arc<PipeIdAllocator>) -> Self {
        Self {
            core: ModuleCore::new(ModuleKind::Encoder, 0, 0),
            backend,
            pipes,
            session: RwLock::new(None),
        }
    }

    /// Acquire a pipeline id and start an encode context.
    ///
    /// Opening an encoder that is already open only warns.
    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn open(&self, params: CodecParams) -> Result<()> {
        let mut session = write(&self.session);
        if let Some(s) = session.as_ref() {
            warn!(
                pipe_id = s.pipe_id(),
                "Encode already init, type:{:?} {}x{} bitrate:{}",
                s.setup.codec,
                s.setup.width,
                s.setup.height,
                s.setup.bitrate_kbps
            );
            return Ok(());
        }
        let opened = CodecSession::open(&self.backend, &self.pipes, params.setup(CodecRole::Encode)?)?;
        self.core.set_size(params.width, params.height);
        info!(
            pipe_id = opened.pipe_id(),
            "encoder open: {:?} {}x{} {} kbps",
            params.codec,
            params.width,
            params.height,
            params.bitrate_kbps
        );
        *session = Some(opened);
        Ok(())
    }

    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn close(&self) -> Result<()> {
        let session = write(&self.session).take();
        match session {
            Some(session) => {
                info!(pipe_id = session.pipe_id(), "encoder closed");
                Ok(())
            }
            None => {
                error!("Encoder was not inited");
                Err(VppError::NotOpen(ModuleKind::Encoder))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        read(&self.session).is_some()
    }

    pub fn pipe_id(&self) -> Option<u8> {
        read(&self.session).as_ref().map(CodecSession::pipe_id)
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.core.shutdown_link();
    }
}

impl Module for Encoder {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn fetch_frame(&self, channel: u32, timeout_ms: u32) -> Result<Frame> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Encoder))?;
        let buf = session.get_output(timeout_ms)?;
        Ok(leased(&self.core, buf, channel))
    }

    fn release_frame(&self, frame: Frame, _channel: u32) -> Result<()> {
        let buf = frame.into_descriptor();
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Encoder))?;
        session.put_output(buf)
    }

    fn push_frame(&self, frame: &Frame) -> Result<()> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Encoder))?;
        feed(
            &*self.backend,
            session.pipe_id(),
            &session.setup,
            frame.descriptor(),
            false,
            false,
        )
    }
}

/// Thread pushing packets of a stream into a decoder
struct Feeder {
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("decoder feeder panicked");
            }
        }
    }
}

struct DecodeSession {
    // Dropped before the codec so the feeder is gone when the context stops
    feeder: Option<Feeder>,
    codec: CodecSession,
}

/// Hardware video decoder.
///
/// Compressed packets go in through `set_frame` (or a [`PacketSource`] fed
/// by a background thread), decoded pictures come out of `get_frame`.
pub struct Decoder {
    core: ModuleCore,
    backend: Arc<dyn CodecBackend>,
    pipes: Arc<PipeIdAllocator>,
    session: RwLock<Option<DecodeSession>>,
    next_frame_id: AtomicU64,
    feed_interval: Duration,
}

impl Decoder {
    pub fn new(backend: Arc<dyn CodecBackend>, pipes: Arc<PipeIdAllocator>) -> Self {
        Self {
            core: ModuleCore::new(ModuleKind::Decoder, 0, 0),
            backend,
            pipes,
            session: RwLock::new(None),
            next_frame_id: AtomicU64::new(0),
            feed_interval: FEED_INTERVAL,
        }
    }

    pub fn with_feed_interval(mut self, interval: Duration) -> Self {
        self.feed_interval = interval;
        self
    }

    /// Acquire a pipeline id and start a decode context.
    ///
    /// With a `source`, a feeder thread opens it and keeps pushing its packets,
    /// looping at end of stream; the frame count of the stream is returned once
    /// the feeder has opened it. Opening a decoder that is already open only
    /// warns.
    #[instrument(skip(self, source), fields(module = %self.core.kind()))]
    pub fn open(
        &self,
        params: CodecParams,
        source: Option<Box<dyn PacketSource>>,
    ) -> Result<Option<u64>> {
        let mut session = write(&self.session);
        if let Some(s) = session.as_ref() {
            warn!(
                pipe_id = s.codec.pipe_id(),
                "Decode already init, type:{:?} {}x{}",
                s.codec.setup.codec,
                s.codec.setup.width,
                s.codec.setup.height
            );
            return Ok(None);
        }

        let codec = CodecSession::open(&self.backend, &self.pipes, params.setup(CodecRole::Decode)?)?;
        let pipe_id = codec.pipe_id();

        let (feeder, frame_count) = match source {
            Some(source) => {
                let (feeder, count) = self.spawn_feeder(pipe_id, codec.setup, source)?;
                (Some(feeder), Some(count))
            }
            None => (None, None),
        };

        self.core.set_size(params.width, params.height);
        info!(
            pipe_id,
            ?frame_count,
            "decoder open: {:?} {}x{}",
            params.codec,
            params.width,
            params.height
        );
        *session = Some(DecodeSession { feeder, codec });
        Ok(frame_count)
    }

    fn spawn_feeder(
        &self,
        pipe_id: u8,
        setup: CodecSetup,
        source: Box<dyn PacketSource>,
    ) -> Result<(Feeder, u64)> {
        let cancel = CancelToken::new();
        let (ready_tx, ready_rx) = flume::bounded(1);
        let handle = {
            let backend = Arc::clone(&self.backend);
            let cancel = cancel.clone();
            let interval = self.feed_interval;
            thread::Builder::new()
                .name(format!("vpp-decode-feed-{pipe_id}"))
                .spawn(move || run_feeder(backend, pipe_id, setup, source, cancel, ready_tx, interval))
                .map_err(|e| VppError::Alloc(format!("spawn decoder feeder: {e}")))?
        };
        let feeder = Feeder {
            cancel,
            handle: Some(handle),
        };
        let count = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                return Err(VppError::InvalidArgument(
                    "decoder feeder exited before opening the stream".into(),
                ))
            }
        };
        Ok((feeder, count))
    }

    /// Stop the feeder, then the codec, then give the pipeline id back.
    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn close(&self) -> Result<()> {
        let session = write(&self.session).take();
        match session {
            Some(session) => {
                let pipe_id = session.codec.pipe_id();
                drop(session);
                info!(pipe_id, "decoder closed");
                Ok(())
            }
            None => {
                error!("Decoder channel does not exist");
                Err(VppError::NotOpen(ModuleKind::Decoder))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        read(&self.session).is_some()
    }

    pub fn pipe_id(&self) -> Option<u8> {
        read(&self.session).as_ref().map(|s| s.codec.pipe_id())
    }

    /// `set_frame` with an explicit end-of-stream flag.
    pub fn set_frame_eos(&self, frame: &Frame, eos: bool) -> Result<()> {
        self.core.ensure_manual_input()?;
        self.push(frame, eos)
    }

    fn push(&self, frame: &Frame, eos: bool) -> Result<()> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Decoder))?;
        feed(
            &*self.backend,
            session.codec.pipe_id(),
            &session.codec.setup,
            frame.descriptor(),
            true,
            eos,
        )
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.core.shutdown_link();
    }
}

impl Module for Decoder {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn fetch_frame(&self, channel: u32, timeout_ms: u32) -> Result<Frame> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Decoder))?;
        let mut buf = session.codec.get_output(timeout_ms)?;
        buf.frame_id = self.next_frame_id.fetch_add(1, Ordering::AcqRel);
        buf.timestamp_us = now_us();
        Ok(leased(&self.core, buf, channel))
    }

    fn release_frame(&self, frame: Frame, _channel: u32) -> Result<()> {
        let buf = frame.into_descriptor();
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Decoder))?;
        session.codec.put_output(buf)
    }

    fn push_frame(&self, frame: &Frame) -> Result<()> {
        self.push(frame, false)
    }
}

fn packet_descriptor(packet: &Bytes, setup: &CodecSetup) -> BufferDescriptor {
    BufferDescriptor {
        planes: vec![PlaneDesc {
            data: BytesMut::from(&packet[..]),
            phys: PhysAddr::default(),
        }],
        width: setup.width,
        height: setup.height,
        format: setup.codec.format(),
        ..Default::default()
    }
}

fn run_feeder(
    backend: Arc<dyn CodecBackend>,
    pipe_id: u8,
    setup: CodecSetup,
    mut source: Box<dyn PacketSource>,
    cancel: CancelToken,
    ready: flume::Sender<Result<u64>>,
    interval: Duration,
) {
    let count = match source.open() {
        Ok(count) => count,
        Err(e) => {
            error!(pipe_id, "failed to open stream: {e}");
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(count));
    drop(ready);

    let mut pending: Option<Bytes> = None;
    let mut fed = 0u64;
    while !cancel.wait(interval) {
        let packet = match pending.take() {
            Some(packet) => packet,
            None => match source.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    warn!(pipe_id, "No more input data available, re-cycling to send again");
                    if let Err(e) = source.rewind() {
                        error!(pipe_id, "failed to rewind stream: {e}");
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(pipe_id, "failed to read packet: {e}");
                    if let Err(e) = source.rewind() {
                        error!(pipe_id, "failed to rewind stream: {e}");
                        break;
                    }
                    continue;
                }
            },
        };

        let desc = packet_descriptor(&packet, &setup);
        match feed(&*backend, pipe_id, &setup, &desc, true, false) {
            Ok(()) => fed += 1,
            Err(e) if e.is_timeout() => pending = Some(packet),
            Err(e) => warn!(pipe_id, "dropping packet: {e}"),
        }
    }
    debug!(pipe_id, fed, "decoder feeder exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::virtual_hw::LoopbackCodec;

    fn encoder(codec: &Arc<LoopbackCodec>, pipes: &Arc<PipeIdAllocator>) -> Encoder {
        let backend: Arc<dyn CodecBackend> = codec.clone();
        Encoder::new(backend, Arc::clone(pipes))
    }

    #[test]
    fn codec_codes() {
        assert_eq!(CodecType::from_code(1).unwrap(), CodecType::H264);
        assert_eq!(CodecType::from_code(2).unwrap(), CodecType::H265);
        assert_eq!(CodecType::from_code(3).unwrap(), CodecType::Mjpeg);
        assert!(CodecType::from_code(0).is_err());
        assert_eq!(CodecType::Mjpeg.code(), 3);
        let p = CodecParams::default();
        assert_eq!((p.width, p.height, p.bitrate_kbps), (1920, 1080, 8000));
    }

    #[test]
    fn reopen_warns_and_keeps_pipe() {
        let codec = LoopbackCodec::new();
        let pipes = PipeIdAllocator::new();
        let enc = encoder(&codec, &pipes);
        enc.open(CodecParams::default()).unwrap();
        enc.open(CodecParams::default()).unwrap();
        assert_eq!(enc.pipe_id(), Some(0));
        assert_eq!(pipes.in_use(), 0b1);

        enc.close().unwrap();
        assert_eq!(pipes.in_use(), 0);
        assert_eq!(codec.active(), 0);
        assert!(matches!(enc.close(), Err(VppError::NotOpen(ModuleKind::Encoder))));
    }

    #[test]
    fn failed_start_releases_everything() {
        let codec = LoopbackCodec::new();
        let pipes = PipeIdAllocator::new();
        let enc = encoder(&codec, &pipes);
        codec.fail_next_start();
        assert!(matches!(
            enc.open(CodecParams::default()),
            Err(VppError::Hardware { .. })
        ));
        assert_eq!(pipes.in_use(), 0);
        assert_eq!(codec.active(), 0);
        assert!(!enc.is_open());
    }

    #[test]
    fn exhausted_pipe_ids_fail_open() {
        let codec = LoopbackCodec::new();
        let pipes = PipeIdAllocator::with_reserved(0xff);
        let enc = encoder(&codec, &pipes);
        assert!(matches!(
            enc.open(CodecParams::default()),
            Err(VppError::NoFreePipeline { .. })
        ));
        assert_eq!(codec.active(), 0);
    }

    #[test]
    fn closed_codec_reports_not_open() {
        let codec = LoopbackCodec::new();
        let enc = encoder(&codec, &PipeIdAllocator::new());
        let frame = Frame::new(16, 16, PixelFormat::Nv12);
        assert!(matches!(enc.set_frame(&frame), Err(VppError::NotOpen(_))));
        assert!(enc.get_frame(0, 10).unwrap_err().is_terminal());
    }

    #[test]
    fn encode_then_fetch() {
        let codec = LoopbackCodec::new();
        let enc = encoder(&codec, &PipeIdAllocator::new());
        enc.open(CodecParams {
            width: 16,
            height: 16,
            ..Default::default()
        })
        .unwrap();

        let mut frame = Frame::new(16, 16, PixelFormat::Nv12);
        if let Some(plane) = frame.plane_mut(0) {
            plane[0] = 9;
        }
        enc.set_frame(&frame).unwrap();
        let packet = enc.get_frame(0, 100).unwrap();
        assert_eq!(packet.format(), PixelFormat::H264);
        assert_eq!(packet.plane(0).map(|p| p[0]), Some(9));
        enc.return_frame(packet, 0).unwrap();
        assert_eq!(codec.returned(), 1);

        // wrong size never reaches the codec
        let big = Frame::new(32, 32, PixelFormat::Nv12);
        assert!(matches!(enc.set_frame(&big), Err(VppError::InvalidArgument(_))));
    }

    #[test]
    fn decoder_ids_are_per_instance() {
        let codec = LoopbackCodec::new();
        let backend: Arc<dyn CodecBackend> = codec.clone();
        let pipes = PipeIdAllocator::new();
        let params = CodecParams {
            width: 16,
            height: 16,
            ..Default::default()
        };
        let a = Decoder::new(Arc::clone(&backend), Arc::clone(&pipes));
        let b = Decoder::new(backend, pipes);
        a.open(params, None).unwrap();
        b.open(params, None).unwrap();

        let packet = Frame::from_planes(16, 16, PixelFormat::H264, &[&[1, 2, 3]]).unwrap();
        for dec in [&a, &a, &b] {
            dec.set_frame_eos(&packet, false).unwrap();
        }
        let f0 = a.get_frame(0, 100).unwrap();
        let f1 = a.get_frame(0, 100).unwrap();
        let g0 = b.get_frame(0, 100).unwrap();
        assert_eq!((f0.frame_id(), f1.frame_id(), g0.frame_id()), (0, 1, 0));
        assert_eq!(f0.plane(0).map(|p| &p[..3]), Some(&[1u8, 2, 3][..]));
        for (dec, f) in [(&a, f0), (&a, f1), (&b, g0)] {
            dec.return_frame(f, 0).unwrap();
        }
    }
}
