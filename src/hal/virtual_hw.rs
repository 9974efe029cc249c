//! Software stand-ins for the capture, codec and display drivers.
//!
//! They keep the same buffer discipline as the real hardware (fixed rings,
//! explicit release) so pipelines behave the same way without a board.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::{
    CodecBackend, CodecRole, CodecSetup, DisplayBackend, Layer, MemAllocator, PacketSource,
    SensorConfig, Stage, VideoFlowConfig, VideoInput,
};
use crate::capture::channel::Size;
use crate::display::GLYPH_WIDTH;
use crate::error::{Result, VppError};
use crate::frame::{BufferDescriptor, PhysAddr, PixelFormat};
use crate::pipeline::FrameRing;
use crate::utils::{lock, now_us};

const PAGE: u64 = 4096;

/// Bytes at the start of plane 0 that carry the frame id
pub const MARKER_LEN: usize = 8;

/// Frame id stamped into the first bytes of plane 0 by the virtual producers.
pub fn read_marker(data: &[u8]) -> Option<u64> {
    let bytes: [u8; MARKER_LEN] = data.get(..MARKER_LEN)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

fn write_marker(buf: &mut BufferDescriptor, id: u64) {
    if let Some(plane) = buf.planes.first_mut() {
        if plane.data.len() >= MARKER_LEN {
            plane.data[..MARKER_LEN].copy_from_slice(&id.to_le_bytes());
        }
    }
}

fn timeout_err(op: &'static str, timeout_ms: u32) -> VppError {
    VppError::Timeout { op, timeout_ms }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Heap allocator handing out fake physical addresses
pub struct HeapAllocator {
    live: AtomicUsize,
    allocs: AtomicUsize,
    fail_after: AtomicUsize,
    next_phys: AtomicU64,
}

impl HeapAllocator {
    pub fn new() -> Arc<Self> {
        Self::failing_after(usize::MAX)
    }

    /// Allocator whose allocations fail once `n` have succeeded.
    pub fn failing_after(n: usize) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            allocs: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(n),
            next_phys: AtomicU64::new(0x1000_0000),
        })
    }

    /// Buffers allocated and not yet freed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl MemAllocator for HeapAllocator {
    fn alloc(&self, width: u32, height: u32, format: PixelFormat) -> Result<BufferDescriptor> {
        let n = self.allocs.fetch_add(1, Ordering::AcqRel);
        if n >= self.fail_after.load(Ordering::Acquire) {
            return Err(VppError::Alloc(format!(
                "{width}x{height} {format:?}: out of memory"
            )));
        }
        let mut buf = BufferDescriptor::alloc(width, height, format);
        for plane in &mut buf.planes {
            let len = (plane.data.len() as u64).div_ceil(PAGE) * PAGE;
            plane.phys = PhysAddr::new(self.next_phys.fetch_add(len.max(PAGE), Ordering::Relaxed));
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(buf)
    }

    fn free(&self, _buf: BufferDescriptor) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Driver call that can be made to fail in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOp {
    Init,
    Start,
}

struct StageStream {
    ring: FrameRing,
    bufs: Mutex<Vec<Option<BufferDescriptor>>>,
    next_id: AtomicU64,
    interval: Option<Duration>,
    next_due: Mutex<Instant>,
    /// Input pictures waiting to be scaled (scaler-only mode)
    fed: Option<(Sender<u64>, Receiver<u64>)>,
}

impl StageStream {
    fn new(size: Size, format: PixelFormat, flow: &VideoFlowConfig, fed: bool) -> Result<Self> {
        let depth = flow.ring_depth;
        let bufs = (0..depth)
            .map(|slot| {
                let mut buf = BufferDescriptor::alloc(size.width, size.height, format);
                buf.slot = slot;
                Some(buf)
            })
            .collect();
        Ok(Self {
            ring: FrameRing::new(depth)?,
            bufs: Mutex::new(bufs),
            next_id: AtomicU64::new(0),
            interval: (flow.fps > 0).then(|| Duration::from_secs(1) / flow.fps),
            next_due: Mutex::new(Instant::now()),
            fed: fed.then(|| flume::bounded(depth as usize)),
        })
    }

    /// Wait until the next picture is due. Returns false if that is past the timeout.
    fn pace(&self, timeout: Duration) -> bool {
        let Some(interval) = self.interval else {
            return true;
        };
        let wait = {
            let mut due = lock(&self.next_due);
            let now = Instant::now();
            let wait = due.saturating_duration_since(now);
            if wait > timeout {
                return false;
            }
            *due = (*due).max(now) + interval;
            wait
        };
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        true
    }
}

#[derive(Default)]
struct CaptureState {
    flow: Option<VideoFlowConfig>,
    streams: HashMap<(Stage, u32), Arc<StageStream>>,
    running: HashMap<Stage, bool>,
}

/// Capture pipeline producing numbered test pictures
pub struct VirtualCamera {
    sensors: Vec<SensorConfig>,
    state: Mutex<CaptureState>,
    events: Mutex<Vec<String>>,
    fail: Mutex<Option<(HwOp, Stage)>>,
}

impl VirtualCamera {
    /// One 1920x1080 sensor on MIPI host 0.
    pub fn new() -> Arc<Self> {
        Self::with_sensors(vec![SensorConfig {
            name: "virtual-imx219".into(),
            mipi_host: 0,
            width: 1920,
            height: 1080,
            fps: 30,
        }])
    }

    pub fn with_sensors(sensors: Vec<SensorConfig>) -> Arc<Self> {
        Arc::new(Self {
            sensors,
            state: Mutex::new(CaptureState::default()),
            events: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
        })
    }

    /// Make the next `op` on `stage` fail with a driver error.
    pub fn fail_next(&self, op: HwOp, stage: Stage) {
        *lock(&self.fail) = Some((op, stage));
    }

    /// Driver calls so far, e.g. `"init isp"`, `"stop vse"`
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    /// Skip `n` frame ids on a stream, as if the hardware dropped them.
    pub fn skip_frames(&self, stage: Stage, channel: u32, n: u64) {
        if let Some(stream) = lock(&self.state).streams.get(&(stage, channel)) {
            stream.next_id.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Buffers of a stream currently held by consumers
    pub fn outstanding(&self, stage: Stage, channel: u32) -> u32 {
        lock(&self.state)
            .streams
            .get(&(stage, channel))
            .map(|s| s.ring.outstanding())
            .unwrap_or(0)
    }

    fn record(&self, op: &str, stage: Stage) {
        lock(&self.events).push(format!("{op} {stage}"));
    }

    fn check_fail(&self, op: HwOp, stage: Stage) -> Result<()> {
        let mut fail = lock(&self.fail);
        if *fail == Some((op, stage)) {
            fail.take();
            warn!(%stage, "injected {op:?} failure");
            return Err(VppError::hw(
                match op {
                    HwOp::Init => "stage init",
                    HwOp::Start => "stage start",
                },
                -1,
            ));
        }
        Ok(())
    }

    fn stream(&self, stage: Stage, channel: u32, op: &'static str) -> Result<Arc<StageStream>> {
        let state = lock(&self.state);
        if !state.running.get(&stage).copied().unwrap_or(false) {
            return Err(VppError::hw(op, -1));
        }
        state
            .streams
            .get(&(stage, channel))
            .cloned()
            .ok_or(VppError::hw(op, -22))
    }
}

impl VideoInput for VirtualCamera {
    fn probe_sensor(&self, mipi_host: u8) -> Option<SensorConfig> {
        self.sensors.iter().find(|s| s.mipi_host == mipi_host).cloned()
    }

    fn init_stage(&self, stage: Stage, flow: &VideoFlowConfig) -> Result<()> {
        self.check_fail(HwOp::Init, stage)?;
        let mut streams = Vec::new();
        match stage {
            Stage::Raw | Stage::Isp => {
                let sensor = flow
                    .sensor
                    .as_ref()
                    .ok_or_else(|| VppError::InvalidArgument(format!("{stage} needs a sensor")))?;
                let size = Size::new(sensor.width, sensor.height);
                let format = if stage == Stage::Raw {
                    PixelFormat::Raw16
                } else {
                    PixelFormat::Nv12
                };
                streams.push((0, StageStream::new(size, format, flow, false)?));
            }
            Stage::Scaler => {
                for (chn, attr) in flow.channels.enabled() {
                    let stream = StageStream::new(attr.target, attr.format, flow, flow.scaler_only())?;
                    streams.push((chn, stream));
                }
            }
        }
        let mut state = lock(&self.state);
        for (chn, stream) in streams {
            state.streams.insert((stage, chn), Arc::new(stream));
        }
        state.flow = Some(flow.clone());
        state.running.insert(stage, false);
        drop(state);
        self.record("init", stage);
        Ok(())
    }

    fn start_stage(&self, stage: Stage) -> Result<()> {
        self.check_fail(HwOp::Start, stage)?;
        lock(&self.state).running.insert(stage, true);
        self.record("start", stage);
        Ok(())
    }

    fn stop_stage(&self, stage: Stage) -> Result<()> {
        lock(&self.state).running.insert(stage, false);
        self.record("stop", stage);
        Ok(())
    }

    fn deinit_stage(&self, stage: Stage) -> Result<()> {
        let mut state = lock(&self.state);
        state.streams.retain(|(s, _), _| *s != stage);
        state.running.remove(&stage);
        if state.running.is_empty() {
            state.flow = None;
        }
        drop(state);
        self.record("deinit", stage);
        Ok(())
    }

    fn get_frame(&self, stage: Stage, channel: u32, timeout_ms: u32) -> Result<BufferDescriptor> {
        let op = "get frame";
        let stream = self.stream(stage, channel, op)?;
        let timeout = Duration::from_millis(timeout_ms as u64);
        let start = Instant::now();

        let slot = stream
            .ring
            .acquire(timeout)
            .map_err(|_| timeout_err(op, timeout_ms))?;
        let remaining = timeout.saturating_sub(start.elapsed());

        let produced = match &stream.fed {
            Some((_, rx)) => match rx.recv_timeout(remaining) {
                Ok(_) => true,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
            },
            None => stream.pace(remaining),
        };
        if !produced {
            stream.ring.release(slot)?;
            return Err(timeout_err(op, timeout_ms));
        }

        let buf = lock(&stream.bufs).get_mut(slot as usize).and_then(Option::take);
        let Some(mut buf) = buf else {
            stream.ring.release(slot)?;
            return Err(VppError::hw(op, -14));
        };
        let id = stream.next_id.fetch_add(1, Ordering::AcqRel);
        buf.frame_id = id;
        buf.timestamp_us = now_us();
        write_marker(&mut buf, id);
        Ok(buf)
    }

    fn release_frame(&self, stage: Stage, channel: u32, buf: BufferDescriptor) -> Result<()> {
        let stream = lock(&self.state).streams.get(&(stage, channel)).cloned();
        let Some(stream) = stream else {
            debug!(%stage, channel, "release after deinit, buffer dropped");
            return Ok(());
        };
        let slot = buf.slot;
        match lock(&stream.bufs).get_mut(slot as usize) {
            Some(entry) if entry.is_none() => *entry = Some(buf),
            _ => return Err(VppError::hw("release frame", -22)),
        }
        stream.ring.release(slot)
    }

    fn send_frame(&self, stage: Stage, buf: &BufferDescriptor) -> Result<()> {
        let state = lock(&self.state);
        let input = state
            .flow
            .as_ref()
            .filter(|f| f.scaler_only() && stage == Stage::Scaler)
            .map(|f| f.input)
            .ok_or(VppError::hw("send frame", -1))?;
        if (buf.width, buf.height) != (input.width, input.height) {
            return Err(VppError::InvalidArgument(format!(
                "input {}x{} does not match {input}",
                buf.width, buf.height
            )));
        }
        for ((s, _), stream) in &state.streams {
            if *s != Stage::Scaler {
                continue;
            }
            if let Some((tx, _)) = &stream.fed {
                // Outputs nobody collects are overwritten, like the hardware does
                let _ = tx.try_send(buf.frame_id);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Payload bytes an encoded picture keeps from its input
const ENCODED_PREFIX: usize = 64;

struct CodecCtx {
    setup: CodecSetup,
    started: AtomicBool,
    input_tx: Sender<BufferDescriptor>,
    input_rx: Receiver<BufferDescriptor>,
    output_tx: Sender<BufferDescriptor>,
    output_rx: Receiver<BufferDescriptor>,
}

/// Codec that "encodes" by truncating and "decodes" by expanding again.
///
/// The frame marker survives an encode → decode round trip.
pub struct LoopbackCodec {
    depth: usize,
    ctxs: Mutex<HashMap<u8, Arc<CodecCtx>>>,
    fail_start: AtomicBool,
    dropped: AtomicU64,
    returned: AtomicU64,
}

impl LoopbackCodec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            depth: 4,
            ctxs: Mutex::new(HashMap::new()),
            fail_start: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        })
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::Release);
    }

    /// Contexts currently configured
    pub fn active(&self) -> usize {
        lock(&self.ctxs).len()
    }

    /// Outputs overwritten because nobody dequeued them
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Outputs queued back by consumers
    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    fn ctx(&self, pipe_id: u8, op: &'static str) -> Result<Arc<CodecCtx>> {
        lock(&self.ctxs)
            .get(&pipe_id)
            .cloned()
            .ok_or(VppError::hw(op, -22))
    }

    fn transform(setup: &CodecSetup, input: &BufferDescriptor) -> BufferDescriptor {
        let mut out = match setup.role {
            CodecRole::Encode => {
                let src = input.planes.first().map(|p| &p.data[..]).unwrap_or(&[]);
                let len = src.len().min(ENCODED_PREFIX);
                let mut out = BufferDescriptor::alloc(setup.width, setup.height, setup.codec.format());
                if let Some(plane) = out.planes.first_mut() {
                    plane.data = BytesMut::from(&src[..len]);
                }
                out
            }
            CodecRole::Decode => {
                let mut out = BufferDescriptor::alloc(setup.width, setup.height, PixelFormat::Nv12);
                if let (Some(dst), Some(src)) = (out.planes.first_mut(), input.planes.first()) {
                    let len = src.data.len().min(dst.data.len());
                    dst.data[..len].copy_from_slice(&src.data[..len]);
                }
                out
            }
        };
        out.frame_id = input.frame_id;
        out.timestamp_us = input.timestamp_us;
        out
    }
}

impl CodecBackend for LoopbackCodec {
    fn configure(&self, pipe_id: u8, setup: &CodecSetup) -> Result<()> {
        let mut ctxs = lock(&self.ctxs);
        if ctxs.contains_key(&pipe_id) {
            return Err(VppError::hw("codec configure", -16));
        }
        let in_format = match setup.role {
            CodecRole::Encode => PixelFormat::Nv12,
            CodecRole::Decode => setup.codec.format(),
        };
        let (input_tx, input_rx) = flume::bounded(self.depth);
        for slot in 0..self.depth as u32 {
            let mut buf = BufferDescriptor::alloc(setup.width, setup.height, in_format);
            buf.slot = slot;
            let _ = input_tx.try_send(buf);
        }
        let (output_tx, output_rx) = flume::bounded(self.depth);
        ctxs.insert(
            pipe_id,
            Arc::new(CodecCtx {
                setup: *setup,
                started: AtomicBool::new(false),
                input_tx,
                input_rx,
                output_tx,
                output_rx,
            }),
        );
        debug!(pipe_id, ?setup, "codec configured");
        Ok(())
    }

    fn start(&self, pipe_id: u8) -> Result<()> {
        if self.fail_start.swap(false, Ordering::AcqRel) {
            warn!(pipe_id, "injected codec start failure");
            return Err(VppError::hw("codec start", -1));
        }
        self.ctx(pipe_id, "codec start")?
            .started
            .store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self, pipe_id: u8) -> Result<()> {
        self.ctx(pipe_id, "codec stop")?
            .started
            .store(false, Ordering::Release);
        Ok(())
    }

    fn release(&self, pipe_id: u8) -> Result<()> {
        lock(&self.ctxs)
            .remove(&pipe_id)
            .map(|_| ())
            .ok_or(VppError::hw("codec release", -22))
    }

    fn dequeue_input(&self, pipe_id: u8, timeout_ms: u32) -> Result<BufferDescriptor> {
        let ctx = self.ctx(pipe_id, "dequeue input")?;
        if !ctx.started.load(Ordering::Acquire) {
            return Err(VppError::hw("dequeue input", -1));
        }
        ctx.input_rx
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(|_| timeout_err("dequeue input", timeout_ms))
    }

    fn queue_input(&self, pipe_id: u8, mut buf: BufferDescriptor, eos: bool) -> Result<()> {
        let ctx = self.ctx(pipe_id, "queue input")?;
        if eos {
            debug!(pipe_id, "end of stream queued");
        }
        let out = Self::transform(&ctx.setup, &buf);
        if let Err(flume::TrySendError::Full(out)) = ctx.output_tx.try_send(out) {
            let _ = ctx.output_rx.try_recv();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = ctx.output_tx.try_send(out);
        }

        // Restore the full input size a decoder may have trimmed
        let sizes = buf.format.plane_sizes(buf.width, buf.height);
        for (plane, size) in buf.planes.iter_mut().zip(sizes) {
            plane.data.resize(size, 0);
        }
        ctx.input_tx
            .try_send(buf)
            .map_err(|_| VppError::hw("queue input", -12))
    }

    fn dequeue_output(&self, pipe_id: u8, timeout_ms: u32) -> Result<BufferDescriptor> {
        let ctx = self.ctx(pipe_id, "dequeue output")?;
        ctx.output_rx
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(|_| timeout_err("dequeue output", timeout_ms))
    }

    fn queue_output(&self, pipe_id: u8, _buf: BufferDescriptor) -> Result<()> {
        self.ctx(pipe_id, "queue output")?;
        self.returned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DisplayState {
    size: Option<(u32, u32)>,
    presented: [u64; 2],
    frame_ids: Vec<u64>,
    texts: Vec<String>,
}

/// Display that records what it is asked to show
pub struct VirtualDisplay {
    state: Mutex<DisplayState>,
}

impl VirtualDisplay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DisplayState::default()),
        })
    }

    pub fn is_up(&self) -> bool {
        lock(&self.state).size.is_some()
    }

    pub fn presented(&self, layer: Layer) -> u64 {
        lock(&self.state).presented[layer as usize]
    }

    /// Frame markers of every video frame presented, in order
    pub fn frame_markers(&self) -> Vec<u64> {
        lock(&self.state).frame_ids.clone()
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.state).texts.clone()
    }
}

impl DisplayBackend for VirtualDisplay {
    fn init(&self, width: u32, height: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if state.size.is_some() {
            return Err(VppError::hw("display init", -16));
        }
        state.size = Some((width, height));
        info!(width, height, "virtual display up");
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        lock(&self.state).size = None;
        Ok(())
    }

    fn present(&self, layer: Layer, buf: &BufferDescriptor) -> Result<()> {
        let mut state = lock(&self.state);
        if state.size.is_none() {
            return Err(VppError::hw("display present", -1));
        }
        state.presented[layer as usize] += 1;
        if layer == Layer::Video {
            let marker = buf.planes.first().and_then(|p| read_marker(&p.data));
            state.frame_ids.push(marker.unwrap_or(buf.frame_id));
        }
        Ok(())
    }

    fn render_text(
        &self,
        overlay: &mut BufferDescriptor,
        x: u32,
        y: u32,
        text: &str,
        color: u32,
        line_width: u32,
    ) -> Result<()> {
        let cell = GLYPH_WIDTH * line_width.max(1);
        let (w, h) = (overlay.width, overlay.height);
        let Some(plane) = overlay.planes.first_mut() else {
            return Err(VppError::InvalidArgument("overlay has no plane".into()));
        };
        // Each glyph is drawn as a solid bar along the top of its cell
        for (i, ch) in text.chars().enumerate() {
            if ch.is_whitespace() {
                continue;
            }
            let x0 = x + i as u32 * cell;
            for py in y..(y + line_width.max(1)).min(h) {
                for px in x0..(x0 + cell).min(w) {
                    let off = ((py * w + px) * 4) as usize;
                    if let Some(dst) = plane.data.get_mut(off..off + 4) {
                        dst.copy_from_slice(&color.to_le_bytes());
                    }
                }
            }
        }
        lock(&self.state).texts.push(text.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Packet stream held in memory
pub struct MemoryPacketSource {
    packets: Vec<Bytes>,
    pos: usize,
    rewinds: Arc<AtomicUsize>,
}

impl MemoryPacketSource {
    pub fn new(packets: Vec<Bytes>) -> Self {
        Self {
            packets,
            pos: 0,
            rewinds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `count` packets carrying the markers `0..count`
    pub fn numbered(count: u64) -> Self {
        Self::new(
            (0..count)
                .map(|id| Bytes::copy_from_slice(&id.to_le_bytes()))
                .collect(),
        )
    }

    /// Shared counter of rewinds, readable after the source moved into a decoder
    pub fn rewind_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.rewinds)
    }
}

impl PacketSource for MemoryPacketSource {
    fn open(&mut self) -> Result<u64> {
        self.pos = 0;
        Ok(self.packets.len() as u64)
    }

    fn read_packet(&mut self) -> Result<Option<Bytes>> {
        let packet = self.packets.get(self.pos).cloned();
        if packet.is_some() {
            self.pos += 1;
        }
        Ok(packet)
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        self.rewinds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::channel::ChannelTable;

    fn flow(fps: u32) -> VideoFlowConfig {
        let input = Size::new(64, 32);
        VideoFlowConfig {
            pipe_id: 0,
            sensor: Some(SensorConfig {
                name: "t".into(),
                mipi_host: 0,
                width: 64,
                height: 32,
                fps,
            }),
            fps,
            input,
            channels: ChannelTable::plan(input, &[Size::new(32, 16)]).unwrap(),
            ring_depth: 2,
        }
    }

    #[test]
    fn ring_exhaustion_times_out() {
        let cam = VirtualCamera::new();
        let flow = flow(0);
        cam.init_stage(Stage::Scaler, &flow).unwrap();
        cam.start_stage(Stage::Scaler).unwrap();

        let a = cam.get_frame(Stage::Scaler, 0, 10).unwrap();
        let b = cam.get_frame(Stage::Scaler, 0, 10).unwrap();
        assert_eq!((a.frame_id, b.frame_id), (0, 1));
        assert_eq!(read_marker(&a.planes[0].data), Some(0));
        assert!(cam.get_frame(Stage::Scaler, 0, 10).unwrap_err().is_timeout());

        cam.release_frame(Stage::Scaler, 0, a).unwrap();
        assert_eq!(cam.get_frame(Stage::Scaler, 0, 10).unwrap().frame_id, 2);
        assert_eq!(cam.outstanding(Stage::Scaler, 0), 2);
        drop(b);
    }

    #[test]
    fn stopped_stage_refuses_frames() {
        let cam = VirtualCamera::new();
        cam.init_stage(Stage::Scaler, &flow(0)).unwrap();
        assert!(matches!(
            cam.get_frame(Stage::Scaler, 0, 10),
            Err(VppError::Hardware { .. })
        ));
    }

    #[test]
    fn loopback_round_trip_keeps_marker() {
        let codec = LoopbackCodec::new();
        let setup = |role| CodecSetup {
            role,
            codec: crate::codec::CodecType::H264,
            width: 16,
            height: 16,
            bitrate_kbps: 100,
            fps: 30,
        };
        codec.configure(0, &setup(CodecRole::Encode)).unwrap();
        codec.configure(1, &setup(CodecRole::Decode)).unwrap();
        codec.start(0).unwrap();
        codec.start(1).unwrap();

        let mut input = codec.dequeue_input(0, 10).unwrap();
        write_marker(&mut input, 42);
        codec.queue_input(0, input, false).unwrap();
        let packet = codec.dequeue_output(0, 10).unwrap();
        assert_eq!(packet.format, PixelFormat::H264);
        assert_eq!(packet.planes[0].data.len(), ENCODED_PREFIX);

        let mut input = codec.dequeue_input(1, 10).unwrap();
        input.copy_from(&packet).unwrap();
        codec.queue_input(1, input, false).unwrap();
        let picture = codec.dequeue_output(1, 10).unwrap();
        assert_eq!(read_marker(&picture.planes[0].data), Some(42));
        assert_eq!(picture.format, PixelFormat::Nv12);
    }

    #[test]
    fn allocator_failure_injection() {
        let alloc = HeapAllocator::failing_after(1);
        let a = alloc.alloc(4, 4, PixelFormat::Nv12).unwrap();
        assert_ne!(a.planes[0].phys, a.planes[1].phys);
        assert!(matches!(
            alloc.alloc(4, 4, PixelFormat::Nv12),
            Err(VppError::Alloc(_))
        ));
        assert_eq!(alloc.live(), 1);
        alloc.free(a);
        assert_eq!(alloc.live(), 0);
    }
}
