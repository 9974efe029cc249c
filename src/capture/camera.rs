//! Camera stage: sensor → VIN → ISP → VSE, or the VSE alone

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::channel::{ChannelTable, ProcessMode, ScalerOutput, Size};
use crate::error::{Result, ReturnError, VppError};
use crate::frame::{DropCounter, Frame, Origin, PixelFormat};
use crate::hal::{HwBuffer, MemAllocator, Stage, VideoFlowConfig, VideoInput};
use crate::pipeline::{Module, ModuleCore, ModuleKind};
use crate::utils::{lock, probe_order, read, write};
use crate::CameraConfig;

/// Sensor-fed capture parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraOptions {
    pub pipe_id: u8,
    /// `-1` probes every connector, `0`/`1` pick one
    pub sensor_index: i32,
    pub fps: u32,
    /// One scaler output per entry, `0x0` for the sensor size
    pub channels: Vec<Size>,
    pub ring_depth: u32,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            pipe_id: 0,
            sensor_index: -1,
            fps: 30,
            channels: vec![Size::default()],
            ring_depth: 4,
        }
    }
}

impl From<&CameraConfig> for CameraOptions {
    fn from(cfg: &CameraConfig) -> Self {
        Self {
            pipe_id: 0,
            sensor_index: cfg.sensor_index,
            fps: cfg.fps,
            channels: cfg.channels.iter().map(|&[w, h]| Size::new(w, h)).collect(),
            ring_depth: cfg.ring_depth,
        }
    }
}

/// Scaler-only parameters; input comes from `set_frame`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalerOptions {
    pub pipe_id: u8,
    pub mode: ProcessMode,
    pub input: Size,
    pub outputs: Vec<ScalerOutput>,
    pub ring_depth: u32,
}

/// Capture stages started in order, stopped and torn down in reverse on drop
struct StageChain {
    hw: Arc<dyn VideoInput>,
    inited: Vec<Stage>,
    started: Vec<Stage>,
}

impl StageChain {
    fn bring_up(hw: &Arc<dyn VideoInput>, flow: &VideoFlowConfig, stages: &[Stage]) -> Result<Self> {
        let mut chain = Self {
            hw: Arc::clone(hw),
            inited: Vec::with_capacity(stages.len()),
            started: Vec::with_capacity(stages.len()),
        };
        for &stage in stages {
            hw.init_stage(stage, flow).map_err(|e| {
                error!(%stage, "pipeline init failed: {e}");
                e
            })?;
            chain.inited.push(stage);
        }
        for &stage in stages {
            hw.start_stage(stage).map_err(|e| {
                error!(%stage, "pipeline start failed: {e}");
                e
            })?;
            chain.started.push(stage);
        }
        Ok(chain)
    }
}

impl Drop for StageChain {
    fn drop(&mut self) {
        for stage in self.started.drain(..).rev() {
            if let Err(e) = self.hw.stop_stage(stage) {
                warn!(%stage, "stop: {e}");
            }
        }
        for stage in self.inited.drain(..).rev() {
            if let Err(e) = self.hw.deinit_stage(stage) {
                warn!(%stage, "deinit: {e}");
            }
        }
    }
}

struct CameraSession {
    flow: VideoFlowConfig,
    /// Scaler input buffer in scaler-only mode
    input: Option<Mutex<HwBuffer>>,
    _chain: StageChain,
}

/// Multi-output capture stage.
///
/// Each enabled scaler output is one channel. `get_frame(chn)` reads a scaler
/// output; [`Camera::get_stage_frame`] also reaches the raw and ISP rings.
pub struct Camera {
    core: ModuleCore,
    hw: Arc<dyn VideoInput>,
    allocator: Arc<dyn MemAllocator>,
    session: RwLock<Option<CameraSession>>,
    /// Scaler channels reserved by bindings, one bit each
    claimed: Mutex<u8>,
    drops: Mutex<HashMap<(Stage, u32), DropCounter>>,
}

impl Camera {
    pub fn new(hw: Arc<dyn VideoInput>, allocator: Arc<dyn MemAllocator>) -> Self {
        Self {
            core: ModuleCore::new(ModuleKind::Camera, 0, 0),
            hw,
            allocator,
            session: RwLock::new(None),
            claimed: Mutex::new(0),
            drops: Mutex::new(HashMap::new()),
        }
    }

    /// Probe a sensor, plan one scaler channel per requested size and start
    /// VIN, ISP and VSE in that order.
    ///
    /// Any failure stops and tears down the stages already brought up.
    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn open(&self, opts: &CameraOptions) -> Result<()> {
        let mut session = write(&self.session);
        if session.is_some() {
            warn!(pipe_id = opts.pipe_id, "camera already open");
            return Ok(());
        }

        let sensor = probe_order(opts.sensor_index)?
            .iter()
            .find_map(|&host| self.hw.probe_sensor(host))
            .ok_or_else(|| {
                error!(sensor_index = opts.sensor_index, "no sensor found");
                VppError::hw("probe sensor", -19)
            })?;
        info!(
            sensor = %sensor.name,
            mipi_host = sensor.mipi_host,
            "sensor {}x{}",
            sensor.width,
            sensor.height
        );

        let input = Size::new(sensor.width, sensor.height);
        let flow = VideoFlowConfig {
            pipe_id: opts.pipe_id,
            sensor: Some(sensor),
            fps: opts.fps,
            input,
            channels: ChannelTable::plan(input, &opts.channels)?,
            ring_depth: opts.ring_depth,
        };
        let chain = StageChain::bring_up(&self.hw, &flow, &[Stage::Raw, Stage::Isp, Stage::Scaler])?;

        self.reset(input);
        *session = Some(CameraSession {
            flow,
            input: None,
            _chain: chain,
        });
        Ok(())
    }

    /// Start only the scaler, fed through `set_frame`.
    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn open_scaler(&self, opts: &ScalerOptions) -> Result<()> {
        let mut session = write(&self.session);
        if session.is_some() {
            warn!(pipe_id = opts.pipe_id, "camera already open");
            return Ok(());
        }
        if opts.input.width == 0 || opts.input.height == 0 {
            return Err(VppError::InvalidArgument(format!(
                "scaler input {}",
                opts.input
            )));
        }

        let flow = VideoFlowConfig {
            pipe_id: opts.pipe_id,
            sensor: None,
            fps: 0,
            input: opts.input,
            channels: ChannelTable::plan_scaler(opts.input, opts.mode, &opts.outputs)?,
            ring_depth: opts.ring_depth,
        };
        let chain = StageChain::bring_up(&self.hw, &flow, &[Stage::Scaler])?;
        let input = HwBuffer::alloc(
            &self.allocator,
            opts.input.width,
            opts.input.height,
            PixelFormat::Nv12,
        )
        .map_err(|e| {
            error!("scaler input buffer: {e}");
            e
        })?;

        self.reset(opts.input);
        *session = Some(CameraSession {
            flow,
            input: Some(Mutex::new(input)),
            _chain: chain,
        });
        Ok(())
    }

    fn reset(&self, input: Size) {
        self.core.set_size(input.width, input.height);
        *lock(&self.claimed) = 0;
        lock(&self.drops).clear();
    }

    /// Stop the stages in reverse order and tear them down.
    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn close(&self) -> Result<()> {
        let session = write(&self.session).take();
        match session {
            Some(session) => {
                let pipe_id = session.flow.pipe_id;
                drop(session);
                *lock(&self.claimed) = 0;
                info!(pipe_id, "camera closed");
                Ok(())
            }
            None => Err(VppError::NotOpen(ModuleKind::Camera)),
        }
    }

    pub fn is_open(&self) -> bool {
        read(&self.session).is_some()
    }

    /// Enabled scaler channels and their output size
    pub fn channels(&self) -> Vec<(u32, Size)> {
        read(&self.session)
            .as_ref()
            .map(|s| s.flow.channels.enabled().map(|(i, a)| (i, a.target)).collect())
            .unwrap_or_default()
    }

    /// Scaler channel producing `size`, `0x0` meaning the input size
    pub fn channel_for(&self, size: Size) -> Result<u32> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Camera))?;
        self.find_channel(session, size)
    }

    fn find_channel(&self, session: &CameraSession, size: Size) -> Result<u32> {
        let (w, h) = self.core.size();
        let size = if size.width == 0 || size.height == 0 {
            Size::new(w, h)
        } else {
            size
        };
        session.flow.channels.find(size).ok_or_else(|| {
            error!("get chn from {size} failed");
            VppError::ChannelMismatch {
                width: size.width,
                height: size.height,
            }
        })
    }

    fn stage_channel(&self, session: &CameraSession, stage: Stage, size: Size) -> Result<u32> {
        match stage {
            Stage::Raw | Stage::Isp if session.flow.scaler_only() => {
                Err(VppError::Unsupported("raw and ISP frames need a sensor"))
            }
            Stage::Raw | Stage::Isp => Ok(0),
            Stage::Scaler => self.find_channel(session, size),
        }
    }

    fn origin(&self, stage: Stage, channel: u32) -> Origin {
        Origin {
            module: self.core.id(),
            channel,
            stage: stage as u8,
        }
    }

    /// Frame from one capture stage; the scaler output is picked by size.
    ///
    /// The returned frame carries the number of frames this stage skipped
    /// since the previous call.
    pub fn get_stage_frame(&self, stage: Stage, size: Size, timeout_ms: u32) -> Result<Frame> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Camera))?;
        let channel = self.stage_channel(session, stage, size)?;
        if stage == Stage::Scaler {
            self.core.ensure_manual_output(channel)?;
        }

        let buf = self.hw.get_frame(stage, channel, timeout_ms)?;
        let dropped = lock(&self.drops)
            .entry((stage, channel))
            .or_default()
            .observe(buf.frame_id);
        if dropped > 0 {
            debug!(%stage, channel, dropped, "frames lost");
        }
        let mut frame = Frame::leased(buf, self.origin(stage, channel));
        frame.set_dropped_since_last(dropped);
        Ok(frame)
    }

    /// Give back a frame from [`Camera::get_stage_frame`].
    ///
    /// A frame from another stage or channel is refused and handed back
    /// inside the error.
    pub fn return_stage_frame(
        &self,
        frame: Frame,
        stage: Stage,
        size: Size,
    ) -> Result<(), ReturnError> {
        let session = read(&self.session);
        let Some(session) = session.as_ref() else {
            // Rings went away with the session
            drop(frame.into_descriptor());
            return Err(ReturnError::consumed(VppError::NotOpen(ModuleKind::Camera)));
        };
        let channel = match self.stage_channel(session, stage, size) {
            Ok(channel) => channel,
            Err(e) => return Err(ReturnError::refused(e, frame)),
        };
        if frame.origin() != Some(self.origin(stage, channel)) {
            return Err(ReturnError::refused(VppError::ForeignFrame, frame));
        }
        self.hw
            .release_frame(stage, channel, frame.into_descriptor())
            .map_err(ReturnError::consumed)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.core.shutdown_link();
    }
}

impl Module for Camera {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn fetch_frame(&self, channel: u32, timeout_ms: u32) -> Result<Frame> {
        let session = read(&self.session);
        if session.is_none() {
            return Err(VppError::NotOpen(ModuleKind::Camera));
        }
        let buf = self.hw.get_frame(Stage::Scaler, channel, timeout_ms)?;
        Ok(Frame::leased(buf, self.origin(Stage::Scaler, channel)))
    }

    fn release_frame(&self, frame: Frame, channel: u32) -> Result<()> {
        let stage = frame
            .origin()
            .and_then(|o| Stage::from_index(o.stage))
            .unwrap_or(Stage::Scaler);
        let buf = frame.into_descriptor();
        if read(&self.session).is_none() {
            return Err(VppError::NotOpen(ModuleKind::Camera));
        }
        self.hw.release_frame(stage, channel, buf)
    }

    fn push_frame(&self, frame: &Frame) -> Result<()> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Camera))?;
        let input = session
            .input
            .as_ref()
            .ok_or(VppError::Unsupported("set_frame needs a scaler-only camera"))?;
        let expected = session.flow.input;
        if (frame.width(), frame.height()) != (expected.width, expected.height) {
            return Err(VppError::InvalidArgument(format!(
                "frame {}x{} does not match scaler input {expected}",
                frame.width(),
                frame.height()
            )));
        }
        let mut input = lock(input);
        input.copy_from(frame.descriptor())?;
        self.hw.send_frame(Stage::Scaler, &input)
    }

    /// Reserve the scaler channel whose output is `width` x `height`.
    fn chn_for_bind(&self, width: u32, height: u32) -> Result<u32> {
        let channel = self.channel_for(Size::new(width, height))?;
        let mut claimed = lock(&self.claimed);
        if *claimed & (1 << channel) != 0 {
            error!(channel, "channel already bound");
            return Err(VppError::ChannelBusy { channel });
        }
        *claimed |= 1 << channel;
        Ok(channel)
    }

    fn put_chn_for_unbind(&self, channel: u32) {
        if channel < 8 {
            *lock(&self.claimed) &= !(1u8 << channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::virtual_hw::{HeapAllocator, HwOp, VirtualCamera};

    fn camera(hw: &Arc<VirtualCamera>) -> Camera {
        let input: Arc<dyn VideoInput> = hw.clone();
        Camera::new(input, HeapAllocator::new())
    }

    fn opts(channels: Vec<Size>) -> CameraOptions {
        CameraOptions {
            fps: 0,
            channels,
            ring_depth: 2,
            ..Default::default()
        }
    }

    #[test]
    fn open_starts_stages_in_order_and_close_reverses() {
        let hw = VirtualCamera::new();
        let cam = camera(&hw);
        cam.open(&opts(vec![Size::new(1280, 720)])).unwrap();
        assert_eq!(cam.size(), (1920, 1080));
        assert_eq!(cam.channels(), vec![(0, Size::new(1280, 720))]);
        cam.close().unwrap();

        assert_eq!(
            hw.events(),
            [
                "init vin", "init isp", "init vse", "start vin", "start isp", "start vse",
                "stop vse", "stop isp", "stop vin", "deinit vse", "deinit isp", "deinit vin",
            ]
        );
        assert!(matches!(cam.close(), Err(VppError::NotOpen(ModuleKind::Camera))));
    }

    #[test]
    fn failed_start_unwinds() {
        let hw = VirtualCamera::new();
        hw.fail_next(HwOp::Start, Stage::Isp);
        let cam = camera(&hw);
        assert!(matches!(
            cam.open(&opts(vec![Size::default()])),
            Err(VppError::Hardware { .. })
        ));
        assert!(!cam.is_open());
        assert_eq!(
            hw.events()[3..],
            ["start vin", "stop vin", "deinit vse", "deinit isp", "deinit vin"]
        );
    }

    #[test]
    fn unsupported_size_aborts_before_hardware() {
        let hw = VirtualCamera::new();
        let cam = camera(&hw);
        assert!(matches!(
            cam.open(&opts(vec![Size::new(8000, 8000)])),
            Err(VppError::NoFreeChannel { .. })
        ));
        assert!(hw.events().is_empty());
    }

    #[test]
    fn sensor_index_selects_host() {
        let hw = VirtualCamera::new();
        let cam = camera(&hw);
        let mut o = opts(vec![Size::default()]);
        o.sensor_index = 1;
        assert!(matches!(cam.open(&o), Err(VppError::Hardware { .. })));
        o.sensor_index = 7;
        assert!(matches!(cam.open(&o), Err(VppError::InvalidArgument(_))));
        o.sensor_index = -1;
        cam.open(&o).unwrap();
    }

    #[test]
    fn stage_frames_count_drops() {
        let hw = VirtualCamera::new();
        let cam = camera(&hw);
        cam.open(&opts(vec![Size::default()])).unwrap();

        let f = cam.get_stage_frame(Stage::Isp, Size::default(), 100).unwrap();
        assert_eq!(f.dropped_since_last(), 0);
        cam.return_stage_frame(f, Stage::Isp, Size::default()).unwrap();

        hw.skip_frames(Stage::Isp, 0, 3);
        let f = cam.get_stage_frame(Stage::Isp, Size::default(), 100).unwrap();
        assert_eq!(f.dropped_since_last(), 3);
        let err = cam
            .return_stage_frame(f, Stage::Raw, Size::default())
            .unwrap_err();
        assert!(matches!(err.error, VppError::ForeignFrame));
        assert_eq!(hw.outstanding(Stage::Isp, 0), 1);

        let f = err.frame.unwrap();
        cam.return_stage_frame(f, Stage::Isp, Size::default()).unwrap();
        assert_eq!(hw.outstanding(Stage::Isp, 0), 0);
    }

    #[test]
    fn bind_reservation_is_exclusive() {
        let hw = VirtualCamera::new();
        let cam = camera(&hw);
        cam.open(&opts(vec![Size::default(), Size::new(640, 360)])).unwrap();
        assert_eq!(cam.chn_for_bind(640, 360).unwrap(), 1);
        assert!(matches!(
            cam.chn_for_bind(640, 360),
            Err(VppError::ChannelBusy { channel: 1 })
        ));
        assert!(matches!(
            cam.chn_for_bind(320, 240),
            Err(VppError::ChannelMismatch { .. })
        ));
        cam.put_chn_for_unbind(1);
        cam.put_chn_for_unbind(1);
        assert_eq!(cam.chn_for_bind(640, 360).unwrap(), 1);
        assert_eq!(cam.chn_for_bind(0, 0).unwrap(), 0);
    }

    #[test]
    fn scaler_only_mode() {
        let hw = VirtualCamera::new();
        let alloc = HeapAllocator::new();
        let input: Arc<dyn VideoInput> = hw.clone();
        let cam = Camera::new(input, alloc.clone());
        cam.open_scaler(&ScalerOptions {
            pipe_id: 0,
            mode: ProcessMode::Scale,
            input: Size::new(64, 32),
            outputs: vec![ScalerOutput {
                dst: Size::new(32, 16),
                ..Default::default()
            }],
            ring_depth: 2,
        })
        .unwrap();
        assert_eq!(alloc.live(), 1);
        assert!(cam.get_frame(0, 20).unwrap_err().is_timeout());

        let src = Frame::new(64, 32, PixelFormat::Nv12);
        cam.set_frame(&src).unwrap();
        let out = cam.get_frame(0, 100).unwrap();
        assert_eq!((out.width(), out.height()), (32, 16));
        cam.return_frame(out, 0).unwrap();

        assert!(matches!(
            cam.set_frame(&Frame::new(32, 32, PixelFormat::Nv12)),
            Err(VppError::InvalidArgument(_))
        ));
        assert!(matches!(
            cam.get_stage_frame(Stage::Isp, Size::default(), 10),
            Err(VppError::Unsupported(_))
        ));
        cam.close().unwrap();
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn scaler_input_alloc_failure_unwinds() {
        let hw = VirtualCamera::new();
        let input: Arc<dyn VideoInput> = hw.clone();
        let cam = Camera::new(input, HeapAllocator::failing_after(0));
        let err = cam
            .open_scaler(&ScalerOptions {
                pipe_id: 0,
                mode: ProcessMode::Scale,
                input: Size::new(64, 32),
                outputs: vec![ScalerOutput::default()],
                ring_depth: 2,
            })
            .unwrap_err();
        assert!(matches!(err, VppError::Alloc(_)));
        assert_eq!(
            hw.events(),
            ["init vse", "start vse", "stop vse", "deinit vse"]
        );
    }
}
