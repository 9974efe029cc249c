//! Boundary with the capture, codec and display drivers.
//!
//! Stages only talk to hardware through these traits. [`virtual_hw`] provides
//! software implementations of all of them.

pub mod virtual_hw;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::channel::{ChannelTable, Size};
use crate::codec::CodecType;
use crate::error::Result;
use crate::frame::{BufferDescriptor, PixelFormat};

/// Capture stages that own an output ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Raw sensor data from the MIPI receiver
    Raw = 0,
    /// ISP output
    Isp = 1,
    /// Scaler (VSE) outputs
    Scaler = 2,
}

impl Stage {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Stage::Raw),
            1 => Some(Stage::Isp),
            2 => Some(Stage::Scaler),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Raw => "vin",
            Stage::Isp => "isp",
            Stage::Scaler => "vse",
        })
    }
}

/// Sensor found on a MIPI host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub name: String,
    pub mipi_host: u8,
    /// ISP input resolution
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Everything the capture driver needs to bring up a video flow
#[derive(Debug, Clone)]
pub struct VideoFlowConfig {
    pub pipe_id: u8,
    /// `None` when only the scaler runs, fed by `send_frame`
    pub sensor: Option<SensorConfig>,
    pub fps: u32,
    /// Scaler input size
    pub input: Size,
    pub channels: ChannelTable,
    pub ring_depth: u32,
}

impl VideoFlowConfig {
    pub fn scaler_only(&self) -> bool {
        self.sensor.is_none()
    }
}

/// Capture pipeline driver: sensor, MIPI receiver, ISP and scaler.
pub trait VideoInput: Send + Sync {
    /// Look for a supported sensor on `mipi_host`.
    fn probe_sensor(&self, mipi_host: u8) -> Option<SensorConfig>;

    fn init_stage(&self, stage: Stage, flow: &VideoFlowConfig) -> Result<()>;
    fn start_stage(&self, stage: Stage) -> Result<()>;
    fn stop_stage(&self, stage: Stage) -> Result<()>;
    fn deinit_stage(&self, stage: Stage) -> Result<()>;

    fn get_frame(&self, stage: Stage, channel: u32, timeout_ms: u32) -> Result<BufferDescriptor>;
    fn release_frame(&self, stage: Stage, channel: u32, buf: BufferDescriptor) -> Result<()>;

    /// Feed one input picture to `stage`.
    fn send_frame(&self, stage: Stage, buf: &BufferDescriptor) -> Result<()>;
}

/// Direction of a codec instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecRole {
    Encode,
    Decode,
}

/// Codec context parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSetup {
    pub role: CodecRole,
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
}

/// Hardware codec addressed by pipeline id.
///
/// Input and output buffers are owned by the codec. Callers dequeue an empty
/// input buffer, fill it and queue it back; finished output is dequeued and
/// must be queued back once consumed.
pub trait CodecBackend: Send + Sync {
    fn configure(&self, pipe_id: u8, setup: &CodecSetup) -> Result<()>;
    fn start(&self, pipe_id: u8) -> Result<()>;
    fn stop(&self, pipe_id: u8) -> Result<()>;
    fn release(&self, pipe_id: u8) -> Result<()>;

    fn dequeue_input(&self, pipe_id: u8, timeout_ms: u32) -> Result<BufferDescriptor>;
    fn queue_input(&self, pipe_id: u8, buf: BufferDescriptor, eos: bool) -> Result<()>;

    fn dequeue_output(&self, pipe_id: u8, timeout_ms: u32) -> Result<BufferDescriptor>;
    fn queue_output(&self, pipe_id: u8, buf: BufferDescriptor) -> Result<()>;
}

/// Display composition layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    Video = 0,
    Overlay = 1,
}

pub trait DisplayBackend: Send + Sync {
    fn init(&self, width: u32, height: u32) -> Result<()>;
    fn deinit(&self) -> Result<()>;
    fn present(&self, layer: Layer, buf: &BufferDescriptor) -> Result<()>;

    /// Rasterise `text` into the ARGB `overlay` with its top-left at (x, y).
    fn render_text(
        &self,
        overlay: &mut BufferDescriptor,
        x: u32,
        y: u32,
        text: &str,
        color: u32,
        line_width: u32,
    ) -> Result<()>;
}

/// Physically contiguous buffer memory
pub trait MemAllocator: Send + Sync {
    fn alloc(&self, width: u32, height: u32, format: PixelFormat) -> Result<BufferDescriptor>;
    fn free(&self, buf: BufferDescriptor);
}

/// Compressed stream feeding a decoder.
pub trait PacketSource: Send {
    /// Open the stream and report how many frames it holds.
    fn open(&mut self) -> Result<u64>;
    /// Next packet, `None` at end of stream.
    fn read_packet(&mut self) -> Result<Option<Bytes>>;
    fn rewind(&mut self) -> Result<()>;
}

/// Allocator-backed buffer freed on drop
pub struct HwBuffer {
    buf: BufferDescriptor,
    allocator: Arc<dyn MemAllocator>,
}

impl HwBuffer {
    pub fn alloc(
        allocator: &Arc<dyn MemAllocator>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self> {
        let buf = allocator.alloc(width, height, format)?;
        Ok(Self {
            buf,
            allocator: Arc::clone(allocator),
        })
    }
}

impl Deref for HwBuffer {
    type Target = BufferDescriptor;

    fn deref(&self) -> &BufferDescriptor {
        &self.buf
    }
}

impl DerefMut for HwBuffer {
    fn deref_mut(&mut self) -> &mut BufferDescriptor {
        &mut self.buf
    }
}

impl Drop for HwBuffer {
    fn drop(&mut self) {
        trace!(width = self.buf.width, height = self.buf.height, "free hw buffer");
        self.allocator.free(std::mem::take(&mut self.buf));
    }
}
