//! Frame handles with single-holder ownership semantics

use std::fmt;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, VppError};
use crate::pipeline::ModuleId;

/// Most multi-plane layouts the hardware produces fit in three planes.
pub const MAX_PLANES: usize = 3;

/// Pixel formats flowing between stages
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Nv12,
    Argb8888,
    /// Unpacked raw sensor data, 16 bits per sample
    Raw16,
    H264,
    H265,
    Mjpeg,
}

impl PixelFormat {
    /// Byte size of every plane for a `width` x `height` image.
    ///
    /// Compressed formats get a single plane sized for the worst case of an
    /// uncompressed NV12 picture.
    pub fn plane_sizes(self, width: u32, height: u32) -> Vec<usize> {
        let px = width as usize * height as usize;
        match self {
            PixelFormat::Nv12 => vec![px, px / 2],
            PixelFormat::Argb8888 => vec![px * 4],
            PixelFormat::Raw16 => vec![px * 2],
            PixelFormat::H264 | PixelFormat::H265 | PixelFormat::Mjpeg => vec![px * 3 / 2],
        }
    }
}

/// Device-visible address of a plane.
///
/// Only the hardware collaborators ever see this; [`Frame`] never hands it out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// One plane of a hardware buffer: process mapping plus device address
#[derive(Debug, Default)]
pub struct PlaneDesc {
    pub data: BytesMut,
    pub phys: PhysAddr,
}

impl PlaneDesc {
    pub fn zeroed(size: usize, phys: PhysAddr) -> Self {
        Self {
            data: BytesMut::zeroed(size),
            phys,
        }
    }
}

/// Buffer descriptor exchanged with the hardware collaborators.
#[derive(Debug, Default)]
pub struct BufferDescriptor {
    pub planes: Vec<PlaneDesc>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub vstride: u32,
    pub format: PixelFormat,
    /// Sequence number assigned by the producing stage
    pub frame_id: u64,
    pub timestamp_us: u64,
    /// Index of the ring slot backing this buffer
    pub slot: u32,
}

impl BufferDescriptor {
    /// Zero-filled descriptor laid out for `format`. Physical addresses stay 0.
    pub fn alloc(width: u32, height: u32, format: PixelFormat) -> Self {
        let planes = format
            .plane_sizes(width, height)
            .into_iter()
            .map(|size| PlaneDesc::zeroed(size, PhysAddr::default()))
            .collect();
        Self {
            planes,
            width,
            height,
            stride: width,
            vstride: height,
            format,
            ..Default::default()
        }
    }

    pub fn data_size(&self, plane: usize) -> usize {
        self.planes.get(plane).map(|p| p.data.len()).unwrap_or(0)
    }

    /// Whether every plane of `src` fits into the matching plane of `self`.
    pub fn check_fits(&self, src: &BufferDescriptor) -> Result<()> {
        if src.planes.len() > self.planes.len() {
            return Err(VppError::InvalidArgument(format!(
                "{} source planes, destination has {}",
                src.planes.len(),
                self.planes.len()
            )));
        }
        for (i, (dst, src)) in self.planes.iter().zip(&src.planes).enumerate() {
            if src.data.len() > dst.data.len() {
                return Err(VppError::InvalidArgument(format!(
                    "plane {i}: {} bytes do not fit in {}",
                    src.data.len(),
                    dst.data.len()
                )));
            }
        }
        Ok(())
    }

    /// Copy every plane of `src` into the matching plane of `self`.
    ///
    /// Fails without touching `self` if `src` has more planes than `self` or
    /// a plane does not fit.
    pub fn copy_from(&mut self, src: &BufferDescriptor) -> Result<()> {
        self.check_fits(src)?;
        for (dst, src) in self.planes.iter_mut().zip(&src.planes) {
            dst.data[..src.data.len()].copy_from_slice(&src.data);
        }
        self.frame_id = src.frame_id;
        self.timestamp_us = src.timestamp_us;
        Ok(())
    }
}

/// Where a leased frame has to go back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Origin {
    pub module: ModuleId,
    pub channel: u32,
    pub stage: u8,
}

/// Handle to an image buffer.
///
/// A `Frame` obtained from a stage's `get_frame` owns one slot of that stage's
/// hardware ring until it is handed back through `return_frame`. The type is not
/// `Clone`, so there can only ever be one holder. A successful return consumes
/// it; a refused one hands it back inside the error.
/// Frames built with [`Frame::new`] or [`Frame::from_planes`] belong to the
/// caller and can be dropped freely.
pub struct Frame {
    buf: BufferDescriptor,
    dropped_since_last: u64,
    origin: Option<Origin>,
}

impl Frame {
    /// Caller-owned zeroed frame.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            buf: BufferDescriptor::alloc(width, height, format),
            dropped_since_last: 0,
            origin: None,
        }
    }

    /// Caller-owned frame built from plane contents.
    pub fn from_planes(
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: &[&[u8]],
    ) -> Result<Self> {
        if planes.is_empty() || planes.len() > MAX_PLANES {
            return Err(VppError::InvalidArgument(format!(
                "plane count {} not in 1..={MAX_PLANES}",
                planes.len()
            )));
        }
        let buf = BufferDescriptor {
            planes: planes
                .iter()
                .map(|p| PlaneDesc {
                    data: BytesMut::from(*p),
                    phys: PhysAddr::default(),
                })
                .collect(),
            width,
            height,
            stride: width,
            vstride: height,
            format,
            ..Default::default()
        };
        Ok(Self {
            buf,
            dropped_since_last: 0,
            origin: None,
        })
    }

    pub(crate) fn leased(buf: BufferDescriptor, origin: Origin) -> Self {
        Self {
            buf,
            dropped_since_last: 0,
            origin: Some(origin),
        }
    }

    pub fn width(&self) -> u32 {
        self.buf.width
    }

    pub fn height(&self) -> u32 {
        self.buf.height
    }

    pub fn stride(&self) -> u32 {
        self.buf.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.buf.format
    }

    pub fn frame_id(&self) -> u64 {
        self.buf.frame_id
    }

    pub fn timestamp_us(&self) -> u64 {
        self.buf.timestamp_us
    }

    /// Frames the producer skipped between the previous frame and this one.
    pub fn dropped_since_last(&self) -> u64 {
        self.dropped_since_last
    }

    pub fn plane_count(&self) -> usize {
        self.buf.planes.len()
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        self.buf.planes.get(index).map(|p| &p.data[..])
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.buf.planes.get_mut(index).map(|p| &mut p.data[..])
    }

    pub fn data_size(&self, index: usize) -> usize {
        self.buf.data_size(index)
    }

    /// Whether this frame occupies a stage's ring slot and must be returned.
    pub fn is_leased(&self) -> bool {
        self.origin.is_some()
    }

    pub(crate) fn origin(&self) -> Option<Origin> {
        self.origin
    }

    pub(crate) fn descriptor(&self) -> &BufferDescriptor {
        &self.buf
    }

    pub(crate) fn set_dropped_since_last(&mut self, dropped: u64) {
        self.dropped_since_last = dropped;
    }

    /// Disarm the leak check and hand the buffer back to hardware code.
    pub(crate) fn into_descriptor(mut self) -> BufferDescriptor {
        self.origin = None;
        std::mem::take(&mut self.buf)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.buf.width)
            .field("height", &self.buf.height)
            .field("format", &self.buf.format)
            .field("frame_id", &self.buf.frame_id)
            .field("timestamp_us", &self.buf.timestamp_us)
            .field("planes", &self.buf.planes.len())
            .field("leased", &self.origin.is_some())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(origin) = self.origin {
            warn!(
                module = %origin.module,
                channel = origin.channel,
                slot = self.buf.slot,
                frame_id = self.buf.frame_id,
                "frame dropped without return, ring slot leaked"
            );
        }
    }
}

/// Tracks frame ids on the consumer side to count skipped frames.
#[derive(Debug, Default, Clone)]
pub struct DropCounter {
    last: Option<u64>,
}

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `frame_id` and return how many ids were skipped since the
    /// previous one. The first observation has nothing to compare with and
    /// reports 0, as does a sequence that went backwards.
    pub fn observe(&mut self, frame_id: u64) -> u64 {
        let dropped = match self.last {
            Some(prev) => frame_id.saturating_sub(prev).saturating_sub(1),
            None => 0,
        };
        self.last = Some(frame_id);
        dropped
    }
}
