//! Scaler output channels and the resolution → channel allocator

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{Result, VppError};
use crate::frame::PixelFormat;

/// Number of scaler outputs: five downscalers and one upscaler
pub const CHANNEL_COUNT: usize = 6;

const FULL_LIMIT: Size = Size::new(4096, 3076);
const FHD_LIMIT: Size = Size::new(1920, 1080);
const HD_LIMIT: Size = Size::new(1280, 720);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Neither dimension is larger than `other`'s.
    pub fn fits_in(self, other: Size) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    pub fn is_zero(self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// A zero size stands for `fallback`.
    pub fn or(self, fallback: Size) -> Size {
        if self.is_zero() {
            fallback
        } else {
            self
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Size {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn full(size: Size) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

/// Scaler output, in allocation priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScalerChannel {
    Ds0 = 0,
    Ds1 = 1,
    Ds2 = 2,
    Ds3 = 3,
    Ds4 = 4,
    Us = 5,
}

impl ScalerChannel {
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Set of claimed scaler channels
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMask(u8);

impl ChannelMask {
    pub fn contains(self, chn: ScalerChannel) -> bool {
        self.0 & (1 << chn.index()) != 0
    }

    pub fn insert(&mut self, chn: ScalerChannel) {
        self.0 |= 1 << chn.index();
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

/// Pick the scaler channel producing `dst` out of `src`.
///
/// Channels are tried in a fixed order and the first free one whose limits
/// fit wins:
///
/// 1. DS0 when `dst` is no larger than `src` and within 4096x3076.
/// 2. When `dst` is no larger than `src` in at least one dimension, DS1 then
///    DS2 (up to 1920x1080), then DS3 then DS4 (up to 1280x720).
/// 3. The upscaler when `dst` is at least `src` in both dimensions and within
///    4096x3076.
///
/// The order is greedy and part of the observable behaviour: a request that
/// DS1 could serve still takes DS0 when it is free.
pub fn select_scale_channel(src: Size, dst: Size, claimed: ChannelMask) -> Option<ScalerChannel> {
    use ScalerChannel::*;

    let free = |chn| !claimed.contains(chn);

    if dst.fits_in(src) && dst.fits_in(FULL_LIMIT) && free(Ds0) {
        return Some(Ds0);
    }
    if dst.width <= src.width || dst.height <= src.height {
        let fhd = dst.fits_in(FHD_LIMIT);
        let hd = dst.fits_in(HD_LIMIT);
        if fhd && free(Ds1) {
            return Some(Ds1);
        } else if fhd && free(Ds2) {
            return Some(Ds2);
        } else if hd && free(Ds3) {
            return Some(Ds3);
        } else if hd && free(Ds4) {
            return Some(Ds4);
        }
    }
    if src.fits_in(dst) && dst.fits_in(FULL_LIMIT) && free(Us) {
        return Some(Us);
    }
    None
}

/// How a scaler output derives its picture from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessMode {
    Scale = 1,
    ScaleCrop = 2,
    ScaleRotate = 3,
    ScaleRotateCrop = 4,
}

impl ProcessMode {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(ProcessMode::Scale),
            2 => Ok(ProcessMode::ScaleCrop),
            3 => Ok(ProcessMode::ScaleRotate),
            4 => Ok(ProcessMode::ScaleRotateCrop),
            other => Err(VppError::InvalidArgument(format!(
                "process mode {other} not in 1..=4"
            ))),
        }
    }

    fn crops(self) -> bool {
        matches!(self, ProcessMode::ScaleCrop | ProcessMode::ScaleRotateCrop)
    }

    fn rotates(self) -> bool {
        matches!(self, ProcessMode::ScaleRotate | ProcessMode::ScaleRotateCrop)
    }
}

/// Configuration of one scaler output
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAttr {
    pub enabled: bool,
    /// Region of the input picture fed to this output
    pub roi: Rect,
    pub target: Size,
    pub format: PixelFormat,
}

/// Requested scaler output in scaler-only mode.
///
/// A zero `crop` size means the whole input, a zero `dst` size means the crop
/// size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScalerOutput {
    pub dst: Size,
    pub crop: Rect,
}

/// Scaler output configuration, fixed once the stage is open
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelTable {
    attrs: [ChannelAttr; CHANNEL_COUNT],
}

impl ChannelTable {
    /// One channel per requested size, the whole input scaled into each.
    ///
    /// A `0x0` request stands for the input size.
    pub fn plan(src: Size, requests: &[Size]) -> Result<Self> {
        let mut table = Self::default();
        for &req in requests {
            let dst = req.or(src);
            table.assign(src, dst, Rect::full(src))?;
        }
        Ok(table)
    }

    /// Channel layout for scaler-only mode.
    pub fn plan_scaler(src: Size, mode: ProcessMode, outputs: &[ScalerOutput]) -> Result<Self> {
        if mode.rotates() {
            error!("VSE does not support rotating images");
            return Err(VppError::Unsupported("scaler rotation"));
        }
        let mut table = Self::default();
        for out in outputs {
            let mut crop = out.crop;
            if mode.crops() && (crop.width == 0 || crop.height == 0) {
                crop = Rect::full(src);
            }
            let dst = if out.dst.is_zero() {
                crop.size().or(src)
            } else {
                out.dst
            };
            let roi = if mode.crops() { crop } else { Rect::full(src) };
            table.assign(src, dst, roi)?;
        }
        Ok(table)
    }

    fn assign(&mut self, src: Size, dst: Size, roi: Rect) -> Result<ScalerChannel> {
        let chn = select_scale_channel(src, dst, self.mask()).ok_or_else(|| {
            error!("Invalid size: {dst}");
            VppError::NoFreeChannel {
                width: dst.width,
                height: dst.height,
            }
        })?;
        self.attrs[chn.index() as usize] = ChannelAttr {
            enabled: true,
            roi,
            target: dst,
            format: PixelFormat::Nv12,
        };
        info!(
            channel = chn.index(),
            "Setting VSE channel-{}: input {src}, dst {dst}",
            chn.index()
        );
        Ok(chn)
    }

    pub fn get(&self, channel: u32) -> Option<&ChannelAttr> {
        self.attrs.get(channel as usize).filter(|a| a.enabled)
    }

    /// Enabled channels with their index
    pub fn enabled(&self) -> impl Iterator<Item = (u32, &ChannelAttr)> {
        self.attrs
            .iter()
            .enumerate()
            .filter(|(_, a)| a.enabled)
            .map(|(i, a)| (i as u32, a))
    }

    /// Lowest enabled channel whose output is exactly `size`.
    pub fn find(&self, size: Size) -> Option<u32> {
        self.enabled()
            .find(|(_, a)| a.target == size)
            .map(|(i, _)| i)
    }

    pub fn mask(&self) -> ChannelMask {
        let mut mask = ChannelMask::default();
        for (i, chn) in [
            ScalerChannel::Ds0,
            ScalerChannel::Ds1,
            ScalerChannel::Ds2,
            ScalerChannel::Ds3,
            ScalerChannel::Ds4,
            ScalerChannel::Us,
        ]
        .into_iter()
        .enumerate()
        {
            if self.attrs[i].enabled {
                mask.insert(chn);
            }
        }
        mask
    }
}
