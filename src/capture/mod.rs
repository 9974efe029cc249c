//! Camera capture: channel planning and the camera stage

pub mod camera;
pub mod channel;

pub use camera::{Camera, CameraOptions, ScalerOptions};
pub use channel::{
    select_scale_channel, ChannelAttr, ChannelMask, ChannelTable, ProcessMode, Rect,
    ScalerChannel, ScalerOutput, Size, CHANNEL_COUNT,
};
