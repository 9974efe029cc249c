//! Helpers shared by the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vpp::capture::{CameraOptions, Size};
use vpp::codec::{CodecParams, CodecType};
use vpp::hal::virtual_hw::VirtualCamera;
use vpp::hal::SensorConfig;
use vpp::pipeline::LinkPolicy;

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 32;

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn fast_policy() -> LinkPolicy {
    LinkPolicy {
        timeout_ms: 50,
        backoff: Duration::from_micros(200),
        max_consecutive_errors: 8,
    }
}

/// Virtual camera with one small sensor on MIPI host 0
pub fn small_sensor() -> Arc<VirtualCamera> {
    VirtualCamera::with_sensors(vec![SensorConfig {
        name: "virtual-small".into(),
        mipi_host: 0,
        width: WIDTH,
        height: HEIGHT,
        fps: 200,
    }])
}

pub fn camera_options(channels: &[Size]) -> CameraOptions {
    CameraOptions {
        pipe_id: 0,
        sensor_index: -1,
        fps: 200,
        channels: channels.to_vec(),
        ring_depth: 4,
    }
}

pub fn codec_params() -> CodecParams {
    CodecParams {
        codec: CodecType::H264,
        width: WIDTH,
        height: HEIGHT,
        bitrate_kbps: 1000,
        fps: 200,
    }
}
