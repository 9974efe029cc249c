use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::error::{Result, VppError};
use crate::frame::Frame;

/// MIPI hosts wired to camera connectors on the board
const CAMERA_HOSTS: [u8; 2] = [0, 2];

/// Which MIPI hosts to probe for a given sensor index.
///
/// `-1` walks every connector in order, `0` and `1` pick one connector.
pub fn probe_order(sensor_index: i32) -> Result<&'static [u8]> {
    match sensor_index {
        -1 => Ok(&CAMERA_HOSTS),
        0 => Ok(&CAMERA_HOSTS[..1]),
        1 => Ok(&CAMERA_HOSTS[1..]),
        other => Err(VppError::InvalidArgument(format!(
            "sensor index {other} not supported, use -1, 0 or 1"
        ))),
    }
}

/// Wall clock in microseconds
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Write every plane of `frame` back to back into `path`.
pub fn dump_frame(frame: &Frame, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    for i in 0..frame.plane_count() {
        if let Some(plane) = frame.plane(i) {
            file.write_all(plane)?;
        }
    }
    file.flush()?;
    info!(
        "Dumped frame {} ({}x{}) to {}",
        frame.frame_id(),
        frame.width(),
        frame.height(),
        path.display()
    );
    Ok(())
}

// Lock helpers that ignore poisoning; guarded state is plain data.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    #[test]
    fn probe_order_by_index() {
        assert_eq!(probe_order(-1).unwrap(), &[0u8, 2]);
        assert_eq!(probe_order(0).unwrap(), &[0u8]);
        assert_eq!(probe_order(1).unwrap(), &[2u8]);
        assert!(probe_order(2).is_err());
    }

    #[test]
    fn dump_writes_all_planes() {
        let frame = Frame::from_planes(2, 2, PixelFormat::Nv12, &[&[1, 2, 3, 4], &[5, 6]]).unwrap();
        let path = std::env::temp_dir().join(format!("vpp-dump-{}.yuv", std::process::id()));
        dump_frame(&frame, &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1u8, 2, 3, 4, 5, 6]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn dump_into_missing_dir_is_io_error() {
        let frame = Frame::new(2, 2, PixelFormat::Nv12);
        let path = std::env::temp_dir().join("vpp-no-such-dir").join("frame.yuv");
        assert!(matches!(dump_frame(&frame, &path), Err(VppError::Io(_))));
    }
}
