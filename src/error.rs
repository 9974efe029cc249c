//! Error taxonomy shared by every pipeline stage.

use crate::frame::Frame;
use crate::pipeline::ModuleKind;

pub type Result<T, E = VppError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum VppError {
    /// Frame not ready within the deadline. Callers may retry.
    #[error("{op} timed out after {timeout_ms} ms")]
    Timeout { op: &'static str, timeout_ms: u32 },

    #[error("no scaler channel can serve {width}x{height}")]
    NoFreeChannel { width: u32, height: u32 },

    #[error("no free pipeline id, max pipeline num: {max}")]
    NoFreePipeline { max: u8 },

    #[error("pipeline id {0} is not held")]
    PipeIdNotHeld(u8),

    #[error("pipeline id {0} is out of range")]
    InvalidPipeId(u8),

    #[error("buffer allocation failed: {0}")]
    Alloc(String),

    /// Nonzero return from a driver call.
    #[error("{op} failed with code {code}")]
    Hardware { op: &'static str, code: i32 },

    #[error("{0} is not open")]
    NotOpen(ModuleKind),

    #[error("module is already bound")]
    AlreadyBound,

    #[error("module is not bound")]
    NotBound,

    #[error("channel {channel} is already claimed")]
    ChannelBusy { channel: u32 },

    #[error("no channel produces {width}x{height}")]
    ChannelMismatch { width: u32, height: u32 },

    #[error("frame was not produced by this module/channel")]
    ForeignFrame,

    #[error("stage is driven by a binding worker")]
    DrivenByBinding,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VppError {
    /// The stage behind this error is gone; loops must stop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VppError::NotOpen(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, VppError::Timeout { .. })
    }

    pub(crate) fn hw(op: &'static str, code: i32) -> Self {
        VppError::Hardware { op, code }
    }
}

/// A failed `return_frame`.
///
/// `frame` is handed back when the stage refused it, so the caller can still
/// return it to the right place. It is `None` once the stage took the buffer.
#[derive(Debug, thiserror::Error)]
#[error("return frame: {error}")]
pub struct ReturnError {
    #[source]
    pub error: VppError,
    pub frame: Option<Frame>,
}

impl ReturnError {
    pub(crate) fn refused(error: VppError, frame: Frame) -> Self {
        Self {
            error,
            frame: Some(frame),
        }
    }

    pub(crate) fn consumed(error: VppError) -> Self {
        Self { error, frame: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let t = VppError::Timeout {
            op: "get_frame",
            timeout_ms: 1000,
        };
        assert!(t.is_timeout());
        assert!(!t.is_terminal());

        let hw = VppError::hw("vse_get_frame", -5);
        assert!(!hw.is_timeout());
        assert!(!hw.is_terminal());

        let closed = VppError::NotOpen(ModuleKind::Encoder);
        assert!(closed.is_terminal());
        assert!(!closed.is_timeout());
        assert_eq!(closed.to_string(), "Encode is not open");
    }
}
