//! The frame-exchange contract shared by every pipeline stage

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::binder::{BindState, Link};
use crate::error::{Result, ReturnError, VppError};
use crate::frame::Frame;
use crate::utils::lock;
use crate::Metrics;

/// Default wait for a frame, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_worker_thread() {
    IN_WORKER.with(|w| w.set(true));
}

fn on_worker_thread() -> bool {
    IN_WORKER.with(|w| w.get())
}

/// Process-unique identity of a module instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u64);

impl ModuleId {
    fn next() -> Self {
        Self(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    Camera,
    Encoder,
    Decoder,
    Display,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleKind::Camera => "Camera",
            ModuleKind::Encoder => "Encode",
            ModuleKind::Decoder => "Decode",
            ModuleKind::Display => "Display",
        })
    }
}

/// State every stage carries regardless of its hardware.
///
/// Holds the identity and input geometry of the stage, the single-channel
/// bind reservation, the channels of this stage currently pulled by workers
/// and the link to the upstream stage when bound.
pub struct ModuleCore {
    id: ModuleId,
    kind: ModuleKind,
    width: AtomicU32,
    height: AtomicU32,
    claimed: AtomicBool,
    /// Binding workers pulling each output channel
    pulled: Mutex<HashMap<u32, u32>>,
    pub(crate) link: Mutex<Link>,
}

impl ModuleCore {
    pub fn new(kind: ModuleKind, width: u32, height: u32) -> Self {
        Self {
            id: ModuleId::next(),
            kind,
            width: AtomicU32::new(width),
            height: AtomicU32::new(height),
            claimed: AtomicBool::new(false),
            pulled: Mutex::new(HashMap::new()),
            link: Mutex::new(Link::default()),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Input width and height of the stage
    pub fn size(&self) -> (u32, u32) {
        (
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
        )
    }

    pub fn set_size(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
    }

    /// Compare-and-set reservation used by single-output stages.
    pub fn claim_single(&self, width: u32, height: u32) -> Result<u32> {
        let (w, h) = self.size();
        if (w, h) != (width, height) {
            error!(module = %self.kind, "size {w}x{h} does not match {width}x{height}");
            return Err(VppError::ChannelMismatch { width, height });
        }
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!(module = %self.kind, "module already bound");
            return Err(VppError::ChannelBusy { channel: 0 });
        }
        Ok(0)
    }

    pub fn release_single(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub(crate) fn set_pulled(&self, channel: u32, pulled: bool) {
        let mut map = lock(&self.pulled);
        let count = map.entry(channel).or_insert(0);
        if pulled {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&channel);
            }
        }
    }

    /// Manual access to an output channel is refused while a worker pulls it.
    pub fn ensure_manual_output(&self, channel: u32) -> Result<()> {
        if lock(&self.pulled).contains_key(&channel) && !on_worker_thread() {
            warn!(module = %self.kind, channel, "manual frame access on a bound channel");
            return Err(VppError::DrivenByBinding);
        }
        Ok(())
    }

    /// Manual input is refused while this stage is fed by a worker.
    pub fn ensure_manual_input(&self) -> Result<()> {
        if self.bind_state() != BindState::Idle && !on_worker_thread() {
            warn!(module = %self.kind, "manual set_frame on a bound module");
            return Err(VppError::DrivenByBinding);
        }
        Ok(())
    }

    pub(crate) fn check_origin(&self, frame: &Frame, channel: u32) -> Result<()> {
        match frame.origin() {
            Some(o) if o.module == self.id && o.channel == channel => Ok(()),
            _ => Err(VppError::ForeignFrame),
        }
    }

    pub fn bind_state(&self) -> BindState {
        lock(&self.link).state()
    }

    /// Counters of the current (or last) binding feeding this stage.
    pub fn link_metrics(&self) -> Metrics {
        lock(&self.link).metrics()
    }

    /// Stop and join the worker feeding this stage, if any.
    ///
    /// Concrete stages call this first in `Drop` so the worker is gone before
    /// their hardware is released.
    pub fn shutdown_link(&self) {
        let binding = lock(&self.link).take();
        if let Some(binding) = binding {
            binding.shutdown();
        }
    }
}

impl Drop for ModuleCore {
    fn drop(&mut self) {
        self.shutdown_link();
    }
}

/// A pipeline stage.
///
/// Implementors supply the raw hardware operations (`fetch_frame`,
/// `release_frame`, `push_frame`). Callers use the provided `get_frame`,
/// `return_frame` and `set_frame`, which add the ownership and
/// driving-mode checks. Binding workers call the raw operations directly.
pub trait Module: Send + Sync {
    fn core(&self) -> &ModuleCore;

    /// Dequeue the next frame of `channel`, waiting up to `timeout_ms`.
    fn fetch_frame(&self, channel: u32, timeout_ms: u32) -> Result<Frame>;

    /// Requeue a frame previously fetched from `channel`.
    fn release_frame(&self, frame: Frame, channel: u32) -> Result<()>;

    /// Copy an externally produced frame into this stage.
    fn push_frame(&self, frame: &Frame) -> Result<()>;

    /// Reserve the output channel producing `width` x `height` for a binding.
    fn chn_for_bind(&self, width: u32, height: u32) -> Result<u32> {
        self.core().claim_single(width, height)
    }

    /// Undo `chn_for_bind`. Idempotent.
    fn put_chn_for_unbind(&self, _channel: u32) {
        self.core().release_single();
    }

    fn id(&self) -> ModuleId {
        self.core().id()
    }

    fn kind(&self) -> ModuleKind {
        self.core().kind()
    }

    fn size(&self) -> (u32, u32) {
        self.core().size()
    }

    fn bind_state(&self) -> BindState {
        self.core().bind_state()
    }

    fn get_frame(&self, channel: u32, timeout_ms: u32) -> Result<Frame> {
        self.core().ensure_manual_output(channel)?;
        self.fetch_frame(channel, timeout_ms)
    }

    /// Hand back a frame from `get_frame`. The frame must come from this
    /// module and `channel`; anything else is refused and given back.
    ///
    /// A frame taken before a binding started pulling `channel` still owns
    /// its slot, so returning it is allowed while bound.
    fn return_frame(&self, frame: Frame, channel: u32) -> Result<(), ReturnError> {
        if let Err(e) = self.core().check_origin(&frame, channel) {
            return Err(ReturnError::refused(e, frame));
        }
        self.release_frame(frame, channel)
            .map_err(ReturnError::consumed)
    }

    fn set_frame(&self, frame: &Frame) -> Result<()> {
        self.core().ensure_manual_input()?;
        self.push_frame(frame)
    }
}

/// Frame that goes back to its stage when dropped.
pub struct FrameLease {
    module: Arc<dyn Module>,
    channel: u32,
    frame: Option<Frame>,
}

impl FrameLease {
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Return the frame now and surface the result.
    pub fn release(mut self) -> Result<()> {
        match self.frame.take() {
            Some(frame) => self
                .module
                .return_frame(frame, self.channel)
                .map_err(|e| e.error),
            None => Ok(()),
        }
    }
}

/// `get_frame` wrapped so the frame cannot leak.
pub fn lease_frame(module: &Arc<dyn Module>, channel: u32, timeout_ms: u32) -> Result<FrameLease> {
    let frame = module.get_frame(channel, timeout_ms)?;
    Ok(FrameLease {
        module: Arc::clone(module),
        channel,
        frame: Some(frame),
    })
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only `release` and `drop` empty the slot, both consume the lease.
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("frame lease already released"),
        }
    }
}

impl DerefMut for FrameLease {
    fn deref_mut(&mut self) -> &mut Frame {
        match &mut self.frame {
            Some(frame) => frame,
            None => unreachable!("frame lease already released"),
        }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            if let Err(e) = self.module.return_frame(frame, self.channel) {
                error!(module = %self.module.kind(), channel = self.channel, "return frame: {e}");
            }
        }
    }
}
