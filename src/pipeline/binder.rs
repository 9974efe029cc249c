//! Producer → consumer bindings driven by one worker thread per edge

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, instrument, warn};

use super::module::{mark_worker_thread, Module, ModuleId, ModuleKind};
use crate::error::{Result, VppError};
use crate::utils::lock;
use crate::{Metrics, CONFIG};

/// Binding state of a downstream module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    /// No upstream
    Idle,
    /// Resolving the channel and starting the worker
    Binding,
    /// Worker running
    Bound,
    /// Worker gave up on a dead or failing upstream; unbind to recover
    Faulted,
}

impl BindState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BindState::Binding,
            2 => BindState::Bound,
            3 => BindState::Faulted,
            _ => BindState::Idle,
        }
    }
}

/// Cooperative cancellation for worker threads.
///
/// Cancelling drops the wake sender, so a worker sleeping in [`wait`]
/// returns at once instead of finishing its backoff.
///
/// [`wait`]: CancelToken::wait
#[derive(Clone)]
pub(crate) struct CancelToken {
    cancelled: Arc<AtomicBool>,
    wake_tx: Arc<Mutex<Option<Sender<()>>>>,
    wake_rx: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            wake_tx: Arc::new(Mutex::new(Some(tx))),
            wake_rx: rx,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        lock(&self.wake_tx).take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for up to `dur`. Returns true once cancelled.
    pub fn wait(&self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.wake_rx.recv_timeout(dur) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }
}

/// Retry behaviour of a binding worker
#[derive(Debug, Clone, Copy)]
pub struct LinkPolicy {
    pub timeout_ms: u32,
    pub backoff: Duration,
    /// Non-timeout errors in a row before the link is marked faulted
    pub max_consecutive_errors: u32,
}

impl LinkPolicy {
    pub fn from_config() -> Self {
        let cfg = CONFIG.load();
        Self {
            timeout_ms: cfg.pipeline.get_frame_timeout_ms,
            backoff: Duration::from_micros(cfg.pipeline.retry_backoff_us),
            max_consecutive_errors: cfg.pipeline.max_consecutive_errors,
        }
    }
}

#[derive(Default)]
struct LinkStats {
    iterations: AtomicU64,
    frames: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

pub(crate) struct LinkShared {
    state: AtomicU8,
    stats: CachePadded<LinkStats>,
}

impl LinkShared {
    fn new(state: BindState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            stats: CachePadded::new(LinkStats::default()),
        }
    }

    fn set_state(&self, state: BindState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Upstream edge of a downstream module
pub(crate) struct Link {
    binding: Option<Binding>,
    shared: Arc<LinkShared>,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            binding: None,
            shared: Arc::new(LinkShared::new(BindState::Idle)),
        }
    }
}

impl Link {
    pub fn state(&self) -> BindState {
        BindState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> Metrics {
        let s = &self.shared.stats;
        Metrics {
            iterations: s.iterations.load(Ordering::Relaxed),
            frames_forwarded: s.frames.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
        }
    }

    pub fn take(&mut self) -> Option<Binding> {
        self.binding.take()
    }
}

pub(crate) struct Binding {
    upstream: Arc<dyn Module>,
    channel: u32,
    /// Channel came from `chn_for_bind` and must be put back
    reserved: bool,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
    shared: Arc<LinkShared>,
}

impl Binding {
    /// Cancel the worker, wait for it, then release the upstream channel.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                // Last reference to the downstream dropped inside its own worker
                debug!("unbinding from the bind worker itself, not joining");
            } else if worker.join().is_err() {
                error!("bind worker panicked");
            }
        }
        self.upstream.core().set_pulled(self.channel, false);
        if self.reserved {
            self.upstream.put_chn_for_unbind(self.channel);
        }
        self.shared.set_state(BindState::Idle);
    }
}

/// Bind `downstream` to `upstream` with the configured retry policy.
///
/// With `channel == None` the upstream picks the channel producing the
/// downstream's input size. Returns the channel being pulled.
pub fn bind(
    upstream: Arc<dyn Module>,
    downstream: Arc<dyn Module>,
    channel: Option<u32>,
) -> Result<u32> {
    bind_with(upstream, downstream, channel, LinkPolicy::from_config())
}

#[instrument(skip_all, fields(up = %upstream.kind(), down = %downstream.kind()))]
pub fn bind_with(
    upstream: Arc<dyn Module>,
    downstream: Arc<dyn Module>,
    channel: Option<u32>,
    policy: LinkPolicy,
) -> Result<u32> {
    if feeds_from(&upstream, downstream.id()) {
        error!("{} already feeds {}", downstream.kind(), upstream.kind());
        return Err(VppError::InvalidArgument(
            "binding would close a loop in the pipeline".into(),
        ));
    }

    let mut link = lock(&downstream.core().link);
    if link.binding.is_some() {
        warn!("bind on a module that is already bound");
        return Err(VppError::AlreadyBound);
    }

    let shared = Arc::new(LinkShared::new(BindState::Binding));
    link.shared = Arc::clone(&shared);

    let (width, height) = downstream.size();
    let (channel, reserved) = match channel {
        Some(chn) => (chn, false),
        None => match upstream.chn_for_bind(width, height) {
            Ok(chn) => (chn, true),
            Err(e) => {
                error!("no upstream channel for {width}x{height}: {e}");
                shared.set_state(BindState::Idle);
                return Err(e);
            }
        },
    };
    debug!(channel, "resolved bind channel");

    let cancel = CancelToken::new();
    upstream.core().set_pulled(channel, true);
    shared.set_state(BindState::Bound);

    let worker = {
        let upstream = Arc::clone(&upstream);
        let downstream = Arc::downgrade(&downstream);
        let cancel = cancel.clone();
        let shared = Arc::clone(&shared);
        let down_kind = link_kind(&downstream);
        thread::Builder::new()
            .name(format!("vpp-{}-{}", upstream.kind(), down_kind))
            .spawn(move || run_link(upstream, downstream, channel, cancel, shared, policy))
    };
    let worker = match worker {
        Ok(handle) => handle,
        Err(e) => {
            upstream.core().set_pulled(channel, false);
            if reserved {
                upstream.put_chn_for_unbind(channel);
            }
            shared.set_state(BindState::Idle);
            return Err(VppError::Alloc(format!("spawn bind worker: {e}")));
        }
    };

    link.binding = Some(Binding {
        upstream,
        channel,
        reserved,
        cancel,
        worker: Some(worker),
        shared,
    });
    info!(channel, "bound");
    Ok(channel)
}

/// Tear down the binding between `upstream` and `downstream`.
///
/// Blocks until the worker has finished its current iteration. Fails with
/// [`VppError::NotBound`] if `downstream` is not bound to `upstream`.
#[instrument(skip_all, fields(up = %upstream.kind(), down = %downstream.kind()))]
pub fn unbind(upstream: &dyn Module, downstream: &dyn Module) -> Result<()> {
    let binding = {
        let mut link = lock(&downstream.core().link);
        match &link.binding {
            Some(b) if b.upstream.id() == upstream.id() => link.take(),
            _ => None,
        }
    };
    match binding {
        Some(binding) => {
            let channel = binding.channel;
            binding.shutdown();
            info!(channel, "unbound");
            Ok(())
        }
        None => {
            warn!("unbind on a module that is not bound to this upstream");
            Err(VppError::NotBound)
        }
    }
}

/// Whether `target` is `module` or one of the stages feeding it.
fn feeds_from(module: &Arc<dyn Module>, target: ModuleId) -> bool {
    let mut next = Some(Arc::clone(module));
    while let Some(current) = next {
        if current.id() == target {
            return true;
        }
        next = lock(&current.core().link)
            .binding
            .as_ref()
            .map(|b| Arc::clone(&b.upstream));
    }
    false
}

fn link_kind(downstream: &Weak<dyn Module>) -> String {
    downstream
        .upgrade()
        .map(|m| m.kind().to_string())
        .unwrap_or_else(|| "gone".into())
}

/// What became of a fetched frame on the downstream side
enum Push {
    Forwarded,
    TimedOut,
    Failed(VppError),
    /// Downstream dropped or closed
    Gone,
    /// Cancelled before the push
    Skipped,
}

/// Count one hard error. Returns true once the link has to give up.
fn count_error(stats: &LinkStats, consecutive: &mut u32, policy: &LinkPolicy) -> bool {
    stats.errors.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("vpp_bind_errors_total").increment(1);
    *consecutive += 1;
    *consecutive >= policy.max_consecutive_errors
}

/// Worker loop: get from upstream, set into downstream, return upstream.
///
/// Timeouts on either side are retried forever. Other errors are retried
/// after a backoff until `max_consecutive_errors` of them happen in a row
/// without a frame getting through; a closed stage ends the loop at once.
/// A frame fetched while cancellation is pending is still returned upstream
/// so no ring slot is lost at unbind.
fn run_link(
    upstream: Arc<dyn Module>,
    downstream: Weak<dyn Module>,
    channel: u32,
    cancel: CancelToken,
    shared: Arc<LinkShared>,
    policy: LinkPolicy,
) {
    mark_worker_thread();
    let up_kind: ModuleKind = upstream.kind();
    let stats = &shared.stats;
    let mut consecutive_errors = 0u32;

    debug!(module = %up_kind, channel, "bind worker started");

    while !cancel.is_cancelled() {
        stats.iterations.fetch_add(1, Ordering::Relaxed);

        let frame = match upstream.fetch_frame(channel, policy.timeout_ms) {
            Ok(frame) => frame,
            Err(e) if e.is_timeout() => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vpp_bind_timeouts_total").increment(1);
                cancel.wait(policy.backoff);
                continue;
            }
            Err(e) if e.is_terminal() => {
                warn!(module = %up_kind, channel, "upstream closed: {e}");
                shared.set_state(BindState::Faulted);
                break;
            }
            Err(e) => {
                if count_error(stats, &mut consecutive_errors, &policy) {
                    error!(
                        module = %up_kind,
                        channel,
                        "giving up after {consecutive_errors} consecutive errors: {e}"
                    );
                    shared.set_state(BindState::Faulted);
                    break;
                }
                debug!(module = %up_kind, channel, "get frame failed: {e}");
                cancel.wait(policy.backoff);
                continue;
            }
        };

        let push = if cancel.is_cancelled() {
            Push::Skipped
        } else {
            match downstream.upgrade() {
                Some(down) => match down.push_frame(&frame) {
                    Ok(()) => Push::Forwarded,
                    Err(e) if e.is_timeout() => Push::TimedOut,
                    Err(e) if e.is_terminal() => {
                        warn!(module = %down.kind(), "downstream closed: {e}");
                        Push::Gone
                    }
                    Err(e) => Push::Failed(e),
                },
                None => Push::Gone,
            }
        };

        if let Err(e) = upstream.release_frame(frame, channel) {
            warn!(module = %up_kind, channel, "return frame failed: {e}");
        }

        match push {
            Push::Forwarded => {
                consecutive_errors = 0;
                stats.frames.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vpp_bind_frames_total").increment(1);
            }
            Push::TimedOut => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vpp_bind_timeouts_total").increment(1);
                cancel.wait(policy.backoff);
            }
            Push::Failed(e) => {
                if count_error(stats, &mut consecutive_errors, &policy) {
                    error!(
                        module = %up_kind,
                        channel,
                        "giving up after {consecutive_errors} consecutive errors: set frame: {e}"
                    );
                    shared.set_state(BindState::Faulted);
                    break;
                }
                debug!(module = %up_kind, channel, "set frame failed: {e}");
                cancel.wait(policy.backoff);
            }
            Push::Gone => {
                shared.set_state(BindState::Faulted);
                break;
            }
            Push::Skipped => {}
        }
    }

    debug!(module = %up_kind, channel, "bind worker exited");
}
