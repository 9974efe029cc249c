pub mod binder;
pub mod module;
pub mod pipe_id;
pub mod ringbuf;

pub use binder::{bind, bind_with, unbind, BindState, LinkPolicy};
pub use module::{lease_frame, FrameLease, Module, ModuleCore, ModuleId, ModuleKind, DEFAULT_TIMEOUT_MS};
pub use pipe_id::{PipeIdAllocator, PipeIdLease, MAX_PIPELINES};
pub use ringbuf::FrameRing;
