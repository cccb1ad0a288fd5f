//! Hardware command queue (HCQ) runtime core.
//!
//! A portable layer over accelerator devices that exposes direct
//! command-buffer construction, submission and cross-device
//! synchronization through monotonic timeline signals stored in shared
//! memory.
//!
//! A backend supplies the device-specific pieces — signal allocation,
//! packet encoders for its compute and copy engines, a program loader and
//! the raw allocator — through the [`dev::Backend`] and
//! [`queue::HwQueue`] traits. On top of those the core provides:
//!
//! - [`queue`]: retargetable command streams with per-command metadata,
//!   so queued signal/wait/exec/copy commands can be patched in place
//!   and resubmitted.
//! - [`signal`]: the shared-memory counter + timestamp cell that is the
//!   only cross-engine ordering primitive.
//! - [`dev`]: per-device timeline management (including 2^31 wrap onto a
//!   shadow signal), the kernargs bump arena and host/device clock
//!   calibration.
//! - [`mem`]: a bounded ring of pinned staging buffers driving
//!   asynchronous host/device/disk/peer transfers.
//! - [`exec`]: kernel launch plumbing over the compute queue.
//! - [`profile`]: a process-wide Chrome-trace sink fed at device
//!   teardown.
//!
//! Everything host-side is single-threaded and cooperative: a queue
//! builder is owned by one producer, and ordering between submissions
//! exists only where a `wait` names a signal someone `signal`s.
//!
//! ```ignore
//! let mut dev = Device::new("gpu:0", backend, ProfileHandle::from_env())?;
//! let mut q = dev.comp_queue();
//! q.wait(&dev.timeline_signal, dev.timeline_value - 1)?
//!     .memory_barrier()?
//!     .signal(&dev.timeline_signal, dev.timeline_value)?
//!     .submit(&mut dev)?;
//! dev.timeline_value += 1;
//! dev.synchronize()?;
//! ```

pub mod config;
pub mod dev;
pub mod error;
pub mod exec;
pub mod mem;
pub mod profile;
pub mod queue;
pub mod signal;

#[cfg(test)]
pub(crate) mod mock;
