
pub mod arena;

use std::ptr;

use arrayvec::ArrayVec;
use log::trace;

use crate::dev::{Backend, Device};
use crate::error::Result;
use crate::queue::HwQueue;

/// Hard capacity of the staging ring; the populated count is configured
/// per device and may be smaller.
pub const STAGING_MAX_SLOTS: usize = 32;
pub const DEFAULT_STAGING_SIZE: usize = 2 << 20;
pub const DEFAULT_STAGING_COUNT: usize = 32;

/// Staged but not yet signaled: the slot belongs to the device until the
/// owning transfer records its real timeline value.
pub(crate) const STAGING_RESERVED: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferSpec {
    /// Pinned host memory, addressable by device DMA engines.
    pub host: bool,
    /// Device memory that stays mapped into the host address space.
    pub cpu_access: bool,
}

/// A device allocation: virtual address, size and the spec it was
/// allocated with.
#[derive(Clone, Debug)]
pub struct HcqBuffer {
    pub va_addr: u64,
    pub size: usize,
    pub spec: BufferSpec,
    /// `va_addr` of the buffer this one was sliced out of. Relation only;
    /// the parent's lifetime is managed by its owner.
    pub base: Option<u64>,
}

impl HcqBuffer {
    pub fn new(va_addr: u64, size: usize, spec: BufferSpec) -> Self {
        Self {
            va_addr,
            size,
            spec,
            base: None,
        }
    }
}

/// Returns a sub-buffer spanning `[offset, offset + size)` of `buf`,
/// inheriting its spec and remembering the parent.
pub fn offset(buf: &HcqBuffer, size: usize, offset: usize) -> HcqBuffer {
    HcqBuffer {
        va_addr: buf.va_addr + offset as u64,
        size,
        spec: buf.spec,
        base: Some(buf.va_addr),
    }
}

/// Fixed ring of pinned host buffers reused for DMA staging.
///
/// Slot `i` is owned by the host iff `timeline_signal.value >=
/// timelines[i]`; otherwise the device still reads from it. Ownership
/// transfers are gated exclusively by signal waits.
pub(crate) struct StagingRing {
    pub(crate) bufs: ArrayVec<HcqBuffer, STAGING_MAX_SLOTS>,
    pub(crate) timelines: ArrayVec<u64, STAGING_MAX_SLOTS>,
    pub(crate) next: usize,
}

impl StagingRing {
    pub(crate) fn new<B: Backend>(backend: &mut B, size: usize, count: usize) -> Result<Self> {
        let count = count.min(STAGING_MAX_SLOTS).max(1);
        let mut bufs = ArrayVec::new();
        let mut timelines = ArrayVec::new();
        for _ in 0..count {
            bufs.push(backend.alloc(
                size,
                BufferSpec {
                    host: true,
                    ..Default::default()
                },
            )?);
            timelines.push(0);
        }
        Ok(Self {
            bufs,
            timelines,
            next: 0,
        })
    }

    pub(crate) fn reset_timelines(&mut self) {
        for t in &mut self.timelines {
            *t = 0;
        }
    }
}

/// One chunk staged by a [`ShardedSource`], relative to the destination
/// buffer and the staging slot it was read into.
#[derive(Clone, Copy, Debug)]
pub struct ShardPlacement {
    pub dst_off: u64,
    pub src_off: u64,
    pub len: usize,
}

/// A producer that shards itself into borrowed staging slots; disk-backed
/// allocators implement this over their read path.
///
/// The device drives the iteration: it reserves a ring slot, hands its
/// address over, and only reserves the next one once the previous chunk's
/// copy is in flight. A slow ring therefore throttles the producer.
pub trait ShardedSource {
    /// Reads up to `seg_len` bytes into the reserved slot at `slot_addr`
    /// and reports where the chunk lands, or `None` once drained.
    fn fill(&mut self, slot_addr: u64, seg_len: usize) -> Result<Option<ShardPlacement>>;
}

impl<B: Backend> Device<B> {
    /// Chunked host-to-device copy through the staging ring.
    ///
    /// Each chunk claims the next ring slot, waits until the slot's last
    /// consumer has signaled past its recorded timeline, stages the bytes
    /// and submits `wait(prev); copy; signal(next)` on the copy queue.
    pub fn copy_in(&mut self, dest: &HcqBuffer, src: &[u8]) -> Result<()> {
        let prof = self.prof_begin(true)?;
        let seg = self.staging.bufs[0].size;
        let count = self.staging.bufs.len();
        let mut off = 0;
        while off < src.len() {
            self.staging.next = (self.staging.next + 1) % count;
            let slot = self.staging.next;
            self.timeline_signal
                .wait(self.staging.timelines[slot], self.wait_timeout_ms)?;
            let len = seg.min(src.len() - off);
            let slot_addr = self.staging.bufs[slot].va_addr;
            // The previous consumer signaled past the recorded timeline,
            // so the host owns the slot again.
            unsafe { ptr::copy_nonoverlapping(src[off..].as_ptr(), slot_addr as *mut u8, len) };
            let mut q = self.copy_queue()?;
            q.wait(&self.timeline_signal, self.timeline_value - 1)?
                .copy(dest.va_addr + off as u64, slot_addr, len as u64)?
                .signal(&self.timeline_signal, self.timeline_value)?
                .submit(self)?;
            self.staging.timelines[slot] = self.timeline_value;
            self.timeline_value += 1;
            off += len;
        }
        let desc = format!("CPU -> {}", self.name());
        self.prof_end(prof, desc, true)
    }

    /// Streams up to `size` bytes from a sharded source into `dest`.
    ///
    /// Slots are reserved (`STAGING_RESERVED`) before the source reads
    /// into them and promoted to the assigned timeline value once the
    /// copy is submitted; a ring with no reusable slot throttles the
    /// producer until the device catches up.
    pub fn copy_from_disk<S: ShardedSource>(
        &mut self,
        dest: &HcqBuffer,
        src: &mut S,
        size: usize,
    ) -> Result<()> {
        let prof = self.prof_begin(true)?;
        let seg = self.staging.bufs[0].size;
        let count = self.staging.bufs.len();
        let mut copied = 0;
        while copied < size {
            let slot = (self.staging.next + 1) % count;
            if self.staging.timelines[slot] > self.timeline_signal.value() {
                trace!("{}: staging ring throttled on slot {slot}", self.name());
            }
            self.timeline_signal
                .wait(self.staging.timelines[slot], self.wait_timeout_ms)?;
            self.staging.timelines[slot] = STAGING_RESERVED;
            self.staging.next = slot;
            let slot_addr = self.staging.bufs[slot].va_addr;
            let Some(chunk) = src.fill(slot_addr, seg)? else {
                // Unused reservation: the slot was confirmed free above.
                self.staging.timelines[slot] = 0;
                break;
            };
            let mut q = self.copy_queue()?;
            q.wait(&self.timeline_signal, self.timeline_value - 1)?
                .copy(
                    dest.va_addr + chunk.dst_off,
                    slot_addr + chunk.src_off,
                    chunk.len as u64,
                )?
                .signal(&self.timeline_signal, self.timeline_value)?
                .submit(self)?;
            self.staging.timelines[slot] = self.timeline_value;
            self.timeline_value += 1;
            copied += chunk.len;
        }
        let desc = format!("DISK -> {}", self.name());
        self.prof_end(prof, desc, true)
    }

    /// Chunked device-to-host copy.
    ///
    /// Synchronizes first so `src` is settled, then round-trips every
    /// chunk through staging slot 0 with a synchronous wait before each
    /// memcpy out.
    pub fn copy_out(&mut self, dest: &mut [u8], src: &HcqBuffer) -> Result<()> {
        self.synchronize()?;
        let prof = self.prof_begin(true)?;
        let seg = self.staging.bufs[0].size;
        let slot_addr = self.staging.bufs[0].va_addr;
        let mut off = 0;
        while off < dest.len() {
            let len = seg.min(dest.len() - off);
            let mut q = self.copy_queue()?;
            q.wait(&self.timeline_signal, self.timeline_value - 1)?
                .copy(slot_addr, src.va_addr + off as u64, len as u64)?
                .signal(&self.timeline_signal, self.timeline_value)?
                .submit(self)?;
            self.timeline_signal
                .wait(self.timeline_value, self.wait_timeout_ms)?;
            self.timeline_value += 1;
            unsafe { ptr::copy_nonoverlapping(slot_addr as *const u8, dest[off..].as_mut_ptr(), len) };
            off += len;
        }
        let desc = format!("{} -> CPU", self.name());
        self.prof_end(prof, desc, true)
    }
}

/// Copies `size` bytes from `src` on `src_dev` to `dest` on `dest_dev`.
///
/// The copy rides the source device's copy queue behind waits on both
/// timelines; a wait-wait-signal rendezvous on the destination compute
/// queue then makes subsequent destination work observe the transfer.
/// (Two exclusive device borrows are necessarily distinct devices;
/// intra-device moves are plain copy-queue submissions.)
pub fn transfer<B: Backend>(
    dest: &HcqBuffer,
    src: &HcqBuffer,
    size: usize,
    src_dev: &mut Device<B>,
    dest_dev: &mut Device<B>,
) -> Result<()> {
    src_dev.backend.map(dest)?;

    let prof = src_dev.prof_begin(true)?;
    let mut q = src_dev.copy_queue()?;
    q.wait(&src_dev.timeline_signal, src_dev.timeline_value - 1)?
        .wait(&dest_dev.timeline_signal, dest_dev.timeline_value - 1)?
        .copy(dest.va_addr, src.va_addr, size as u64)?
        .signal(&src_dev.timeline_signal, src_dev.timeline_value)?
        .submit(src_dev)?;
    src_dev.timeline_value += 1;
    let desc = format!("{} -> {}", src_dev.name(), dest_dev.name());
    src_dev.prof_end(prof, desc, true)?;

    let mut q = dest_dev.comp_queue();
    q.wait(&src_dev.timeline_signal, src_dev.timeline_value - 1)?
        .wait(&dest_dev.timeline_signal, dest_dev.timeline_value - 1)?
        .signal(&dest_dev.timeline_signal, dest_dev.timeline_value)?
        .submit(dest_dev)?;
    dest_dev.timeline_value += 1;
    Ok(())
}
