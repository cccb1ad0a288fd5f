
use std::fmt;

use crate::dev::{Backend, Device};
use crate::error::{HcqError, Result};
use crate::exec::Program;
use crate::signal::Signal;

/// Queue-type asymmetry is part of the public contract: compute queues
/// support `memory_barrier` and `exec`, copy queues support `copy`. Both
/// support `signal`, `wait` and `timestamp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Compute,
    Copy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdKind {
    Signal,
    Wait,
    Timestamp,
    MemoryBarrier,
    Exec,
    Copy,
}

impl fmt::Display for CmdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmdKind::Signal => "signal",
            CmdKind::Wait => "wait",
            CmdKind::Timestamp => "timestamp",
            CmdKind::MemoryBarrier => "memory_barrier",
            CmdKind::Exec => "exec",
            CmdKind::Copy => "copy",
        };
        f.write_str(name)
    }
}

/// Append-only command stream: a flat 32-bit word buffer plus, parallel to
/// it, the starting offset, word length and kind of every command.
///
/// `offsets[i] + lens[i] == offsets[i + 1]` for every `i`, so the word
/// buffer is a concatenation of command records in append order. This is
/// what makes O(1) index-to-slice mapping (and thus in-place patching)
/// possible.
#[derive(Default, Debug)]
pub struct CmdStream {
    words: Vec<u32>,
    offsets: Vec<usize>,
    lens: Vec<usize>,
    kinds: Vec<CmdKind>,
    bound_device: Option<u32>,
}

impl CmdStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw words to the stream. Backend encoders call this from
    /// within an append-and-record scope.
    pub fn push(&mut self, words: &[u32]) {
        self.words.extend_from_slice(words);
    }

    /// Appends a 64-bit value as two little-endian words.
    pub fn push_u64(&mut self, value: u64) {
        self.push(&[value as u32, (value >> 32) as u32]);
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn kind_at(&self, idx: usize) -> CmdKind {
        self.kinds[idx]
    }

    pub fn cmd_offset(&self, idx: usize) -> usize {
        self.offsets[idx]
    }

    pub fn cmd_len(&self, idx: usize) -> usize {
        self.lens[idx]
    }

    /// The word slice of command `idx`.
    pub fn cmd_words(&self, idx: usize) -> &[u32] {
        let st = self.offsets[idx];
        &self.words[st..st + self.lens[idx]]
    }

    /// Rewrites `data.len()` words starting `offset` words into command
    /// `idx`.
    pub fn patch(&mut self, idx: usize, offset: usize, data: &[u32]) {
        let st = self.offsets[idx] + offset;
        self.words[st..st + data.len()].copy_from_slice(data);
    }

    /// Rewrites a 64-bit field at `offset` words into command `idx`.
    pub fn patch_u64(&mut self, idx: usize, offset: usize, value: u64) {
        self.patch(idx, offset, &[value as u32, (value >> 32) as u32]);
    }

    /// Device this stream was lowered onto by `bind`, if any.
    pub fn bound_device(&self) -> Option<u32> {
        self.bound_device
    }

    pub(crate) fn record(&mut self, kind: CmdKind, offset: usize, len: usize) {
        self.offsets.push(offset);
        self.lens.push(len);
        self.kinds.push(kind);
    }

    pub(crate) fn rollback(&mut self, offset: usize) {
        self.words.truncate(offset);
    }

    pub(crate) fn set_bound_device(&mut self, device_id: u32) {
        self.bound_device = Some(device_id);
    }
}

/// A hardware command queue builder.
///
/// Backends implement the `enc_*` packet encoders (and their in-place
/// patchers) over [`CmdStream`]; the provided methods wrap every encoder
/// in the append-and-record protocol and return the queue for chaining:
///
/// ```ignore
/// q.wait(&dev.timeline_signal, dev.timeline_value - 1)?
///     .memory_barrier()?
///     .signal(&dev.timeline_signal, dev.timeline_value)?
///     .submit(&mut dev)?;
/// ```
///
/// A queue is owned by one producer at a time; nothing here is
/// thread-safe.
pub trait HwQueue: Sized {
    type B: Backend;

    fn kind(&self) -> QueueKind;
    fn stream(&self) -> &CmdStream;
    fn stream_mut(&mut self) -> &mut CmdStream;

    // Backend packet encoders. Updatable fields must sit at fixed offsets
    // within each encoding so the patchers can find them.

    fn enc_signal(&mut self, signal: &Signal, value: u64) -> Result<()>;
    fn enc_wait(&mut self, signal: &Signal, value: u64) -> Result<()>;
    fn enc_timestamp(&mut self, signal: &Signal) -> Result<()>;

    /// Cross-engine coherence. Copy queues leave this as the no-op.
    fn enc_memory_barrier(&mut self) -> Result<()> {
        Ok(())
    }

    fn enc_exec(
        &mut self,
        prg: &Program<Self::B>,
        args: &<Self::B as Backend>::Args,
        global_size: [u32; 3],
        local_size: [u32; 3],
    ) -> Result<()> {
        let _ = (prg, args, global_size, local_size);
        Err(HcqError::NotImplementedByBackend("exec"))
    }

    fn enc_copy(&mut self, dest: u64, src: u64, copy_size: u64) -> Result<()> {
        let _ = (dest, src, copy_size);
        Err(HcqError::NotImplementedByBackend("copy"))
    }

    fn enc_update_signal(
        &mut self,
        idx: usize,
        signal: Option<&Signal>,
        value: Option<u64>,
    ) -> Result<()> {
        let _ = (idx, signal, value);
        Err(HcqError::NotImplementedByBackend("update_signal"))
    }

    fn enc_update_wait(
        &mut self,
        idx: usize,
        signal: Option<&Signal>,
        value: Option<u64>,
    ) -> Result<()> {
        let _ = (idx, signal, value);
        Err(HcqError::NotImplementedByBackend("update_wait"))
    }

    fn enc_update_exec(
        &mut self,
        idx: usize,
        global_size: Option<[u32; 3]>,
        local_size: Option<[u32; 3]>,
    ) -> Result<()> {
        let _ = (idx, global_size, local_size);
        Err(HcqError::NotImplementedByBackend("update_exec"))
    }

    fn enc_update_copy(&mut self, idx: usize, dest: Option<u64>, src: Option<u64>) -> Result<()> {
        let _ = (idx, dest, src);
        Err(HcqError::NotImplementedByBackend("update_copy"))
    }

    /// Optional lowering of the queue into a device-resident form.
    fn enc_bind(&mut self, dev: &mut Device<Self::B>) -> Result<()> {
        let _ = dev;
        Ok(())
    }

    fn enc_submit(&mut self, dev: &mut Device<Self::B>) -> Result<()>;

    // Append-and-record protocol.

    /// Snapshots the word offset, runs the encoder, then records the
    /// emitted length under `kind`. A failed encoder rolls the word buffer
    /// back and records nothing.
    fn append<F>(&mut self, kind: CmdKind, emit: F) -> Result<&mut Self>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let offset = self.stream().words().len();
        match emit(self) {
            Ok(()) => {
                let len = self.stream().words().len() - offset;
                self.stream_mut().record(kind, offset, len);
                Ok(self)
            }
            Err(e) => {
                self.stream_mut().rollback(offset);
                Err(e)
            }
        }
    }

    /// Sets `signal` to `value` once all previously enqueued work
    /// completes.
    fn signal(&mut self, signal: &Signal, value: u64) -> Result<&mut Self> {
        self.append(CmdKind::Signal, |q| q.enc_signal(signal, value))
    }

    /// Stalls the queue until `signal` reaches `value`.
    fn wait(&mut self, signal: &Signal, value: u64) -> Result<&mut Self> {
        self.append(CmdKind::Wait, |q| q.enc_wait(signal, value))
    }

    /// Writes the device tick count into `signal` once prior work
    /// completes.
    fn timestamp(&mut self, signal: &Signal) -> Result<&mut Self> {
        self.append(CmdKind::Timestamp, |q| q.enc_timestamp(signal))
    }

    /// Compute queues only.
    fn memory_barrier(&mut self) -> Result<&mut Self> {
        self.append(CmdKind::MemoryBarrier, |q| q.enc_memory_barrier())
    }

    /// Compute queues only.
    fn exec(
        &mut self,
        prg: &Program<Self::B>,
        args: &<Self::B as Backend>::Args,
        global_size: [u32; 3],
        local_size: [u32; 3],
    ) -> Result<&mut Self> {
        self.append(CmdKind::Exec, |q| q.enc_exec(prg, args, global_size, local_size))
    }

    /// Copy queues only.
    fn copy(&mut self, dest: u64, src: u64, copy_size: u64) -> Result<&mut Self> {
        self.append(CmdKind::Copy, |q| q.enc_copy(dest, src, copy_size))
    }

    fn expect_kind(&self, idx: usize, expected: CmdKind) -> Result<()> {
        let actual = self.stream().kind_at(idx);
        if actual == expected {
            Ok(())
        } else {
            Err(HcqError::CommandKindMismatch {
                idx,
                expected,
                actual,
            })
        }
    }

    /// Rewrites a previously queued signal command in place. `None` fields
    /// keep their original encoding.
    fn update_signal(
        &mut self,
        idx: usize,
        signal: Option<&Signal>,
        value: Option<u64>,
    ) -> Result<&mut Self> {
        self.expect_kind(idx, CmdKind::Signal)?;
        self.enc_update_signal(idx, signal, value)?;
        Ok(self)
    }

    fn update_wait(
        &mut self,
        idx: usize,
        signal: Option<&Signal>,
        value: Option<u64>,
    ) -> Result<&mut Self> {
        self.expect_kind(idx, CmdKind::Wait)?;
        self.enc_update_wait(idx, signal, value)?;
        Ok(self)
    }

    fn update_exec(
        &mut self,
        idx: usize,
        global_size: Option<[u32; 3]>,
        local_size: Option<[u32; 3]>,
    ) -> Result<&mut Self> {
        self.expect_kind(idx, CmdKind::Exec)?;
        self.enc_update_exec(idx, global_size, local_size)?;
        Ok(self)
    }

    fn update_copy(&mut self, idx: usize, dest: Option<u64>, src: Option<u64>) -> Result<&mut Self> {
        self.expect_kind(idx, CmdKind::Copy)?;
        self.enc_update_copy(idx, dest, src)?;
        Ok(self)
    }

    /// Associates the queue with a device so the backend can precompile it
    /// into a device-resident form.
    fn bind(&mut self, dev: &mut Device<Self::B>) -> Result<&mut Self> {
        self.enc_bind(dev)?;
        let id = dev.device_id();
        self.stream_mut().set_bound_device(id);
        Ok(self)
    }

    /// Hands the stream to the backend's submission primitive. A no-op on
    /// an empty stream. Never advances the device timeline itself; callers
    /// enqueue the `signal(timeline, next)` command.
    fn submit(&mut self, dev: &mut Device<Self::B>) -> Result<&mut Self> {
        if !self.stream().is_empty() {
            self.enc_submit(dev)?;
        }
        Ok(self)
    }
}
