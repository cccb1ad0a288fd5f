//! Software device used by the test suite: queues encode into a tiny
//! 32-bit word ISA and submission ships the words to a per-engine
//! executor thread, which interprets them against a shared [`HostArena`].
//! Signals, buffers and kernargs all live in that arena, so wait/signal
//! ordering, staging-ring reuse and cross-device rendezvous run with real
//! concurrency.

use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rust_decimal::Decimal;

use crate::dev::Backend;
use crate::error::{HcqError, Result};
use crate::exec::{ArgsState, Program};
use crate::mem::arena::HostArena;
use crate::mem::{BufferSpec, HcqBuffer};
use crate::queue::{CmdStream, HwQueue, QueueKind};
use crate::signal::Signal;

const OP_SIGNAL: u32 = 1;
const OP_WAIT: u32 = 2;
const OP_TIMESTAMP: u32 = 3;
const OP_BARRIER: u32 = 4;
const OP_EXEC: u32 = 5;
const OP_COPY: u32 = 6;

/// Mock ticks are CLOCK_MONOTONIC nanoseconds, a clock domain distinct
/// from the host epoch used by calibration.
const TIMESTAMP_DIVIDER: u64 = 1000;

fn device_ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub(crate) type KernelFn = Box<dyn Fn(u64) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExecRecord {
    pub kernel: u32,
    pub args_ptr: u64,
    pub global_size: [u32; 3],
    pub local_size: [u32; 3],
}

fn read_u64(words: &[u32], at: usize) -> u64 {
    words[at] as u64 | (words[at + 1] as u64) << 32
}

fn run_engine(
    rx: Receiver<Vec<u32>>,
    execs: Arc<Mutex<Vec<ExecRecord>>>,
    kernels: Arc<Mutex<HashMap<u32, KernelFn>>>,
) {
    while let Ok(words) = rx.recv() {
        let mut pc = 0;
        while pc < words.len() {
            match words[pc] {
                OP_SIGNAL => {
                    let addr = read_u64(&words, pc + 1);
                    let value = read_u64(&words, pc + 3);
                    let cell = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
                    cell.store(value, Ordering::Release);
                    pc += 5;
                }
                OP_WAIT => {
                    let addr = read_u64(&words, pc + 1);
                    let value = read_u64(&words, pc + 3);
                    let cell = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
                    let start = Instant::now();
                    while cell.load(Ordering::Acquire) < value {
                        if start.elapsed().as_secs() > 30 {
                            panic!("mock engine stuck waiting for {value} at {addr:#x}");
                        }
                        thread::yield_now();
                    }
                    pc += 5;
                }
                OP_TIMESTAMP => {
                    let addr = read_u64(&words, pc + 1);
                    let cell = unsafe { AtomicU64::from_ptr(addr as *mut u64) };
                    cell.store(device_ticks(), Ordering::Release);
                    pc += 3;
                }
                OP_BARRIER => {
                    fence(Ordering::SeqCst);
                    pc += 1;
                }
                OP_EXEC => {
                    let record = ExecRecord {
                        kernel: words[pc + 1],
                        args_ptr: read_u64(&words, pc + 2),
                        global_size: [words[pc + 4], words[pc + 5], words[pc + 6]],
                        local_size: [words[pc + 7], words[pc + 8], words[pc + 9]],
                    };
                    if let Some(f) = kernels.lock().unwrap().get(&record.kernel) {
                        f(record.args_ptr);
                    }
                    execs.lock().unwrap().push(record);
                    pc += 10;
                }
                OP_COPY => {
                    let dest = read_u64(&words, pc + 1);
                    let src = read_u64(&words, pc + 3);
                    let len = read_u64(&words, pc + 5) as usize;
                    unsafe {
                        std::ptr::copy_nonoverlapping(src as *const u8, dest as *mut u8, len)
                    };
                    pc += 7;
                }
                op => panic!("mock engine hit unknown opcode {op}"),
            }
        }
    }
}

/// Args block layout: `bufs` as little-endian u64 addresses, then `vals`.
pub(crate) struct MockArgs {
    ptr: u64,
    n_bufs: usize,
}

impl ArgsState for MockArgs {
    fn ptr(&self) -> u64 {
        self.ptr
    }

    fn update_buffer(&mut self, index: usize, buf: &HcqBuffer) -> Result<()> {
        let cell = unsafe { AtomicU64::from_ptr((self.ptr + 8 * index as u64) as *mut u64) };
        cell.store(buf.va_addr, Ordering::Release);
        Ok(())
    }

    fn update_var(&mut self, index: usize, val: u64) -> Result<()> {
        let at = self.ptr + 8 * (self.n_bufs + index) as u64;
        let cell = unsafe { AtomicU64::from_ptr(at as *mut u64) };
        cell.store(val, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MockQueue {
    kind: QueueKind,
    stream: CmdStream,
    tx: Sender<Vec<u32>>,
}

impl HwQueue for MockQueue {
    type B = MockBackend;

    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn stream(&self) -> &CmdStream {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut CmdStream {
        &mut self.stream
    }

    fn enc_signal(&mut self, signal: &Signal, value: u64) -> Result<()> {
        self.stream.push(&[OP_SIGNAL]);
        self.stream.push_u64(signal.value_addr());
        self.stream.push_u64(value);
        Ok(())
    }

    fn enc_wait(&mut self, signal: &Signal, value: u64) -> Result<()> {
        self.stream.push(&[OP_WAIT]);
        self.stream.push_u64(signal.value_addr());
        self.stream.push_u64(value);
        Ok(())
    }

    fn enc_timestamp(&mut self, signal: &Signal) -> Result<()> {
        self.stream.push(&[OP_TIMESTAMP]);
        self.stream.push_u64(signal.timestamp_addr());
        Ok(())
    }

    fn enc_memory_barrier(&mut self) -> Result<()> {
        if self.kind == QueueKind::Compute {
            self.stream.push(&[OP_BARRIER]);
        }
        Ok(())
    }

    fn enc_exec(
        &mut self,
        prg: &Program<MockBackend>,
        args: &MockArgs,
        global_size: [u32; 3],
        local_size: [u32; 3],
    ) -> Result<()> {
        if self.kind != QueueKind::Compute {
            return Err(HcqError::NotImplementedByBackend("exec"));
        }
        self.stream.push(&[OP_EXEC, prg.kernel]);
        self.stream.push_u64(args.ptr());
        self.stream.push(&global_size);
        self.stream.push(&local_size);
        Ok(())
    }

    fn enc_copy(&mut self, dest: u64, src: u64, copy_size: u64) -> Result<()> {
        if self.kind != QueueKind::Copy {
            return Err(HcqError::NotImplementedByBackend("copy"));
        }
        self.stream.push(&[OP_COPY]);
        self.stream.push_u64(dest);
        self.stream.push_u64(src);
        self.stream.push_u64(copy_size);
        Ok(())
    }

    fn enc_update_signal(
        &mut self,
        idx: usize,
        signal: Option<&Signal>,
        value: Option<u64>,
    ) -> Result<()> {
        if let Some(signal) = signal {
            self.stream.patch_u64(idx, 1, signal.value_addr());
        }
        if let Some(value) = value {
            self.stream.patch_u64(idx, 3, value);
        }
        Ok(())
    }

    fn enc_update_wait(
        &mut self,
        idx: usize,
        signal: Option<&Signal>,
        value: Option<u64>,
    ) -> Result<()> {
        self.enc_update_signal(idx, signal, value)
    }

    fn enc_update_exec(
        &mut self,
        idx: usize,
        global_size: Option<[u32; 3]>,
        local_size: Option<[u32; 3]>,
    ) -> Result<()> {
        if let Some(g) = global_size {
            self.stream.patch(idx, 4, &g);
        }
        if let Some(l) = local_size {
            self.stream.patch(idx, 7, &l);
        }
        Ok(())
    }

    fn enc_update_copy(&mut self, idx: usize, dest: Option<u64>, src: Option<u64>) -> Result<()> {
        if let Some(dest) = dest {
            self.stream.patch_u64(idx, 1, dest);
        }
        if let Some(src) = src {
            self.stream.patch_u64(idx, 3, src);
        }
        Ok(())
    }

    fn enc_submit(&mut self, _dev: &mut crate::dev::Device<MockBackend>) -> Result<()> {
        self.tx
            .send(self.stream.words().to_vec())
            .map_err(|_| HcqError::DeviceHang)
    }
}

pub(crate) struct MockBackend {
    arena: HostArena,
    bump: u64,
    comp_tx: Option<Sender<Vec<u32>>>,
    copy_tx: Option<Sender<Vec<u32>>>,
    engines: Vec<JoinHandle<()>>,
    pub(crate) execs: Arc<Mutex<Vec<ExecRecord>>>,
    kernels: Arc<Mutex<HashMap<u32, KernelFn>>>,
    next_kernel: u32,
    pub(crate) recover_on_hang: bool,
}

impl MockBackend {
    pub(crate) fn new(arena_len: usize, with_copy: bool) -> MockBackend {
        let arena = HostArena::new(arena_len).unwrap();
        let execs = Arc::new(Mutex::new(Vec::new()));
        let kernels = Arc::new(Mutex::new(HashMap::new()));

        let mut engines = Vec::new();
        let (comp_tx, rx) = unbounded();
        let (e, k) = (Arc::clone(&execs), Arc::clone(&kernels));
        engines.push(thread::spawn(move || run_engine(rx, e, k)));

        let copy_tx = with_copy.then(|| {
            let (tx, rx) = unbounded();
            let (e, k) = (Arc::clone(&execs), Arc::clone(&kernels));
            engines.push(thread::spawn(move || run_engine(rx, e, k)));
            tx
        });

        MockBackend {
            arena,
            bump: 0,
            comp_tx: Some(comp_tx),
            copy_tx,
            engines,
            execs,
            kernels,
            next_kernel: 0,
            recover_on_hang: false,
        }
    }

    pub(crate) fn register_kernel(&mut self, f: impl Fn(u64) + Send + 'static) -> u32 {
        let id = self.next_kernel;
        self.next_kernel += 1;
        self.kernels.lock().unwrap().insert(id, Box::new(f));
        id
    }

    pub(crate) fn exec_records(&self) -> Vec<ExecRecord> {
        self.execs.lock().unwrap().clone()
    }
}

impl Backend for MockBackend {
    type Kernel = u32;
    type Args = MockArgs;
    type CompQueue = MockQueue;
    type CopyQueue = MockQueue;

    fn new_signal(&mut self, value: u64, timeline_for: Option<u32>) -> Result<Signal> {
        let buf = self.alloc(16, BufferSpec::default())?;
        Ok(unsafe {
            Signal::new(
                buf.va_addr,
                value,
                Decimal::from(TIMESTAMP_DIVIDER),
                0,
                8,
                timeline_for,
            )
        })
    }

    fn comp_queue(&mut self) -> MockQueue {
        MockQueue {
            kind: QueueKind::Compute,
            stream: CmdStream::new(),
            tx: self.comp_tx.clone().unwrap(),
        }
    }

    fn copy_queue(&mut self) -> Option<MockQueue> {
        Some(MockQueue {
            kind: QueueKind::Copy,
            stream: CmdStream::new(),
            tx: self.copy_tx.clone()?,
        })
    }

    fn alloc(&mut self, size: usize, spec: BufferSpec) -> Result<HcqBuffer> {
        let aligned = (size as u64 + 63) & !63;
        if self.bump + aligned > self.arena.len() as u64 {
            return Err(HcqError::AllocationFailed { size, spec });
        }
        let va_addr = self.arena.addr() + self.bump;
        self.bump += aligned;
        Ok(HcqBuffer::new(va_addr, size, spec))
    }

    fn fill_args(
        &mut self,
        ptr: u64,
        _prg: &Program<Self>,
        bufs: &[HcqBuffer],
        vals: &[u64],
    ) -> Result<MockArgs> {
        let mut args = MockArgs {
            ptr,
            n_bufs: bufs.len(),
        };
        for (i, buf) in bufs.iter().enumerate() {
            args.update_buffer(i, buf)?;
        }
        for (i, val) in vals.iter().enumerate() {
            args.update_var(i, *val)?;
        }
        Ok(args)
    }

    fn on_device_hang(&mut self, cause: HcqError) -> Result<()> {
        if self.recover_on_hang {
            Ok(())
        } else {
            Err(cause)
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        // Disconnect the channels so the engines drain and exit, and join
        // them before the arena unmaps.
        self.comp_tx = None;
        self.copy_tx = None;
        for engine in self.engines.drain(..) {
            let _ = engine.join();
        }
    }
}

pub(crate) fn small_opts() -> crate::dev::DeviceOpts {
    crate::dev::DeviceOpts {
        kernargs_size: 64 << 10,
        staging_size: 256,
        staging_count: 4,
        wait_timeout_ms: Some(5_000),
    }
}

/// A small mock device: 1 MiB arena, both queue kinds, short timeouts.
pub(crate) fn test_device(name: &str) -> crate::dev::Device<MockBackend> {
    crate::dev::Device::with_opts(name, MockBackend::new(1 << 20, true), None, small_opts())
        .unwrap()
}
