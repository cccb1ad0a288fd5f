
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Instant;

use log::{debug, trace};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{HcqError, Result};
use crate::exec::{ArgsState, Program};
use crate::mem::{BufferSpec, HcqBuffer, StagingRing, DEFAULT_STAGING_COUNT, DEFAULT_STAGING_SIZE};
use crate::profile::{DepEndpoint, DepProfRecord, ProfileHandle, RawProfRecord, SigProfRecord};
use crate::queue::HwQueue;
use crate::signal::Signal;

/// Size of the kernargs arena mapped at device init.
pub const KERNARGS_ARENA_SIZE: usize = 16 << 20;

/// Timeline values past this point retire the active signal (see
/// [`Device::wrap_timeline_signal`]).
const TIMELINE_WRAP: u64 = 1 << 31;

const CLOCK_SAMPLES: usize = 100;
const PAIR_SAMPLES: usize = 20;

/// The device-specific half of the runtime.
///
/// A backend supplies signal, queue and args-state factories, the memory
/// allocator primitives, and (through [`HwQueue`]) the packet encoders.
pub trait Backend: Sized {
    /// Handle produced by the backend's program loader.
    type Kernel;
    type Args: ArgsState;
    type CompQueue: HwQueue<B = Self>;
    type CopyQueue: HwQueue<B = Self>;

    /// Allocates a fresh device-shared signal. `timeline_for` is set only
    /// when the signal will be a device's timeline.
    fn new_signal(&mut self, value: u64, timeline_for: Option<u32>) -> Result<Signal>;

    fn comp_queue(&mut self) -> Self::CompQueue;

    /// Copy engines are optional; backends without one return `None`.
    fn copy_queue(&mut self) -> Option<Self::CopyQueue>;

    fn alloc(&mut self, size: usize, spec: BufferSpec) -> Result<HcqBuffer>;

    /// Makes `buf` (owned by a peer device) reachable from this device's
    /// address space.
    fn map(&mut self, buf: &HcqBuffer) -> Result<()> {
        let _ = buf;
        Ok(())
    }

    /// Lays out an args block of backend-defined shape at `ptr`, writing
    /// `bufs` and `vals` into their slots.
    fn fill_args(
        &mut self,
        ptr: u64,
        prg: &Program<Self>,
        bufs: &[HcqBuffer],
        vals: &[u64],
    ) -> Result<Self::Args>;

    /// Invoked when `synchronize` times out waiting on the timeline.
    /// Backends that can reset their engines return `Ok(())` to let the
    /// synchronize continue; the default re-raises the cause.
    fn on_device_hang(&mut self, cause: HcqError) -> Result<()> {
        Err(cause)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceOpts {
    pub kernargs_size: usize,
    pub staging_size: usize,
    pub staging_count: usize,
    /// Per-device override of the signal wait timeout.
    pub wait_timeout_ms: Option<u64>,
}

impl Default for DeviceOpts {
    fn default() -> Self {
        Self {
            kernargs_size: KERNARGS_ARENA_SIZE,
            staging_size: DEFAULT_STAGING_SIZE,
            staging_count: DEFAULT_STAGING_COUNT,
            wait_timeout_ms: None,
        }
    }
}

struct KernargsArena {
    page: HcqBuffer,
    ptr: u64,
}

/// Per-device runtime state: the timeline pair, the kernargs arena, the
/// staging ring and the profiling records.
///
/// The timeline signal linearizes all submissions on the device: every
/// submission ends with `signal(timeline, next)` and every dependent
/// submission begins with `wait(timeline, next - 1)`.
pub struct Device<B: Backend> {
    pub backend: B,
    pub timeline_signal: Signal,
    /// Next value to be signaled on the timeline; always >= 1.
    pub timeline_value: u64,
    name: String,
    device_id: u32,
    shadow_timeline_signal: Signal,
    kernargs: KernargsArena,
    pub(crate) staging: StagingRing,
    pub(crate) wait_timeout_ms: Option<u64>,
    pub(crate) sig_prof_records: Vec<SigProfRecord>,
    pub(crate) raw_prof_records: Vec<RawProfRecord>,
    pub(crate) dep_prof_records: Vec<DepProfRecord>,
    gpu2cpu_compute_time_diff: Option<Decimal>,
    gpu2cpu_copy_time_diff: Option<Decimal>,
    profile: Option<ProfileHandle>,
}

impl<B: Backend> Device<B> {
    /// Opens a device named `"family"` or `"family:index"`; the index
    /// defaults to 0.
    pub fn new(device: &str, backend: B, profile: Option<ProfileHandle>) -> Result<Self> {
        Self::with_opts(device, backend, profile, DeviceOpts::default())
    }

    pub fn with_opts(
        device: &str,
        mut backend: B,
        profile: Option<ProfileHandle>,
        opts: DeviceOpts,
    ) -> Result<Self> {
        let device_id = match device.split_once(':') {
            Some((_, idx)) => idx.parse().unwrap_or(0),
            None => 0,
        };
        let timeline_signal = backend.new_signal(0, Some(device_id))?;
        let shadow_timeline_signal = backend.new_signal(0, Some(device_id))?;
        let kernargs_page = backend.alloc(
            opts.kernargs_size,
            BufferSpec {
                cpu_access: true,
                ..Default::default()
            },
        )?;
        let staging = StagingRing::new(&mut backend, opts.staging_size, opts.staging_count)?;
        Ok(Self {
            backend,
            timeline_signal,
            timeline_value: 1,
            name: device.to_string(),
            device_id,
            shadow_timeline_signal,
            kernargs: KernargsArena {
                ptr: kernargs_page.va_addr,
                page: kernargs_page,
            },
            staging,
            wait_timeout_ms: opts.wait_timeout_ms,
            sig_prof_records: Vec::new(),
            raw_prof_records: Vec::new(),
            dep_prof_records: Vec::new(),
            gpu2cpu_compute_time_diff: None,
            gpu2cpu_copy_time_diff: None,
            profile,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn profiling(&self) -> bool {
        self.profile.is_some()
    }

    pub fn comp_queue(&mut self) -> B::CompQueue {
        self.backend.comp_queue()
    }

    pub fn copy_queue(&mut self) -> Result<B::CopyQueue> {
        self.backend
            .copy_queue()
            .ok_or(HcqError::NotImplementedByBackend("copy queue"))
    }

    /// Blocks until every prior submission has signaled the timeline.
    ///
    /// A wait timeout is routed through the backend's `on_device_hang`
    /// hook before surfacing. On success the timeline wraps if it crossed
    /// 2^31, and buffered signal-pair profile records are resolved into
    /// raw timestamps (observable now that the work has completed).
    pub fn synchronize(&mut self) -> Result<()> {
        if let Err(e) = self
            .timeline_signal
            .wait(self.timeline_value - 1, self.wait_timeout_ms)
        {
            match e {
                HcqError::WaitTimeout { .. } => self.backend.on_device_hang(e)?,
                e => return Err(e),
            }
        }

        if self.timeline_value > TIMELINE_WRAP {
            self.wrap_timeline_signal();
        }
        if self.profiling() {
            for r in self.sig_prof_records.drain(..) {
                self.raw_prof_records.push(RawProfRecord {
                    st: r.st.timestamp(),
                    en: r.en.timestamp(),
                    desc: r.desc,
                    is_copy: r.is_copy,
                    args: r.args,
                });
            }
        }
        Ok(())
    }

    /// Swaps the active and shadow timeline signals and restarts the
    /// timeline at 1.
    ///
    /// Safe only right after a full synchronize: no in-flight work may
    /// reference the retired signal. Staging-ring timelines reset to 0, so
    /// every staging buffer is immediately reusable against the new
    /// timeline.
    pub fn wrap_timeline_signal(&mut self) {
        trace!("{}: timeline wrap at {}", self.name, self.timeline_value);
        std::mem::swap(&mut self.timeline_signal, &mut self.shadow_timeline_signal);
        self.timeline_signal.set_value(0);
        self.timeline_value = 1;
        self.staging.reset_timelines();
    }

    /// Bump-pointer allocation in the kernargs arena.
    ///
    /// The arena wraps unconditionally: every allocation is paired with a
    /// pending submission and the arena is many times larger than the
    /// in-flight set, so a wrapped-over block has already been consumed.
    pub fn alloc_kernargs(&mut self, size: usize) -> u64 {
        let base = self.kernargs.page.va_addr;
        let end = base + self.kernargs.page.size as u64;
        if self.kernargs.ptr + size as u64 > end {
            self.kernargs.ptr = base;
        }
        let res = self.kernargs.ptr;
        self.kernargs.ptr += size as u64;
        res
    }

    /// One calibration round: one sample per queue kind this device has.
    fn sample_clock_round(&mut self, comp: &mut Vec<Decimal>, copy: &mut Vec<Decimal>) -> Result<()> {
        let q = self.backend.comp_queue();
        comp.push(clock_sample(self, q)?);
        if let Some(q) = self.backend.copy_queue() {
            copy.push(clock_sample(self, q)?);
        }
        Ok(())
    }

    fn set_time_diffs(&mut self, comp: &mut [Decimal], copy: &mut [Decimal]) {
        self.gpu2cpu_compute_time_diff = Some(median(comp));
        if !copy.is_empty() {
            self.gpu2cpu_copy_time_diff = Some(median(copy));
        }
    }

    /// Memoized per-device clock calibration: for each queue kind present,
    /// medians ~100 samples of `(host window midpoint) - (device
    /// timestamp)` into the gpu-to-cpu diff for that kind.
    pub fn ensure_time_base(&mut self) -> Result<()> {
        if self.gpu2cpu_compute_time_diff.is_some() {
            return Ok(());
        }
        let mut comp = Vec::with_capacity(CLOCK_SAMPLES);
        let mut copy = Vec::with_capacity(CLOCK_SAMPLES);
        for _ in 0..CLOCK_SAMPLES {
            self.sample_clock_round(&mut comp, &mut copy)?;
        }
        self.set_time_diffs(&mut comp, &mut copy);
        Ok(())
    }

    /// Translates a device-local timestamp (µs) onto the host timeline.
    pub fn gpu_to_cpu_time(&mut self, gpu_time: Decimal, is_copy: bool) -> Result<Decimal> {
        self.ensure_time_base()?;
        let diff = if is_copy {
            self.gpu2cpu_copy_time_diff
                .or(self.gpu2cpu_compute_time_diff)
        } else {
            self.gpu2cpu_compute_time_diff
        };
        Ok(gpu_time + diff.unwrap_or(Decimal::ZERO))
    }

    /// Records a cross-queue dependency edge for the trace document.
    pub fn record_dep(&mut self, from: DepEndpoint, to: DepEndpoint) {
        self.dep_prof_records.push(DepProfRecord { from, to });
    }

    /// Queues a profile section for resolution at the next synchronize.
    /// `args` become the key/value payload of the section's trace event.
    pub(crate) fn push_sig_prof(
        &mut self,
        st: Signal,
        en: Signal,
        desc: String,
        is_copy: bool,
        args: Option<BTreeMap<String, String>>,
    ) {
        self.sig_prof_records.push(SigProfRecord {
            st,
            en,
            desc,
            is_copy,
            args,
        });
    }

    /// Opens a profile section on the given queue kind by submitting a
    /// standalone timestamp bracket. Returns `None` when profiling is off.
    pub(crate) fn prof_begin(&mut self, is_copy: bool) -> Result<Option<Signal>> {
        if !self.profiling() {
            return Ok(None);
        }
        let sig = self.backend.new_signal(0, None)?;
        self.submit_timestamp(&sig, is_copy)?;
        Ok(Some(sig))
    }

    /// Closes a profile section and queues the signal pair for resolution
    /// at the next synchronize.
    pub(crate) fn prof_end(&mut self, st: Option<Signal>, desc: String, is_copy: bool) -> Result<()> {
        let Some(st) = st else { return Ok(()) };
        let en = self.backend.new_signal(0, None)?;
        self.submit_timestamp(&en, is_copy)?;
        self.push_sig_prof(st, en, desc, is_copy, None);
        Ok(())
    }

    fn submit_timestamp(&mut self, sig: &Signal, is_copy: bool) -> Result<()> {
        if is_copy {
            let q = self.copy_queue()?;
            submit_ts_queue(self, q, sig)
        } else {
            let q = self.backend.comp_queue();
            submit_ts_queue(self, q, sig)
        }
    }

    fn finalize_profile(&mut self) -> Result<()> {
        let Some(profile) = self.profile.take() else {
            return Ok(());
        };
        // Make sure every event on the device is recorded.
        self.synchronize()?;
        self.ensure_time_base()?;
        for r in std::mem::take(&mut self.raw_prof_records) {
            let st = self.gpu_to_cpu_time(r.st, r.is_copy)?;
            let en = self.gpu_to_cpu_time(r.en, r.is_copy)?;
            profile.add_event(r.desc, st, en, &self.name, r.is_copy, r.args);
        }
        for dep in std::mem::take(&mut self.dep_prof_records) {
            profile.add_dep(dep);
        }
        profile.register_actor(
            &self.name,
            self.gpu2cpu_compute_time_diff.unwrap_or(Decimal::ZERO),
            self.gpu2cpu_copy_time_diff,
        );
        Ok(())
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        // Trace writing must never mask a primary failure.
        let _ = self.finalize_profile();
    }
}

static HOST_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Host wall clock in nanoseconds on the process-local monotonic
/// timeline. Only differences between readings ever matter.
fn host_now_ns() -> u64 {
    HOST_EPOCH.elapsed().as_nanos() as u64
}

fn median(samples: &mut [Decimal]) -> Decimal {
    samples.sort_unstable();
    let n = samples.len();
    if n % 2 == 1 {
        samples[n / 2]
    } else {
        (samples[n / 2 - 1] + samples[n / 2]) / Decimal::from(2)
    }
}

/// One calibration sample: submit `timestamp; signal(next)` on `q`, wait
/// for it bracketed by host clock reads, and return the host-midpoint
/// minus the device timestamp, in microseconds.
fn clock_sample<B: Backend, Q: HwQueue<B = B>>(dev: &mut Device<B>, mut q: Q) -> Result<Decimal> {
    q.timestamp(&dev.timeline_signal)?
        .signal(&dev.timeline_signal, dev.timeline_value)?
        .submit(dev)?;
    dev.timeline_value += 1;
    let st = host_now_ns();
    dev.timeline_signal
        .wait(dev.timeline_value - 1, dev.wait_timeout_ms)?;
    let et = host_now_ns();
    Ok(Decimal::from(st + et) / Decimal::from(2000) - dev.timeline_signal.timestamp())
}

fn submit_ts_queue<B: Backend, Q: HwQueue<B = B>>(
    dev: &mut Device<B>,
    mut q: Q,
    sig: &Signal,
) -> Result<()> {
    q.wait(&dev.timeline_signal, dev.timeline_value - 1)?
        .timestamp(sig)?
        .signal(&dev.timeline_signal, dev.timeline_value)?
        .submit(dev)?;
    dev.timeline_value += 1;
    Ok(())
}

/// Symmetric cross-device handshake: `d1` signals, `d2` waits and
/// timestamps, `d1` waits the echo and timestamps. Returns the d2-minus-d1
/// timestamp delta.
fn sync_device_pair<B: Backend>(d1: &mut Device<B>, d2: &mut Device<B>) -> Result<Decimal> {
    let mut q1 = d1.backend.comp_queue();
    q1.signal(&d1.timeline_signal, d1.timeline_value)?
        .wait(&d2.timeline_signal, d2.timeline_value)?
        .timestamp(&d1.timeline_signal)?
        .signal(&d1.timeline_signal, d1.timeline_value + 1)?
        .submit(d1)?;
    let mut q2 = d2.backend.comp_queue();
    q2.signal(&d2.timeline_signal, d2.timeline_value)?
        .wait(&d1.timeline_signal, d1.timeline_value)?
        .timestamp(&d2.timeline_signal)?
        .signal(&d2.timeline_signal, d2.timeline_value + 1)?
        .submit(d2)?;
    d1.timeline_value += 2;
    d2.timeline_value += 2;
    d1.timeline_signal
        .wait(d1.timeline_value - 1, d1.wait_timeout_ms)?;
    d2.timeline_signal
        .wait(d2.timeline_value - 1, d2.wait_timeout_ms)?;
    Ok(d2.timeline_signal.timestamp() - d1.timeline_signal.timestamp())
}

fn pair_mut<'a, T>(s: &'a mut [&mut T], i: usize, j: usize) -> (&'a mut T, &'a mut T) {
    assert!(i != j);
    if i < j {
        let (lo, hi) = s.split_at_mut(j);
        (&mut *lo[i], &mut *hi[0])
    } else {
        let (lo, hi) = s.split_at_mut(i);
        (&mut *hi[0], &mut *lo[j])
    }
}

/// Calibrates every device's clock diffs, then measures the pairwise
/// residual jitter between device clocks.
///
/// Sampling is round-robin across every (device, queue-kind): each round
/// takes one sample per kind on each uncalibrated device, so interference
/// from the sampling itself spreads evenly over all the clocks being
/// measured. The jitter matrix is diagnostic only; the per-device diffs
/// are never adjusted from it. It is logged at debug level.
pub fn ensure_shared_time_base<B: Backend>(devs: &mut [&mut Device<B>]) -> Result<()> {
    if devs.iter().all(|d| d.gpu2cpu_compute_time_diff.is_some()) {
        return Ok(());
    }
    let pending: Vec<usize> = devs
        .iter()
        .enumerate()
        .filter(|(_, d)| d.gpu2cpu_compute_time_diff.is_none())
        .map(|(i, _)| i)
        .collect();
    let mut samples =
        vec![(Vec::with_capacity(CLOCK_SAMPLES), Vec::with_capacity(CLOCK_SAMPLES)); pending.len()];
    for _ in 0..CLOCK_SAMPLES {
        for (k, &i) in pending.iter().enumerate() {
            let (comp, copy) = &mut samples[k];
            devs[i].sample_clock_round(comp, copy)?;
        }
    }
    for (k, &i) in pending.iter().enumerate() {
        let (comp, copy) = &mut samples[k];
        devs[i].set_time_diffs(comp, copy);
    }
    let n = devs.len();
    if n < 2 {
        return Ok(());
    }

    let mut jitter = vec![vec![f64::NAN; n]; n];
    for i1 in 0..n {
        for i2 in 0..n {
            if i1 == i2 {
                continue;
            }
            let mut samples = Vec::with_capacity(PAIR_SAMPLES);
            for _ in 0..PAIR_SAMPLES {
                let (d1, d2) = pair_mut(devs, i1, i2);
                let fwd = sync_device_pair(d1, d2)?;
                let (d2, d1) = pair_mut(devs, i2, i1);
                let rev = sync_device_pair(d2, d1)?;
                samples.push(fwd - rev);
            }
            let d1_to_d2 = median(&mut samples) / Decimal::from(2);
            let c1 = devs[i1].gpu2cpu_compute_time_diff.unwrap_or(Decimal::ZERO);
            let c2 = devs[i2].gpu2cpu_compute_time_diff.unwrap_or(Decimal::ZERO);
            jitter[i1][i2] = (d1_to_d2 - (c1 - c2)).to_f64().unwrap_or(f64::NAN);
        }
    }
    debug!("pairwise clock jitter matrix (us): {jitter:?}");
    Ok(())
}
