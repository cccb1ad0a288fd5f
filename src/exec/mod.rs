
use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::dev::{Backend, Device};
use crate::error::Result;
use crate::mem::HcqBuffer;
use crate::queue::HwQueue;

/// Kernel-argument block living in a device-mapped region.
///
/// The layout is backend-defined; the core only requires in-place slot
/// updates so patched queues can re-point arguments without re-filling.
pub trait ArgsState {
    /// Base pointer of the block inside the kernargs region.
    fn ptr(&self) -> u64;

    fn update_buffer(&mut self, index: usize, buf: &HcqBuffer) -> Result<()>;

    fn update_var(&mut self, index: usize, val: u64) -> Result<()>;
}

/// A compiled kernel handle.
pub struct Program<B: Backend> {
    pub kernel: B::Kernel,
    pub name: String,
    pub kernargs_alloc_size: usize,
}

impl<B: Backend> Program<B> {
    pub fn new(kernel: B::Kernel, name: impl Into<String>, kernargs_alloc_size: usize) -> Self {
        Self {
            kernel,
            name: name.into(),
            kernargs_alloc_size,
        }
    }

    /// Fills arguments for the kernel, allocating space from the device's
    /// kernargs arena when `kernargs_ptr` is not provided.
    pub fn fill_kernargs(
        &self,
        dev: &mut Device<B>,
        bufs: &[HcqBuffer],
        vals: &[u64],
        kernargs_ptr: Option<u64>,
    ) -> Result<B::Args> {
        let ptr = match kernargs_ptr {
            Some(ptr) => ptr,
            None => dev.alloc_kernargs(self.kernargs_alloc_size),
        };
        dev.backend.fill_args(ptr, self, bufs, vals)
    }

    /// Enqueues the program for execution with the given arguments and
    /// dimensions.
    ///
    /// The launch rides the device timeline: it waits for the previous
    /// submission, executes behind a memory barrier, signals the next
    /// timeline value and leaves the timeline advanced by one. With `wait`
    /// set, blocks until completion and returns the measured execution
    /// time in seconds.
    pub fn launch(
        &self,
        dev: &mut Device<B>,
        bufs: &[HcqBuffer],
        global_size: [u32; 3],
        local_size: [u32; 3],
        vals: &[u64],
        wait: bool,
    ) -> Result<Option<f64>> {
        let args = self.fill_kernargs(dev, bufs, vals, None)?;

        let timed = wait || dev.profiling();
        let (sig_st, sig_en) = if timed {
            (
                Some(dev.backend.new_signal(0, None)?),
                Some(dev.backend.new_signal(0, None)?),
            )
        } else {
            (None, None)
        };

        let mut q = dev.backend.comp_queue();
        q.wait(&dev.timeline_signal, dev.timeline_value - 1)?
            .memory_barrier()?;
        if let Some(st) = &sig_st {
            q.timestamp(st)?;
        }
        q.exec(self, &args, global_size, local_size)?;
        if let Some(en) = &sig_en {
            q.timestamp(en)?;
        }
        if dev.profiling() {
            if let (Some(st), Some(en)) = (&sig_st, &sig_en) {
                let args = BTreeMap::from([
                    ("global_size".to_string(), format!("{global_size:?}")),
                    ("local_size".to_string(), format!("{local_size:?}")),
                ]);
                dev.push_sig_prof(st.clone(), en.clone(), self.name.clone(), false, Some(args));
            }
        }
        q.signal(&dev.timeline_signal, dev.timeline_value)?
            .submit(dev)?;
        dev.timeline_value += 1;

        if !wait {
            return Ok(None);
        }
        dev.synchronize()?;
        let elapsed = match (&sig_st, &sig_en) {
            (Some(st), Some(en)) => {
                let us = en.timestamp() - st.timestamp();
                (us / Decimal::from(1_000_000)).to_f64()
            }
            _ => None,
        };
        Ok(elapsed)
    }
}
