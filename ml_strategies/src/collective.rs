use std::{cell::RefCell, sync::Arc};

use log::trace;
use ml_core::{MlError, Result, Tensor};
use parking_lot::{Condvar, Mutex};

/// How a collective combines the contributions of every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Sum,
    Mean,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    closed: bool,
}

/// A reusable barrier that can be closed.
///
/// Closing wakes every waiter with `MlError::CollectiveAborted` and makes every later
/// wait fail, so a device that stops early never leaves the others blocked.
#[derive(Debug)]
struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl Barrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MlError::CollectiveAborted);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        while state.generation == generation && !state.closed {
            self.cvar.wait(&mut state);
        }

        // a generation bump wins over a close that raced with it
        if state.generation != generation {
            Ok(())
        } else {
            Err(MlError::CollectiveAborted)
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cvar.notify_all();
    }
}

/// All-reduce over a fixed group of device threads.
///
/// Every device contributes the same number of leaves with matching shapes, and
/// every device receives the same reduced leaves. Reduction runs over devices in
/// index order so the replicas stay bitwise identical.
#[derive(Debug)]
pub struct Collective {
    slots: Mutex<Vec<Option<Vec<Tensor>>>>,
    barrier: Barrier,
}

impl Collective {
    pub fn new(devices: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; devices]),
            barrier: Barrier::new(devices),
        }
    }

    pub fn devices(&self) -> usize {
        self.barrier.parties
    }

    /// Contributes `leaves` for `device` and waits for the reduction of every device's
    /// contribution.
    ///
    /// # Errors
    /// Returns `MlError::CollectiveAborted` if the group was closed, and
    /// `MlError::SizeMismatch` or `MlError::ShapeMismatch` if contributions disagree.
    pub fn all_reduce(&self, device: usize, leaves: Vec<Tensor>, op: Reduce) -> Result<Vec<Tensor>> {
        {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(device).ok_or(MlError::SizeMismatch {
                what: "device index",
                got: device,
                expected: self.devices(),
            })?;
            *slot = Some(leaves);
        }

        self.barrier.wait()?;
        let reduced = self.reduce(op);
        // keeps slots intact until every device has read them
        self.barrier.wait()?;

        trace!(device = device, op = format!("{op:?}").as_str(); "all-reduce done");
        reduced
    }

    /// Closes the group, failing every pending and future collective.
    pub fn close(&self) {
        self.barrier.close();
    }

    fn reduce(&self, op: Reduce) -> Result<Vec<Tensor>> {
        let slots = self.slots.lock();
        let contributions: Vec<&Vec<Tensor>> = slots.iter().flatten().collect();
        let Some(first) = contributions.first() else {
            return Err(MlError::CollectiveAborted);
        };
        if contributions.len() != slots.len() {
            return Err(MlError::CollectiveAborted);
        }

        let mut acc: Vec<Tensor> = first.iter().map(|t| Tensor::zeros(t.raw_dim())).collect();
        for leaves in &contributions {
            if leaves.len() != acc.len() {
                return Err(MlError::SizeMismatch {
                    what: "collective leaves",
                    got: leaves.len(),
                    expected: acc.len(),
                });
            }
            for (a, t) in acc.iter_mut().zip(leaves.iter()) {
                if a.shape() != t.shape() {
                    return Err(MlError::ShapeMismatch {
                        what: "collective leaf".to_string(),
                        got: t.shape().to_vec(),
                        expected: a.shape().to_vec(),
                    });
                }
                *a += t;
            }
        }

        if op == Reduce::Mean {
            let n = contributions.len() as f32;
            acc.iter_mut().for_each(|a| a.mapv_inplace(|x| x / n));
        }
        Ok(acc)
    }
}

#[derive(Debug, Clone)]
struct DeviceContext {
    index: usize,
    collective: Arc<Collective>,
}

thread_local! {
    static DEVICE: RefCell<Option<DeviceContext>> = const { RefCell::new(None) };
}

/// Marks the current thread as device `index` of `collective` until dropped.
///
/// Dropping the guard also closes the collective: a device that leaves, whether it
/// finished, failed or panicked, can no longer take part in a reduction.
pub(crate) struct DeviceGuard {
    collective: Arc<Collective>,
}

impl DeviceGuard {
    pub(crate) fn enter(index: usize, collective: Arc<Collective>) -> Self {
        DEVICE.with(|d| {
            *d.borrow_mut() = Some(DeviceContext {
                index,
                collective: Arc::clone(&collective),
            })
        });
        Self { collective }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        DEVICE.with(|d| d.borrow_mut().take());
        self.collective.close();
    }
}

/// Reduces `leaves` across the devices of the current thread's group.
///
/// # Returns
/// `None` when the current thread is not a device thread, so callers can fall back
/// to the identity.
pub(crate) fn all_reduce_current(leaves: Vec<Tensor>, op: Reduce) -> Option<Result<Vec<Tensor>>> {
    let ctx = DEVICE.with(|d| d.borrow().clone())?;
    Some(ctx.collective.all_reduce(ctx.index, leaves, op))
}
