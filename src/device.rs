//! The accelerator: a compute device with its own memory and its own workers.
//!
//! Kernels submitted to an `Accelerator` run on a private rayon thread pool,
//! and every device-side allocation is a `DeviceBuffer` registered in the
//! accelerator's allocation ledger under a `BufferId`. Host code never reads a
//! device buffer directly; `SyncedMemory` copies data back and forth.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{Result, Scalar};

static NEXT_ACCELERATOR_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Used in log messages.
    pub label: String,
    /// Number of worker threads. 0 means one per available core.
    pub num_threads: usize,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        AcceleratorConfig {
            label: "accelerator".to_string(),
            num_threads: 0,
        }
    }
}

/// Identifies one live device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bytes held by each live device buffer.
#[derive(Debug, Default)]
struct Ledger {
    next_id: AtomicU64,
    live: Mutex<HashMap<BufferId, usize>>,
}

impl Ledger {
    fn register(&self, bytes: usize) -> BufferId {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, bytes);
        id
    }

    fn release(&self, id: BufferId) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

#[derive(Debug)]
pub struct Accelerator {
    id: u64,
    label: String,
    pool: rayon::ThreadPool,
    ledger: Arc<Ledger>,
}

impl Accelerator {
    pub fn new(config: &AcceleratorConfig) -> Result<Self> {
        let id = NEXT_ACCELERATOR_ID.fetch_add(1, Ordering::Relaxed);
        let label = config.label.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name({
                let label = label.clone();
                move |i| format!("{label}-{i}")
            })
            .build()?;
        debug!(
            "{label}: started accelerator {id} with {} threads",
            pool.current_num_threads()
        );
        Ok(Accelerator {
            id,
            label,
            pool,
            ledger: Arc::new(Ledger::default()),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Allocate `len` zeroed elements of device memory.
    pub fn alloc<T: Scalar>(&self, len: usize) -> DeviceBuffer<T> {
        let bytes = len * mem::size_of::<T>();
        let id = self.ledger.register(bytes);
        debug!("{}: allocated device buffer {id} ({bytes} bytes)", self.label);
        DeviceBuffer {
            id,
            owner: self.id,
            data: vec![T::zero(); len],
            ledger: Arc::clone(&self.ledger),
        }
    }

    /// Number of device buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.ledger
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total size of the device buffers currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.ledger
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Run a kernel on the accelerator's workers and wait for it to finish.
    pub(crate) fn run<R, F>(&self, kernel: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(kernel)
    }

    pub(crate) fn owns<T>(&self, buffer: &DeviceBuffer<T>) -> bool {
        buffer.owner == self.id
    }
}

/// Memory on an accelerator. Freed (and removed from the ledger) on drop.
pub struct DeviceBuffer<T> {
    id: BufferId,
    owner: u64,
    data: Vec<T>,
    ledger: Arc<Ledger>,
}

impl<T> DeviceBuffer<T> {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("len", &self.data.len())
            .finish()
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.ledger.release(self.id);
    }
}
