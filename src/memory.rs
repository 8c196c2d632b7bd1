//! Arrays that live on the host, on an accelerator, or both.

use log::debug;

use crate::device::{Accelerator, DeviceBuffer};
use crate::Scalar;

/// Which copy of a `SyncedMemory` holds the current values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    HostValid,
    DeviceValid,
    Both,
}

/// A fixed-length array with a host copy and a lazily allocated device copy.
///
/// Reading at one location copies the data over first if only the other
/// location is current. Writing at one location makes the other copy stale.
#[derive(Debug)]
pub struct SyncedMemory<T> {
    host: Vec<T>,
    device: Option<DeviceBuffer<T>>,
    state: SyncState,
}

impl<T: Scalar> SyncedMemory<T> {
    /// `len` zeros, on the host.
    pub fn new(len: usize) -> Self {
        SyncedMemory {
            host: vec![T::zero(); len],
            device: None,
            state: SyncState::HostValid,
        }
    }

    pub fn from_vec(host: Vec<T>) -> Self {
        SyncedMemory {
            host,
            device: None,
            state: SyncState::HostValid,
        }
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn host(&mut self) -> &[T] {
        self.to_host();
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut [T] {
        self.to_host();
        self.state = SyncState::HostValid;
        &mut self.host
    }

    pub fn device(&mut self, accelerator: &Accelerator) -> &[T] {
        self.to_device(accelerator, false).as_slice()
    }

    pub fn device_mut(&mut self, accelerator: &Accelerator) -> &mut [T] {
        self.to_device(accelerator, true).as_mut_slice()
    }

    fn to_host(&mut self) {
        if self.state == SyncState::DeviceValid {
            if let Some(buffer) = &self.device {
                debug!("copying device buffer {} to host", buffer.id());
                self.host.copy_from_slice(buffer.as_slice());
            }
            self.state = SyncState::Both;
        }
    }

    fn to_device(&mut self, accelerator: &Accelerator, write: bool) -> &mut DeviceBuffer<T> {
        // A copy on some other accelerator is only good for moving the data
        // back to the host.
        if matches!(&self.device, Some(buffer) if !accelerator.owns(buffer)) {
            self.to_host();
            self.device = None;
            self.state = SyncState::HostValid;
        }

        let len = self.host.len();
        let buffer = self.device.get_or_insert_with(|| accelerator.alloc(len));
        if self.state == SyncState::HostValid {
            debug!("copying host data to device buffer {}", buffer.id());
            buffer.as_mut_slice().copy_from_slice(&self.host);
            self.state = SyncState::Both;
        }
        if write {
            self.state = SyncState::DeviceValid;
        }
        buffer
    }
}
