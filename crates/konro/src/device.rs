//! Device contexts and execution streams.
//!
//! The runtime never uses ambient process-global device state. Every
//! allocation and engine load goes through an explicit [`Device`] handle,
//! and a [`DeviceRegistry`] owns the set of visible devices plus the
//! "current" selection that convenience callers thread through their code.
//!
//! The built-in device is an emulation: its memory space is a second,
//! physically separate host allocation and issued work completes inline, so
//! [`Device::synchronize`] is a fence over an always-empty queue. A vendor
//! backend would plug in behind [`crate::engine::Executor`] and reuse the
//! same handle for accounting.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Default emulated device memory: 1 GiB.
const DEFAULT_DEVICE_MEMORY: usize = 1 << 30;

/// Total and currently available memory on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemorySummary {
    pub total: usize,
    pub available: usize,
}

struct DeviceInner {
    id: usize,
    total_memory: usize,
    allocated: AtomicUsize,
}

/// A cheap, cloneable handle to one accelerator context.
///
/// All clones refer to the same device; allocation accounting is shared.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub(crate) fn new(id: usize, total_memory: usize) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                id,
                total_memory,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// The registry-assigned device index.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Total and available device memory.
    pub fn memory_summary(&self) -> DeviceMemorySummary {
        let allocated = self.inner.allocated.load(Ordering::Acquire);
        DeviceMemorySummary {
            total: self.inner.total_memory,
            available: self.inner.total_memory.saturating_sub(allocated),
        }
    }

    /// Blocks until all work previously issued to this device has completed.
    ///
    /// The emulated device executes inline, so this returns immediately; the
    /// call is still the contract point real backends hang a fence on.
    pub fn synchronize(&self) {}

    /// Records a device-side allocation. Exhaustion is fatal by design:
    /// there is no partial-tensor recovery state to hand back.
    pub(crate) fn on_alloc(&self, bytes: usize) {
        let previous = self.inner.allocated.fetch_add(bytes, Ordering::AcqRel);
        if previous + bytes > self.inner.total_memory {
            panic!(
                "device {} out of memory: {} bytes requested, {} available",
                self.inner.id,
                bytes,
                self.inner.total_memory.saturating_sub(previous)
            );
        }
    }

    pub(crate) fn on_release(&self, bytes: usize) {
        self.inner.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Returns true if both handles refer to the same device.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("total_memory", &self.inner.total_memory)
            .field("allocated", &self.inner.allocated.load(Ordering::Relaxed))
            .finish()
    }
}

/// An execution-stream token bound to one device.
///
/// Work issued through an [`crate::Engine`] is serialized on its stream;
/// `synchronize` must be called before host-side reads of output tensors
/// when `forward` was issued without the implicit fence.
#[derive(Debug, Clone)]
pub struct Stream {
    device: Device,
}

impl Stream {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Blocks until all work issued on this stream has completed.
    pub fn synchronize(&self) {
        self.device.synchronize();
    }
}

/// The ordered set of visible devices and the current selection.
pub struct DeviceRegistry {
    devices: Vec<Device>,
    current: usize,
}

impl DeviceRegistry {
    /// Creates a registry of `count` emulated devices with default memory.
    pub fn new(count: usize) -> Self {
        Self::with_memory(count, DEFAULT_DEVICE_MEMORY)
    }

    /// Creates a registry of `count` devices, each with `total_memory` bytes.
    pub fn with_memory(count: usize, total_memory: usize) -> Self {
        assert!(count > 0, "a registry needs at least one device");
        Self {
            devices: (0..count).map(|id| Device::new(id, total_memory)).collect(),
            current: 0,
        }
    }

    /// Number of visible devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// The currently selected device.
    pub fn current(&self) -> &Device {
        &self.devices[self.current]
    }

    /// Selects the device that subsequent convenience calls use.
    ///
    /// An invalid id returns an error and leaves the previous selection
    /// active.
    pub fn set_device(&mut self, id: usize) -> Result<()> {
        if id >= self.devices.len() {
            return Err(Error::UnknownDevice {
                id,
                count: self.devices.len(),
            });
        }
        if id != self.current {
            tracing::debug!(from = self.current, to = id, "device selection changed");
        }
        self.current = id;
        Ok(())
    }

    /// Looks up a device by id.
    pub fn get(&self, id: usize) -> Option<&Device> {
        self.devices.get(id)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(1)
    }
}
