//! Raw dual-memory allocation.
//!
//! [`RawBuffer`] owns a pair of growable byte regions, one host-resident and
//! one device-resident, behind reuse-or-grow semantics: capacity is a
//! high-water mark, a request at or below it reuses the existing allocation,
//! and a larger request releases and reallocates exactly that side. Shrinks
//! never return capacity; only `release_*` does.
//!
//! Regions are backed by `u64` words so typed element views (f32, f16) over
//! the bytes are always validly aligned.

use std::sync::{Arc, Mutex};

use crate::device::Device;

fn alloc_words(bytes: usize) -> Box<[u64]> {
    vec![0u64; bytes.div_ceil(8)].into_boxed_slice()
}

fn as_bytes(words: &[u64], len: usize) -> &[u8] {
    debug_assert!(len <= words.len() * 8);
    // SAFETY: u8 has weaker alignment than u64 and every byte of the word
    // slice is initialized; `len` never exceeds the allocation.
    unsafe { std::slice::from_raw_parts(words.as_ptr().cast::<u8>(), len) }
}

fn as_bytes_mut(words: &mut [u64], len: usize) -> &mut [u8] {
    debug_assert!(len <= words.len() * 8);
    // SAFETY: as above, and the mutable borrow of `words` guarantees
    // exclusive access to the bytes.
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) }
}

/// The dual host/device allocation behind one [`crate::Tensor`].
pub struct RawBuffer {
    host: Option<Box<[u64]>>,
    host_capacity: usize,
    device_buf: Option<Box<[u64]>>,
    device_capacity: usize,
    device: Device,
}

impl RawBuffer {
    /// Creates an empty buffer whose device side is accounted against
    /// `device`. Nothing is allocated until the first `host`/`device` call.
    pub fn new(device: &Device) -> Self {
        Self {
            host: None,
            host_capacity: 0,
            device_buf: None,
            device_capacity: 0,
            device: device.clone(),
        }
    }

    /// Returns a host region valid for `size` bytes, growing if needed.
    ///
    /// Growth zero-fills; reuse keeps previous contents in place.
    pub fn host(&mut self, size: usize) -> &mut [u8] {
        if size > self.host_capacity || self.host.is_none() {
            self.host = Some(alloc_words(size));
            self.host_capacity = size;
        }
        as_bytes_mut(self.host.as_mut().unwrap(), size)
    }

    /// Returns a device region valid for `size` bytes, growing if needed.
    pub fn device(&mut self, size: usize) -> &mut [u8] {
        if size > self.device_capacity || self.device_buf.is_none() {
            if self.device_buf.take().is_some() {
                self.device.on_release(self.device_capacity);
            }
            self.device.on_alloc(size);
            self.device_buf = Some(alloc_words(size));
            self.device_capacity = size;
        }
        as_bytes_mut(self.device_buf.as_mut().unwrap(), size)
    }

    /// Host region without growth, if one exists with enough capacity.
    pub fn host_slice(&self, size: usize) -> Option<&[u8]> {
        match &self.host {
            Some(words) if size <= self.host_capacity => Some(as_bytes(words, size)),
            _ => None,
        }
    }

    /// Device region without growth, if one exists with enough capacity.
    pub fn device_slice(&self, size: usize) -> Option<&[u8]> {
        match &self.device_buf {
            Some(words) if size <= self.device_capacity => Some(as_bytes(words, size)),
            _ => None,
        }
    }

    /// Copies `size` bytes from the device region into the host region,
    /// growing the destination if needed.
    pub fn copy_device_to_host(&mut self, size: usize) {
        if size > self.host_capacity || self.host.is_none() {
            self.host = Some(alloc_words(size));
            self.host_capacity = size;
        }
        assert!(
            size <= self.device_capacity,
            "copy of {size} bytes exceeds device capacity {}",
            self.device_capacity
        );
        let src = self
            .device_buf
            .as_deref()
            .expect("device side not allocated");
        let dst = self.host.as_deref_mut().unwrap();
        as_bytes_mut(dst, size).copy_from_slice(as_bytes(src, size));
    }

    /// Copies `size` bytes from the host region into the device region,
    /// growing the destination if needed.
    pub fn copy_host_to_device(&mut self, size: usize) {
        if size > self.device_capacity || self.device_buf.is_none() {
            if self.device_buf.take().is_some() {
                self.device.on_release(self.device_capacity);
            }
            self.device.on_alloc(size);
            self.device_buf = Some(alloc_words(size));
            self.device_capacity = size;
        }
        assert!(
            size <= self.host_capacity,
            "copy of {size} bytes exceeds host capacity {}",
            self.host_capacity
        );
        let src = self.host.as_deref().expect("host side not allocated");
        let dst = self.device_buf.as_deref_mut().unwrap();
        as_bytes_mut(dst, size).copy_from_slice(as_bytes(src, size));
    }

    pub fn host_capacity(&self) -> usize {
        self.host_capacity
    }

    pub fn device_capacity(&self) -> usize {
        self.device_capacity
    }

    /// Base address of the host allocation, for reuse observability.
    pub fn host_ptr(&self) -> Option<*const u8> {
        self.host.as_deref().map(|h| h.as_ptr().cast())
    }

    /// Base address of the device allocation, for reuse observability.
    pub fn device_ptr(&self) -> Option<*const u8> {
        self.device_buf.as_deref().map(|d| d.as_ptr().cast())
    }

    /// Releases host capacity immediately; the next `host` call reallocates
    /// from zero.
    pub fn release_host(&mut self) {
        self.host = None;
        self.host_capacity = 0;
    }

    /// Releases device capacity immediately and returns it to the device's
    /// accounting.
    pub fn release_device(&mut self) {
        if self.device_buf.take().is_some() {
            self.device.on_release(self.device_capacity);
        }
        self.device_capacity = 0;
    }

    /// Releases both sides.
    pub fn release_all(&mut self) {
        self.release_host();
        self.release_device();
    }

    pub fn device_handle(&self) -> &Device {
        &self.device
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        self.release_device();
    }
}

/// Shared scratch borrowed across operations with non-overlapping lifetimes.
///
/// Ownership is never transferred: the caller guarantees that two users of
/// one workspace are not live inside the same forward call.
pub type Workspace = Arc<Mutex<RawBuffer>>;

/// Wraps a buffer for use as shared scratch.
pub fn workspace(buffer: RawBuffer) -> Workspace {
    Arc::new(Mutex::new(buffer))
}
