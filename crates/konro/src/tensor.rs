//! Shaped, typed views over dual-memory buffers.
//!
//! A [`Tensor`] tracks which memory space holds the authoritative copy of
//! its data through a [`Location`] state machine. `to_host`/`to_device` are
//! the only synchronization points: each performs at most one full-extent
//! copy and flips the location. Row writes via `copy_from_host` bypass the
//! machinery so a batch can be populated without forcing full-tensor syncs.

use std::fs;
use std::path::Path;

use half::f16;

use crate::device::{Device, Stream};
use crate::dtype::DType;
use crate::error::{Error, LoadError, Result};
use crate::memory::{RawBuffer, Workspace};

/// Magic number opening every serialized tensor file.
pub const TENSOR_FILE_MAGIC: u32 = 0xFCCF_E2E2;

/// Which memory space currently holds the authoritative copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// No data has been written yet.
    Uninit,
    /// The host buffer is current.
    Host,
    /// The device buffer is current.
    Device,
}

/// A shaped, typed buffer spanning host and device memory.
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    bytes: usize,
    location: Location,
    data: RawBuffer,
    workspace: Option<Workspace>,
    stream: Option<Stream>,
    shape_string: String,
}

impl Tensor {
    /// Creates a tensor with the given shape. No memory is allocated until
    /// the first access.
    pub fn new(device: &Device, dims: &[usize], dtype: DType) -> Self {
        let mut tensor = Self {
            shape: Vec::new(),
            dtype,
            bytes: 0,
            location: Location::Uninit,
            data: RawBuffer::new(device),
            workspace: None,
            stream: None,
            shape_string: String::new(),
        };
        tensor.resize(dims);
        tensor
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndims(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Total byte extent of the current shape.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size_bytes()
    }

    /// Element count from `start_axis` to the last axis.
    pub fn count(&self, start_axis: usize) -> usize {
        self.shape[start_axis.min(self.shape.len())..].iter().product()
    }

    /// True until the first write lands.
    pub fn is_empty(&self) -> bool {
        self.location == Location::Uninit
    }

    /// Cached human-readable shape, e.g. `1 x 3 x 112 x 112`.
    pub fn shape_string(&self) -> &str {
        &self.shape_string
    }

    // BCHW convenience accessors; the caller guarantees the rank fits.
    pub fn batch(&self) -> usize {
        self.shape[0]
    }

    pub fn channel(&self) -> usize {
        self.shape[1]
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }

    pub fn device(&self) -> &Device {
        self.data.device_handle()
    }

    /// Changes the shape in place. The byte extent and cached shape string
    /// are refreshed; backing memory is only reallocated if a later access
    /// needs more bytes than the buffer's high-water capacity.
    pub fn resize(&mut self, dims: &[usize]) {
        self.shape = dims.to_vec();
        self.bytes = self.numel() * self.dtype.size_bytes();
        self.shape_string = self
            .shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(" x ");
    }

    /// Resizes a single axis, keeping the others.
    pub fn resize_dim(&mut self, axis: usize, size: usize) -> Result<()> {
        if axis >= self.shape.len() {
            return Err(Error::OutOfRange {
                axis,
                index: axis,
                size: self.shape.len(),
            });
        }
        let mut dims = self.shape.clone();
        dims[axis] = size;
        self.resize(&dims);
        Ok(())
    }

    /// Ensures the host side is current. Copies the full byte extent from
    /// the device exactly once when needed.
    pub fn to_host(&mut self) {
        match self.location {
            Location::Host => {}
            Location::Uninit => {
                self.data.host(self.bytes);
                self.location = Location::Host;
            }
            Location::Device => {
                self.data.copy_device_to_host(self.bytes);
                self.location = Location::Host;
            }
        }
    }

    /// Ensures the device side is current.
    pub fn to_device(&mut self) {
        match self.location {
            Location::Device => {}
            Location::Uninit => {
                self.data.device(self.bytes);
                self.location = Location::Device;
            }
            Location::Host => {
                self.data.copy_host_to_device(self.bytes);
                self.location = Location::Device;
            }
        }
    }

    /// Host byte view; forces host residency first.
    pub fn host_bytes(&mut self) -> &mut [u8] {
        self.to_host();
        let bytes = self.bytes;
        self.data.host(bytes)
    }

    /// Device byte view; forces device residency first.
    pub fn device_bytes(&mut self) -> &mut [u8] {
        self.to_device();
        let bytes = self.bytes;
        self.data.device(bytes)
    }

    /// Typed host view for F32 tensors.
    pub fn host_f32(&mut self) -> Result<&mut [f32]> {
        if self.dtype != DType::F32 {
            return Err(Error::UnsupportedDType {
                op: "host_f32",
                dtype: self.dtype,
            });
        }
        let numel = self.numel();
        let bytes = self.host_bytes();
        // SAFETY: the buffer is u64-word backed so f32 alignment holds, the
        // extent is numel * 4 bytes, and the mutable borrow is exclusive.
        Ok(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<f32>(), numel) })
    }

    /// Typed device view for F32 tensors; forces device residency first.
    pub fn device_f32(&mut self) -> Result<&mut [f32]> {
        if self.dtype != DType::F32 {
            return Err(Error::UnsupportedDType {
                op: "device_f32",
                dtype: self.dtype,
            });
        }
        let numel = self.numel();
        let bytes = self.device_bytes();
        // SAFETY: as in host_f32; device regions share the word-backed
        // allocation discipline.
        Ok(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<f32>(), numel) })
    }

    /// Typed host view for F16 tensors.
    pub fn host_f16(&mut self) -> Result<&mut [f16]> {
        if self.dtype != DType::F16 {
            return Err(Error::UnsupportedDType {
                op: "host_f16",
                dtype: self.dtype,
            });
        }
        let numel = self.numel();
        let bytes = self.host_bytes();
        // SAFETY: as in host_f32; f16 is a two-byte POD wrapper over u16.
        Ok(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<f16>(), numel) })
    }

    /// Row-major flattened element offset for a (possibly partial) index
    /// prefix. Out-of-range indices are rejected rather than wrapped.
    pub fn offset(&self, indices: &[usize]) -> Result<usize> {
        if indices.len() > self.shape.len() {
            return Err(Error::ShapeMismatch {
                op: "offset",
                lhs: self.shape.clone(),
                rhs: indices.to_vec(),
            });
        }
        let mut flat = 0usize;
        for (axis, (&index, &size)) in indices.iter().zip(self.shape.iter()).enumerate() {
            if index >= size {
                return Err(Error::OutOfRange { axis, index, size });
            }
            flat = flat * size + index;
        }
        Ok(flat * self.count(indices.len()))
    }

    /// Mutable reference to one F32 element.
    pub fn at_f32(&mut self, indices: &[usize]) -> Result<&mut f32> {
        let offset = self.offset(indices)?;
        Ok(&mut self.host_f32()?[offset])
    }

    /// Bulk write of host-sourced bytes at `byte_offset`, into whichever
    /// side is currently authoritative. Does not trigger a sync.
    pub fn copy_from_host(&mut self, byte_offset: usize, src: &[u8]) -> Result<()> {
        self.write_at(byte_offset, src)
    }

    /// Bulk write of device-sourced bytes at `byte_offset`. On the emulated
    /// device both spaces are host-addressable, so this mirrors
    /// [`Tensor::copy_from_host`]; the entry point exists because callers
    /// holding device memory must not pretend it is host memory.
    pub fn copy_from_device(&mut self, byte_offset: usize, src: &[u8]) -> Result<()> {
        self.write_at(byte_offset, src)
    }

    fn write_at(&mut self, byte_offset: usize, src: &[u8]) -> Result<()> {
        let end = byte_offset + src.len();
        if end > self.bytes {
            return Err(Error::OutOfRange {
                axis: 0,
                index: end,
                size: self.bytes,
            });
        }
        let bytes = self.bytes;
        match self.location {
            Location::Device => {
                self.data.device(bytes)[byte_offset..end].copy_from_slice(src);
            }
            Location::Host | Location::Uninit => {
                self.data.host(bytes)[byte_offset..end].copy_from_slice(src);
                self.location = Location::Host;
            }
        }
        Ok(())
    }

    /// Fills every element with `value`, converted to the tensor's dtype.
    pub fn set_to(&mut self, value: f32) {
        match self.dtype {
            DType::F32 => {
                for v in self.host_f32().expect("dtype checked") {
                    *v = value;
                }
            }
            DType::F16 => {
                let half = f16::from_f32(value);
                for v in self.host_f16().expect("dtype checked") {
                    *v = half;
                }
            }
        }
    }

    /// Deep copy of shape, dtype, and current payload.
    pub fn clone_data(&mut self) -> Tensor {
        let device = self.device().clone();
        let mut copy = Tensor::new(&device, &self.shape.clone(), self.dtype);
        if self.location != Location::Uninit {
            let payload = self.host_bytes().to_vec();
            copy.host_bytes().copy_from_slice(&payload);
        }
        copy
    }

    /// Releases all backing memory; the location returns to uninitialized.
    pub fn release(&mut self) {
        self.data.release_all();
        self.location = Location::Uninit;
    }

    pub fn raw_buffer(&self) -> &RawBuffer {
        &self.data
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    pub fn set_workspace(&mut self, workspace: Workspace) {
        self.workspace = Some(workspace);
    }

    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    pub fn set_stream(&mut self, stream: Stream) {
        self.stream = Some(stream);
    }

    /// Blocks until device work touching this tensor's stream completes.
    pub fn synchronize(&self) {
        if let Some(stream) = &self.stream {
            stream.synchronize();
        } else {
            self.device().synchronize();
        }
    }

    /// Serializes shape, dtype, and payload to the binary tensor format.
    ///
    /// Dimensions wider than the format's u32 fields are rejected rather
    /// than truncated, so a round trip can never change the shape.
    pub fn save_to_file(&mut self, path: impl AsRef<Path>) -> std::io::Result<()> {
        for &dim in &self.shape {
            if u32::try_from(dim).is_err() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("dimension {dim} does not fit the tensor file format"),
                ));
            }
        }
        let mut out = Vec::with_capacity(12 + self.shape.len() * 4 + self.bytes);
        out.extend_from_slice(&TENSOR_FILE_MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.shape.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.dtype.code().to_le_bytes());
        for &dim in &self.shape {
            out.extend_from_slice(&(dim as u32).to_le_bytes());
        }
        out.extend_from_slice(self.host_bytes());
        fs::write(path, out)
    }

    /// Loads a tensor from the binary tensor format.
    ///
    /// A file whose magic does not match is rejected with no partial
    /// interpretation attempted.
    pub fn load_from_file(device: &Device, path: impl AsRef<Path>) -> Result<Tensor, LoadError> {
        let raw = fs::read(path)?;
        let mut cursor = Cursor::new(&raw);

        let magic = cursor.u32()?;
        if magic != TENSOR_FILE_MAGIC {
            return Err(LoadError::BadMagic {
                found: magic,
                expected: TENSOR_FILE_MAGIC,
            });
        }
        let ndims = cursor.u32()? as usize;
        let dtype_code = cursor.u32()?;
        let dtype = DType::from_code(dtype_code).ok_or(LoadError::UnsupportedDType(dtype_code))?;
        // The rank and dims are untrusted: bound the dimension table by the
        // bytes present and compute the extent with overflow checks.
        let raw_dims = cursor.take(ndims.checked_mul(4).ok_or_else(|| {
            LoadError::Malformed("dimension table overflows the addressable size".into())
        })?)?;
        let dims: Vec<usize> = raw_dims
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as usize)
            .collect();

        let payload = cursor.rest();
        let expected = dims
            .iter()
            .try_fold(dtype.size_bytes(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                LoadError::Malformed("tensor extent overflows the addressable size".into())
            })?;
        if payload.len() < expected {
            return Err(LoadError::Truncated {
                expected,
                got: payload.len(),
            });
        }
        if payload.len() > expected {
            return Err(LoadError::Malformed(format!(
                "{} trailing bytes after tensor payload",
                payload.len() - expected
            )));
        }

        let mut tensor = Tensor::new(device, &dims, dtype);
        tensor.host_bytes().copy_from_slice(payload);
        Ok(tensor)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape_string)
            .field("dtype", &self.dtype)
            .field("location", &self.location)
            .finish()
    }
}

/// Minimal little-endian reader shared with the plan decoder.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn u32(&mut self) -> Result<u32, LoadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, LoadError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(LoadError::Truncated {
                expected: len,
                got: remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(0, 1 << 24)
    }

    #[test]
    fn new_tensor_is_uninitialized() {
        let dev = device();
        let t = Tensor::new(&dev, &[2, 3], DType::F32);
        assert!(t.is_empty());
        assert_eq!(t.numel(), 6);
        assert_eq!(t.bytes(), 24);
        assert_eq!(t.shape_string(), "2 x 3");
    }

    #[test]
    fn round_trip_host_device_preserves_bytes() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[4], DType::F32);
        t.host_f32().unwrap().copy_from_slice(&[1.0, -2.0, 3.5, 0.25]);
        let before = t.host_bytes().to_vec();

        t.to_device();
        assert_eq!(t.location(), Location::Device);
        t.to_host();
        assert_eq!(t.location(), Location::Host);

        assert_eq!(t.host_bytes(), &before[..]);
    }

    #[test]
    fn to_device_is_noop_when_resident() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[2], DType::F32);
        t.to_device();
        let ptr = t.raw_buffer().device_ptr().unwrap();
        t.to_device();
        assert_eq!(t.raw_buffer().device_ptr().unwrap(), ptr);
    }

    #[test]
    fn resize_within_capacity_keeps_allocation() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[8, 8], DType::F32);
        t.host_bytes();
        let before = t.raw_buffer().host_ptr().unwrap();

        t.resize(&[2, 8]);
        t.host_bytes();
        assert_eq!(t.raw_buffer().host_ptr().unwrap(), before);

        t.resize(&[32, 8]);
        t.host_bytes();
        assert_ne!(t.raw_buffer().host_ptr().unwrap(), before);
    }

    #[test]
    fn offset_is_row_major_and_checked() {
        let dev = device();
        let t = Tensor::new(&dev, &[2, 3, 4], DType::F32);
        assert_eq!(t.offset(&[0, 0, 0]).unwrap(), 0);
        assert_eq!(t.offset(&[1, 2, 3]).unwrap(), 23);
        assert_eq!(t.offset(&[1]).unwrap(), 12);
        assert_eq!(t.offset(&[1, 1]).unwrap(), 16);

        assert_eq!(
            t.offset(&[0, 3, 0]),
            Err(Error::OutOfRange {
                axis: 1,
                index: 3,
                size: 3
            })
        );
        assert!(matches!(
            t.offset(&[0, 0, 0, 0]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn row_write_bypasses_sync() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[2, 4], DType::F32);
        let row: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let offset = t.offset(&[1]).unwrap() * t.element_size();
        t.copy_from_host(offset, &row).unwrap();

        let values = t.host_f32().unwrap();
        assert_eq!(&values[4..8], &[1.0, 2.0, 3.0, 4.0]);

        // past the end
        let err = t.copy_from_host(30, &row).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn set_to_fills_both_dtypes() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[3], DType::F32);
        t.set_to(2.5);
        assert_eq!(t.host_f32().unwrap(), &[2.5, 2.5, 2.5]);

        let mut h = Tensor::new(&dev, &[2], DType::F16);
        h.set_to(1.5);
        assert_eq!(h.host_f16().unwrap(), &[f16::from_f32(1.5); 2]);
    }

    #[test]
    fn typed_view_rejects_wrong_dtype() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[2], DType::F16);
        assert!(matches!(
            t.host_f32(),
            Err(Error::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn at_f32_addresses_elements() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[2, 2], DType::F32);
        *t.at_f32(&[1, 0]).unwrap() = 9.0;
        assert_eq!(t.host_f32().unwrap()[2], 9.0);
    }

    #[test]
    fn clone_data_copies_payload() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[2], DType::F32);
        t.host_f32().unwrap().copy_from_slice(&[5.0, 6.0]);
        let mut copy = t.clone_data();
        assert_eq!(copy.host_f32().unwrap(), &[5.0, 6.0]);

        // independent storage
        t.host_f32().unwrap()[0] = 0.0;
        assert_eq!(copy.host_f32().unwrap()[0], 5.0);
    }

    #[test]
    fn tensors_can_share_a_workspace() {
        use crate::memory::workspace;

        let dev = device();
        let shared = workspace(RawBuffer::new(&dev));
        let mut a = Tensor::new(&dev, &[8], DType::F32);
        let mut b = Tensor::new(&dev, &[16], DType::F32);
        a.set_workspace(shared.clone());
        b.set_workspace(shared.clone());

        // non-overlapping scratch use: capacity is a shared high-water mark
        a.workspace().unwrap().lock().unwrap().host(64);
        b.workspace().unwrap().lock().unwrap().host(32);
        assert_eq!(shared.lock().unwrap().host_capacity(), 64);
    }

    #[test]
    fn stream_association_survives_resize() {
        use crate::device::Stream;

        let dev = device();
        let mut t = Tensor::new(&dev, &[2], DType::F32);
        t.set_stream(Stream::new(&dev));
        t.resize(&[4]);
        assert!(t.stream().is_some());
        t.synchronize();
    }

    #[test]
    fn release_resets_location() {
        let dev = device();
        let mut t = Tensor::new(&dev, &[4], DType::F32);
        t.set_to(1.0);
        t.release();
        assert!(t.is_empty());
        assert_eq!(t.raw_buffer().host_capacity(), 0);
    }
}
