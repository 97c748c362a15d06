//! Host-memory array value.
//!
//! [`HostArray`] is what the arena stores behind every handle: a shape, an
//! element type and the elements as contiguous little-endian bytes. It
//! implements the handful of computations the operation table exposes.
//!
//! Integer sums accumulate in `i128` and float sums in `f64`, then narrow
//! to the output type. `complex64` arrays can be created, inspected and
//! copied out, but not summed or converted.
//!
//! Element buffers are reserved fallibly: a request the allocator cannot
//! satisfy is reported as [`NativeError::OutOfMemory`] instead of aborting.

use std::fmt;
use std::mem;

use half::{bf16, f16};

use crate::dtype::DType;
use crate::error::{NativeError, NativeResult};

/// A dense array in host memory.
#[derive(Clone, PartialEq)]
pub struct HostArray {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

/// One element, widened for arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Element {
    Int(i128),
    Float(f64),
}

impl Element {
    fn as_f64(self) -> f64 {
        match self {
            Element::Int(v) => v as f64,
            Element::Float(v) => v,
        }
    }

    fn as_i128(self) -> i128 {
        match self {
            Element::Int(v) => v,
            Element::Float(v) => v as i128,
        }
    }
}

impl HostArray {
    /// An array of `shape` with every element set to zero.
    pub fn zeros(shape: &[usize], dtype: DType) -> NativeResult<Self> {
        let count = element_count(shape)?;
        let data = try_filled(byte_len(count, dtype)?, 0u8)?;
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            data,
        })
    }

    /// An array of `shape` with every element set to one.
    pub fn ones(shape: &[usize], dtype: DType) -> NativeResult<Self> {
        Self::filled(shape, dtype, 1.0)
    }

    /// A zero-dimensional array holding `value` converted to `dtype`.
    pub fn scalar(value: f64, dtype: DType) -> NativeResult<Self> {
        Self::filled(&[], dtype, value)
    }

    /// Copy the leading elements of `blob` into a new array.
    ///
    /// Fails if `blob` holds fewer elements than `shape` requires. Trailing
    /// bytes beyond the shape are ignored.
    pub fn from_blob(blob: &[u8], shape: &[usize], dtype: DType) -> NativeResult<Self> {
        let count = element_count(shape)?;
        if blob.len() / dtype.size() < count {
            return Err(NativeError::bad_argument(
                "Binary size is too small for the requested shape",
            ));
        }
        let len = byte_len(count, dtype)?;
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            data: try_copy(&blob[..len])?,
        })
    }

    fn filled(shape: &[usize], dtype: DType, value: f64) -> NativeResult<Self> {
        let count = element_count(shape)?;
        let mut element = Vec::with_capacity(dtype.size());
        write_element(dtype, Element::Float(value), &mut element)?;

        let mut data = try_buffer(byte_len(count, dtype)?)?;
        for _ in 0..count {
            data.extend_from_slice(&element);
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            data,
        })
    }

    /// Dimensions, outermost first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy out the elements, or only the first `limit` of them.
    pub fn to_bytes(&self, limit: Option<usize>) -> NativeResult<Vec<u8>> {
        match limit {
            None => try_copy(&self.data),
            Some(limit) if limit <= self.len() => try_copy(&self.data[..limit * self.dtype.size()]),
            Some(limit) => Err(NativeError::bad_argument(format!(
                "limit {} exceeds the {} elements of the array",
                limit,
                self.len()
            ))),
        }
    }

    /// Convert every element to `dtype`.
    pub fn astype(&self, dtype: DType) -> NativeResult<Self> {
        if dtype == self.dtype {
            return Ok(Self {
                shape: self.shape.clone(),
                dtype,
                data: try_copy(&self.data)?,
            });
        }
        self.ensure_real("astype")?;
        if dtype == DType::Complex64 {
            return Err(NativeError::computation(
                "astype to complex64 is not supported",
            ));
        }

        let mut data = try_buffer(byte_len(self.len(), dtype)?)?;
        for index in 0..self.len() {
            write_element(dtype, self.element(index), &mut data)?;
        }
        Ok(Self {
            shape: self.shape.clone(),
            dtype,
            data,
        })
    }

    /// Sum over `axes`.
    ///
    /// Negative axes count from the end. Reduced axes are dropped from the
    /// result shape unless `keep_dims` is set, in which case they become 1.
    /// An empty axis list reduces nothing. Booleans sum to `int32`.
    pub fn sum(&self, axes: &[i64], keep_dims: bool) -> NativeResult<Self> {
        self.ensure_real("sum")?;
        let reduced = self.normalize_axes(axes)?;
        let out_dtype = match self.dtype {
            DType::Bool => DType::Int32,
            other => other,
        };

        let mut out_shape = Vec::with_capacity(self.ndim());
        for (axis, &dim) in self.shape.iter().enumerate() {
            if !reduced[axis] {
                out_shape.push(dim);
            } else if keep_dims {
                out_shape.push(1);
            }
        }

        // strides of the output, expressed per input axis (0 when reduced)
        let mut out_strides = vec![0usize; self.ndim()];
        let mut stride = 1;
        for axis in (0..self.ndim()).rev() {
            if !reduced[axis] {
                out_strides[axis] = stride;
                stride *= self.shape[axis];
            }
        }
        let out_len = stride;

        let float = out_dtype.is_float();
        let mut int_acc = try_filled(if float { 0 } else { out_len }, 0i128)?;
        let mut float_acc = try_filled(if float { out_len } else { 0 }, 0f64)?;

        for index in 0..self.len() {
            let mut rest = index;
            let mut target = 0;
            for axis in (0..self.ndim()).rev() {
                let dim = self.shape[axis];
                target += (rest % dim) * out_strides[axis];
                rest /= dim;
            }
            let element = self.element(index);
            if float {
                float_acc[target] += element.as_f64();
            } else {
                int_acc[target] = int_acc[target].wrapping_add(element.as_i128());
            }
        }

        let mut data = try_buffer(byte_len(out_len, out_dtype)?)?;
        if float {
            for value in float_acc {
                write_element(out_dtype, Element::Float(value), &mut data)?;
            }
        } else {
            for value in int_acc {
                write_element(out_dtype, Element::Int(value), &mut data)?;
            }
        }
        Ok(Self {
            shape: out_shape,
            dtype: out_dtype,
            data,
        })
    }

    /// The element at flat `index`, widened to `f64`.
    ///
    /// Returns `None` for complex arrays or an out-of-range index.
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        if self.dtype == DType::Complex64 || index >= self.len() {
            return None;
        }
        Some(self.element(index).as_f64())
    }

    fn ensure_real(&self, op: &str) -> NativeResult<()> {
        if self.dtype == DType::Complex64 {
            Err(NativeError::computation(format!(
                "{} is not supported for complex64",
                op
            )))
        } else {
            Ok(())
        }
    }

    fn normalize_axes(&self, axes: &[i64]) -> NativeResult<Vec<bool>> {
        let ndim = self.ndim() as i64;
        let mut reduced = vec![false; self.ndim()];
        for &axis in axes {
            let normalized = if axis < 0 { axis + ndim } else { axis };
            if !(0..ndim).contains(&normalized) {
                return Err(NativeError::bad_argument(format!(
                    "invalid axis {} for array with {} dimensions",
                    axis, ndim
                )));
            }
            let slot = &mut reduced[normalized as usize];
            if *slot {
                return Err(NativeError::bad_argument(format!(
                    "duplicate axis {}",
                    axis
                )));
            }
            *slot = true;
        }
        Ok(reduced)
    }

    fn element(&self, index: usize) -> Element {
        let size = self.dtype.size();
        read_element(self.dtype, &self.data[index * size..(index + 1) * size])
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn element_count(shape: &[usize]) -> NativeResult<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| NativeError::computation("array shape overflows the address space"))
}

fn byte_len(count: usize, dtype: DType) -> NativeResult<usize> {
    count
        .checked_mul(dtype.size())
        .ok_or_else(|| NativeError::computation("array size overflows the address space"))
}

/// An empty buffer with room for exactly `capacity` items.
fn try_buffer<T>(capacity: usize) -> NativeResult<Vec<T>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(capacity).map_err(|_| {
        NativeError::out_of_memory(format!(
            "failed to allocate {} bytes for array data",
            capacity.saturating_mul(mem::size_of::<T>())
        ))
    })?;
    Ok(buffer)
}

fn try_filled<T: Clone>(len: usize, value: T) -> NativeResult<Vec<T>> {
    let mut buffer = try_buffer(len)?;
    buffer.resize(len, value);
    Ok(buffer)
}

fn try_copy(bytes: &[u8]) -> NativeResult<Vec<u8>> {
    let mut buffer = try_buffer(bytes.len())?;
    buffer.extend_from_slice(bytes);
    Ok(buffer)
}

fn read_element(dtype: DType, bytes: &[u8]) -> Element {
    fn take<const N: usize>(bytes: &[u8]) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&bytes[..N]);
        buf
    }

    match dtype {
        DType::Bool => Element::Int((bytes[0] != 0) as i128),
        DType::UInt8 => Element::Int(bytes[0] as i128),
        DType::Int8 => Element::Int(bytes[0] as i8 as i128),
        DType::UInt16 => Element::Int(u16::from_le_bytes(take(bytes)) as i128),
        DType::Int16 => Element::Int(i16::from_le_bytes(take(bytes)) as i128),
        DType::UInt32 => Element::Int(u32::from_le_bytes(take(bytes)) as i128),
        DType::Int32 => Element::Int(i32::from_le_bytes(take(bytes)) as i128),
        DType::UInt64 => Element::Int(u64::from_le_bytes(take(bytes)) as i128),
        DType::Int64 => Element::Int(i64::from_le_bytes(take(bytes)) as i128),
        DType::Float16 => Element::Float(f16::from_le_bytes(take(bytes)).to_f64()),
        DType::BFloat16 => Element::Float(bf16::from_le_bytes(take(bytes)).to_f64()),
        DType::Float32 => Element::Float(f32::from_le_bytes(take(bytes)) as f64),
        // real part only; callers reject complex before reading
        DType::Complex64 => Element::Float(f32::from_le_bytes(take(bytes)) as f64),
    }
}

fn write_element(dtype: DType, element: Element, out: &mut Vec<u8>) -> NativeResult<()> {
    match dtype {
        DType::Bool => {
            let truthy = match element {
                Element::Int(v) => v != 0,
                Element::Float(v) => v != 0.0,
            };
            out.push(truthy as u8);
        }
        DType::UInt8 => out.push(element.as_i128() as u8),
        DType::Int8 => out.push(element.as_i128() as i8 as u8),
        DType::UInt16 => out.extend_from_slice(&(element.as_i128() as u16).to_le_bytes()),
        DType::Int16 => out.extend_from_slice(&(element.as_i128() as i16).to_le_bytes()),
        DType::UInt32 => out.extend_from_slice(&(element.as_i128() as u32).to_le_bytes()),
        DType::Int32 => out.extend_from_slice(&(element.as_i128() as i32).to_le_bytes()),
        DType::UInt64 => out.extend_from_slice(&(element.as_i128() as u64).to_le_bytes()),
        DType::Int64 => out.extend_from_slice(&(element.as_i128() as i64).to_le_bytes()),
        DType::Float16 => out.extend_from_slice(&f16::from_f64(element.as_f64()).to_le_bytes()),
        DType::BFloat16 => out.extend_from_slice(&bf16::from_f64(element.as_f64()).to_le_bytes()),
        DType::Float32 => out.extend_from_slice(&(element.as_f64() as f32).to_le_bytes()),
        DType::Complex64 => {
            out.extend_from_slice(&(element.as_f64() as f32).to_le_bytes());
            out.extend_from_slice(&0f32.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn f32_values(array: &HostArray) -> Vec<f32> {
        array
            .as_bytes()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn i32_blob(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_zeros_and_ones() {
        let zeros = HostArray::zeros(&[2, 3], DType::Float32).unwrap();
        assert_eq!(zeros.shape(), &[2, 3]);
        assert_eq!(f32_values(&zeros), vec![0.0; 6]);

        let ones = HostArray::ones(&[4], DType::Float32).unwrap();
        assert_eq!(f32_values(&ones), vec![1.0; 4]);
    }

    #[test]
    fn test_scalar_is_zero_dimensional() {
        let scalar = HostArray::scalar(2.5, DType::Float32).unwrap();
        assert_eq!(scalar.ndim(), 0);
        assert_eq!(scalar.len(), 1);
        assert_eq!(scalar.get_f64(0), Some(2.5));
    }

    #[test]
    fn test_from_blob_rejects_short_binary() {
        let blob = i32_blob(&[1, 2, 3]);
        let err = HostArray::from_blob(&blob, &[2, 2], DType::Int32).unwrap_err();
        assert_eq!(
            err,
            NativeError::bad_argument("Binary size is too small for the requested shape")
        );
    }

    #[test]
    fn test_to_bytes_with_limit() {
        let blob = i32_blob(&[1, 2, 3, 4]);
        let array = HostArray::from_blob(&blob, &[4], DType::Int32).unwrap();
        assert_eq!(array.to_bytes(None).unwrap(), blob);
        assert_eq!(array.to_bytes(Some(2)).unwrap(), i32_blob(&[1, 2]));
        assert!(array.to_bytes(Some(5)).is_err());
    }

    #[test]
    fn test_sum_over_axes() {
        let blob = i32_blob(&[1, 2, 3, 4, 5, 6]);
        let array = HostArray::from_blob(&blob, &[2, 3], DType::Int32).unwrap();

        let rows = array.sum(&[1], false).unwrap();
        assert_eq!(rows.shape(), &[2]);
        assert_eq!(rows.as_bytes(), i32_blob(&[6, 15]).as_slice());

        let cols = array.sum(&[0], true).unwrap();
        assert_eq!(cols.shape(), &[1, 3]);
        assert_eq!(cols.as_bytes(), i32_blob(&[5, 7, 9]).as_slice());

        let all = array.sum(&[0, -1], false).unwrap();
        assert_eq!(all.ndim(), 0);
        assert_eq!(all.get_f64(0), Some(21.0));
    }

    #[test]
    fn test_sum_rejects_bad_axes() {
        let array = HostArray::zeros(&[2, 2], DType::Float32).unwrap();
        assert!(array.sum(&[2], false).is_err());
        assert!(array.sum(&[0, -2], false).is_err());
    }

    #[test]
    fn test_sum_of_bool_is_int32() {
        let array = HostArray::from_blob(&[1, 0, 1, 1], &[4], DType::Bool).unwrap();
        let total = array.sum(&[0], false).unwrap();
        assert_eq!(total.dtype(), DType::Int32);
        assert_eq!(total.get_f64(0), Some(3.0));
    }

    #[test]
    fn test_astype_between_float_widths() {
        let array = HostArray::from_blob(
            &[1.5f32, -2.0, 65504.0]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect::<Vec<_>>(),
            &[3],
            DType::Float32,
        )
        .unwrap();

        for dtype in [DType::Float16, DType::BFloat16] {
            let converted = array.astype(dtype).unwrap();
            assert_eq!(converted.dtype(), dtype);
            assert_eq!(converted.get_f64(0), Some(1.5));
            assert_eq!(converted.get_f64(1), Some(-2.0));
        }
        let half = array.astype(DType::Float16).unwrap();
        assert_eq!(half.get_f64(2), Some(65504.0));
    }

    #[test]
    fn test_astype_truncates_floats_to_ints() {
        let array = HostArray::scalar(3.75, DType::Float32).unwrap();
        let int = array.astype(DType::Int64).unwrap();
        assert_eq!(int.get_f64(0), Some(3.0));
    }

    #[test]
    fn test_complex_is_opaque() {
        let array = HostArray::zeros(&[2], DType::Complex64).unwrap();
        assert_eq!(array.as_bytes().len(), 16);
        assert_eq!(array.get_f64(0), None);
        assert!(array.sum(&[0], false).is_err());
        assert!(array.astype(DType::Float32).is_err());
    }

    #[test]
    fn test_half_precision_range() {
        let tiny = 2f64.powi(-20);
        let subnormal = HostArray::scalar(tiny, DType::Float16).unwrap();
        assert_eq!(subnormal.get_f64(0), Some(tiny));

        let underflow = HostArray::scalar(1e-10, DType::Float16).unwrap();
        assert_eq!(underflow.get_f64(0), Some(0.0));

        let overflow = HostArray::scalar(1e6, DType::Float16).unwrap();
        assert!(overflow.get_f64(0).unwrap().is_infinite());

        // bfloat16 keeps the float32 exponent range
        let wide = HostArray::scalar(1e30, DType::BFloat16).unwrap();
        assert!(wide.get_f64(0).unwrap().is_finite());
        assert_eq!(
            HostArray::scalar(3.0, DType::BFloat16).unwrap().as_bytes(),
            &0x4040u16.to_le_bytes()
        );
    }

    #[test]
    fn test_unsatisfiable_allocation_is_out_of_memory() {
        // 2^61 float32 elements need more bytes than a Vec can hold
        let err = HostArray::zeros(&[1 << 61], DType::Float32).unwrap_err();
        assert!(matches!(err, NativeError::OutOfMemory(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfMemory);

        let err = HostArray::ones(&[1 << 30, 1 << 31], DType::Float32).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfMemory);

        // still an address-space overflow, not an allocation failure
        let err = HostArray::zeros(&[1 << 62], DType::Float32).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NativeComputationFailed);
    }
}
