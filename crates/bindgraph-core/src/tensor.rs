use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::DeviceContext;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::spec::TensorSpec;
use crate::storage::Storage;

// Tensor — Reference-counted handle to one bound buffer
//
// The executor never owns argument, gradient or auxiliary buffers: callers
// hand it Tensor handles and keep their own. A Tensor is an Arc around the
// buffer, so cloning is O(1) and every clone refers to the same memory. Two
// slots alias exactly when their handles are `ptr_eq`; that is how the same
// parameter is shared between two binds, and how an in-place gradient write
// is recognized.
//
// MUTATION THROUGH A SHARED HANDLE:
//
//   Buffers are written through `&self` (storage sits behind a RwLock).
//   This is the handle semantics native engines expose: whoever holds the
//   handle may read or write the memory, and ordering is the caller's job.

/// Unique identifier for a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Native-pointer stand-in handed to runtimes that address buffers directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub usize);

struct TensorInner {
    id: TensorId,
    spec: TensorSpec,
    context: DeviceContext,
    storage: RwLock<Storage>,
}

/// A reference-counted, shape- and dtype-tagged buffer on a device context.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, context={})",
            self.inner.id, self.inner.spec.shape, self.inner.spec.dtype, self.inner.context,
        )
    }
}

impl Tensor {
    fn from_storage(storage: Storage, shape: Shape, context: DeviceContext) -> Self {
        let dtype = storage.dtype();
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::next(),
                spec: TensorSpec { shape, dtype },
                context,
                storage: RwLock::new(storage),
            }),
        }
    }

    // Constructors

    /// A zero-filled buffer.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, context: DeviceContext) -> Self {
        let shape = shape.into();
        let storage = Storage::zeros(dtype, shape.elem_count());
        Tensor::from_storage(storage, shape, context)
    }

    /// A zero-filled buffer matching `spec`.
    pub fn zeros_like_spec(spec: &TensorSpec, context: DeviceContext) -> Self {
        Tensor::zeros(spec.shape.clone(), spec.dtype, context)
    }

    /// A buffer filled with `value`.
    pub fn full(shape: impl Into<Shape>, value: f64, dtype: DType, context: DeviceContext) -> Self {
        let shape = shape.into();
        let storage = Storage::from_f64(dtype, &vec![value; shape.elem_count()]);
        Tensor::from_storage(storage, shape, context)
    }

    /// A one-element buffer of shape `[1]`.
    pub fn scalar(value: f64, dtype: DType, context: DeviceContext) -> Self {
        Tensor::full(1, value, dtype, context)
    }

    /// Build a buffer from f64 values, narrowing to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        context: DeviceContext,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Tensor::from_storage(
            Storage::from_f64(dtype, data),
            shape,
            context,
        ))
    }

    /// Build a buffer from typed values; the dtype follows `T`.
    pub fn from_slice<T: WithDType>(
        data: &[T],
        shape: impl Into<Shape>,
        context: DeviceContext,
    ) -> Result<Self> {
        let wide: Vec<f64> = data.iter().map(|&v| WithDType::to_f64(v)).collect();
        Tensor::from_f64_slice(&wide, shape, T::DTYPE, context)
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.inner.spec
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.spec.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.spec.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.inner.spec.dtype
    }

    pub fn context(&self) -> DeviceContext {
        self.inner.context
    }

    pub fn elem_count(&self) -> usize {
        self.inner.spec.shape.elem_count()
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Base address of the element buffer.
    pub fn raw_handle(&self) -> Result<RawHandle> {
        Ok(RawHandle(self.read()?.as_ptr() as usize))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg(format!("storage lock poisoned for {:?}", self)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg(format!("storage lock poisoned for {:?}", self)))
    }

    // Host access

    /// Copy the contents to a host vector of f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.read()?.to_f64_vec())
    }

    /// Read the single element of a one-element buffer.
    pub fn to_scalar(&self) -> Result<f64> {
        let data = self.to_f64_vec()?;
        match data.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::msg(format!(
                "not a scalar: tensor has shape {}",
                self.shape()
            ))),
        }
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got,
            });
        }
        Ok(())
    }

    /// Overwrite the buffer with `data`.
    pub fn write_f64(&self, data: &[f64]) -> Result<()> {
        self.check_len(data.len())?;
        self.write()?.write_f64(data);
        Ok(())
    }

    /// Element-wise add `data` into the buffer.
    pub fn accumulate_f64(&self, data: &[f64]) -> Result<()> {
        self.check_len(data.len())?;
        self.write()?.accumulate_f64(data);
        Ok(())
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: f64) -> Result<()> {
        self.write_f64(&vec![value; self.elem_count()])
    }

    /// Overwrite this buffer with the contents of `src`.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        if self.ptr_eq(src) {
            return Ok(());
        }
        let data = src.to_f64_vec()?;
        self.write_f64(&data)
    }

    /// Element-wise add the contents of `src` into this buffer.
    pub fn add_assign(&self, src: &Tensor) -> Result<()> {
        let data = src.to_f64_vec()?;
        self.accumulate_f64(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_buffer() {
        let a = Tensor::zeros(3, DType::F32, DeviceContext::cpu(0));
        let b = a.clone();
        b.fill(2.0).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.to_f64_vec().unwrap(), vec![2.0; 3]);
    }

    #[test]
    fn test_element_count_checked() {
        let err = Tensor::from_f64_slice(&[1.0], (2, 2), DType::F32, DeviceContext::cpu(0));
        assert!(matches!(err, Err(Error::ElementCountMismatch { .. })));

        let t = Tensor::zeros(2, DType::F32, DeviceContext::cpu(0));
        assert!(t.write_f64(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_add_assign_and_scalar() {
        let ctx = DeviceContext::cpu(0);
        let a = Tensor::scalar(1.5, DType::F32, ctx);
        let b = Tensor::scalar(2.0, DType::F32, ctx);
        a.add_assign(&b).unwrap();
        assert_eq!(a.to_scalar().unwrap(), 3.5);
        assert_eq!(a.dims(), &[1]);
    }

    #[test]
    fn test_from_slice_picks_dtype() {
        let t = Tensor::from_slice(&[1i32, 2, 3], 3, DeviceContext::cpu(0)).unwrap();
        assert_eq!(t.dtype(), DType::I32);
        assert_ne!(t.raw_handle().unwrap(), RawHandle(0));
    }
}
