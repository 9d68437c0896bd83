use half::{bf16, f16};

use crate::dtype::{DType, WithDType};

// Storage — Typed element buffer behind a tensor handle
//
// Host-side arithmetic (write-policy commits, update rules, the reference
// runtime's kernels) goes through f64: reads widen, writes narrow back to the
// buffer's own element type.

/// Typed element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
}

fn narrow<T: WithDType>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&v| T::from_f64(v)).collect()
}

fn widen<T: WithDType>(data: &[T]) -> Vec<f64> {
    data.iter().map(|&v| WithDType::to_f64(v)).collect()
}

fn overwrite<T: WithDType>(dst: &mut [T], src: &[f64]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = T::from_f64(s);
    }
}

fn accumulate<T: WithDType>(dst: &mut [T], src: &[f64]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = T::from_f64(WithDType::to_f64(*d) + s);
    }
}

impl Storage {
    /// A zero-filled buffer of `len` elements.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        Storage::from_f64(dtype, &vec![0.0; len])
    }

    /// Narrow `data` into a buffer of `dtype`.
    pub fn from_f64(dtype: DType, data: &[f64]) -> Self {
        match dtype {
            DType::F16 => Storage::F16(narrow(data)),
            DType::BF16 => Storage::BF16(narrow(data)),
            DType::F32 => Storage::F32(narrow(data)),
            DType::F64 => Storage::F64(data.to_vec()),
            DType::I32 => Storage::I32(narrow(data)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::F16(v) => v.len(),
            Storage::BF16(v) => v.len(),
            Storage::F32(v) => v.len(),
            Storage::F64(v) => v.len(),
            Storage::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Storage::F16(v) => widen(v),
            Storage::BF16(v) => widen(v),
            Storage::F32(v) => widen(v),
            Storage::F64(v) => v.clone(),
            Storage::I32(v) => widen(v),
        }
    }

    /// Overwrite every element. `src` must have `self.len()` elements.
    pub fn write_f64(&mut self, src: &[f64]) {
        match self {
            Storage::F16(v) => overwrite(v, src),
            Storage::BF16(v) => overwrite(v, src),
            Storage::F32(v) => overwrite(v, src),
            Storage::F64(v) => v.copy_from_slice(src),
            Storage::I32(v) => overwrite(v, src),
        }
    }

    /// Element-wise add `src` into the buffer.
    pub fn accumulate_f64(&mut self, src: &[f64]) {
        match self {
            Storage::F16(v) => accumulate(v, src),
            Storage::BF16(v) => accumulate(v, src),
            Storage::F32(v) => accumulate(v, src),
            Storage::F64(v) => accumulate(v, src),
            Storage::I32(v) => accumulate(v, src),
        }
    }

    /// Base address of the element buffer.
    pub fn as_ptr(&self) -> *const u8 {
        match self {
            Storage::F16(v) => v.as_ptr() as *const u8,
            Storage::BF16(v) => v.as_ptr() as *const u8,
            Storage::F32(v) => v.as_ptr() as *const u8,
            Storage::F64(v) => v.as_ptr() as *const u8,
            Storage::I32(v) => v.as_ptr() as *const u8,
        }
    }
}
