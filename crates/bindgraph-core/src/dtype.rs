use std::fmt;

// DType — Element types a bound buffer may carry
//
// Every slot the executor binds (argument, gradient, auxiliary state, output)
// has a dtype that must agree with what shape inference derived for the slot.
// The runtime-facing tag follows the numbering native engines commonly use
// for their type flags:
//
//   F32  — 0, the default for every slot whose dtype is not declared
//   F64  — 1
//   F16  — 2, half precision for mixed-precision graphs
//   I32  — 4, index buffers and labels
//   BF16 — 12

/// Element data type of a tensor slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    #[default]
    F32,
    F64,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
        }
    }

    /// Whether this dtype can carry gradients.
    pub fn is_float(&self) -> bool {
        !matches!(self, DType::I32)
    }

    /// Stable type flag used when a dtype crosses into a native runtime.
    pub fn type_flag(&self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::F16 => 2,
            DType::I32 => 4,
            DType::BF16 => 12,
        }
    }

    /// Inverse of [`DType::type_flag`].
    pub fn from_type_flag(flag: u32) -> Option<Self> {
        match flag {
            0 => Some(DType::F32),
            1 => Some(DType::F64),
            2 => Some(DType::F16),
            4 => Some(DType::I32),
            12 => Some(DType::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Connects Rust scalar types to DType
//
// Lets callers write `Tensor::from_slice(&[1.0f32, 2.0], 2, ctx)` and have the
// dtype picked from the element type.

/// Rust scalar types that can back a tensor.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType variant.
    const DTYPE: DType;

    /// Widen to f64 for host-side arithmetic.
    fn to_f64(self) -> f64;

    /// Narrow from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}
