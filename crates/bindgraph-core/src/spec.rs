use std::fmt;

use crate::dtype::DType;
use crate::shape::Shape;

/// Shape and dtype of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorSpec {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        TensorSpec {
            shape: shape.into(),
            dtype,
        }
    }

    /// Spec with the default dtype (f32).
    pub fn f32(shape: impl Into<Shape>) -> Self {
        TensorSpec::new(shape, DType::F32)
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.elem_count() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.shape, self.dtype)
    }
}

/// Per-slot specs produced by shape inference.
///
/// Each list is positionally aligned with the graph's argument, auxiliary and
/// output name lists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShapeTable {
    pub arguments: Vec<TensorSpec>,
    pub auxiliary_states: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}
