use crate::error::Result;
use crate::tensor::Tensor;

// WritePolicy — How a freshly computed gradient meets its target buffer
//
// One policy per argument, positionally aligned with the gradient buffers.
// The list is fixed at bind time.
//
//   NoOp         — the argument needs no gradient; its slot is never touched
//   WriteTo      — overwrite the slot
//   WriteInplace — the slot aliases a forward input; overwrite it in place
//   AddTo        — add into the slot (shared weights, micro-batch accumulation)

/// Gradient write policy for one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WritePolicy {
    #[default]
    NoOp,
    WriteTo,
    WriteInplace,
    AddTo,
}

impl WritePolicy {
    /// Whether the runtime must compute a gradient for this slot.
    pub fn needs_gradient(&self) -> bool {
        !matches!(self, WritePolicy::NoOp)
    }

    /// Combine `contribution` into `slot` according to this policy.
    ///
    /// Returns whether the slot was written. A contribution that already is
    /// the slot (a runtime that wrote in place) is not copied onto itself.
    pub fn commit(&self, slot: &Tensor, contribution: &Tensor) -> Result<bool> {
        match self {
            WritePolicy::NoOp => Ok(false),
            WritePolicy::WriteTo | WritePolicy::WriteInplace => {
                if !slot.ptr_eq(contribution) {
                    slot.copy_from(contribution)?;
                }
                Ok(true)
            }
            WritePolicy::AddTo => {
                slot.add_assign(contribution)?;
                Ok(true)
            }
        }
    }
}
