//! Result and error types for code generation.
//!
//! Every fallible operation in the pipeline returns [`CodegenResult`]. Errors
//! never tear down a compilation silently: builder-input errors surface from
//! the offending call, allocator errors leave the compilation in a state that
//! must be `reset()` before reuse, and finalization errors mean the produced
//! bytes are not executable.

use thiserror::Error;

/// An error kind produced somewhere in the compilation pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// An argument passed to a builder or pipeline entry point is not valid
    /// (bad signature, over-limit argument count, malformed operand).
    #[error("invalid argument")]
    InvalidArgument,

    /// The requested architecture is unknown, or an operation was attempted
    /// against a compilation targeting a different architecture.
    #[error("invalid or mismatched target architecture")]
    InvalidArch,

    /// A register operand was constructed with a type that does not exist in
    /// the target's register file.
    #[error("invalid register type")]
    InvalidRegType,

    /// A register group was used where the target has no such group.
    #[error("invalid register group")]
    InvalidRegGroup,

    /// A physical register id is outside the target's register file.
    #[error("invalid physical register id {0}")]
    InvalidPhysId(u32),

    /// A label id does not refer to a live entry in the label table.
    #[error("invalid label")]
    InvalidLabel,

    /// The register allocator could not satisfy an instruction's operand
    /// constraints (for example a consecutive-register request with no
    /// feasible placement).
    #[error("register allocator could not satisfy operand constraints")]
    InvalidAssignment,

    /// An internal pass reached a state it cannot make progress from; the
    /// compilation must be reset.
    #[error("invalid internal state")]
    InvalidState,

    /// Two operands were required to be distinct registers but overlap.
    #[error("overlapping registers")]
    OverlappedRegs,

    /// A relative displacement does not fit the relocation's field width.
    #[error("relocated offset out of representable range")]
    RelocOffsetOutOfRange,

    /// A named label with the same name already exists.
    #[error("label with this name already defined")]
    LabelAlreadyDefined,

    /// The label has already been bound to an offset; labels bind once.
    #[error("label already bound")]
    LabelAlreadyBound,

    /// Finalize found a fixup against a label that was never bound.
    #[error("label referenced by a fixup was never bound")]
    ExpressionLabelNotBound,

    /// A run of consecutive physical registers could not be allocated.
    #[error("consecutive register allocation failed")]
    ConsecutiveRegsAllocation,

    /// The operation is recognized but not implemented for this target.
    #[error("not implemented")]
    NotImplemented,
}

/// A convenient alias for a `Result` that uses [`Error`] as the error type.
pub type CodegenResult<T> = Result<T, Error>;

/// An observer for errors surfaced by a compilation.
///
/// The handler is strictly a tap for diagnostics: it sees every error at the
/// point it is raised but cannot alter the value returned to the caller.
pub trait ErrorHandler {
    /// Called once per surfaced error with the kind and a short context
    /// string naming the originating component.
    fn on_error(&mut self, kind: &Error, context: &str);
}

impl<F: FnMut(&Error, &str)> ErrorHandler for F {
    fn on_error(&mut self, kind: &Error, context: &str) {
        self(kind, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::InvalidPhysId(77).to_string(), "invalid physical register id 77");
        assert_eq!(Error::LabelAlreadyBound.to_string(), "label already bound");
    }
}
