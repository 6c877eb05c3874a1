//! Failure classification shared by every guarded operation.

/// Whether retrying an operation can change its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to resolve without code changes: timeouts, refused connections,
    /// exhausted pools, statement timeouts.
    Transient,
    /// Recurs identically on retry: validation, constraint violations, not-found.
    Permanent,
}

/// Errors that know which side of the taxonomy they fall on.
pub trait Classify {
    fn class(&self) -> FailureClass;

    fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}
