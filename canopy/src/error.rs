// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the likelihood engine.
//!
//! The taxonomy is closed: every entry point reports one of five kinds, each
//! with a stable negative return code for callers that track integer codes.
//! No external error crates — zero-dependency error type.

use std::fmt;

/// Errors produced by the likelihood engine.
#[derive(Debug)]
pub enum Error {
    /// Unspecified failure.
    General(String),
    /// A buffer pool or device allocation could not be satisfied.
    OutOfMemory(String),
    /// A backend-internal failure that is not part of the contract
    /// (device loss, shader compilation, poisoned instance lock).
    UnidentifiedException(String),
    /// The handle does not refer to a live, initialized instance.
    UninitializedInstance(String),
    /// An index or array length is outside the instance's sizing.
    OutOfRange(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable negative return code for this error kind.
    ///
    /// Success at the procedural boundary is `0` or a non-negative handle.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::General(_) => -1,
            Self::OutOfMemory(_) => -2,
            Self::UnidentifiedException(_) => -3,
            Self::UninitializedInstance(_) => -4,
            Self::OutOfRange(_) => -5,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General(msg) => write!(f, "error: {msg}"),
            Self::OutOfMemory(msg) => write!(f, "out of memory: {msg}"),
            Self::UnidentifiedException(msg) => write!(f, "unidentified exception: {msg}"),
            Self::UninitializedInstance(msg) => write!(f, "uninitialized instance: {msg}"),
            Self::OutOfRange(msg) => write!(f, "out of range: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::General("x".into()).code(), -1);
        assert_eq!(Error::OutOfMemory("x".into()).code(), -2);
        assert_eq!(Error::UnidentifiedException("x".into()).code(), -3);
        assert_eq!(Error::UninitializedInstance("x".into()).code(), -4);
        assert_eq!(Error::OutOfRange("x".into()).code(), -5);
    }

    #[test]
    fn display_carries_context() {
        let err = Error::OutOfRange("partials buffer index 9 >= 4".into());
        let msg = err.to_string();
        assert!(msg.starts_with("out of range"));
        assert!(msg.contains("index 9"));
    }

    #[test]
    fn display_all_kinds() {
        let cases: Vec<(Error, &str)> = vec![
            (Error::General("g".into()), "error"),
            (Error::OutOfMemory("m".into()), "out of memory"),
            (
                Error::UnidentifiedException("u".into()),
                "unidentified exception",
            ),
            (
                Error::UninitializedInstance("i".into()),
                "uninitialized instance",
            ),
            (Error::OutOfRange("r".into()), "out of range"),
        ];
        for (err, prefix) in cases {
            assert!(
                err.to_string().starts_with(prefix),
                "'{err}' should start with '{prefix}'"
            );
        }
    }
}
