//! Error types shared across the JIT core
//!
//! Two domains exist. Recoverable failures (bad configuration, a patch point
//! that does not match the expected encoding, backend lowering errors) are
//! `thiserror` enums returned through `Result`. Compiler-internal invariant
//! violations are never recoverable: they go through [`ice!`](crate::ice),
//! which logs the diagnostic and panics.

use crate::backend::traits::CodegenError;
use crate::mcwriter::PatchpointError;

/// Abort compilation with an internal-compiler-error diagnostic.
///
/// Used for violated invariants that indicate a bug in the compiler or in
/// one of its analysis collaborators, never for language-level errors.
#[macro_export]
macro_rules! ice {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(target: "pyrite_jit::ice", "{}", message);
        panic!("internal compiler error: {}", message)
    }};
}

/// Error while reading JIT configuration overrides
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: expected {expected}")]
    InvalidValue {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Error surfaced by the end-to-end compilation pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Patchpoint(#[from] PatchpointError),
    #[error("code cache is full ({used} of {limit} bytes used)")]
    CodeCacheFull { used: usize, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "internal compiler error: bad block bb3")]
    fn test_ice_panics_with_message() {
        ice!("bad block bb{}", 3);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            var: "PYRITE_OSR_THRESHOLD",
            value: "lots".to_string(),
            expected: "an integer",
        };
        assert_eq!(
            err.to_string(),
            "invalid value \"lots\" for PYRITE_OSR_THRESHOLD: expected an integer"
        );
    }
}
