//! Result type definition and extension traits.
//!
//! `into_option_logged` is for best-effort paths that should log and carry
//! on instead of propagating.

use crate::error::Error;

/// The standard Result type for switchboard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing safe combinators for Results.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Operation failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_into_option_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged(), Some(42));
    }

    #[test]
    fn test_result_into_option_err() {
        let result: Result<i32> = Err(Error::invalid_config("test"));
        assert_eq!(result.into_option_logged(), None);
    }

    #[test]
    fn test_foreign_error_into_option() {
        let result: std::result::Result<i32, String> = Err("boom".to_string());
        assert_eq!(result.into_option_logged(), None);
    }
}
