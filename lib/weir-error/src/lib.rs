//! Generic error handling.
//!
//! Most fallible plumbing in Weir deals in a single opaque error type,
//! [`GenericError`], and only reaches for dedicated error enums where a caller
//! actually branches on the failure. This crate provides that type, a macro to
//! construct one ad hoc, and an extension trait for layering human-readable
//! context onto results as they bubble up.

use std::fmt::Display;

/// An opaque error carrying a message, an optional source chain, and a backtrace.
pub type GenericError = anyhow::Error;

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

/// Constructs a [`GenericError`] in place.
///
/// Accepts a string literal, a format string plus arguments (identical to
/// `std::format!`), or any value implementing both `Debug` and `Display`. When
/// given an existing error value, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension trait for attaching context to the error variant of a result.
///
/// This intentionally shadows `anyhow::Context` under different method names so
/// that code using `snafu::ResultExt` in the same module does not hit method
/// resolution conflicts.
pub trait ErrorContext<T, E>: sealed::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with context built lazily, only if an error occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallible(fail: bool) -> Result<u32, GenericError> {
        if fail {
            Err(generic_error!("underlying failure: code {}", 7))
        } else {
            Ok(42)
        }
    }

    #[test]
    fn macro_formats_message() {
        let err = fallible(true).unwrap_err();
        assert_eq!(err.to_string(), "underlying failure: code 7");
    }

    #[test]
    fn context_is_layered() {
        let err = fallible(true).error_context("while doing the thing").unwrap_err();
        assert_eq!(err.to_string(), "while doing the thing");

        let chain = err.chain().map(|e| e.to_string()).collect::<Vec<_>>();
        assert_eq!(chain, vec!["while doing the thing", "underlying failure: code 7"]);
    }

    #[test]
    fn lazy_context_not_built_on_success() {
        let value = fallible(false)
            .with_error_context(|| -> String { unreachable!("context must not be built for Ok") })
            .unwrap();
        assert_eq!(value, 42);
    }
}
