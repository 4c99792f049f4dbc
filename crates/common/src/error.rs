//! Message-built errors and the `.context()` helpers each crate expands
//! for its own `Error`/`Result` pair.

/// Error types that can be built from a plain message string.
///
/// Pair with [`impl_context!`] to get `.context()` / `.with_context()` on
/// `Result` and `Option` inside a crate.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Expand a crate-local `Context` trait for the `Error`/`Result` pair in scope.
///
/// ```ignore
/// // crates/napcat/src/error.rs
/// napgate_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Error(String);

    impl FromMessage for Error {
        fn from_message(message: String) -> Self {
            Self(message)
        }
    }

    type Result<T> = std::result::Result<T, Error>;

    crate::impl_context!();

    #[test]
    fn context_prefixes_source_message() {
        let res: std::result::Result<(), std::fmt::Error> = Err(std::fmt::Error);
        let err = res.context("formatting banner").unwrap_err();
        assert!(err.0.starts_with("formatting banner: "));
    }

    #[test]
    fn option_context_uses_message() {
        let err = None::<u8>.context("missing account").unwrap_err();
        assert_eq!(err, Error("missing account".into()));
    }

    #[test]
    fn with_context_is_lazy_on_success() {
        let ok: std::result::Result<u8, std::fmt::Error> = Ok(7);
        let value = ok
            .with_context(|| -> String { panic!("context built for Ok") })
            .unwrap();
        assert_eq!(value, 7);
    }
}
