//! `Error` and `Result` types arising out of query compilation and matching.

use std::fmt;
use std::error;
use std::result;
use std::ops::Deref;
use std::borrow::Cow;
use backtrace::Backtrace;
use typemap::{ DebugMap, Key };

/// Slightly augmented trait for backtrace-able errors.
pub trait ErrorExt: error::Error {
    /// Similar to `std::error::Error::source()`, but with richer type info.
    fn reason(&self) -> Option<&(dyn ErrorExt + 'static)> {
        None
    }

    /// Returns the deepest possible backtrace, if any.
    fn backtrace(&self) -> Option<&Backtrace> {
        self.reason().and_then(ErrorExt::backtrace)
    }

    /// Structured error kind.
    fn kind(&self) -> ErrorKind;

    /// Until subtrait coercions are implemented, this helper method
    /// should return the receiver as an `&std::error::Error` trait object.
    fn as_std_error(&self) -> &(dyn error::Error + 'static);
}

/// A trait for conveniently propagating errors up the call stack.
pub trait ResultExt<T>: Sized {
    /// If this `Result` is an `Err`, then prepend the specified error
    /// to the front of the linked list of causes.
    fn chain<M: ErrMsg>(self, message: M) -> Result<T>;
}

/// Values that can act as or generate an error message.
pub trait ErrMsg: Sized {
    /// Convert the value to an error message.
    fn into_message(self) -> Cow<'static, str>;
}

/// Type alias for a `Result` containing a Quince `Error`.
pub type Result<T> = result::Result<T, Error>;

impl<T, E> ResultExt<T> for result::Result<T, E> where E: ErrorExt + 'static {
    fn chain<M: ErrMsg>(self, message: M) -> Result<T> {
        self.map_err(|cause| Error::with_cause(message.into_message(), cause))
    }
}

/// Blanket `impl ErrMsg` for string literals.
impl ErrMsg for &'static str {
    fn into_message(self) -> Cow<'static, str> {
        Cow::Borrowed(self)
    }
}

/// Blanket `impl ErrMsg` for error message formatting functions.
impl<F> ErrMsg for F where F: FnOnce() -> String {
    fn into_message(self) -> Cow<'static, str> {
        Cow::Owned(self())
    }
}

/// A structured, "machine-readable" error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The query text could not be parsed.
    QueryParse,
    /// A placeholder name or position does not exist in the query.
    InvalidPlaceholder,
    /// A placeholder was used during matching before a value was bound to it.
    UnsetPlaceholder,
    /// The bound value has a type this placeholder cannot accept
    /// (e.g. a non-string value for a projection placeholder).
    InvalidPlaceholderValueType,
    /// A regular expression could not be compiled.
    RegexpInvalid,
    /// A regular expression has an unterminated character set.
    RegexpCharset,
    /// A regular expression has an unterminated subexpression.
    RegexpSubexp,
    /// A regular expression has an unterminated submatch group.
    RegexpSubmatch,
    /// The compiled regular expression program is corrupted.
    RegexpEngine,
    /// More than one `skip` clause was specified.
    SkipAlreadySet,
    /// More than one `limit` clause was specified.
    LimitAlreadySet,
    /// The number of `asc`/`desc` clauses exceeds the implementation limit.
    OrderbyMaxLimit,
    /// Neither an explicit collection nor a query anchor was given.
    NoCollection,
    /// A binary document writer ran out of representable space
    /// (key longer than 255 bytes, or total size above `i32::MAX`).
    Overflow,
    /// A keyed value was written into a list, or vice versa.
    InvalidType,
    /// A binary document buffer is inconsistent with its own length fields.
    Malformed,
    /// A JSON value cannot be represented (e.g. an integer above `i64::MAX`).
    InvalidJson,
}

impl ErrorKind {
    /// Returns a human-readable error description for this kind.
    pub fn as_str(self) -> &'static str {
        use self::ErrorKind::*;

        match self {
            QueryParse                  => "query parsing error",
            InvalidPlaceholder          => "invalid placeholder position",
            UnsetPlaceholder            => "found unset placeholder",
            InvalidPlaceholderValueType => "invalid type of placeholder value",
            RegexpInvalid               => "invalid regular expression",
            RegexpCharset               => "expected ']' at end of character set",
            RegexpSubexp                => "expected ')' at end of subexpression",
            RegexpSubmatch              => "expected '}' at end of submatch",
            RegexpEngine                => "illegal instruction in compiled regular expression",
            SkipAlreadySet              => "skip clause already specified",
            LimitAlreadySet             => "limit clause already specified",
            OrderbyMaxLimit             => "reached max number of asc/desc order clauses: 64",
            NoCollection                => "no collection specified in query",
            Overflow                    => "binary document size overflow",
            InvalidType                 => "value type not allowed in this container",
            Malformed                   => "malformed binary document",
            InvalidJson                 => "JSON value can't be represented",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// The central error type for Quince.
#[derive(Debug)]
pub struct Error {
    /// The structured, "machine-readable" kind of this error.
    kind: ErrorKind,
    /// The human-readable description.
    message: Cow<'static, str>,
    /// The underlying error, if any.
    cause: Option<Box<dyn ErrorExt>>,
    /// The backtrace, if any.
    backtrace: Option<Backtrace>,
    /// Additional context info, if any.
    context: DebugMap,
}

impl Error {
    /// Creates an error with the specified kind, message, no cause,
    /// and a backtrace.
    pub fn new<S>(kind: ErrorKind, message: S) -> Self
        where S: Into<Cow<'static, str>>
    {
        Error {
            kind,
            message: message.into(),
            cause: None,
            backtrace: Some(Backtrace::new()),
            context: DebugMap::custom(),
        }
    }

    /// Creates an error with the specified message and cause. If the cause has
    /// no backtrace, this method will create it and add it to the new instance.
    pub fn with_cause<S, E>(message: S, cause: E) -> Self
        where S: Into<Cow<'static, str>>,
              E: ErrorExt + 'static
    {
        let kind = cause.kind();
        let message = message.into();
        let backtrace = if cause.backtrace().is_none() {
            Some(Backtrace::new())
        } else {
            None
        };
        let cause: Option<Box<dyn ErrorExt>> = Some(Box::new(cause));
        let context = DebugMap::custom();

        Error { kind, message, cause, backtrace, context }
    }

    /// The structured kind, also reachable through `ErrorExt`.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns additional context info if any.
    pub fn context<K: Key>(&self) -> Option<&K::Value>
        where K::Value: fmt::Debug
    {
        self.context.get::<K>()
    }

    /// Augments the error with additional context info.
    pub fn set_context<K: Key>(&mut self, value: K::Value) -> Option<K::Value>
        where K::Value: fmt::Debug
    {
        self.context.insert::<K>(value)
    }

    /// Builder-style setter for augmenting the error with context info.
    pub fn with_context<K: Key>(mut self, value: K::Value) -> Self
        where K::Value: fmt::Debug
    {
        self.set_context::<K>(value);
        self
    }

    /// Removes and returns a context entry.
    pub fn remove_context<K: Key>(&mut self) -> Option<K::Value>
        where K::Value: fmt::Debug
    {
        self.context.remove::<K>()
    }
}

impl ErrorExt for Error {
    fn reason(&self) -> Option<&(dyn ErrorExt + 'static)> {
        self.cause.as_ref().map(Deref::deref)
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.reason().and_then(ErrorExt::backtrace).or_else(|| self.backtrace.as_ref())
    }

    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn as_std_error(&self) -> &(dyn error::Error + 'static) {
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;

        if let Some(cause) = self.cause.as_ref() {
            write!(f, ", caused by: {}", cause)?
        }

        Ok(())
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        &self.message
    }

    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.reason().map(ErrorExt::as_std_error)
    }
}

/// Typed context key: the 1-based `(line, column)` a parse error points at.
#[derive(Debug, Clone, Copy)]
pub struct ParsePos;

impl Key for ParsePos {
    type Value = (u32, u32);
}

/// Typed context key: the source line a parse error occurred on.
#[derive(Debug, Clone, Copy)]
pub struct ParseLine;

impl Key for ParseLine {
    type Value = String;
}

/// Implementing `ErrorExt` and `From` boilerplate.
macro_rules! impl_error_type {
    ($ty:path, $kind:ident, $message:expr) => {
        impl From<$ty> for Error {
            fn from(error: $ty) -> Self {
                Self::with_cause($message, error)
            }
        }

        impl ErrorExt for $ty {
            fn kind(&self) -> ErrorKind {
                ErrorKind::$kind
            }

            fn as_std_error(&self) -> &(dyn error::Error + 'static) {
                self
            }
        }
    }
}

impl_error_type! { serde_json::Error, InvalidJson, "JSON transcoding error" }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        let error = Error::new(ErrorKind::UnsetPlaceholder, "sample error message");
        assert_eq!(error.kind(), ErrorKind::UnsetPlaceholder);
        assert!(error.reason().is_none());
        assert!(error.backtrace().is_some());
        assert_eq!(error.to_string(),
                   "found unset placeholder: sample error message");
    }

    #[test]
    fn chained_cause_keeps_kind() {
        let cause = Error::new(ErrorKind::Malformed, "length field out of range");
        let err: Result<i32> = Err(cause);
        let chained = err.chain("while reading document").unwrap_err();
        assert_eq!(chained.kind(), ErrorKind::Malformed);
        assert!(chained.reason().is_some());
    }

    #[test]
    fn parse_context() {
        let error = Error::new(ErrorKind::QueryParse, "unexpected token")
            .with_context::<ParsePos>((3, 14));
        assert_eq!(error.context::<ParsePos>(), Some(&(3, 14)));
    }
}
