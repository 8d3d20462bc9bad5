//! The most frequently used types, re-exported in one place.

pub use crate::bindoc::{ Atom, BinDoc, BinView, DocBuilder, DocKind, Elem, KeyRef };
pub use crate::query::{ CompileMode, Query, Slot };
pub use crate::rx::Regex;
pub use crate::error::{
    Error as QuinceError,
    ErrorKind as QuinceErrorKind,
    Result as QuinceResult,
    ErrorExt, ResultExt,
};
