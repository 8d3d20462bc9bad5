//! # Quince: the embeddable JSON document query engine
//!
//! Quince is the query core of an embeddable JSON document database: it
//! turns a textual query into a matching/projection/apply pipeline over a
//! self-describing binary document representation, without any storage,
//! transport or index machinery attached.
//!
//! The pieces, bottom up:
//!
//! * [`bindoc`](bindoc/index.html) — the binary container. Documents are
//!   length-prefixed, typed byte buffers that can be traversed in place;
//!   builders write them, borrowing views read them, and corrupted buffers
//!   surface as errors rather than undefined behavior.
//! * [`rx`](rx/index.html) — a small NFA regex engine backing the `re`
//!   operator.
//! * [`query`](query/index.html) — the compiled [`Query`](query/struct.Query.html):
//!   parsing, placeholder binding, matching, projection and apply.
//!
//! ### Matching
//!
//! A query is an expression over `/`-separated path filters. Compile it
//! once, then match it against any number of documents:
//!
//! ```
//! use quince::prelude::*;
//! use serde_json::json;
//!
//! # fn main() -> QuinceResult<()> {
//! let doc = BinDoc::from_json(&json!({
//!     "title": "The Quince Tree Sun",
//!     "meta": { "year": 1992, "tags": ["film", "es"] },
//! }))?;
//!
//! let mut query = Query::new(Some("films"), "/meta/[year >= 1990]")?;
//! assert!(query.matched(&doc)?);
//!
//! let mut query = Query::new(Some("films"), "/meta/[year < 1990]")?;
//! assert!(!query.matched(&doc)?);
//! # Ok(())
//! # }
//! ```
//!
//! Path steps may be field names, `*` (any key, one level), `**` (any key,
//! any depth) or `[...]` predicates combining comparison, membership
//! (`in`/`ni`), regular-expression (`re`) and prefix (`~`) operators with
//! `and`/`or`/`not`.
//!
//! ### Shaping the output
//!
//! Clauses after `|` shape matched documents: include/exclude projections,
//! JSON-Patch or merge `apply`, `skip`/`limit` and `asc`/`desc` ordering:
//!
//! ```
//! use quince::prelude::*;
//! use serde_json::json;
//!
//! # fn main() -> QuinceResult<()> {
//! let doc = BinDoc::from_json(&json!({
//!     "title": "The Quince Tree Sun",
//!     "meta": { "year": 1992, "tags": ["film", "es"] },
//! }))?;
//!
//! let mut query = Query::new(Some("films"), "/** | /title")?;
//! assert!(query.matched(&doc)?);
//! let shaped = query.apply_and_project(&doc)?.unwrap();
//! assert_eq!(shaped, json!({ "title": "The Quince Tree Sun" }));
//! # Ok(())
//! # }
//! ```
//!
//! ### Placeholders
//!
//! Literals may be deferred with named (`:name`) or positional (`:?`)
//! placeholders and bound later — queries compiled from untrusted input
//! never concatenate user values into the query text:
//!
//! ```
//! use quince::prelude::*;
//! use serde_json::json;
//!
//! # fn main() -> QuinceResult<()> {
//! let doc = BinDoc::from_json(&json!({
//!     "meta": { "tags": ["film", "es"] },
//! }))?;
//!
//! let mut query = Query::new(Some("films"), "/meta/tags/[** in :wanted]")?;
//! query.set_json("wanted", &json!(["es", "de"]))?;
//! assert!(query.matched(&doc)?);
//! # Ok(())
//! # }
//! ```
//!
//! Each query instance owns its bindings: binding a placeholder on one
//! query never affects another compiled from the same text.
//!
//! ### Concurrency
//!
//! A `Query` is single-threaded: it owns mutable matching state, so
//! concurrent matching requires one query object per thread. Read-only
//! document buffers may be shared freely; a
//! [`BinView`](bindoc/struct.BinView.html) never outlives its backing
//! bytes and never writes through them.

#![doc(html_root_url = "https://docs.rs/quince/0.1.0")]
#![deny(missing_debug_implementations,
        unsafe_code,
        anonymous_parameters, bare_trait_objects,
        unused_import_braces, missing_docs)]
#![allow(clippy::single_match, clippy::match_same_arms, clippy::match_ref_pats,
         clippy::needless_pass_by_value)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate serde_derive;
extern crate backtrace;
extern crate linked_hash_map;
extern crate log;
extern crate serde;
extern crate serde_json;
extern crate typemap;

pub mod ast;
pub mod bindoc;
pub mod error;
pub mod matcher;
pub mod prelude;
pub mod project;
pub mod query;
pub mod rx;
pub mod value;

mod parse;
