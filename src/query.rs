//! The compiled query object: the one type users hold on to.
//!
//! A [`Query`](struct.Query.html) owns its AST arena, its placeholder
//! bindings, its lazily compiled regular expressions and its matching
//! state; dropping the query disposes all of it at once. Documents are
//! never owned by a query.
//!
//! ```
//! use quince::prelude::*;
//! use serde_json::json;
//!
//! # fn main() -> quince::error::Result<()> {
//! let doc = BinDoc::from_json(&json!({ "foo": { "bar": 22 } }))?;
//! let mut query = Query::new(Some("users"), "/foo/[bar = 22]")?;
//! assert!(query.matched(&doc)?);
//!
//! let mut other = Query::new(Some("users"), "/foo/[bar > 100]")?;
//! assert!(!other.matched(&doc)?);
//! # Ok(())
//! # }
//! ```

use std::cmp::Ordering;
use log::debug;
use serde_json::Value;
use crate::ast::{ ApplyClause, Ast, Binding, Literal, PhId, QueryMode };
use crate::bindoc::{ BinDoc, BinView };
use crate::error::{ Error, ErrorKind, ParseLine, Result };
use crate::matcher::{ match_document, MatchEnv, MatchState };
use crate::parse;
use crate::project;
use crate::rx::Regex;
use crate::value::compare_nodes;

bitflags! {
    /// Compilation mode flags.
    pub struct CompileMode: u8 {
        /// Attach the buffered parser diagnostic (the offending source
        /// line) to a parse error, for later retrieval.
        const KEEP_QUERY_ON_PARSE_ERROR = 0b0000_0001;
        /// Do not echo parse errors through the logging facade.
        const SILENT_ON_PARSE_ERROR     = 0b0000_0010;
    }
}

/// Addresses a placeholder slot by name (`:name`) or by positional index
/// (`:?`, zero-based in order of occurrence).
#[derive(Debug, Clone, Copy)]
pub enum Slot<'a> {
    /// A named slot.
    Name(&'a str),
    /// A positional slot.
    Pos(usize),
}

impl<'a> From<&'a str> for Slot<'a> {
    fn from(name: &'a str) -> Self {
        Slot::Name(name)
    }
}

impl<'a> From<usize> for Slot<'a> {
    fn from(index: usize) -> Self {
        Slot::Pos(index)
    }
}

/// A compiled query over one collection.
#[derive(Debug)]
pub struct Query {
    ast: Ast,
    coll: String,
    bindings: Vec<Option<Binding>>,
    state: MatchState,
}

impl Query {
    /// Compiles `text` with default mode flags.
    pub fn new(coll: Option<&str>, text: &str) -> Result<Self> {
        Self::compile(coll, text, CompileMode::empty())
    }

    /// Compiles `text` for `coll`. When no collection is given, the first
    /// query anchor supplies one; a query with neither fails with
    /// `NoCollection`.
    pub fn compile(coll: Option<&str>, text: &str, mode: CompileMode) -> Result<Self> {
        let ast = match parse::parse(text) {
            Ok(ast) => ast,
            Err(mut e) => {
                if e.kind() == ErrorKind::QueryParse {
                    if !mode.contains(CompileMode::SILENT_ON_PARSE_ERROR) {
                        debug!("query parse failed: {}", e);
                    }
                    if !mode.contains(CompileMode::KEEP_QUERY_ON_PARSE_ERROR) {
                        e.remove_context::<ParseLine>();
                    }
                }
                return Err(e);
            }
        };
        let coll = match coll.map(str::to_owned).or_else(|| ast.first_anchor.clone()) {
            Some(coll) => coll,
            None => {
                return Err(Error::new(ErrorKind::NoCollection,
                                      "no collection specified in query"));
            }
        };
        let bindings = vec![None; ast.placeholders.len()];
        let state = MatchState::new(&ast);
        Ok(Query { ast, coll, bindings, state })
    }

    // ---- metadata -------------------------------------------------------

    /// The collection the query is bound to.
    pub fn collection(&self) -> &str {
        &self.coll
    }

    /// The first anchor in the query text, if any.
    pub fn first_anchor(&self) -> Option<&str> {
        self.ast.first_anchor.as_deref()
    }

    /// `true` when the query mutates matched documents (`apply` or `del`).
    pub fn has_apply(&self) -> bool {
        self.ast.apply.is_some() || self.has_apply_delete()
    }

    /// `true` for `| del` queries.
    pub fn has_apply_delete(&self) -> bool {
        self.ast.mode.contains(QueryMode::APPLY_DEL)
    }

    /// `true` for `| upsert {...}` queries.
    pub fn has_apply_upsert(&self) -> bool {
        self.ast.mode.contains(QueryMode::APPLY_UPSERT)
    }

    /// The `upsert` payload, if any.
    pub fn upsert_value(&self) -> Option<&Value> {
        self.ast.upsert.as_ref()
    }

    /// `true` when the query carries projection patterns.
    pub fn has_projection(&self) -> bool {
        !self.ast.projection.is_empty()
    }

    /// `true` when the query carries `asc`/`desc` clauses.
    pub fn has_orderby(&self) -> bool {
        !self.ast.orderby.is_empty()
    }

    /// `true` for `| count` queries.
    pub fn has_aggregate_count(&self) -> bool {
        self.ast.mode.contains(QueryMode::COUNT)
    }

    /// The resolved `skip` operand, if the clause is present.
    pub fn skip(&self) -> Result<Option<i64>> {
        match self.ast.skip {
            Some(lit) => self.clause_int(lit).map(Some),
            None => Ok(None),
        }
    }

    /// The resolved `limit` operand, if the clause is present.
    pub fn limit(&self) -> Result<Option<i64>> {
        match self.ast.limit {
            Some(lit) => self.clause_int(lit).map(Some),
            None => Ok(None),
        }
    }

    fn clause_int(&self, lit: crate::ast::LitId) -> Result<i64> {
        let value = match *self.ast.literal(lit) {
            Literal::I64(v) => v,
            Literal::Placeholder(ph) => match self.bindings[ph.0 as usize] {
                Some(Binding::I64(v)) => v,
                Some(_) => {
                    return Err(Error::new(ErrorKind::InvalidPlaceholder,
                                          "skip/limit placeholder must hold an integer"));
                }
                None => {
                    return Err(Error::new(ErrorKind::UnsetPlaceholder,
                                          "skip/limit placeholder has no bound value"));
                }
            },
            _ => {
                return Err(Error::new(ErrorKind::InvalidPlaceholder,
                                      "skip/limit must be an integer"));
            }
        };
        if value < 0 {
            Err(Error::new(ErrorKind::InvalidPlaceholder,
                           "skip/limit must be non-negative"))
        } else {
            Ok(value)
        }
    }

    // ---- placeholder binding --------------------------------------------

    fn slot_id(&self, slot: Slot<'_>) -> Result<PhId> {
        let positional;
        let name = match slot {
            Slot::Name(name) => name,
            Slot::Pos(index) => {
                positional = format!("?{}", index);
                &positional
            }
        };
        self.ast.placeholder_by_name(name).ok_or_else(|| {
            Error::new(ErrorKind::InvalidPlaceholder,
                       format!("query has no placeholder `:{}`", name))
        })
    }

    fn bind(&mut self, slot: Slot<'_>, value: Binding) -> Result<()> {
        let ph = self.slot_id(slot)?;
        let meta = &self.ast.placeholders[ph.0 as usize];
        if meta.in_projection && !matches!(value, Binding::Str(_)) {
            return Err(Error::new(
                ErrorKind::InvalidPlaceholderValueType,
                format!("projection placeholder `:{}` accepts only strings", meta.name),
            ));
        }
        // Rebinding drops the previous value.
        self.bindings[ph.0 as usize] = Some(value);
        Ok(())
    }

    /// Binds an integer.
    pub fn set_i64<'s, S: Into<Slot<'s>>>(&mut self, slot: S, value: i64) -> Result<()> {
        self.bind(slot.into(), Binding::I64(value))
    }

    /// Binds a float.
    pub fn set_f64<'s, S: Into<Slot<'s>>>(&mut self, slot: S, value: f64) -> Result<()> {
        self.bind(slot.into(), Binding::F64(value))
    }

    /// Binds a boolean.
    pub fn set_bool<'s, S: Into<Slot<'s>>>(&mut self, slot: S, value: bool) -> Result<()> {
        self.bind(slot.into(), Binding::Bool(value))
    }

    /// Binds `null`.
    pub fn set_null<'s, S: Into<Slot<'s>>>(&mut self, slot: S) -> Result<()> {
        self.bind(slot.into(), Binding::Null)
    }

    /// Binds a string.
    pub fn set_str<'s, S: Into<Slot<'s>>>(&mut self, slot: S, value: &str) -> Result<()> {
        self.bind(slot.into(), Binding::Str(value.to_owned()))
    }

    /// Binds a JSON subtree.
    pub fn set_json<'s, S: Into<Slot<'s>>>(&mut self, slot: S, value: &Value) -> Result<()> {
        self.bind(slot.into(), Binding::Json(value.clone()))
    }

    /// Binds a regular expression, compiling it eagerly so malformed
    /// patterns fail here instead of at first use.
    pub fn set_regex<'s, S: Into<Slot<'s>>>(&mut self, slot: S, pattern: &str) -> Result<()> {
        let rx = Regex::new(pattern)?;
        self.bind(slot.into(), Binding::Regex(rx))
    }

    // ---- matching -------------------------------------------------------

    /// Matches one document, resetting cursors and match flags first.
    pub fn matched(&mut self, doc: &BinDoc) -> Result<bool> {
        self.matched_view(doc.as_view())
    }

    /// Matches a document viewed over an externally owned buffer.
    pub fn matched_view(&mut self, view: BinView<'_>) -> Result<bool> {
        let env = MatchEnv { ast: &self.ast, bindings: &self.bindings };
        match_document(&env, &mut self.state, view)
    }

    /// Clears match state; placeholder bindings are cleared only on request.
    pub fn reset(&mut self, reset_placeholders: bool) {
        self.state.reset();
        if reset_placeholders {
            for binding in &mut self.bindings {
                *binding = None;
            }
        }
    }

    // ---- apply & projection ---------------------------------------------

    /// Decodes the document, applies the `apply` clause and the projection,
    /// and returns the shaped tree. `None` when the query has neither
    /// clause. The document itself is never mutated.
    pub fn apply_and_project(&self, doc: &BinDoc) -> Result<Option<Value>> {
        if self.ast.apply.is_none() && self.ast.projection.is_empty() {
            return Ok(None);
        }
        let mut root = doc.to_json()?;
        if let Some(ref clause) = self.ast.apply {
            project::apply(&mut root, clause)?;
        }
        if !self.ast.projection.is_empty() {
            project::project(&mut root, &self.ast, &self.bindings)?;
        }
        Ok(Some(root))
    }

    /// The shaped output for one emitted document.
    fn emit(&self, doc: &BinDoc) -> Result<Value> {
        match self.apply_and_project(doc)? {
            Some(shaped) => Ok(shaped),
            None => doc.to_json(),
        }
    }

    // ---- execution ------------------------------------------------------

    /// Runs the query over a document source, honoring `skip`, `limit` and
    /// `asc`/`desc` (matches are buffered and sorted when order-by is in
    /// effect; otherwise the source's order is kept), and shapes each
    /// emitted document through apply/projection.
    pub fn run<'d, I>(&mut self, docs: I) -> Result<Vec<Value>>
        where I: IntoIterator<Item = &'d BinDoc>
    {
        let skip = self.skip()?.unwrap_or(0) as usize;
        let limit = self.limit()?.map(|l| l as usize);
        let mut out = Vec::new();

        if self.ast.orderby.is_empty() {
            let mut skipped = 0;
            for doc in docs {
                if !self.matched(doc)? {
                    continue;
                }
                if skipped < skip {
                    skipped += 1;
                    continue;
                }
                out.push(self.emit(doc)?);
                if limit.map_or(false, |l| out.len() >= l) {
                    break;
                }
            }
            return Ok(out);
        }

        let mut matches: Vec<&'d BinDoc> = Vec::new();
        for doc in docs {
            if self.matched(doc)? {
                matches.push(doc);
            }
        }
        let mut decoded = Vec::with_capacity(matches.len());
        for doc in matches {
            decoded.push((doc.to_json()?, doc));
        }
        let clauses = self.ast.orderby.clone();
        decoded.sort_by(|a, b| {
            for clause in &clauses {
                let left = node_at(&a.0, &clause.path);
                let right = node_at(&b.0, &clause.path);
                let ord = match (left, right) {
                    (Some(l), Some(r)) => compare_nodes(l, r),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ord = if clause.desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        for (_, doc) in decoded.into_iter().skip(skip) {
            if limit.map_or(false, |l| out.len() >= l) {
                break;
            }
            out.push(self.emit(doc)?);
        }
        Ok(out)
    }

    /// The parsed `apply` clause, if any.
    pub fn apply_clause(&self) -> Option<&ApplyClause> {
        self.ast.apply.as_ref()
    }
}

/// Walks a decoded tree along a field path; array segments parse as indices.
fn node_at<'v>(root: &'v Value, path: &[String]) -> Option<&'v Value> {
    let mut node = root;
    for seg in path {
        node = match *node {
            Value::Object(ref entries) => entries.get(seg)?,
            Value::Array(ref items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use crate::error::ErrorKind;
    use super::*;

    fn doc(value: serde_json::Value) -> BinDoc {
        BinDoc::from_json(&value).unwrap()
    }

    #[test]
    fn collection_resolution() {
        let q = Query::new(Some("c1"), "/foo").unwrap();
        assert_eq!(q.collection(), "c1");
        let q = Query::new(None, "@mycoll/=22").unwrap();
        assert_eq!(q.collection(), "mycoll");
        assert_eq!(q.first_anchor(), Some("mycoll"));
        let err = Query::new(None, "/foo").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCollection);
    }

    #[test]
    fn metadata_flags() {
        let q = Query::new(Some("c"), "/a | apply {\"x\": 1} | skip 3 | limit 7").unwrap();
        assert!(q.has_apply());
        assert!(!q.has_apply_delete());
        assert!(!q.has_projection());
        assert_eq!(q.skip().unwrap(), Some(3));
        assert_eq!(q.limit().unwrap(), Some(7));

        let q = Query::new(Some("c"), "/a | del").unwrap();
        assert!(q.has_apply());
        assert!(q.has_apply_delete());

        let q = Query::new(Some("c"), "/a | count | asc /a").unwrap();
        assert!(q.has_aggregate_count());
        assert!(q.has_orderby());

        let q = Query::new(Some("c"), "/a | upsert {\"a\": 1}").unwrap();
        assert!(q.has_apply_upsert());
        assert_eq!(q.upsert_value(), Some(&json!({ "a": 1 })));
    }

    #[test]
    fn placeholder_binding_errors() {
        let mut q = Query::new(Some("c"), "/a/[b = :val]").unwrap();
        assert_eq!(q.set_i64("nope", 1).unwrap_err().kind(),
                   ErrorKind::InvalidPlaceholder);
        q.set_i64("val", 1).unwrap();

        // Matching before binding reports the unset placeholder.
        let mut unbound = Query::new(Some("c"), "/a/[b = :val]").unwrap();
        let d = doc(json!({ "a": { "b": 1 } }));
        assert_eq!(unbound.matched(&d).unwrap_err().kind(),
                   ErrorKind::UnsetPlaceholder);
    }

    #[test]
    fn projection_placeholders_accept_only_strings() {
        let mut q = Query::new(Some("c"), "/* | /:name+/:?").unwrap();
        assert_eq!(q.set_i64(0_usize, 1).unwrap_err().kind(),
                   ErrorKind::InvalidPlaceholderValueType);
        q.set_str("name", "foo").unwrap();
        q.set_str(0_usize, "baz").unwrap();
    }

    #[test]
    fn rebinding_replaces() {
        let mut q = Query::new(Some("c"), "/a/[b = :v]").unwrap();
        let d = doc(json!({ "a": { "b": 2 } }));
        q.set_i64("v", 1).unwrap();
        assert!(!q.matched(&d).unwrap());
        q.set_i64("v", 2).unwrap();
        assert!(q.matched(&d).unwrap());
    }

    #[test]
    fn placeholder_isolation_between_instances() {
        let text = "/a/[b = :v]";
        let mut one = Query::new(Some("c"), text).unwrap();
        let mut two = Query::new(Some("c"), text).unwrap();
        one.set_i64("v", 1).unwrap();
        let d = doc(json!({ "a": { "b": 1 } }));
        assert!(one.matched(&d).unwrap());
        assert_eq!(two.matched(&d).unwrap_err().kind(), ErrorKind::UnsetPlaceholder);
    }

    #[test]
    fn reset_keeps_placeholders_unless_asked() {
        let mut q = Query::new(Some("c"), "/a/[b = :v]").unwrap();
        q.set_i64("v", 1).unwrap();
        q.reset(false);
        let d = doc(json!({ "a": { "b": 1 } }));
        assert!(q.matched(&d).unwrap());
        q.reset(true);
        assert_eq!(q.matched(&d).unwrap_err().kind(), ErrorKind::UnsetPlaceholder);
    }

    #[test]
    fn skip_limit_via_placeholders() {
        let mut q = Query::new(Some("c"), "/* | skip :s").unwrap();
        assert_eq!(q.skip().unwrap_err().kind(), ErrorKind::UnsetPlaceholder);
        q.set_str("s", "x").unwrap();
        assert_eq!(q.skip().unwrap_err().kind(), ErrorKind::InvalidPlaceholder);
        q.set_i64("s", 4).unwrap();
        assert_eq!(q.skip().unwrap(), Some(4));
    }

    #[test]
    fn run_respects_skip_limit_and_order() {
        let docs: Vec<BinDoc> = [3, 1, 4, 1, 5, 9, 2, 6]
            .iter()
            .map(|n| doc(json!({ "n": n })))
            .collect();

        let mut q = Query::new(Some("c"), "/* | asc /n").unwrap();
        let out = q.run(&docs).unwrap();
        let ns: Vec<i64> = out.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, [1, 1, 2, 3, 4, 5, 6, 9]);

        let mut q = Query::new(Some("c"), "/* | desc /n | skip 2 | limit 3").unwrap();
        let out = q.run(&docs).unwrap();
        let ns: Vec<i64> = out.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, [5, 4, 3]);

        // Without order-by the source order is preserved.
        let mut q = Query::new(Some("c"), "/[n > 3] | limit 2").unwrap();
        let out = q.run(&docs).unwrap();
        let ns: Vec<i64> = out.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, [4, 5]);
    }

    #[test]
    fn run_applies_projection() {
        let docs = vec![doc(json!({ "a": 1, "b": 2 })), doc(json!({ "a": 3, "c": 4 }))];
        let mut q = Query::new(Some("c"), "/* | /a").unwrap();
        let out = q.run(&docs).unwrap();
        assert_eq!(out, vec![json!({ "a": 1 }), json!({ "a": 3 })]);
    }

    #[test]
    fn external_buffer_views() {
        let d = doc(json!({ "foo": { "bar": 22 } }));
        let bytes = d.as_bytes().to_vec();
        let view = BinView::new(&bytes).unwrap();
        let mut q = Query::new(Some("c"), "/foo/[bar = 22]").unwrap();
        assert!(q.matched_view(view).unwrap());
    }
}
