//! The arena-backed abstract syntax tree of a parsed query.
//!
//! Every node produced by the parser lives in one of the typed pools inside
//! [`Ast`](struct.Ast.html) and is referred to by a small copyable id, so
//! the tree is cycle-free by construction and freed as one unit when the
//! query is dropped. Mutable matching state is deliberately *not* stored
//! here; the matcher keeps it in sibling vectors indexed by the same ids,
//! which lets the AST stay immutable for the lifetime of the query.

use linked_hash_map::LinkedHashMap;
use serde_json::Value;
use crate::rx::Regex;

macro_rules! define_id {
    ($($(#[$attr:meta])* $name:ident => $method:ident / $pool:ident: $node:ty;)*) => {$(
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl Ast {
            /// Allocates a node in the pool and returns its id.
            pub fn $method(&mut self, node: $node) -> $name {
                let id = $name(self.$pool.len() as u32);
                self.$pool.push(node);
                id
            }
        }
    )*}
}

define_id! {
    /// Id of an expression node (logical composition element).
    ExprId => push_expr / exprs: ExprNode;
    /// Id of a filter (anchored path chain).
    FilterId => push_filter / filters: Filter;
    /// Id of a path step within a filter.
    StepId => push_step / steps: Step;
    /// Id of a `[key op value]` predicate.
    PredId => push_pred / preds: Pred;
    /// Id of a literal operand.
    LitId => push_literal / literals: Literal;
}

/// Id of a placeholder slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhId(pub u32);

/// How an expression node combines with its previous sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOp {
    /// Both sides must match.
    And,
    /// Either side matching suffices; evaluation short-circuits.
    Or,
}

/// A join edge, with optional negation of the right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Join {
    /// The combining operator.
    pub op: JoinOp,
    /// `and not` / `or not`.
    pub negate: bool,
}

/// One element of an expression-node chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    /// Join to the previous sibling; `None` on the first element.
    pub join: Option<Join>,
    /// What this element is.
    pub kind: ExprKind,
}

/// The payload of an expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// A parenthesised sub-chain.
    Group(Vec<ExprId>),
    /// A filter.
    Filter(FilterId),
    /// A `/=pk` primary-key filter; selection by key belongs to the storage
    /// layer, so in-memory matching treats it as satisfied.
    Pk(LitId),
}

/// An anchored path chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Collection alias this filter is anchored at, if any.
    pub anchor: Option<String>,
    /// The path steps, root first.
    pub steps: Vec<StepId>,
}

/// One step of a filter path.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// A literal field name.
    Field(String),
    /// `*`: any key at exactly one level.
    Any,
    /// `**`: any key at any depth from here on.
    AnyDeep,
    /// `[...]`: a chain of key/value predicates.
    Preds(Vec<PredId>),
}

/// The comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=` / `eq`
    Eq,
    /// `>` / `gt`
    Gt,
    /// `>=` / `gte`
    Gte,
    /// `<` / `lt`
    Lt,
    /// `<=` / `lte`
    Lte,
    /// `in`: membership in the right-hand array.
    In,
    /// `ni`: the left-hand array contains the right-hand value.
    Ni,
    /// `re`: regular expression match.
    Re,
    /// `~`: string prefix match.
    Prefix,
}

/// An operator with its negation flag (`!=`, `not in`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSpec {
    /// The operator.
    pub op: Op,
    /// Invert the outcome.
    pub negate: bool,
}

/// The key side of a `[key op value]` predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum PredKey {
    /// The key must equal this field name; the operator applies to the value.
    Field(String),
    /// `*`: the operator applies to the *key* itself.
    Any,
    /// `**`: any key; the operator applies to the value.
    AnyDeep,
    /// `[* op lit]`: a key predicate; the outer operator applies to the value.
    Expr {
        /// Operator applied to the key.
        op: OpSpec,
        /// Right-hand side of the key predicate.
        rhs: LitId,
    },
}

/// One predicate in a `[...]` chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Pred {
    /// Join to the previous predicate; its `negate` negates this predicate.
    pub join: Option<Join>,
    /// The key side.
    pub key: PredKey,
    /// The operator applied to the value (or the key, for `PredKey::Any`).
    pub op: OpSpec,
    /// The right-hand operand.
    pub rhs: LitId,
}

/// A literal operand, materialized once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A string.
    Str(String),
    /// An integer.
    I64(i64),
    /// A float.
    F64(f64),
    /// `true` / `false`.
    Bool(bool),
    /// `null`.
    Null,
    /// A JSON subtree (array or object).
    Json(Value),
    /// A placeholder slot resolved at match time.
    Placeholder(PhId),
}

/// A placeholder slot. Positional placeholders get synthetic names
/// `?0`, `?1`, ... in order of occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    /// The slot name.
    pub name: String,
    /// Slots used inside projection paths accept only string values.
    pub in_projection: bool,
}

/// A value bound to a placeholder slot.
#[derive(Debug, Clone)]
pub enum Binding {
    /// `null`
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    I64(i64),
    /// A float.
    F64(f64),
    /// A string.
    Str(String),
    /// A JSON subtree.
    Json(Value),
    /// A precompiled regular expression.
    Regex(Regex),
}

/// One include/exclude projection pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// `-` patterns delete; `+` (or leading) patterns keep.
    pub exclude: bool,
    /// The `all` alias, standing for the whole document.
    pub all: bool,
    /// Path segments, root first. Empty for `all`.
    pub segs: Vec<ProjSeg>,
}

/// One segment of a projection path.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjSeg {
    /// One or more alternative field names (`/a`, `/{a,b}`).
    Fields(Vec<String>),
    /// `*`: any key at this level.
    Any,
    /// A placeholder, resolved to a field name at apply time.
    Placeholder(PhId),
}

/// One `asc`/`desc` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    /// The path whose value orders the emitted documents.
    pub path: Vec<String>,
    /// `desc` inverts the order.
    pub desc: bool,
}

/// The `apply` clause payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyClause {
    /// An array of JSON-Patch operations.
    Patch(Value),
    /// An object deep-merged into the document root.
    Merge(Value),
}

bitflags! {
    /// Query-wide mode bits collected while parsing clauses.
    pub struct QueryMode: u8 {
        /// `| count`: the query is an aggregate count.
        const COUNT        = 0b0000_0001;
        /// `| del`: matched documents are to be deleted by the caller.
        const APPLY_DEL    = 0b0000_0010;
        /// `| upsert {...}`: insert the payload when nothing matches.
        const APPLY_UPSERT = 0b0000_0100;
    }
}

/// The arena holding every node of one parsed query.
#[derive(Debug)]
pub struct Ast {
    /// Expression-node pool.
    pub exprs: Vec<ExprNode>,
    /// Filter pool.
    pub filters: Vec<Filter>,
    /// Path-step pool.
    pub steps: Vec<Step>,
    /// Predicate pool.
    pub preds: Vec<Pred>,
    /// Literal pool.
    pub literals: Vec<Literal>,
    /// Placeholder slots, in order of first occurrence.
    pub placeholders: Vec<Placeholder>,
    /// Name → slot index, insertion-ordered.
    pub ph_names: LinkedHashMap<String, PhId>,
    /// The top-level expression-node chain.
    pub root: Vec<ExprId>,
    /// The first anchor seen in any filter.
    pub first_anchor: Option<String>,
    /// Projection patterns, in declaration order.
    pub projection: Vec<Projection>,
    /// Order-by clauses, in declaration order.
    pub orderby: Vec<OrderBy>,
    /// The `apply` clause, if any.
    pub apply: Option<ApplyClause>,
    /// The `upsert` payload, if any.
    pub upsert: Option<Value>,
    /// The `skip` operand, if any.
    pub skip: Option<LitId>,
    /// The `limit` operand, if any.
    pub limit: Option<LitId>,
    /// Collected mode bits.
    pub mode: QueryMode,
}

impl Ast {
    /// An empty arena.
    pub fn new() -> Self {
        Ast {
            exprs: Vec::new(),
            filters: Vec::new(),
            steps: Vec::new(),
            preds: Vec::new(),
            literals: Vec::new(),
            placeholders: Vec::new(),
            ph_names: LinkedHashMap::new(),
            root: Vec::new(),
            first_anchor: None,
            projection: Vec::new(),
            orderby: Vec::new(),
            apply: None,
            upsert: None,
            skip: None,
            limit: None,
            mode: QueryMode::empty(),
        }
    }

    /// Number of positional placeholders registered so far.
    pub fn positional_count(&self) -> usize {
        self.placeholders
            .iter()
            .filter(|p| p.name.starts_with('?'))
            .count()
    }

    /// Interns a placeholder slot: occurrences sharing a name share a slot.
    /// A slot referenced from a projection keeps that restriction even if it
    /// also occurs elsewhere.
    pub fn intern_placeholder(&mut self, name: &str, in_projection: bool) -> PhId {
        if let Some(&id) = self.ph_names.get(name) {
            if in_projection {
                self.placeholders[id.0 as usize].in_projection = true;
            }
            return id;
        }
        let id = PhId(self.placeholders.len() as u32);
        self.placeholders.push(Placeholder { name: name.to_owned(), in_projection });
        self.ph_names.insert(name.to_owned(), id);
        id
    }

    /// Looks up a slot by name.
    pub fn placeholder_by_name(&self, name: &str) -> Option<PhId> {
        self.ph_names.get(name).copied()
    }

    /// Resolves an expression-node id.
    pub fn expr(&self, id: ExprId) -> &ExprNode {
        &self.exprs[id.0 as usize]
    }

    /// Resolves a filter id.
    pub fn filter(&self, id: FilterId) -> &Filter {
        &self.filters[id.0 as usize]
    }

    /// Resolves a step id.
    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.0 as usize]
    }

    /// Resolves a predicate id.
    pub fn pred(&self, id: PredId) -> &Pred {
        &self.preds[id.0 as usize]
    }

    /// Resolves a literal id.
    pub fn literal(&self, id: LitId) -> &Literal {
        &self.literals[id.0 as usize]
    }
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_interning_dedupes_names() {
        let mut ast = Ast::new();
        let a = ast.intern_placeholder("name", false);
        let b = ast.intern_placeholder("name", false);
        let c = ast.intern_placeholder("other", false);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ast.placeholders.len(), 2);
    }

    #[test]
    fn projection_occurrence_marks_the_slot() {
        let mut ast = Ast::new();
        let id = ast.intern_placeholder("p", false);
        assert!(!ast.placeholders[id.0 as usize].in_projection);
        let again = ast.intern_placeholder("p", true);
        assert_eq!(id, again);
        assert!(ast.placeholders[id.0 as usize].in_projection);
    }

    #[test]
    fn positional_names() {
        let mut ast = Ast::new();
        let n = ast.positional_count();
        assert_eq!(n, 0);
        ast.intern_placeholder("?0", false);
        ast.intern_placeholder("?1", false);
        ast.intern_placeholder("named", false);
        assert_eq!(ast.positional_count(), 2);
    }
}
