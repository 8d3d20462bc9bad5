//! The document matcher: a depth-first visit of a binary document driving
//! the query's filter cursors.
//!
//! Each filter keeps a `(start, end)` level window per path step; a step is
//! evaluated only at levels inside its window, windows are cleared when the
//! visitor pops back above them, and a filter's `matched` flag latches once
//! its terminal step has matched. The query-wide `dirty` bit lets the
//! visitor prune whole subtrees as soon as no filter can progress below the
//! current level, and the visit terminates the moment the root expression
//! is satisfied.

use std::cmp::Ordering;
use log::warn;
use serde_json::Value;
use crate::ast::{
    Ast, Binding, ExprId, ExprKind, FilterId, Join, JoinOp, LitId, Literal,
    Op, OpSpec, PredId, PredKey, Step,
};
use crate::bindoc::{ BinView, DocKind, Elem, KeyRef };
use crate::error::{ Error, ErrorKind, Result };
use crate::rx::Regex;
use crate::value::{ compare, QVal };

/// What the visitor tells the walker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitCmd {
    /// Keep going; descend into container values.
    Descend,
    /// Do not descend into this value.
    SkipNested,
    /// Stop the whole visit.
    Terminate,
}

/// The per-step activity window. `start == -1` means "not yet entered";
/// `end == i32::MAX` means "gather any deeper level"; a negative `end`
/// excludes the step at levels at or below `-end` (a satisfied `**`).
#[derive(Debug, Clone, Copy)]
pub struct StepWindow {
    /// First level the step is active at.
    pub start: i32,
    /// Last level the step is active at.
    pub end: i32,
}

impl StepWindow {
    fn clear() -> Self {
        StepWindow { start: -1, end: -1 }
    }
}

/// Per-filter cursor state for one document visit.
#[derive(Debug, Clone)]
pub struct FilterState {
    /// Latched once the terminal step has matched.
    pub matched: bool,
    /// Deepest level at which any step of this filter matched.
    pub last_lvl: i32,
    /// One window per path step.
    pub windows: Vec<StepWindow>,
}

/// A lazily compiled regular expression together with the anchor checks
/// derived from the source text.
#[derive(Debug, Clone)]
struct RxCache {
    rx: Regex,
    /// The source began with `^`: the match must start at offset 0.
    match_start: bool,
    /// The source ended with `$`: the engine must stop at this offset.
    match_end: Option<usize>,
}

/// All mutable matching state of one query. Cursors and latched flags are
/// cleared between documents; compiled regex handles persist for the
/// lifetime of the query.
#[derive(Debug)]
pub struct MatchState {
    /// Latched query-level result.
    pub matched: bool,
    /// Set when any filter completes; consumed by the subtree-pruning test.
    pub dirty: bool,
    /// Latched per expression node.
    exprs: Vec<bool>,
    /// Cursor state per filter.
    filters: Vec<FilterState>,
    /// Compound-predicate cache bits, per predicate.
    prematched: Vec<bool>,
    /// Compiled key-side regexes, per predicate.
    rx_key: Vec<Option<RxCache>>,
    /// Compiled value-side regexes, per predicate.
    rx_val: Vec<Option<RxCache>>,
}

impl MatchState {
    /// Fresh state sized for `ast`.
    pub fn new(ast: &Ast) -> Self {
        MatchState {
            matched: false,
            dirty: false,
            exprs: vec![false; ast.exprs.len()],
            filters: ast
                .filters
                .iter()
                .map(|f| FilterState {
                    matched: false,
                    last_lvl: -1,
                    windows: vec![StepWindow::clear(); f.steps.len()],
                })
                .collect(),
            prematched: vec![false; ast.preds.len()],
            rx_key: vec![None; ast.preds.len()],
            rx_val: vec![None; ast.preds.len()],
        }
    }

    /// Clears match flags and cursors. Compiled regexes are kept.
    pub fn reset(&mut self) {
        self.matched = false;
        self.dirty = false;
        for flag in &mut self.exprs {
            *flag = false;
        }
        for fstate in &mut self.filters {
            fstate.matched = false;
            fstate.last_lvl = -1;
            for window in &mut fstate.windows {
                *window = StepWindow::clear();
            }
        }
        for flag in &mut self.prematched {
            *flag = false;
        }
    }
}

/// Which regex cache slot an operator evaluation uses.
#[derive(Debug, Clone, Copy)]
enum RxSlot {
    Key,
    Val,
}

/// Read-only matching environment: the AST and the placeholder bindings.
#[derive(Debug)]
pub struct MatchEnv<'a> {
    /// The query's AST.
    pub ast: &'a Ast,
    /// Placeholder bindings, indexed by slot id.
    pub bindings: &'a [Option<Binding>],
}

/// A resolved right-hand operand.
enum LitVal<'a> {
    Val(QVal<'a>),
    Re(&'a Regex),
}

impl<'a> MatchEnv<'a> {
    /// Materializes a literal, resolving placeholders through the bindings.
    fn resolve(&self, lit: LitId) -> Result<LitVal<'a>> {
        match *self.ast.literal(lit) {
            Literal::Str(ref s) => Ok(LitVal::Val(QVal::Str(s))),
            Literal::I64(v) => Ok(LitVal::Val(QVal::I64(v))),
            Literal::F64(v) => Ok(LitVal::Val(QVal::F64(v))),
            Literal::Bool(b) => Ok(LitVal::Val(QVal::Bool(b))),
            Literal::Null => Ok(LitVal::Val(QVal::Null)),
            Literal::Json(ref v) => Ok(LitVal::Val(QVal::from_json(v))),
            Literal::Placeholder(ph) => {
                match self.bindings[ph.0 as usize] {
                    Some(Binding::Null) => Ok(LitVal::Val(QVal::Null)),
                    Some(Binding::Bool(b)) => Ok(LitVal::Val(QVal::Bool(b))),
                    Some(Binding::I64(v)) => Ok(LitVal::Val(QVal::I64(v))),
                    Some(Binding::F64(v)) => Ok(LitVal::Val(QVal::F64(v))),
                    Some(Binding::Str(ref s)) => Ok(LitVal::Val(QVal::Str(s))),
                    Some(Binding::Json(ref v)) => Ok(LitVal::Val(QVal::from_json(v))),
                    Some(Binding::Regex(ref rx)) => Ok(LitVal::Re(rx)),
                    None => Err(Error::new(
                        ErrorKind::UnsetPlaceholder,
                        format!("placeholder `:{}` has no bound value",
                                self.ast.placeholders[ph.0 as usize].name),
                    )),
                }
            }
        }
    }
}

/// Evaluates `left op rhs`, negation included.
fn match_op(
    env: &MatchEnv<'_>,
    state: &mut MatchState,
    slot: RxSlot,
    pid: PredId,
    left: &QVal<'_>,
    op: OpSpec,
    rhs: LitId,
) -> Result<bool> {
    let mut matched = match op.op {
        Op::Eq | Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let right = match env.resolve(rhs)? {
                LitVal::Val(v) => v,
                LitVal::Re(_) => return Ok(op.negate),
            };
            match compare(left, &right)? {
                None => false,
                Some(ord) => match op.op {
                    Op::Eq => ord == Ordering::Equal,
                    Op::Gt => ord == Ordering::Greater,
                    Op::Gte => ord != Ordering::Less,
                    Op::Lt => ord == Ordering::Less,
                    Op::Lte => ord != Ordering::Greater,
                    _ => unreachable!(),
                },
            }
        }
        Op::Re => match_regexp(env, state, slot, pid, left, rhs)?,
        Op::In => match_in(env, left, rhs)?,
        Op::Ni => match_ni(env, left, rhs)?,
        Op::Prefix => match_prefix(env, left, rhs)?,
    };
    if op.negate {
        matched = !matched;
    }
    Ok(matched)
}

/// `re`: the left value, rendered as text, must have a matching prefix.
/// The pattern comes from a precompiled placeholder or is compiled lazily
/// from the right-hand value, stripping `^`/`$` into post-checked anchors.
fn match_regexp(
    env: &MatchEnv<'_>,
    state: &mut MatchState,
    slot: RxSlot,
    pid: PredId,
    left: &QVal<'_>,
    rhs: LitId,
) -> Result<bool> {
    let input = match left.render_text() {
        Some(text) => text,
        None => return Ok(false),
    };

    if let Literal::Placeholder(ph) = *env.ast.literal(rhs) {
        if let Some(Binding::Regex(ref rx)) = env.bindings[ph.0 as usize] {
            return Ok(rx.run(input.as_bytes())?.is_some());
        }
    }

    let cache = match slot {
        RxSlot::Key => &mut state.rx_key[pid.0 as usize],
        RxSlot::Val => &mut state.rx_val[pid.0 as usize],
    };
    if cache.is_none() {
        let right = match env.resolve(rhs)? {
            LitVal::Val(v) => v,
            LitVal::Re(_) => return Ok(false),
        };
        let text = match right.render_text() {
            Some(text) => text,
            None => return Ok(false),
        };
        let mut pattern: &str = &text;
        let mut match_start = false;
        let mut match_end = None;
        if pattern.starts_with('^') {
            pattern = &pattern[1..];
            match_start = true;
        }
        if pattern.ends_with('$') {
            pattern = &pattern[..pattern.len() - 1];
            match_end = Some(pattern.len());
        }
        *cache = Some(RxCache { rx: Regex::new(pattern)?, match_start, match_end });
    }
    let cache = cache.as_ref().expect("regex cache was just populated");

    Ok(match cache.rx.run(input.as_bytes())? {
        Some(outcome) => {
            if cache.match_start && outcome.stop - outcome.matched_len != 0 {
                false
            } else if let Some(end) = cache.match_end {
                outcome.stop == end
            } else {
                true
            }
        }
        None => false,
    })
}

/// `in`: the left value equals some element of the right-hand array.
fn match_in(env: &MatchEnv<'_>, left: &QVal<'_>, rhs: LitId) -> Result<bool> {
    let items = match env.resolve(rhs)? {
        LitVal::Val(QVal::Node(&Value::Array(ref items))) => items,
        _ => return Ok(false),
    };
    for item in items {
        match compare(left, &QVal::from_json(item))? {
            Some(Ordering::Equal) => return Ok(true),
            Some(_) => {}
            // An incomparable element poisons the whole membership test.
            None => return Ok(false),
        }
    }
    Ok(false)
}

/// `ni`: the left value is a list containing the right-hand scalar.
fn match_ni(env: &MatchEnv<'_>, left: &QVal<'_>, rhs: LitId) -> Result<bool> {
    let view = match *left {
        QVal::Bin(view) if view.kind() == DocKind::List => view,
        _ => return Ok(false),
    };
    let scalar = match env.resolve(rhs)? {
        LitVal::Val(v) => v,
        LitVal::Re(_) => return Ok(false),
    };
    if let QVal::Node(_) | QVal::Bin(_) = scalar {
        return Ok(false);
    }
    for entry in view.iter() {
        let (_, elem) = entry?;
        match compare(&QVal::from_elem(&elem), &scalar)? {
            Some(Ordering::Equal) => return Ok(true),
            Some(_) => {}
            None => return Ok(false),
        }
    }
    Ok(false)
}

/// `~`: the rendered left value starts with the rendered right value.
fn match_prefix(env: &MatchEnv<'_>, left: &QVal<'_>, rhs: LitId) -> Result<bool> {
    let input = match left.render_text() {
        Some(text) => text,
        None => return Ok(false),
    };
    let right = match env.resolve(rhs)? {
        LitVal::Val(v) => v,
        LitVal::Re(_) => return Ok(false),
    };
    let prefix = match right.render_text() {
        Some(text) => text,
        None => return Ok(false),
    };
    Ok(!prefix.is_empty() && input.starts_with(prefix.as_ref()))
}

/// Evaluates one predicate of a `[...]` chain against `(key, value)`.
fn match_pred(
    env: &MatchEnv<'_>,
    state: &mut MatchState,
    value: &Elem<'_>,
    key: &str,
    pid: PredId,
) -> Result<bool> {
    if state.prematched[pid.0 as usize] {
        return Ok(true);
    }
    let pred = env.ast.pred(pid);
    let negate = pred.join.map_or(false, |j| j.negate);

    match pred.key {
        PredKey::Any => {
            // The operator applies to the key itself; the value is untouched.
            let lv = QVal::Str(key);
            let ret = match_op(env, state, RxSlot::Val, pid, &lv, pred.op, pred.rhs)?;
            return Ok(negate != ret);
        }
        PredKey::Field(ref field) => {
            if key != field {
                return Ok(negate);
            }
        }
        PredKey::AnyDeep => {}
        PredKey::Expr { op, rhs } => {
            let lv = QVal::Str(key);
            if !match_op(env, state, RxSlot::Key, pid, &lv, op, rhs)? {
                return Ok(negate);
            }
        }
    }

    let lv = QVal::from_elem(value);
    let ret = match_op(env, state, RxSlot::Val, pid, &lv, pred.op, pred.rhs)?;
    Ok(negate != ret)
}

/// Evaluates a predicate chain, AND-joined by default, with OR
/// short-circuiting. Compound chains cache individual hits in `prematched`
/// so conjuncts satisfied at an earlier key stay satisfied.
fn match_pred_chain(
    env: &MatchEnv<'_>,
    state: &mut MatchState,
    value: &Elem<'_>,
    key: &str,
    preds: &[PredId],
) -> Result<bool> {
    let compound = preds.len() > 1;
    let mut prev = false;
    for &pid in preds {
        let matched = match_pred(env, state, value, key, pid)?;
        if matched && compound {
            state.prematched[pid.0 as usize] = true;
        }
        match env.ast.pred(pid).join {
            None => prev = matched,
            Some(Join { op: JoinOp::And, .. }) => prev = prev && matched,
            Some(Join { op: JoinOp::Or, .. }) => {
                if prev || matched {
                    prev = true;
                    break;
                }
            }
        }
    }
    Ok(prev)
}

/// Evaluates the step at `index` against the visited node; returns the index
/// the filter should account the result to (a satisfied `**` hands the match
/// over to its successor) and whether it matched.
fn match_step(
    env: &MatchEnv<'_>,
    state: &mut MatchState,
    lvl: i32,
    value: &Elem<'_>,
    key: &str,
    fid: FilterId,
    index: usize,
) -> Result<(usize, bool)> {
    let step_id = env.ast.filter(fid).steps[index];
    match *env.ast.step(step_id) {
        Step::Field(ref field) => {
            state.filters[fid.0 as usize].windows[index] = StepWindow { start: lvl, end: lvl };
            Ok((index, key == field))
        }
        Step::Any => {
            state.filters[fid.0 as usize].windows[index] = StepWindow { start: lvl, end: lvl };
            Ok((index, true))
        }
        Step::Preds(ref preds) => {
            state.filters[fid.0 as usize].windows[index] = StepWindow { start: lvl, end: lvl };
            let res = match_pred_chain(env, state, value, key, preds)?;
            Ok((index, res))
        }
        Step::AnyDeep => {
            if state.filters[fid.0 as usize].windows[index].start < 0 {
                state.filters[fid.0 as usize].windows[index].start = lvl;
            }
            let last = env.ast.filter(fid).steps.len() - 1;
            if index < last {
                let (next_index, res) = match_step(env, state, lvl, value, key, fid, index + 1)?;
                if res {
                    // The successor took over; exclude this level from the
                    // wildcard so sibling subtrees restart cleanly.
                    state.filters[fid.0 as usize].windows[index].end = -lvl;
                    return Ok((next_index, true));
                }
            }
            state.filters[fid.0 as usize].windows[index].end = i32::max_value();
            Ok((index, true))
        }
    }
}

/// Evaluates one filter against the visited node, maintaining its cursor.
fn match_filter(
    env: &MatchEnv<'_>,
    state: &mut MatchState,
    lvl: i32,
    value: &Elem<'_>,
    key: &str,
    fid: FilterId,
) -> Result<bool> {
    if state.filters[fid.0 as usize].matched {
        return Ok(true);
    }
    if state.filters[fid.0 as usize].last_lvl + 1 < lvl {
        return Ok(false);
    }
    if state.filters[fid.0 as usize].last_lvl >= lvl {
        // The visitor popped back: windows opened at or below this level
        // are stale now.
        let fstate = &mut state.filters[fid.0 as usize];
        fstate.last_lvl = lvl - 1;
        for window in &mut fstate.windows {
            if window.start >= lvl || -window.end >= lvl {
                *window = StepWindow::clear();
            }
        }
    }
    let step_count = env.ast.filter(fid).steps.len();
    let last = step_count - 1;
    for index in 0..step_count {
        let window = state.filters[fid.0 as usize].windows[index];
        if window.start < 0 || (lvl >= window.start && lvl <= window.end) {
            let (result_index, matched) = match_step(env, state, lvl, value, key, fid, index)?;
            if matched {
                let fstate = &mut state.filters[fid.0 as usize];
                if result_index == last {
                    fstate.matched = true;
                    state.dirty = true;
                }
                state.filters[fid.0 as usize].last_lvl = lvl;
            }
            break;
        }
    }
    Ok(state.filters[fid.0 as usize].matched)
}

/// Evaluates an expression-node chain with AND/OR joins and negation.
fn match_expr_chain(
    env: &MatchEnv<'_>,
    state: &mut MatchState,
    lvl: i32,
    value: &Elem<'_>,
    key: &str,
    chain: &[ExprId],
) -> Result<bool> {
    let mut prev = false;
    for &eid in chain {
        let kind = &env.ast.expr(eid).kind;
        let mut matched = match *kind {
            ExprKind::Group(ref sub) => {
                if state.exprs[eid.0 as usize] {
                    true
                } else {
                    let m = match_expr_chain(env, state, lvl, value, key, sub)?;
                    if m {
                        state.exprs[eid.0 as usize] = true;
                    }
                    m
                }
            }
            ExprKind::Filter(fid) => match_filter(env, state, lvl, value, key, fid)?,
            // Selection by primary key happens in the storage layer.
            ExprKind::Pk(_) => true,
        };
        match env.ast.expr(eid).join {
            None => prev = matched,
            Some(join) => {
                if join.negate {
                    matched = !matched;
                }
                match join.op {
                    JoinOp::And => prev = prev && matched,
                    JoinOp::Or => {
                        if prev || matched {
                            prev = true;
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(prev)
}

/// "Any deeper match still needed below `lvl`?" — consulted after a filter
/// completes, to prune subtrees no remaining filter can progress in.
fn need_deeper_match(env: &MatchEnv<'_>, state: &MatchState, chain: &[ExprId], lvl: i32) -> bool {
    for &eid in chain {
        match env.ast.expr(eid).kind {
            ExprKind::Group(ref sub) => {
                if need_deeper_match(env, state, sub, lvl) {
                    return true;
                }
            }
            ExprKind::Filter(fid) => {
                let fstate = &state.filters[fid.0 as usize];
                if !fstate.matched && fstate.last_lvl == lvl {
                    return true;
                }
            }
            ExprKind::Pk(_) => {}
        }
    }
    false
}

/// Walks `view` depth-first in insertion order, calling `visitor` with
/// `(level, value, key)` for every child. List indices and map ids are
/// rendered as decimal keys.
pub fn visit<F>(view: BinView<'_>, visitor: &mut F) -> Result<()>
    where F: FnMut(i32, &Elem<'_>, &str) -> Result<VisitCmd>
{
    visit_level(view, 0, visitor).map(|_| ())
}

fn visit_level<F>(view: BinView<'_>, lvl: i32, visitor: &mut F) -> Result<bool>
    where F: FnMut(i32, &Elem<'_>, &str) -> Result<VisitCmd>
{
    for entry in view.iter() {
        let (key_ref, elem) = entry?;
        let rendered;
        let key = match key_ref {
            KeyRef::Key(k) => k,
            KeyRef::Id(id) => {
                rendered = id.to_string();
                &rendered
            }
            KeyRef::Index(n) => {
                rendered = n.to_string();
                &rendered
            }
        };
        match visitor(lvl, &elem, key)? {
            VisitCmd::Terminate => return Ok(true),
            VisitCmd::SkipNested => {}
            VisitCmd::Descend => {
                if let Some(child) = elem.container() {
                    if visit_level(child, lvl + 1, visitor)? {
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(false)
}

/// Matches one document. Resets cursors and match flags first; a malformed
/// document is reported as a non-match after a single warning.
pub fn match_document(env: &MatchEnv<'_>, state: &mut MatchState, view: BinView<'_>) -> Result<bool> {
    state.reset();

    // A sole `/*` or `/**` filter matches any document, the empty one
    // included; skip the walk entirely.
    if env.ast.root.len() == 1 {
        if let ExprKind::Filter(fid) = env.ast.expr(env.ast.root[0]).kind {
            let filter = env.ast.filter(fid);
            if filter.steps.len() == 1 {
                if let Step::Any | Step::AnyDeep = *env.ast.step(filter.steps[0]) {
                    state.matched = true;
                    return Ok(true);
                }
            }
        }
    }

    let root = env.ast.root.clone();
    let outcome = visit(view, &mut |lvl, value, key| {
        let matched = match_expr_chain(env, state, lvl, value, key, &root)?;
        if matched {
            state.matched = true;
            return Ok(VisitCmd::Terminate);
        }
        if state.dirty {
            state.dirty = false;
            if !need_deeper_match(env, state, &root, lvl) {
                return Ok(VisitCmd::SkipNested);
            }
        }
        Ok(VisitCmd::Descend)
    });

    match outcome {
        Ok(()) => Ok(state.matched),
        Err(ref e) if e.kind() == ErrorKind::Malformed => {
            warn!("skipping corrupt document region: {}", e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
