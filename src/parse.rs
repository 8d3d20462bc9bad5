//! The query text parser.
//!
//! A hand-written recursive descent over the query grammar, emitting nodes
//! into the [`Ast`](../ast/struct.Ast.html) arena. The cursor tracks
//! `(line, column)` so every failure carries a located, human-readable
//! detail; all parser failures share the `QueryParse` error kind.
//!
//! ```text
//! query       := filters ('|' clause)*
//! filters     := filter (('and'|'or') 'not'? filter)*
//! filter      := '(' filters ')'
//!              | ('@' coll)? '/' (step ('/' step)* | '=' literal)
//! step        := field | '*' | '**' | '[' preds ']'
//! preds       := pred (('and'|'or') 'not'? pred)*
//! pred        := key op value
//! key         := field | '*' | '**' | '[' '*' op literal ']'
//! op          := ('!'|'not')? ('='|'eq'|'>'|'gt'|'>='|'gte'|'<'|'lt'
//!              | '<='|'lte'|'in'|'ni'|'re'|'~')
//! clause      := 'apply' json | 'upsert' json | 'del' | 'count'
//!              | 'skip' n | 'limit' n
//!              | ('asc'|'desc') path (',' path)*
//!              | projection
//! projection  := ('+'|'-')? proj_item (('+'|'-') proj_item)*
//! proj_item   := 'all' | ('/' proj_seg)+
//! proj_seg    := field | '*' | '{' field (',' field)* '}' | placeholder
//! ```

use serde_json::Value;
use crate::ast::{
    ApplyClause, Ast, ExprKind, ExprNode, Filter, Join, JoinOp, LitId,
    Literal, Op, OpSpec, OrderBy, Pred, PredKey, ProjSeg, Projection,
    QueryMode, Step,
};
use crate::error::{ Error, ErrorKind, ParseLine, ParsePos, Result };

/// The order-by clause cap.
pub const ORDERBY_MAX: usize = 64;

/// Parses a query text into an AST arena.
pub fn parse(text: &str) -> Result<Ast> {
    let mut parser = Parser {
        src: text,
        bytes: text.as_bytes(),
        pos: 0,
        line: 1,
        col: 1,
        ast: Ast::new(),
    };
    parser.query()?;
    Ok(parser.ast)
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    ast: Ast,
}

impl<'a> Parser<'a> {
    // ---- cursor helpers -------------------------------------------------

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// The source line the cursor currently points into.
    fn current_line(&self) -> String {
        let start = self.src[..self.pos].rfind('\n').map_or(0, |n| n + 1);
        let end = self.src[self.pos..]
            .find('\n')
            .map_or(self.src.len(), |n| self.pos + n);
        self.src[start..end].to_owned()
    }

    fn err<S: Into<String>>(&self, message: S) -> Error {
        Error::new(
            ErrorKind::QueryParse,
            format!("{} at line {} column {}", message.into(), self.line, self.col),
        )
        .with_context::<ParsePos>((self.line, self.col))
        .with_context::<ParseLine>(self.current_line())
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        if self.eat(b) {
            Ok(())
        } else {
            Err(self.err(format!("expected `{}`", b as char)))
        }
    }

    fn is_word_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_'
    }

    /// Consumes `word` only when followed by a non-word byte.
    fn try_word(&mut self, word: &str) -> bool {
        let bytes = word.as_bytes();
        if self.bytes[self.pos..].starts_with(bytes) {
            match self.bytes.get(self.pos + bytes.len()) {
                Some(&b) if Self::is_word_byte(b) => false,
                _ => {
                    for _ in 0..bytes.len() {
                        self.bump();
                    }
                    true
                }
            }
        } else {
            false
        }
    }

    /// A bare word: letters, digits and underscores.
    fn word(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if Self::is_word_byte(b) {
                self.bump();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err("expected an identifier"));
        }
        Ok(self.src[start..self.pos].to_owned())
    }

    /// A double-quoted string with the usual escapes.
    fn quoted(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(b'b') => out.push('\u{8}'),
                    Some(b'f') => out.push('\u{c}'),
                    Some(b'u') => {
                        let mut code = 0_u32;
                        for _ in 0..4 {
                            let digit = self
                                .bump()
                                .and_then(|b| (b as char).to_digit(16))
                                .ok_or_else(|| self.err("bad \\u escape"))?;
                            code = code * 16 + digit;
                        }
                        out.push(
                            std::char::from_u32(code)
                                .ok_or_else(|| self.err("bad \\u escape"))?,
                        );
                    }
                    _ => return Err(self.err("bad escape sequence")),
                },
                Some(b) => {
                    // Re-assemble multi-byte UTF-8 sequences.
                    let len = utf8_len(b);
                    let start = self.pos - 1;
                    for _ in 1..len {
                        self.bump();
                    }
                    out.push_str(&self.src[start..start + len]);
                }
            }
        }
    }

    /// A field name: bare word or quoted string.
    fn field(&mut self) -> Result<String> {
        if self.peek() == Some(b'"') {
            self.quoted()
        } else {
            self.word()
        }
    }

    // ---- literals -------------------------------------------------------

    /// Registers a placeholder occurrence after the `:` sigil.
    fn placeholder(&mut self, in_projection: bool) -> Result<LitId> {
        let name = if self.eat(b'?') {
            format!("?{}", self.ast.positional_count())
        } else {
            self.word()?
        };
        let ph = self.ast.intern_placeholder(&name, in_projection);
        Ok(self.ast.push_literal(Literal::Placeholder(ph)))
    }

    /// Scans one balanced JSON value (`[...]` or `{...}`) and parses it.
    fn json_value(&mut self) -> Result<Value> {
        let start = self.pos;
        let open = match self.peek() {
            Some(b @ b'[') | Some(b @ b'{') => b,
            _ => return Err(self.err("expected a JSON value")),
        };
        let close = if open == b'[' { b']' } else { b'}' };
        let mut depth = 0_i32;
        let mut in_string = false;
        while let Some(b) = self.peek() {
            if in_string {
                self.bump();
                if b == b'\\' {
                    self.bump();
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => {
                    in_string = true;
                    self.bump();
                }
                _ if b == open => {
                    depth += 1;
                    self.bump();
                }
                _ if b == close => {
                    depth -= 1;
                    self.bump();
                    if depth == 0 {
                        let raw = &self.src[start..self.pos];
                        return serde_json::from_str(raw)
                            .map_err(|e| self.err(format!("invalid JSON: {}", e)));
                    }
                }
                _ => {
                    self.bump();
                }
            }
        }
        Err(self.err("unterminated JSON value"))
    }

    /// A right-hand operand: number, quoted string, JSON subtree,
    /// placeholder, `true`/`false`/`null`, or a bare token.
    fn literal_value(&mut self) -> Result<LitId> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.err("expected a value")),
            Some(b'"') => {
                let s = self.quoted()?;
                Ok(self.ast.push_literal(Literal::Str(s)))
            }
            Some(b':') => {
                self.bump();
                self.placeholder(false)
            }
            Some(b'[') | Some(b'{') => {
                let json = self.json_value()?;
                Ok(self.ast.push_literal(Literal::Json(json)))
            }
            Some(_) => {
                // A bare token runs to whitespace, `]` or end of input.
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' || b == b']' {
                        break;
                    }
                    self.bump();
                }
                if self.pos == start {
                    return Err(self.err("expected a value"));
                }
                let token = &self.src[start..self.pos];
                Ok(self.ast.push_literal(classify_token(token)))
            }
        }
    }

    // ---- operators ------------------------------------------------------

    fn op(&mut self) -> Result<OpSpec> {
        self.skip_ws();
        let mut negate = false;
        if self.eat(b'!') {
            negate = true;
        } else if self.try_word("not") {
            negate = true;
            self.skip_ws();
        }
        let op = if self.eat(b'=') {
            self.eat(b'='); // tolerate `==`
            Op::Eq
        } else if self.eat(b'>') {
            if self.eat(b'=') { Op::Gte } else { Op::Gt }
        } else if self.eat(b'<') {
            if self.eat(b'=') { Op::Lte } else { Op::Lt }
        } else if self.eat(b'~') {
            Op::Prefix
        } else if self.try_word("eq") {
            Op::Eq
        } else if self.try_word("gte") {
            Op::Gte
        } else if self.try_word("gt") {
            Op::Gt
        } else if self.try_word("lte") {
            Op::Lte
        } else if self.try_word("lt") {
            Op::Lt
        } else if self.try_word("in") {
            Op::In
        } else if self.try_word("ni") {
            Op::Ni
        } else if self.try_word("re") {
            Op::Re
        } else {
            return Err(self.err("expected a comparison operator"));
        };
        Ok(OpSpec { op, negate })
    }

    // ---- predicates and steps ------------------------------------------

    fn pred(&mut self, join: Option<Join>) -> Result<crate::ast::PredId> {
        self.skip_ws();
        let key = match self.peek() {
            Some(b'[') => {
                self.bump();
                self.skip_ws();
                self.expect(b'*')?;
                let op = self.op()?;
                let rhs = self.literal_value()?;
                self.skip_ws();
                self.expect(b']')?;
                PredKey::Expr { op, rhs }
            }
            Some(b'*') => {
                self.bump();
                if self.eat(b'*') { PredKey::AnyDeep } else { PredKey::Any }
            }
            _ => PredKey::Field(self.field()?),
        };
        let op = self.op()?;
        let rhs = self.literal_value()?;
        Ok(self.ast.push_pred(Pred { join, key, op, rhs }))
    }

    fn pred_chain(&mut self) -> Result<Vec<crate::ast::PredId>> {
        let mut preds = vec![self.pred(None)?];
        loop {
            self.skip_ws();
            let join_op = if self.try_word("and") {
                JoinOp::And
            } else if self.try_word("or") {
                JoinOp::Or
            } else {
                break;
            };
            self.skip_ws();
            let negate = self.try_word("not");
            preds.push(self.pred(Some(Join { op: join_op, negate }))?);
        }
        Ok(preds)
    }

    fn step(&mut self) -> Result<crate::ast::StepId> {
        let step = match self.peek() {
            Some(b'*') => {
                self.bump();
                if self.eat(b'*') { Step::AnyDeep } else { Step::Any }
            }
            Some(b'[') => {
                self.bump();
                let preds = self.pred_chain()?;
                self.skip_ws();
                self.expect(b']')?;
                Step::Preds(preds)
            }
            _ => Step::Field(self.field()?),
        };
        Ok(self.ast.push_step(step))
    }

    // ---- filters and the expression chain -------------------------------

    fn expr_item(&mut self, join: Option<Join>) -> Result<crate::ast::ExprId> {
        self.skip_ws();
        if self.eat(b'(') {
            let sub = self.expr_chain()?;
            self.skip_ws();
            self.expect(b')')?;
            return Ok(self.ast.push_expr(ExprNode { join, kind: ExprKind::Group(sub) }));
        }

        let anchor = if self.eat(b'@') {
            let name = self.word()?;
            if self.ast.first_anchor.is_none() {
                self.ast.first_anchor = Some(name.clone());
            }
            Some(name)
        } else {
            None
        };

        self.expect(b'/')?;
        if self.eat(b'=') {
            // Primary-key filter.
            let lit = self.literal_value()?;
            return Ok(self.ast.push_expr(ExprNode { join, kind: ExprKind::Pk(lit) }));
        }

        let mut steps = vec![self.step()?];
        while self.peek() == Some(b'/') {
            self.bump();
            steps.push(self.step()?);
        }
        let fid = self.ast.push_filter(Filter { anchor, steps });
        Ok(self.ast.push_expr(ExprNode { join, kind: ExprKind::Filter(fid) }))
    }

    fn expr_chain(&mut self) -> Result<Vec<crate::ast::ExprId>> {
        let mut chain = vec![self.expr_item(None)?];
        loop {
            self.skip_ws();
            let join_op = if self.try_word("and") {
                JoinOp::And
            } else if self.try_word("or") {
                JoinOp::Or
            } else {
                break;
            };
            self.skip_ws();
            let negate = self.try_word("not");
            chain.push(self.expr_item(Some(Join { op: join_op, negate }))?);
        }
        Ok(chain)
    }

    // ---- clauses --------------------------------------------------------

    fn skip_or_limit(&mut self) -> Result<LitId> {
        self.skip_ws();
        let lit = self.literal_value()?;
        match *self.ast.literal(lit) {
            Literal::I64(_) | Literal::Placeholder(_) => Ok(lit),
            _ => Err(self.err("expected a non-negative integer or placeholder")),
        }
    }

    fn orderby(&mut self, desc: bool) -> Result<()> {
        loop {
            self.skip_ws();
            if self.ast.orderby.len() >= ORDERBY_MAX {
                return Err(Error::new(
                    ErrorKind::OrderbyMaxLimit,
                    format!("reached max number of asc/desc order clauses: {}", ORDERBY_MAX),
                ));
            }
            self.expect(b'/')?;
            let mut path = vec![self.field()?];
            while self.peek() == Some(b'/') {
                self.bump();
                path.push(self.field()?);
            }
            self.ast.orderby.push(OrderBy { path, desc });
            self.skip_ws();
            if !self.eat(b',') {
                break;
            }
        }
        Ok(())
    }

    fn projection(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            let mut exclude = false;
            if self.eat(b'-') {
                exclude = true;
            } else {
                self.eat(b'+');
            }
            self.skip_ws();

            if self.try_word("all") {
                self.ast.projection.push(Projection { exclude, all: true, segs: Vec::new() });
            } else if self.peek() == Some(b'/') {
                let mut segs = Vec::new();
                while self.eat(b'/') {
                    let seg = match self.peek() {
                        Some(b'*') => {
                            self.bump();
                            ProjSeg::Any
                        }
                        Some(b':') => {
                            self.bump();
                            let lit = self.placeholder(true)?;
                            match *self.ast.literal(lit) {
                                Literal::Placeholder(ph) => ProjSeg::Placeholder(ph),
                                _ => unreachable!(),
                            }
                        }
                        Some(b'{') => {
                            self.bump();
                            let mut fields = Vec::new();
                            loop {
                                self.skip_ws();
                                fields.push(self.field()?);
                                self.skip_ws();
                                if !self.eat(b',') {
                                    break;
                                }
                            }
                            self.expect(b'}')?;
                            ProjSeg::Fields(fields)
                        }
                        _ => ProjSeg::Fields(vec![self.field()?]),
                    };
                    segs.push(seg);
                }
                self.ast.projection.push(Projection { exclude, all: false, segs });
            } else {
                return Err(self.err("expected a projection"));
            }

            self.skip_ws();
            match self.peek() {
                Some(b'+') | Some(b'-') => continue,
                _ => break,
            }
        }
        Ok(())
    }

    fn clause(&mut self) -> Result<()> {
        self.skip_ws();
        if self.try_word("apply") {
            self.skip_ws();
            let json = self.json_value()?;
            self.ast.apply = Some(match json {
                Value::Array(_) => ApplyClause::Patch(json),
                Value::Object(_) => ApplyClause::Merge(json),
                _ => return Err(self.err("apply expects a JSON object or array")),
            });
        } else if self.try_word("upsert") {
            self.skip_ws();
            let json = self.json_value()?;
            if !json.is_object() {
                return Err(self.err("upsert expects a JSON object"));
            }
            self.ast.upsert = Some(json);
            self.ast.mode |= QueryMode::APPLY_UPSERT;
        } else if self.try_word("del") {
            self.ast.mode |= QueryMode::APPLY_DEL;
        } else if self.try_word("count") {
            self.ast.mode |= QueryMode::COUNT;
        } else if self.try_word("skip") {
            if self.ast.skip.is_some() {
                return Err(Error::new(ErrorKind::SkipAlreadySet,
                                      "skip clause already specified"));
            }
            self.ast.skip = Some(self.skip_or_limit()?);
        } else if self.try_word("limit") {
            if self.ast.limit.is_some() {
                return Err(Error::new(ErrorKind::LimitAlreadySet,
                                      "limit clause already specified"));
            }
            self.ast.limit = Some(self.skip_or_limit()?);
        } else if self.try_word("asc") {
            self.orderby(false)?;
        } else if self.try_word("desc") {
            self.orderby(true)?;
        } else {
            self.projection()?;
        }
        Ok(())
    }

    // ---- entry ----------------------------------------------------------

    fn query(&mut self) -> Result<()> {
        self.skip_ws();
        self.ast.root = self.expr_chain()?;
        loop {
            self.skip_ws();
            if self.eat(b'|') {
                self.clause()?;
            } else {
                break;
            }
        }
        self.skip_ws();
        if !self.at_end() {
            return Err(self.err("unexpected trailing input"));
        }
        Ok(())
    }
}

/// Width of the UTF-8 sequence starting with `b`.
fn utf8_len(b: u8) -> usize {
    if b < 0x80 {
        1
    } else if b & 0xE0 == 0xC0 {
        2
    } else if b & 0xF0 == 0xE0 {
        3
    } else {
        4
    }
}

/// Classifies a bare token: keyword, integer, float, else a string.
fn classify_token(token: &str) -> Literal {
    match token {
        "true" => return Literal::Bool(true),
        "false" => return Literal::Bool(false),
        "null" => return Literal::Null,
        _ => {}
    }
    if let Ok(v) = token.parse::<i64>() {
        return Literal::I64(v);
    }
    let numeric = token.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+');
    if numeric {
        if let Ok(v) = token.parse::<f64>() {
            return Literal::F64(v);
        }
    }
    Literal::Str(token.to_owned())
}
