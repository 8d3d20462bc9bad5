//! The canonical value sum type and the cross-type comparison contract.
//!
//! The matcher never compares raw bytes: both operands are first coerced
//! into [`QVal`](enum.QVal.html), and [`compare`](fn.compare.html) defines
//! one ordering over every pair of kinds. Incomparable pairings (say, an
//! object against an integer) yield `None` — the caller treats that as
//! "predicate false", never as an error.

use std::borrow::Cow;
use std::cmp::Ordering;
use serde_json::Value;
use crate::bindoc::{ BinView, DocKind, Elem };
use crate::error::Result;

/// A normalized value: either a scalar, a JSON subtree from the query side,
/// or a binary sub-container from the document side.
#[derive(Debug, Clone, Copy)]
pub enum QVal<'a> {
    /// `null` (also the coercion of unreadable scalar kinds, e.g. blobs).
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    I64(i64),
    /// A float.
    F64(f64),
    /// A borrowed string.
    Str(&'a str),
    /// A JSON container from an AST literal or a decoded tree.
    Node(&'a Value),
    /// A binary container from the document under scrutiny.
    Bin(BinView<'a>),
}

impl<'a> QVal<'a> {
    /// Coerces a document element.
    pub fn from_elem(elem: &Elem<'a>) -> Self {
        match *elem {
            Elem::Null | Elem::Blob(_) => QVal::Null,
            Elem::Bool(b) => QVal::Bool(b),
            Elem::I64(v) => QVal::I64(v),
            Elem::F64(v) => QVal::F64(v),
            Elem::Str(s) => QVal::Str(s),
            Elem::List(v) | Elem::Map(v) | Elem::Object(v) => QVal::Bin(v),
        }
    }

    /// Coerces a JSON node; scalars are unwrapped, containers stay nodes.
    pub fn from_json(node: &'a Value) -> Self {
        match *node {
            Value::Null => QVal::Null,
            Value::Bool(b) => QVal::Bool(b),
            Value::Number(ref n) => {
                if let Some(v) = n.as_i64() {
                    QVal::I64(v)
                } else {
                    QVal::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(ref s) => QVal::Str(s),
            Value::Array(_) | Value::Object(_) => QVal::Node(node),
        }
    }

    /// Renders the value as regular-expression / prefix-match input.
    /// Containers have no textual rendering and return `None`.
    pub fn render_text(&self) -> Option<Cow<'a, str>> {
        match *self {
            QVal::Str(s) => Some(Cow::Borrowed(s)),
            QVal::I64(v) => Some(Cow::Owned(v.to_string())),
            QVal::F64(v) => Some(Cow::Owned(render_f64(v))),
            QVal::Bool(b) => Some(Cow::Borrowed(if b { "true" } else { "false" })),
            QVal::Null | QVal::Node(_) | QVal::Bin(_) => None,
        }
    }
}

/// The canonical float formatter: fixed notation with up to six fractional
/// digits, trailing zeros trimmed.
pub fn render_f64(v: f64) -> String {
    let mut s = format!("{:.6}", v);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

/// Integer prefix parsing: optional sign and leading digits, anything else
/// (or nothing parseable) is 0.
fn parse_i64_prefix(s: &str) -> i64 {
    let bytes = s.as_bytes();
    let mut idx = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        idx = 1;
    }
    let mut end = idx;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == idx {
        return 0;
    }
    s[..end].parse().unwrap_or(0)
}

/// Float prefix parsing with the same "else 0" fallback.
fn parse_f64_prefix(s: &str) -> f64 {
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+') | Some(b'-')) {
            exp += 1;
        }
        let digits = exp;
        let mut cursor = exp;
        while cursor < bytes.len() && bytes[cursor].is_ascii_digit() {
            cursor += 1;
        }
        if cursor > digits {
            end = cursor;
        }
    }
    s[..end].parse().unwrap_or(0.0)
}

fn ord_i32(delta: i32) -> Ordering {
    delta.cmp(&0)
}

fn ord_f64(left: f64, right: f64) -> Ordering {
    if left > right {
        Ordering::Greater
    } else if left < right {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Compares a document-side value against a query-side value.
/// `Ok(None)` is the "unmatched" signal: the kinds are incomparable and the
/// surrounding predicate is simply false.
pub fn compare(left: &QVal<'_>, right: &QVal<'_>) -> Result<Option<Ordering>> {
    let ordering = match *left {
        QVal::Str(ls) => match *right {
            QVal::Str(rs) => {
                // Shorter strings order first regardless of content.
                match ls.len().cmp(&rs.len()) {
                    Ordering::Equal => ls.as_bytes().cmp(rs.as_bytes()),
                    unequal => unequal,
                }
            }
            QVal::Bool(rb) => ord_i32((ls == "true") as i32 - rb as i32),
            QVal::I64(ri) => ls.cmp(ri.to_string().as_str()),
            QVal::F64(rf) => ls.cmp(render_f64(rf).as_str()),
            QVal::Null => {
                if ls.is_empty() { Ordering::Equal } else { Ordering::Greater }
            }
            _ => return Ok(None),
        },
        QVal::I64(li) => match *right {
            QVal::I64(ri) => li.cmp(&ri),
            QVal::F64(rf) => ord_f64(li as f64, rf),
            QVal::Str(rs) => li.cmp(&parse_i64_prefix(rs)),
            QVal::Null => Ordering::Greater,
            QVal::Bool(rb) => ord_i32((li != 0) as i32 - rb as i32),
            _ => return Ok(None),
        },
        QVal::F64(lf) => match *right {
            QVal::F64(rf) => ord_f64(lf, rf),
            QVal::I64(ri) => ord_f64(lf, ri as f64),
            QVal::Str(rs) => ord_f64(lf, parse_f64_prefix(rs)),
            QVal::Null => Ordering::Greater,
            QVal::Bool(rb) => ord_f64(lf, f64::from(rb as u8)),
            _ => return Ok(None),
        },
        QVal::Bool(lb) => match *right {
            QVal::Bool(rb) => ord_i32(lb as i32 - rb as i32),
            QVal::I64(ri) => ord_i32(lb as i32 - (ri != 0) as i32),
            QVal::F64(rf) => ord_i32(lb as i32 - (rf != 0.0) as i32),
            QVal::Str(rs) => ord_i32(lb as i32 - (rs == "true") as i32),
            // `false` and `null` coincide here, as they always have.
            QVal::Null => ord_i32(lb as i32),
            _ => return Ok(None),
        },
        QVal::Null => match *right {
            QVal::Null => Ordering::Equal,
            QVal::Str(rs) => {
                if rs.is_empty() { Ordering::Equal } else { Ordering::Less }
            }
            _ => Ordering::Less,
        },
        QVal::Bin(view) => {
            let node = match *right {
                QVal::Node(node) => node,
                _ => return Ok(None),
            };
            let compatible = match (view.kind(), node) {
                (DocKind::List, &Value::Array(_)) => true,
                (DocKind::Map, &Value::Object(_))
                | (DocKind::Object, &Value::Object(_)) => true,
                _ => false,
            };
            if !compatible {
                return Ok(None);
            }
            let decoded = view.to_json()?;
            compare_nodes(&decoded, node)
        }
        QVal::Node(_) => return Ok(None),
    };
    Ok(Some(ordering))
}

/// Deterministic rank for cross-type node ordering.
fn node_rank(node: &Value) -> u8 {
    match *node {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
    }
}

/// Structural comparison of two JSON trees. Objects compare by child count,
/// then per-key — insertion order does not matter; arrays compare by count,
/// then element-wise in order.
pub fn compare_nodes(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (&Value::Null, &Value::Null) => Ordering::Equal,
        (&Value::Bool(l), &Value::Bool(r)) => l.cmp(&r),
        (&Value::Number(ref l), &Value::Number(ref r)) => {
            match (l.as_i64(), r.as_i64()) {
                (Some(li), Some(ri)) => li.cmp(&ri),
                _ => ord_f64(l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0)),
            }
        }
        (&Value::String(ref l), &Value::String(ref r)) => {
            match l.len().cmp(&r.len()) {
                Ordering::Equal => l.as_bytes().cmp(r.as_bytes()),
                unequal => unequal,
            }
        }
        (&Value::Array(ref l), &Value::Array(ref r)) => {
            match l.len().cmp(&r.len()) {
                Ordering::Equal => l
                    .iter()
                    .zip(r.iter())
                    .map(|(lv, rv)| compare_nodes(lv, rv))
                    .find(|&o| o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal),
                unequal => unequal,
            }
        }
        (&Value::Object(ref l), &Value::Object(ref r)) => {
            match l.len().cmp(&r.len()) {
                Ordering::Equal => {
                    for (key, lv) in l {
                        match r.get(key) {
                            Some(rv) => match compare_nodes(lv, rv) {
                                Ordering::Equal => continue,
                                unequal => return unequal,
                            },
                            None => return Ordering::Greater,
                        }
                    }
                    Ordering::Equal
                }
                unequal => unequal,
            }
        }
        _ => node_rank(left).cmp(&node_rank(right)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use super::*;

    fn cmp(left: QVal<'_>, right: QVal<'_>) -> Option<Ordering> {
        compare(&left, &right).unwrap()
    }

    fn is_eq(left: QVal<'_>, right: QVal<'_>) {
        assert_eq!(cmp(left, right), Some(Ordering::Equal));
    }

    fn is_lt(left: QVal<'_>, right: QVal<'_>) {
        assert_eq!(cmp(left, right), Some(Ordering::Less));
    }

    fn is_gt(left: QVal<'_>, right: QVal<'_>) {
        assert_eq!(cmp(left, right), Some(Ordering::Greater));
    }

    #[test]
    fn same_type_pairs() {
        is_eq(QVal::I64(22), QVal::I64(22));
        is_lt(QVal::I64(3), QVal::I64(22));
        is_eq(QVal::F64(0.5), QVal::F64(0.5));
        is_eq(QVal::Str("abc"), QVal::Str("abc"));
        is_lt(QVal::Str("abc"), QVal::Str("abd"));
        // Length dominates content for strings.
        is_lt(QVal::Str("z"), QVal::Str("aa"));
        is_eq(QVal::Null, QVal::Null);
        is_lt(QVal::Bool(false), QVal::Bool(true));
    }

    #[test]
    fn mixed_numbers() {
        is_eq(QVal::I64(22), QVal::F64(22.0));
        is_lt(QVal::I64(22), QVal::F64(22.5));
        is_gt(QVal::F64(22.5), QVal::I64(22));
    }

    #[test]
    fn string_number_pairs() {
        // A string on the left compares against the rendered number.
        is_eq(QVal::Str("22"), QVal::I64(22));
        is_eq(QVal::Str("3.14"), QVal::F64(3.14));
        is_eq(QVal::Str("22"), QVal::F64(22.0));
        // A number on the left parses the string's numeric prefix.
        is_eq(QVal::I64(22), QVal::Str("22"));
        is_gt(QVal::I64(22), QVal::Str("21abc"));
        is_eq(QVal::I64(0), QVal::Str("junk"));
        is_eq(QVal::F64(2.5), QVal::Str("2.5"));
        is_eq(QVal::F64(22.0), QVal::Str("2.2E1"));
    }

    #[test]
    fn null_pairs() {
        is_eq(QVal::Str(""), QVal::Null);
        is_gt(QVal::Str("x"), QVal::Null);
        is_eq(QVal::Null, QVal::Str(""));
        is_lt(QVal::Null, QVal::Str("x"));
        is_lt(QVal::Null, QVal::I64(0));
        is_gt(QVal::I64(0), QVal::Null);
        // false equals null under boolean coercion.
        is_eq(QVal::Bool(false), QVal::Null);
        is_gt(QVal::Bool(true), QVal::Null);
    }

    #[test]
    fn bool_pairs() {
        is_eq(QVal::Bool(true), QVal::Str("true"));
        is_gt(QVal::Bool(true), QVal::Str("false"));
        is_eq(QVal::Bool(true), QVal::I64(5));
        is_eq(QVal::Bool(false), QVal::F64(0.0));
        is_eq(QVal::Str("true"), QVal::Bool(true));
    }

    #[test]
    fn incomparable_pairs_are_unmatched() {
        let node = json!([1, 2]);
        assert_eq!(cmp(QVal::I64(1), QVal::Node(&node)), None);
        assert_eq!(cmp(QVal::Str("x"), QVal::Node(&node)), None);
        assert_eq!(cmp(QVal::Node(&node), QVal::I64(1)), None);
    }

    #[test]
    fn container_comparison() {
        use crate::bindoc::BinDoc;

        let doc = BinDoc::from_json(&json!({ "arr": [1, 2, 3, 4] })).unwrap();
        let view = doc.as_view();
        let elem = view.get_key("arr").unwrap().unwrap();
        let left = QVal::from_elem(&elem);

        let same = json!([1, 2, 3, 4]);
        let shorter = json!([1, 2, 3]);
        let different = json!([1, 12, 3, 4]);
        let object = json!({ "a": 1 });

        assert_eq!(cmp(left, QVal::Node(&same)), Some(Ordering::Equal));
        assert_ne!(cmp(left, QVal::Node(&shorter)), Some(Ordering::Equal));
        assert_ne!(cmp(left, QVal::Node(&different)), Some(Ordering::Equal));
        // Array against object is incomparable, not unequal-with-ordering.
        assert_eq!(cmp(left, QVal::Node(&object)), None);
    }

    #[test]
    fn object_comparison_ignores_insertion_order() {
        use crate::bindoc::BinDoc;

        let doc = BinDoc::from_json(&json!({ "obj": { "f": "d", "e": "j" } })).unwrap();
        let view = doc.as_view();
        let elem = view.get_key("obj").unwrap().unwrap();
        let left = QVal::from_elem(&elem);

        let reordered = json!({ "e": "j", "f": "d" });
        let different = json!({ "e": "j", "f": "dd" });
        assert_eq!(cmp(left, QVal::Node(&reordered)), Some(Ordering::Equal));
        assert_ne!(cmp(left, QVal::Node(&different)), Some(Ordering::Equal));
    }

    #[test]
    fn float_rendering() {
        assert_eq!(render_f64(22.0), "22");
        assert_eq!(render_f64(3.14), "3.14");
        assert_eq!(render_f64(-0.5), "-0.5");
        assert_eq!(render_f64(0.000001), "0.000001");
    }

    #[test]
    fn text_rendering() {
        assert_eq!(QVal::I64(42).render_text().unwrap(), "42");
        assert_eq!(QVal::Bool(true).render_text().unwrap(), "true");
        assert_eq!(QVal::Str("s").render_text().unwrap(), "s");
        assert!(QVal::Null.render_text().is_none());
    }
}
