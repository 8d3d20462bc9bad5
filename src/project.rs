//! Post-match document shaping: include/exclude projection and the
//! `apply` clause (deep merge or JSON-Patch).
//!
//! Both operate on a decoded JSON tree, never on the binary document; the
//! caller decodes a private copy first, which also makes `apply` atomic per
//! document — a failing patch discards the copy instead of leaving it half
//! mutated.

use serde_json::{ Map, Value };
use crate::ast::{ ApplyClause, Ast, Binding, ProjSeg, Projection };
use crate::error::{ Error, ErrorKind, Result };

// ---- projection ---------------------------------------------------------

/// Applies the query's projection patterns to `root` in place.
pub fn project(root: &mut Value, ast: &Ast, bindings: &[Option<Binding>]) -> Result<()> {
    // Trivial-case scan over the whole chain: an excluding `all` anywhere
    // empties the document; an including `all` disposes everything before
    // itself; includes anywhere (disposed or not) switch on keep-marking.
    let mut start = 0;
    let mut has_includes = false;
    for (index, pattern) in ast.projection.iter().enumerate() {
        if pattern.all {
            if pattern.exclude {
                *root = Value::Object(Map::new());
                return Ok(());
            }
            start = index + 1;
        } else if !pattern.exclude {
            has_includes = true;
        }
    }
    let patterns = &ast.projection[start..];
    if patterns.is_empty() {
        return Ok(());
    }

    let active: Vec<usize> = (0..patterns.len())
        .filter(|&i| !patterns[i].segs.is_empty())
        .collect();
    let mut keeps: Vec<Vec<String>> = Vec::new();
    let mut path: Vec<String> = Vec::new();
    mark_pass(root, 0, &mut path, patterns, &active, &mut keeps, ast, bindings)?;

    if has_includes || !keeps.is_empty() {
        keep_pass(root, &mut Vec::new(), &keeps);
    }
    Ok(())
}

/// Does one projection segment match a key?
fn seg_matches(
    seg: &ProjSeg,
    key: &str,
    ast: &Ast,
    bindings: &[Option<Binding>],
) -> Result<bool> {
    match *seg {
        ProjSeg::Fields(ref fields) => Ok(fields.iter().any(|f| f == key)),
        ProjSeg::Any => Ok(true),
        ProjSeg::Placeholder(ph) => match bindings[ph.0 as usize] {
            Some(Binding::Str(ref s)) => Ok(s == key),
            Some(_) => Ok(false),
            None => Err(Error::new(
                ErrorKind::UnsetPlaceholder,
                format!("projection placeholder `:{}` has no bound value",
                        ast.placeholders[ph.0 as usize].name),
            )),
        },
    }
}

/// The keys of a node's children, in order; array indices render as decimal.
fn child_keys(node: &Value) -> Vec<String> {
    match *node {
        Value::Object(ref entries) => entries.keys().cloned().collect(),
        Value::Array(ref items) => (0..items.len()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

fn remove_child(node: &mut Value, key: &str) {
    match *node {
        Value::Object(ref mut entries) => {
            entries.shift_remove(key);
        }
        Value::Array(ref mut items) => {
            if let Ok(index) = key.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

fn child_mut<'v>(node: &'v mut Value, key: &str) -> Option<&'v mut Value> {
    match *node {
        Value::Object(ref mut entries) => entries.get_mut(key),
        Value::Array(ref mut items) => key.parse::<usize>().ok().and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

/// Pass 1: try every active pattern on every child in declaration order.
/// A full exclude match deletes the child immediately; a full include match
/// records the child's path as kept; partial matches stay active below.
#[allow(clippy::too_many_arguments)]
fn mark_pass(
    node: &mut Value,
    depth: usize,
    path: &mut Vec<String>,
    patterns: &[Projection],
    active: &[usize],
    keeps: &mut Vec<Vec<String>>,
    ast: &Ast,
    bindings: &[Option<Binding>],
) -> Result<()> {
    let mut to_delete = Vec::new();
    for key in child_keys(node) {
        let mut deleted = false;
        let mut child_active = Vec::new();
        for &pi in active {
            let pattern = &patterns[pi];
            if !seg_matches(&pattern.segs[depth], &key, ast, bindings)? {
                continue;
            }
            if pattern.segs.len() == depth + 1 {
                if pattern.exclude {
                    to_delete.push(key.clone());
                    deleted = true;
                    break;
                }
                let mut kept = path.clone();
                kept.push(key.clone());
                keeps.push(kept);
            } else {
                child_active.push(pi);
            }
        }
        if deleted || child_active.is_empty() {
            continue;
        }
        if let Some(child) = child_mut(node, &key) {
            if child.is_object() || child.is_array() {
                path.push(key);
                mark_pass(child, depth + 1, path, patterns, &child_active, keeps, ast, bindings)?;
                path.pop();
            }
        }
    }
    // Deferred so array indices stay stable while iterating; reverse order
    // keeps lower indices valid as higher ones are removed.
    for key in to_delete.iter().rev() {
        remove_child(node, key);
    }
    Ok(())
}

fn is_prefix(prefix: &[String], path: &[String]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path).all(|(a, b)| a == b)
}

/// Pass 2: a child survives when its path lies on a kept path (descend to
/// filter its children) or below one (keep the whole subtree); everything
/// else is deleted.
fn keep_pass(node: &mut Value, path: &mut Vec<String>, keeps: &[Vec<String>]) {
    let mut to_delete = Vec::new();
    for key in child_keys(node) {
        let mut child_path = path.clone();
        child_path.push(key.clone());
        let on_kept_path = keeps
            .iter()
            .any(|k| child_path.len() < k.len() && is_prefix(&child_path, k));
        if on_kept_path {
            if let Some(child) = child_mut(node, &key) {
                path.push(key);
                keep_pass(child, path, keeps);
                path.pop();
            }
        } else if !keeps.iter().any(|k| is_prefix(k, &child_path)) {
            to_delete.push(key);
        }
    }
    for key in to_delete.iter().rev() {
        remove_child(node, key);
    }
}

// ---- apply --------------------------------------------------------------

/// Applies the query's `apply` clause to `root` in place.
pub fn apply(root: &mut Value, clause: &ApplyClause) -> Result<()> {
    match *clause {
        ApplyClause::Merge(ref patch) => {
            merge_patch(root, patch);
            Ok(())
        }
        ApplyClause::Patch(ref ops) => apply_patch(root, ops),
    }
}

/// RFC 7386 merge patch: objects merge recursively, `null` deletes,
/// everything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match *patch {
        Value::Object(ref entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(ref mut existing) = *target {
                for (key, value) in entries {
                    if value.is_null() {
                        existing.shift_remove(key);
                    } else {
                        merge_patch(
                            existing.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        ref other => *target = other.clone(),
    }
}

/// RFC 6901 pointer → path tokens.
fn parse_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(Error::new(ErrorKind::InvalidJson,
                              format!("invalid JSON pointer `{}`", pointer)));
    }
    Ok(pointer[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn pointer_error(pointer: &[String]) -> Error {
    Error::new(ErrorKind::InvalidJson,
               format!("JSON pointer `/{}` does not resolve", pointer.join("/")))
}

fn resolve<'v>(root: &'v Value, tokens: &[String]) -> Option<&'v Value> {
    let mut node = root;
    for token in tokens {
        node = match *node {
            Value::Object(ref entries) => entries.get(token)?,
            Value::Array(ref items) => items.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Removes the value a pointer names and returns it.
fn take_at(root: &mut Value, tokens: &[String]) -> Result<Value> {
    let (last, parents) = tokens.split_last().ok_or_else(|| {
        Error::new(ErrorKind::InvalidJson, "cannot remove the document root")
    })?;
    let mut node = root;
    for token in parents {
        node = match *node {
            Value::Object(ref mut entries) => {
                entries.get_mut(token).ok_or_else(|| pointer_error(tokens))?
            }
            Value::Array(ref mut items) => {
                let index = token.parse::<usize>().map_err(|_| pointer_error(tokens))?;
                items.get_mut(index).ok_or_else(|| pointer_error(tokens))?
            }
            _ => return Err(pointer_error(tokens)),
        };
    }
    match *node {
        Value::Object(ref mut entries) => {
            entries.shift_remove(last).ok_or_else(|| pointer_error(tokens))
        }
        Value::Array(ref mut items) => {
            let index = last.parse::<usize>().map_err(|_| pointer_error(tokens))?;
            if index < items.len() {
                Ok(items.remove(index))
            } else {
                Err(pointer_error(tokens))
            }
        }
        _ => Err(pointer_error(tokens)),
    }
}

/// Inserts `value` at the pointer. Object keys are created or replaced;
/// array indices insert, with `-` appending.
fn insert_at(root: &mut Value, tokens: &[String], value: Value) -> Result<()> {
    let (last, parents) = match tokens.split_last() {
        Some(split) => split,
        None => {
            *root = value;
            return Ok(());
        }
    };
    let mut node = root;
    for token in parents {
        node = match *node {
            Value::Object(ref mut entries) => {
                entries.get_mut(token).ok_or_else(|| pointer_error(tokens))?
            }
            Value::Array(ref mut items) => {
                let index = token.parse::<usize>().map_err(|_| pointer_error(tokens))?;
                items.get_mut(index).ok_or_else(|| pointer_error(tokens))?
            }
            _ => return Err(pointer_error(tokens)),
        };
    }
    match *node {
        Value::Object(ref mut entries) => {
            entries.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(ref mut items) => {
            let index = if last == "-" {
                items.len()
            } else {
                last.parse::<usize>().map_err(|_| pointer_error(tokens))?
            };
            if index > items.len() {
                return Err(pointer_error(tokens));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(pointer_error(tokens)),
    }
}

/// RFC 6902: `add`, `remove`, `replace`, `move`, `copy`, `test`.
pub fn apply_patch(root: &mut Value, ops: &Value) -> Result<()> {
    let ops = match *ops {
        Value::Array(ref ops) => ops,
        _ => {
            return Err(Error::new(ErrorKind::InvalidJson,
                                  "patch must be an array of operations"));
        }
    };
    for op in ops {
        let name = op
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::new(ErrorKind::InvalidJson,
                                      "patch operation without an `op` member"))?;
        let path = op
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::new(ErrorKind::InvalidJson,
                                      "patch operation without a `path` member"))?;
        let tokens = parse_pointer(path)?;
        match name {
            "add" => {
                let value = op.get("value").cloned().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidJson, "`add` without a `value` member")
                })?;
                insert_at(root, &tokens, value)?;
            }
            "remove" => {
                take_at(root, &tokens)?;
            }
            "replace" => {
                let value = op.get("value").cloned().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidJson, "`replace` without a `value` member")
                })?;
                take_at(root, &tokens)?;
                insert_at(root, &tokens, value)?;
            }
            "move" => {
                let from = patch_from(op)?;
                let value = take_at(root, &from)?;
                insert_at(root, &tokens, value)?;
            }
            "copy" => {
                let from = patch_from(op)?;
                let value = resolve(root, &from)
                    .cloned()
                    .ok_or_else(|| pointer_error(&from))?;
                insert_at(root, &tokens, value)?;
            }
            "test" => {
                let value = op.get("value").ok_or_else(|| {
                    Error::new(ErrorKind::InvalidJson, "`test` without a `value` member")
                })?;
                let actual = resolve(root, &tokens).ok_or_else(|| pointer_error(&tokens))?;
                if actual != value {
                    return Err(Error::new(
                        ErrorKind::InvalidJson,
                        format!("`test` failed at `{}`", path),
                    ));
                }
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidJson,
                    format!("unsupported patch operation `{}`", other),
                ));
            }
        }
    }
    Ok(())
}

fn patch_from(op: &Value) -> Result<Vec<String>> {
    let from = op
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::new(ErrorKind::InvalidJson,
                                  "patch operation without a `from` member"))?;
    parse_pointer(from)
}
