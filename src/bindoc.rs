//! The self-describing binary container for JSON-like documents.
//!
//! A finished document is a single contiguous byte buffer that can be
//! traversed without parsing it into a tree first: every value is prefixed
//! with a one-byte type code, variable-length values carry their length,
//! and container headers carry the total byte span and the child count, so
//! the offset of every element is computable from the sizes of the elements
//! preceding it.
//!
//! Three container kinds exist: a [`List`](enum.DocKind.html) of anonymous
//! values, a `Map` keyed by `i32` ids and an `Object` keyed by strings.
//! Writers are append-only ([`DocBuilder`](struct.DocBuilder.html)); readers
//! ([`BinView`](struct.BinView.html)) never trust a length field without
//! bounds-checking it first, so a corrupted buffer surfaces as a
//! [`Malformed`](../error/enum.ErrorKind.html) error instead of an
//! out-of-bounds read.

use std::str;
use std::fmt;
use serde_json::{ Value, Number, Map };
use crate::error::{ Error, ErrorKind, Result };

/// No-payload type codes.
const TYPE_NULL:  u8 = 0x00;
const TYPE_TRUE:  u8 = 0x01;
const TYPE_FALSE: u8 = 0x02;
/// Integer storage classes; the low bit distinguishes signed from unsigned.
const TYPE_UINT8:  u8 = 0x20;
const TYPE_INT8:   u8 = 0x21;
const TYPE_UINT16: u8 = 0x40;
const TYPE_INT16:  u8 = 0x41;
const TYPE_UINT32: u8 = 0x60;
const TYPE_INT32:  u8 = 0x61;
const TYPE_UINT64: u8 = 0x80;
const TYPE_INT64:  u8 = 0x81;
/// Double-precision float, 8 payload bytes.
const TYPE_FLOAT64: u8 = 0x82;
/// Length-prefixed, NUL-terminated UTF-8 string.
const TYPE_STRING: u8 = 0xA0;
/// Length-prefixed raw bytes.
const TYPE_BLOB: u8 = 0xC0;
/// Container type codes.
const TYPE_LIST:   u8 = 0xE0;
const TYPE_MAP:    u8 = 0xE1;
const TYPE_OBJECT: u8 = 0xE2;

/// Object keys fit a single length byte.
const MAX_KEY_LEN: usize = 255;
/// The size field is 31-bit; anything larger cannot be represented.
const MAX_DOC_SIZE: usize = i32::max_value() as usize;

/// The kind of a binary container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKind {
    /// Values in insertion order, addressed by index.
    List,
    /// Values keyed by `i32` ids.
    Map,
    /// Values keyed by UTF-8 strings of at most 255 bytes.
    Object,
}

impl DocKind {
    fn type_code(self) -> u8 {
        match self {
            DocKind::List   => TYPE_LIST,
            DocKind::Map    => TYPE_MAP,
            DocKind::Object => TYPE_OBJECT,
        }
    }
}

/// A value being written into a [`DocBuilder`](struct.DocBuilder.html).
#[derive(Debug, Clone, Copy)]
pub enum Atom<'a> {
    /// The JSON `null` value.
    Null,
    /// `true` or `false`.
    Bool(bool),
    /// A signed 64-bit integer; stored in the smallest class that holds it.
    I64(i64),
    /// A double-precision float.
    F64(f64),
    /// A UTF-8 string.
    Str(&'a str),
    /// Raw bytes.
    Blob(&'a [u8]),
    /// A finished document embedded as a sub-container.
    Doc(&'a BinDoc),
}

impl<'a> From<i64> for Atom<'a> {
    fn from(v: i64) -> Self { Atom::I64(v) }
}

impl<'a> From<f64> for Atom<'a> {
    fn from(v: f64) -> Self { Atom::F64(v) }
}

impl<'a> From<bool> for Atom<'a> {
    fn from(v: bool) -> Self { Atom::Bool(v) }
}

impl<'a> From<&'a str> for Atom<'a> {
    fn from(v: &'a str) -> Self { Atom::Str(v) }
}

impl<'a> From<&'a BinDoc> for Atom<'a> {
    fn from(v: &'a BinDoc) -> Self { Atom::Doc(v) }
}

/// Writes a 1-or-4-byte size field. Values up to `0x7F` take a single byte;
/// larger ones take four bytes big-endian with the top bit set.
fn write_size_field(buf: &mut Vec<u8>, value: u32) {
    if value <= 0x7F {
        buf.push(value as u8);
    } else {
        buf.extend_from_slice(&(value | 0x8000_0000).to_be_bytes());
    }
}

/// The encoded width of a size field.
fn size_field_len(value: u32) -> usize {
    if value <= 0x7F { 1 } else { 4 }
}

/// Reads a 1-or-4-byte size field, bounds-checked.
fn read_size_field(bytes: &[u8], offset: &mut usize) -> Result<u32> {
    let first = *bytes.get(*offset).ok_or_else(truncated)?;
    if first & 0x80 == 0 {
        *offset += 1;
        Ok(u32::from(first))
    } else {
        let end = offset.checked_add(4).ok_or_else(truncated)?;
        let raw = bytes.get(*offset..end).ok_or_else(truncated)?;
        *offset = end;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) & 0x7FFF_FFFF)
    }
}

fn truncated() -> Error {
    Error::new(ErrorKind::Malformed, "length field reads past end of buffer")
}

/// An append-only writer for one container. `finish()` seals the buffer and
/// produces an immutable [`BinDoc`](struct.BinDoc.html); until then the
/// header is unwritten and the builder is `dirty`.
#[derive(Debug, Clone)]
pub struct DocBuilder {
    kind: DocKind,
    /// Element bytes only; the header is prepended by `finish()`.
    buf: Vec<u8>,
    count: u32,
    dirty: bool,
}

impl DocBuilder {
    /// Starts a new list.
    pub fn new_list() -> Self {
        Self::new(DocKind::List)
    }

    /// Starts a new id-keyed map.
    pub fn new_map() -> Self {
        Self::new(DocKind::Map)
    }

    /// Starts a new string-keyed object.
    pub fn new_object() -> Self {
        Self::new(DocKind::Object)
    }

    fn new(kind: DocKind) -> Self {
        DocBuilder { kind, buf: Vec::new(), count: 0, dirty: true }
    }

    /// Appends a value to a list.
    pub fn push<'a, A: Into<Atom<'a>>>(&mut self, value: A) -> Result<()> {
        if self.kind != DocKind::List {
            return Err(Error::new(ErrorKind::InvalidType,
                                  "anonymous values can only be appended to a list"));
        }
        self.write_atom(&value.into())?;
        self.count += 1;
        Ok(())
    }

    /// Appends an id-keyed value to a map. Ids are not deduplicated;
    /// on duplicate ids the last write wins at read time.
    pub fn set_id<'a, A: Into<Atom<'a>>>(&mut self, id: i32, value: A) -> Result<()> {
        if self.kind != DocKind::Map {
            return Err(Error::new(ErrorKind::InvalidType,
                                  "id-keyed values can only be set on a map"));
        }
        self.check_size(4)?;
        self.buf.extend_from_slice(&id.to_ne_bytes());
        self.write_atom(&value.into())?;
        self.count += 1;
        Ok(())
    }

    /// Appends a string-keyed value to an object. Keys are not deduplicated;
    /// on duplicate keys the last write wins at read time.
    pub fn set<'a, A: Into<Atom<'a>>>(&mut self, key: &str, value: A) -> Result<()> {
        if self.kind != DocKind::Object {
            return Err(Error::new(ErrorKind::InvalidType,
                                  "string-keyed values can only be set on an object"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::new(ErrorKind::Overflow, "key longer than 255 bytes"));
        }
        self.check_size(key.len() + 2)?;
        self.buf.push(key.len() as u8);
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.push(0);
        self.write_atom(&value.into())?;
        self.count += 1;
        Ok(())
    }

    fn check_size(&self, additional: usize) -> Result<()> {
        if self.buf.len().saturating_add(additional) > MAX_DOC_SIZE {
            Err(Error::new(ErrorKind::Overflow, "document size exceeds 2^31 - 1 bytes"))
        } else {
            Ok(())
        }
    }

    fn write_atom(&mut self, value: &Atom<'_>) -> Result<()> {
        match *value {
            Atom::Null => {
                self.check_size(1)?;
                self.buf.push(TYPE_NULL);
            }
            Atom::Bool(b) => {
                self.check_size(1)?;
                self.buf.push(if b { TYPE_TRUE } else { TYPE_FALSE });
            }
            Atom::I64(v) => {
                self.check_size(9)?;
                write_int(&mut self.buf, v);
            }
            Atom::F64(v) => {
                self.check_size(9)?;
                self.buf.push(TYPE_FLOAT64);
                self.buf.extend_from_slice(&v.to_ne_bytes());
            }
            Atom::Str(s) => {
                self.check_size(s.len() + 6)?;
                self.buf.push(TYPE_STRING);
                write_size_field(&mut self.buf, s.len() as u32);
                self.buf.extend_from_slice(s.as_bytes());
                self.buf.push(0);
            }
            Atom::Blob(b) => {
                self.check_size(b.len() + 5)?;
                self.buf.push(TYPE_BLOB);
                write_size_field(&mut self.buf, b.len() as u32);
                self.buf.extend_from_slice(b);
            }
            Atom::Doc(doc) => {
                self.check_size(doc.as_bytes().len())?;
                self.buf.extend_from_slice(doc.as_bytes());
            }
        }
        Ok(())
    }

    /// Writes the container header in front of the accumulated elements and
    /// seals the buffer. The builder's `dirty` state ends here; the returned
    /// document is immutable.
    pub fn finish(mut self) -> Result<BinDoc> {
        let payload = self.buf.len();
        let count_len = size_field_len(self.count);
        // The size field covers the whole container including itself, so its
        // own width depends on the total; one step of widening settles it.
        let mut total = 1 + 1 + count_len + payload;
        if total > 0x7F {
            total = 1 + 4 + count_len + payload;
        }
        if total > MAX_DOC_SIZE {
            return Err(Error::new(ErrorKind::Overflow,
                                  "document size exceeds 2^31 - 1 bytes"));
        }

        let mut bytes = Vec::with_capacity(total);
        bytes.push(self.kind.type_code());
        write_size_field(&mut bytes, total as u32);
        write_size_field(&mut bytes, self.count);
        bytes.append(&mut self.buf);
        debug_assert_eq!(bytes.len(), total);
        self.dirty = false;
        Ok(BinDoc { bytes })
    }
}

/// Writes an integer in the smallest storage class that holds it.
fn write_int(buf: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        if v <= i64::from(u8::max_value()) {
            buf.push(TYPE_UINT8);
            buf.push(v as u8);
        } else if v <= i64::from(u16::max_value()) {
            buf.push(TYPE_UINT16);
            buf.extend_from_slice(&(v as u16).to_ne_bytes());
        } else if v <= i64::from(u32::max_value()) {
            buf.push(TYPE_UINT32);
            buf.extend_from_slice(&(v as u32).to_ne_bytes());
        } else {
            buf.push(TYPE_UINT64);
            buf.extend_from_slice(&(v as u64).to_ne_bytes());
        }
    } else if v >= i64::from(i8::min_value()) {
        buf.push(TYPE_INT8);
        buf.extend_from_slice(&(v as i8).to_ne_bytes());
    } else if v >= i64::from(i16::min_value()) {
        buf.push(TYPE_INT16);
        buf.extend_from_slice(&(v as i16).to_ne_bytes());
    } else if v >= i64::from(i32::min_value()) {
        buf.push(TYPE_INT32);
        buf.extend_from_slice(&(v as i32).to_ne_bytes());
    } else {
        buf.push(TYPE_INT64);
        buf.extend_from_slice(&v.to_ne_bytes());
    }
}

/// A finished, immutable binary document owning its buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BinDoc {
    bytes: Vec<u8>,
}

impl BinDoc {
    /// Takes ownership of an externally produced buffer, validating only the
    /// container header. Readability is determined by the header alone; the
    /// element stream is validated lazily, on every traversal step.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        BinView::new(&bytes)?;
        Ok(BinDoc { bytes })
    }

    /// Encodes a JSON value. The root must be an object or an array.
    pub fn from_json(value: &Value) -> Result<Self> {
        match *value {
            Value::Object(ref entries) => {
                let mut builder = DocBuilder::new_object();
                for (key, child) in entries {
                    encode_value(&mut builder, Some(key), child)?;
                }
                builder.finish()
            }
            Value::Array(ref items) => {
                let mut builder = DocBuilder::new_list();
                for child in items {
                    encode_value(&mut builder, None, child)?;
                }
                builder.finish()
            }
            _ => Err(Error::new(ErrorKind::InvalidType,
                                "document root must be an object or an array")),
        }
    }

    /// Decodes the document back into a JSON tree.
    pub fn to_json(&self) -> Result<Value> {
        self.as_view().to_json()
    }

    /// A borrowing view over the whole document.
    pub fn as_view(&self) -> BinView<'_> {
        BinView { bytes: &self.bytes }
    }

    /// The raw serialized bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Writes one JSON value into `builder` under `key` (objects) or appended
/// (lists). Containers recurse through a nested builder.
fn encode_value(builder: &mut DocBuilder, key: Option<&str>, value: &Value) -> Result<()> {
    let nested;
    let atom = match *value {
        Value::Null => Atom::Null,
        Value::Bool(b) => Atom::Bool(b),
        Value::Number(ref n) => number_atom(n)?,
        Value::String(ref s) => Atom::Str(s),
        Value::Array(_) | Value::Object(_) => {
            nested = BinDoc::from_json(value)?;
            Atom::Doc(&nested)
        }
    };
    match key {
        Some(k) => builder.set(k, atom),
        None => builder.push(atom),
    }
}

/// Only numbers representable as `i64` or `f64` are storable; blindly
/// casting a big `u64` would truncate, so it is rejected instead.
fn number_atom(n: &Number) -> Result<Atom<'static>> {
    if let Some(v) = n.as_i64() {
        Ok(Atom::I64(v))
    } else if n.is_f64() {
        Ok(Atom::F64(n.as_f64().unwrap_or(0.0)))
    } else {
        Err(Error::new(ErrorKind::InvalidJson,
                       format!("number `{}` can't be represented", n)))
    }
}

/// A non-owning view over one container inside a byte buffer. Sub-containers
/// are returned as sub-views into the same buffer, so no view ever extends
/// beyond its parent's byte range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinView<'a> {
    /// Exactly the container's span: header plus elements.
    bytes: &'a [u8],
}

impl<'a> BinView<'a> {
    /// Wraps an external read-only buffer. Fails with `Malformed` unless the
    /// buffer starts with a container header whose size fits the buffer.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let mut offset = 0;
        let type_code = *bytes.get(offset).ok_or_else(truncated)?;
        offset += 1;
        match type_code {
            TYPE_LIST | TYPE_MAP | TYPE_OBJECT => {}
            other => {
                return Err(Error::new(
                    ErrorKind::Malformed,
                    format!("expected a container header, found type 0x{:02X}", other),
                ));
            }
        }
        let size = read_size_field(bytes, &mut offset)? as usize;
        read_size_field(bytes, &mut offset)?;
        if size < offset || size > bytes.len() {
            return Err(Error::new(ErrorKind::Malformed,
                                  "container size field out of range"));
        }
        Ok(BinView { bytes: &bytes[..size] })
    }

    /// The container kind.
    pub fn kind(self) -> DocKind {
        match self.bytes[0] {
            TYPE_MAP => DocKind::Map,
            TYPE_OBJECT => DocKind::Object,
            _ => DocKind::List,
        }
    }

    /// The number of direct children.
    pub fn count(self) -> u32 {
        let mut offset = 1;
        if read_size_field(self.bytes, &mut offset).is_err() {
            return 0;
        }
        read_size_field(self.bytes, &mut offset).unwrap_or(0)
    }

    /// `true` if the container has no children.
    pub fn is_empty(self) -> bool {
        self.count() == 0
    }

    /// The container's byte span within the backing buffer.
    pub fn as_bytes(self) -> &'a [u8] {
        self.bytes
    }

    /// A forward iterator over the children, in insertion order.
    pub fn iter(self) -> Iter<'a> {
        let mut offset = 1;
        let header_ok = read_size_field(self.bytes, &mut offset)
            .and_then(|_| read_size_field(self.bytes, &mut offset))
            .is_ok();
        Iter {
            view: self,
            offset,
            remaining: if header_ok { self.count() } else { 0 },
        }
    }

    /// Linear-scan lookup of a list element by index.
    pub fn get_index(self, index: u32) -> Result<Option<Elem<'a>>> {
        for (n, entry) in self.iter().enumerate() {
            let (_, value) = entry?;
            if n as u32 == index {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Linear-scan lookup of a map element by id. On duplicate ids the last
    /// write wins.
    pub fn get_id(self, id: i32) -> Result<Option<Elem<'a>>> {
        let mut found = None;
        for entry in self.iter() {
            let (key, value) = entry?;
            if let KeyRef::Id(k) = key {
                if k == id {
                    found = Some(value);
                }
            }
        }
        Ok(found)
    }

    /// Linear-scan lookup of an object element by key. On duplicate keys the
    /// last write wins.
    pub fn get_key(self, key: &str) -> Result<Option<Elem<'a>>> {
        let mut found = None;
        for entry in self.iter() {
            let (k, value) = entry?;
            if let KeyRef::Key(k) = k {
                if k == key {
                    found = Some(value);
                }
            }
        }
        Ok(found)
    }

    /// Decodes this container into a JSON tree. Map ids become decimal
    /// string keys.
    pub fn to_json(self) -> Result<Value> {
        match self.kind() {
            DocKind::List => {
                let mut items = Vec::with_capacity(self.count() as usize);
                for entry in self.iter() {
                    let (_, value) = entry?;
                    items.push(elem_to_json(&value)?);
                }
                Ok(Value::Array(items))
            }
            DocKind::Map | DocKind::Object => {
                let mut entries = Map::new();
                for entry in self.iter() {
                    let (key, value) = entry?;
                    let key = match key {
                        KeyRef::Key(k) => k.to_owned(),
                        KeyRef::Id(id) => id.to_string(),
                        KeyRef::Index(n) => n.to_string(),
                    };
                    entries.insert(key, elem_to_json(&value)?);
                }
                Ok(Value::Object(entries))
            }
        }
    }
}

fn elem_to_json(value: &Elem<'_>) -> Result<Value> {
    Ok(match *value {
        Elem::Null => Value::Null,
        Elem::Bool(b) => Value::Bool(b),
        Elem::I64(v) => Value::from(v),
        Elem::F64(v) => Value::from(v),
        Elem::Str(s) => Value::from(s),
        Elem::Blob(b) => Value::Array(b.iter().map(|&x| Value::from(x)).collect()),
        Elem::List(view) | Elem::Map(view) | Elem::Object(view) => view.to_json()?,
    })
}

/// The key half of an iterated `(key, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyRef<'a> {
    /// A list position.
    Index(u32),
    /// A map id.
    Id(i32),
    /// An object key.
    Key(&'a str),
}

/// A decoded element: a scalar, or a sub-view for container values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Elem<'a> {
    /// The JSON `null` value.
    Null,
    /// `true` or `false`.
    Bool(bool),
    /// Any integer storage class, widened.
    I64(i64),
    /// A double-precision float.
    F64(f64),
    /// A borrowed string.
    Str(&'a str),
    /// Borrowed raw bytes.
    Blob(&'a [u8]),
    /// A nested list.
    List(BinView<'a>),
    /// A nested map.
    Map(BinView<'a>),
    /// A nested object.
    Object(BinView<'a>),
}

impl<'a> Elem<'a> {
    /// The sub-view, when this element is a container.
    pub fn container(&self) -> Option<BinView<'a>> {
        match *self {
            Elem::List(v) | Elem::Map(v) | Elem::Object(v) => Some(v),
            _ => None,
        }
    }
}

/// Forward iterator over a container's children. Yields
/// `Result<(KeyRef, Elem)>`; a `Malformed` error ends the iteration.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    view: BinView<'a>,
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<(KeyRef<'a>, Elem<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.view.count() - self.remaining;
        self.remaining -= 1;
        Some(self.read_entry(index).map_err(|e| {
            self.remaining = 0;
            e
        }))
    }
}

impl<'a> Iter<'a> {
    fn read_entry(&mut self, index: u32) -> Result<(KeyRef<'a>, Elem<'a>)> {
        let bytes = self.view.bytes;
        let key = match self.view.kind() {
            DocKind::List => KeyRef::Index(index),
            DocKind::Map => {
                let end = self.offset.checked_add(4).ok_or_else(truncated)?;
                let raw = bytes.get(self.offset..end).ok_or_else(truncated)?;
                self.offset = end;
                KeyRef::Id(i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            DocKind::Object => {
                let len = *bytes.get(self.offset).ok_or_else(truncated)? as usize;
                let start = self.offset + 1;
                let end = start.checked_add(len).ok_or_else(truncated)?;
                let raw = bytes.get(start..end).ok_or_else(truncated)?;
                if bytes.get(end) != Some(&0) {
                    return Err(Error::new(ErrorKind::Malformed,
                                          "object key is not NUL-terminated"));
                }
                self.offset = end + 1;
                KeyRef::Key(str::from_utf8(raw).map_err(|_| {
                    Error::new(ErrorKind::Malformed, "object key is not valid UTF-8")
                })?)
            }
        };
        let (value, consumed) = read_elem(bytes, self.offset)?;
        self.offset += consumed;
        Ok((key, value))
    }
}

/// A bounds-checked fixed-width payload read.
fn read_fixed(bytes: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    bytes.get(start..start + len).ok_or_else(truncated)
}

/// Reads one element at `offset`; returns the element and its total encoded
/// length. Every length field is bounds-checked before use.
fn read_elem(bytes: &[u8], offset: usize) -> Result<(Elem<'_>, usize)> {
    let type_code = *bytes.get(offset).ok_or_else(truncated)?;
    let start = offset + 1;
    let fixed = |len: usize| read_fixed(bytes, start, len);

    match type_code {
        TYPE_NULL => Ok((Elem::Null, 1)),
        TYPE_TRUE => Ok((Elem::Bool(true), 1)),
        TYPE_FALSE => Ok((Elem::Bool(false), 1)),
        TYPE_UINT8 => {
            let raw = fixed(1)?;
            Ok((Elem::I64(i64::from(raw[0])), 2))
        }
        TYPE_INT8 => {
            let raw = fixed(1)?;
            Ok((Elem::I64(i64::from(raw[0] as i8)), 2))
        }
        TYPE_UINT16 => {
            let raw = fixed(2)?;
            Ok((Elem::I64(i64::from(u16::from_ne_bytes([raw[0], raw[1]]))), 3))
        }
        TYPE_INT16 => {
            let raw = fixed(2)?;
            Ok((Elem::I64(i64::from(i16::from_ne_bytes([raw[0], raw[1]]))), 3))
        }
        TYPE_UINT32 => {
            let raw = fixed(4)?;
            let v = u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
            Ok((Elem::I64(i64::from(v)), 5))
        }
        TYPE_INT32 => {
            let raw = fixed(4)?;
            let v = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
            Ok((Elem::I64(i64::from(v)), 5))
        }
        TYPE_UINT64 => {
            let raw = fixed(8)?;
            let mut b = [0; 8];
            b.copy_from_slice(raw);
            Ok((Elem::I64(u64::from_ne_bytes(b) as i64), 9))
        }
        TYPE_INT64 => {
            let raw = fixed(8)?;
            let mut b = [0; 8];
            b.copy_from_slice(raw);
            Ok((Elem::I64(i64::from_ne_bytes(b)), 9))
        }
        TYPE_FLOAT64 => {
            let raw = fixed(8)?;
            let mut b = [0; 8];
            b.copy_from_slice(raw);
            Ok((Elem::F64(f64::from_ne_bytes(b)), 9))
        }
        TYPE_STRING => {
            let mut cursor = start;
            let len = read_size_field(bytes, &mut cursor)? as usize;
            let end = cursor.checked_add(len).ok_or_else(truncated)?;
            let raw = bytes.get(cursor..end).ok_or_else(truncated)?;
            if bytes.get(end) != Some(&0) {
                return Err(Error::new(ErrorKind::Malformed,
                                      "string is not NUL-terminated"));
            }
            let s = str::from_utf8(raw).map_err(|_| {
                Error::new(ErrorKind::Malformed, "string is not valid UTF-8")
            })?;
            Ok((Elem::Str(s), end + 1 - offset))
        }
        TYPE_BLOB => {
            let mut cursor = start;
            let len = read_size_field(bytes, &mut cursor)? as usize;
            let end = cursor.checked_add(len).ok_or_else(truncated)?;
            let raw = bytes.get(cursor..end).ok_or_else(truncated)?;
            Ok((Elem::Blob(raw), end - offset))
        }
        TYPE_LIST | TYPE_MAP | TYPE_OBJECT => {
            let tail = bytes.get(offset..).ok_or_else(truncated)?;
            let view = BinView::new(tail)?;
            let size = view.bytes.len();
            let value = match type_code {
                TYPE_LIST => Elem::List(view),
                TYPE_MAP => Elem::Map(view),
                _ => Elem::Object(view),
            };
            Ok((value, size))
        }
        other => Err(Error::new(
            ErrorKind::Malformed,
            format!("unknown element type 0x{:02X}", other),
        )),
    }
}

impl fmt::Display for BinDoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_json() {
            Ok(json) => write!(f, "{}", json),
            Err(_) => f.write_str("<malformed document>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use crate::error::ErrorKind;
    use super::*;

    #[test]
    fn round_trip() {
        let value = json!({
            "name": "quince",
            "stars": 1337,
            "ratio": 0.25,
            "released": true,
            "parent": null,
            "tags": ["db", "json"],
            "nested": { "deep": { "deeper": [1, 2, 3] } },
        });
        let doc = BinDoc::from_json(&value).unwrap();
        assert_eq!(doc.to_json().unwrap(), value);
    }

    #[test]
    fn round_trip_preserves_insertion_order() {
        let value = json!({ "z": 1, "a": 2, "m": 3 });
        let doc = BinDoc::from_json(&value).unwrap();
        let keys: Vec<_> = doc
            .as_view()
            .iter()
            .map(|entry| match entry.unwrap().0 {
                KeyRef::Key(k) => k.to_owned(),
                other => panic!("unexpected key {:?}", other),
            })
            .collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn integer_storage_widths() {
        for &v in &[0_i64, 200, 70_000, 5_000_000_000, -1, -200, -70_000, -5_000_000_000] {
            let mut list = DocBuilder::new_list();
            list.push(v).unwrap();
            let doc = list.finish().unwrap();
            assert_eq!(doc.as_view().get_index(0).unwrap(), Some(Elem::I64(v)));
        }
    }

    #[test]
    fn keyed_lookup_is_last_write_wins() {
        let mut obj = DocBuilder::new_object();
        obj.set("k", 1_i64).unwrap();
        obj.set("k", 2_i64).unwrap();
        let doc = obj.finish().unwrap();
        assert_eq!(doc.as_view().count(), 2);
        assert_eq!(doc.as_view().get_key("k").unwrap(), Some(Elem::I64(2)));
    }

    #[test]
    fn map_ids() {
        let mut map = DocBuilder::new_map();
        map.set_id(7, "seven").unwrap();
        map.set_id(-1, "minus one").unwrap();
        let doc = map.finish().unwrap();
        assert_eq!(doc.as_view().get_id(-1).unwrap(), Some(Elem::Str("minus one")));
        assert_eq!(doc.as_view().get_id(8).unwrap(), None);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut list = DocBuilder::new_list();
        assert_eq!(list.set("k", 1_i64).unwrap_err().kind(), ErrorKind::InvalidType);
        let mut obj = DocBuilder::new_object();
        assert_eq!(obj.push(1_i64).unwrap_err().kind(), ErrorKind::InvalidType);
    }

    #[test]
    fn oversized_key_is_rejected() {
        let key = "k".repeat(256);
        let mut obj = DocBuilder::new_object();
        assert_eq!(obj.set(&key, 1_i64).unwrap_err().kind(), ErrorKind::Overflow);
    }

    #[test]
    fn truncated_buffer_is_malformed() {
        let doc = BinDoc::from_json(&json!({ "key": "value" })).unwrap();
        let bytes = doc.as_bytes();
        // Keep the header intact but cut the element stream short.
        let cut = &bytes[..bytes.len() - 3];
        assert!(BinView::new(cut).is_err());
    }

    #[test]
    fn corrupt_element_type_is_malformed() {
        let doc = BinDoc::from_json(&json!({ "key": true })).unwrap();
        let mut bytes = doc.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 0xEE; // not a valid type code
        let view = BinView::new(&bytes).unwrap();
        let entries: Vec<_> = view.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].as_ref().unwrap_err().kind(), ErrorKind::Malformed);
    }

    #[test]
    fn subviews_stay_inside_parent() {
        let value = json!({ "a": { "b": [1, { "c": "d" }] }, "e": 5 });
        let doc = BinDoc::from_json(&value).unwrap();
        let root = doc.as_view();
        fn check(parent: BinView<'_>) {
            let lo = parent.as_bytes().as_ptr() as usize;
            let hi = lo + parent.as_bytes().len();
            for entry in parent.iter() {
                let (_, value) = entry.unwrap();
                if let Some(child) = value.container() {
                    let clo = child.as_bytes().as_ptr() as usize;
                    let chi = clo + child.as_bytes().len();
                    assert!(clo >= lo && chi <= hi);
                    check(child);
                }
            }
        }
        check(root);
    }

    #[test]
    fn large_documents_use_wide_size_fields() {
        let mut list = DocBuilder::new_list();
        let filler = "x".repeat(100);
        for _ in 0..10 {
            list.push(filler.as_str()).unwrap();
        }
        let doc = list.finish().unwrap();
        assert!(doc.as_bytes().len() > 0x7F);
        assert_eq!(doc.as_view().count(), 10);
        assert_eq!(doc.as_view().get_index(9).unwrap(), Some(Elem::Str(filler.as_str())));
    }

    #[test]
    fn huge_number_is_invalid_json() {
        let value = json!({ "n": u64::max_value() });
        assert_eq!(BinDoc::from_json(&value).unwrap_err().kind(), ErrorKind::InvalidJson);
    }
}
