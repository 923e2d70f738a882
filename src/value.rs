// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Python values with reference identity, and the dictionary type.

use std::fmt;
use std::mem;
use std::vec;
use std::rc::Rc;
use std::slice;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};

use crate::error::{Error, ErrorCode, Result};
use crate::object::{Global, Object};

/// Represents a node of a Python object graph.
///
/// Scalars are held inline.  Everything else lives behind an `Rc`, and the
/// address of that allocation is the value's *identity*: cloning a `Value`
/// produces another reference to the same object, which the pickler will
/// write only once.  Lists, dicts and generic objects are mutable through
/// a `RefCell`, which is what makes cyclic graphs possible.
///
/// Note on integers: while decoding, all integers that fit into an i64 are
/// put into `I64`, and `Int` is used for the rest.  The two compare equal
/// when they hold the same number.
///
/// Cyclic graphs are reference cycles and are therefore never freed.
#[derive(Clone)]
pub enum Value {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer (unbounded length)
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(Rc<[u8]>),
    /// Unicode string
    String(Rc<str>),
    /// Tuple
    Tuple(Rc<[Value]>),
    /// List
    List(Rc<RefCell<Vec<Value>>>),
    /// Dictionary (map)
    Dict(Rc<RefCell<Dict>>),
    /// Reference to a class or other callable, by qualified name
    Global(Rc<Global>),
    /// Any other object, pickled through its reduce hook
    Object(Rc<RefCell<dyn Object>>),
}

impl Value {
    pub fn bytes<B: Into<Vec<u8>>>(bytes: B) -> Value {
        Value::Bytes(Rc::from(bytes.into()))
    }

    pub fn string<S: Into<String>>(string: S) -> Value {
        Value::String(Rc::from(string.into()))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::from(items))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn global(global: Global) -> Value {
        Value::Global(Rc::new(global))
    }

    pub fn object<T: Object>(object: T) -> Value {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    /// The identity of the referenced object, or None for scalars.
    ///
    /// The identity stays valid as long as any reference to the object is
    /// alive.
    pub fn identity(&self) -> Option<usize> {
        match *self {
            Value::Bytes(ref b)  => Some(Rc::as_ptr(b) as *const u8 as usize),
            Value::String(ref s) => Some(Rc::as_ptr(s) as *const u8 as usize),
            Value::Tuple(ref t)  => Some(Rc::as_ptr(t) as *const Value as usize),
            Value::List(ref l)   => Some(Rc::as_ptr(l) as usize),
            Value::Dict(ref d)   => Some(Rc::as_ptr(d) as usize),
            Value::Global(ref g) => Some(Rc::as_ptr(g) as usize),
            Value::Object(ref o) => Some(Rc::as_ptr(o) as *const () as usize),
            _ => None,
        }
    }

    /// Whether both values are references to the same object.
    pub fn is(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The Python-ish name of the value's type, for error messages.
    pub fn type_name(&self) -> String {
        match *self {
            Value::None      => "None".into(),
            Value::Bool(_)   => "bool".into(),
            Value::I64(_) |
            Value::Int(_)    => "int".into(),
            Value::F64(_)    => "float".into(),
            Value::Bytes(_)  => "bytes".into(),
            Value::String(_) => "str".into(),
            Value::Tuple(_)  => "tuple".into(),
            Value::List(_)   => "list".into(),
            Value::Dict(_)   => "dict".into(),
            Value::Global(ref g) => format!("global {}", g.qualified_name()),
            Value::Object(ref o) => match o.try_borrow() {
                Ok(o) => format!("{} object", o.class().qualified_name()),
                Err(_) => "object".into(),
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match *self {
            Value::String(ref s) => Some(s),
            _ => None,
        }
    }

    /// Run `f` on the referenced object if it is a `T`.
    pub fn with_object<T: Object, R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        match *self {
            Value::Object(ref o) => {
                let o = o.try_borrow().ok()?;
                o.as_any().downcast_ref::<T>().map(f)
            }
            _ => None,
        }
    }

    /// Convert the value into a hashable key, if possible.  If not, return
    /// a ValueNotHashable error.
    pub fn to_hashable(&self) -> Result<HashableValue> {
        match *self {
            Value::None          => Ok(HashableValue::None),
            Value::Bool(b)       => Ok(HashableValue::Bool(b)),
            Value::I64(i)        => Ok(HashableValue::I64(i)),
            Value::Int(ref i)    => Ok(HashableValue::Int(i.clone())),
            Value::F64(f)        => Ok(HashableValue::F64(f)),
            Value::Bytes(ref b)  => Ok(HashableValue::Bytes(b.clone())),
            Value::String(ref s) => Ok(HashableValue::String(s.clone())),
            Value::Tuple(ref t)  => t.iter().map(Value::to_hashable)
                                           .collect::<Result<_>>()
                                           .map(HashableValue::Tuple),
            Value::Global(_) |
            Value::Object(_)     => Ok(HashableValue::Identity(self.identity().unwrap_or(0))),
            Value::List(_) |
            Value::Dict(_)       => Err(Error::Syntax(ErrorCode::ValueNotHashable)),
        }
    }

    fn write_repr(&self, f: &mut fmt::Formatter, active: &mut Vec<usize>) -> fmt::Result {
        let id = match *self {
            Value::Tuple(_) | Value::List(_) | Value::Dict(_) | Value::Object(_) =>
                self.identity(),
            _ => None,
        };
        if let Some(id) = id {
            if active.contains(&id) {
                return f.write_str(match *self {
                    Value::Tuple(_) => "(...)",
                    Value::List(_)  => "[...]",
                    Value::Dict(_)  => "{...}",
                    _               => "<...>",
                });
            }
            active.push(id);
        }
        let result = match *self {
            Value::None          => write!(f, "None"),
            Value::Bool(b)       => write!(f, "{}", if b { "True" } else { "False" }),
            Value::I64(i)        => write!(f, "{}", i),
            Value::Int(ref i)    => write!(f, "{}", i),
            Value::F64(v)        => write!(f, "{:?}", v),
            Value::Bytes(ref b)  => write_bytes_repr(f, b),
            Value::String(ref s) => write!(f, "{:?}", s),
            Value::Tuple(ref t)  => write_elements(f, t, "(", ")", t.len() == 1, active),
            Value::List(ref l)   => match l.try_borrow() {
                Ok(l) => write_elements(f, &l, "[", "]", false, active),
                Err(_) => f.write_str("[<borrowed>]"),
            },
            Value::Dict(ref d)   => match d.try_borrow() {
                Ok(d) => d.write_repr(f, active),
                Err(_) => f.write_str("{<borrowed>}"),
            },
            Value::Global(ref g) => write!(f, "{}", g.qualified_name()),
            Value::Object(ref o) => match o.try_borrow() {
                Ok(o) => {
                    write!(f, "<{}", o.class().qualified_name())?;
                    match o.dict() {
                        Some(d) => { f.write_str(" ")?; d.write_repr(f, active)?; }
                        None => f.write_str(" object")?,
                    }
                    f.write_str(">")
                }
                Err(_) => f.write_str("<borrowed object>"),
            },
        };
        if id.is_some() {
            active.pop();
        }
        result
    }
}

fn write_bytes_repr(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
    f.write_str("b'")?;
    for &b in bytes {
        match b {
            b'\\' => f.write_str("\\\\")?,
            b'\'' => f.write_str("\\'")?,
            b'\n' => f.write_str("\\n")?,
            b'\r' => f.write_str("\\r")?,
            b'\t' => f.write_str("\\t")?,
            0x20..=0x7e => write!(f, "{}", b as char)?,
            _ => write!(f, "\\x{:02x}", b)?,
        }
    }
    f.write_str("'")
}

fn write_elements(f: &mut fmt::Formatter, items: &[Value],
                  prefix: &'static str, suffix: &'static str,
                  always_comma: bool, active: &mut Vec<usize>) -> fmt::Result
{
    f.write_str(prefix)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        item.write_repr(f, active)?;
    }
    if always_comma {
        f.write_str(",")?;
    }
    f.write_str(suffix)
}

// The values directly held by a container, including the attribute dict
// of objects.  Leaves have none.
fn children(value: &Value) -> Vec<Value> {
    match *value {
        Value::Tuple(ref t) => t.to_vec(),
        Value::List(ref l) => l.try_borrow().map(|l| l.clone()).unwrap_or_default(),
        Value::Dict(ref d) => d.try_borrow()
            .map(|d| d.iter().flat_map(|(k, v)| vec![k.clone(), v.clone()]).collect())
            .unwrap_or_default(),
        Value::Object(ref o) => o.try_borrow().ok()
            .and_then(|o| o.dict().map(|d| d.iter()
                .flat_map(|(k, v)| vec![k.clone(), v.clone()]).collect()))
            .unwrap_or_default(),
        _ => vec![],
    }
}

pub(crate) fn is_container(value: &Value) -> bool {
    matches!(*value, Value::Tuple(_) | Value::List(_) | Value::Dict(_) | Value::Object(_))
}

struct Frame {
    id: usize,
    children: vec::IntoIter<Value>,
    deepest: usize,
}

/// Whether `value` has a chain of more than `limit` containers nested in
/// each other.
///
/// Walks the graph without recursing.  References back into a container
/// that is still being walked close a cycle and don't count.
pub(crate) fn nested_deeper_than(value: &Value, limit: usize) -> bool {
    let mut finished = HashMap::new();
    let mut walking = HashSet::new();
    let mut path: Vec<Frame> = Vec::new();
    let mut next = Some(value.clone());
    loop {
        if let Some(value) = next.take() {
            if let (true, Some(id)) = (is_container(&value), value.identity()) {
                if let Some(&depth) = finished.get(&id) {
                    if path.len() + depth > limit {
                        return true;
                    }
                    if let Some(frame) = path.last_mut() {
                        frame.deepest = frame.deepest.max(depth);
                    }
                } else if walking.insert(id) {
                    if path.len() >= limit {
                        return true;
                    }
                    path.push(Frame { id, children: children(&value).into_iter(), deepest: 0 });
                }
            }
        }
        let frame = match path.last_mut() {
            Some(frame) => frame,
            None => return false,
        };
        if let Some(child) = frame.children.next() {
            next = Some(child);
            continue;
        }
        let depth = frame.deepest + 1;
        let id = frame.id;
        path.pop();
        walking.remove(&id);
        finished.insert(id, depth);
        if let Some(parent) = path.last_mut() {
            parent.deepest = parent.deepest.max(depth);
        }
    }
}

/// Drop `values` without recursing once per nesting level.
///
/// Containers that nobody else refers to are emptied first and their
/// contents handled in turn, so the final drops are all shallow.
pub(crate) fn release(values: Vec<Value>) {
    let mut pending = values;
    while let Some(value) = pending.pop() {
        match value {
            Value::Tuple(mut items) => {
                if let Some(items) = Rc::get_mut(&mut items) {
                    pending.extend(items.iter_mut().map(|item| mem::replace(item, Value::None)));
                }
            }
            Value::List(list) => {
                if let Ok(list) = Rc::try_unwrap(list) {
                    pending.extend(list.into_inner());
                }
            }
            Value::Dict(dict) => {
                if let Ok(dict) = Rc::try_unwrap(dict) {
                    pending.extend(dict.into_inner().into_iter().flat_map(|(k, v)| vec![k, v]));
                }
            }
            Value::Object(object) => {
                if Rc::strong_count(&object) == 1 {
                    let attrs = match object.try_borrow_mut() {
                        Ok(mut object) => object.dict_mut().map(mem::take),
                        Err(_) => None,
                    };
                    pending.extend(attrs.into_iter().flatten().flat_map(|(k, v)| vec![k, v]));
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_repr(f, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_repr(f, &mut Vec::new())
    }
}

/// Structural equality, short-circuited by reference identity.
///
/// Comparing two distinct cyclic graphs does not terminate; compare those
/// by walking them and checking identities instead.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use self::Value::*;
        match (self, other) {
            (&None, &None)                  => true,
            (&Bool(a), &Bool(b))            => a == b,
            (&I64(a), &I64(b))              => a == b,
            (&Int(ref a), &Int(ref b))      => a == b,
            (&I64(a), &Int(ref b)) |
            (&Int(ref b), &I64(a))          => BigInt::from(a) == *b,
            (&F64(a), &F64(b))              => a == b || a.to_bits() == b.to_bits(),
            (&Bytes(ref a), &Bytes(ref b))  => a == b,
            (&String(ref a), &String(ref b)) => a == b,
            (&Tuple(ref a), &Tuple(ref b))  => Rc::ptr_eq(a, b) || a[..] == b[..],
            (&List(ref a), &List(ref b))    => Rc::ptr_eq(a, b) ||
                match (a.try_borrow(), b.try_borrow()) {
                    (Ok(a), Ok(b)) => *a == *b,
                    _ => false,
                },
            (&Dict(ref a), &Dict(ref b))    => Rc::ptr_eq(a, b) ||
                match (a.try_borrow(), b.try_borrow()) {
                    (Ok(a), Ok(b)) => *a == *b,
                    _ => false,
                },
            (&Global(ref a), &Global(ref b)) => Rc::ptr_eq(a, b) ||
                (a.module() == b.module() && a.name() == b.name()),
            (&Object(ref a), &Object(ref b)) => Rc::ptr_eq(a, b) ||
                match (a.try_borrow(), b.try_borrow()) {
                    (Ok(a), Ok(b)) => a.equals(&*b),
                    _ => false,
                },
            _ => false,
        }
    }
}

/// A Python dict: insertion ordered, with keys compared like Python does.
///
/// Keys are indexed by their `HashableValue`; the original key objects are
/// kept so that their identity survives a round trip.
#[derive(Clone, Default)]
pub struct Dict {
    index: BTreeMap<HashableValue, usize>,
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Dict {
        Dict::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a key-value pair, returning the previous value for an equal
    /// key.  As in Python, the key object already present is kept.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<Option<Value>> {
        let hashable = key.to_hashable()?;
        match self.index.get(&hashable) {
            Some(&i) => Ok(Some(std::mem::replace(&mut self.entries[i].1, value))),
            None => {
                self.index.insert(hashable, self.entries.len());
                self.entries.push((key, value));
                Ok(None)
            }
        }
    }

    /// Look up a key.  Unhashable keys are never present.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        let hashable = key.to_hashable().ok()?;
        self.index.get(&hashable).map(|&i| &self.entries[i].1)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.get(&Value::string(key))
    }

    pub fn iter(&self) -> slice::Iter<(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item=&Value> {
        self.entries.iter().map(|&(ref k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item=&Value> {
        self.entries.iter().map(|&(_, ref v)| v)
    }

    fn write_repr(&self, f: &mut fmt::Formatter, active: &mut Vec<usize>) -> fmt::Result {
        f.write_str("{")?;
        for (i, &(ref key, ref value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            key.write_repr(f, active)?;
            f.write_str(": ")?;
            value.write_repr(f, active)?;
        }
        f.write_str("}")
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Dict) -> bool {
        self.len() == other.len() &&
            self.entries.iter().all(|&(ref k, ref v)| other.get(k) == Some(v))
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_repr(f, &mut Vec::new())
    }
}

impl IntoIterator for Dict {
    type Item = (Value, Value);
    type IntoIter = vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Dict {
    type Item = &'a (Value, Value);
    type IntoIter = slice::Iter<'a, (Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Represents all Python values that can be used as dictionary keys.
///
/// In Rust, the type is *not* hashable, since we use a B-tree map for the
/// key index.  To be able to put all key values into it, we implement a
/// consistent ordering between all the possible types (see below).
/// Globals and objects are compared by identity.
#[derive(Clone, Debug)]
pub enum HashableValue {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(Rc<[u8]>),
    /// Unicode string
    String(Rc<str>),
    /// Tuple
    Tuple(Vec<HashableValue>),
    /// Global or object, by identity
    Identity(usize),
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &HashableValue) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashableValue {}

impl PartialOrd for HashableValue {
    fn partial_cmp(&self, other: &HashableValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement a (more or less) consistent ordering for `HashableValue`s
/// so that they can be added to dictionaries.
///
/// Also, like in Python, numeric values with the same value (integral or not)
/// must compare equal.
///
/// For other types, we define an ordering between all types A and B so that all
/// objects of type A are always lesser than objects of type B.  This is done
/// similar to Python 2's ordering of different types.
impl Ord for HashableValue {
    fn cmp(&self, other: &HashableValue) -> Ordering {
        use self::HashableValue::*;
        match *self {
            None => match *other {
                None => Ordering::Equal,
                _    => Ordering::Less
            },
            Bool(b) => match *other {
                None         => Ordering::Greater,
                Bool(b2)     => b.cmp(&b2),
                I64(i2)      => (b as i64).cmp(&i2),
                Int(ref bi)  => BigInt::from(b as i64).cmp(bi),
                F64(f)       => float_ord(b as i64 as f64, f),
                _            => Ordering::Less
            },
            I64(i) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => i.cmp(&(b as i64)),
                I64(i2)      => i.cmp(&i2),
                Int(ref bi)  => BigInt::from(i).cmp(bi),
                F64(f)       => float_ord(i as f64, f),
                _            => Ordering::Less
            },
            Int(ref bi) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => bi.cmp(&BigInt::from(b as i64)),
                I64(i)       => bi.cmp(&BigInt::from(i)),
                Int(ref bi2) => bi.cmp(bi2),
                F64(f)       => float_bigint_ord(bi, f),
                _            => Ordering::Less
            },
            F64(f) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => float_ord(f, b as i64 as f64),
                I64(i)       => float_ord(f, i as f64),
                Int(ref bi)  => float_bigint_ord(bi, f).reverse(),
                F64(f2)      => float_ord(f, f2),
                _            => Ordering::Less
            },
            Bytes(ref bs) => match *other {
                String(_) | Tuple(_) |
                Identity(_)    => Ordering::Less,
                Bytes(ref bs2) => bs.cmp(bs2),
                _              => Ordering::Greater
            },
            String(ref s) => match *other {
                Tuple(_) |
                Identity(_)    => Ordering::Less,
                String(ref s2) => s.cmp(s2),
                _              => Ordering::Greater
            },
            Tuple(ref t) => match *other {
                Identity(_)   => Ordering::Less,
                Tuple(ref t2) => t.cmp(t2),
                _             => Ordering::Greater
            },
            Identity(id) => match *other {
                Identity(id2) => id.cmp(&id2),
                _             => Ordering::Greater
            },
        }
    }
}

/// A "reasonable" total ordering for floats.
fn float_ord(f: f64, g: f64) -> Ordering {
    match f.partial_cmp(&g) {
        Some(o) => o,
        None    => Ordering::Less
    }
}

/// Ordering between floats and big integers.
fn float_bigint_ord(bi: &BigInt, g: f64) -> Ordering {
    match bi.to_f64() {
        Some(f) => float_ord(f, g),
        None => if bi.is_positive() { Ordering::Greater } else { Ordering::Less }
    }
}
