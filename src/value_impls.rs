// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Serialize/Deserialize implementations for `value::Value`.
//!
//! These convert between value graphs and other serde data formats, which
//! have no notion of shared references.  Shared objects are written once
//! per reference, and cycles are an error.

use std::fmt;
use std::cell::RefCell;
use std::result::Result as StdResult;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{ser, de};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::de::Visitor;

use crate::error::ErrorCode;
use crate::value::{Dict, Value};

impl ser::Serialize for Value {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        let active = RefCell::new(Vec::new());
        Tracked { value: self, active: &active }.serialize(serializer)
    }
}

/// A value together with the containers currently being serialized.
struct Tracked<'a> {
    value: &'a Value,
    active: &'a RefCell<Vec<usize>>,
}

impl<'a> Tracked<'a> {
    fn wrap<'b>(&'b self, value: &'b Value) -> Tracked<'b> {
        Tracked { value, active: self.active }
    }

    fn serialize_inner<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        use serde::ser::Error;
        match *self.value {
            Value::None => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(b),
            Value::I64(i) => serializer.serialize_i64(i),
            Value::Int(ref i) => {
                if let Some(i) = i.to_i64() {
                    serializer.serialize_i64(i)
                } else if let Some(u) = i.to_u64() {
                    serializer.serialize_u64(u)
                } else {
                    serializer.serialize_str(&i.to_string())
                }
            }
            Value::F64(f) => serializer.serialize_f64(f),
            Value::Bytes(ref b) => serializer.serialize_bytes(b),
            Value::String(ref s) => serializer.serialize_str(s),
            Value::Tuple(ref t) => self.serialize_items(t, serializer),
            Value::List(ref l) => match l.try_borrow() {
                Ok(l) => self.serialize_items(&l, serializer),
                Err(_) => Err(S::Error::custom("list is mutably borrowed")),
            },
            Value::Dict(ref d) => match d.try_borrow() {
                Ok(d) => self.serialize_dict(&d, None, serializer),
                Err(_) => Err(S::Error::custom("dict is mutably borrowed")),
            },
            Value::Global(ref g) => serializer.serialize_str(&g.qualified_name()),
            Value::Object(ref o) => {
                let o = o.try_borrow().map_err(|_| S::Error::custom("object is mutably borrowed"))?;
                let class = o.class().qualified_name();
                match o.dict() {
                    Some(d) => self.serialize_dict(d, Some(&class), serializer),
                    None => Err(S::Error::custom(ErrorCode::Unpicklable(class))),
                }
            }
        }
    }

    fn serialize_items<S: ser::Serializer>(&self, items: &[Value], serializer: S)
                                           -> StdResult<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&self.wrap(item))?;
        }
        seq.end()
    }

    fn serialize_dict<S: ser::Serializer>(&self, dict: &Dict, class: Option<&str>, serializer: S)
                                          -> StdResult<S::Ok, S::Error> {
        let len = dict.len() + if class.is_some() { 1 } else { 0 };
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(class) = class {
            map.serialize_entry("__class__", class)?;
        }
        for &(ref key, ref value) in dict {
            map.serialize_entry(&self.wrap(key), &self.wrap(value))?;
        }
        map.end()
    }
}

impl<'a> ser::Serialize for Tracked<'a> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        let id = match *self.value {
            Value::Tuple(_) | Value::List(_) | Value::Dict(_) | Value::Object(_) =>
                self.value.identity(),
            _ => None,
        };
        if let Some(id) = id {
            if self.active.borrow().contains(&id) {
                return Err(ser::Error::custom(ErrorCode::Recursive));
            }
            self.active.borrow_mut().push(id);
        }
        let result = self.serialize_inner(serializer);
        if id.is_some() {
            self.active.borrow_mut().pop();
        }
        result
    }
}

impl<'de> de::Deserialize<'de> for Value {
    #[inline]
    fn deserialize<D: de::Deserializer<'de>>(deser: D) -> StdResult<Value, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("any value")
            }

            #[inline]
            fn visit_bool<E>(self, value: bool) -> StdResult<Value, E> {
                Ok(Value::Bool(value))
            }

            #[inline]
            fn visit_i64<E>(self, value: i64) -> StdResult<Value, E> {
                Ok(Value::I64(value))
            }

            #[inline]
            fn visit_u64<E>(self, value: u64) -> StdResult<Value, E> {
                match value.to_i64() {
                    Some(i) => Ok(Value::I64(i)),
                    None => Ok(Value::Int(BigInt::from(value))),
                }
            }

            #[inline]
            fn visit_f64<E>(self, value: f64) -> StdResult<Value, E> {
                Ok(Value::F64(value))
            }

            #[inline]
            fn visit_str<E>(self, value: &str) -> StdResult<Value, E> {
                Ok(Value::string(value))
            }

            #[inline]
            fn visit_string<E>(self, value: String) -> StdResult<Value, E> {
                Ok(Value::string(value))
            }

            #[inline]
            fn visit_bytes<E>(self, value: &[u8]) -> StdResult<Value, E> {
                Ok(Value::bytes(value))
            }

            #[inline]
            fn visit_byte_buf<E>(self, value: Vec<u8>) -> StdResult<Value, E> {
                Ok(Value::bytes(value))
            }

            #[inline]
            fn visit_none<E>(self) -> StdResult<Value, E> {
                Ok(Value::None)
            }

            #[inline]
            fn visit_some<D: de::Deserializer<'de>>(self, deser: D) -> StdResult<Value, D::Error> {
                de::Deserialize::deserialize(deser)
            }

            #[inline]
            fn visit_unit<E>(self) -> StdResult<Value, E> {
                Ok(Value::None)
            }

            #[inline]
            fn visit_seq<V: de::SeqAccess<'de>>(self, mut visitor: V) -> StdResult<Value, V::Error> {
                let mut values = Vec::with_capacity(visitor.size_hint().unwrap_or(0));
                while let Some(elem) = visitor.next_element()? {
                    values.push(elem);
                }
                Ok(Value::list(values))
            }

            #[inline]
            fn visit_map<V: de::MapAccess<'de>>(self, mut visitor: V) -> StdResult<Value, V::Error> {
                let mut dict = Dict::new();
                while let Some((key, value)) = visitor.next_entry::<Value, Value>()? {
                    dict.insert(key, value).map_err(de::Error::custom)?;
                }
                Ok(Value::dict(dict))
            }
        }

        deser.deserialize_any(ValueVisitor)
    }
}
